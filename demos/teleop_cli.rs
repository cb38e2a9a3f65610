//! Demonstration binary: open a serial port, calibrate if needed, then
//! teleoperate from the keyboard. Exercises the public API end-to-end; not
//! a product CLI.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use so100_core::{
    calibrate, open_port, teleoperate, CalibrationCallbacks, CalibrationMetadata, Controller,
    KeyCode, RobotVariant, Store, TeleopConfig, TeleopSessionConfig,
};

/// SO-100 teleoperation demo: calibrate once, then drive the arm with arrow
/// keys / WASD / Q-E / O-C, Esc for emergency stop.
#[derive(Parser, Debug)]
#[command(name = "teleop_cli")]
struct Args {
    /// Serial device path for the arm.
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Device serial used as the calibration file's key.
    #[arg(long)]
    device_serial: String,

    /// Directory calibration records are saved under / loaded from.
    #[arg(long, default_value = "./calibration")]
    calibration_dir: PathBuf,

    /// Force a fresh calibration run even if a saved record exists.
    #[arg(long)]
    recalibrate: bool,
}

fn main() -> Result<()> {
    so100_core::logging::init_tracing();
    let args = Args::parse();

    let handle = open_port(&args.port, so100_core::RobotProfile::so100(RobotVariant::Follower))
        .context("failed to open serial port")?;

    let store = Store::new(&args.calibration_dir);
    let calibration = if args.recalibrate {
        None
    } else {
        store
            .load_calibration(&args.device_serial, &so100_core::MotorName::ALL)
            .context("failed to load saved calibration")?
    };

    let calibration = match calibration {
        Some(record) => {
            tracing::info!("loaded saved calibration for {}", args.device_serial);
            record
        }
        None => {
            tracing::info!("no saved calibration found, running calibration");
            let record = run_calibration(handle.bus.clone(), handle.profile.clone())?;
            store
                .save_calibration(
                    &args.device_serial,
                    record.clone(),
                    CalibrationMetadata {
                        saved_at: "unknown".to_string(),
                        sample_count: 1,
                    },
                )
                .context("failed to save calibration")?;
            record
        }
    };

    run_teleop(handle.bus.clone(), handle.profile.clone(), calibration)
}

fn run_calibration(
    bus: Arc<so100_core::Bus>,
    profile: so100_core::RobotProfile,
) -> Result<so100_core::CalibrationRecord> {
    println!("Move every joint through its full range of motion. Press Enter to finish.");
    let process = calibrate(
        bus,
        profile,
        CalibrationCallbacks {
            on_live: Box::new(|data| {
                if let Some(range) = data.values().next() {
                    print!("\rrecording... sample range {}          ", range.range);
                }
            }),
            on_progress: Box::new(|msg| tracing::info!("calibration: {msg}")),
        },
    );

    // Block for Enter on a dedicated thread so the calibration recording
    // loop isn't starved waiting on stdin.
    let mut stdin_byte = [0u8; 1];
    let _ = io::stdin().read(&mut stdin_byte);
    process.stop();

    let record = process.result().context("calibration failed")?;
    println!("\ncalibration complete");
    Ok(record)
}

fn run_teleop(
    bus: Arc<so100_core::Bus>,
    profile: so100_core::RobotProfile,
    calibration: so100_core::CalibrationRecord,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    let mut session = teleoperate(
        bus,
        profile,
        TeleopSessionConfig {
            calibration: Some(calibration),
            controller: Controller::Keyboard,
            on_state: Box::new(|state| {
                tracing::debug!("teleop state: active={} motors={:?}", state.active, state.motors);
            }),
            teleop_config: TeleopConfig::default(),
        },
    );
    session.start();

    println!("Teleoperation active. Arrow keys / WASD / Q-E / O-C to move, Esc to stop, Ctrl+C to exit.");
    while running.load(Ordering::SeqCst) {
        if let Some(key) = read_key()? {
            session.key_event(key, true);
        }
    }

    session.disconnect();
    println!("disconnected");
    Ok(())
}

/// Minimal non-blocking-ish key read stub: this demo binary reads single
/// characters from stdin and maps them to `KeyCode`, rather than shipping a
/// raw-terminal crate the core has no other use for.
fn read_key() -> Result<Option<KeyCode>> {
    let mut buf = [0u8; 1];
    match io::stdin().read(&mut buf) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(match buf[0] {
            b'w' => KeyCode::W,
            b'a' => KeyCode::A,
            b's' => KeyCode::S,
            b'd' => KeyCode::D,
            b'q' => KeyCode::Q,
            b'e' => KeyCode::E,
            b'o' => KeyCode::O,
            b'c' => KeyCode::C,
            0x1b => KeyCode::Escape,
            other => KeyCode::Other(other as char),
        })),
        Err(e) => Err(e.into()),
    }
}
