//! Teleoperation engine: apply persisted calibration, then drive live goal
//! positions from either a fixed-rate keyboard control loop or direct
//! random-access writes.
//!
//! The keyboard loop is a dedicated thread timed with `spin_sleep::sleep`,
//! grounded directly in the teacher's `main.rs` control loop (per-tick
//! budget check, overshoot warning, jitter-free sleep). The session's motor
//! table is shared behind a `Mutex` so `state()` always returns a
//! consistent snapshot, the same role the teacher's `Clone`-able
//! `ControllerOutput` plays when handed across a channel boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::Bus;
use crate::codec::{clamp_position, Register};
use crate::config::TeleopConfig;
use crate::error::{BusError, TeleopError};
use crate::profile::{KeyCode, MotorName, RobotProfile};
use crate::store::CalibrationRecord;

/// Fallback travel range used when no calibration record is supplied.
const FALLBACK_MIN: u16 = 1024;
const FALLBACK_MAX: u16 = 3072;

/// One joint's live configuration inside a `TeleopSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorConfig {
    pub id: u8,
    pub name: MotorName,
    pub current_position: u16,
    pub min_position: u16,
    pub max_position: u16,
}

/// A key's last-known press state, used for the keyboard controller's
/// `key_timeout` expiry.
#[derive(Debug, Clone, Copy)]
struct KeyEvent {
    pressed: bool,
    at: Instant,
}

/// A pulled snapshot of one key's state, exposed via `TeleopState`.
#[derive(Debug, Clone, Copy)]
pub struct KeyStateSnapshot {
    pub pressed: bool,
    pub since_ms: u64,
}

/// Consistent snapshot of a `TeleopSession`'s motor table and activity.
#[derive(Debug, Clone)]
pub struct TeleopState {
    pub active: bool,
    pub motors: [MotorConfig; 6],
    pub last_update_ms: u64,
    pub keys: Option<HashMap<KeyCode, KeyStateSnapshot>>,
}

/// Which controller drives this session.
pub enum Controller {
    Keyboard,
    Direct,
}

/// Configuration passed to `teleoperate(...)`.
pub struct TeleopSessionConfig {
    pub calibration: Option<CalibrationRecord>,
    pub controller: Controller,
    pub on_state: Box<dyn FnMut(TeleopState) + Send>,
    pub teleop_config: TeleopConfig,
}

struct Shared {
    bus: Arc<Bus>,
    profile: RobotProfile,
    motors: Mutex<[MotorConfig; 6]>,
    active: AtomicBool,
    on_state: Mutex<Box<dyn FnMut(TeleopState) + Send>>,
    session_start: Instant,
    last_update_ms: AtomicU64Cell,
}

// `AtomicU64` stand-in that works on 32-bit targets too: store millis in a
// plain `Mutex<u64>` rather than relying on `AtomicU64`, which some targets
// the `serialport` crate supports lack native intrinsics for.
struct AtomicU64Cell(Mutex<u64>);

impl AtomicU64Cell {
    fn new(v: u64) -> Self {
        AtomicU64Cell(Mutex::new(v))
    }
    fn store(&self, v: u64) {
        *self.0.lock().unwrap() = v;
    }
    fn load(&self) -> u64 {
        *self.0.lock().unwrap()
    }
}

/// A live teleoperation session. Owns exclusive use of the `Bus` for its
/// lifetime.
pub struct TeleopSession {
    shared: Arc<Shared>,
    keyboard: Option<KeyboardController>,
}

struct KeyboardController {
    keystate: Arc<Mutex<HashMap<KeyCode, KeyEvent>>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    config: TeleopConfig,
}

/// Build the initial motor table: profile defaults, overwritten per-motor
/// by the calibration record's range if one was supplied, seeded with a
/// live `Present_Position` read.
fn build_motor_table(
    bus: &Bus,
    profile: &RobotProfile,
    calibration: &Option<CalibrationRecord>,
) -> [MotorConfig; 6] {
    let positions = bus.read_positions(&profile.motor_ids);
    let mut motors = [MotorConfig {
        id: 0,
        name: MotorName::ShoulderPan,
        current_position: 0,
        min_position: FALLBACK_MIN,
        max_position: FALLBACK_MAX,
    }; 6];

    for i in 0..6 {
        let name = profile.motor_names[i];
        let id = profile.motor_ids[i];
        let (min, max) = calibration
            .as_ref()
            .and_then(|record| record.get(name))
            .map(|cal| (cal.range_min, cal.range_max))
            .unwrap_or((FALLBACK_MIN, FALLBACK_MAX));

        motors[i] = MotorConfig {
            id,
            name,
            current_position: positions[i],
            min_position: min,
            max_position: max,
        };
    }
    motors
}

/// Build a ready `TeleopSession`. Does not start the keyboard loop; the
/// caller must call `start()`.
pub fn teleoperate(
    bus: Arc<Bus>,
    profile: RobotProfile,
    mut config: TeleopSessionConfig,
) -> TeleopSession {
    config.teleop_config = config.teleop_config.clamped();
    let motors = build_motor_table(&bus, &profile, &config.calibration);
    bus.enable_torque(&profile.motor_ids).ok();

    let initial_state = TeleopState {
        active: false,
        motors,
        last_update_ms: 0,
        keys: match config.controller {
            Controller::Keyboard => Some(HashMap::new()),
            Controller::Direct => None,
        },
    };
    (config.on_state)(initial_state);

    let shared = Arc::new(Shared {
        bus,
        profile,
        motors: Mutex::new(motors),
        active: AtomicBool::new(false),
        on_state: Mutex::new(config.on_state),
        session_start: Instant::now(),
        last_update_ms: AtomicU64Cell::new(0),
    });

    let keyboard = match config.controller {
        Controller::Keyboard => Some(KeyboardController {
            keystate: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(true)), // true = not running yet
            thread: None,
            config: config.teleop_config,
        }),
        Controller::Direct => None,
    };

    TeleopSession { shared, keyboard }
}

impl TeleopSession {
    /// Start the session: marks it active, and for the keyboard controller,
    /// spawns the fixed-rate tick loop if it isn't already running.
    pub fn start(&mut self) {
        self.shared.active.store(true, Ordering::Relaxed);
        if let Some(kb) = &mut self.keyboard {
            if kb.thread.is_none() {
                kb.shutdown.store(false, Ordering::Relaxed);
                let shared = self.shared.clone();
                let keystate = kb.keystate.clone();
                let shutdown = kb.shutdown.clone();
                let cfg = kb.config;
                kb.thread = Some(thread::spawn(move || {
                    keyboard_loop(shared, keystate, shutdown, cfg)
                }));
            }
        }
    }

    /// Disable the control loop (keyboard) but leave torque enabled — the
    /// arm holds its pose. Idempotent.
    pub fn stop(&self) {
        self.shared.active.store(false, Ordering::Relaxed);
    }

    /// Register a key press/release (keyboard controller only). A no-op
    /// for a direct-controller session.
    pub fn key_event(&self, key: KeyCode, pressed: bool) {
        if let Some(kb) = &self.keyboard {
            kb.keystate.lock().unwrap().insert(
                key,
                KeyEvent {
                    pressed,
                    at: Instant::now(),
                },
            );
        }
    }

    /// Write a single motor's goal position, clamped to its configured
    /// range (direct controller only). On success, `current_position` is
    /// updated and `true` is returned. On a bus failure, `current_position`
    /// is left untouched and the underlying `BusError` is surfaced to the
    /// caller as `TeleopError::Bus`, not folded into a boolean.
    pub fn move_motor(&self, name: MotorName, position: i32) -> Result<bool, TeleopError> {
        match self.write_one(name, position)? {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!("direct write to {name:?} failed: {e}");
                Err(TeleopError::Bus(e))
            }
        }
    }

    /// Write goal positions for several motors. The Bus serializes the
    /// writes; this resolves to `true` iff every write succeeded. Unlike
    /// `move_motor`, a per-motor bus failure does not abort the batch — it
    /// is logged and folded into the returned boolean, since the batch call
    /// has no single `BusError` to attribute to the caller.
    pub fn set_positions(&self, positions: &HashMap<MotorName, i32>) -> Result<bool, TeleopError> {
        let mut all_ok = true;
        for (&name, &pos) in positions {
            match self.write_one(name, pos)? {
                Ok(()) => {}
                Err(e) => {
                    all_ok = false;
                    tracing::warn!("direct write to {name:?} failed: {e}");
                }
            }
        }
        Ok(all_ok)
    }

    /// Clamp and write one motor's goal position. Returns
    /// `Err(TeleopError::UnknownMotor)` if `name` isn't in this session's
    /// profile; otherwise `Ok(Result<(), BusError>)` carrying the bus
    /// outcome for the caller to interpret (propagate or fold into a bool).
    fn write_one(&self, name: MotorName, position: i32) -> Result<Result<(), BusError>, TeleopError> {
        let mut motors = self.shared.motors.lock().unwrap();
        let slot = motors
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| TeleopError::UnknownMotor(format!("{name:?}")))?;

        let clamped = clamp_position(position, slot.min_position, slot.max_position);
        let id = slot.id;
        drop(motors);

        let result = self
            .shared
            .bus
            .write_u16(id, Register::GoalPosition.addr(), clamped);

        if result.is_ok() {
            let mut motors = self.shared.motors.lock().unwrap();
            if let Some(slot) = motors.iter_mut().find(|m| m.name == name) {
                slot.current_position = clamped;
            }
            drop(motors);
            self.emit_state();
        }
        Ok(result)
    }

    /// A consistent snapshot of the session's current state.
    pub fn state(&self) -> TeleopState {
        let motors = *self.shared.motors.lock().unwrap();
        let keys = self.keyboard.as_ref().map(|kb| {
            let now = Instant::now();
            kb.keystate
                .lock()
                .unwrap()
                .iter()
                .map(|(&k, ev)| {
                    (
                        k,
                        KeyStateSnapshot {
                            pressed: ev.pressed,
                            since_ms: now.duration_since(ev.at).as_millis() as u64,
                        },
                    )
                })
                .collect()
        });
        TeleopState {
            active: self.shared.active.load(Ordering::Relaxed),
            motors,
            last_update_ms: self.shared.last_update_ms.load(),
            keys,
        }
    }

    /// Stop the control loop, disable torque, and release the Bus.
    pub fn disconnect(&mut self) {
        self.shared.active.store(false, Ordering::Relaxed);
        if let Some(kb) = &mut self.keyboard {
            kb.shutdown.store(true, Ordering::Relaxed);
            if let Some(handle) = kb.thread.take() {
                let _ = handle.join();
            }
        }
        self.shared.bus.release_torque(&self.shared.profile.motor_ids).ok();
    }

    fn emit_state(&self) {
        let now_ms = self
            .shared
            .session_start
            .elapsed()
            .as_millis() as u64;
        self.shared.last_update_ms.store(now_ms);
        let snapshot = self.state();
        (self.shared.on_state.lock().unwrap())(snapshot);
    }
}

impl Drop for TeleopSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Sum the step for every currently-pressed, non-expired binding onto its
/// motor. Pure function of (bindings, keystate, now) — a control loop tick
/// is otherwise a pure function of (profile, keystate, motor_state), per
/// a single tick.
fn accumulate_deltas(
    key_bindings: &HashMap<KeyCode, (MotorName, i8)>,
    keystate: &HashMap<KeyCode, KeyEvent>,
    now: Instant,
    key_timeout: Duration,
    step_size: u16,
) -> HashMap<MotorName, i32> {
    let mut deltas: HashMap<MotorName, i32> = HashMap::new();
    for (key, &(motor, dir)) in key_bindings {
        if let Some(ev) = keystate.get(key) {
            let expired = now.duration_since(ev.at) >= key_timeout;
            if ev.pressed && !expired {
                *deltas.entry(motor).or_insert(0) += dir as i32 * step_size as i32;
            }
        }
    }
    deltas
}

fn keyboard_loop(
    shared: Arc<Shared>,
    keystate: Arc<Mutex<HashMap<KeyCode, KeyEvent>>>,
    shutdown: Arc<AtomicBool>,
    config: TeleopConfig,
) {
    let period = config.tick_period();
    let on_state_period = config.on_state_period();
    let mut last_state_emit = Instant::now() - on_state_period;

    while !shutdown.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        if !shared.active.load(Ordering::Relaxed) {
            spin_sleep::sleep(period);
            continue;
        }

        let emergency_pressed = keystate
            .lock()
            .unwrap()
            .get(&shared.profile.emergency_stop_key)
            .map(|ev| ev.pressed)
            .unwrap_or(false);

        if emergency_pressed {
            shared.active.store(false, Ordering::Relaxed);
            shared.bus.release_torque(&shared.profile.motor_ids).ok();
            tracing::info!("emergency stop triggered, torque released");
        } else {
            let snapshot = keystate.lock().unwrap().clone();
            let deltas = accumulate_deltas(
                &shared.profile.key_bindings,
                &snapshot,
                tick_start,
                config.key_timeout,
                config.step_size,
            );

            if !deltas.is_empty() {
                let mut motors = shared.motors.lock().unwrap();
                let writes: Vec<(u8, u16)> = deltas
                    .into_iter()
                    .filter_map(|(name, delta)| {
                        motors.iter_mut().find(|m| m.name == name).map(|m| {
                            let goal = clamp_position(
                                m.current_position as i32 + delta,
                                m.min_position,
                                m.max_position,
                            );
                            m.current_position = goal;
                            (m.id, goal)
                        })
                    })
                    .collect();
                drop(motors);

                for (id, goal) in writes {
                    if let Err(e) = shared.bus.write_u16(id, Register::GoalPosition.addr(), goal) {
                        tracing::warn!("keyboard tick write to motor {id} failed: {e}");
                    }
                }
            }
        }

        let now_ms = shared.session_start.elapsed().as_millis() as u64;
        shared.last_update_ms.store(now_ms);

        if tick_start.duration_since(last_state_emit) >= on_state_period {
            last_state_emit = tick_start;
            let motors = *shared.motors.lock().unwrap();
            let keys = keystate
                .lock()
                .unwrap()
                .iter()
                .map(|(&k, ev)| {
                    (
                        k,
                        KeyStateSnapshot {
                            pressed: ev.pressed,
                            since_ms: tick_start.duration_since(ev.at).as_millis() as u64,
                        },
                    )
                })
                .collect();
            let state = TeleopState {
                active: shared.active.load(Ordering::Relaxed),
                motors,
                last_update_ms: now_ms,
                keys: Some(keys),
            };
            (shared.on_state.lock().unwrap())(state);
        }

        let elapsed = tick_start.elapsed();
        if elapsed < period {
            spin_sleep::sleep(period - elapsed);
        } else {
            tracing::warn!(
                "teleop tick budget exceeded by {:.1}ms",
                (elapsed - period).as_secs_f64() * 1000.0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_deltas_matches_spec_scenario_5() {
        let mut bindings = HashMap::new();
        bindings.insert(KeyCode::ArrowLeft, (MotorName::ShoulderPan, -1i8));
        bindings.insert(KeyCode::ArrowRight, (MotorName::ShoulderPan, 1i8));

        let mut keystate = HashMap::new();
        let now = Instant::now();
        keystate.insert(KeyCode::ArrowLeft, KeyEvent { pressed: true, at: now });

        let deltas = accumulate_deltas(&bindings, &keystate, now, Duration::from_secs(1), 10);
        assert_eq!(deltas.get(&MotorName::ShoulderPan), Some(&-10));
        assert_eq!(deltas.len(), 1);
    }

    #[test]
    fn accumulate_deltas_ignores_expired_keys() {
        let mut bindings = HashMap::new();
        bindings.insert(KeyCode::ArrowLeft, (MotorName::ShoulderPan, -1i8));

        let mut keystate = HashMap::new();
        let pressed_at = Instant::now() - Duration::from_secs(2);
        keystate.insert(
            KeyCode::ArrowLeft,
            KeyEvent { pressed: true, at: pressed_at },
        );

        let deltas = accumulate_deltas(
            &bindings,
            &keystate,
            Instant::now(),
            Duration::from_secs(1),
            10,
        );
        assert!(deltas.is_empty());
    }

    #[test]
    fn accumulate_deltas_ignores_released_keys() {
        let mut bindings = HashMap::new();
        bindings.insert(KeyCode::ArrowLeft, (MotorName::ShoulderPan, -1i8));

        let mut keystate = HashMap::new();
        let now = Instant::now();
        keystate.insert(KeyCode::ArrowLeft, KeyEvent { pressed: false, at: now });

        let deltas = accumulate_deltas(&bindings, &keystate, now, Duration::from_secs(1), 10);
        assert!(deltas.is_empty());
    }
}
