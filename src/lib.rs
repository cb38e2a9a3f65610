//! Core driver for the SO-100 family of 6-DOF robotic arms: a serial-framed
//! protocol to daisy-chained STS3215 smart servos, a calibration engine that
//! records homing offsets and travel limits, and a teleoperation engine that
//! drives live goal positions from a keyboard or direct controller.
//!
//! This crate is the hardware-facing core only. It has no UI, no network
//! layer, and no policy/inference stack — those live in the binaries and
//! services built on top of it.

pub mod bus;
pub mod calibration;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod port;
pub mod profile;
pub mod store;
pub mod teleop;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

pub use bus::Bus;
pub use calibration::{
    calibrate, CalState, CalibrationCallbacks, CalibrationProcess, LiveData, MotorLiveRange,
};
pub use codec::{Instruction, Register};
pub use config::TeleopConfig;
pub use error::{BusError, CalError, CalPhase, CodecError, StoreError, TeleopError};
pub use port::{Port, SerialPort};
pub use profile::{KeyCode, MotorName, RobotProfile, RobotVariant, MID_TRAVEL, RESOLUTION};
pub use store::{CalibrationMetadata, CalibrationRecord, DeviceRecord, MotorCalibration, Store};
pub use teleop::{
    teleoperate, Controller, KeyStateSnapshot, MotorConfig, TeleopSession, TeleopSessionConfig,
    TeleopState,
};

/// An open serial link to a robot, bound to its static profile. The
/// entrypoint a caller holds onto for the lifetime of a connection.
pub struct RobotHandle {
    pub bus: Arc<Bus>,
    pub profile: RobotProfile,
}

/// Open the serial port at `path` and return a handle ready for calibration
/// or teleoperation. The STS3215 baud rate and framing are fixed by
/// `port::SerialPort`; only the device path varies.
pub fn open_port(path: &str, profile: RobotProfile) -> Result<RobotHandle, BusError> {
    let port = SerialPort::open(path)?;
    let bus = Arc::new(Bus::new(Box::new(port)));
    Ok(RobotHandle { bus, profile })
}

/// Release torque on `motor_ids`, or on every motor in the handle's profile
/// if `motor_ids` is `None`. Safe to call at any time; leaves the arm free
/// to be moved by hand.
pub fn release_motors(handle: &RobotHandle, motor_ids: Option<&[u8]>) -> Result<(), BusError> {
    let ids = motor_ids.unwrap_or(&handle.profile.motor_ids);
    handle.bus.release_torque(ids)
}
