//! Error taxonomy for the codec, bus, calibration, teleop, and store layers.
//!
//! Each variant carries enough context (motor id, register address, phase)
//! for a caller to report exactly what failed without re-deriving it from a
//! string message.

use crate::profile::MotorName;

/// Errors from building or parsing a raw STS3215 packet.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("malformed frame from motor {id:?}: {reason}")]
    MalformedFrame { id: Option<u8>, reason: String },

    #[error("checksum mismatch for motor {id}: expected 0x{expected:02X}, got 0x{got:02X}")]
    ChecksumMismatch { id: u8, expected: u8, got: u8 },

    #[error("homing offset magnitude {0} exceeds 2047")]
    HomingOffsetOutOfRange(i32),
}

/// Errors from a request/response exchange on the bus.
#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("serial I/O error on motor {id:?}: {source}")]
    Io {
        id: Option<u8>,
        #[source]
        source: std::io::Error,
    },

    #[error("no response from motor {id} at register 0x{addr:02X} after 3 attempts")]
    NoResponse { id: u8, addr: u8 },

    #[error("motor {id} reported error byte 0x{err_byte:02X} at register 0x{addr:02X}")]
    ServoError { id: u8, addr: u8, err_byte: u8 },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BusError {
    /// The motor id this error is about, if any.
    pub fn motor_id(&self) -> Option<u8> {
        match self {
            BusError::Io { id, .. } => *id,
            BusError::NoResponse { id, .. } => Some(*id),
            BusError::ServoError { id, .. } => Some(*id),
            BusError::Codec(_) => None,
        }
    }
}

/// Which phase of calibration an error occurred in. Carried for user-visible
/// diagnostics: every surfaced error names its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalPhase {
    Releasing,
    Homing,
    Recording,
    Finalizing,
}

impl std::fmt::Display for CalPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CalPhase::Releasing => "release",
            CalPhase::Homing => "homing",
            CalPhase::Recording => "recording",
            CalPhase::Finalizing => "finalize",
        };
        f.write_str(s)
    }
}

/// Errors from `CalibrationEngine`.
#[derive(thiserror::Error, Debug)]
pub enum CalError {
    #[error("bus error during {phase}: {source}")]
    Bus {
        phase: CalPhase,
        #[source]
        source: BusError,
    },

    #[error("motor {0:?} has a zero-width range; the joint was likely never moved")]
    InvariantViolation(MotorName),
}

/// Errors from `TeleopEngine` / `TeleopSession`.
#[derive(thiserror::Error, Debug)]
pub enum TeleopError {
    #[error("unknown motor name {0:?}")]
    UnknownMotor(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors from loading or saving a `DeviceRecord`.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error accessing calibration for device {device_serial}: {source}")]
    Io {
        device_serial: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed calibration JSON for device {device_serial}: {source}")]
    Json {
        device_serial: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("calibration for device {device_serial} is missing motor {motor:?}")]
    MissingMotor {
        device_serial: String,
        motor: MotorName,
    },
}
