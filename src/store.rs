//! Persisted calibration registry: one JSON file per device.
//!
//! The on-disk `CalibrationRecord` schema is fixed so files stay portable
//! with an existing reference implementation — see `CalibrationRecord`'s
//! `Serialize`/`Deserialize` derive and `MotorName`'s `snake_case` keys.
//! Grounded in the teacher's `DuckConfig::load` (`fs::read_to_string` +
//! `serde_json::from_str`), except a record missing a motor name is a hard
//! error here rather than defaulting, per spec.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::profile::MotorName;

/// One joint's calibration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCalibration {
    pub id: u8,
    pub drive_mode: u8,
    pub homing_offset: i16,
    pub range_min: u16,
    pub range_max: u16,
}

/// Six-entry mapping from joint name to its calibration, keyed by
/// `snake_case` motor name on disk. Immutable once produced:
/// re-calibration replaces the whole record, never patches fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationRecord {
    entries: HashMap<MotorName, MotorCalibration>,
}

impl CalibrationRecord {
    /// Build a record from exactly six `(name, calibration)` pairs.
    pub fn new(entries: HashMap<MotorName, MotorCalibration>) -> CalibrationRecord {
        CalibrationRecord { entries }
    }

    pub fn get(&self, name: MotorName) -> Option<&MotorCalibration> {
        self.entries.get(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MotorName, &MotorCalibration)> {
        self.entries.iter()
    }

    /// Validate that the record's keys exactly match `motor_names`: every
    /// required name present, and no unrecognized extras. A record loaded
    /// from disk whose keys do not exactly match the profile's motor names
    /// is a hard error, fatal for load.
    pub fn validate_complete(
        &self,
        device_serial: &str,
        motor_names: &[MotorName],
    ) -> Result<(), StoreError> {
        for &name in motor_names {
            if !self.entries.contains_key(&name) {
                return Err(StoreError::MissingMotor {
                    device_serial: device_serial.to_string(),
                    motor: name,
                });
            }
        }
        if self.entries.len() != motor_names.len() {
            if let Some(&extra) = self
                .entries
                .keys()
                .find(|name| !motor_names.contains(name))
            {
                return Err(StoreError::MissingMotor {
                    device_serial: device_serial.to_string(),
                    motor: extra,
                });
            }
        }
        Ok(())
    }
}

/// Metadata recorded alongside a `CalibrationRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationMetadata {
    pub saved_at: String,
    pub sample_count: u32,
}

/// On-disk unit: a device's calibration plus metadata, keyed by device
/// serial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_serial: String,
    pub calibration: Option<CalibrationRecord>,
    pub metadata: CalibrationMetadata,
}

/// One-JSON-file-per-device persistence, grounded in the teacher's
/// single-file-per-concern `DuckConfig::load` pattern. Avoids a
/// read-modify-write race across devices that a single shared document
/// would need.
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Persist device records as `<device_serial>.json` files under `dir`.
    /// `dir` is created on first save if it does not yet exist.
    pub fn new(dir: impl Into<PathBuf>) -> Store {
        Store { dir: dir.into() }
    }

    fn path_for(&self, device_serial: &str) -> PathBuf {
        self.dir.join(format!("{device_serial}.json"))
    }

    /// Load a previously saved record, or `None` if the device has never
    /// been calibrated (no file on disk). Any other I/O error, or a record
    /// missing a required motor name, is surfaced.
    pub fn load_calibration(
        &self,
        device_serial: &str,
        motor_names: &[MotorName],
    ) -> Result<Option<CalibrationRecord>, StoreError> {
        let path = self.path_for(device_serial);
        if !path.exists() {
            return Ok(None);
        }
        let record = self.load_device_record(&path, device_serial)?;
        match record.calibration {
            Some(calibration) => {
                calibration.validate_complete(device_serial, motor_names)?;
                Ok(Some(calibration))
            }
            None => Ok(None),
        }
    }

    fn load_device_record(
        &self,
        path: &Path,
        device_serial: &str,
    ) -> Result<DeviceRecord, StoreError> {
        let contents = fs::read_to_string(path).map_err(|source| StoreError::Io {
            device_serial: device_serial.to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| StoreError::Json {
            device_serial: device_serial.to_string(),
            source,
        })
    }

    /// Replace the saved record for `device_serial` with `record`.
    /// `metadata.saved_at` is supplied by the caller rather than generated
    /// here, keeping the persistence layer deterministic and testable.
    pub fn save_calibration(
        &self,
        device_serial: &str,
        record: CalibrationRecord,
        metadata: CalibrationMetadata,
    ) -> Result<(), StoreError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
                device_serial: device_serial.to_string(),
                source,
            })?;
        }
        let device_record = DeviceRecord {
            device_serial: device_serial.to_string(),
            calibration: Some(record),
            metadata,
        };
        let json =
            serde_json::to_string_pretty(&device_record).map_err(|source| StoreError::Json {
                device_serial: device_serial.to_string(),
                source,
            })?;
        fs::write(self.path_for(device_serial), json).map_err(|source| StoreError::Io {
            device_serial: device_serial.to_string(),
            source,
        })
    }

    /// Remove a device's persisted record entirely — the only way a
    /// `CalibrationRecord` is destroyed, per the device registry's
    /// lifecycle. A no-op, not an error, if the device was never saved.
    pub fn delete_calibration(&self, device_serial: &str) -> Result<(), StoreError> {
        let path = self.path_for(device_serial);
        if !path.exists() {
            return Ok(());
        }
        fs::remove_file(&path).map_err(|source| StoreError::Io {
            device_serial: device_serial.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::MotorName;

    fn sample_record() -> CalibrationRecord {
        let mut entries = HashMap::new();
        for (i, name) in MotorName::ALL.into_iter().enumerate() {
            entries.insert(
                name,
                MotorCalibration {
                    id: (i + 1) as u8,
                    drive_mode: 0,
                    homing_offset: 0,
                    range_min: 1024,
                    range_max: 3072,
                },
            );
        }
        CalibrationRecord::new(entries)
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = std::env::temp_dir().join(format!(
            "so100-core-store-test-{}",
            std::process::id()
        ));
        let store = Store::new(&tmp);
        let record = sample_record();
        store
            .save_calibration(
                "abc123",
                record.clone(),
                CalibrationMetadata {
                    saved_at: "2026-01-01T00:00:00Z".to_string(),
                    sample_count: 42,
                },
            )
            .unwrap();

        let loaded = store
            .load_calibration("abc123", &MotorName::ALL)
            .unwrap()
            .expect("record should exist");
        assert_eq!(loaded, record);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn load_missing_device_returns_none() {
        let tmp = std::env::temp_dir().join(format!(
            "so100-core-store-test-missing-{}",
            std::process::id()
        ));
        let store = Store::new(&tmp);
        let loaded = store.load_calibration("never-seen", &MotorName::ALL).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn validate_complete_rejects_missing_motor() {
        let mut entries = HashMap::new();
        entries.insert(
            MotorName::ShoulderPan,
            MotorCalibration {
                id: 1,
                drive_mode: 0,
                homing_offset: 0,
                range_min: 0,
                range_max: 4095,
            },
        );
        let record = CalibrationRecord::new(entries);
        let err = record
            .validate_complete("dev", &MotorName::ALL)
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingMotor { .. }));
    }

    #[test]
    fn delete_then_load_returns_none() {
        let tmp = std::env::temp_dir().join(format!(
            "so100-core-store-test-delete-{}",
            std::process::id()
        ));
        let store = Store::new(&tmp);
        store
            .save_calibration(
                "dev-del",
                sample_record(),
                CalibrationMetadata {
                    saved_at: "2026-01-01T00:00:00Z".to_string(),
                    sample_count: 1,
                },
            )
            .unwrap();

        store.delete_calibration("dev-del").unwrap();
        let loaded = store.load_calibration("dev-del", &MotorName::ALL).unwrap();
        assert!(loaded.is_none());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn delete_missing_device_is_not_an_error() {
        let tmp = std::env::temp_dir().join(format!(
            "so100-core-store-test-delete-missing-{}",
            std::process::id()
        ));
        let store = Store::new(&tmp);
        store.delete_calibration("never-saved").unwrap();
    }
}
