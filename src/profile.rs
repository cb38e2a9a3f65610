//! Static robot description: motor ids/names, key bindings, resolution.
//!
//! Follower and leader are protocol-identical for the SO-100 family; the
//! variant tag exists solely for the persisted record and UI labels.

use std::collections::HashMap;

/// One of the six ordered joint names. Ordering matters: the discriminant
/// order is the protocol order used for bulk operations and matches
/// `RobotProfile::motor_names`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorName {
    ShoulderPan,
    ShoulderLift,
    ElbowFlex,
    WristFlex,
    WristRoll,
    Gripper,
}

impl MotorName {
    /// All six joint names in protocol order.
    pub const ALL: [MotorName; 6] = [
        MotorName::ShoulderPan,
        MotorName::ShoulderLift,
        MotorName::ElbowFlex,
        MotorName::WristFlex,
        MotorName::WristRoll,
        MotorName::Gripper,
    ];

    /// The lowercase snake_case name used as a JSON key.
    pub fn as_str(&self) -> &'static str {
        match self {
            MotorName::ShoulderPan => "shoulder_pan",
            MotorName::ShoulderLift => "shoulder_lift",
            MotorName::ElbowFlex => "elbow_flex",
            MotorName::WristFlex => "wrist_flex",
            MotorName::WristRoll => "wrist_roll",
            MotorName::Gripper => "gripper",
        }
    }

    pub fn from_str(s: &str) -> Option<MotorName> {
        Some(match s {
            "shoulder_pan" => MotorName::ShoulderPan,
            "shoulder_lift" => MotorName::ShoulderLift,
            "elbow_flex" => MotorName::ElbowFlex,
            "wrist_flex" => MotorName::WristFlex,
            "wrist_roll" => MotorName::WristRoll,
            "gripper" => MotorName::Gripper,
            _ => return None,
        })
    }
}

/// A key on the operator's keyboard. A fixed, named, enumerable set rather
/// than an open string space, the same shape as the teacher's `Buttons`
/// struct of named gamepad inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    W,
    A,
    S,
    D,
    Q,
    E,
    O,
    C,
    Escape,
    Other(char),
}

/// Two physical variants of the same arm. Identical at the protocol layer;
/// kept only for record portability and UI labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotVariant {
    Follower,
    Leader,
}

/// 12-bit position resolution shared by every SO-100 variant.
pub const RESOLUTION: u16 = 4096;

/// Mid-travel position: floor((resolution - 1) / 2).
pub const MID_TRAVEL: u16 = ((RESOLUTION - 1) / 2) as u16;

/// Static description of a robot variant.
#[derive(Debug, Clone)]
pub struct RobotProfile {
    pub variant: RobotVariant,
    pub motor_ids: [u8; 6],
    pub motor_names: [MotorName; 6],
    pub resolution: u16,
    pub key_bindings: HashMap<KeyCode, (MotorName, i8)>,
    pub emergency_stop_key: KeyCode,
}

impl RobotProfile {
    /// The canonical SO-100 profile for the given variant: motor ids
    /// `[1..6]` in joint order, the standard arrow/WASD/QE/OC key bindings,
    /// Esc as emergency stop.
    pub fn so100(variant: RobotVariant) -> RobotProfile {
        let mut key_bindings = HashMap::new();
        key_bindings.insert(KeyCode::ArrowRight, (MotorName::ShoulderPan, 1));
        key_bindings.insert(KeyCode::ArrowLeft, (MotorName::ShoulderPan, -1));
        key_bindings.insert(KeyCode::ArrowUp, (MotorName::ShoulderLift, 1));
        key_bindings.insert(KeyCode::ArrowDown, (MotorName::ShoulderLift, -1));
        key_bindings.insert(KeyCode::W, (MotorName::ElbowFlex, 1));
        key_bindings.insert(KeyCode::S, (MotorName::ElbowFlex, -1));
        key_bindings.insert(KeyCode::A, (MotorName::WristFlex, -1));
        key_bindings.insert(KeyCode::D, (MotorName::WristFlex, 1));
        key_bindings.insert(KeyCode::Q, (MotorName::WristRoll, -1));
        key_bindings.insert(KeyCode::E, (MotorName::WristRoll, 1));
        key_bindings.insert(KeyCode::O, (MotorName::Gripper, 1));
        key_bindings.insert(KeyCode::C, (MotorName::Gripper, -1));

        RobotProfile {
            variant,
            motor_ids: [1, 2, 3, 4, 5, 6],
            motor_names: MotorName::ALL,
            resolution: RESOLUTION,
            key_bindings,
            emergency_stop_key: KeyCode::Escape,
        }
    }

    /// The canonical motor id for a given joint name, per this profile.
    pub fn id_for(&self, name: MotorName) -> Option<u8> {
        self.motor_names
            .iter()
            .position(|&n| n == name)
            .map(|i| self.motor_ids[i])
    }
}
