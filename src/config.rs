//! Runtime-tunable knobs for the teleoperation engine.
//!
//! Unlike the persisted calibration store, these are supplied
//! programmatically by the caller rather than loaded from a file — the
//! config surface here is API-level, not file-level.

use std::time::Duration;

/// Default keyboard control loop rate, Hz.
pub const DEFAULT_UPDATE_RATE_HZ: u32 = 60;
/// Allowed range for `update_rate_hz`.
pub const UPDATE_RATE_RANGE: (u32, u32) = (10, 240);

/// Default per-tick step size, position units.
pub const DEFAULT_STEP_SIZE: u16 = 10;
/// Allowed range for `step_size`.
pub const STEP_SIZE_RANGE: (u16, u16) = (1, 200);

/// Default key-release timeout.
pub const DEFAULT_KEY_TIMEOUT: Duration = Duration::from_secs(1);

/// Default `on_state` decimation rate, Hz.
pub const DEFAULT_ON_STATE_RATE_HZ: u32 = 10;

/// Tunable knobs for a `TeleopSession`'s keyboard controller. Constructed
/// with `Default`, then overridden field-by-field the way the teacher's
/// `XBoxController::new(command_freq)` externalizes its polling rate as a
/// constructor argument rather than hardcoding it.
#[derive(Debug, Clone, Copy)]
pub struct TeleopConfig {
    /// Keyboard control loop tick rate, Hz. Clamped to `UPDATE_RATE_RANGE`.
    pub update_rate_hz: u32,
    /// Position units moved per tick per held key. Clamped to `STEP_SIZE_RANGE`.
    pub step_size: u16,
    /// Keys not explicitly released within this window are treated as
    /// released (defends against missed key-up events on focus loss).
    pub key_timeout: Duration,
    /// Maximum rate at which `on_state` is invoked from the control loop.
    pub on_state_rate_hz: u32,
}

impl TeleopConfig {
    /// Clamp all fields to their documented ranges.
    pub fn clamped(mut self) -> TeleopConfig {
        self.update_rate_hz = self
            .update_rate_hz
            .clamp(UPDATE_RATE_RANGE.0, UPDATE_RATE_RANGE.1);
        self.step_size = self.step_size.clamp(STEP_SIZE_RANGE.0, STEP_SIZE_RANGE.1);
        self
    }

    /// Tick period implied by `update_rate_hz`.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_rate_hz as f64)
    }

    /// Minimum interval between `on_state` invocations.
    pub fn on_state_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.on_state_rate_hz as f64)
    }
}

impl Default for TeleopConfig {
    fn default() -> Self {
        TeleopConfig {
            update_rate_hz: DEFAULT_UPDATE_RATE_HZ,
            step_size: DEFAULT_STEP_SIZE,
            key_timeout: DEFAULT_KEY_TIMEOUT,
            on_state_rate_hz: DEFAULT_ON_STATE_RATE_HZ,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = TeleopConfig::default();
        assert_eq!(cfg.update_rate_hz, 60);
        assert_eq!(cfg.step_size, 10);
        assert_eq!(cfg.key_timeout, Duration::from_secs(1));
    }

    #[test]
    fn clamped_rejects_out_of_range_values() {
        let cfg = TeleopConfig {
            update_rate_hz: 1000,
            step_size: 0,
            ..TeleopConfig::default()
        }
        .clamped();
        assert_eq!(cfg.update_rate_hz, 240);
        assert_eq!(cfg.step_size, 1);
    }

    #[test]
    fn tick_period_matches_rate() {
        let cfg = TeleopConfig {
            update_rate_hz: 60,
            ..TeleopConfig::default()
        };
        let period = cfg.tick_period();
        assert!((period.as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }
}
