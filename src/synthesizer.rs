//! Command synthesizer (C8): stands in for the cloud, emitting correctly
//! formed, monotonically-counted command frames derived from the current
//! setpoints and the last-observed device status.

use std::time::{Duration, Instant};

use tracing::info;

use crate::error::SynthesizerError;
use crate::frame::{build_command, command_frame_now, CommandFrame, Dialect, TelemetryFrame};

/// Boot-grace and observation windows used by the undefined-setpoint seeding
/// heuristics (§4.8). Kept as constants rather than inline magic numbers so
/// the thresholds read the same way the spec states them.
const ONLINE_OBSERVATION_WINDOW: Duration = Duration::from_secs(600);
const BOOT_GRACE: Duration = Duration::from_secs(30);
const OFFLINE_OBSERVATION_WINDOW: Duration = Duration::from_secs(6 * 60);

/// The two user-controllable amperage setpoints. `None` means "undefined":
/// not yet seeded from a device frame or written by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Setpoints {
    pub current_max_online: Option<u32>,
    pub current_max_offline: Option<u32>,
}

/// The subset of session state the synthesizer and its seeding heuristics
/// need. Mirrors the relay's session struct fields described in §3 without
/// depending on the relay module itself.
#[derive(Debug, Clone, Default)]
pub struct SynthesizerState {
    pub last_status_frame: Option<TelemetryFrame>,
    pub last_command_frame: Option<CommandFrame>,
    pub first_status_ts: Option<Instant>,
    pub last_boot_ts: Option<Instant>,
}

/// Applies the seeding heuristics from §4.8 to any setpoint still undefined,
/// using the freshly-received status frame and elapsed observation time.
/// Invoked by the relay on every telemetry frame, before the local hook runs.
pub fn seed_setpoints(setpoints: &mut Setpoints, state: &SynthesizerState, now: Instant) {
    let simple = match &state.last_status_frame {
        Some(f) => f.to_simple_map(),
        None => return,
    };

    let booting = state
        .last_boot_ts
        .is_some_and(|ts| now.saturating_duration_since(ts) <= BOOT_GRACE);
    let observed_long_enough = state
        .first_status_ts
        .is_some_and(|ts| now.saturating_duration_since(ts) >= ONLINE_OBSERVATION_WINDOW);

    if setpoints.current_max_online.is_none() {
        if let Some(online) = simple.get("current_max_online").and_then(|v| v.parse::<u32>().ok()) {
            setpoints.current_max_online = Some(online);
        } else if booting || observed_long_enough {
            if let Some(rating) = simple.get("current_rating").and_then(|v| v.parse::<u32>().ok()) {
                setpoints.current_max_online = Some(rating);
            }
        }
    }

    let offline_observed_long_enough = state
        .first_status_ts
        .is_some_and(|ts| now.saturating_duration_since(ts) >= OFFLINE_OBSERVATION_WINDOW);

    if setpoints.current_max_offline.is_none() {
        if let Some(offline) = simple.get("current_max_offline").and_then(|v| v.parse::<u32>().ok()) {
            setpoints.current_max_offline = Some(offline);
        } else if booting || offline_observed_long_enough {
            if let Some(online) = setpoints.current_max_online {
                setpoints.current_max_offline = Some(online);
            }
        }
    }
}

/// Synthesizes the next command frame from the session's last-seen status,
/// the previous command (for counter seeding), and the current setpoints.
///
/// `new_values`: true when the caller wants the synthesized command to carry
/// the current setpoints rather than a copy of the previous amperages (e.g.
/// a user just wrote a setpoint via the bus). Forced to true when there is no
/// prior command frame to copy amperages from.
pub fn synthesize(
    state: &SynthesizerState,
    setpoints: &Setpoints,
    new_values: bool,
) -> Result<CommandFrame, SynthesizerError> {
    let status = state
        .last_status_frame
        .as_ref()
        .ok_or(SynthesizerError::NoStatusFrame)?;

    let dialect = match status.fields.get("v").map(String::as_str) {
        Some("09u") => Dialect::Modern,
        _ => Dialect::Legacy,
    };

    let (counter, new_values) = match &state.last_command_frame {
        Some(prev) => ((prev.counter % 999) + 1, new_values),
        None => (1, true),
    };

    let (instant_amperage, offline_amperage) = if new_values {
        match (setpoints.current_max_online, setpoints.current_max_offline) {
            (Some(online), Some(offline)) => (online, offline),
            _ => return Err(SynthesizerError::UndefinedSetpoints),
        }
    } else {
        let prev = state
            .last_command_frame
            .as_ref()
            .expect("counter seeding only skips new_values when a previous command exists");
        (prev.instant_amperage, prev.offline_amperage)
    };

    let command = command_frame_now(instant_amperage, offline_amperage, 6, counter, dialect);
    info!(
        counter,
        instant_amperage, offline_amperage, ?dialect, "synthesized command frame"
    );
    Ok(command)
}

/// Renders the synthesized frame to its wire form, ready to send to the device.
pub fn build(command: &CommandFrame) -> String {
    build_command(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Dialect;
    use std::collections::BTreeMap;

    fn status_frame(fields: &[(&str, &str)]) -> TelemetryFrame {
        let mut map = BTreeMap::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), (*v).to_string());
        }
        TelemetryFrame {
            serial: "12345".into(),
            protocol_version: None,
            dialect: Dialect::Legacy,
            fields: map,
            checksum: None,
        }
    }

    #[test]
    fn first_command_forces_new_values_and_counter_one() {
        let state = SynthesizerState {
            last_status_frame: Some(status_frame(&[])),
            last_command_frame: None,
            first_status_ts: None,
            last_boot_ts: None,
        };
        let setpoints = Setpoints {
            current_max_online: Some(32),
            current_max_offline: Some(16),
        };
        let command = synthesize(&state, &setpoints, false).unwrap();
        assert_eq!(command.counter, 1);
        assert_eq!(command.instant_amperage, 32);
        assert_eq!(command.offline_amperage, 16);
    }

    #[test]
    fn refuses_new_values_without_both_setpoints() {
        let state = SynthesizerState {
            last_status_frame: Some(status_frame(&[])),
            last_command_frame: None,
            first_status_ts: None,
            last_boot_ts: None,
        };
        let setpoints = Setpoints::default();
        let err = synthesize(&state, &setpoints, true).unwrap_err();
        assert!(matches!(err, SynthesizerError::UndefinedSetpoints));
    }

    #[test]
    fn counter_wraps_from_999_to_1_and_copies_amperages() {
        let prev = command_frame_now(20, 16, 6, 999, Dialect::Legacy);
        let state = SynthesizerState {
            last_status_frame: Some(status_frame(&[])),
            last_command_frame: Some(prev),
            first_status_ts: None,
            last_boot_ts: None,
        };
        let setpoints = Setpoints::default();
        let command = synthesize(&state, &setpoints, false).unwrap();
        assert_eq!(command.counter, 1);
        assert_eq!(command.instant_amperage, 20);
        assert_eq!(command.offline_amperage, 16);
    }

    #[test]
    fn modern_dialect_selected_only_for_v09u() {
        let state = SynthesizerState {
            last_status_frame: Some(status_frame(&[("v", "09u")])),
            last_command_frame: None,
            first_status_ts: None,
            last_boot_ts: None,
        };
        let setpoints = Setpoints {
            current_max_online: Some(40),
            current_max_offline: Some(40),
        };
        let command = synthesize(&state, &setpoints, false).unwrap();
        assert_eq!(command.dialect, Dialect::Modern);
    }

    #[test]
    fn seed_online_from_current_rating_after_boot_grace() {
        let mut setpoints = Setpoints::default();
        let now = Instant::now();
        let state = SynthesizerState {
            last_status_frame: Some(status_frame(&[("m", "40")])),
            last_command_frame: None,
            first_status_ts: Some(now - Duration::from_secs(1)),
            last_boot_ts: Some(now - Duration::from_secs(5)),
        };
        seed_setpoints(&mut setpoints, &state, now);
        assert_eq!(setpoints.current_max_online, Some(40));
    }

    #[test]
    fn seed_offline_from_online_when_no_device_value() {
        let mut setpoints = Setpoints {
            current_max_online: Some(32),
            current_max_offline: None,
        };
        let now = Instant::now();
        let state = SynthesizerState {
            last_status_frame: Some(status_frame(&[])),
            last_command_frame: None,
            first_status_ts: Some(now - Duration::from_secs(1)),
            last_boot_ts: Some(now - Duration::from_secs(1)),
        };
        seed_setpoints(&mut setpoints, &state, now);
        assert_eq!(setpoints.current_max_offline, Some(32));
    }
}
