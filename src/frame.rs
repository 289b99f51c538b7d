//! Wire protocol codec (C2): classifies, parses, and builds device frames.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{Datelike, Local, Timelike};
use regex::Regex;

use crate::checksum::base35_crc;
use crate::error::CodecError;

/// Debug-frame severity, inferred from the level token embedded in the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLevel {
    Info,
    Warning,
    Error,
    Other,
}

/// A decoded device/cloud datagram. Polymorphism is expressed as a tagged
/// variant rather than an inheritance hierarchy: every frame kind carries its
/// own fields and is built/parsed by its own associated functions.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Telemetry(TelemetryFrame),
    Command(CommandFrame),
    Debug(DebugFrame),
    Encrypted(EncryptedFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Legacy,
    Modern,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub serial: String,
    pub protocol_version: Option<String>,
    pub dialect: Dialect,
    /// Field key (possibly suffixed `:1`, `:2`, ... for duplicates) to raw value.
    pub fields: BTreeMap<String, String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Unplugged,
    PluggedIn,
    Charging,
    Error,
    Unknown,
}

impl TelemetryFrame {
    /// Derives the processed measurement map described in the field semantics
    /// table: numeric scaling, unit conversion, and the synthetic `power` field.
    pub fn to_simple_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let mut voltage: Option<f64> = None;
        let mut current: Option<f64> = None;

        for (key, raw) in &self.fields {
            let base_key = key.split(':').next().unwrap_or(key);
            let suffix = &key[base_key.len()..];
            match base_key {
                "A" => {
                    if let Ok(i) = raw.trim_end_matches('u').parse::<i64>() {
                        let amps = i as f64 * 0.1;
                        current = Some(amps);
                        out.insert(format!("current{suffix}"), format!("{amps:.1}"));
                    }
                }
                "C" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        out.insert(format!("current_max_offline{suffix}"), i.to_string());
                    }
                }
                "E" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        out.insert(format!("energy_session{suffix}"), i.to_string());
                    }
                }
                "f" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        out.insert(format!("frequency{suffix}"), format!("{:.2}", i as f64 * 0.01));
                    }
                }
                "i" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        out.insert(format!("interval{suffix}"), i.to_string());
                    }
                }
                "L" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        out.insert(format!("energy_lifetime{suffix}"), i.to_string());
                    }
                }
                "m" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        out.insert(format!("current_rating{suffix}"), i.to_string());
                    }
                }
                "M" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        out.insert(format!("current_max_online{suffix}"), i.to_string());
                    }
                }
                "s" => {
                    out.insert(format!("counter{suffix}"), raw.clone());
                }
                "S" => {
                    out.insert(format!("status{suffix}"), status_name(raw).to_string());
                }
                "t" => {
                    out.insert(format!("report_time{suffix}"), raw.clone());
                }
                "T" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        let f = ((1.8 * i as f64 + 32.0) * 100.0).round() / 100.0;
                        out.insert(format!("temperature{suffix}"), format_rounded(f));
                    }
                }
                "u" => {
                    out.insert(format!("loop_counter{suffix}"), raw.clone());
                }
                "v" => {
                    out.insert(format!("protocol_version{suffix}"), raw.clone());
                }
                "V" => {
                    if let Ok(i) = raw.parse::<i64>() {
                        let v = if raw.len() >= 4 { i as f64 * 0.1 } else { i as f64 };
                        voltage = Some(v);
                        out.insert(format!("voltage{suffix}"), format!("{v:.1}"));
                    }
                }
                other => {
                    out.insert(format!("unknown_{other}{suffix}"), raw.clone());
                }
            }
        }

        if self.dialect == Dialect::Legacy && !out.contains_key("status") {
            let current_val = current.unwrap_or(0.0);
            let status = if current_val > 0.0 {
                DeviceStatus::Charging
            } else {
                DeviceStatus::Unplugged
            };
            out.insert("status".to_string(), format!("{status:?}"));
        }

        if let Some(v) = voltage {
            let a = current.unwrap_or(0.0);
            out.insert("power".to_string(), format!("{}", (v * a).round() as i64));
        }

        out
    }

    pub fn status(&self) -> DeviceStatus {
        match self.fields.get("S") {
            Some(v) => status_from_code(v),
            None => {
                // Legacy inference from current.
                let amps = self
                    .fields
                    .get("A")
                    .and_then(|s| s.trim_end_matches('u').parse::<i64>().ok())
                    .unwrap_or(0);
                if amps == 0 {
                    DeviceStatus::PluggedIn
                } else {
                    DeviceStatus::Charging
                }
            }
        }
    }
}

fn status_from_code(raw: &str) -> DeviceStatus {
    match raw.trim_start_matches('0') {
        "" | "0" => DeviceStatus::Unplugged,
        "1" => DeviceStatus::PluggedIn,
        "2" => DeviceStatus::Charging,
        "5" => DeviceStatus::Error,
        _ => DeviceStatus::Unknown,
    }
}

/// Renders a value already rounded to 2 decimal places the way `round(x, 2)`
/// stringifies in the original firmware's tooling: trailing zeros beyond the
/// first decimal digit are dropped (`93.20` -> `93.2`), but one decimal digit
/// is always kept (`32.00` -> `32.0`).
fn format_rounded(value: f64) -> String {
    let mut s = format!("{value:.2}");
    while s.ends_with('0') && !s.ends_with(".0") {
        s.pop();
    }
    s
}

fn status_name(raw: &str) -> &'static str {
    match status_from_code(raw) {
        DeviceStatus::Unplugged => "Unplugged",
        DeviceStatus::PluggedIn => "PluggedIn",
        DeviceStatus::Charging => "Charging",
        DeviceStatus::Error => "Error",
        DeviceStatus::Unknown => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandFrame {
    pub weekday: u8,
    pub hhmm: [u8; 4],
    pub instant_amperage: u32,
    pub offline_amperage: u32,
    pub command_code: u32,
    pub counter: u32,
    pub dialect: Dialect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugFrame {
    pub serial: String,
    pub level: DebugLevel,
    pub text: String,
    pub is_boot: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedFrame {
    pub serial: Option<String>,
    pub protocol_version: String,
    pub raw: Vec<u8>,
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+):v(\d+)([eu]?)").unwrap())
}

fn debug_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+):DBG,(.*)$").unwrap())
}

fn legacy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+):").unwrap())
}

fn field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([A-Za-z]+)(-?\d+u?)").unwrap())
}

fn command_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d)(\d{4})A(\d+)M(\d+)C(\d+)S(\d+)!([0-9A-Z]*)\$?$").unwrap())
}

/// Classifies and parses a raw datagram into a [`Frame`].
pub fn classify(datagram: &[u8]) -> Result<Frame, CodecError> {
    let text = match std::str::from_utf8(datagram) {
        Ok(s) => s,
        Err(_) => return parse_encrypted(datagram),
    };

    if let Some(rest) = text.strip_prefix("CMD") {
        return parse_command(rest).map(Frame::Command);
    }

    if let Some(caps) = version_regex().captures(text) {
        let version_suffix = caps.get(3).map(|m| m.as_str()).unwrap_or("");
        let version = format!("v{}{}", &caps[2], version_suffix);
        if version == "v09e" {
            return parse_encrypted(datagram);
        }
        return parse_telemetry(text, Dialect::Modern).map(Frame::Telemetry);
    }

    if debug_regex().is_match(text) {
        return parse_debug(text).map(Frame::Debug);
    }

    if legacy_regex().is_match(text) {
        return parse_telemetry(text, Dialect::Legacy).map(Frame::Telemetry);
    }

    Err(CodecError::MalformedFrame(text.to_string()))
}

fn parse_encrypted(datagram: &[u8]) -> Result<Frame, CodecError> {
    if datagram.len() < 33 {
        return Err(CodecError::MalformedFrame(format!(
            "encrypted frame too short: {} bytes",
            datagram.len()
        )));
    }
    let header = String::from_utf8_lossy(&datagram[..33]);
    let version = if header.contains("v09e") {
        "v09e".to_string()
    } else {
        return Err(CodecError::UnsupportedEncryptedVersion(header.to_string()));
    };
    let serial = header.split(':').next().map(|s| s.to_string());
    Ok(Frame::Encrypted(EncryptedFrame {
        serial,
        protocol_version: version,
        raw: datagram.to_vec(),
    }))
}

fn parse_telemetry(text: &str, dialect: Dialect) -> Result<TelemetryFrame, CodecError> {
    let (body, checksum) = split_checksum(text);

    match dialect {
        Dialect::Legacy if checksum.is_some() => return Err(CodecError::UnexpectedChecksum),
        Dialect::Modern if checksum.is_none() => return Err(CodecError::MissingChecksum),
        _ => {}
    }

    if let Some(ref sum) = checksum {
        // Checksum covers the entire body up to "!", including "<serial>:".
        let expected = base35_crc(body.as_bytes());
        if &expected != sum {
            return Err(CodecError::BadChecksum {
                expected: sum.clone(),
                computed: expected,
            });
        }
    }

    let mut parts = body.splitn(2, ':');
    let serial = parts.next().unwrap_or("").to_string();
    let payload = parts.next().unwrap_or("");

    let mut fields = BTreeMap::new();
    let mut protocol_version = None;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();

    for cap in field_regex().captures_iter(payload) {
        let key = cap[1].to_string();
        let value = cap[2].to_string();
        if key == "v" {
            protocol_version = Some(format!("v{value}"));
        }
        let count = counts.entry(key.clone()).or_insert(0);
        let stored_key = if *count == 0 {
            key.clone()
        } else {
            format!("{key}:{count}")
        };
        *count += 1;
        fields.insert(stored_key, value);
    }

    Ok(TelemetryFrame {
        serial,
        protocol_version,
        dialect,
        fields,
        checksum,
    })
}

fn split_checksum(text: &str) -> (&str, Option<String>) {
    let trimmed = text.trim_end_matches([':', '$']);
    match trimmed.rsplit_once('!') {
        Some((body, sum)) => (body, Some(sum.to_string())),
        None => (trimmed, None),
    }
}

fn parse_debug(text: &str) -> Result<DebugFrame, CodecError> {
    let caps = debug_regex()
        .captures(text)
        .ok_or_else(|| CodecError::MalformedFrame(text.to_string()))?;
    let serial = caps[1].to_string();
    let body = caps[2].trim_end_matches([':', '$']).to_string();
    let level = if body.starts_with("ERR") {
        DebugLevel::Error
    } else if body.starts_with("WRN") {
        DebugLevel::Warning
    } else if body.starts_with("NFO") {
        DebugLevel::Info
    } else {
        DebugLevel::Other
    };
    let is_boot = body.contains("BOT:");
    Ok(DebugFrame {
        serial,
        level,
        text: body,
        is_boot,
    })
}

/// Builds the outbound command datagram per §4.2's layout.
pub fn build_command(cmd: &CommandFrame) -> String {
    let hhmm: String = cmd.hhmm.iter().map(|d| (b'0' + d) as char).collect();
    let (a_width, m_width) = match cmd.dialect {
        Dialect::Legacy => (2, 2),
        Dialect::Modern => (4, 3),
    };
    let a = format!("{:0width$}", cmd.instant_amperage, width = a_width);
    let m = format!("{:0width$}", cmd.offline_amperage, width = m_width);
    let payload = format!(
        "CMD{}{}A{}M{}C{:03}S{:03}",
        cmd.weekday, hhmm, a, m, cmd.command_code, cmd.counter,
    );
    let checksum = base35_crc(payload.as_bytes());
    format!("{payload}!{checksum}$")
}

/// Builds a command frame's field values seeded from the current local clock.
pub fn command_frame_now(
    instant_amperage: u32,
    offline_amperage: u32,
    command_code: u32,
    counter: u32,
    dialect: Dialect,
) -> CommandFrame {
    let now = Local::now();
    let weekday = now.weekday().num_days_from_sunday() as u8;
    let hour = now.hour();
    let minute = now.minute();
    let hhmm = [
        (hour / 10) as u8,
        (hour % 10) as u8,
        (minute / 10) as u8,
        (minute % 10) as u8,
    ];
    CommandFrame {
        weekday,
        hhmm,
        instant_amperage,
        offline_amperage,
        command_code,
        counter,
        dialect,
    }
}

fn parse_command(rest: &str) -> Result<CommandFrame, CodecError> {
    let caps = command_regex()
        .captures(rest)
        .ok_or_else(|| CodecError::MalformedFrame(rest.to_string()))?;

    let weekday: u8 = caps[1].parse().map_err(|_| CodecError::BadFieldValue("weekday".into()))?;
    let mut hhmm = [0u8; 4];
    for (i, c) in caps[2].chars().enumerate() {
        hhmm[i] = c.to_digit(10).ok_or_else(|| CodecError::BadFieldValue("hhmm".into()))? as u8;
    }
    let instant_amperage: u32 = caps[3].parse().map_err(|_| CodecError::BadFieldValue("A".into()))?;
    let offline_amperage: u32 = caps[4].parse().map_err(|_| CodecError::BadFieldValue("M".into()))?;
    let command_code: u32 = caps[5].parse().map_err(|_| CodecError::BadFieldValue("C".into()))?;
    let counter: u32 = caps[6].parse().map_err(|_| CodecError::BadFieldValue("S".into()))?;
    let dialect = if caps[3].len() == 4 { Dialect::Modern } else { Dialect::Legacy };

    let payload_len = rest.find('!').unwrap_or(rest.len());
    let payload = format!("CMD{}", &rest[..payload_len]);
    let expected = base35_crc(payload.as_bytes());
    if expected != caps[7] {
        return Err(CodecError::BadChecksum {
            expected: caps[7].to_string(),
            computed: expected,
        });
    }

    Ok(CommandFrame {
        weekday,
        hhmm,
        instant_amperage,
        offline_amperage,
        command_code,
        counter,
        dialect,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_status_parse() {
        let raw = b"0910000000000000000000000000:V247,L11097,S0,T34,E14,i84,e1,t30:";
        let frame = match classify(raw).unwrap() {
            Frame::Telemetry(t) => t,
            other => panic!("expected telemetry, got {other:?}"),
        };
        assert_eq!(frame.serial, "0910000000000000000000000000");
        assert_eq!(frame.status(), DeviceStatus::Unplugged);
        let simple = frame.to_simple_map();
        assert_eq!(simple["voltage"], "247.0");
        assert_eq!(simple["temperature"], "93.2");
        assert_eq!(simple["energy_lifetime"], "11097");
        assert_eq!(simple["energy_session"], "14");
        assert_eq!(simple["power"], "0");
    }

    #[test]
    fn modern_status_parse_with_checksum() {
        let raw = b"0910000000000000000000000000:v09u,s627,F10,u01254993,V2414,L00004555804,S01,T08,M0040,C0040,m0040,t29,i75,e00000,f5999,r61,b000,B0000000!S1H:";
        let frame = match classify(raw).unwrap() {
            Frame::Telemetry(t) => t,
            other => panic!("expected telemetry, got {other:?}"),
        };
        assert_eq!(frame.checksum.as_deref(), Some("S1H"));
        assert_eq!(frame.status(), DeviceStatus::PluggedIn);
        let simple = frame.to_simple_map();
        assert_eq!(simple["voltage"], "241.4");
        assert_eq!(simple["current_max_online"], "40");
        assert_eq!(simple["current_max_offline"], "40");
        assert_eq!(simple["current_rating"], "40");
        assert_eq!(simple["status"], "PluggedIn");
        assert_eq!(simple["counter"], "627");
    }

    #[test]
    fn duplicate_field_keys_are_suffixed() {
        let raw = b"0000000000000000000000000001:V247,L11156,E13322,A138,T28,t10,E14,i41,e1:";
        let frame = match classify(raw).unwrap() {
            Frame::Telemetry(t) => t,
            other => panic!("expected telemetry, got {other:?}"),
        };
        assert_eq!(frame.fields.get("E"), Some(&"13322".to_string()));
        assert_eq!(frame.fields.get("E:1"), Some(&"14".to_string()));
    }

    #[test]
    fn command_build_legacy_and_modern() {
        let legacy = CommandFrame {
            weekday: 5,
            hhmm: [2, 3, 2, 4],
            instant_amperage: 20,
            offline_amperage: 16,
            command_code: 6,
            counter: 1,
            dialect: Dialect::Legacy,
        };
        assert_eq!(build_command(&legacy), "CMD52324A20M16C006S001!5RE$");

        let modern = CommandFrame {
            dialect: Dialect::Modern,
            ..legacy
        };
        assert_eq!(build_command(&modern), "CMD52324A0020M016C006S001!YUK$");
    }

    #[test]
    fn counter_wraps_from_999_to_1() {
        let next = (999u32 % 999) + 1;
        assert_eq!(next, 1);
    }
}
