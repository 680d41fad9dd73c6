//! Wire format translation
//!
//! Mode 01 responses are space separated upper-case hex bytes, e.g.
//! `41 0C 1A F8`. Decoding never fails: anything that does not contain the
//! expected header pair reads as zero.

use crate::sim::VehicleState;

use super::PROMPT;

/// Mode 01 PID 0C: engine RPM
pub const PID_ENGINE_RPM: &str = "010C";

/// Mode 01 PID 0D: vehicle speed
pub const PID_VEHICLE_SPEED: &str = "010D";

/// Identification returned for `ATZ`
pub const ADAPTER_IDENT: &str = "ELM327 v2.1";

/// Reply for anything the bridge does not answer
pub const NO_DATA: &str = "NO DATA";

/// Mode 01 positive response service byte
const MODE01_RESPONSE: u8 = 0x41;
const RPM_PID: u8 = 0x0C;
const SPEED_PID: u8 = 0x0D;

/// A recognised request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `ATZ`
    Reset,
    /// `ATSP0`
    AutoProtocol,
    /// `010C`
    EngineRpm,
    /// `010D`
    VehicleSpeed,
    Unsupported,
}

impl Request {
    /// Classify a raw request line.
    ///
    /// Whitespace, case and a trailing prompt are ignored. Mode 01 requests
    /// may carry the single-digit response-count suffix (`010C1`).
    pub fn parse(raw: &str) -> Self {
        let cmd: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != PROMPT)
            .collect::<String>()
            .to_ascii_uppercase();

        match cmd.as_str() {
            "ATZ" => return Request::Reset,
            "ATSP0" => return Request::AutoProtocol,
            _ => {}
        }

        let pid_matches = |pid: &str| {
            cmd.strip_prefix(pid)
                .is_some_and(|rest| rest.len() <= 1 && rest.chars().all(|c| c.is_ascii_hexdigit()))
        };
        if pid_matches(PID_ENGINE_RPM) {
            Request::EngineRpm
        } else if pid_matches(PID_VEHICLE_SPEED) {
            Request::VehicleSpeed
        } else {
            Request::Unsupported
        }
    }
}

/// Answer a request from the given vehicle state
pub fn respond(request: &str, state: &VehicleState) -> String {
    match Request::parse(request) {
        Request::Reset => ADAPTER_IDENT.to_string(),
        Request::AutoProtocol => "OK".to_string(),
        Request::EngineRpm => encode_rpm(state.rpm),
        Request::VehicleSpeed => encode_speed(state.speed_kmh()),
        Request::Unsupported => NO_DATA.to_string(),
    }
}

/// Encode RPM as `41 0C AA BB` where `AA*256 + BB = round(rpm * 4)`.
///
/// Quantised to 0.25 rpm; saturates at the 16-bit range.
pub fn encode_rpm(rpm: f64) -> String {
    let raw = (rpm * 4.0).round().clamp(0.0, u16::MAX as f64) as u16;
    let [a, b] = raw.to_be_bytes();
    format!("{:02X} {:02X} {:02X} {:02X}", MODE01_RESPONSE, RPM_PID, a, b)
}

/// Decode an RPM response, returning 0.0 if none is found
pub fn decode_rpm(response: &str) -> f64 {
    find_payload(response, RPM_PID, 2)
        .map(|data| (data[0] as f64 * 256.0 + data[1] as f64) / 4.0)
        .unwrap_or(0.0)
}

/// Encode speed as `41 0D SS`, rounded and clamped to one byte
pub fn encode_speed(speed_kmh: f64) -> String {
    let raw = if speed_kmh.is_nan() {
        0
    } else {
        speed_kmh.round().clamp(0.0, 255.0) as u8
    };
    format!("{:02X} {:02X} {:02X}", MODE01_RESPONSE, SPEED_PID, raw)
}

/// Decode a speed response in km/h, returning 0 if none is found
pub fn decode_speed(response: &str) -> u8 {
    find_payload(response, SPEED_PID, 1)
        .map(|data| data[0])
        .unwrap_or(0)
}

/// Locate `41 <pid>` followed by `len` data bytes anywhere in the reply
fn find_payload(response: &str, pid: u8, len: usize) -> Option<Vec<u8>> {
    let bytes = hex_tokens(response);
    bytes
        .windows(2 + len)
        .find(|w| w[0] == MODE01_RESPONSE && w[1] == pid)
        .map(|w| w[2..].to_vec())
}

/// Split a reply into hex byte tokens.
///
/// Two-digit words are bytes; longer even-length hex runs (adapters with
/// spaces off) are split into pairs; everything else is noise.
fn hex_tokens(response: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for word in response.split(|c: char| c.is_whitespace() || c == PROMPT) {
        if word.is_empty() || word.len() % 2 != 0 || !word.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        for pair in word.as_bytes().chunks(2) {
            if let Some(byte) = std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
            {
                bytes.push(byte);
            }
        }
    }
    bytes
}
