//! RPC error model.
//!
//! Errors reach the core in two ways: as `rpc_error` frames inside a
//! response, and as locally synthesized conditions (a cleared callback, a
//! response that would not parse). Both are represented by [`RpcError`];
//! numeric suffixes are stripped from the name and kept in
//! [`RpcError::value`], so `FLOOD_WAIT_30` becomes
//! `{ code: 420, name: "FLOOD_WAIT", value: Some(30) }`.

use std::fmt;

use crate::dc_id::DcId;

/// TL constructor id of an `rpc_error` frame.
const RPC_ERROR_CONSTRUCTOR: u32 = 0x2144_ca19;

/// An error produced by the server or synthesized locally.
///
/// Local errors carry `code == 0` and an empty [`value`](RpcError::value).
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code; `0` for locally synthesized errors.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric suffix removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<i32>,
    /// Free-form description, mostly for logs.
    pub description: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, "_{v}")?;
        }
        if !self.description.is_empty() {
            write!(f, " ({})", self.description)?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_mtp(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(value) = suffix.parse::<i32>() {
                    return Self {
                        code,
                        name: message[..idx].to_string(),
                        value: Some(value),
                        description: String::new(),
                    };
                }
            }
        }
        Self {
            code,
            name: message.to_string(),
            value: None,
            description: String::new(),
        }
    }

    /// A locally synthesized error (never seen on the wire).
    pub fn local(name: &str, description: impl Into<String>) -> Self {
        Self {
            code: 0,
            name: name.to_string(),
            value: None,
            description: description.into(),
        }
    }

    /// The local error used when callbacks are dropped without a response.
    pub fn clear_callback(request_id: i32, error_code: i32) -> Self {
        Self::local(
            "CLEAR_CALLBACK",
            format!("did not handle request {request_id}, error code {error_code}"),
        )
    }

    /// The local error used when a response frame would not parse.
    pub fn response_parse_failed(description: impl Into<String>) -> Self {
        Self::local("RESPONSE_PARSE_FAILED", description)
    }

    /// Whether `bytes` starts with the `rpc_error` constructor.
    pub fn is_error_frame(bytes: &[u8]) -> bool {
        bytes.len() >= 4
            && u32::from_le_bytes(bytes[..4].try_into().unwrap()) == RPC_ERROR_CONSTRUCTOR
    }

    /// Parse an `rpc_error` frame: constructor, `i32` code, TL string text.
    ///
    /// Returns `None` when the frame is not an `rpc_error` or is truncated.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if !Self::is_error_frame(bytes) || bytes.len() < 8 {
            return None;
        }
        let code = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let message = tl_read_string(&bytes[8..])?;
        Some(Self::from_mtp(code, &message))
    }

    /// Match on the error name, with an optional `'*'` prefix or suffix.
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Errors the collaborator already handled before the core saw them;
    /// the policy engine is skipped for these.
    pub fn is_default_handled(&self) -> bool {
        self.code == 0 && matches!(self.name.as_str(), "REQUEST_CANCELED" | "REQUEST_TIMEOUT")
    }

    /// Target DC of a `*_MIGRATE_N` error, if this is one.
    pub fn migrate_target(&self) -> Option<DcId> {
        match self.name.as_str() {
            "FILE_MIGRATE" | "PHONE_MIGRATE" | "NETWORK_MIGRATE" | "USER_MIGRATE" => {
                self.value.filter(|&dc| dc > 0)
            }
            _ => None,
        }
    }

    /// Seconds to wait if this is a `FLOOD_WAIT_S` error.
    pub fn flood_wait_seconds(&self) -> Option<i32> {
        (self.name == "FLOOD_WAIT").then_some(self.value.unwrap_or(0))
    }

    /// Negative or 5xx codes: the server failed, retry with backoff.
    pub fn is_transient(&self) -> bool {
        self.code < 0 || self.code >= 500
    }
}

/// Read a TL-encoded string (short or long length prefix).
fn tl_read_string(data: &[u8]) -> Option<String> {
    let (len, start) = if data.is_empty() {
        return Some(String::new());
    } else if data[0] < 254 {
        (data[0] as usize, 1)
    } else if data.len() >= 4 {
        (
            data[1] as usize | (data[2] as usize) << 8 | (data[3] as usize) << 16,
            4,
        )
    } else {
        return None;
    };
    if data.len() < start + len {
        return None;
    }
    Some(String::from_utf8_lossy(&data[start..start + len]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_frame(code: i32, message: &str) -> Vec<u8> {
        let mut bytes = RPC_ERROR_CONSTRUCTOR.to_le_bytes().to_vec();
        bytes.extend_from_slice(&code.to_le_bytes());
        bytes.push(message.len() as u8);
        bytes.extend_from_slice(message.as_bytes());
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
    }

    #[test]
    fn numeric_suffix_moves_into_value() {
        let err = RpcError::from_mtp(420, "FLOOD_WAIT_30");
        assert_eq!(err.name, "FLOOD_WAIT");
        assert_eq!(err.value, Some(30));
        assert_eq!(err.flood_wait_seconds(), Some(30));
    }

    #[test]
    fn name_without_suffix_is_kept_whole() {
        let err = RpcError::from_mtp(400, "FILE_ID_INVALID");
        assert_eq!(err.name, "FILE_ID_INVALID");
        assert_eq!(err.value, None);
    }

    #[test]
    fn wire_frame_round_trip() {
        let frame = error_frame(303, "PHONE_MIGRATE_4");
        assert!(RpcError::is_error_frame(&frame));
        let err = RpcError::from_wire(&frame).expect("frame must parse");
        assert_eq!(err.code, 303);
        assert_eq!(err.migrate_target(), Some(4));
    }

    #[test]
    fn non_error_frame_is_rejected() {
        assert!(!RpcError::is_error_frame(&[1, 2, 3]));
        assert_eq!(RpcError::from_wire(&[0u8; 16]), None);
    }

    #[test]
    fn migrate_detection_covers_all_variants() {
        for name in ["FILE_MIGRATE_2", "PHONE_MIGRATE_2", "NETWORK_MIGRATE_2", "USER_MIGRATE_2"] {
            assert_eq!(RpcError::from_mtp(303, name).migrate_target(), Some(2), "{name}");
        }
        assert_eq!(RpcError::from_mtp(400, "PEER_MIGRATE_2").migrate_target(), None);
    }

    #[test]
    fn local_errors_are_code_zero() {
        let err = RpcError::response_parse_failed("empty response");
        assert_eq!(err.code, 0);
        assert!(err.is("RESPONSE_PARSE_FAILED"));
        assert!(!err.is_default_handled());
        assert!(RpcError::local("REQUEST_CANCELED", "").is_default_handled());
    }

    #[test]
    fn wildcard_matching() {
        let err = RpcError::from_mtp(400, "PHONE_CODE_INVALID");
        assert!(err.is("PHONE_CODE_*"));
        assert!(err.is("*_INVALID"));
        assert!(!err.is("PHONE_CODE"));
    }
}
