//! Messages for a single terminal session socket.
//!
//! One connection carries one call. `attach` is followed by a stream of
//! [`InputFrame`]s from the client and [`OutputFrame`]s from the host;
//! `resize` is answered by one [`ResizeReply`]; `ping` by one [`Pong`].

use serde::{Deserialize, Serialize};

/// Environment variable telling a container where its session socket is.
pub const SOCK_FILE_ENV: &str = "HOSTPTY_SOCK_FILE";

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub cols: u32,
    pub rows: u32,
}

impl Size {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    /// An all-zero size is how the host reports a failed resize.
    pub fn is_zero(&self) -> bool {
        self.cols == 0 && self.rows == 0
    }
}

/// First frame of every terminal connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TerminalRequest {
    Attach,
    Resize(Size),
    Ping,
}

/// Client input destined for the PTY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrame {
    #[serde(with = "payload")]
    pub payload: Vec<u8>,
}

/// PTY output destined for the client.
///
/// `completed` is set on the last frame of a session, once the shell exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFrame {
    #[serde(with = "payload")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub completed: bool,
}

/// Answer to a resize call.
///
/// Failure is reported as a zero size; `error` carries the reason for clients
/// that understand it and is omitted on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeReply {
    #[serde(flatten)]
    pub size: Size,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResizeReply {
    pub fn applied(size: Size) -> Self {
        Self { size, error: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            size: Size::default(),
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub pong: bool,
}

/// Raw bytes travel as standard base64 strings.
mod payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let resize = serde_json::to_value(TerminalRequest::Resize(Size::new(120, 40))).unwrap();
        assert_eq!(
            resize,
            serde_json::json!({"method": "resize", "cols": 120, "rows": 40})
        );

        let attach: TerminalRequest = serde_json::from_str(r#"{"method":"attach"}"#).unwrap();
        assert_eq!(attach, TerminalRequest::Attach);
    }

    #[test]
    fn test_payload_is_base64() {
        let frame = OutputFrame {
            payload: b"\x1b[1;32mok\x1b[0m".to_vec(),
            completed: true,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["payload"], "G1sxOzMybW9rG1swbQ==");
        assert_eq!(json["completed"], true);
    }

    #[test]
    fn test_completed_defaults_to_false() {
        let frame: OutputFrame = serde_json::from_str(r#"{"payload":"aGk="}"#).unwrap();
        assert_eq!(frame.payload, b"hi");
        assert!(!frame.completed);
    }

    #[test]
    fn test_bad_base64_is_rejected() {
        let result: Result<InputFrame, _> = serde_json::from_str(r#"{"payload":"!!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_resize_reply_error_is_optional() {
        let ok = serde_json::to_value(ResizeReply::applied(Size::new(80, 30))).unwrap();
        assert_eq!(ok, serde_json::json!({"cols": 80, "rows": 30}));

        // Older hosts only send the size.
        let legacy: ResizeReply = serde_json::from_str(r#"{"cols":0,"rows":0}"#).unwrap();
        assert!(legacy.size.is_zero());
        assert!(legacy.error.is_none());

        let failed = ResizeReply::failed("PTY is closed");
        assert!(failed.size.is_zero());
        assert_eq!(failed.error.as_deref(), Some("PTY is closed"));
    }
}
