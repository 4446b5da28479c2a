//! WebSocket message types for the terminal and resource sockets.
//!
//! Inbound messages are decoded into [`ClientMessage`] and then validated
//! into a [`SessionRequest`]; the session core only ever sees the latter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{COLS_RANGE, CreateSessionRequest, ROWS_RANGE, SessionError, TerminalSize};
use crate::telemetry::SystemSnapshot;

// ============================================================================
// Client -> Server
// ============================================================================

/// Messages a browser sends on the terminal socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    CreateSession {
        #[serde(default)]
        cols: Option<i64>,
        #[serde(default)]
        rows: Option<i64>,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        environment: Option<String>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: i64,
        rows: i64,
    },
    Ping,
}

/// A validated inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Create(CreateSessionRequest),
    Input(String),
    Resize(TerminalSize),
    Ping,
}

/// Bounds inbound messages must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLimits {
    pub shells: Vec<String>,
    pub environments: Vec<String>,
    pub max_input_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            shells: vec![
                "bash".to_string(),
                "zsh".to_string(),
                "sh".to_string(),
                "fish".to_string(),
            ],
            environments: vec!["default".to_string()],
            max_input_bytes: 10 * 1024,
        }
    }
}

impl RequestLimits {
    fn default_shell(&self) -> Option<&str> {
        self.shells
            .iter()
            .find(|s| *s == "bash")
            .or_else(|| self.shells.first())
            .map(String::as_str)
    }

    fn default_environment(&self) -> Option<&str> {
        self.environments
            .iter()
            .find(|e| *e == "default")
            .or_else(|| self.environments.first())
            .map(String::as_str)
    }
}

/// Parse and validate one text frame.
pub fn decode(text: &str, limits: &RequestLimits) -> Result<SessionRequest, SessionError> {
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| SessionError::validation(format!("malformed message: {e}")))?;
    message.validate(limits)
}

impl ClientMessage {
    pub fn validate(self, limits: &RequestLimits) -> Result<SessionRequest, SessionError> {
        match self {
            ClientMessage::CreateSession {
                cols,
                rows,
                shell,
                environment,
            } => {
                let cols = check_range("cols", cols.unwrap_or(80), COLS_RANGE)?;
                let rows = check_range("rows", rows.unwrap_or(24), ROWS_RANGE)?;

                let shell = match shell {
                    Some(shell) if limits.shells.contains(&shell) => shell,
                    Some(shell) => {
                        return Err(SessionError::validation(format!(
                            "shell '{shell}' is not allowed"
                        )));
                    }
                    None => limits
                        .default_shell()
                        .ok_or_else(|| SessionError::validation("no shells are allowed"))?
                        .to_string(),
                };

                let environment = match environment {
                    Some(env) if limits.environments.contains(&env) => env,
                    Some(env) => {
                        return Err(SessionError::validation(format!(
                            "environment '{env}' is not available"
                        )));
                    }
                    None => limits
                        .default_environment()
                        .ok_or_else(|| SessionError::validation("no environments are available"))?
                        .to_string(),
                };

                Ok(SessionRequest::Create(CreateSessionRequest {
                    environment,
                    shell,
                    cols,
                    rows,
                }))
            }
            ClientMessage::Input { data } => {
                if data.len() > limits.max_input_bytes {
                    return Err(SessionError::validation(format!(
                        "input exceeds {} bytes",
                        limits.max_input_bytes
                    )));
                }
                Ok(SessionRequest::Input(data))
            }
            ClientMessage::Resize { cols, rows } => Ok(SessionRequest::Resize(TerminalSize {
                cols: check_range("cols", cols, COLS_RANGE)?,
                rows: check_range("rows", rows, ROWS_RANGE)?,
            })),
            ClientMessage::Ping => Ok(SessionRequest::Ping),
        }
    }
}

fn check_range(field: &str, value: i64, (min, max): (u16, u16)) -> Result<u16, SessionError> {
    if value < i64::from(min) || value > i64::from(max) {
        return Err(SessionError::validation(format!(
            "{field} must be between {min} and {max}, got {value}"
        )));
    }
    u16::try_from(value).map_err(|_| SessionError::validation(format!("{field} out of range")))
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Messages sent to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Output {
        data: String,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<&'static str>,
    },
    Pong,
    ResourceUpdate {
        data: Arc<SystemSnapshot>,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            code: None,
        }
    }

    pub fn from_session_error(err: &SessionError) -> Self {
        Self::Error {
            error: err.to_string(),
            code: Some(err.code()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"failed to encode message: {e}"}}"#)
        })
    }
}

// ============================================================================
// Output decoding
// ============================================================================

/// Decodes a byte stream to UTF-8 without splitting multibyte characters.
///
/// Incomplete trailing sequences are carried into the next chunk; invalid
/// bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RequestLimits {
        RequestLimits {
            environments: vec!["default".to_string(), "python".to_string()],
            ..RequestLimits::default()
        }
    }

    #[test]
    fn decodes_create_session_with_defaults() {
        let req = decode(r#"{"type":"create-session"}"#, &limits()).unwrap();
        assert_eq!(req, SessionRequest::Create(CreateSessionRequest::default()));

        let req = decode(
            r#"{"type":"create-session","cols":120,"rows":40,"shell":"zsh","environment":"python"}"#,
            &limits(),
        )
        .unwrap();
        assert_eq!(
            req,
            SessionRequest::Create(CreateSessionRequest {
                environment: "python".to_string(),
                shell: "zsh".to_string(),
                cols: 120,
                rows: 40,
            })
        );
    }

    #[test]
    fn rejects_out_of_bounds_and_unknown_values() {
        let l = limits();
        assert!(decode(r#"{"type":"resize","cols":9,"rows":24}"#, &l).is_err());
        assert!(decode(r#"{"type":"resize","cols":80,"rows":201}"#, &l).is_err());
        assert!(decode(r#"{"type":"resize","cols":-1,"rows":24}"#, &l).is_err());
        assert!(decode(r#"{"type":"create-session","shell":"python3"}"#, &l).is_err());
        assert!(decode(r#"{"type":"create-session","environment":"gpu"}"#, &l).is_err());
        assert!(decode(r#"{"type":"launch-missiles"}"#, &l).is_err());
        assert!(decode("not json", &l).is_err());

        let big = "x".repeat(l.max_input_bytes + 1);
        let msg = serde_json::json!({"type": "input", "data": big}).to_string();
        let err = decode(&msg, &l).unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[test]
    fn accepts_boundary_sizes() {
        let req = decode(r#"{"type":"resize","cols":10,"rows":200}"#, &limits()).unwrap();
        assert_eq!(req, SessionRequest::Resize(TerminalSize { cols: 10, rows: 200 }));
        assert_eq!(decode(r#"{"type":"ping"}"#, &limits()).unwrap(), SessionRequest::Ping);
    }

    #[test]
    fn server_messages_use_wire_names() {
        let json = ServerMessage::SessionCreated {
            session_id: "abc".to_string(),
        }
        .to_json();
        assert_eq!(json, r#"{"type":"session-created","sessionId":"abc"}"#);
        assert_eq!(ServerMessage::Pong.to_json(), r#"{"type":"pong"}"#);
        assert_eq!(
            ServerMessage::error("boom").to_json(),
            r#"{"type":"error","error":"boom"}"#
        );
    }

    #[test]
    fn utf8_carry_keeps_split_characters() {
        let bytes = "héllo €".as_bytes();
        let mut carry = Utf8Carry::new();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&carry.push(std::slice::from_ref(byte)));
        }
        out.push_str(&carry.finish());
        assert_eq!(out, "héllo €");
    }

    #[test]
    fn utf8_carry_replaces_invalid_bytes() {
        let mut carry = Utf8Carry::new();
        assert_eq!(carry.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");
        assert_eq!(carry.push(&[0xe2, 0x82]), "");
        assert_eq!(carry.finish(), "\u{fffd}");
    }
}
