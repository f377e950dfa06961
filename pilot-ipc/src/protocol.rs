use pilot_auth::Decision;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodec;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/opencode-pilot.sock";

/// Longest accepted record. A longer line terminates the connection.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Records sent by a session to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register { session_id: String },
    #[serde(rename_all = "camelCase")]
    CreateNonce {
        session_id: String,
        permission_id: String,
    },
}

/// Records sent by the broker to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    Registered,
    #[serde(rename_all = "camelCase")]
    NonceCreated { permission_id: String, nonce: String },
    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        permission_id: String,
        response: Decision,
    },
}

pub fn lines_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_BYTES)
}

pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

/// Parse one line. Blank lines, malformed JSON and unknown `type`s yield
/// `None` so callers can skip them and keep reading.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(message) => Some(message),
        Err(error) => {
            tracing::debug!(%error, line_len = trimmed.len(), "ignoring unrecognized ipc record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_type_tag_and_camel_case_fields() {
        let register = encode_line(&ClientMessage::Register {
            session_id: "s1".to_string(),
        })
        .expect("encode");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&register).expect("json"),
            json!({ "type": "register", "sessionId": "s1" })
        );

        let create = encode_line(&ClientMessage::CreateNonce {
            session_id: "s1".to_string(),
            permission_id: "p1".to_string(),
        })
        .expect("encode");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&create).expect("json"),
            json!({ "type": "create_nonce", "sessionId": "s1", "permissionId": "p1" })
        );
    }

    #[test]
    fn broker_messages_match_wire_shapes() {
        assert_eq!(
            decode_line::<BrokerMessage>(r#"{"type":"registered"}"#),
            Some(BrokerMessage::Registered)
        );
        assert_eq!(
            decode_line::<BrokerMessage>(
                r#"{"type":"nonce_created","permissionId":"p1","nonce":"abc123"}"#
            ),
            Some(BrokerMessage::NonceCreated {
                permission_id: "p1".to_string(),
                nonce: "abc123".to_string(),
            })
        );
        assert_eq!(
            decode_line::<BrokerMessage>(
                r#"{"type":"permission_response","permissionId":"p1","response":"always"}"#
            ),
            Some(BrokerMessage::PermissionResponse {
                permission_id: "p1".to_string(),
                response: Decision::Always,
            })
        );
    }

    #[test]
    fn decode_skips_blank_malformed_and_unknown_records() {
        assert_eq!(decode_line::<ClientMessage>(""), None);
        assert_eq!(decode_line::<ClientMessage>("   "), None);
        assert_eq!(decode_line::<ClientMessage>("{not json"), None);
        assert_eq!(
            decode_line::<ClientMessage>(r#"{"type":"subscribe","sessionId":"s1"}"#),
            None
        );
        assert_eq!(
            decode_line::<ClientMessage>(r#"{"type":"register"}"#),
            None
        );
        assert_eq!(
            decode_line::<BrokerMessage>(
                r#"{"type":"permission_response","permissionId":"p1","response":"maybe"}"#
            ),
            None
        );
    }
}
