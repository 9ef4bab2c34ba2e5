// protocol.rs — JSON-lines wire format between the host and the daemon.
//
// Inbound, one envelope per line:
//
//   {"id": 7, "session_key": "tg:123", "event": {"type": "turn_end"}}
//
// Outbound, one message per line:
//
//   {"kind": "response", "id": 7, "response": {"action": "none"}}
//   {"kind": "challenge", "session_key": "tg:123", "code": "K7QM2X", ...}
//
// `id` is echoed back verbatim and may be any JSON value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tg_hooks::{Challenge, HookEvent, HookResponse};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Value,
    pub session_key: String,
    pub event: HookEvent,
}

/// A decoded input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(Envelope),
    /// Not a usable envelope. `id` is recovered when the line was at least
    /// a JSON object carrying one.
    Malformed { id: Value, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    Response { id: Value, response: HookResponse },
    Challenge(Challenge),
}

pub fn decode(line: &str) -> Inbound {
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => Inbound::Event(envelope),
        Err(error) => {
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|value| value.get("id").cloned())
                .unwrap_or(Value::Null);
            Inbound::Malformed {
                id,
                error: error.to_string(),
            }
        }
    }
}

pub fn encode(message: &Outbound) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_envelope() {
        let line = r#"{"id":"a1","session_key":"s","event":{"type":"pre_model_call","tools":["read"],"iteration":1}}"#;
        let Inbound::Event(envelope) = decode(line) else {
            panic!("expected an event");
        };
        assert_eq!(envelope.id, json!("a1"));
        assert_eq!(envelope.session_key, "s");
        assert_eq!(envelope.event.name(), "pre_model_call");
    }

    #[test]
    fn malformed_line_keeps_id_when_possible() {
        let inbound = decode(r#"{"id": 9, "session_key": "s", "event": {"type": "nope"}}"#);
        assert!(matches!(inbound, Inbound::Malformed { ref id, .. } if *id == json!(9)));

        let inbound = decode("not json");
        assert!(matches!(inbound, Inbound::Malformed { id: Value::Null, .. }));
    }

    #[test]
    fn encodes_tagged_messages() {
        let response = Outbound::Response {
            id: json!(3),
            response: HookResponse::Block {
                reason: "no".into(),
            },
        };
        let value: Value = serde_json::from_str(&encode(&response).unwrap()).unwrap();
        assert_eq!(value["kind"], "response");
        assert_eq!(value["response"]["action"], "block");

        let challenge = Outbound::Challenge(Challenge {
            session_key: "s".into(),
            code: "ABCDEF".into(),
            tools: vec!["exec".into()],
            expires_at: chrono::Utc::now(),
        });
        let value: Value = serde_json::from_str(&encode(&challenge).unwrap()).unwrap();
        assert_eq!(value["kind"], "challenge");
        assert_eq!(value["code"], "ABCDEF");
    }
}
