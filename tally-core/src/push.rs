//! Push notification payload parsing.
//!
//! Recognized payloads carry campaign identifiers under `mp`:
//!
//! ```json
//! { "aps": { ... }, "mp": { "m": 1234, "c": 56 } }
//! ```

use crate::types::{Properties, Value};

/// Event tracked for a recognized push payload.
pub const CAMPAIGN_EVENT: &str = "$campaign_received";

const PAYLOAD_KEY: &str = "mp";
const MESSAGE_KEY: &str = "m";
const CAMPAIGN_KEY: &str = "c";

/// Extract `campaign_id` / `message_id` properties from a push payload.
///
/// Returns `None` when the payload does not have the expected shape.
pub fn campaign_properties(payload: &Properties) -> Option<Properties> {
    let ids = payload.get(PAYLOAD_KEY)?.as_map()?;
    let message = ids.get(MESSAGE_KEY).filter(|v| is_identifier(v))?;
    let campaign = ids.get(CAMPAIGN_KEY).filter(|v| is_identifier(v))?;

    Some(Properties::from([
        ("campaign_id".to_string(), campaign.clone()),
        ("message_id".to_string(), message.clone()),
    ]))
}

fn is_identifier(value: &Value) -> bool {
    match value {
        Value::Int(_) => true,
        Value::String(s) => !s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> Properties {
        match Value::from(json) {
            Value::Map(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_recognized_payload() {
        let props = campaign_properties(&payload(serde_json::json!({
            "aps": {"alert": "hi"},
            "mp": {"m": 12, "c": "spring"}
        })))
        .unwrap();

        assert_eq!(props["message_id"], Value::Int(12));
        assert_eq!(props["campaign_id"], Value::from("spring"));
    }

    #[test]
    fn test_unrecognized_payloads() {
        assert!(campaign_properties(&payload(serde_json::json!({"aps": {}}))).is_none());
        assert!(campaign_properties(&payload(serde_json::json!({"mp": "x"}))).is_none());
        assert!(campaign_properties(&payload(serde_json::json!({"mp": {"m": 1}}))).is_none());
        assert!(
            campaign_properties(&payload(serde_json::json!({"mp": {"m": 1, "c": 2.5}})))
                .is_none()
        );
    }
}
