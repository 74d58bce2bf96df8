use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message type tag the hub uses for plain text.
pub const TEXT_TYPE: &str = "T";

/// Everything the hub pushes to a connected bot.
///
/// On the wire every frame is a single-key JSON object:
/// ```json
/// {"message": {"id": "m1", "sender_id": "p1", "type": "T", "text": "hi"}}
/// {"state": {"participants": [{"id": "p1", "name": "Alice"}]}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HubEvent {
    Message(HubMessage),
    State(StateSnapshot),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HubMessage {
    pub id: String,                          // hub-assigned, unique
    #[serde(default)]
    pub local_id: Option<String>,            // only present on our own messages
    pub sender_id: String,
    #[serde(default)]
    pub sent_by_human: bool,
    #[serde(rename = "type", default = "default_type")]
    pub message_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub quoted_message_id: Option<String>,   // the message this one replies to
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

fn default_type() -> String {
    TEXT_TYPE.to_string()
}

impl HubMessage {
    pub fn is_text(&self) -> bool {
        self.message_type == TEXT_TYPE
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

impl Participant {
    pub fn new(id: &str, name: &str) -> Self {
        Self { id: id.to_string(), name: name.to_string() }
    }
}

/// Conversation state pushed by the hub. Partial updates leave `participants` empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateSnapshot {
    #[serde(default)]
    pub participants: Option<Vec<Participant>>,
    #[serde(default)]
    pub my_participant_id: Option<String>,
}

/// Routing instructions attached to an outgoing message.
///
/// The hub expects them JSON-encoded in the `command` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Directives {
    #[serde(default, skip_serializing_if = "is_false")]
    pub self_redirect: bool,
    /// Restricts delivery to these participant ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_behalf_of: Option<String>,
    /// Bypass moderation.
    #[serde(default, skip_serializing_if = "is_false")]
    pub self_approve: bool,
    #[serde(default, skip_serializing_if = "Overrides::is_empty")]
    pub overrides: Overrides,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Overrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_by_human: Option<bool>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.sent_by_human.is_none()
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Directives {
    /// A prompt routed only to `participant_id`, delivered as if a human asked it.
    pub fn redirect_to(participant_id: &str) -> Self {
        Self {
            self_redirect: true,
            bots: vec![participant_id.to_string()],
            overrides: Overrides { sent_by_human: Some(true) },
            ..Self::default()
        }
    }

    /// Published straight to the conversation without moderation.
    pub fn approved() -> Self {
        Self { self_approve: true, ..Self::default() }
    }

    pub fn on_behalf_of(mut self, participant_id: &str) -> Self {
        self.on_behalf_of = Some(participant_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutgoingMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: String,
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            message_type: TEXT_TYPE.to_string(),
            text: text.into(),
            local_id: local_id.into(),
            command: None,
        }
    }

    pub fn with_directives(mut self, directives: &Directives) -> Result<Self, serde_json::Error> {
        self.command = Some(serde_json::to_string(directives)?);
        Ok(self)
    }

    /// Decode the `command` field back into directives.
    pub fn directives(&self) -> Option<Directives> {
        self.command
            .as_deref()
            .and_then(|c| serde_json::from_str(c).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_message_frame() {
        let frame = json!({
            "message": {
                "id": "m1",
                "sender_id": "p1",
                "sent_by_human": true,
                "type": "T",
                "text": "hello",
                "quoted_message_id": null
            }
        });
        let event: HubEvent = serde_json::from_value(frame).unwrap();
        match event {
            HubEvent::Message(m) => {
                assert_eq!(m.id, "m1");
                assert!(m.sent_by_human);
                assert!(m.is_text());
                assert_eq!(m.local_id, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_state_without_participants() {
        let event: HubEvent = serde_json::from_value(json!({"state": {"status": "open"}})).unwrap();
        assert_eq!(event, HubEvent::State(StateSnapshot::default()));
    }

    #[test]
    fn test_non_text_type_is_kept() {
        let m: HubMessage =
            serde_json::from_value(json!({"id": "x", "sender_id": "p", "type": "I"})).unwrap();
        assert!(!m.is_text());
        assert_eq!(m.text, "");
    }

    #[test]
    fn test_redirect_command_encoding() {
        let msg = OutgoingMessage::text("prompt", "l1")
            .with_directives(&Directives::redirect_to("bot-7"))
            .unwrap();
        let command: serde_json::Value = serde_json::from_str(msg.command.as_deref().unwrap()).unwrap();
        assert_eq!(
            command,
            json!({"self_redirect": true, "bots": ["bot-7"], "overrides": {"sent_by_human": true}})
        );
    }

    #[test]
    fn test_approved_on_behalf_of_encoding() {
        let msg = OutgoingMessage::text("answer", "l2")
            .with_directives(&Directives::approved().on_behalf_of("p9"))
            .unwrap();
        let command: serde_json::Value = serde_json::from_str(msg.command.as_deref().unwrap()).unwrap();
        assert_eq!(command, json!({"on_behalf_of": "p9", "self_approve": true}));
        assert_eq!(msg.directives().unwrap().on_behalf_of.as_deref(), Some("p9"));
    }
}
