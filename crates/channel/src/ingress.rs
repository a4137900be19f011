use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use concierge_core::domain::message::{Message, SenderType, SessionId};
use concierge_core::scheduler::ContinuationFire;

/// `source` value the workflow scheduler stamps on fired continuations.
pub const SCHEDULER_SOURCE: &str = "chat-scheduler";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressEvent {
    Message(Message),
    Continuation(ContinuationFire),
    Ignored { reason: IgnoreReason },
}

impl IngressEvent {
    pub fn event_type(&self) -> IngressEventType {
        match self {
            Self::Message(_) => IngressEventType::Message,
            Self::Continuation(_) => IngressEventType::Continuation,
            Self::Ignored { .. } => IngressEventType::Ignored,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Message(message) => Some(&message.session_id),
            Self::Continuation(fire) => Some(&fire.session_id),
            Self::Ignored { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IngressEventType {
    Message,
    Continuation,
    Ignored,
}

impl IngressEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Continuation => "continuation",
            Self::Ignored => "ignored",
        }
    }
}

/// Payloads that are well formed but carry nothing to process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    MissingChatId,
    BlankText,
    UnsupportedType(String),
}

impl IgnoreReason {
    pub fn label(&self) -> &str {
        match self {
            Self::MissingChatId => "missing_chat_id",
            Self::BlankText => "blank_text",
            Self::UnsupportedType(_) => "unsupported_type",
        }
    }
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("webhook body is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("webhook body must be a JSON object")]
    NotAnObject,
    #[error("scheduler event is invalid: {0}")]
    InvalidContinuation(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawWebhook {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    entity: RawEntity,
    #[serde(default)]
    refers: RawRefers,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntity {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    plain_text: Option<String>,
    #[serde(default)]
    person_type: Option<String>,
    #[serde(default)]
    created_at: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRefers {
    #[serde(default)]
    message: Option<RawEntity>,
}

pub fn parse_webhook(body: &[u8]) -> Result<IngressEvent, IngressError> {
    let value: Value = serde_json::from_slice(body)?;
    parse_webhook_value(value)
}

/// Maps a channel webhook or a scheduler fire to the runtime's input.
///
/// `type = "message"` reads `entity.{chatId, plainText, personType}`. `type = "userChat"` reads
/// the chat id from `entity.id` and the text from `refers.message`. Events whose `source` is the
/// scheduler are continuation fires and skip message parsing entirely.
pub fn parse_webhook_value(value: Value) -> Result<IngressEvent, IngressError> {
    if !value.is_object() {
        return Err(IngressError::NotAnObject);
    }

    if value.get("source").and_then(Value::as_str) == Some(SCHEDULER_SOURCE) {
        let fire = serde_json::from_value::<ContinuationFire>(value)
            .map_err(|error| IngressError::InvalidContinuation(error.to_string()))?;
        return Ok(IngressEvent::Continuation(fire));
    }

    let raw = serde_json::from_value::<RawWebhook>(value)?;
    let kind = raw.kind.unwrap_or_default();
    let (chat_id, message) = match kind.as_str() {
        "message" => (raw.entity.chat_id.clone(), raw.entity),
        "userChat" => (raw.entity.id, raw.refers.message.unwrap_or_default()),
        _ => {
            debug!(event_name = "ingress.ignored", webhook_type = %kind, "unsupported webhook type");
            return Ok(IngressEvent::Ignored { reason: IgnoreReason::UnsupportedType(kind) });
        }
    };

    let Some(chat_id) = chat_id.filter(|id| !id.trim().is_empty()) else {
        return Ok(IngressEvent::Ignored { reason: IgnoreReason::MissingChatId });
    };
    let text = message.plain_text.as_deref().map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Ok(IngressEvent::Ignored { reason: IgnoreReason::BlankText });
    }

    let sender_type =
        message.person_type.as_deref().map(SenderType::from_person_type).unwrap_or(SenderType::System);
    let timestamp = message.created_at.and_then(from_epoch_millis).unwrap_or_else(Utc::now);

    Ok(IngressEvent::Message(Message::new(
        SessionId::new(chat_id.trim()),
        text,
        sender_type,
        timestamp,
    )))
}

fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use concierge_core::domain::message::{SenderType, SessionId};
    use concierge_core::domain::session::ContinuationId;
    use concierge_core::scheduler::ContinuationPayload;

    use super::{parse_webhook, parse_webhook_value, IgnoreReason, IngressError, IngressEvent};

    #[test]
    fn message_webhook_maps_to_user_message() {
        let event = parse_webhook_value(json!({
            "type": "message",
            "entity": {
                "chatId": "chat-1",
                "plainText": "  재고 있나요 티셔츠 ",
                "personType": "user",
                "createdAt": 1_767_225_600_000_i64
            }
        }))
        .expect("parse");

        let IngressEvent::Message(message) = event else {
            panic!("expected message, got {event:?}");
        };
        assert_eq!(message.session_id, SessionId::new("chat-1"));
        assert_eq!(message.text, "재고 있나요 티셔츠");
        assert_eq!(message.sender_type, SenderType::User);
        assert_eq!(message.timestamp.timestamp(), 1_767_225_600);
    }

    #[test]
    fn user_chat_webhook_reads_referred_message() {
        let event = parse_webhook_value(json!({
            "type": "userChat",
            "entity": {"id": "chat-7", "state": "opened"},
            "refers": {"message": {"plainText": "배송 언제 와요?", "personType": "user"}}
        }))
        .expect("parse");

        assert_eq!(event.session_id(), Some(&SessionId::new("chat-7")));
        assert!(matches!(event, IngressEvent::Message(ref message) if message.text == "배송 언제 와요?"));
    }

    #[test]
    fn manager_messages_parse_as_agent_sender() {
        let event = parse_webhook(
            br#"{"type":"message","entity":{"chatId":"chat-1","plainText":"hi","personType":"manager"}}"#,
        )
        .expect("parse");

        assert!(matches!(event, IngressEvent::Message(ref message) if message.sender_type == SenderType::Agent));
    }

    #[test]
    fn missing_chat_id_or_blank_text_is_ignored() {
        let no_chat = parse_webhook_value(json!({
            "type": "message",
            "entity": {"plainText": "hello", "personType": "user"}
        }))
        .expect("parse");
        assert_eq!(no_chat, IngressEvent::Ignored { reason: IgnoreReason::MissingChatId });

        let blank = parse_webhook_value(json!({
            "type": "message",
            "entity": {"chatId": "chat-1", "plainText": "   ", "personType": "user"}
        }))
        .expect("parse");
        assert_eq!(blank, IngressEvent::Ignored { reason: IgnoreReason::BlankText });

        let other = parse_webhook_value(json!({"type": "push", "entity": {}})).expect("parse");
        assert_eq!(other.event_type().as_str(), "ignored");
    }

    #[test]
    fn scheduler_source_parses_continuation_fire() {
        let event = parse_webhook_value(json!({
            "source": "chat-scheduler",
            "chat_id": "chat-3",
            "payload": {
                "kind": "delivery_status",
                "continuation_id": "cont-1",
                "order_ref": "20260101-0001",
                "status": "배송중"
            }
        }))
        .expect("parse");

        let IngressEvent::Continuation(fire) = event else {
            panic!("expected continuation, got {event:?}");
        };
        assert_eq!(fire.session_id, SessionId::new("chat-3"));
        assert!(matches!(
            fire.payload,
            ContinuationPayload::DeliveryStatus { ref status, .. } if status.as_deref() == Some("배송중")
        ));
    }

    #[test]
    fn scheduler_event_carries_batch_flush() {
        let event = parse_webhook_value(json!({
            "source": "chat-scheduler",
            "chat_id": "chat-3",
            "payload": {"kind": "flush_batch", "batch_id": "b-7"}
        }))
        .expect("parse");

        let IngressEvent::Continuation(fire) = event else {
            panic!("expected continuation, got {event:?}");
        };
        assert_eq!(
            fire.payload,
            ContinuationPayload::FlushBatch { batch_id: ContinuationId("b-7".to_owned()) }
        );
    }

    #[test]
    fn scheduler_event_without_payload_is_rejected() {
        let error = parse_webhook_value(json!({"source": "chat-scheduler", "chat_id": "chat-3"}))
            .expect_err("payload required");
        assert!(matches!(error, IngressError::InvalidContinuation(_)));
    }

    #[test]
    fn non_object_and_invalid_json_bodies_fail() {
        assert!(matches!(parse_webhook(b"[1,2]"), Err(IngressError::NotAnObject)));
        assert!(matches!(parse_webhook(b"{not json"), Err(IngressError::Malformed(_))));
    }
}
