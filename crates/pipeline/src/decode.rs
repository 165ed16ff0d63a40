//! Push-envelope decoding.
//!
//! The transport wraps each notification in a JSON envelope whose
//! `message.data` field is the base64 encoding of the inner payload:
//!
//! ```json
//! { "message": { "data": "<base64>", "messageId": "...", "publishTime": "..." },
//!   "subscription": "projects/p/subscriptions/s" }
//! ```
//!
//! The inner payload carries `emailAddress` and `historyId`; synthetic
//! payloads may add `messageId` to pin a specific message.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DecodeError, DecodedNotification, HistoryId, MailboxId, MessageId, Timestamp};

#[derive(Debug, Deserialize)]
struct Envelope {
    message: Option<PushMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    data: Option<String>,
    publish_time: Option<String>,
}

/// The inner notification payload.
///
/// Public so operator tooling can produce synthetic notifications for the
/// test endpoint with [`NotificationPayload::to_envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    /// Mailbox address.
    pub email_address: Option<String>,
    /// History id, as a JSON number or numeric string.
    pub history_id: Option<Value>,
    /// Optional message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl NotificationPayload {
    /// Builds a payload for `mailbox` at `history_id`.
    pub fn new(mailbox: &MailboxId, history_id: HistoryId, message_id: Option<&MessageId>) -> Self {
        Self {
            email_address: Some(mailbox.to_string()),
            history_id: Some(Value::from(history_id.as_u64())),
            message_id: message_id.map(|m| m.to_string()),
        }
    }

    /// Wraps the payload in a transport envelope, ready to be signed and posted.
    pub fn to_envelope(&self) -> Vec<u8> {
        let inner = serde_json::to_vec(self).unwrap_or_default();
        let envelope = serde_json::json!({
            "message": { "data": STANDARD.encode(inner) },
        });
        envelope.to_string().into_bytes()
    }
}

/// Decodes a raw envelope body into a [`DecodedNotification`].
///
/// `received_at` is used when the envelope has no parseable `publishTime`.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing the first structural problem found.
pub fn decode_notification(
    body: &[u8],
    received_at: Timestamp,
) -> Result<DecodedNotification, DecodeError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| DecodeError::InvalidEnvelope(e.to_string()))?;
    let message = envelope.message.ok_or(DecodeError::MissingMessage)?;

    let data = message
        .data
        .filter(|d| !d.trim().is_empty())
        .ok_or(DecodeError::MissingData)?;
    let inner = decode_base64(&data)?;

    let payload: NotificationPayload =
        serde_json::from_slice(&inner).map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;

    let mailbox = payload
        .email_address
        .and_then(MailboxId::new)
        .ok_or(DecodeError::MissingField("emailAddress"))?;
    let history_id = parse_history_id(payload.history_id)?;
    let message_id = payload.message_id.and_then(MessageId::new);

    let published = message
        .publish_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| Timestamp::from_utc(t.with_timezone(&Utc)));

    Ok(DecodedNotification {
        mailbox,
        history_id,
        message_id,
        received_at: published.unwrap_or(received_at),
    })
}

fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    let unpadded = data.trim().trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(unpadded)
        .or_else(|_| URL_SAFE_NO_PAD.decode(unpadded))
        .map_err(|_| DecodeError::InvalidBase64)
}

fn parse_history_id(value: Option<Value>) -> Result<HistoryId, DecodeError> {
    match value {
        None | Some(Value::Null) => Err(DecodeError::MissingField("historyId")),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(HistoryId::new)
            .ok_or_else(|| DecodeError::InvalidHistoryId(n.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(DecodeError::MissingField("historyId"))
        }
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(HistoryId::new)
            .map_err(|_| DecodeError::InvalidHistoryId(s)),
        Some(other) => Err(DecodeError::InvalidHistoryId(other.to_string())),
    }
}
