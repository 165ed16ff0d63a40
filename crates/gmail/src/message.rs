//! Gmail API wire types and their reduction to [`FetchedMessage`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use pipeline::{FetchedMessage, MessageId, Timestamp};
use serde::Deserialize;

use crate::GmailError;

/// `users.history.list` response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryList {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryRecord {
    #[serde(default)]
    pub messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageAdded {
    pub message: MessageRef,
}

/// `users.messages.list` response.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct MessageList {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageRef {
    pub id: String,
}

/// `users.messages.get?format=full` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub snippet: Option<String>,
    /// Milliseconds since the epoch, as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessagePart {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PartBody {
    #[serde(default)]
    pub data: Option<String>,
}

impl HistoryList {
    /// Ids of added messages, most recent first, without repeats.
    pub(crate) fn added_newest_first(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let added = self
            .history
            .iter()
            .rev()
            .flat_map(|record| record.messages_added.iter().rev());
        for entry in added {
            if !ids.contains(&entry.message.id) {
                ids.push(entry.message.id.clone());
            }
        }
        ids
    }
}

impl MessagePart {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Depth-first search for the first `text/plain` part that carries data.
    fn plain_text(&self) -> Option<&str> {
        let is_plain = self
            .mime_type
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("text/plain"));
        if is_plain {
            if let Some(data) = self.body.as_ref().and_then(|b| b.data.as_deref()) {
                return Some(data);
            }
        }
        self.parts.iter().find_map(MessagePart::plain_text)
    }
}

impl GmailMessage {
    /// Reduces the full message to what content validation needs.
    ///
    /// # Errors
    ///
    /// Returns [`GmailError::Parse`] if the message id is blank.
    pub(crate) fn into_fetched(self) -> Result<FetchedMessage, GmailError> {
        let message_id = MessageId::new(self.id.as_str())
            .ok_or_else(|| GmailError::Parse("message without id".into()))?;
        let payload = self.payload.unwrap_or_default();

        let subject = payload.header("Subject").unwrap_or_default().to_string();
        let sender = payload.header("From").map(str::to_string);
        let body = payload
            .plain_text()
            .and_then(decode_body)
            .or(self.snippet)
            .unwrap_or_default();
        let received_at = self
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Timestamp::from_unix_seconds(ms / 1000));

        Ok(FetchedMessage {
            message_id,
            subject,
            sender,
            body,
            commit: None,
            received_at,
        })
    }
}

/// Decodes a URL-safe base64 body part. Padding is optional.
fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
