//! Inbound event model
//!
//! Channel-agnostic view of a message delivered by the messaging adapter.

use serde::{Deserialize, Serialize};

/// Message content carried by an inbound event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    /// Button or list reply
    Selection {
        id: String,
        #[serde(default)]
        title: Option<String>,
    },
    /// Media and other kinds the core does not interpret
    Unsupported {
        kind: String,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text { body: body.into() }
    }

    pub fn selection(id: impl Into<String>) -> Self {
        MessageContent::Selection {
            id: id.into(),
            title: None,
        }
    }

    /// Raw body used for classification and event digests
    pub fn body(&self) -> &str {
        match self {
            MessageContent::Text { body } => body,
            MessageContent::Selection { id, .. } => id,
            MessageContent::Unsupported { .. } => "",
        }
    }

    /// Text recorded in conversation history
    pub fn display_text(&self) -> String {
        match self {
            MessageContent::Text { body } => body.clone(),
            MessageContent::Selection { id, title } => title.clone().unwrap_or_else(|| id.clone()),
            MessageContent::Unsupported { kind } => format!("[{}]", kind),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Selection { .. } => "selection",
            MessageContent::Unsupported { kind } => kind,
        }
    }
}

/// One inbound message from an end-user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub sender_id: String,
    /// Provider-assigned message id, when the provider sends one
    #[serde(default)]
    pub event_id: Option<String>,
    /// Provider timestamp in seconds
    pub timestamp: i64,
    pub content: MessageContent,
    #[serde(default)]
    pub sender_name: Option<String>,
}

impl InboundEvent {
    pub fn new(sender_id: impl Into<String>, timestamp: i64, content: MessageContent) -> Self {
        Self {
            sender_id: sender_id.into(),
            event_id: None,
            timestamp,
            content,
            sender_name: None,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// First word of the sender's profile name
    pub fn first_name(&self) -> Option<&str> {
        self.sender_name
            .as_deref()
            .and_then(|name| name.split_whitespace().next())
    }
}
