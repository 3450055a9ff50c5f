use serde::{Deserialize, Serialize};

/// A conversation context. Group chats share one scene; private chats get a
/// scene per user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scene {
    pub user_id: String,
    pub group_id: Option<String>,
}

impl Scene {
    pub fn private(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            group_id: None,
        }
    }

    pub fn group(user_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            group_id: Some(group_id.into()),
        }
    }

    /// Memory key: group id when present, else user id.
    pub fn key(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.user_id)
    }

    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }
}

/// One content part of an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Image { url: String, is_emoji: bool },
}

/// Inbound message event delivered by the chat adapter. An event with no
/// usable text after image captioning is dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub user_id: String,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub sender_name: String,
    pub parts: Vec<MessagePart>,
}

impl MessageEvent {
    pub fn scene(&self) -> Scene {
        Scene {
            user_id: self.user_id.clone(),
            group_id: self.group_id.clone(),
        }
    }

    /// Concatenated trimmed text of all text parts.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                out.push_str(text);
            }
        }
        out.trim().to_string()
    }
}

/// One message from adapter history, used for short-term warm-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub sender_id: String,
    /// Epoch seconds.
    pub time: i64,
    pub parts: Vec<MessagePart>,
}

impl HistoryMessage {
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                out.push_str(text);
            }
        }
        out.trim().to_string()
    }
}

/// The bot's own identity on the chat platform, used to tell its messages
/// apart from users' when pairing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfInfo {
    pub user_id: String,
    pub nickname: String,
}
