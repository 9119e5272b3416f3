//! Per-user collections and preferences.
//!
//! Held in memory only; a restart starts every user from scratch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bot::numbers::DecimalSeparator;

/// How `/process` renders results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Simple,
    Detailed,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Self::Simple),
            "detailed" => Some(Self::Detailed),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Simple => "Simple",
            Self::Detailed => "Detailed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub decimal_separator: DecimalSeparator,
    pub include_currency: bool,
    pub output_format: OutputFormat,
    /// Collect forwarded messages without acknowledging each one.
    pub silent_collection: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            decimal_separator: DecimalSeparator::Dot,
            include_currency: false,
            output_format: OutputFormat::Simple,
            silent_collection: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedMessage {
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub message_id: i64,
}

impl CollectedMessage {
    pub fn new(text: impl Into<String>, message_id: i64) -> Self {
        Self {
            text: text.into(),
            received_at: Utc::now(),
            message_id,
        }
    }
}

#[derive(Debug, Default)]
struct UserSession {
    messages: Vec<CollectedMessage>,
    preferences: Preferences,
}

/// All sessions, keyed by user id.
#[derive(Debug, Default)]
pub struct SessionStore {
    users: RwLock<HashMap<i64, UserSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the user's collection, creating the session if needed.
    /// Preferences are kept.
    pub async fn clear(&self, user_id: i64) {
        self.users
            .write()
            .await
            .entry(user_id)
            .or_default()
            .messages
            .clear();
    }

    /// Append a message and return the new collection size.
    pub async fn collect(&self, user_id: i64, message: CollectedMessage) -> usize {
        let mut users = self.users.write().await;
        let session = users.entry(user_id).or_default();
        session.messages.push(message);
        session.messages.len()
    }

    pub async fn messages(&self, user_id: i64) -> Vec<CollectedMessage> {
        self.users
            .read()
            .await
            .get(&user_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// The user's preferences, or the defaults for an unknown user.
    pub async fn preferences(&self, user_id: i64) -> Preferences {
        self.users
            .read()
            .await
            .get(&user_id)
            .map(|s| s.preferences)
            .unwrap_or_default()
    }

    pub async fn update_preferences<F>(&self, user_id: i64, change: F) -> Preferences
    where
        F: FnOnce(&mut Preferences),
    {
        let mut users = self.users.write().await;
        let session = users.entry(user_id).or_default();
        change(&mut session.preferences);
        session.preferences
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn unknown_user_has_defaults_and_no_messages() {
        let store = SessionStore::new();
        assert_eq!(store.preferences(1).await, Preferences::default());
        assert!(store.messages(1).await.is_empty());
        assert!(Preferences::default().silent_collection);
    }

    #[tokio::test]
    async fn collect_counts_per_user() {
        let store = SessionStore::new();
        assert_eq!(store.collect(1, CollectedMessage::new("100", 1)).await, 1);
        assert_eq!(store.collect(1, CollectedMessage::new("200", 2)).await, 2);
        assert_eq!(store.collect(2, CollectedMessage::new("300", 3)).await, 1);
        let texts: Vec<String> = store.messages(1).await.into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["100", "200"]);
    }

    #[tokio::test]
    async fn clear_keeps_preferences() {
        let store = SessionStore::new();
        store.collect(1, CollectedMessage::new("100", 1)).await;
        store
            .update_preferences(1, |p| p.decimal_separator = DecimalSeparator::Comma)
            .await;

        store.clear(1).await;

        assert!(store.messages(1).await.is_empty());
        assert_eq!(
            store.preferences(1).await.decimal_separator,
            DecimalSeparator::Comma
        );
    }

    #[test]
    fn output_format_parses_callback_suffix() {
        assert_eq!(OutputFormat::parse("detailed"), Some(OutputFormat::Detailed));
        assert_eq!(OutputFormat::parse("csv"), None);
        assert_eq!(OutputFormat::Simple.label(), "Simple");
    }
}
