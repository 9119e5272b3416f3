//! Routes incoming updates to commands, collection and settings.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;

use crate::bot::commands::{self, Command, ParsedInput, SettingsAction};
use crate::bot::export::{self, ExportTable};
use crate::bot::numbers::{ExtractedNumber, extract, extract_all};
use crate::bot::session::{CollectedMessage, Preferences, SessionStore};
use crate::error::ExportError;
use crate::telegram::{
    CallbackQuery, InlineKeyboardMarkup, Message, ParseMode, TelegramClient, Update,
    UpdateHandler, User,
};

/// What the bot answers to one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text {
        text: String,
        html: bool,
        keyboard: Option<InlineKeyboardMarkup>,
    },
    Document {
        filename: String,
        bytes: Vec<u8>,
        caption: String,
        /// Sent instead when the upload fails.
        fallback: &'static str,
    },
}

impl Reply {
    fn plain(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            html: false,
            keyboard: None,
        }
    }

    fn html(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            html: true,
            keyboard: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ExportKind {
    Csv,
    Json,
}

pub struct BotHandler {
    client: Arc<TelegramClient>,
    sessions: Arc<SessionStore>,
}

impl BotHandler {
    pub fn new(client: Arc<TelegramClient>, sessions: Arc<SessionStore>) -> Self {
        Self { client, sessions }
    }

    /// Decide the reply to a message from `user`. Collection happens here;
    /// nothing is sent.
    pub async fn reply_for(
        &self,
        user: &User,
        text: Option<&str>,
        message_id: i64,
    ) -> Option<Reply> {
        let Some(text) = text else {
            return Some(Reply::plain(commands::TEXT_ONLY));
        };

        match commands::parse_input(text) {
            ParsedInput::Command(command) => Some(self.run_command(user, command).await),
            ParsedInput::UnknownCommand(name) => {
                tracing::debug!(user_id = user.id, command = %name, "Ignoring unknown command");
                None
            }
            ParsedInput::Text(text) => self.collect(user.id, text, message_id).await,
        }
    }

    async fn collect(&self, user_id: i64, text: String, message_id: i64) -> Option<Reply> {
        let prefs = self.sessions.preferences(user_id).await;
        let numbers = (!prefs.silent_collection).then(|| extract(&text, prefs.decimal_separator));
        let total = self
            .sessions
            .collect(user_id, CollectedMessage::new(text, message_id))
            .await;
        tracing::debug!(user_id, total, "Collected message");

        numbers.map(|n| Reply::plain(commands::collected(&n, prefs.include_currency, total)))
    }

    async fn run_command(&self, user: &User, command: Command) -> Reply {
        let user_id = user.id;
        match command {
            Command::Start => {
                self.sessions.clear(user_id).await;
                Reply::plain(commands::welcome(user.username.as_deref()))
            }
            Command::Help => Reply::html(commands::help()),
            Command::Clear => {
                self.sessions.clear(user_id).await;
                Reply::plain(commands::CLEARED)
            }
            Command::Settings => {
                let prefs = self.sessions.preferences(user_id).await;
                Reply::Text {
                    text: commands::settings_text(&prefs),
                    html: true,
                    keyboard: Some(commands::settings_keyboard(&prefs)),
                }
            }
            Command::Process | Command::Stats | Command::ExportCsv | Command::ExportJson => {
                let messages = self.sessions.messages(user_id).await;
                if messages.is_empty() {
                    return Reply::plain(commands::NO_MESSAGES);
                }
                let prefs = self.sessions.preferences(user_id).await;
                let numbers = extract_all(
                    messages.iter().map(|m| m.text.as_str()),
                    prefs.decimal_separator,
                );
                match command {
                    Command::Process => {
                        Reply::html(commands::results(&numbers, &prefs, messages.len()))
                    }
                    Command::Stats => Reply::html(commands::stats(&numbers, messages.len())),
                    Command::ExportCsv => export_reply(user_id, &numbers, &prefs, ExportKind::Csv),
                    _ => export_reply(user_id, &numbers, &prefs, ExportKind::Json),
                }
            }
        }
    }

    async fn on_message(&self, message: Message) {
        let Some(user) = message.from.clone() else {
            tracing::debug!(chat_id = message.chat.id, "Skipping message without sender");
            return;
        };
        if let Some(reply) = self
            .reply_for(&user, message.text.as_deref(), message.message_id)
            .await
        {
            self.send(message.chat.id, reply).await;
        }
    }

    async fn on_callback(&self, query: CallbackQuery) {
        let data = query.data.clone().unwrap_or_default();
        let prefs = match SettingsAction::parse(&data) {
            Some(action) => {
                self.sessions
                    .update_preferences(query.from.id, |p| action.apply(p))
                    .await
            }
            None => {
                tracing::debug!(data = %data, "Unrecognized settings callback");
                self.sessions.preferences(query.from.id).await
            }
        };

        if let Some(message) = &query.message
            && let Err(e) = self
                .client
                .edit_message_text(
                    message.chat.id,
                    message.message_id,
                    &commands::settings_text(&prefs),
                    Some(ParseMode::Html),
                    Some(&commands::settings_keyboard(&prefs)),
                )
                .await
        {
            // Pressing the current choice again leaves the text unchanged.
            tracing::warn!(error = %e, "Failed to update settings message");
        }

        let ack = format!("Setting updated: {data}");
        if let Err(e) = self.client.answer_callback_query(&query.id, Some(&ack)).await {
            tracing::warn!(error = %e, "Failed to answer callback query");
        }
    }

    async fn send(&self, chat_id: i64, reply: Reply) {
        match reply {
            Reply::Text {
                text,
                html,
                keyboard,
            } => {
                let mode = html.then_some(ParseMode::Html);
                if let Err(e) = self
                    .client
                    .send_message(chat_id, &text, mode, keyboard.as_ref())
                    .await
                {
                    tracing::warn!(chat_id, error = %e, "Failed to send reply");
                }
            }
            Reply::Document {
                filename,
                bytes,
                caption,
                fallback,
            } => {
                if let Err(e) = self
                    .client
                    .send_document(chat_id, &filename, bytes, Some(&caption))
                    .await
                {
                    tracing::error!(chat_id, filename = %filename, error = %e, "Export upload failed");
                    if let Err(e) = self.client.send_message(chat_id, fallback, None, None).await {
                        tracing::warn!(chat_id, error = %e, "Failed to send reply");
                    }
                }
            }
        }
    }
}

fn export_reply(
    user_id: i64,
    numbers: &[ExtractedNumber],
    prefs: &Preferences,
    kind: ExportKind,
) -> Reply {
    let table = match ExportTable::build(numbers, prefs.include_currency, prefs.decimal_separator) {
        Ok(table) => table,
        Err(ExportError::Empty) => return Reply::plain(commands::NO_NUMBERS),
        Err(e) => {
            tracing::error!(user_id, error = %e, "Export failed");
            return Reply::plain(commands::CSV_FAILED);
        }
    };
    let now = Local::now();
    match kind {
        ExportKind::Csv => Reply::Document {
            filename: export::csv_filename(user_id, now),
            bytes: table.to_csv(),
            caption: table.csv_caption(),
            fallback: commands::CSV_FAILED,
        },
        ExportKind::Json => match table.to_json() {
            Ok(bytes) => Reply::Document {
                filename: export::json_filename(user_id, now),
                bytes,
                caption: table.json_caption(),
                fallback: commands::JSON_FAILED,
            },
            Err(e) => {
                tracing::error!(user_id, error = %e, "JSON export failed");
                Reply::plain(commands::JSON_FAILED)
            }
        },
    }
}

#[async_trait]
impl UpdateHandler for BotHandler {
    async fn handle_update(&self, update: Update) {
        if let Some(query) = update.callback_query {
            self.on_callback(query).await;
        } else if let Some(message) = update.message {
            self.on_message(message).await;
        }
    }
}
