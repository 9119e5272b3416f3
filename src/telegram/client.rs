//! Bot API HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::TelegramError;
use crate::instance::{PollError, WebhookApi, WebhookInfo};
use crate::telegram::types::{
    ApiResponse, InlineKeyboardMarkup, Message, ParseMode, Update, User,
};

/// Per-request timeout for calls other than long polls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time a long poll may take beyond its server-side timeout.
const LONG_POLL_SLACK: Duration = Duration::from_secs(10);

/// Thin JSON client for the Bot API.
pub struct TelegramClient {
    http: Client,
    api_base: String,
    token: SecretString,
}

impl TelegramClient {
    pub fn new(token: SecretString, api_base: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            api_base: api_base.into(),
            token,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token.expose_secret(),
            method
        )
    }

    /// Call `method` with a JSON body.
    async fn call<P, R>(&self, method: &str, params: &P, timeout: Duration) -> Result<R, TelegramError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        tracing::debug!(method, "Bot API call");
        let response = self
            .http
            .post(self.method_url(method))
            .timeout(timeout)
            .json(params)
            .send()
            .await
            .map_err(|e| TelegramError::from(e.without_url()))?;
        decode(method, response).await
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({}), REQUEST_TIMEOUT).await
    }

    /// Long-poll for updates after `offset`.
    ///
    /// A zero `timeout` returns immediately; it is used to probe whether
    /// another session is polling.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, TelegramError> {
        let mut params = json!({
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            params["offset"] = json!(offset);
        }
        self.call("getUpdates", &params, timeout + LONG_POLL_SLACK)
            .await
    }

    pub async fn get_webhook_info(&self) -> Result<WebhookInfo, TelegramError> {
        self.call("getWebhookInfo", &json!({}), REQUEST_TIMEOUT).await
    }

    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<bool, TelegramError> {
        self.call(
            "deleteWebhook",
            &json!({ "drop_pending_updates": drop_pending_updates }),
            REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseMode>,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<Message, TelegramError> {
        let mut params = json!({ "chat_id": chat_id, "text": text });
        if let Some(mode) = parse_mode {
            params["parse_mode"] = json!(mode);
        }
        if let Some(markup) = keyboard {
            params["reply_markup"] = json!(markup);
        }
        self.call("sendMessage", &params, REQUEST_TIMEOUT).await
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        parse_mode: Option<ParseMode>,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), TelegramError> {
        let mut params = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        if let Some(mode) = parse_mode {
            params["parse_mode"] = json!(mode);
        }
        if let Some(markup) = keyboard {
            params["reply_markup"] = json!(markup);
        }
        // The result is the edited message, or `true` for inline messages.
        let _: serde_json::Value = self.call("editMessageText", &params, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut params = json!({ "callback_query_id": callback_query_id });
        if let Some(text) = text {
            params["text"] = json!(text);
        }
        let _: bool = self
            .call("answerCallbackQuery", &params, REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Upload an in-memory file as a document.
    pub async fn send_document(
        &self,
        chat_id: i64,
        filename: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<Message, TelegramError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        tracing::debug!(filename, "Bot API document upload");
        let response = self
            .http
            .post(self.method_url("sendDocument"))
            .timeout(REQUEST_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TelegramError::from(e.without_url()))?;
        decode("sendDocument", response).await
    }
}

/// Unwrap the `{ok, result}` envelope and classify failures.
async fn decode<R: DeserializeOwned>(
    method: &str,
    response: reqwest::Response,
) -> Result<R, TelegramError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| TelegramError::Network(e.without_url().to_string()))?;

    let envelope: ApiResponse<R> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Err(match status.as_u16() {
                409 => TelegramError::Conflict(body),
                code if code >= 500 => TelegramError::Network(format!("HTTP {code}")),
                _ => TelegramError::Decode(format!("{method}: {e}")),
            });
        }
    };

    if !envelope.ok {
        let code = envelope.error_code.unwrap_or(status.as_u16());
        let description = envelope
            .description
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());
        if code == 409 {
            return Err(TelegramError::Conflict(description));
        }
        return Err(TelegramError::Api { code, description });
    }

    envelope
        .result
        .ok_or_else(|| TelegramError::Decode(format!("{method}: response has no result")))
}

#[async_trait]
impl WebhookApi for TelegramClient {
    async fn get_webhook_info(&self) -> Result<WebhookInfo, PollError> {
        TelegramClient::get_webhook_info(self)
            .await
            .map_err(PollError::from)
    }

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<(), PollError> {
        TelegramClient::delete_webhook(self, drop_pending_updates)
            .await
            .map(|_| ())
            .map_err(PollError::from)
    }
}
