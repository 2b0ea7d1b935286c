use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::notifier::ChatSink;

/// Long-poll wait passed to getUpdates, seconds.
const POLL_TIMEOUT_S: u64 = 30;

/// Minimal Telegram Bot API client: sendMessage, editMessageText,
/// answerCallbackQuery and a getUpdates long poll.
pub struct Telegram {
    base: String,
    client: Client,
}

#[derive(Debug)]
pub enum TelegramError {
    Http(reqwest::Error),
    Api(String),
}

impl std::fmt::Display for TelegramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelegramError::Http(e) => write!(f, "HTTP error: {e}"),
            TelegramError::Api(d) => write!(f, "telegram API error: {d}"),
        }
    }
}

impl std::error::Error for TelegramError {}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub data: Option<String>,
    pub message: Option<Message>,
}

impl Telegram {
    pub fn new(token: &str) -> Self {
        // client timeout must outlast the long-poll wait
        let client = Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_S + 10))
            .build()
            .expect("reqwest client");
        Self {
            base: format!("https://api.telegram.org/bot{token}"),
            client,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TelegramError> {
        let resp = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await
            .map_err(TelegramError::Http)?;
        let api: ApiResponse<T> = resp.json().await.map_err(TelegramError::Http)?;
        if !api.ok {
            return Err(TelegramError::Api(
                api.description.unwrap_or_else(|| "unknown".into()),
            ));
        }
        api.result
            .ok_or_else(|| TelegramError::Api("missing result".into()))
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, TelegramError> {
        let message: Message = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "Markdown",
                    "disable_web_page_preview": true,
                }),
            )
            .await?;
        Ok(message.message_id)
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), TelegramError> {
        let _: Message = self
            .call(
                "editMessageText",
                json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "text": text,
                    "parse_mode": "Markdown",
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: &str,
    ) -> Result<(), TelegramError> {
        let _: bool = self
            .call(
                "answerCallbackQuery",
                json!({ "callback_query_id": callback_id, "text": text }),
            )
            .await?;
        Ok(())
    }

    /// Long poll for updates past `offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_S,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }
}

#[async_trait]
impl ChatSink for Arc<Telegram> {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        Telegram::send_message(self, chat_id, text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_decodes_message() {
        let raw = serde_json::json!({
            "update_id": 42,
            "message": {
                "message_id": 7,
                "chat": {"id": 1234, "type": "private"},
                "text": "/track bcrt1qxyz savings"
            }
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        assert_eq!(update.update_id, 42);
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.id, 1234);
        assert_eq!(msg.text.as_deref(), Some("/track bcrt1qxyz savings"));
        assert!(update.callback_query.is_none());
    }

    #[test]
    fn update_decodes_callback() {
        let raw = serde_json::json!({
            "update_id": 43,
            "callback_query": {
                "id": "cb1",
                "data": "untrack:s1",
                "message": {"message_id": 8, "chat": {"id": 1234}}
            }
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        let cb = update.callback_query.unwrap();
        assert_eq!(cb.data.as_deref(), Some("untrack:s1"));
        assert_eq!(cb.message.unwrap().chat.id, 1234);
    }
}
