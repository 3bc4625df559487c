//! REST side of the chat backend: history, sends and chat lookup.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize};
use shared::{
    domain::{ChatId, UserId},
    error::{ApiException, ErrorCode},
    protocol::{
        ChatLookupResponse, HistoryResponse, SendMessageRequest, SendMessageResponse, WireMessage,
    },
};
use url::Url;

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_history(&self, auth_token: &str, chat_id: &ChatId) -> Result<Vec<WireMessage>>;

    /// Returns the stored message when the server includes it in the ack.
    async fn send_message(
        &self,
        auth_token: &str,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> Result<Option<WireMessage>>;

    async fn get_or_create_chat(&self, auth_token: &str, user_id: &UserId) -> Result<ChatId>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid api base url: {base_url}"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("api base url cannot carry a path: {base_url}"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("api base url cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn read_body<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        return Err(ApiException::new(ErrorCode::from_status(status.as_u16()), message).into());
    }
    response
        .json::<T>()
        .await
        .context("invalid response body from chat server")
}

fn rejected(message: Option<String>, fallback: &str) -> anyhow::Error {
    ApiException::new(
        ErrorCode::Validation,
        message.unwrap_or_else(|| fallback.to_string()),
    )
    .into()
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, auth_token: &str, chat_id: &ChatId) -> Result<Vec<WireMessage>> {
        let url = self.endpoint(&["chats", chat_id.as_str()])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(auth_token)
            .send()
            .await
            .with_context(|| format!("failed to fetch history for chat {chat_id}"))?;
        let body: HistoryResponse = read_body(response).await?;
        if !body.success {
            return Err(rejected(body.message, "history request rejected"));
        }
        Ok(body.data.map(|data| data.messages).unwrap_or_default())
    }

    async fn send_message(
        &self,
        auth_token: &str,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> Result<Option<WireMessage>> {
        let url = self.endpoint(&["chats", chat_id.as_str(), "message"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(auth_token)
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to send message to chat {chat_id}"))?;
        let body: SendMessageResponse = read_body(response).await?;
        if !body.success {
            return Err(rejected(body.message, "message rejected"));
        }
        Ok(body.data)
    }

    async fn get_or_create_chat(&self, auth_token: &str, user_id: &UserId) -> Result<ChatId> {
        let url = self.endpoint(&["chats", "user", user_id.as_str()])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(auth_token)
            .send()
            .await
            .with_context(|| format!("failed to resolve chat with user {user_id}"))?;
        let body: ChatLookupResponse = read_body(response).await?;
        match (body.success, body.chat_id) {
            (true, Some(chat_id)) => Ok(chat_id),
            (_, _) => Err(rejected(body.message, "chat lookup rejected")),
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
