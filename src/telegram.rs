//! Telegram Bot API collaborator.
//!
//! Implements both external actions of the gate:
//!
//! ```text
//!   AccessGranter
//!         │
//!         ├─► grant_member ──► getChatMember ──member──► no-op
//!         │                        │
//!         │                     not member
//!         │                        ▼
//!         │                 unbanChatMember (only_if_banned)
//!         │                 createChatInviteLink (member_limit = 1)
//!         │                 sendMessage(link) to the user
//!         │
//!         └─► notify ──► sendMessage
//! ```

use crate::config::TelegramConfig;
use crate::error::{Error, Result};
use crate::payment::{MembershipGateway, Notifier, UserId};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Chat member statuses that already have access.
const MEMBER_STATUSES: &[&str] = &["creator", "administrator", "member"];

/// `getChatMember` rejections meaning the user is not in the channel.
const NOT_A_MEMBER: &[&str] = &["user not found", "participant_id_invalid"];

/// A well-formed `ok: false` reply.
#[derive(Debug)]
struct Rejection {
    code: u16,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
    #[serde(default)]
    is_member: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InviteLink {
    invite_link: String,
}

/// Bot API client for one gated channel.
pub struct TelegramGateway {
    http: reqwest::Client,
    api_base: String,
    channel_id: i64,
}

impl TelegramGateway {
    /// Create a gateway from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credentials`] without a bot token, or
    /// [`Error::Config`] without a channel id.
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::Credentials("telegram bot token is not set".to_string()))?;
        let channel_id = config
            .channel_id
            .ok_or_else(|| Error::Config("telegram channel id is not set".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build Telegram client: {e}")))?;

        Ok(Self {
            http,
            api_base: format!("{}/bot{}", config.api_url.trim_end_matches('/'), token),
            channel_id,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T> {
        self.try_call(method, body).await?.map_err(|rejection| {
            Error::Membership(format!(
                "{method}: {} (code {})",
                rejection.description, rejection.code
            ))
        })
    }

    /// Like `call`, but hands back API rejections for the caller to
    /// classify. Transport failures and rejected credentials are still
    /// errors.
    async fn try_call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: Value,
    ) -> Result<std::result::Result<T, Rejection>> {
        let response = self
            .http
            .post(format!("{}/{method}", self.api_base))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Membership(format!("{method}: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
            return Err(Error::Credentials(format!(
                "{method}: bot token rejected (HTTP {status})"
            )));
        }

        let reply: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Membership(format!("{method}: unreadable reply (HTTP {status}): {e}")))?;

        if !reply.ok {
            return Ok(Err(Rejection {
                code: reply.error_code.unwrap_or_else(|| status.as_u16()),
                description: reply.description.unwrap_or_default(),
            }));
        }

        serde_json::from_value(reply.result.unwrap_or(Value::Null))
            .map(Ok)
            .map_err(|e| Error::Membership(format!("{method}: malformed result: {e}")))
    }

    async fn is_member(&self, user_id: UserId) -> Result<bool> {
        let member: ChatMember = match self
            .try_call(
                "getChatMember",
                json!({ "chat_id": self.channel_id, "user_id": user_id.0 }),
            )
            .await?
        {
            Ok(member) => member,
            Err(rejection) if rejection.code == 400 && is_not_a_member(&rejection.description) => {
                debug!(
                    "getChatMember: {user_id} is not in {}: {}",
                    self.channel_id, rejection.description
                );
                return Ok(false);
            }
            Err(rejection) => {
                return Err(Error::Membership(format!(
                    "getChatMember: {} (code {})",
                    rejection.description, rejection.code
                )));
            }
        };
        Ok(MEMBER_STATUSES.contains(&member.status.as_str())
            || (member.status == "restricted" && member.is_member == Some(true)))
    }

    /// Send a plain text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the Bot API call fails.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let _: Value = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "disable_web_page_preview": true,
                }),
            )
            .await?;
        Ok(())
    }
}

fn is_not_a_member(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    NOT_A_MEMBER.iter().any(|needle| description.contains(needle))
}

#[async_trait]
impl MembershipGateway for TelegramGateway {
    async fn grant_member(&self, user_id: UserId) -> Result<()> {
        if self.is_member(user_id).await? {
            info!("User {user_id} is already a member of {}", self.channel_id);
            return Ok(());
        }

        let _: bool = self
            .call(
                "unbanChatMember",
                json!({
                    "chat_id": self.channel_id,
                    "user_id": user_id.0,
                    "only_if_banned": true,
                }),
            )
            .await?;

        let link: InviteLink = self
            .call(
                "createChatInviteLink",
                json!({
                    "chat_id": self.channel_id,
                    "name": format!("paygate {user_id}"),
                    "member_limit": 1,
                }),
            )
            .await?;

        self.send_message(
            user_id.0,
            &format!("🔑 Your personal invite link: {}", link.invite_link),
        )
        .await
        .map_err(|e| {
            warn!("Invite link for {user_id} not delivered: {e}");
            e
        })?;

        info!("Sent single-use invite link to user {user_id}");
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramGateway {
    async fn notify(&self, user_id: UserId, message: &str) -> Result<()> {
        self.send_message(user_id.0, message).await
    }
}
