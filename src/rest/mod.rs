//! REST adapter for the chat platform's HTTP API.
//!
//! Implements the [`Directory`] and [`MessageTransport`] capabilities
//! over reqwest, translating rate-limit headers and error bodies into
//! the forms the request gate understands. The adapter performs no
//! pacing of its own; callers route everything through the gate.

mod payload;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::api::{
    ApiError, ApiResponse, ApiResult, Directory, MessageTransport, RateLimitInfo, ThreadSet,
};
use crate::models::{ChannelId, ChannelInfo, GuildId, Message, MessageId, RoleId, UserId};

use payload::{ChannelPayload, ErrorPayload, MemberPayload, MessagePayload, ThreadListPayload};

/// Platform error codes the pipeline reacts to.
mod codes {
    pub const UNKNOWN_CHANNEL: u32 = 10003;
    pub const UNKNOWN_MESSAGE: u32 = 10008;
    pub const MISSING_ACCESS: u32 = 50001;
    pub const MISSING_PERMISSIONS: u32 = 50013;
    pub const THREAD_ARCHIVED: u32 = 50083;
}

const DEFAULT_BASE_URL: &str = "https://api.chat.example/v10";
const USER_AGENT: &str = concat!("purgeling/", env!("CARGO_PKG_VERSION"));
/// Page size for member listing.
const MEMBER_PAGE_LIMIT: usize = 1_000;

/// HTTP client for the platform API.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: Url,
    token: String,
}

impl RestClient {
    /// Create a client against the default API endpoint.
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Create a client against a custom endpoint (proxies, test
    /// servers).
    pub fn with_base_url(token: impl Into<String>, base_url: &str) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .brotli(true)
            .build()
            .expect("Failed to create HTTP client");

        let base_url = Url::parse(base_url).expect("invalid base URL");

        Self {
            client,
            base_url,
            token: token.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().expect("base URL cannot be a base");
            segments.pop_if_empty();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        url
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> ApiResult<T> {
        let mut url = self.endpoint(path);
        for (key, value) in query {
            url.query_pairs_mut().append_pair(key, value);
        }

        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bot {}", self.token));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        let rate_limit = parse_rate_limit(&response);
        let status = response.status();

        if status.is_success() {
            let value = if status == StatusCode::NO_CONTENT {
                serde_json::from_value(serde_json::Value::Null)
                    .map_err(|err| ApiError::Transport(err.to_string()))?
            } else {
                response
                    .json()
                    .await
                    .map_err(|err| ApiError::Transport(err.to_string()))?
            };
            return Ok(match rate_limit {
                Some(info) => ApiResponse::with_rate_limit(value, info),
                None => ApiResponse::bare(value),
            });
        }

        Err(self.error_from(status, response).await)
    }

    async fn error_from(&self, status: StatusCode, response: Response) -> ApiError {
        let global = response
            .headers()
            .get("X-RateLimit-Global")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let header_retry = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64);

        let payload: Option<ErrorPayload> = response.json().await.ok();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = payload
                .as_ref()
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs_f64)
                .or(header_retry);
            debug!(?retry_after, global, "throttled by platform");
            return ApiError::RateLimited {
                retry_after,
                global,
            };
        }

        let code = payload.as_ref().and_then(|p| p.code).unwrap_or(0);
        let message = payload
            .map(|p| p.message.unwrap_or_default())
            .unwrap_or_default();

        match code {
            codes::UNKNOWN_MESSAGE => ApiError::UnknownMessage,
            codes::UNKNOWN_CHANNEL => ApiError::UnknownChannel,
            codes::MISSING_ACCESS | codes::MISSING_PERMISSIONS => ApiError::MissingAccess,
            codes::THREAD_ARCHIVED => ApiError::ThreadArchived,
            _ if status == StatusCode::NOT_FOUND => ApiError::UnknownChannel,
            _ if status == StatusCode::FORBIDDEN => ApiError::MissingAccess,
            _ => ApiError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }
}

fn parse_rate_limit(response: &Response) -> Option<RateLimitInfo> {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };

    let limit = header("X-RateLimit-Limit").and_then(|v| v.parse().ok());
    let remaining = header("X-RateLimit-Remaining").and_then(|v| v.parse().ok());
    let reset_after = header("X-RateLimit-Reset-After")
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64);

    if limit.is_none() && remaining.is_none() && reset_after.is_none() {
        return None;
    }

    Some(RateLimitInfo {
        limit,
        remaining,
        reset_after,
    })
}

#[async_trait]
impl Directory for RestClient {
    async fn list_channels(&self, guild: &GuildId) -> ApiResult<Vec<ChannelInfo>> {
        let response: ApiResponse<Vec<ChannelPayload>> = self
            .request(
                Method::GET,
                &format!("guilds/{}/channels", guild),
                &[],
                None,
            )
            .await?;
        Ok(map_response(response, |channels| {
            channels.into_iter().map(|c| c.into_info(guild)).collect()
        }))
    }

    async fn fetch_channel(&self, channel: &ChannelId) -> ApiResult<ChannelInfo> {
        let response: ApiResponse<ChannelPayload> = self
            .request(Method::GET, &format!("channels/{}", channel), &[], None)
            .await?;
        let guild = response
            .value
            .guild_id
            .clone()
            .map(GuildId::from)
            .unwrap_or_else(|| GuildId::from(""));
        Ok(map_response(response, |payload| payload.into_info(&guild)))
    }

    async fn list_members(&self, guild: &GuildId) -> ApiResult<Vec<UserId>> {
        let mut members = Vec::new();
        let mut after: Option<UserId> = None;
        let mut last_rate_limit = None;

        loop {
            let mut query = vec![("limit", MEMBER_PAGE_LIMIT.to_string())];
            if let Some(after) = &after {
                query.push(("after", after.to_string()));
            }

            let response: ApiResponse<Vec<MemberPayload>> = self
                .request(
                    Method::GET,
                    &format!("guilds/{}/members", guild),
                    &query,
                    None,
                )
                .await?;
            last_rate_limit = response.rate_limit.clone();

            let page = response.value;
            let full_page = page.len() >= MEMBER_PAGE_LIMIT;
            after = page.last().map(|m| UserId::from(m.user.id.as_str()));
            members.extend(page.into_iter().map(|m| UserId::from(m.user.id.as_str())));

            if !full_page || after.is_none() {
                break;
            }
        }

        Ok(ApiResponse {
            value: members,
            rate_limit: last_rate_limit,
        })
    }

    async fn member_roles(&self, guild: &GuildId, user: &UserId) -> ApiResult<Vec<RoleId>> {
        let response: ApiResponse<MemberPayload> = self
            .request(
                Method::GET,
                &format!("guilds/{}/members/{}", guild, user),
                &[],
                None,
            )
            .await?;
        Ok(map_response(response, |member| {
            member.roles.into_iter().map(RoleId::from).collect()
        }))
    }

    async fn list_threads(
        &self,
        channel: &ChannelId,
        set: ThreadSet,
    ) -> ApiResult<Vec<ChannelInfo>> {
        let path = match set {
            ThreadSet::Active => format!("channels/{}/threads/active", channel),
            ThreadSet::ArchivedPublic => format!("channels/{}/threads/archived/public", channel),
            ThreadSet::ArchivedPrivate => format!("channels/{}/threads/archived/private", channel),
        };

        let response: ApiResponse<ThreadListPayload> =
            self.request(Method::GET, &path, &[], None).await?;
        Ok(map_response(response, |list| {
            list.threads
                .into_iter()
                .map(|t| {
                    let guild = t
                        .guild_id
                        .clone()
                        .map(GuildId::from)
                        .unwrap_or_else(|| GuildId::from(""));
                    t.into_info(&guild)
                })
                .collect()
        }))
    }
}

#[async_trait]
impl MessageTransport for RestClient {
    async fn fetch_page(
        &self,
        channel: &ChannelId,
        limit: usize,
        before: Option<&MessageId>,
    ) -> ApiResult<Vec<Message>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }

        let response: ApiResponse<Vec<MessagePayload>> = self
            .request(
                Method::GET,
                &format!("channels/{}/messages", channel),
                &query,
                None,
            )
            .await?;
        Ok(map_response(response, |messages| {
            messages
                .into_iter()
                .map(|m| m.into_message(channel))
                .collect()
        }))
    }

    async fn bulk_delete(&self, channel: &ChannelId, ids: &[MessageId]) -> ApiResult<u64> {
        let body = serde_json::json!({
            "messages": ids.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
        });

        let response: ApiResponse<Option<serde_json::Value>> = self
            .request(
                Method::POST,
                &format!("channels/{}/messages/bulk-delete", channel),
                &[],
                Some(body),
            )
            .await?;
        Ok(map_response(response, |_| ids.len() as u64))
    }

    async fn delete_message(&self, channel: &ChannelId, id: &MessageId) -> ApiResult<()> {
        let response: ApiResponse<Option<serde_json::Value>> = self
            .request(
                Method::DELETE,
                &format!("channels/{}/messages/{}", channel, id),
                &[],
                None,
            )
            .await?;
        Ok(map_response(response, |_| ()))
    }

    async fn set_archived(&self, thread: &ChannelId, archived: bool) -> ApiResult<()> {
        let body = serde_json::json!({ "archived": archived });
        let response: ApiResponse<Option<serde_json::Value>> = self
            .request(
                Method::PATCH,
                &format!("channels/{}", thread),
                &[],
                Some(body),
            )
            .await?;
        Ok(map_response(response, |_| ()))
    }
}

fn map_response<T, U>(response: ApiResponse<T>, map: impl FnOnce(T) -> U) -> ApiResponse<U> {
    ApiResponse {
        value: map(response.value),
        rate_limit: response.rate_limit,
    }
}
