use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, COOKIE, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{RawFile, RawMessage};
use crate::settings::DEFAULT_API_URL;
use crate::{AppError, Result};

/// Page size for `conversations.history`.
pub const HISTORY_PAGE_SIZE: u32 = 100;
/// Page size for `conversations.replies`.
pub const REPLIES_PAGE_SIZE: u32 = 200;
/// Page size for `users.list`.
pub const USERS_PAGE_SIZE: u32 = 200;

const TRUSTED_HOST_SUFFIXES: &[&str] = &["slack.com", "slack-edge.com"];

const AUTH_ERRORS: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "token_revoked",
    "token_expired",
    "account_inactive",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub next_cursor: Option<String>,
}

fn next_cursor(meta: &Option<ResponseMetadata>) -> Option<&str> {
    meta.as_ref()
        .and_then(|m| m.next_cursor.as_deref())
        .filter(|c| !c.is_empty())
}

/// One page of `conversations.history` or `conversations.replies`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

impl MessagePage {
    /// Cursor for the next page, if the API reports one.
    pub fn next_cursor(&self) -> Option<&str> {
        if self.has_more {
            next_cursor(&self.response_metadata)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub profile: Option<UserProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsersPage {
    #[serde(default)]
    pub members: Vec<UserRecord>,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

impl UsersPage {
    pub fn next_cursor(&self) -> Option<&str> {
        next_cursor(&self.response_metadata)
    }
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    user: UserRecord,
}

#[derive(Debug, Deserialize)]
struct FileInfoResponse {
    file: RawFile,
}

/// Raw response to a file download, whatever its status.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FetchedFile {
    /// An HTML body where a file was expected usually means a login page.
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
    }
}

/// Minimal Slack Web API client.
///
/// Every call is a GET to `{api_url}/{method}` authenticated with the bearer
/// token, plus the `d` session cookie when one is configured.
#[derive(Debug, Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    cookie: Option<String>,
}

impl SlackClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_api_url(token, DEFAULT_API_URL)
    }

    pub fn with_api_url(token: impl Into<String>, api_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            cookie: None,
        })
    }

    /// Attach the `d` session cookie web client tokens need.
    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie.filter(|c| !c.is_empty()).map(|c| {
            if c.starts_with("d=") {
                c
            } else {
                format!("d={}", c)
            }
        });
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.bearer_auth(&self.token);
        match &self.cookie {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }

    /// Call a Web API method and return the raw JSON body.
    pub async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<serde_json::Value> {
        let url = Url::parse_with_params(&format!("{}/{}", self.api_url, method), params)
            .map_err(|e| AppError::Http(format!("invalid API url for {}: {}", method, e)))?;

        tracing::debug!(method, "slack api call");
        let response = self.authorize(self.http.get(url)).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0);
            return Err(AppError::SlackRateLimit { retry_after_secs });
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::Auth(format!("{}: HTTP {}", method, status)));
        }
        if !status.is_success() {
            return Err(AppError::Http(format!("{}: HTTP {}", method, status)));
        }

        let body: serde_json::Value = response.json().await?;
        check_ok(method, &body)?;
        Ok(body)
    }

    async fn call_typed<T: DeserializeOwned>(&self, method: &str, params: &[(&str, String)]) -> Result<T> {
        let body = self.call(method, params).await?;
        serde_json::from_value(body)
            .map_err(|e| AppError::JsonParse(format!("{} response: {}", method, e)))
    }

    pub async fn conversations_history(
        &self,
        channel: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<MessagePage> {
        let mut params = vec![
            ("channel", channel.to_string()),
            ("limit", HISTORY_PAGE_SIZE.to_string()),
        ];
        if let Some(oldest) = oldest {
            params.push(("oldest", oldest.to_string()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        self.call_typed("conversations.history", &params).await
    }

    pub async fn conversations_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        oldest: Option<&str>,
    ) -> Result<MessagePage> {
        let mut params = vec![
            ("channel", channel.to_string()),
            ("ts", thread_ts.to_string()),
            ("limit", REPLIES_PAGE_SIZE.to_string()),
        ];
        if let Some(oldest) = oldest {
            params.push(("oldest", oldest.to_string()));
        }
        self.call_typed("conversations.replies", &params).await
    }

    pub async fn users_list(&self, cursor: Option<&str>) -> Result<UsersPage> {
        let mut params = vec![("limit", USERS_PAGE_SIZE.to_string())];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        self.call_typed("users.list", &params).await
    }

    pub async fn users_info(&self, user: &str) -> Result<UserRecord> {
        let response: UserInfoResponse = self
            .call_typed("users.info", &[("user", user.to_string())])
            .await?;
        Ok(response.user)
    }

    pub async fn files_info(&self, file_id: &str) -> Result<RawFile> {
        let response: FileInfoResponse = self
            .call_typed("files.info", &[("file", file_id.to_string())])
            .await?;
        Ok(response.file)
    }

    /// Whether `url` points at a Slack-owned host that should receive the token.
    pub fn is_trusted_url(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let api_host = Url::parse(&self.api_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        if api_host.as_deref() == Some(host) {
            return true;
        }
        TRUSTED_HOST_SUFFIXES
            .iter()
            .any(|suffix| host == *suffix || host.ends_with(&format!(".{}", suffix)))
    }

    /// Download a file, authenticating only against trusted hosts.
    pub async fn fetch_file(&self, url: &str) -> Result<FetchedFile> {
        self.fetch_file_via(&self.http, url).await
    }

    /// Like [`fetch_file`](Self::fetch_file) but through another HTTP client.
    pub async fn fetch_file_via(&self, http: &reqwest::Client, url: &str) -> Result<FetchedFile> {
        let mut request = http.get(url);
        if self.is_trusted_url(url) {
            request = self.authorize(request);
        }
        let response = request.send().await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedFile {
            status,
            content_type,
            bytes,
        })
    }
}

fn check_ok(method: &str, body: &serde_json::Value) -> Result<()> {
    if body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Ok(());
    }
    let error = body
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown_error");
    if error == "ratelimited" {
        return Err(AppError::SlackRateLimit { retry_after_secs: 0 });
    }
    if AUTH_ERRORS.contains(&error) {
        return Err(AppError::Auth(format!("{}: {}", method, error)));
    }
    Err(AppError::SlackApi(format!("{}: {}", method, error)))
}
