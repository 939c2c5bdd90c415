//! WeChat Official Account client.
//!
//! Publishing needs three calls: fetch an access token (cached on disk),
//! upload article images as permanent material, and create a draft. Calls
//! that fail with a stale-token error code refresh the token once and
//! retry before surfacing the failure.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod error;
pub mod token;

pub use error::{Result, WeChatError};
pub use token::TokenCache;

const DEFAULT_BASE_URL: &str = "https://api.weixin.qq.com";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    media_id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Deserialize)]
struct DraftResponse {
    #[serde(default)]
    media_id: String,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Permanent material handle returned by an image upload.
#[derive(Debug, Clone)]
pub struct UploadedMedia {
    pub media_id: String,
    pub url: String,
}

/// One article in a draft submission.
#[derive(Debug, Clone, Serialize)]
pub struct DraftArticle {
    pub title: String,
    pub content: String,
    pub thumb_media_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub need_open_comment: u8,
    pub only_fans_can_comment: u8,
}

impl DraftArticle {
    pub fn new(title: impl Into<String>, content: impl Into<String>, thumb_media_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            thumb_media_id: thumb_media_id.into(),
            author: None,
            digest: None,
            need_open_comment: 0,
            only_fans_can_comment: 0,
        }
    }
}

#[derive(Debug, Serialize)]
struct DraftRequest<'a> {
    articles: &'a [DraftArticle],
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct WeChatClient {
    app_id: String,
    app_secret: String,
    http: reqwest::Client,
    base_url: String,
    tokens: TokenCache,
}

impl WeChatClient {
    pub fn new(app_id: &str, app_secret: &str, token_cache: &Path) -> Self {
        Self {
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            tokens: TokenCache::new(token_cache),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Cached token, or a fresh one from the credentials endpoint.
    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.tokens.current() {
            return Ok(token);
        }
        self.refresh_token().await
    }

    async fn refresh_token(&self) -> Result<String> {
        let url = format!(
            "{}/cgi-bin/token?grant_type=client_credential&appid={}&secret={}",
            self.base_url, self.app_id, self.app_secret
        );
        debug!("Fetching WeChat access token");
        let response = self.get_json::<TokenResponse>(&url).await?;
        if response.errcode != 0 {
            return Err(WeChatError::Api {
                errcode: response.errcode,
                errmsg: response.errmsg,
            });
        }
        self.tokens.store(&response.access_token, response.expires_in)?;
        info!(expires_in = response.expires_in, "WeChat access token refreshed");
        Ok(response.access_token)
    }

    /// Upload an image as permanent material. Stale-token failures refresh
    /// once and retry.
    pub async fn upload_image(&self, path: &Path) -> Result<UploadedMedia> {
        match self.upload_image_once(path).await {
            Err(err) if err.is_token_expired() => {
                warn!(error = %err, "Access token rejected, refreshing and retrying upload");
                self.tokens.invalidate();
                self.upload_image_once(path).await
            }
            other => other,
        }
    }

    async fn upload_image_once(&self, path: &Path) -> Result<UploadedMedia> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/cgi-bin/material/add_material?access_token={}&type=image",
            self.base_url, token
        );

        let bytes = std::fs::read(path).map_err(|source| WeChatError::MediaRead {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("media", part);

        debug!(path = %path.display(), "Uploading image material");
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| WeChatError::Network(err.to_string()))?;
        let parsed: UploadResponse = Self::decode(response).await?;
        if parsed.errcode != 0 {
            return Err(WeChatError::Api {
                errcode: parsed.errcode,
                errmsg: parsed.errmsg,
            });
        }
        info!(media_id = %parsed.media_id, "Image material uploaded");
        Ok(UploadedMedia {
            media_id: parsed.media_id,
            url: parsed.url,
        })
    }

    /// Create a draft from `articles`; returns the draft's media id.
    pub async fn create_draft(&self, articles: &[DraftArticle]) -> Result<String> {
        match self.create_draft_once(articles).await {
            Err(err) if err.is_token_expired() => {
                warn!(error = %err, "Access token rejected, refreshing and retrying draft");
                self.tokens.invalidate();
                self.create_draft_once(articles).await
            }
            other => other,
        }
    }

    async fn create_draft_once(&self, articles: &[DraftArticle]) -> Result<String> {
        let token = self.access_token().await?;
        let url = format!("{}/cgi-bin/draft/add?access_token={}", self.base_url, token);

        debug!(articles = articles.len(), "Creating draft");
        let response = self
            .http
            .post(&url)
            .json(&DraftRequest { articles })
            .send()
            .await
            .map_err(|err| WeChatError::Network(err.to_string()))?;
        let parsed: DraftResponse = Self::decode(response).await?;
        if parsed.errcode != 0 {
            return Err(WeChatError::Api {
                errcode: parsed.errcode,
                errmsg: parsed.errmsg,
            });
        }
        info!(media_id = %parsed.media_id, "Draft created");
        Ok(parsed.media_id)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| WeChatError::Network(err.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(500);
            return Err(WeChatError::Http {
                status: status.as_u16(),
                body,
            });
        }
        // The API reports errors as 200 + errcode, so decode first and let
        // callers inspect the code.
        response
            .json()
            .await
            .map_err(|err| WeChatError::Network(err.to_string()))
    }
}
