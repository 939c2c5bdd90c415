use thiserror::Error;

pub type Result<T> = std::result::Result<T, WeChatError>;

/// Error codes that mean the cached access token is no longer valid and a
/// refresh should be attempted before failing the call.
pub(crate) const TOKEN_ERRCODES: [i64; 3] = [40001, 40014, 42001];

#[derive(Debug, Error)]
pub enum WeChatError {
    #[error("WeChat API error {errcode}: {errmsg}")]
    Api { errcode: i64, errmsg: String },

    #[error("WeChat HTTP error (status {status}): {body}")]
    Http { status: u16, body: String },

    #[error("WeChat network error: {0}")]
    Network(String),

    #[error("Token cache error at {path}: {source}")]
    TokenCache {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Media file unreadable at {path}: {source}")]
    MediaRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl WeChatError {
    /// Whether this failure indicates a stale access token.
    pub fn is_token_expired(&self) -> bool {
        matches!(self, WeChatError::Api { errcode, .. } if TOKEN_ERRCODES.contains(errcode))
    }
}
