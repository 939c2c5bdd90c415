use std::collections::BTreeMap;
use std::time::Duration;

/// One outbound request. Immutable once handed to the client; the optional
/// fields override the client-level settings for this request only.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: reqwest::Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub min_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub max_attempts: Option<u32>,
    pub backoff_factor: Option<f64>,
    pub timeout: Option<f64>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: reqwest::Method::GET,
            headers: BTreeMap::new(),
            body: None,
            min_delay: None,
            max_delay: None,
            max_attempts: None,
            backoff_factor: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        let mut request = Self::get(url);
        request.method = reqwest::Method::POST;
        request.body = Some(body);
        request
    }

    /// Header names are canonicalized to lowercase so overrides line up with
    /// the client's header context.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_delay_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_delay = Some(min);
        self.max_delay = Some(max);
        self
    }
}

/// One fetched response. `headers` preserves wire order; lookups are
/// case-insensitive on the first match.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Body decoded according to its content-encoding. Decoding failures
    /// produce a diagnostic placeholder instead of an error.
    pub text: String,
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
