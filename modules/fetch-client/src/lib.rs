//! Resilient fetch client with two interchangeable transports.
//!
//! The direct transport is a plain HTTP client that replays a captured
//! browser fingerprint; the browser transport drives headless Chromium for
//! targets that reject plain HTTP. Both share one cookie jar and one header
//! context so a session started on either transport continues on the other.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};
use url::Url;

pub mod browser;
pub mod challenge;
pub mod cookies;
pub mod decode;
pub mod error;
pub mod headers;
pub mod request;

pub use challenge::{ChallengeDetector, MarkerDetector};
pub use cookies::{CookieJar, CookieRecord};
pub use error::{FetchError, Result};
pub use headers::HeaderContext;
pub use request::{HttpRequest, HttpResponse};

const MAX_REDIRECTS: usize = 10;

/// Fraction of the computed retry wait added as random jitter.
const JITTER_FRACTION: f64 = 0.25;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Direct HTTP, falling back to the browser when rate-limited out.
    #[default]
    Auto,
    Direct,
    Browser,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "direct" => Ok(Self::Direct),
            "browser" => Ok(Self::Browser),
            other => Err(format!("unknown transport mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: f64,
    pub min_delay: f64,
    pub max_delay: f64,
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub transport: TransportMode,
    pub use_captured_headers: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: 30.0,
            min_delay: 0.0,
            max_delay: 0.0,
            max_attempts: 3,
            backoff_factor: 1.5,
            transport: TransportMode::Auto,
            use_captured_headers: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct FetchClient {
    settings: HttpSettings,
    headers: HeaderContext,
    jar: CookieJar,
    detector: Arc<dyn ChallengeDetector>,
    client: reqwest::Client,
}

impl FetchClient {
    /// Build the client from its two persistence files. Creates parent
    /// directories and, on a fresh install, writes the initial header
    /// snapshot so the session's fingerprint is inspectable on disk.
    pub fn new(
        settings: HttpSettings,
        header_jar: &Path,
        cookie_jar: &Path,
        fallback_headers: &BTreeMap<String, String>,
    ) -> Result<Self> {
        for path in [header_jar, cookie_jar] {
            if let Some(parent) = path.parent() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    warn!(path = %parent.display(), error = %err, "State dir creation failed");
                }
            }
        }

        let mut jar = CookieJar::load(cookie_jar);
        let (mut headers, captured) =
            HeaderContext::build(header_jar, fallback_headers, settings.use_captured_headers);

        // A cookie captured alongside the snapshot belongs to the site the
        // session was recorded on; the referer names that site.
        if let Some(cookie) = captured.cookie {
            let domain = captured
                .referer
                .as_deref()
                .and_then(|referer| Url::parse(referer).ok())
                .and_then(|url| url.host_str().map(str::to_lowercase));
            match domain {
                Some(domain) => {
                    jar.merge_pairs(&domain, &cookie);
                    if let Err(err) = jar.save() {
                        warn!(error = %err, "Cookie jar save failed");
                    }
                }
                None => debug!("Captured cookie has no referer domain, dropping"),
            }
        }
        headers.persist();

        // Redirects are followed manually so cookies can be recomputed and
        // Set-Cookie ingested per hop.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;

        Ok(Self {
            settings,
            headers,
            jar,
            detector: Arc::new(MarkerDetector::default()),
            client,
        })
    }

    pub fn with_detector(mut self, detector: Arc<dyn ChallengeDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn header_context(&self) -> &HeaderContext {
        &self.headers
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.jar
    }

    /// Fetch per the configured transport. `Auto` tries the direct
    /// transport and falls back to the browser only when retries are
    /// exhausted on 429, which is the signature of an anti-bot layer rather
    /// than a broken site.
    pub async fn fetch(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        match self.settings.transport {
            TransportMode::Direct => self.fetch_direct(request).await,
            TransportMode::Browser => self.fetch_browser(request).await,
            TransportMode::Auto => match self.fetch_direct(request).await {
                Err(err) if err.is_too_many_requests() => {
                    info!(url = %request.url, "Rate limited on direct transport, switching to browser");
                    self.fetch_browser(request).await
                }
                other => other,
            },
        }
    }

    pub async fn fetch_browser(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = parse_url(&request.url)?;
        let merged = self.headers.merged_with(&request.headers);
        let timeout = request.timeout.unwrap_or(self.settings.timeout);

        let (response, sent_headers) = browser::fetch_with_browser(
            &url,
            browser::BrowserFetch {
                headers: &merged,
                jar: &mut self.jar,
                detector: self.detector.as_ref(),
                timeout: Duration::from_secs_f64(timeout),
            },
        )
        .await?;

        // The headers Chromium actually sent are the most faithful
        // fingerprint available; adopt them as the new snapshot.
        if let Some(snapshot) = sent_headers {
            self.headers.update_from_capture(&snapshot);
        }
        self.refresh_cookie_header(&url);
        Ok(response)
    }

    pub async fn fetch_direct(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = parse_url(&request.url)?;
        let max_attempts = request.max_attempts.unwrap_or(self.settings.max_attempts).max(1);
        let backoff_factor = request
            .backoff_factor
            .unwrap_or(self.settings.backoff_factor);

        self.pre_request_delay(request).await;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = self.execute_once(&url, request).await;
            match outcome {
                Err(err) if err.is_too_many_requests() && attempt < max_attempts => {
                    let retry_after = match &err {
                        FetchError::Status { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    let wait = compute_retry_wait(retry_after, backoff_factor, attempt);
                    info!(
                        url = %request.url,
                        attempt,
                        max_attempts,
                        wait_secs = format!("{wait:.2}"),
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Err(err) => return Err(err),
                Ok(response) => {
                    if let Err(save_err) = self.jar.save() {
                        warn!(error = %save_err, "Cookie jar save failed");
                    }
                    self.refresh_cookie_header(&url);
                    return Ok(response);
                }
            }
        }
    }

    /// One request including manual redirect following. Set-Cookie headers
    /// are ingested and the cookie header recomputed on every hop.
    async fn execute_once(&mut self, url: &Url, request: &HttpRequest) -> Result<HttpResponse> {
        let timeout = request.timeout.unwrap_or(self.settings.timeout);
        let merged = self.headers.merged_with(&request.headers);
        let start = Instant::now();

        let mut current_url = url.clone();
        let mut method = request.method.clone();
        let mut body = request.body.clone();

        for _hop in 0..=MAX_REDIRECTS {
            let mut builder = self
                .client
                .request(method.clone(), current_url.clone())
                .timeout(Duration::from_secs_f64(timeout));
            for (name, value) in &merged {
                if name == "cookie" {
                    continue;
                }
                builder = builder.header(name, value);
            }
            if let Some(cookie_header) = self.jar.cookie_header_for(&current_url) {
                builder = builder.header("cookie", cookie_header);
            }
            if let Some(payload) = &body {
                builder = builder.body(payload.clone());
            }

            let response = builder
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(err, timeout))?;

            let status = response.status();
            let response_headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();

            for (name, value) in &response_headers {
                if name.eq_ignore_ascii_case("set-cookie") {
                    self.jar.store_set_cookie(value, &current_url);
                }
            }

            if status.is_redirection() {
                let location = response_headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("location"))
                    .map(|(_, value)| value.clone());
                let Some(location) = location else {
                    return Err(FetchError::Network(format!(
                        "redirect status {status} without location header"
                    )));
                };
                current_url = current_url.join(&location).map_err(|err| {
                    FetchError::InvalidUrl {
                        url: location,
                        reason: err.to_string(),
                    }
                })?;
                // 301/302/303 rewrite non-GET to GET; 307/308 preserve.
                if matches!(status.as_u16(), 301 | 302 | 303) && method != reqwest::Method::GET {
                    method = reqwest::Method::GET;
                    body = None;
                }
                debug!(status = status.as_u16(), location = %current_url, "Following redirect");
                continue;
            }

            let raw = response
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(err, timeout))?
                .to_vec();
            let encoding = response_headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-encoding"))
                .map(|(_, value)| value.as_str())
                .unwrap_or("");
            let text = decode::decode_body(&raw, encoding);

            if status.as_u16() >= 400 {
                let retry_after = response_headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
                    .and_then(|(_, value)| value.trim().parse::<f64>().ok());
                let mut snippet = text.clone();
                snippet.truncate(500);
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    body: snippet,
                    retry_after,
                });
            }

            return Ok(HttpResponse {
                url: current_url.to_string(),
                status: status.as_u16(),
                headers: response_headers,
                body: raw,
                text,
                elapsed: start.elapsed(),
            });
        }

        Err(FetchError::TooManyRedirects(MAX_REDIRECTS))
    }

    async fn pre_request_delay(&self, request: &HttpRequest) {
        let min = request.min_delay.unwrap_or(self.settings.min_delay);
        let max = request.max_delay.unwrap_or(self.settings.max_delay).max(min);
        if max <= 0.0 {
            return;
        }
        let delay = if max > min {
            rand::rng().random_range(min..max)
        } else {
            min
        };
        if delay > 0.0 {
            debug!(delay_secs = format!("{delay:.2}"), "Pre-request delay");
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    /// Keep the header context's cookie aligned with the jar so browser
    /// launches replay the current session.
    fn refresh_cookie_header(&mut self, url: &Url) {
        let header = self.jar.cookie_header_for(url);
        if self.headers.cookie() != header.as_deref() {
            self.headers.set_cookie(header);
        }
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|err| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Server hint wins over the computed backoff; either way a random jitter
/// of up to 25% is added so synchronized clients do not stampede.
fn compute_retry_wait(retry_after: Option<f64>, backoff_factor: f64, attempt: u32) -> f64 {
    let base = retry_after
        .filter(|secs| *secs > 0.0)
        .unwrap_or_else(|| backoff_factor * attempt as f64);
    if base <= 0.0 {
        return 0.0;
    }
    base + rand::rng().random_range(0.0..(JITTER_FRACTION * base))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback_headers() -> BTreeMap<String, String> {
        BTreeMap::from([("user-agent".to_string(), "TestAgent/1.0".to_string())])
    }

    fn client_in(dir: &tempfile::TempDir, settings: HttpSettings) -> FetchClient {
        FetchClient::new(
            settings,
            &dir.path().join("state/headers.json"),
            &dir.path().join("state/cookies.txt"),
            &fallback_headers(),
        )
        .unwrap()
    }

    #[test]
    fn transport_mode_parses() {
        assert_eq!("auto".parse::<TransportMode>().unwrap(), TransportMode::Auto);
        assert_eq!(" Browser ".parse::<TransportMode>().unwrap(), TransportMode::Browser);
        assert!("carrier-pigeon".parse::<TransportMode>().is_err());
    }

    #[test]
    fn retry_wait_prefers_server_hint_with_bounded_jitter() {
        for _ in 0..50 {
            let wait = compute_retry_wait(Some(8.0), 1.5, 1);
            assert!((8.0..10.0).contains(&wait), "wait out of range: {wait}");
        }
    }

    #[test]
    fn retry_wait_scales_linearly_without_hint() {
        for attempt in 1..=3u32 {
            let base = 1.5 * attempt as f64;
            for _ in 0..20 {
                let wait = compute_retry_wait(None, 1.5, attempt);
                assert!(wait >= base && wait < base * 1.25, "wait out of range: {wait}");
            }
        }
    }

    #[test]
    fn retry_wait_zero_backoff_never_negative() {
        assert_eq!(compute_retry_wait(None, 0.0, 1), 0.0);
        assert_eq!(compute_retry_wait(Some(-3.0), 0.0, 2), 0.0);
    }

    #[test]
    fn fresh_install_persists_header_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let _client = client_in(&dir, HttpSettings::default());
        let snapshot = dir.path().join("state/headers.json");
        assert!(snapshot.is_file());
        let saved: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&snapshot).unwrap()).unwrap();
        assert_eq!(saved.get("user-agent").map(String::as_str), Some("TestAgent/1.0"));
    }

    #[test]
    fn captured_cookie_is_merged_into_jar() {
        let dir = tempfile::tempdir().unwrap();
        let header_jar = dir.path().join("state/headers.json");
        std::fs::create_dir_all(header_jar.parent().unwrap()).unwrap();
        std::fs::write(
            &header_jar,
            serde_json::json!({
                "user-agent": "CapturedAgent/2.0",
                "cookie": "kp=abc; sid=1",
                "referer": "https://www.example.com/listing"
            })
            .to_string(),
        )
        .unwrap();

        let client = client_in(&dir, HttpSettings::default());
        assert_eq!(client.cookie_jar().len(), 2);
        let url = Url::parse("https://www.example.com/").unwrap();
        let header = client.cookie_jar().cookie_header_for(&url).unwrap();
        assert!(header.contains("kp=abc") && header.contains("sid=1"));
    }

    #[tokio::test]
    async fn direct_fetch_retries_429_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/article")
            .with_status(429)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/article")
            .with_status(200)
            .with_body("content")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut client = client_in(
            &dir,
            HttpSettings {
                backoff_factor: 0.0,
                transport: TransportMode::Direct,
                ..HttpSettings::default()
            },
        );
        let response = client
            .fetch(&HttpRequest::get(format!("{}/article", server.url())))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.text, "content");
        limited.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn direct_fetch_exhausts_429_retries() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/blocked")
            .with_status(429)
            .expect(2)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut client = client_in(
            &dir,
            HttpSettings {
                max_attempts: 2,
                backoff_factor: 0.0,
                transport: TransportMode::Direct,
                ..HttpSettings::default()
            },
        );
        let err = client
            .fetch(&HttpRequest::get(format!("{}/blocked", server.url())))
            .await
            .unwrap_err();
        assert!(err.is_too_many_requests());
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let mut server = mockito::Server::new_async().await;
        let gone = server
            .mock("GET", "/gone")
            .with_status(404)
            .with_body("not here")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut client = client_in(
            &dir,
            HttpSettings {
                transport: TransportMode::Direct,
                ..HttpSettings::default()
            },
        );
        let err = client
            .fetch(&HttpRequest::get(format!("{}/gone", server.url())))
            .await
            .unwrap_err();
        match err {
            FetchError::Status {
                status: 404, body, ..
            } => assert!(body.contains("not here")),
            other => panic!("unexpected error: {other}"),
        }
        gone.assert_async().await;
    }

    #[tokio::test]
    async fn set_cookie_round_trips_into_next_request() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/login")
            .with_status(200)
            .with_header("set-cookie", "sid=s3cret; Path=/")
            .create_async()
            .await;
        let follow_up = server
            .mock("GET", "/account")
            .match_header("cookie", "sid=s3cret")
            .with_status(200)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut client = client_in(
            &dir,
            HttpSettings {
                transport: TransportMode::Direct,
                ..HttpSettings::default()
            },
        );
        client
            .fetch(&HttpRequest::get(format!("{}/login", server.url())))
            .await
            .unwrap();
        client
            .fetch(&HttpRequest::get(format!("{}/account", server.url())))
            .await
            .unwrap();
        follow_up.assert_async().await;
    }

    #[tokio::test]
    async fn redirects_are_followed_manually() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/old")
            .with_status(302)
            .with_header("location", "/new")
            .create_async()
            .await;
        server
            .mock("GET", "/new")
            .with_status(200)
            .with_body("landed")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut client = client_in(
            &dir,
            HttpSettings {
                transport: TransportMode::Direct,
                ..HttpSettings::default()
            },
        );
        let response = client
            .fetch(&HttpRequest::get(format!("{}/old", server.url())))
            .await
            .unwrap();
        assert_eq!(response.text, "landed");
        assert!(response.url.ends_with("/new"));
    }

    #[tokio::test]
    async fn gzip_body_is_decoded() {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"compressed article").unwrap();
        let payload = encoder.finish().unwrap();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/gz")
            .with_status(200)
            .with_header("content-encoding", "gzip")
            .with_body(payload)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut client = client_in(
            &dir,
            HttpSettings {
                transport: TransportMode::Direct,
                ..HttpSettings::default()
            },
        );
        let response = client
            .fetch(&HttpRequest::get(format!("{}/gz", server.url())))
            .await
            .unwrap();
        assert_eq!(response.text, "compressed article");
    }
}
