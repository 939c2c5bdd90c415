//! Browser transport.
//!
//! Drives a headless Chromium via CDP for targets whose anti-bot layer
//! rejects plain HTTP. The session replays the shared header context and
//! cookie jar, applies stealth patches before any page script runs, and
//! harvests cookies back into the jar on the way out.

use std::collections::BTreeMap;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventRequestWillBeSent, EventResponseReceived, Headers,
    SetExtraHttpHeadersParams, TimeSinceEpoch,
};
use chromiumoxide::Page;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::cookies::{CookieJar, CookieRecord};
use crate::error::{FetchError, Result};
use crate::request::HttpResponse;

/// Reloads attempted when the detector flags a challenge interstitial.
const MAX_CHALLENGE_RELOADS: u32 = 3;

/// Extra wait after the navigation settles, for late-loading content.
const SETTLE_WAIT: Duration = Duration::from_millis(2000);

const CHALLENGE_RELOAD_WAIT: Duration = Duration::from_secs(3);

/// Request headers the browser is allowed to override; everything else is
/// left to Chromium so the fingerprint stays self-consistent.
const BROWSER_HEADER_ALLOW_LIST: [&str; 11] = [
    "referer",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-user",
    "upgrade-insecure-requests",
    "pragma",
    "cache-control",
];

/// Installed before any page script runs; hides the obvious automation
/// fingerprints (webdriver flag, missing chrome object, empty plugin list,
/// SwiftShader GL strings).
const STEALTH_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
const getParameter = WebGLRenderingContext.prototype.getParameter;
WebGLRenderingContext.prototype.getParameter = function (parameter) {
    if (parameter === 37445) { return 'Intel Inc.'; }
    if (parameter === 37446) { return 'Intel Iris OpenGL Engine'; }
    return getParameter.call(this, parameter);
};
Object.defineProperty(screen, 'width', { get: () => 1920 });
Object.defineProperty(screen, 'height', { get: () => 1080 });
"#;

/// One launched Chromium plus the event-handler task that keeps its CDP
/// connection pumping. The handler task is aborted on drop; `close` is the
/// preferred shutdown path because it also terminates the browser process.
pub struct BrowserSession {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
}

impl BrowserSession {
    pub async fn launch() -> Result<Self> {
        let config = BrowserConfig::builder()
            .window_size(1920, 1080)
            .no_sandbox()
            .args(vec![
                "--disable-dev-shm-usage",
                "--disable-blink-features=AutomationControlled",
            ])
            .build()
            .map_err(FetchError::BrowserUnavailable)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| FetchError::BrowserUnavailable(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Browser event handler error");
                }
            }
        });

        Ok(Self {
            browser,
            handler_task,
        })
    }

    pub async fn close(mut self) {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Browser close failed");
        }
        if let Err(err) = self.browser.wait().await {
            debug!(error = %err, "Browser wait failed");
        }
        self.handler_task.abort();
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

/// CDP cookie as reported by `Network.getCookies`, decoded structurally so
/// a protocol field rename cannot panic the harvest.
#[derive(Debug, Deserialize)]
struct CdpCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    #[serde(default)]
    expires: f64,
    #[serde(default)]
    secure: bool,
    #[serde(default, rename = "httpOnly")]
    http_only: bool,
}

pub struct BrowserFetch<'a> {
    pub headers: &'a BTreeMap<String, String>,
    pub jar: &'a mut CookieJar,
    pub detector: &'a dyn crate::challenge::ChallengeDetector,
    pub timeout: Duration,
}

/// Fetch `url` through a fresh browser session. Returns the response plus
/// the request headers Chromium actually sent on the navigation, so the
/// caller can refresh its header snapshot with a real fingerprint.
pub async fn fetch_with_browser(
    url: &Url,
    ctx: BrowserFetch<'_>,
) -> Result<(HttpResponse, Option<BTreeMap<String, String>>)> {
    let session = BrowserSession::launch().await?;
    let outcome = navigate(&session, url, &ctx).await;
    session.close().await;
    let (page_status, body, harvested, sent_headers) = outcome?;

    for cookie in harvested {
        ctx.jar.upsert(cookie);
    }
    if let Err(err) = ctx.jar.save() {
        warn!(error = %err, "Cookie jar save failed after browser fetch");
    }

    let response = HttpResponse {
        url: url.to_string(),
        status: page_status,
        headers: Vec::new(),
        body: body.clone().into_bytes(),
        text: body,
        elapsed: Duration::ZERO,
    };
    Ok((response, sent_headers))
}

async fn navigate(
    session: &BrowserSession,
    url: &Url,
    ctx: &BrowserFetch<'_>,
) -> Result<(u16, String, Vec<CookieRecord>, Option<BTreeMap<String, String>>)> {
    let page = session
        .browser
        .new_page("about:blank")
        .await
        .map_err(|err| FetchError::Browser(err.to_string()))?;

    page.evaluate_on_new_document(STEALTH_INIT_SCRIPT.to_string())
        .await
        .map_err(|err| FetchError::Browser(err.to_string()))?;

    if let Some(agent) = ctx.headers.get("user-agent") {
        page.set_user_agent(agent.clone())
            .await
            .map_err(|err| FetchError::Browser(err.to_string()))?;
    }

    apply_extra_headers(&page, ctx.headers).await?;
    seed_cookies(&page, url, ctx.jar).await;

    // Subscribe before navigating so the document request and response are
    // not missed.
    let status_task = spawn_status_capture(&page).await;
    let header_task = spawn_header_capture(&page).await;

    let start = std::time::Instant::now();
    tokio::time::timeout(ctx.timeout, page.goto(url.as_str()))
        .await
        .map_err(|_| FetchError::Timeout(ctx.timeout.as_secs_f64()))?
        .map_err(|err| FetchError::Browser(err.to_string()))?;
    wait_for_page_settled(&page, ctx.timeout).await;

    let mut status = resolve_status(status_task).await;
    let mut body = page_body(&page).await?;

    // Challenge pages usually clear after the anti-bot script sets its
    // cookies; bounded reloads give it that chance.
    let mut reloads = 0;
    while reloads < MAX_CHALLENGE_RELOADS && ctx.detector.is_challenge(&body, status) {
        reloads += 1;
        info!(url = %url, attempt = reloads, "Challenge detected, reloading");
        tokio::time::sleep(CHALLENGE_RELOAD_WAIT).await;

        let reload_status_task = spawn_status_capture(&page).await;
        let reloaded = tokio::time::timeout(ctx.timeout, page.reload()).await;
        match reloaded {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "Challenge reload failed");
                break;
            }
            Err(_) => {
                debug!("Challenge reload timed out");
                break;
            }
        }
        wait_for_page_settled(&page, ctx.timeout).await;
        status = resolve_status(reload_status_task).await;
        body = page_body(&page).await?;
    }

    let sent_headers = match header_task {
        Some(task) => match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(headers)) => headers,
            _ => None,
        },
        None => None,
    };

    let harvested = harvest_cookies(&page).await;
    debug!(
        url = %url,
        status,
        cookies = harvested.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Browser fetch complete"
    );

    if let Err(err) = page.close().await {
        debug!(error = %err, "Page close failed");
    }

    Ok((status, body, harvested, sent_headers))
}

/// Capture the headers of the first outbound request, which is always the
/// navigation itself.
async fn spawn_header_capture(
    page: &Page,
) -> Option<tokio::task::JoinHandle<Option<BTreeMap<String, String>>>> {
    let mut events = match page.event_listener::<EventRequestWillBeSent>().await {
        Ok(events) => events,
        Err(err) => {
            debug!(error = %err, "Request event subscription failed");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        tokio::select! {
            event = events.next() => event.map(|event| headers_to_map(&event.request.headers)),
            _ = &mut deadline => None,
        }
    }))
}

fn headers_to_map(headers: &Headers) -> BTreeMap<String, String> {
    let Ok(serde_json::Value::Object(map)) = serde_json::to_value(headers) else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(name, value)| value.as_str().map(|v| (name, v.to_string())))
        .collect()
}

async fn apply_extra_headers(page: &Page, headers: &BTreeMap<String, String>) -> Result<()> {
    let allowed: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .filter(|(name, _)| BROWSER_HEADER_ALLOW_LIST.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), json!(value)))
        .collect();
    if allowed.is_empty() {
        return Ok(());
    }
    page.execute(SetExtraHttpHeadersParams {
        headers: Headers::new(serde_json::Value::Object(allowed)),
    })
    .await
    .map_err(|err| FetchError::Browser(err.to_string()))?;
    Ok(())
}

/// Seed the page with every jar cookie scoped to the target host. Seeding
/// is best-effort; a rejected cookie is logged and skipped.
async fn seed_cookies(page: &Page, url: &Url, jar: &CookieJar) {
    let Some(host) = url.host_str().map(str::to_lowercase) else {
        return;
    };
    let mut params = Vec::new();
    for record in jar.records() {
        let bare = record.domain.trim_start_matches('.');
        if host != bare && !host.ends_with(&format!(".{bare}")) {
            continue;
        }
        let mut builder = CookieParam::builder()
            .name(record.name.clone())
            .value(record.value.clone())
            .domain(record.domain.clone())
            .path(record.path.clone())
            .secure(record.secure)
            .http_only(record.http_only);
        if let Some(expires) = record.expires {
            builder = builder.expires(TimeSinceEpoch::new(expires as f64));
        }
        match builder.build() {
            Ok(param) => params.push(param),
            Err(err) => debug!(cookie = %record.name, error = %err, "Cookie seed rejected"),
        }
    }
    if params.is_empty() {
        return;
    }
    let seeded = params.len();
    if let Err(err) = page.set_cookies(params).await {
        warn!(error = %err, "Cookie seeding failed");
    } else {
        debug!(cookies = seeded, "Cookies seeded into browser session");
    }
}

/// Capture the status of the first HTML document response; redirects are
/// handled by not matching on the exact URL.
async fn spawn_status_capture(
    page: &Page,
) -> Option<tokio::task::JoinHandle<Option<u16>>> {
    let mut events = match page.event_listener::<EventResponseReceived>().await {
        Ok(events) => events,
        Err(err) => {
            debug!(error = %err, "Response event subscription failed");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else { return None };
                    let mime = event.response.mime_type.to_lowercase();
                    if mime.starts_with("text/html") || mime.starts_with("application/xhtml+xml") {
                        return Some(event.response.status as u16);
                    }
                }
                _ = &mut deadline => return None,
            }
        }
    }))
}

async fn resolve_status(task: Option<tokio::task::JoinHandle<Option<u16>>>) -> u16 {
    let Some(task) = task else { return 200 };
    match tokio::time::timeout(Duration::from_secs(5), task).await {
        Ok(Ok(Some(status))) => status,
        _ => 200,
    }
}

/// Wait for the navigation to go idle, falling back to polling
/// `document.readyState` when the lifecycle event never fires (common on
/// pages with long-polling analytics).
async fn wait_for_page_settled(page: &Page, timeout: Duration) {
    let settled = tokio::time::timeout(timeout, page.wait_for_navigation()).await;
    if settled.is_err() {
        for _ in 0..10 {
            let ready = page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|result| result.into_value::<String>().ok());
            if ready.as_deref() == Some("complete") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
    tokio::time::sleep(SETTLE_WAIT).await;
}

async fn page_body(page: &Page) -> Result<String> {
    page.content()
        .await
        .map_err(|err| FetchError::Browser(err.to_string()))
}

/// Pull the session's cookies back out of the browser. Decoded through
/// JSON so this survives CDP type changes; failures yield an empty harvest.
async fn harvest_cookies(page: &Page) -> Vec<CookieRecord> {
    let cookies = match page.get_cookies().await {
        Ok(cookies) => cookies,
        Err(err) => {
            debug!(error = %err, "Cookie harvest failed");
            return Vec::new();
        }
    };
    cookies
        .into_iter()
        .filter_map(|cookie| {
            let value = serde_json::to_value(&cookie).ok()?;
            let cdp: CdpCookie = serde_json::from_value(value).ok()?;
            Some(CookieRecord {
                domain: cdp.domain.to_lowercase(),
                include_subdomains: cdp.domain.starts_with('.'),
                path: cdp.path,
                secure: cdp.secure,
                expires: (cdp.expires > 0.0).then_some(cdp.expires as i64),
                name: cdp.name,
                value: cdp.value,
                http_only: cdp.http_only,
            })
        })
        .collect()
}
