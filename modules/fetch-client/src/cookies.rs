//! Netscape-format cookie jar shared by both transports.
//!
//! Cookies harvested by the browser transport are written back here so the
//! direct transport can reuse them, and vice versa. A missing or corrupt
//! file starts the jar empty instead of failing construction.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use url::Url;

const FILE_HEADER: &str = "# Netscape HTTP Cookie File";
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRecord {
    /// Lowercased; a leading dot (or the include-subdomains flag) widens the
    /// match to subdomains.
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// Unix seconds; `None` is a session cookie.
    pub expires: Option<i64>,
    pub name: String,
    pub value: String,
    pub http_only: bool,
}

impl CookieRecord {
    fn matches(&self, host: &str, path: &str, https: bool, now: i64) -> bool {
        if self.secure && !https {
            return false;
        }
        if let Some(expires) = self.expires {
            if expires <= now {
                return false;
            }
        }
        self.domain_matches(host) && path_matches(path, &self.path)
    }

    fn domain_matches(&self, host: &str) -> bool {
        let bare = self.domain.trim_start_matches('.');
        if host == bare {
            return true;
        }
        (self.include_subdomains || self.domain.starts_with('.'))
            && host.ends_with(&format!(".{bare}"))
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// RFC 6265 default path: the request path up to (excluding) its last slash.
fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

#[derive(Debug)]
pub struct CookieJar {
    path: PathBuf,
    cookies: Vec<CookieRecord>,
}

impl CookieJar {
    /// Load the jar, tolerating a missing or malformed file.
    pub fn load(path: &Path) -> Self {
        let mut jar = Self {
            path: path.to_path_buf(),
            cookies: Vec::new(),
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "Cookie jar unreadable, starting empty");
                }
                return jar;
            }
        };
        for line in text.lines() {
            let (line, http_only) = match line.strip_prefix(HTTP_ONLY_PREFIX) {
                Some(rest) => (rest, true),
                None => (line, false),
            };
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 7 {
                continue;
            }
            let expires = match fields[4].parse::<i64>() {
                Ok(0) => None,
                Ok(secs) => Some(secs),
                Err(_) => continue,
            };
            jar.cookies.push(CookieRecord {
                domain: fields[0].to_lowercase(),
                include_subdomains: fields[1].eq_ignore_ascii_case("TRUE"),
                path: fields[2].to_string(),
                secure: fields[3].eq_ignore_ascii_case("TRUE"),
                expires,
                name: fields[5].to_string(),
                value: fields[6].to_string(),
                http_only,
            });
        }
        debug!(path = %path.display(), cookies = jar.cookies.len(), "Cookie jar loaded");
        jar
    }

    /// Persist every cookie, session cookies included (expiry written as 0).
    pub fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        out.push_str(FILE_HEADER);
        out.push('\n');
        for cookie in &self.cookies {
            if cookie.http_only {
                out.push_str(HTTP_ONLY_PREFIX);
            }
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                cookie.domain,
                if cookie.include_subdomains { "TRUE" } else { "FALSE" },
                cookie.path,
                if cookie.secure { "TRUE" } else { "FALSE" },
                cookie.expires.unwrap_or(0),
                cookie.name,
                cookie.value,
            ));
        }
        std::fs::write(&self.path, out)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &CookieRecord> {
        self.cookies.iter()
    }

    /// Insert or replace by (domain, path, name).
    pub fn upsert(&mut self, record: CookieRecord) {
        match self.cookies.iter_mut().find(|c| {
            c.domain == record.domain && c.path == record.path && c.name == record.name
        }) {
            Some(existing) => *existing = record,
            None => self.cookies.push(record),
        }
    }

    /// Compute the `cookie` request header for `url`: matching cookies in
    /// longest-path order. Falls back to the origin root when the exact path
    /// has no matches, since challenge handshakes often set cookies at `/`.
    pub fn cookie_header_for(&self, url: &Url) -> Option<String> {
        let header = self.header_for_path(url, url.path());
        if header.is_some() || url.path() == "/" {
            return header;
        }
        self.header_for_path(url, "/")
    }

    fn header_for_path(&self, url: &Url, path: &str) -> Option<String> {
        let host = url.host_str()?.to_lowercase();
        let https = url.scheme() == "https";
        let now = chrono::Utc::now().timestamp();

        let mut matching: Vec<&CookieRecord> = self
            .cookies
            .iter()
            .filter(|c| c.matches(&host, path, https, now))
            .collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Ingest one `Set-Cookie` response header received for `url`.
    pub fn store_set_cookie(&mut self, header_value: &str, url: &Url) {
        let parsed = match cookie::Cookie::parse(header_value.to_string()) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(error = %err, "Ignoring unparsable Set-Cookie header");
                return;
            }
        };
        let host = match url.host_str() {
            Some(host) => host.to_lowercase(),
            None => return,
        };
        let (domain, include_subdomains) = match parsed.domain() {
            Some(domain) => (domain.trim_start_matches('.').to_lowercase(), true),
            None => (host, false),
        };
        let domain = if include_subdomains {
            format!(".{domain}")
        } else {
            domain
        };

        let expires = parsed
            .max_age()
            .map(|age| chrono::Utc::now().timestamp() + age.whole_seconds())
            .or_else(|| {
                parsed
                    .expires()
                    .and_then(|exp| exp.datetime())
                    .map(|dt| dt.unix_timestamp())
            });

        self.upsert(CookieRecord {
            domain,
            include_subdomains,
            path: parsed
                .path()
                .map(str::to_string)
                .unwrap_or_else(|| default_path(url)),
            secure: parsed.secure().unwrap_or(false),
            expires,
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            http_only: parsed.http_only().unwrap_or(false),
        });
    }

    /// Merge a bare `name=value; name2=value2` cookie header captured from a
    /// browser session, attributed to `domain` as session cookies.
    pub fn merge_pairs(&mut self, domain: &str, header_value: &str) {
        let domain = domain.trim_start_matches('.').to_lowercase();
        for pair in header_value.split(';') {
            let pair = pair.trim();
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            self.upsert(CookieRecord {
                domain: domain.clone(),
                include_subdomains: false,
                path: "/".to_string(),
                secure: false,
                expires: None,
                name: name.trim().to_string(),
                value: value.trim().to_string(),
                http_only: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(domain: &str, path: &str, name: &str, value: &str) -> CookieRecord {
        CookieRecord {
            domain: domain.to_string(),
            include_subdomains: domain.starts_with('.'),
            path: path.to_string(),
            secure: false,
            expires: None,
            name: name.to_string(),
            value: value.to_string(),
            http_only: false,
        }
    }

    fn empty_jar(dir: &tempfile::TempDir) -> CookieJar {
        CookieJar::load(&dir.path().join("cookies.txt"))
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(empty_jar(&dir).is_empty());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, "totally broken\nno tabs here\n").unwrap();
        assert!(CookieJar::load(&path).is_empty());
    }

    #[test]
    fn save_load_round_trip_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        let mut jar = CookieJar::load(&path);
        jar.upsert(record(".example.com", "/", "kp_session", "abc123"));
        jar.upsert(CookieRecord {
            http_only: true,
            secure: true,
            expires: Some(4_102_444_800),
            ..record("www.example.com", "/app", "auth", "tok")
        });
        jar.save().unwrap();

        let reloaded = CookieJar::load(&path);
        assert_eq!(reloaded.len(), 2);
        let auth = reloaded.records().find(|c| c.name == "auth").unwrap();
        assert!(auth.http_only);
        assert!(auth.secure);
        assert_eq!(auth.expires, Some(4_102_444_800));
    }

    #[test]
    fn cookie_header_matches_domain_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut jar = empty_jar(&dir);
        jar.upsert(record(".example.com", "/", "a", "1"));
        jar.upsert(record(".example.com", "/listings", "b", "2"));
        jar.upsert(record("other.com", "/", "c", "3"));

        let url = Url::parse("https://www.example.com/listings/123").unwrap();
        let header = jar.cookie_header_for(&url).unwrap();
        // Longest path first, foreign domain excluded.
        assert_eq!(header, "b=2; a=1");
    }

    #[test]
    fn origin_fallback_applies_root_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let mut jar = empty_jar(&dir);
        let url = Url::parse("https://shop.example.com/checkout").unwrap();
        jar.upsert(record("shop.example.com", "/", "sid", "s1"));
        assert_eq!(jar.cookie_header_for(&url).unwrap(), "sid=s1");
    }

    #[test]
    fn secure_cookies_skip_plain_http() {
        let dir = tempfile::tempdir().unwrap();
        let mut jar = empty_jar(&dir);
        jar.upsert(CookieRecord {
            secure: true,
            ..record("example.com", "/", "s", "1")
        });
        assert!(jar
            .cookie_header_for(&Url::parse("http://example.com/").unwrap())
            .is_none());
        assert!(jar
            .cookie_header_for(&Url::parse("https://example.com/").unwrap())
            .is_some());
    }

    #[test]
    fn expired_cookies_are_not_sent_but_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut jar = empty_jar(&dir);
        jar.upsert(CookieRecord {
            expires: Some(1), // 1970
            ..record("example.com", "/", "old", "x")
        });
        assert!(jar
            .cookie_header_for(&Url::parse("https://example.com/").unwrap())
            .is_none());
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn set_cookie_ingestion_uses_request_host_when_domain_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut jar = empty_jar(&dir);
        let url = Url::parse("https://www.example.com/search/results").unwrap();
        jar.store_set_cookie("sid=abc; Path=/; Secure; HttpOnly", &url);
        jar.store_set_cookie("pref=1; Domain=example.com", &url);

        let sid = jar.records().find(|c| c.name == "sid").unwrap();
        assert_eq!(sid.domain, "www.example.com");
        assert!(sid.secure && sid.http_only);

        let pref = jar.records().find(|c| c.name == "pref").unwrap();
        assert_eq!(pref.domain, ".example.com");
        assert!(pref.include_subdomains);

        // Subdomain cookie visible from the www host, host-only cookie not
        // visible from a sibling subdomain.
        let sibling = Url::parse("https://m.example.com/").unwrap();
        assert_eq!(jar.cookie_header_for(&sibling).unwrap(), "pref=1");
    }

    #[test]
    fn merge_pairs_creates_session_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let mut jar = empty_jar(&dir);
        jar.merge_pairs("example.com", "a=1; b=2");
        assert_eq!(jar.len(), 2);
        assert!(jar.records().all(|c| c.expires.is_none()));
    }
}
