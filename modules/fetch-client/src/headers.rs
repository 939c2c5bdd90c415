//! Captured-header context.
//!
//! A previous browser session's request headers are persisted as a JSON
//! snapshot; later direct-transport requests replay them so both transports
//! present the same fingerprint. Headers that would corrupt a replayed
//! request (connection-level, cookies, automation fingerprints) are
//! filtered out on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Header names that must never be replayed from a captured snapshot.
const EXCLUDED_KEYS: [&str; 4] = ["cookie", "cookie2", "host", "content-length"];

/// Raw values pulled from a snapshot before normalization strips them.
pub struct CapturedSession {
    pub cookie: Option<String>,
    pub referer: Option<String>,
}

/// The merged header set sent on every direct request, plus the snapshot
/// file it round-trips through.
pub struct HeaderContext {
    path: PathBuf,
    headers: BTreeMap<String, String>,
}

impl HeaderContext {
    /// Build the context from the snapshot at `path` overlaid on `fallback`
    /// defaults. Snapshot entries win; fallback fills whatever the snapshot
    /// lacks. With `use_captured` off the snapshot is ignored entirely.
    ///
    /// Returns the raw cookie/referer captured alongside the snapshot so the
    /// caller can seed its cookie jar.
    pub fn build(
        path: &Path,
        fallback: &BTreeMap<String, String>,
        use_captured: bool,
    ) -> (Self, CapturedSession) {
        let mut captured = CapturedSession {
            cookie: None,
            referer: None,
        };
        let mut headers = BTreeMap::new();

        if use_captured {
            if let Some(snapshot) = read_snapshot(path) {
                captured.cookie = snapshot.get("cookie").cloned();
                captured.referer = snapshot.get("referer").cloned();
                headers = normalize(&snapshot);
            }
        }
        for (name, value) in fallback {
            headers
                .entry(name.to_lowercase())
                .or_insert_with(|| value.clone());
        }

        (
            Self {
                path: path.to_path_buf(),
                headers,
            },
            captured,
        )
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn cookie(&self) -> Option<&str> {
        self.headers.get("cookie").map(String::as_str)
    }

    pub fn set_cookie(&mut self, value: Option<String>) {
        match value {
            Some(value) => {
                self.headers.insert("cookie".to_string(), value);
            }
            None => {
                self.headers.remove("cookie");
            }
        }
    }

    /// Context headers with per-request overrides applied on top.
    pub fn merged_with(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = self.headers.clone();
        for (name, value) in overrides {
            merged.insert(name.to_lowercase(), value.clone());
        }
        merged
    }

    /// Replace the captured set with `snapshot` (freshly observed browser
    /// headers) and persist. The live context keeps its cookie.
    pub fn update_from_capture(&mut self, snapshot: &BTreeMap<String, String>) {
        let cookie = self.headers.remove("cookie");
        let mut normalized = normalize(snapshot);
        for (name, value) in std::mem::take(&mut self.headers) {
            normalized.entry(name).or_insert(value);
        }
        self.headers = normalized;
        if let Some(cookie) = cookie {
            self.headers.insert("cookie".to_string(), cookie);
        }
        self.persist();
    }

    /// Write the snapshot to disk, minus the cookie (cookies live in the
    /// jar). Persistence failures are logged, never raised.
    pub fn persist(&self) {
        let mut snapshot = self.headers.clone();
        snapshot.remove("cookie");
        let json = match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "Header snapshot serialization failed");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %self.path.display(), error = %err, "Header snapshot dir creation failed");
                return;
            }
        }
        if let Err(err) = std::fs::write(&self.path, json) {
            warn!(path = %self.path.display(), error = %err, "Header snapshot write failed");
        }
    }
}

fn read_snapshot(path: &Path) -> Option<BTreeMap<String, String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "Header snapshot unreadable, ignoring");
            }
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(map) => {
            debug!(path = %path.display(), "Header snapshot loaded");
            Some(map)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Header snapshot malformed, ignoring");
            None
        }
    }
}

/// Lowercase names, drop pseudo-headers, excluded keys, and headless
/// user-agents, and strip codecs we cannot decode from accept-encoding.
fn normalize(raw: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in raw {
        let name = name.trim().to_lowercase();
        if name.is_empty() || name.starts_with(':') {
            continue;
        }
        if EXCLUDED_KEYS.contains(&name.as_str()) {
            continue;
        }
        if name == "user-agent" && value.to_lowercase().contains("headlesschrome") {
            continue;
        }
        let value = if name == "accept-encoding" {
            strip_zstd(value)
        } else {
            value.clone()
        };
        out.insert(name, value);
    }
    out
}

/// Remove `zstd` from an accept-encoding list. If removal would leave the
/// value empty the original is kept rather than advertising nothing.
fn strip_zstd(value: &str) -> String {
    let kept: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|token| {
            let codec = token.split(';').next().unwrap_or(token).trim();
            !codec.eq_ignore_ascii_case("zstd")
        })
        .filter(|token| !token.is_empty())
        .collect();
    if kept.is_empty() {
        value.to_string()
    } else {
        kept.join(", ")
    }
}
