//! Static fallback header set.
//!
//! The fetch client seeds its header context from this mapping before
//! overlaying any headers captured from a real browser session.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

/// File name of the optional header template next to the config file.
pub const HEADER_TEMPLATE_NAME: &str = "default_headers.json";

/// Load the static fallback headers: the `default_headers.json` template in
/// `config_dir` when present and readable, the built-in set otherwise.
pub fn load_default_headers(config_dir: &Path) -> BTreeMap<String, String> {
    let template = config_dir.join(HEADER_TEMPLATE_NAME);
    match std::fs::read_to_string(&template) {
        Ok(text) => match serde_json::from_str::<BTreeMap<String, String>>(&text) {
            Ok(map) if !map.is_empty() => return map,
            Ok(_) => {}
            Err(err) => {
                warn!(path = %template.display(), error = %err, "Ignoring malformed header template");
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %template.display(), error = %err, "Failed to read header template");
        }
    }
    builtin_headers()
}

fn builtin_headers() -> BTreeMap<String, String> {
    let pairs = [
        (
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
        ),
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
        ("accept-language", "en-US,en;q=0.9"),
        ("accept-encoding", "gzip, deflate, br"),
        ("upgrade-insecure-requests", "1"),
        ("sec-fetch-dest", "document"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-site", "none"),
        ("sec-fetch-user", "?1"),
    ];
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_includes_user_agent() {
        let dir = tempfile::tempdir().unwrap();
        let headers = load_default_headers(dir.path());
        assert!(headers.contains_key("user-agent"));
        assert!(headers.contains_key("accept-encoding"));
    }

    #[test]
    fn template_file_wins_over_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(HEADER_TEMPLATE_NAME),
            r#"{"user-agent": "custom-agent", "accept": "text/html"}"#,
        )
        .unwrap();
        let headers = load_default_headers(dir.path());
        assert_eq!(headers.get("user-agent").map(String::as_str), Some("custom-agent"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn malformed_template_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(HEADER_TEMPLATE_NAME), "not json").unwrap();
        let headers = load_default_headers(dir.path());
        assert!(headers.contains_key("user-agent"));
    }
}
