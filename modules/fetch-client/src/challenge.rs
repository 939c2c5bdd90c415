//! Soft-block ("challenge") detection.
//!
//! Block pages are site-specific, so the predicate is pluggable; the default
//! implementation matches a configurable list of body substrings plus the
//! 429 status that every anti-bot layer shares.

/// Decides whether a response is an anti-bot interstitial rather than the
/// requested content. Detection never fails a fetch on its own — it only
/// drives bounded reloads on the browser transport.
pub trait ChallengeDetector: Send + Sync {
    fn is_challenge(&self, body: &str, status: u16) -> bool;
}

/// Marker-substring detector. Matching is case-insensitive.
pub struct MarkerDetector {
    markers: Vec<String>,
}

impl MarkerDetector {
    pub fn new(markers: impl IntoIterator<Item = String>) -> Self {
        Self {
            markers: markers.into_iter().map(|m| m.to_lowercase()).collect(),
        }
    }

    /// Markers observed on the upstream block pages this client was built
    /// against. Deployments targeting other sites supply their own list.
    pub fn default_markers() -> Vec<String> {
        [
            "your request could not be processed",
            "kpsdk",
            "unblockrequest@",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }
}

impl Default for MarkerDetector {
    fn default() -> Self {
        Self::new(Self::default_markers())
    }
}

impl ChallengeDetector for MarkerDetector {
    fn is_challenge(&self, body: &str, status: u16) -> bool {
        if status == 429 {
            return true;
        }
        let body = body.to_lowercase();
        self.markers.iter().any(|marker| body.contains(marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_always_a_challenge() {
        let detector = MarkerDetector::new(Vec::new());
        assert!(detector.is_challenge("<html>anything</html>", 429));
        assert!(!detector.is_challenge("<html>anything</html>", 200));
    }

    #[test]
    fn markers_match_case_insensitively() {
        let detector = MarkerDetector::default();
        assert!(detector.is_challenge("... Your Request Could Not Be Processed ...", 200));
        assert!(detector.is_challenge("window.KPSDK = {}", 200));
        assert!(!detector.is_challenge("<html>real listing content</html>", 200));
    }
}
