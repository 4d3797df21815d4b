use feedwatch_core::FILTER_ALL;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchlistConfig {
    /// Time allowed for a provider stream's first refresh, in milliseconds.
    pub request_timeout_ms: u64,
    /// Time allowed for an ack to a post that requested one, in milliseconds.
    pub post_ack_timeout_ms: u64,
    /// Max posts awaiting an ack at once.
    pub max_outstanding_posts: usize,
    /// Open window used when a service advertises none. `None` is unbounded.
    pub default_open_window: Option<u32>,
    /// Single-open assumed until the login refresh says otherwise.
    pub single_open_default: bool,
    /// Allow-suspect-data assumed until the login refresh says otherwise.
    pub allow_suspect_data_default: bool,
    /// Filter used for the watchlist's own source directory request.
    pub directory_filter: u32,
    /// User name sent on the login request.
    pub user_name: String,
    /// Application id sent on the login request.
    pub application_id: String,
}

impl Default for WatchlistConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            post_ack_timeout_ms: 15_000,
            max_outstanding_posts: 100_000,
            default_open_window: None,
            single_open_default: true,
            allow_suspect_data_default: true,
            directory_filter: FILTER_ALL,
            user_name: "feedwatch".to_string(),
            application_id: "256".to_string(),
        }
    }
}

impl WatchlistConfig {
    /// Effective open window for a service advertising `advertised`.
    pub fn open_window_for(&self, advertised: Option<u32>) -> Option<u32> {
        match (advertised, self.default_open_window) {
            (Some(0), fallback) => fallback,
            (Some(window), _) => Some(window),
            (None, fallback) => fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WatchlistConfig;

    #[test]
    fn advertised_window_wins_over_default() {
        let cfg = WatchlistConfig {
            default_open_window: Some(10),
            ..WatchlistConfig::default()
        };
        assert_eq!(cfg.open_window_for(Some(2)), Some(2));
        assert_eq!(cfg.open_window_for(None), Some(10));
        assert_eq!(cfg.open_window_for(Some(0)), Some(10));
        assert_eq!(WatchlistConfig::default().open_window_for(None), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WatchlistConfig::default();
        assert_eq!(cfg.request_timeout_ms, 15_000);
        assert_eq!(cfg.post_ack_timeout_ms, 15_000);
        assert!(cfg.single_open_default);
        assert!(cfg.allow_suspect_data_default);
    }
}
