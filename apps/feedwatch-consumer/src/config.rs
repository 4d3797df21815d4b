use config::{Config, ConfigError, Environment, File};
use feedwatch_watchlist::WatchlistConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsumerConfig {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub post_ack_timeout: Duration,
    pub max_outstanding_posts: usize,
    #[serde(default)]
    pub default_open_window: Option<u32>,
    pub single_open: bool,
    pub allow_suspect_data: bool,
    pub directory_filter: u32,
    pub user_name: String,
    pub application_id: String,
}

impl ConsumerConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let engine = WatchlistConfig::default();
        let mut builder = Config::builder()
            .set_default("request_timeout", "15s")?
            .set_default("post_ack_timeout", "15s")?
            .set_default("max_outstanding_posts", engine.max_outstanding_posts as u64)?
            .set_default("single_open", engine.single_open_default)?
            .set_default("allow_suspect_data", engine.allow_suspect_data_default)?
            .set_default("directory_filter", u64::from(engine.directory_filter))?
            .set_default("user_name", engine.user_name)?
            .set_default("application_id", engine.application_id)?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the FEEDWATCH_* environment source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("FEEDWATCH").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Engine configuration with durations flattened to milliseconds.
    pub fn watchlist(&self) -> WatchlistConfig {
        WatchlistConfig {
            request_timeout_ms: duration_ms(self.request_timeout),
            post_ack_timeout_ms: duration_ms(self.post_ack_timeout),
            max_outstanding_posts: self.max_outstanding_posts,
            default_open_window: self.default_open_window,
            single_open_default: self.single_open,
            allow_suspect_data_default: self.allow_suspect_data,
            directory_filter: self.directory_filter,
            user_name: self.user_name.clone(),
            application_id: self.application_id.clone(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
