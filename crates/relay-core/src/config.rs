use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, filter::FilterMode, Result};

/// Typed configuration for the relay, loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub source_channels: Vec<i64>,
    pub destination_channel: i64,
    pub admin_user_id: Option<i64>,

    // Delivery executor
    pub max_messages_per_second: u32,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery: Duration,
    pub delivery_deadline: Duration,

    // Aggregation window
    pub media_group_timeout: Duration,

    // Notifications
    pub notify_cooldown: Duration,

    // Keyword filter
    pub filter_keywords: Vec<String>,
    pub filter_mode: FilterMode,
    pub filter_case_sensitive: bool,

    // Delivery journal
    pub journal_path: PathBuf,
    pub journal_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let source_channels = parse_csv_i64(env_str("SOURCE_CHANNELS"));
        if source_channels.is_empty() {
            return Err(Error::Config(
                "SOURCE_CHANNELS environment variable is required".to_string(),
            ));
        }

        let destination_channel = env_str("DESTINATION_CHANNEL")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                Error::Config("DESTINATION_CHANNEL environment variable is required".to_string())
            })?;

        let admin_user_id = env_str("ADMIN_USER_ID").and_then(|s| s.trim().parse::<i64>().ok());

        let max_messages_per_second = env_u32("MAX_MESSAGES_PER_SECOND").unwrap_or(30).max(1);
        let max_retries = env_u32("MAX_RETRIES").unwrap_or(5).max(1);
        let base_retry_delay = Duration::from_secs(env_u64("BASE_RETRY_DELAY_SECS").unwrap_or(1));
        let max_retry_delay = Duration::from_secs(env_u64("MAX_RETRY_DELAY_SECS").unwrap_or(300));
        let circuit_failure_threshold = env_u32("CIRCUIT_FAILURE_THRESHOLD").unwrap_or(5).max(1);
        let circuit_recovery = Duration::from_secs(env_u64("CIRCUIT_RECOVERY_SECS").unwrap_or(60));
        let delivery_deadline = Duration::from_secs(env_u64("DELIVERY_DEADLINE_SECS").unwrap_or(180));

        let media_group_timeout =
            Duration::from_millis(env_u64("MEDIA_GROUP_TIMEOUT_MS").unwrap_or(2000));

        let notify_cooldown = Duration::from_secs(env_u64("NOTIFY_COOLDOWN_SECS").unwrap_or(300));

        let filter_keywords = parse_csv(env_str("FILTER_KEYWORDS"));
        let filter_mode = match env_str("FILTER_MODE").as_deref().map(str::trim) {
            Some("whitelist") => FilterMode::Whitelist,
            _ => FilterMode::Blacklist,
        };
        let filter_case_sensitive = env_bool("FILTER_CASE_SENSITIVE").unwrap_or(false);

        let journal_path = PathBuf::from(
            env_str("DELIVERY_LOG_PATH").unwrap_or("/tmp/relay-delivery.log".to_string()),
        );
        let journal_json = env_bool("DELIVERY_LOG_JSON").unwrap_or(true);

        Ok(Self {
            telegram_bot_token,
            source_channels,
            destination_channel,
            admin_user_id,
            max_messages_per_second,
            max_retries,
            base_retry_delay,
            max_retry_delay,
            circuit_failure_threshold,
            circuit_recovery,
            delivery_deadline,
            media_group_timeout,
            notify_cooldown,
            filter_keywords,
            filter_mode,
            filter_case_sensitive,
            journal_path,
            journal_json,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parsing_skips_blanks_and_junk() {
        let ids = parse_csv_i64(Some("-1001, ,-1002,abc,".to_string()));
        assert_eq!(ids, vec![-1001, -1002]);

        let words = parse_csv(Some(" foo,, bar ".to_string()));
        assert_eq!(words, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn empty_csv_is_empty() {
        assert!(parse_csv_i64(None).is_empty());
        assert!(parse_csv(Some("  ".to_string())).is_empty());
    }
}
