use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Default reconciliation period when `POLLING_INTERVAL` is unset or invalid.
const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Config {
    pub github_token: String,
    pub github_username: String,
    pub polling_interval: Duration,
    pub db_path: PathBuf,
    pub reviews_dir: PathBuf,
    pub server_port: u16,
    /// Path to the review generator binary. Bare names are resolved via PATH.
    pub generator_path: String,
    pub enable_voice_notifications: bool,
    /// When set, the HTTP surface does not serve the embedded asset bundle
    /// (local development runs the front-end from its own dev server).
    pub dev_mode: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_token =
            env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable is required")?;

        let github_username = env::var("GITHUB_USERNAME")
            .context("GITHUB_USERNAME environment variable is required")?;

        let polling_interval = match env::var("POLLING_INTERVAL") {
            Ok(raw) => match parse_duration(&raw) {
                Some(d) => d,
                None => {
                    warn!(
                        "Invalid POLLING_INTERVAL {:?}, using default {:?}",
                        raw, DEFAULT_POLLING_INTERVAL
                    );
                    DEFAULT_POLLING_INTERVAL
                }
            },
            Err(_) => DEFAULT_POLLING_INTERVAL,
        };

        let server_port = env_or_default("SERVER_PORT", "8080")
            .parse::<u16>()
            .context("SERVER_PORT must be a valid port number")?;

        let generator_path = env_or_default("CBPR_PATH", "cbpr");

        // Voice notifications are on by default; disable with
        // ENABLE_VOICE_NOTIFICATIONS=false.
        let enable_voice_notifications = env_or_default("ENABLE_VOICE_NOTIFICATIONS", "true") == "true";

        let dev_mode = env_or_default("DEV_MODE", "false") == "true";

        Ok(Config {
            github_token,
            github_username,
            polling_interval,
            db_path: PathBuf::from(env_or_default("DB_PATH", "./data/pr-review.db")),
            reviews_dir: PathBuf::from(env_or_default("REVIEWS_DIR", "./reviews")),
            server_port,
            generator_path,
            enable_voice_notifications,
            dev_mode,
        })
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Parse a Go-style duration string: a sequence of `<number><unit>` segments
/// where unit is one of `ms`, `s`, `m`, `h` (e.g. "30s", "1m", "2m30s").
/// A bare unit-less value is rejected.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut chars = raw.chars().peekable();

    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            return None;
        }
        let value: u64 = digits.parse().ok()?;

        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let segment = match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return None,
        };
        total += segment;
    }

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_simple_units() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(parse_duration("2m30s"), Some(Duration::from_secs(150)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration("s30"), None);
    }

    #[test]
    fn test_from_env_requires_credentials() {
        // Single test so the fixed env var names are not raced by parallel tests.
        env::remove_var("GITHUB_TOKEN");
        env::remove_var("GITHUB_USERNAME");
        assert!(Config::from_env().is_err());

        env::set_var("GITHUB_TOKEN", "ghp_test");
        assert!(Config::from_env().is_err());

        env::set_var("GITHUB_USERNAME", "octocat");
        env::set_var("POLLING_INTERVAL", "2m");
        env::set_var("SERVER_PORT", "9090");
        let config = Config::from_env().expect("should load config");
        assert_eq!(config.github_username, "octocat");
        assert_eq!(config.polling_interval, Duration::from_secs(120));
        assert_eq!(config.server_port, 9090);
        assert_eq!(config.generator_path, "cbpr");
        assert_eq!(config.db_path, PathBuf::from("./data/pr-review.db"));
        assert_eq!(config.reviews_dir, PathBuf::from("./reviews"));
        assert!(config.enable_voice_notifications);
        assert!(!config.dev_mode);

        env::set_var("POLLING_INTERVAL", "not-a-duration");
        let config = Config::from_env().expect("should load config");
        assert_eq!(config.polling_interval, DEFAULT_POLLING_INTERVAL);

        env::remove_var("GITHUB_TOKEN");
        env::remove_var("GITHUB_USERNAME");
        env::remove_var("POLLING_INTERVAL");
        env::remove_var("SERVER_PORT");
    }
}
