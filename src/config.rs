use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};

use crate::{
    playback::OrchestratorSettings,
    sources::{RetryPolicy, StrategyProfile},
};

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    #[serde(skip_serializing)]
    pub discord_token: String,
    pub command_prefix: String,

    // Reproducción
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub failure_streak_cap: u32,

    // Resolución
    pub resolver_strategies: Vec<String>,
    pub strategy_timeout: Duration,
    pub strategy_retries: u8,
    pub strategy_jitter: Duration,
    pub search_timeout: Duration,
    pub materialize_audio: bool,

    // Cache de búsquedas
    pub search_cache_size: usize,
    pub search_cache_ttl: Duration,

    // Paths
    pub ytdlp_path: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,

    // Rendimiento
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN").unwrap_or_default(),
            command_prefix: env_or("COMMAND_PREFIX", "!"),

            // Reproducción
            default_volume: env_or("DEFAULT_VOLUME", "0.5")
                .parse()
                .context("DEFAULT_VOLUME inválido")?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", "100")
                .parse()
                .context("MAX_QUEUE_SIZE inválido")?,
            failure_streak_cap: env_or("FAILURE_STREAK_CAP", "5")
                .parse()
                .context("FAILURE_STREAK_CAP inválido")?,

            // Resolución
            resolver_strategies: parse_list(&env_or(
                "RESOLVER_STRATEGIES",
                "android_embedded,ios,tv_embed,web",
            )),
            strategy_timeout: duration_var("STRATEGY_TIMEOUT", "25s")?,
            strategy_retries: env_or("STRATEGY_RETRIES", "1")
                .parse()
                .context("STRATEGY_RETRIES inválido")?,
            strategy_jitter: duration_var("STRATEGY_JITTER", "750ms")?,
            search_timeout: duration_var("SEARCH_TIMEOUT", "15s")?,
            materialize_audio: env_or("MATERIALIZE_AUDIO", "false")
                .parse()
                .context("MATERIALIZE_AUDIO inválido")?,

            // Cache
            search_cache_size: env_or("SEARCH_CACHE_SIZE", "256")
                .parse()
                .context("SEARCH_CACHE_SIZE inválido")?,
            search_cache_ttl: duration_var("SEARCH_CACHE_TTL", "1h")?,

            // Paths
            ytdlp_path: env_or("YTDLP_PATH", "yt-dlp").into(),
            cookies_file: optional_path("COOKIES_FILE"),
            cache_dir: optional_path("CACHE_DIR"),

            // Rendimiento
            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 2.0
    /// - Queue cap, failure cap and search cache size must be > 0
    /// - At least one resolution strategy, with a non-zero timeout
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and 2.0, got: {}",
                self.default_volume
            );
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.failure_streak_cap == 0 {
            anyhow::bail!("Failure streak cap must be greater than 0");
        }

        if self.resolver_strategies.is_empty() {
            anyhow::bail!("At least one resolver strategy is required");
        }

        if self.strategy_timeout.is_zero() {
            anyhow::bail!("Strategy timeout must be greater than 0");
        }

        if self.search_cache_size == 0 {
            anyhow::bail!("Search cache size must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        Ok(())
    }

    /// Perfiles de la cascada en el orden configurado
    pub fn strategy_profiles(&self) -> Vec<StrategyProfile> {
        self.resolver_strategies
            .iter()
            .map(|name| StrategyProfile::persona(name, self.strategy_timeout, self.materialize_audio))
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.strategy_retries,
            jitter: self.strategy_jitter,
            search_timeout: self.search_timeout,
            ..RetryPolicy::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_queue_size: self.max_queue_size,
            failure_streak_cap: self.failure_streak_cap,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the bot token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Bot: prefix '{}', {}% vol\n  \
            Limits: {} queue, {} consecutive failures\n  \
            Resolver: [{}], {} timeout, {} retries, {} jitter, materialize={}\n  \
            Search cache: {} entries, {} TTL\n  \
            yt-dlp: {} (cookies: {})\n  \
            Runtime: {} worker threads",
            self.command_prefix,
            (self.default_volume * 100.0) as u32,
            self.max_queue_size,
            self.failure_streak_cap,
            self.resolver_strategies.join(", "),
            humantime::format_duration(self.strategy_timeout),
            self.strategy_retries,
            humantime::format_duration(self.strategy_jitter),
            self.materialize_audio,
            self.search_cache_size,
            humantime::format_duration(self.search_cache_ttl),
            self.ytdlp_path.display(),
            self.cookies_file
                .as_ref()
                .map_or("auto".to_string(), |p| p.display().to_string()),
            self.worker_threads
        )
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            command_prefix: "!".to_string(),

            default_volume: 0.5,
            max_queue_size: 100,
            failure_streak_cap: 5,

            resolver_strategies: parse_list("android_embedded,ios,tv_embed,web"),
            strategy_timeout: Duration::from_secs(25),
            strategy_retries: 1,
            strategy_jitter: Duration::from_millis(750),
            search_timeout: Duration::from_secs(15),
            materialize_audio: false,

            search_cache_size: 256,
            search_cache_ttl: Duration::from_secs(3600),

            ytdlp_path: "yt-dlp".into(),
            cookies_file: None,
            cache_dir: None,

            worker_threads: num_cpus::get(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn duration_var(key: &str, default: &str) -> Result<Duration> {
    let raw = env_or(key, default);
    humantime::parse_duration(raw.trim()).with_context(|| format!("{} inválido: '{}'", key, raw))
}

fn optional_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.resolver_strategies,
            vec!["android_embedded", "ios", "tv_embed", "web"]
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("volume", Box::new(|c| c.default_volume = 2.5)),
            ("queue", Box::new(|c| c.max_queue_size = 0)),
            ("failure cap", Box::new(|c| c.failure_streak_cap = 0)),
            ("strategies", Box::new(|c| c.resolver_strategies.clear())),
            ("timeout", Box::new(|c| c.strategy_timeout = Duration::ZERO)),
            ("cache", Box::new(|c| c.search_cache_size = 0)),
        ];

        for (name, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "{} debería ser inválido", name);
        }
    }

    #[test]
    fn test_parse_list_trims_and_skips_empty() {
        assert_eq!(parse_list(" ios , ,web,"), vec!["ios", "web"]);
    }

    #[test]
    fn test_summary_hides_token() {
        let config = Config {
            discord_token: "super-secret-token".into(),
            ..Config::default()
        };
        assert!(!config.summary().contains("super-secret-token"));
        assert!(!format!("{:?}", config).contains("super-secret-token"));
    }

    #[test]
    fn test_profiles_follow_configured_order() {
        let config = Config {
            resolver_strategies: vec!["tv_embed".into(), "ios".into()],
            materialize_audio: true,
            ..Config::default()
        };
        let profiles = config.strategy_profiles();
        assert_eq!(profiles[0].name, "tv_embed");
        assert_eq!(profiles[1].name, "ios");
        assert!(profiles.iter().all(|p| p.materialize));
        assert_eq!(profiles[1].timeout, Duration::from_secs(25));
    }
}
