//! Process configuration, read once from the environment.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context};

use crate::clock::MINUTE;
use crate::engine::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => bail!("LOG_FORMAT must be plain or json, got {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub app_id: String,
    pub api_key: String,
    pub api_url: Option<String>,
    pub risk_template_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub i18n_dir: PathBuf,
    pub push: Option<PushConfig>,
    pub cohort_radius_m: f64,
    pub nearby_radius_m: f64,
    pub spike_threshold: i64,
    pub spike_behavior_cooldown_min: i64,
    pub worker_concurrency: usize,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        // Credentials are checked by `push_config`, only the worker needs them.
        let push = match (lookup("PUSH_APP_ID"), lookup("PUSH_API_KEY")) {
            (Some(app_id), Some(api_key)) => Some(PushConfig {
                app_id,
                api_key,
                api_url: lookup("PUSH_API_URL"),
                risk_template_id: lookup("PUSH_TEMPLATE_RISK_LEVEL_CHANGED").unwrap_or_default(),
            }),
            _ => None,
        };

        let config = Config {
            database_url,
            i18n_dir: lookup("I18N_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./i18n")),
            push,
            cohort_radius_m: parsed(&lookup, "COHORT_RADIUS_M", 5000.0)?,
            nearby_radius_m: parsed(&lookup, "NEARBY_RADIUS_M", 5000.0)?,
            spike_threshold: parsed(&lookup, "SPIKE_THRESHOLD", 3)?,
            spike_behavior_cooldown_min: parsed(&lookup, "SPIKE_BEHAVIOR_COOLDOWN_MIN", 90)?,
            worker_concurrency: parsed(&lookup, "WORKER_CONCURRENCY", 16)?,
            log_format: parsed(&lookup, "LOG_FORMAT", LogFormat::Plain)?,
        };

        if config.cohort_radius_m <= 0.0 || config.nearby_radius_m <= 0.0 {
            bail!("radii must be positive");
        }
        if config.worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        Ok(config)
    }

    /// Push credentials, required before the worker starts.
    pub fn push_config(&self) -> anyhow::Result<&PushConfig> {
        let push = self
            .push
            .as_ref()
            .context("PUSH_APP_ID and PUSH_API_KEY must be set to run the worker")?;
        if push.risk_template_id.is_empty() {
            bail!("PUSH_TEMPLATE_RISK_LEVEL_CHANGED must be set to run the worker");
        }
        Ok(push)
    }

    pub fn settings(&self) -> Settings {
        let mut settings = Settings {
            cohort_radius_m: self.cohort_radius_m,
            nearby_radius_m: self.nearby_radius_m,
            spike_threshold: self.spike_threshold,
            spike_behavior_cooldown: self.spike_behavior_cooldown_min * MINUTE,
            ..Settings::default()
        };
        if let Some(push) = &self.push {
            if !push.risk_template_id.is_empty() {
                settings.risk_template_id = push.risk_template_id.clone();
            }
        }
        settings
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid {key}: {raw:?}")),
    }
}

pub fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "global subscriber already installed");
    }
}
