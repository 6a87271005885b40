use anyhow::{anyhow, Context, Result};
use clap::Parser;
use lib_statsync::core::normalizer::ResyncPolicy;
use lib_statsync::sources::ColumnMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_stats.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Live demo statistics server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "STATS_PORT", help = "Port to listen on for HTTP clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "STATS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "STATS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "STATS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "STATS_BACKEND_URL", help = "Base URL of the hosted backend (https://<ref>.supabase.co).")]
    pub backend_url: Option<String>,

    #[clap(long, env = "STATS_ANON_KEY", help = "Anonymous API key for the backend.")]
    pub anon_key: Option<String>,

    #[clap(long, env = "STATS_TABLE", help = "Table holding the metric rows.")]
    pub table: Option<String>,

    #[clap(long, env = "STATS_SCHEMA", help = "Schema of the metrics table.")]
    pub schema: Option<String>,

    #[clap(long, env = "STATS_TOPIC", help = "Change-feed topic to attach.")]
    pub topic: Option<String>,

    #[clap(long, env = "STATS_ENTITY_COLUMN", help = "Column holding the entity id.")]
    pub entity_column: Option<String>,

    #[clap(long, env = "STATS_NAME_COLUMN", help = "Column holding the metric name.")]
    pub name_column: Option<String>,

    #[clap(long, env = "STATS_VALUE_COLUMN", help = "Column holding the metric value.")]
    pub value_column: Option<String>,

    #[clap(long, env = "STATS_DEFAULTS_PATH", help = "JSON5 file with per-entity default metrics.")]
    pub defaults_path: Option<PathBuf>,

    #[clap(long, env = "STATS_RESYNC_POLICY", help = "Handling of unusable events: precise or always.")]
    pub resync_policy: Option<String>,

    #[clap(long, env = "STATS_RECONNECT_DELAY_MS", help = "Delay in milliseconds before re-attaching a closed feed.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "STATS_REFETCH_ON_RESYNC", help = "Re-run the snapshot query after a resync (true/false).")]
    pub refetch_on_resync: Option<bool>,
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub backend_url: String,
    pub anon_key: String,
    pub table: String,
    pub schema: String,
    pub topic: String,
    pub columns: ColumnMap,
    pub defaults_path: Option<PathBuf>,
    pub resync_policy: ResyncPolicy,
    pub refetch_on_resync: bool,
    pub reconnect_delay: Duration,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            backend_url: other.backend_url.or(self.backend_url),
            anon_key: other.anon_key.or(self.anon_key),
            table: other.table.or(self.table),
            schema: other.schema.or(self.schema),
            topic: other.topic.or(self.topic),
            entity_column: other.entity_column.or(self.entity_column),
            name_column: other.name_column.or(self.name_column),
            value_column: other.value_column.or(self.value_column),
            defaults_path: other.defaults_path.or(self.defaults_path),
            resync_policy: other.resync_policy.or(self.resync_policy),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            refetch_on_resync: other.refetch_on_resync.or(self.refetch_on_resync),
        }
    }

    fn defaults() -> Config {
        let columns = ColumnMap::default();
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            table: Some("demo_stats".to_string()),
            schema: Some("public".to_string()),
            topic: Some("demo-stats".to_string()),
            entity_column: Some(columns.entity_id),
            name_column: Some(columns.metric_name),
            value_column: Some(columns.metric_value),
            resync_policy: Some("precise".to_string()),
            refetch_on_resync: Some(true),
            reconnect_delay_ms: Some(5000),
            ..Default::default()
        }
    }

    /// Validates the merged layers and fills every required field.
    pub fn into_settings(self) -> Result<Settings> {
        let defaults = Config::defaults();
        let merged = defaults.merge(self);

        let resync_policy = merged
            .resync_policy
            .as_deref()
            .unwrap_or("precise")
            .parse::<ResyncPolicy>()?;

        Ok(Settings {
            port: merged.port.unwrap_or(9010),
            log_dir: merged.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: merged.log_level.unwrap_or_else(|| "info".to_string()),
            backend_url: merged
                .backend_url
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("backend URL is required (--backend-url or STATS_BACKEND_URL)"))?,
            anon_key: merged
                .anon_key
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("anon key is required (--anon-key or STATS_ANON_KEY)"))?,
            table: merged.table.unwrap_or_default(),
            schema: merged.schema.unwrap_or_default(),
            topic: merged.topic.unwrap_or_default(),
            columns: ColumnMap {
                entity_id: merged.entity_column.unwrap_or_default(),
                metric_name: merged.name_column.unwrap_or_default(),
                metric_value: merged.value_column.unwrap_or_default(),
            },
            defaults_path: merged.defaults_path,
            resync_policy,
            refetch_on_resync: merged.refetch_on_resync.unwrap_or(true),
            reconnect_delay: Duration::from_millis(merged.reconnect_delay_ms.unwrap_or(5000)),
        })
    }
}

/// Reads the JSON config file, if any. A missing file is not an error.
fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return Ok(None);
    }
    let config_str = fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let file_config = serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(Some(file_config))
}

/// Layers the config file under the already parsed CLI/env arguments.
pub fn layer_config(cli_args: Config) -> Result<Config> {
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let current_config = match read_config_file(&config_file_path)? {
        Some(file_config) => file_config.merge(cli_args),
        None => cli_args,
    };
    Ok(current_config)
}

/// 1. built-in defaults, 2. `server_stats.conf`, 3. environment and CLI.
pub fn load_config() -> Result<Settings> {
    let _ = dotenvy::dotenv();
    layer_config(Config::parse())?.into_settings()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn required() -> Config {
        Config {
            backend_url: Some("https://abc.supabase.co".to_string()),
            anon_key: Some("anon".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_fill_optional_fields() {
        let settings = required().into_settings().unwrap();
        assert_eq!(settings.port, 9010);
        assert_eq!(settings.table, "demo_stats");
        assert_eq!(settings.topic, "demo-stats");
        assert_eq!(settings.columns, ColumnMap::default());
        assert_eq!(settings.resync_policy, ResyncPolicy::Precise);
        assert!(settings.refetch_on_resync);
        assert_eq!(settings.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_backend_is_an_error() {
        assert!(Config::default().into_settings().is_err());
    }

    #[test]
    fn test_bad_resync_policy_is_an_error() {
        let config = Config {
            resync_policy: Some("sometimes".to_string()),
            ..required()
        };
        assert!(config.into_settings().is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 8000, "table": "stats", "anonKey": "file-key", "refetchOnResync": false}}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(8100),
            backend_url: Some("https://abc.supabase.co".to_string()),
            ..Default::default()
        };
        let settings = layer_config(cli).unwrap().into_settings().unwrap();
        assert_eq!(settings.port, 8100);
        assert_eq!(settings.table, "stats");
        assert_eq!(settings.anon_key, "file-key");
        assert!(!settings.refetch_on_resync);
    }

    #[test]
    fn test_unparseable_file_is_reported() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            ..required()
        };
        assert!(layer_config(cli).is_err());
    }
}
