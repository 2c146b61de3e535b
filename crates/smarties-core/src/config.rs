use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_SECS: u64 = 60; // scheduler sweep cadence
pub const DEFAULT_SCHEMA_VERSION: &str = "0.0.0";
pub const CONFIG_ENV: &str = "SMARTIES_CONFIG";

/// Top-level config (smarties.toml + SMARTIES_* env overrides).
///
/// Nested keys are separated by a double underscore in the environment,
/// e.g. `SMARTIES_SCHEDULER__TICK_SECS=5`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two sweeps of the job table.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Version declared for the scheduler tables; compared against the
    /// schema ledger on startup.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            schema_version: default_schema_version(),
        }
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}

fn default_schema_version() -> String {
    DEFAULT_SCHEMA_VERSION.to_string()
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.smarties/smarties.db", home)
}

impl HubConfig {
    /// Load config: explicit path > `SMARTIES_CONFIG` > `~/.smarties/smarties.toml`.
    ///
    /// A missing file is not an error; defaults and env overrides still apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(default_config_path);

        tracing::debug!(%path, "loading configuration");

        let config: HubConfig = Figment::from(Serialized::defaults(HubConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SMARTIES_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        if config.scheduler.tick_secs == 0 {
            return Err(crate::error::CoreError::Config(
                "scheduler.tick_secs must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }

    /// Create the parent directory of the database file if needed.
    pub fn ensure_db_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.database.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.smarties/smarties.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        figment::Jail::expect_with(|_jail| {
            let config = HubConfig::load(Some("does-not-exist.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.scheduler.tick_secs, DEFAULT_TICK_SECS);
            assert_eq!(config.scheduler.schema_version, "0.0.0");
            assert!(config.database.path.ends_with("smarties.db"));
            Ok(())
        });
    }

    #[test]
    fn file_values_are_read() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "smarties.toml",
                r#"
                [database]
                path = "/tmp/hub.db"

                [scheduler]
                tick_secs = 30
                "#,
            )?;
            let config = HubConfig::load(Some("smarties.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.database.path, "/tmp/hub.db");
            assert_eq!(config.scheduler.tick_secs, 30);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("smarties.toml", "[scheduler]\ntick_secs = 30\n")?;
            jail.set_env("SMARTIES_SCHEDULER__TICK_SECS", "5");
            let config = HubConfig::load(Some("smarties.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.scheduler.tick_secs, 5);
            Ok(())
        });
    }

    #[test]
    fn zero_tick_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("smarties.toml", "[scheduler]\ntick_secs = 0\n")?;
            let err = HubConfig::load(Some("smarties.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
