//! Configuration for the `sqlstress` benchmark tool.
//!
//! Configuration can be loaded from multiple sources with the following
//! precedence (highest to lowest):
//!
//! 1. Environment variables (prefixed with `SQLSTRESS__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! Environment variables use `SQLSTRESS__` as a prefix and double
//! underscores (`__`) to denote nested configuration structures. For
//! example:
//!
//! - `SQLSTRESS__AGENTS=8` sets the number of concurrent agents
//! - `SQLSTRESS__TARGET__HOST=db.internal` sets the target host
//! - `SQLSTRESS__WORKLOAD__LOAD_TYPE=update` sets the statement mix
//!
//! The same configuration in YAML format:
//!
//! ```yaml
//! agents: 8
//!
//! target:
//!   host: db.internal
//!
//! workload:
//!   load_type: update
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use sqlstress_engine::{TaskOptions, WorkloadConfig};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "SQLSTRESS__";

/// Newtype around `String` that protects against accidental logging of
/// secrets in our configuration struct.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Exposes the wrapped secret.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

/// Connection parameters of the benchmarked database server.
///
/// Used in: [`Config::target`]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Hostname of the database server.
    ///
    /// # Default
    ///
    /// `"localhost"`
    pub host: String,

    /// Port of the database server.
    ///
    /// # Default
    ///
    /// `3306`
    pub port: u16,

    /// User to authenticate as.
    ///
    /// # Default
    ///
    /// `"root"`
    pub user: String,

    /// Password to authenticate with. Redacted in all log output.
    ///
    /// # Default
    ///
    /// empty
    pub password: ConfigSecret,

    /// Name of the benchmark database.
    ///
    /// # Default
    ///
    /// `"sqlstress"`
    pub database: String,

    /// Print every statement to stderr instead of executing it.
    ///
    /// In this mode no connection is opened and progress rendering is
    /// suppressed. This is the default because no SQL driver ships with
    /// the CLI; real drivers plug in through the engine's `Connect` trait.
    ///
    /// # Default
    ///
    /// `true`
    pub only_print: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 3306,
            user: "root".to_owned(),
            password: ConfigSecret::default(),
            database: "sqlstress".to_owned(),
            only_print: true,
        }
    }
}

impl TargetConfig {
    /// Credential-free display identity of the target, echoed in reports.
    pub fn label(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// Root configuration of the benchmark tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The database server to benchmark.
    pub target: TargetConfig,

    /// Number of concurrent agents.
    ///
    /// # Default
    ///
    /// `1`
    pub agents: u32,

    /// Duration of the run phase. Zero disables the deadline.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub time: Duration,

    /// Per-agent target statement rate. Zero means unthrottled.
    ///
    /// # Default
    ///
    /// `0`
    pub rate: u32,

    /// Per-agent statement budget. Zero means unlimited.
    ///
    /// # Default
    ///
    /// `0`
    pub queries: u32,

    /// Fixed seed for reproducible statement streams.
    ///
    /// # Default
    ///
    /// `None` (a random seed is drawn per run)
    pub seed: Option<u64>,

    /// Drop a pre-existing benchmark database during setup.
    ///
    /// # Default
    ///
    /// `false`
    pub drop_existing_database: bool,

    /// Keep the benchmark database on teardown.
    ///
    /// # Default
    ///
    /// `false`
    pub no_drop_database: bool,

    /// Storage engine to set as the session default during setup.
    ///
    /// # Default
    ///
    /// `None`
    pub engine: Option<String>,

    /// Custom create statements, replacing the generated table setup.
    ///
    /// # Default
    ///
    /// empty
    pub creates: Vec<String>,

    /// Shape of the generated statement stream.
    pub workload: WorkloadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            agents: 1,
            time: Duration::from_secs(60),
            rate: 0,
            queries: 0,
            seed: None,
            drop_existing_database: false,
            no_drop_database: false,
            engine: None,
            creates: Vec::new(),
            workload: WorkloadConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from defaults, the optional YAML file, and
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Derives the engine's run options from this configuration.
    pub fn task_options(&self) -> TaskOptions {
        TaskOptions {
            target: self.target.label(),
            database: self.target.database.clone(),
            agents: self.agents,
            time: self.time,
            rate: self.rate,
            number_queries_to_execute: self.queries,
            drop_existing_database: self.drop_existing_database,
            no_drop_database: self.no_drop_database,
            engine: self.engine.clone(),
            creates: self.creates.clone(),
            only_print: self.target.only_print,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use sqlstress_engine::LoadType;

    use super::*;

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SQLSTRESS__TARGET__HOST", "db.internal");
            jail.set_env("SQLSTRESS__TARGET__PORT", "3307");
            jail.set_env("SQLSTRESS__TARGET__PASSWORD", "hunter2");
            jail.set_env("SQLSTRESS__AGENTS", "8");
            jail.set_env("SQLSTRESS__TIME", "90s");
            jail.set_env("SQLSTRESS__RATE", "100");
            jail.set_env("SQLSTRESS__WORKLOAD__LOAD_TYPE", "update");
            jail.set_env("SQLSTRESS__WORKLOAD__COMMIT_RATE", "5");

            let config = Config::load(None).unwrap();

            assert_eq!(config.target.host, "db.internal");
            assert_eq!(config.target.port, 3307);
            assert_eq!(config.target.password.as_str(), "hunter2");
            assert_eq!(config.agents, 8);
            assert_eq!(config.time, Duration::from_secs(90));
            assert_eq!(config.rate, 100);
            assert_eq!(config.workload.load_type, LoadType::Update);
            assert_eq!(config.workload.commit_rate, 5);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            target:
                host: db.internal
                user: bench
                database: loadtest
            agents: 4
            time: 2m
            creates:
                - CREATE TABLE custom (x INT)
            workload:
                load_type: key
                number_pre_populated_rows: 500
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.target.host, "db.internal");
            assert_eq!(config.target.user, "bench");
            assert_eq!(config.target.database, "loadtest");
            assert_eq!(config.agents, 4);
            assert_eq!(config.time, Duration::from_secs(120));
            assert_eq!(config.creates, vec!["CREATE TABLE custom (x INT)"]);
            assert_eq!(config.workload.load_type, LoadType::Key);
            assert_eq!(config.workload.number_pre_populated_rows, 500);

            Ok(())
        });
    }

    #[test]
    fn configured_with_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            target:
                host: db.internal
            agents: 4
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("SQLSTRESS__AGENTS", "16");

            let config = Config::load(Some(tempfile.path())).unwrap();

            // Env should overwrite the yaml config
            assert_eq!(config.agents, 16);
            assert_eq!(config.target.host, "db.internal");

            Ok(())
        });
    }

    #[test]
    fn task_options_carry_no_credentials() {
        let mut config = Config::default();
        config.target.password = "hunter2".into();
        config.target.user = "bench".to_owned();

        let options = config.task_options();
        assert_eq!(options.target, "bench@localhost:3306/sqlstress");
        assert!(!format!("{options:?}").contains("hunter2"));
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let mut config = Config::default();
        config.target.password = "hunter2".into();

        let rendered = format!("{config:?}");
        assert!(rendered.contains("[redacted]"));
        assert!(!rendered.contains("hunter2"));
    }
}
