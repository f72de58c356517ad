use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::ServingEngine;

pub const CONFIG_FILE_NAME: &str = "furnace.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FurnaceConfig {
    /// Root of all furnace state; `$FURNACE_HOME` or `~/.furnace`.
    pub home: PathBuf,
    pub log_level: String,
    pub ports: PortRangeConfig,
    pub sites: SitesConfig,
    pub runtimes: RuntimeConfig,
    pub engines: EngineConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRangeConfig {
    pub start: u16,
    pub end: u16,
    /// Skip ports another program already listens on.
    pub skip_busy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SitesConfig {
    pub allowed_tlds: Vec<String>,
    pub bind_address: IpAddr,
    /// Served directory relative to the project root.
    pub document_subdir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub supported_versions: Vec<String>,
    pub install_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub enabled: Vec<ServingEngine>,
    pub nginx_binary: String,
    pub apache_binary: String,
    pub apache_modules_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub health_poll_ms: u64,
    pub grace_period_ms: u64,
    pub restart_cooldown_ms: u64,
    pub output_lines: usize,
}

impl Default for FurnaceConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            log_level: "info".to_string(),
            ports: PortRangeConfig::default(),
            sites: SitesConfig::default(),
            runtimes: RuntimeConfig::default(),
            engines: EngineConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            start: 8081,
            end: 8999,
            skip_busy: true,
        }
    }
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            allowed_tlds: vec!["test".to_string(), "localhost".to_string()],
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            document_subdir: "public".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            supported_versions: ["7.4", "8.0", "8.1", "8.2", "8.3", "8.4"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            install_dir: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: ServingEngine::ALL.to_vec(),
            nginx_binary: "nginx".to_string(),
            apache_binary: if cfg!(target_os = "linux") {
                "apache2".to_string()
            } else {
                "httpd".to_string()
            },
            apache_modules_dir: PathBuf::from(if cfg!(target_os = "macos") {
                "/opt/homebrew/lib/httpd/modules"
            } else {
                "/usr/lib/apache2/modules"
            }),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 2_000,
            probe_timeout_ms: 1_000,
            health_timeout_ms: 15_000,
            health_poll_ms: 250,
            grace_period_ms: 5_000,
            restart_cooldown_ms: 30_000,
            output_lines: 200,
        }
    }
}

fn default_home() -> PathBuf {
    std::env::var_os("FURNACE_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".furnace")))
        .unwrap_or_else(|| PathBuf::from(".furnace"))
}

impl FurnaceConfig {
    /// Loads `<home>/furnace.toml` layered over defaults and `FURNACE__*` variables.
    pub fn load() -> Result<Self> {
        let path = default_home().join(CONFIG_FILE_NAME);
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let defaults = config::Config::try_from(&FurnaceConfig::default())
            .context("Failed to build default configuration")?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("FURNACE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: FurnaceConfig = settings
            .try_deserialize()
            .context("Invalid furnace configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            anyhow::bail!(
                "port range {}-{} is empty",
                self.ports.start,
                self.ports.end
            );
        }
        if self.sites.allowed_tlds.is_empty() {
            anyhow::bail!("sites.allowed_tlds must name at least one local domain");
        }
        if self.engines.enabled.is_empty() {
            anyhow::bail!("engines.enabled must name at least one serving engine");
        }
        let s = &self.supervisor;
        if s.probe_interval_ms == 0
            || s.probe_timeout_ms == 0
            || s.health_timeout_ms == 0
            || s.health_poll_ms == 0
        {
            anyhow::bail!("supervisor intervals and timeouts must be non-zero");
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE_NAME)
    }

    pub fn store_path(&self) -> PathBuf {
        self.home.join("furnace.db")
    }

    pub fn sites_dir(&self) -> PathBuf {
        self.home.join("sites")
    }

    pub fn runtimes_dir(&self) -> PathBuf {
        self.runtimes
            .install_dir
            .clone()
            .unwrap_or_else(|| self.home.join("php"))
    }

    /// Directory of recipe files written by earlier furnace releases.
    pub fn legacy_recipes_dir(&self) -> PathBuf {
        self.home.join("recipes")
    }

    /// Configuration rooted at `home`, with timings short enough for tests.
    pub fn for_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }
}

impl SupervisorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }
}
