use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::config::{EngineConfig, FurnaceConfig};
use crate::core::{Allocation, FurnaceError, FurnaceResult, Recipe, RuntimeVersion, ServingEngine};

mod apache;
mod nginx;
mod php_fpm;

pub const RUNTIME_CONFIG_FILE: &str = "php-fpm.conf";
pub const RUNTIME_SOCKET_FILE: &str = "php-fpm.sock";

/// One generated file and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Configuration generated for one recipe and its allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedConfig {
    pub recipe_name: String,
    pub engine: ServingEngine,
    pub directory: PathBuf,
    pub server: RenderedFile,
    pub runtime: RenderedFile,
    pub runtime_socket: PathBuf,
    pub allocation: Allocation,
    pub generated_at: DateTime<Utc>,
}

/// Values shared by the engine and pool templates.
pub(crate) struct SiteContext<'a> {
    pub recipe_name: &'a str,
    pub site: &'a str,
    pub listen: SocketAddr,
    pub document_root: PathBuf,
    pub directory: &'a Path,
    pub logs_dir: PathBuf,
    pub run_dir: PathBuf,
    pub socket: &'a Path,
    pub header: String,
}

/// Which pool template a runtime series takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolTemplate {
    /// PHP 7.0 - 7.2, before `decorate_workers_output`.
    Legacy,
    Modern,
}

impl PoolTemplate {
    fn for_version(version: &RuntimeVersion) -> Option<Self> {
        match (version.major, version.minor) {
            (7, 0..=2) => Some(PoolTemplate::Legacy),
            (7, _) | (8, _) => Some(PoolTemplate::Modern),
            _ => None,
        }
    }
}

/// Writes nginx/apache and PHP-FPM configuration under `<home>/sites/<recipe>/`.
/// Nothing else writes to that directory.
pub struct ConfigRenderer {
    sites_dir: PathBuf,
    engines: EngineConfig,
    supported_versions: Vec<String>,
    document_subdir: String,
}

impl ConfigRenderer {
    pub fn new(config: &FurnaceConfig) -> Self {
        Self {
            sites_dir: config.sites_dir(),
            engines: config.engines.clone(),
            supported_versions: config.runtimes.supported_versions.clone(),
            document_subdir: config.sites.document_subdir.clone(),
        }
    }

    pub fn site_dir(&self, recipe_name: &str) -> PathBuf {
        self.sites_dir.join(recipe_name)
    }

    /// Builds the configuration without touching the filesystem. Same
    /// inputs and timestamp give byte-identical output.
    pub fn render_at(
        &self,
        recipe: &Recipe,
        allocation: &Allocation,
        generated_at: DateTime<Utc>,
    ) -> FurnaceResult<RenderedConfig> {
        let render_error = |reason: String| FurnaceError::RenderError {
            recipe: recipe.name.clone(),
            reason,
        };

        if !self.engines.enabled.contains(&recipe.serving_engine) {
            return Err(render_error(format!(
                "serving engine {} is not enabled",
                recipe.serving_engine
            )));
        }

        let version = RuntimeVersion::parse(&recipe.runtime_version).ok_or_else(|| {
            render_error(format!("invalid runtime version '{}'", recipe.runtime_version))
        })?;
        let series = version.series();
        if !self.supported_versions.iter().any(|v| *v == series) {
            return Err(render_error(format!(
                "PHP {} is not a supported runtime ({})",
                series,
                self.supported_versions.join(", ")
            )));
        }
        let pool = PoolTemplate::for_version(&version)
            .ok_or_else(|| render_error(format!("no PHP-FPM pool template for PHP {}", series)))?;

        let directory = self.site_dir(&recipe.name);
        let socket = directory.join("run").join(RUNTIME_SOCKET_FILE);
        let document_root = if self.document_subdir.is_empty() {
            recipe.project_path.clone()
        } else {
            recipe.project_path.join(&self.document_subdir)
        };

        let ctx = SiteContext {
            recipe_name: &recipe.name,
            site: allocation.hostname(),
            listen: SocketAddr::new(allocation.address(), allocation.port),
            document_root,
            directory: &directory,
            logs_dir: directory.join("logs"),
            run_dir: directory.join("run"),
            socket: &socket,
            header: format!(
                "Generated by furnace for recipe '{}' at {}. Do not edit.",
                recipe.name,
                generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        };

        let server = match recipe.serving_engine {
            ServingEngine::Nginx => RenderedFile {
                path: directory.join("nginx.conf"),
                contents: nginx::render(&ctx),
            },
            ServingEngine::Apache => RenderedFile {
                path: directory.join("httpd.conf"),
                contents: apache::render(&ctx, &self.engines.apache_modules_dir),
            },
        };
        let runtime = RenderedFile {
            path: directory.join(RUNTIME_CONFIG_FILE),
            contents: php_fpm::render(&ctx, pool),
        };

        Ok(RenderedConfig {
            recipe_name: recipe.name.clone(),
            engine: recipe.serving_engine,
            directory: directory.clone(),
            server,
            runtime,
            runtime_socket: socket.clone(),
            allocation: allocation.clone(),
            generated_at,
        })
    }

    /// Renders and writes the configuration. Each file is written to a
    /// temporary sibling and renamed into place.
    pub async fn render(&self, recipe: &Recipe, allocation: &Allocation) -> FurnaceResult<RenderedConfig> {
        let rendered = self.render_at(recipe, allocation, Utc::now())?;
        let io_error = |e: std::io::Error| FurnaceError::RenderError {
            recipe: recipe.name.clone(),
            reason: format!("cannot write {}: {}", rendered.directory.display(), e),
        };

        for dir in ["logs", "run"] {
            fs::create_dir_all(rendered.directory.join(dir))
                .await
                .map_err(io_error)?;
        }
        // A stale socket from a killed runtime makes PHP-FPM refuse to start.
        match fs::remove_file(&rendered.runtime_socket).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(io_error(e)),
            _ => {}
        }

        for file in [&rendered.server, &rendered.runtime] {
            write_atomically(file).await.map_err(io_error)?;
        }

        info!(
            "Rendered {} config for '{}' in {}",
            rendered.engine,
            recipe.name,
            rendered.directory.display()
        );
        Ok(rendered)
    }

    /// Deletes a recipe's rendered directory. Missing directories are fine.
    pub async fn remove(&self, recipe_name: &str) -> FurnaceResult<()> {
        let dir = self.site_dir(recipe_name);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Removed rendered config {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Recipes that currently have a rendered directory.
    pub async fn rendered_recipes(&self) -> FurnaceResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.sites_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

async fn write_atomically(file: &RenderedFile) -> std::io::Result<()> {
    let mut tmp = file.path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, &file.contents).await?;
    fs::rename(&tmp, &file.path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HostnameBinding;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;
    use test_case::test_case;

    fn renderer(home: &Path) -> ConfigRenderer {
        ConfigRenderer::new(&FurnaceConfig::for_home(home))
    }

    fn recipe(engine: ServingEngine, version: &str) -> Recipe {
        Recipe::new("alpha", "/srv/alpha", version, engine, "alpha.test")
    }

    fn allocation() -> Allocation {
        Allocation {
            recipe_name: "alpha".into(),
            port: 8081,
            hostname_binding: HostnameBinding {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                hostname: "alpha.test".into(),
            },
        }
    }

    fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn rendering_is_deterministic() {
        let renderer = renderer(Path::new("/home/dev/.furnace"));
        let first = renderer
            .render_at(&recipe(ServingEngine::Nginx, "8.2"), &allocation(), timestamp())
            .unwrap();
        let second = renderer
            .render_at(&recipe(ServingEngine::Nginx, "8.2"), &allocation(), timestamp())
            .unwrap();
        assert_eq!(first, second);
        assert!(first
            .server
            .contents
            .starts_with("# Generated by furnace for recipe 'alpha' at 2024-05-01T12:00:00Z"));
    }

    #[test]
    fn nginx_config_routes_site_to_pool_socket() {
        let renderer = renderer(Path::new("/home/dev/.furnace"));
        let rendered = renderer
            .render_at(&recipe(ServingEngine::Nginx, "8.2"), &allocation(), timestamp())
            .unwrap();

        let conf = &rendered.server.contents;
        assert_eq!(
            rendered.server.path,
            PathBuf::from("/home/dev/.furnace/sites/alpha/nginx.conf")
        );
        assert!(conf.contains("listen 127.0.0.1:8081;"));
        assert!(conf.contains("server_name alpha.test;"));
        assert!(conf.contains("root /srv/alpha/public;"));
        assert!(conf.contains("fastcgi_pass unix:/home/dev/.furnace/sites/alpha/run/php-fpm.sock;"));
        assert!(conf.contains("daemon off;"));
    }

    #[test]
    fn apache_config_proxies_php_to_pool_socket() {
        let renderer = renderer(Path::new("/home/dev/.furnace"));
        let rendered = renderer
            .render_at(&recipe(ServingEngine::Apache, "8.3"), &allocation(), timestamp())
            .unwrap();

        let conf = &rendered.server.contents;
        assert!(rendered.server.path.ends_with("httpd.conf"));
        assert!(conf.contains("Listen 127.0.0.1:8081"));
        assert!(conf.contains("<VirtualHost 127.0.0.1:8081>"));
        assert!(conf.contains("ServerName alpha.test"));
        assert!(conf.contains(
            "SetHandler \"proxy:unix:/home/dev/.furnace/sites/alpha/run/php-fpm.sock|fcgi://localhost/\""
        ));
    }

    #[test]
    fn pool_is_named_after_recipe_and_stays_in_foreground() {
        let renderer = renderer(Path::new("/home/dev/.furnace"));
        let rendered = renderer
            .render_at(&recipe(ServingEngine::Nginx, "8.2"), &allocation(), timestamp())
            .unwrap();

        let pool = &rendered.runtime.contents;
        assert!(pool.contains("daemonize = no"));
        assert!(pool.contains("[alpha]"));
        assert!(pool.contains("listen = /home/dev/.furnace/sites/alpha/run/php-fpm.sock"));
        assert!(pool.contains("decorate_workers_output = no"));
    }

    #[test]
    fn legacy_runtime_gets_legacy_pool() {
        let mut config = FurnaceConfig::for_home("/home/dev/.furnace");
        config.runtimes.supported_versions.push("7.1".into());
        let rendered = ConfigRenderer::new(&config)
            .render_at(&recipe(ServingEngine::Nginx, "7.1"), &allocation(), timestamp())
            .unwrap();
        assert!(!rendered.runtime.contents.contains("decorate_workers_output"));
    }

    #[test_case("5.6" ; "unsupported")]
    #[test_case("9.0" ; "future major")]
    fn unsupported_runtime_is_a_render_error(version: &str) {
        let mut config = FurnaceConfig::for_home("/home/dev/.furnace");
        config.runtimes.supported_versions.push(version.into());
        let err = ConfigRenderer::new(&config)
            .render_at(&recipe(ServingEngine::Nginx, version), &allocation(), timestamp())
            .unwrap_err();
        assert!(matches!(err, FurnaceError::RenderError { .. }));
    }

    #[test]
    fn version_outside_supported_list_is_rejected() {
        let renderer = renderer(Path::new("/home/dev/.furnace"));
        let err = renderer
            .render_at(&recipe(ServingEngine::Nginx, "7.3"), &allocation(), timestamp())
            .unwrap_err();
        assert!(err.to_string().contains("not a supported runtime"));
    }

    #[test]
    fn disabled_engine_is_a_render_error() {
        let mut config = FurnaceConfig::for_home("/home/dev/.furnace");
        config.engines.enabled = vec![ServingEngine::Nginx];
        let err = ConfigRenderer::new(&config)
            .render_at(&recipe(ServingEngine::Apache, "8.2"), &allocation(), timestamp())
            .unwrap_err();
        assert!(matches!(err, FurnaceError::RenderError { .. }));
    }

    #[tokio::test]
    async fn render_writes_files_and_remove_cleans_up() {
        let home = tempdir().unwrap();
        let renderer = renderer(home.path());
        let rendered = renderer
            .render(&recipe(ServingEngine::Nginx, "8.2"), &allocation())
            .await
            .unwrap();

        let on_disk = std::fs::read_to_string(&rendered.server.path).unwrap();
        assert_eq!(on_disk, rendered.server.contents);
        assert!(rendered.directory.join("logs").is_dir());
        assert!(rendered.directory.join("run").is_dir());
        assert_eq!(renderer.rendered_recipes().await.unwrap(), vec!["alpha".to_string()]);

        renderer.remove("alpha").await.unwrap();
        renderer.remove("alpha").await.unwrap();
        assert!(!rendered.directory.exists());
        assert!(renderer.rendered_recipes().await.unwrap().is_empty());
    }
}
