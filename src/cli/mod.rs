use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{serve_stdio, FurnaceApi};
use crate::config::FurnaceConfig;
use crate::core::{EnvironmentState, FurnaceError, Recipe, ServingEngine};
use crate::detection::{installed_runtimes, ProjectDetector};
use crate::environments::EnvironmentOrchestrator;
use crate::monitoring::{StatusReporter, StatusSnapshot};
use crate::storage::{legacy, RecipeStore, SqliteBackend};
use crate::supervisor::ProbeResult;

#[derive(Parser, Debug)]
#[command(name = "furnace", author, version, about = "Local PHP development environments", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to <home>/furnace.toml)
    #[arg(long, global = true, env = "FURNACE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommand,
    },
    /// Show environment status
    Status {
        /// Only this recipe
        name: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Start recipes and keep them running until Ctrl-C
    Up {
        /// Recipes to start (all when omitted)
        names: Vec<String>,
    },
    /// Serve the JSON-lines API on stdin/stdout
    Api,
    /// Installed PHP runtimes
    Php {
        #[command(subcommand)]
        command: PhpCommand,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum RecipeCommand {
    /// List stored recipes
    List,
    /// Create a recipe
    Create {
        name: String,
        /// Project root
        #[arg(long)]
        path: PathBuf,
        /// PHP version (MAJOR.MINOR)
        #[arg(long = "php")]
        php_version: String,
        /// Serving engine (nginx or apache)
        #[arg(long, default_value = "nginx")]
        engine: ServingEngine,
        /// Local hostname, e.g. blog.test
        #[arg(long)]
        site: String,
    },
    /// Change fields of a stored recipe
    Update {
        name: String,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long = "php")]
        php_version: Option<String>,
        #[arg(long)]
        engine: Option<ServingEngine>,
        #[arg(long)]
        site: Option<String>,
    },
    /// Detect a Laravel project and create a recipe for it
    Cook {
        /// Project directory (defaults to the current directory)
        path: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "nginx")]
        engine: ServingEngine,
    },
    /// Import recipe files written by earlier furnace releases
    Import {
        /// Directory of *.yml recipes (defaults to <home>/recipes)
        dir: Option<PathBuf>,
    },
    /// Delete a recipe
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
pub enum PhpCommand {
    /// List installed runtime versions
    List,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write the current configuration to disk
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

impl Cli {
    pub fn load_config(&self) -> Result<FurnaceConfig> {
        match &self.config {
            Some(path) => FurnaceConfig::load_from(path),
            None => FurnaceConfig::load(),
        }
    }
}

pub async fn run(cli: Cli, config: FurnaceConfig) -> Result<()> {
    match cli.command {
        Commands::Recipe {
            command: RecipeCommand::List,
        } => {
            let store = open_store(&config).await?;
            print_recipes(&store.list().await);
            Ok(())
        }
        Commands::Recipe { command } => run_recipe(command, config).await,
        Commands::Status { name, json } => {
            let snapshots = match EnvironmentOrchestrator::open(config.clone()).await {
                Ok(orchestrator) => {
                    let reporter = StatusReporter::new(orchestrator.clone());
                    let snapshots = match name {
                        Some(name) => reporter.status(&name).await.map(|s| vec![s]),
                        None => Ok(reporter.status_all().await),
                    };
                    orchestrator.shutdown().await;
                    snapshots?
                }
                Err(FurnaceError::HomeLocked { pid, .. }) => {
                    // Another furnace process owns the environments; report what it recorded.
                    if !json {
                        let owner = pid.map(|p| format!(" (pid {})", p)).unwrap_or_default();
                        println!(
                            "{}",
                            style(format!("Environments are owned by another furnace process{}; showing recorded states", owner)).dim()
                        );
                    }
                    let store = open_store(&config).await?;
                    match name {
                        Some(name) => vec![StatusSnapshot::from_record(&store.get(&name).await?)],
                        None => store.list().await.iter().map(StatusSnapshot::from_record).collect(),
                    }
                }
                Err(e) => return Err(e.into()),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else {
                print_status_table(&snapshots);
            }
            Ok(())
        }
        Commands::Up { names } => run_up(names, config).await,
        Commands::Api => {
            let orchestrator = EnvironmentOrchestrator::open(config).await?;
            let served = serve_stdio(FurnaceApi::new(orchestrator.clone())).await;
            orchestrator.shutdown().await;
            served.context("API transport failed")
        }
        Commands::Php {
            command: PhpCommand::List,
        } => {
            let runtimes_dir = config.runtimes_dir();
            let versions = installed_runtimes(&runtimes_dir);
            if versions.is_empty() {
                println!("No PHP runtimes installed in {}", runtimes_dir.display());
            }
            for version in versions {
                let marker = if config.runtimes.supported_versions.contains(&version) {
                    style("supported").green()
                } else {
                    style("unsupported").yellow()
                };
                println!("{:<8} {}", style(&version).bold(), marker);
            }
            Ok(())
        }
        Commands::Config { command } => {
            let path = cli.config.unwrap_or_else(|| config.config_path());
            match command {
                ConfigCommand::Init { force } => {
                    if path.exists() && !force {
                        bail!("{} already exists (use --force to overwrite)", path.display());
                    }
                    config.save(&path)?;
                    println!("Wrote {}", style(path.display()).cyan());
                }
                ConfigCommand::Show => {
                    print!("{}", toml::to_string_pretty(&config)?);
                }
            }
            Ok(())
        }
    }
}

async fn run_recipe(command: RecipeCommand, config: FurnaceConfig) -> Result<()> {
    crate::track_performance!("recipe command");
    let orchestrator = EnvironmentOrchestrator::open(config).await?;
    let result = recipe_command(&orchestrator, command).await;
    orchestrator.shutdown().await;
    result
}

async fn recipe_command(orchestrator: &EnvironmentOrchestrator, command: RecipeCommand) -> Result<()> {
    match command {
        RecipeCommand::List => print_recipes(&orchestrator.store().list().await),
        RecipeCommand::Create {
            name,
            path,
            php_version,
            engine,
            site,
        } => {
            let recipe = Recipe::new(name, absolute(path)?, php_version, engine, site);
            let recipe = orchestrator.create_recipe(recipe).await?;
            println!("{} recipe '{}'", style("Created").green().bold(), recipe.name);
        }
        RecipeCommand::Update {
            name,
            path,
            php_version,
            engine,
            site,
        } => {
            let mut recipe = orchestrator.store().get(&name).await?;
            if let Some(path) = path {
                recipe.project_path = absolute(path)?;
            }
            if let Some(version) = php_version {
                recipe.runtime_version = version;
            }
            if let Some(engine) = engine {
                recipe.serving_engine = engine;
            }
            if let Some(site) = site {
                recipe.site_hostname = site;
            }
            let recipe = orchestrator.update_recipe(recipe).await?;
            println!("{} recipe '{}'", style("Updated").green().bold(), recipe.name);
        }
        RecipeCommand::Cook { path, name, engine } => {
            let path = match path {
                Some(path) => absolute(path)?,
                None => std::env::current_dir().context("Failed to read the current directory")?,
            };
            let config = orchestrator.config();
            let tld = config
                .sites
                .allowed_tlds
                .first()
                .context("no local domain configured")?;
            let fallback = installed_runtimes(&config.runtimes_dir())
                .into_iter()
                .filter(|v| config.runtimes.supported_versions.contains(v))
                .last()
                .or_else(|| config.runtimes.supported_versions.last().cloned())
                .context("no supported PHP runtime configured")?;

            let recipe = ProjectDetector::new(&path).suggest_recipe(name, engine, tld, &fallback)?;
            let recipe = orchestrator.create_recipe(recipe).await?;
            println!("{} recipe from {}", style("Cooked").green().bold(), path.display());
            print_recipe(&recipe);
        }
        RecipeCommand::Import { dir } => {
            let dir = dir.unwrap_or_else(|| orchestrator.config().legacy_recipes_dir());
            let mut imported = 0usize;
            for recipe in legacy::read_recipe_dir(&dir).await? {
                let name = recipe.name.clone();
                match orchestrator.create_recipe(recipe).await {
                    Ok(_) => imported += 1,
                    Err(e @ FurnaceError::Conflict { .. }) => {
                        println!("{} {}: {}", style("Skipped").yellow(), name, e)
                    }
                    Err(e) => {
                        warn!("Failed to import '{}': {}", name, e);
                        println!("{} {}: {}", style("Failed").red(), name, e);
                    }
                }
            }
            println!("Imported {} recipe(s) from {}", imported, dir.display());
        }
        RecipeCommand::Delete { name } => {
            orchestrator.delete_recipe(&name).await?;
            println!("{} recipe '{}'", style("Deleted").green().bold(), name);
        }
    }
    Ok(())
}

async fn run_up(names: Vec<String>, config: FurnaceConfig) -> Result<()> {
    let orchestrator = EnvironmentOrchestrator::open(config).await?;
    let names = if names.is_empty() {
        orchestrator
            .store()
            .list()
            .await
            .into_iter()
            .map(|r| r.name)
            .collect()
    } else {
        names
    };
    if names.is_empty() {
        orchestrator.shutdown().await;
        bail!("no recipes to start");
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Starting {} environment(s)", names.len()));

    let results = join_all(names.iter().map(|name| orchestrator.start(name))).await;
    spinner.finish_and_clear();

    let mut running = 0usize;
    for (name, result) in names.iter().zip(results) {
        match result {
            Ok(instance) => {
                running += 1;
                let port = instance.allocation.as_ref().map(|a| a.port).unwrap_or_default();
                println!("{} {} on port {}", style("Running").green().bold(), name, port);
            }
            Err(e) => println!("{} {}: {}", style("Failed").red().bold(), name, e),
        }
    }

    if running == 0 {
        orchestrator.shutdown().await;
        bail!("no environment could be started");
    }

    let reporter = StatusReporter::new(orchestrator.clone());
    print_status_table(&reporter.status_all().await);
    println!("{}", style("Press Ctrl-C to stop").dim());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, stopping environments");

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.yellow} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Stopping environments");
    orchestrator.shutdown().await;
    spinner.finish_with_message("Stopped");
    Ok(())
}

/// Opens the recipe store without taking ownership of the home, for
/// read-only commands.
async fn open_store(config: &FurnaceConfig) -> Result<RecipeStore> {
    let backend = Arc::new(SqliteBackend::open(&config.store_path()).await?);
    Ok(RecipeStore::open(backend).await?)
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    std::fs::canonicalize(&path).with_context(|| format!("Project path {} not found", path.display()))
}

fn print_recipes(recipes: &[Recipe]) {
    if recipes.is_empty() {
        println!("No recipes yet. Create one with `furnace recipe create` or `furnace recipe cook`.");
    }
    for recipe in recipes {
        print_recipe(recipe);
    }
}

fn print_recipe(recipe: &Recipe) {
    println!(
        "{:<20} {:<24} php {:<5} {:<7} {}",
        style(&recipe.name).bold(),
        style(&recipe.site_hostname).cyan(),
        recipe.runtime_version,
        recipe.serving_engine,
        recipe.project_path.display()
    );
}

fn print_status_table(snapshots: &[StatusSnapshot]) {
    if snapshots.is_empty() {
        println!("No recipes.");
        return;
    }

    println!(
        "{}",
        style(format!(
            "{:<20} {:<16} {:<6} {:<24} {:<9} {}",
            "NAME", "STATE", "PORT", "SITE", "UPTIME", "HEALTH"
        ))
        .bold()
    );
    for snapshot in snapshots {
        let state = format!("{:<16}", snapshot.state.to_string());
        let state = match snapshot.state {
            EnvironmentState::Running => style(state).green(),
            EnvironmentState::Failed => style(state).red(),
            EnvironmentState::Stopped => style(state).dim(),
            _ => style(state).yellow(),
        };
        let port = snapshot.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let uptime = snapshot
            .uptime_secs
            .map(format_uptime)
            .unwrap_or_else(|| "-".into());
        let health = match &snapshot.health {
            Some(ProbeResult::Healthy) => "healthy".to_string(),
            Some(ProbeResult::Unhealthy { reason }) => format!("unhealthy: {}", reason),
            Some(ProbeResult::Exited { role, code }) => match code {
                Some(code) => format!("{} exited ({})", role, code),
                None => format!("{} killed", role),
            },
            None => "-".to_string(),
        };

        println!(
            "{:<20} {} {:<6} {:<24} {:<9} {}",
            snapshot.name, state, port, snapshot.site, uptime, health
        );
        if let Some(error) = &snapshot.last_error {
            println!("  {}", style(error).red());
        }
    }
}

fn format_uptime(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}
