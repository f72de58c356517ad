use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Stage of an orchestration sequence an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Validate,
    Allocate,
    Render,
    Launch,
    HealthCheck,
    Supervise,
    Stop,
    Store,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Validate => "validate",
            Stage::Allocate => "allocate",
            Stage::Render => "render",
            Stage::Launch => "launch",
            Stage::HealthCheck => "health check",
            Stage::Supervise => "supervise",
            Stage::Stop => "stop",
            Stage::Store => "store",
        };
        f.write_str(name)
    }
}

/// Serialisable error category, one per `FurnaceError` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ResourceExhausted,
    RenderError,
    LaunchError,
    HealthCheckTimeout,
    Crashed,
    StartFailed,
    Cancelled,
    InvalidRecipe,
    InvalidRequest,
    StoreUnavailable,
    HomeLocked,
    ConfigError,
    Internal,
    Io,
}

#[derive(Error, Debug)]
pub enum FurnaceError {
    #[error("recipe '{0}' not found")]
    NotFound(String),

    #[error("conflict on recipe '{recipe}': {reason}")]
    Conflict { recipe: String, reason: String },

    #[error("no free port in {start}-{end} for recipe '{recipe}'")]
    ResourceExhausted { recipe: String, start: u16, end: u16 },

    #[error("cannot render config for recipe '{recipe}': {reason}")]
    RenderError { recipe: String, reason: String },

    #[error("failed to launch {role} for recipe '{recipe}': {reason}")]
    LaunchError {
        recipe: String,
        role: String,
        reason: String,
    },

    #[error("recipe '{recipe}' was not healthy after {}ms{}", .timeout.as_millis(), detail_suffix(.detail))]
    HealthCheckTimeout {
        recipe: String,
        timeout: Duration,
        detail: Option<String>,
    },

    #[error("{role} for recipe '{recipe}' crashed: {detail}")]
    Crashed {
        recipe: String,
        role: String,
        detail: String,
    },

    #[error("recipe '{recipe}' failed to start during {stage}: {cause}")]
    StartFailed {
        recipe: String,
        stage: Stage,
        cause: Box<FurnaceError>,
    },

    #[error("start of recipe '{0}' was cancelled")]
    Cancelled(String),

    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),

    #[error("recipe store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("furnace home {} is in use by {}", .home.display(), owner_suffix(.pid))]
    HomeLocked { home: PathBuf, pid: Option<u32> },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn owner_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!("furnace process {}", pid),
        None => "another furnace process".to_string(),
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_ref()
        .map(|d| format!(" (last probe: {})", d))
        .unwrap_or_default()
}

impl FurnaceError {
    pub fn conflict(recipe: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            recipe: recipe.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FurnaceError::NotFound(_) => ErrorKind::NotFound,
            FurnaceError::Conflict { .. } => ErrorKind::Conflict,
            FurnaceError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            FurnaceError::RenderError { .. } => ErrorKind::RenderError,
            FurnaceError::LaunchError { .. } => ErrorKind::LaunchError,
            FurnaceError::HealthCheckTimeout { .. } => ErrorKind::HealthCheckTimeout,
            FurnaceError::Crashed { .. } => ErrorKind::Crashed,
            FurnaceError::StartFailed { .. } => ErrorKind::StartFailed,
            FurnaceError::Cancelled(_) => ErrorKind::Cancelled,
            FurnaceError::InvalidRecipe(_) => ErrorKind::InvalidRecipe,
            FurnaceError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            FurnaceError::HomeLocked { .. } => ErrorKind::HomeLocked,
            FurnaceError::ConfigError(_) => ErrorKind::ConfigError,
            FurnaceError::Internal(_) => ErrorKind::Internal,
            FurnaceError::IoError(_) => ErrorKind::Io,
        }
    }

    /// Name of the recipe the error concerns, when known.
    pub fn recipe(&self) -> Option<&str> {
        match self {
            FurnaceError::NotFound(recipe) | FurnaceError::Cancelled(recipe) => Some(recipe),
            FurnaceError::Conflict { recipe, .. }
            | FurnaceError::ResourceExhausted { recipe, .. }
            | FurnaceError::RenderError { recipe, .. }
            | FurnaceError::LaunchError { recipe, .. }
            | FurnaceError::HealthCheckTimeout { recipe, .. }
            | FurnaceError::Crashed { recipe, .. }
            | FurnaceError::StartFailed { recipe, .. } => Some(recipe),
            _ => None,
        }
    }

    /// Stage the error was raised in, when it belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            FurnaceError::StartFailed { stage, .. } => Some(*stage),
            FurnaceError::NotFound(_) => Some(Stage::Load),
            FurnaceError::InvalidRecipe(_) => Some(Stage::Validate),
            FurnaceError::ResourceExhausted { .. } => Some(Stage::Allocate),
            FurnaceError::RenderError { .. } => Some(Stage::Render),
            FurnaceError::LaunchError { .. } => Some(Stage::Launch),
            FurnaceError::HealthCheckTimeout { .. } | FurnaceError::Cancelled(_) => {
                Some(Stage::HealthCheck)
            }
            FurnaceError::Crashed { .. } => Some(Stage::Supervise),
            FurnaceError::StoreUnavailable(_) => Some(Stage::Store),
            _ => None,
        }
    }

    /// Innermost error, unwrapping `StartFailed`.
    pub fn root_cause(&self) -> &FurnaceError {
        match self {
            FurnaceError::StartFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

pub type FurnaceResult<T> = Result<T, FurnaceError>;
