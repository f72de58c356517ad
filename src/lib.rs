//! Furnace runs local PHP development environments: one php-fpm runtime
//! and one nginx or Apache process per recipe, each on its own port and
//! local hostname.

pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod detection;
pub mod environments;
pub mod monitoring;
pub mod storage;
pub mod supervisor;
pub mod templates;

pub use crate::api::{ApiRequest, ApiResponse, FurnaceApi};
pub use crate::config::FurnaceConfig;
pub use crate::core::{FurnaceError, FurnaceResult};
pub use crate::environments::EnvironmentOrchestrator;
