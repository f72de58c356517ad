pub mod error;
pub mod types;

pub use error::{ErrorKind, FurnaceError, FurnaceResult, Stage};
pub use types::{
    Allocation, EnvironmentInstance, EnvironmentState, HostnameBinding, Recipe, RuntimeVersion,
    ServingEngine,
};
