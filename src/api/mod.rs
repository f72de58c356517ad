use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{EnvironmentInstance, ErrorKind, FurnaceError, Recipe, Stage};
use crate::environments::EnvironmentOrchestrator;
use crate::monitoring::{StatusReporter, StatusSnapshot};

pub mod server;

pub use server::{serve_lines, serve_stdio};

/// Requests accepted at the external boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    RecipeList,
    FurnaceStatus {
        #[serde(default)]
        recipe_name: Option<String>,
    },
    RecipeStart {
        recipe_name: String,
    },
    RecipeStop {
        recipe_name: String,
    },
    RecipeRestart {
        recipe_name: String,
    },
    RecipeCancel {
        recipe_name: String,
    },
    RecipeCreate {
        recipe: Recipe,
    },
    RecipeUpdate {
        recipe: Recipe,
    },
    RecipeDelete {
        recipe_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeSummary {
    pub name: String,
    pub site: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            message: message.into(),
            recipe: None,
            stage: None,
        }
    }
}

impl From<&FurnaceError> for ApiError {
    fn from(error: &FurnaceError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            recipe: error.recipe().map(str::to_string),
            stage: error.stage(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResponse {
    Recipes { recipes: Vec<RecipeSummary> },
    Status { snapshots: Vec<StatusSnapshot> },
    Instance { instance: EnvironmentInstance },
    Recipe { recipe: Recipe },
    Cancelled { cancelled: bool },
    Ok,
    Error { error: ApiError },
}

impl From<FurnaceError> for ApiResponse {
    fn from(error: FurnaceError) -> Self {
        ApiResponse::Error {
            error: ApiError::from(&error),
        }
    }
}

/// Maps boundary requests onto the orchestrator and status reporter.
#[derive(Clone)]
pub struct FurnaceApi {
    orchestrator: EnvironmentOrchestrator,
    reporter: StatusReporter,
}

impl FurnaceApi {
    pub fn new(orchestrator: EnvironmentOrchestrator) -> Self {
        let reporter = StatusReporter::new(orchestrator.clone());
        Self {
            orchestrator,
            reporter,
        }
    }

    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        debug!("API request: {:?}", request);
        let orchestrator = &self.orchestrator;

        let result = match request {
            ApiRequest::RecipeList => {
                let recipes = orchestrator
                    .store()
                    .list()
                    .await
                    .into_iter()
                    .map(|r| RecipeSummary {
                        name: r.name,
                        site: r.site_hostname,
                    })
                    .collect();
                Ok(ApiResponse::Recipes { recipes })
            }
            ApiRequest::FurnaceStatus { recipe_name: None } => Ok(ApiResponse::Status {
                snapshots: self.reporter.status_all().await,
            }),
            ApiRequest::FurnaceStatus {
                recipe_name: Some(name),
            } => self
                .reporter
                .status(&name)
                .await
                .map(|snapshot| ApiResponse::Status {
                    snapshots: vec![snapshot],
                }),
            ApiRequest::RecipeStart { recipe_name } => orchestrator
                .start(&recipe_name)
                .await
                .map(|instance| ApiResponse::Instance { instance }),
            ApiRequest::RecipeStop { recipe_name } => {
                orchestrator.stop(&recipe_name).await.map(|_| ApiResponse::Ok)
            }
            ApiRequest::RecipeRestart { recipe_name } => orchestrator
                .restart(&recipe_name)
                .await
                .map(|instance| ApiResponse::Instance { instance }),
            ApiRequest::RecipeCancel { recipe_name } => Ok(ApiResponse::Cancelled {
                cancelled: orchestrator.cancel(&recipe_name),
            }),
            ApiRequest::RecipeCreate { recipe } => orchestrator
                .create_recipe(recipe)
                .await
                .map(|recipe| ApiResponse::Recipe { recipe }),
            ApiRequest::RecipeUpdate { recipe } => orchestrator
                .update_recipe(recipe)
                .await
                .map(|recipe| ApiResponse::Recipe { recipe }),
            ApiRequest::RecipeDelete { recipe_name } => orchestrator
                .delete_recipe(&recipe_name)
                .await
                .map(|_| ApiResponse::Ok),
        };

        result.unwrap_or_else(ApiResponse::from)
    }
}
