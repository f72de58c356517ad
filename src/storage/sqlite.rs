use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
    FromRow, Sqlite,
};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::RecipeBackend;
use crate::core::{EnvironmentState, FurnaceError, FurnaceResult, Recipe, ServingEngine};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS recipes (
    name TEXT PRIMARY KEY NOT NULL,
    project_path TEXT NOT NULL,
    runtime_version TEXT NOT NULL,
    serving_engine TEXT NOT NULL,
    site_hostname TEXT NOT NULL UNIQUE,
    last_known_state TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

#[derive(Debug, Clone, FromRow)]
struct StoredRecipe {
    name: String,
    project_path: String,
    runtime_version: String,
    serving_engine: String,
    site_hostname: String,
    last_known_state: Option<String>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    #[allow(dead_code)]
    updated_at: DateTime<Utc>,
}

impl StoredRecipe {
    fn into_recipe(self) -> FurnaceResult<Recipe> {
        let serving_engine: ServingEngine = self.serving_engine.parse().map_err(|_| {
            FurnaceError::StoreUnavailable(format!(
                "recipe '{}' has unknown serving engine '{}'",
                self.name, self.serving_engine
            ))
        })?;
        let last_known_state = self
            .last_known_state
            .as_deref()
            .map(str::parse::<EnvironmentState>)
            .transpose()
            .map_err(|e| FurnaceError::StoreUnavailable(e.to_string()))?;

        Ok(Recipe {
            name: self.name,
            project_path: PathBuf::from(self.project_path),
            runtime_version: self.runtime_version,
            serving_engine,
            site_hostname: self.site_hostname,
            last_known_state,
        })
    }
}

/// SQLite-backed recipe persistence.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub async fn open(path: &Path) -> FurnaceResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}", path.to_string_lossy());
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            Sqlite::create_database(&db_url).await.map_err(store_error)?;
        }

        Self::connect(&db_url).await
    }

    /// Private in-memory database, mainly for tests.
    pub async fn in_memory() -> FurnaceResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(db_url: &str) -> FurnaceResult<Self> {
        // One connection: in-memory databases are per connection, and writes
        // are serialised by the store anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(db_url)
            .await
            .map_err(store_error)?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(store_error)?;

        debug!("Opened recipe database {}", db_url);
        Ok(Self { pool })
    }
}

fn store_error(e: sqlx::Error) -> FurnaceError {
    FurnaceError::StoreUnavailable(e.to_string())
}

fn write_error(recipe: &str, e: sqlx::Error) -> FurnaceError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return FurnaceError::conflict(recipe, "name or site already stored");
        }
    }
    store_error(e)
}

#[async_trait]
impl RecipeBackend for SqliteBackend {
    async fn load_all(&self) -> FurnaceResult<Vec<Recipe>> {
        let rows = sqlx::query_as::<Sqlite, StoredRecipe>(
            "SELECT name, project_path, runtime_version, serving_engine, site_hostname, \
             last_known_state, created_at, updated_at FROM recipes ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter().map(StoredRecipe::into_recipe).collect()
    }

    async fn insert(&self, recipe: &Recipe) -> FurnaceResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO recipes (name, project_path, runtime_version, serving_engine, \
             site_hostname, last_known_state, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&recipe.name)
        .bind(recipe.project_path.to_string_lossy().to_string())
        .bind(&recipe.runtime_version)
        .bind(recipe.serving_engine.as_str())
        .bind(&recipe.site_hostname)
        .bind(recipe.last_known_state.map(|s| s.to_string()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(&recipe.name, e))?;

        Ok(())
    }

    async fn update(&self, recipe: &Recipe) -> FurnaceResult<()> {
        let result = sqlx::query(
            "UPDATE recipes SET project_path = ?, runtime_version = ?, serving_engine = ?, \
             site_hostname = ?, last_known_state = ?, updated_at = ? WHERE name = ?",
        )
        .bind(recipe.project_path.to_string_lossy().to_string())
        .bind(&recipe.runtime_version)
        .bind(recipe.serving_engine.as_str())
        .bind(&recipe.site_hostname)
        .bind(recipe.last_known_state.map(|s| s.to_string()))
        .bind(Utc::now())
        .bind(&recipe.name)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(&recipe.name, e))?;

        if result.rows_affected() == 0 {
            return Err(FurnaceError::NotFound(recipe.name.clone()));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> FurnaceResult<()> {
        sqlx::query("DELETE FROM recipes WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
