use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::core::{EnvironmentState, FurnaceError, FurnaceResult, Recipe};

pub mod legacy;
pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Durable persistence for recipes. Any error returned here is treated as
/// the store being unavailable, except `Conflict` on a uniqueness violation.
#[async_trait]
pub trait RecipeBackend: Send + Sync {
    async fn load_all(&self) -> FurnaceResult<Vec<Recipe>>;
    async fn insert(&self, recipe: &Recipe) -> FurnaceResult<()>;
    async fn update(&self, recipe: &Recipe) -> FurnaceResult<()>;
    async fn remove(&self, name: &str) -> FurnaceResult<()>;
}

#[derive(Default)]
struct StoreState {
    recipes: BTreeMap<String, Recipe>,
    unavailable: Option<String>,
}

/// Recipe store: a write-through cache over a [`RecipeBackend`].
///
/// Mutations hold the write lock across check, persist and cache update, so
/// concurrent callers never observe a partial write. After a backend failure
/// the store is latched unavailable: reads keep serving the cached recipes,
/// and each mutation first retries the backend, refusing only while it is
/// still failing.
pub struct RecipeStore {
    backend: Arc<dyn RecipeBackend>,
    state: RwLock<StoreState>,
}

impl RecipeStore {
    pub async fn open(backend: Arc<dyn RecipeBackend>) -> FurnaceResult<Self> {
        let recipes = backend.load_all().await?;
        info!("Loaded {} recipe(s) from store", recipes.len());

        let state = StoreState {
            recipes: recipes.into_iter().map(|r| (r.name.clone(), r)).collect(),
            unavailable: None,
        };

        Ok(Self {
            backend,
            state: RwLock::new(state),
        })
    }

    pub async fn in_memory() -> FurnaceResult<Self> {
        Self::open(Arc::new(MemoryBackend::new())).await
    }

    pub async fn list(&self) -> Vec<Recipe> {
        self.state.read().await.recipes.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> FurnaceResult<Recipe> {
        self.state
            .read()
            .await
            .recipes
            .get(name)
            .cloned()
            .ok_or_else(|| FurnaceError::NotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.recipes.contains_key(name)
    }

    pub async fn is_available(&self) -> bool {
        self.state.read().await.unavailable.is_none()
    }

    /// Reason the store was marked unavailable, if it is.
    pub async fn unavailable_reason(&self) -> Option<String> {
        self.state.read().await.unavailable.clone()
    }

    pub async fn put(&self, recipe: Recipe) -> FurnaceResult<()> {
        let mut state = self.state.write().await;
        self.revive(&mut state).await?;

        if state.recipes.contains_key(&recipe.name) {
            return Err(FurnaceError::conflict(
                &recipe.name,
                "a recipe with this name already exists",
            ));
        }
        if let Some(owner) = hostname_owner(&state, &recipe.site_hostname, &recipe.name) {
            return Err(FurnaceError::conflict(
                &recipe.name,
                format!(
                    "site '{}' is already used by recipe '{}'",
                    recipe.site_hostname, owner
                ),
            ));
        }

        let mut recipe = recipe;
        recipe.last_known_state = None;
        persist(&mut state, self.backend.insert(&recipe).await)?;
        info!("Stored recipe '{}' ({})", recipe.name, recipe.site_hostname);
        state.recipes.insert(recipe.name.clone(), recipe);
        Ok(())
    }

    pub async fn update(&self, recipe: Recipe) -> FurnaceResult<()> {
        let mut state = self.state.write().await;
        self.revive(&mut state).await?;

        let previous = state
            .recipes
            .get(&recipe.name)
            .ok_or_else(|| FurnaceError::NotFound(recipe.name.clone()))?;
        let last_known_state = previous.last_known_state;

        if let Some(owner) = hostname_owner(&state, &recipe.site_hostname, &recipe.name) {
            return Err(FurnaceError::conflict(
                &recipe.name,
                format!(
                    "site '{}' is already used by recipe '{}'",
                    recipe.site_hostname, owner
                ),
            ));
        }

        let mut recipe = recipe;
        recipe.last_known_state = last_known_state;
        persist(&mut state, self.backend.update(&recipe).await)?;
        info!("Updated recipe '{}'", recipe.name);
        state.recipes.insert(recipe.name.clone(), recipe);
        Ok(())
    }

    /// Removes a recipe. Callers check that no environment is running for it.
    pub async fn delete(&self, name: &str) -> FurnaceResult<()> {
        let mut state = self.state.write().await;
        self.revive(&mut state).await?;

        if !state.recipes.contains_key(name) {
            return Err(FurnaceError::NotFound(name.to_string()));
        }

        persist(&mut state, self.backend.remove(name).await)?;
        state.recipes.remove(name);
        info!("Deleted recipe '{}'", name);
        Ok(())
    }

    /// Records the last state the orchestrator observed for a recipe.
    /// Best effort: a failure marks the store unavailable but is not returned.
    pub async fn annotate_state(&self, name: &str, new_state: EnvironmentState) {
        let mut state = self.state.write().await;
        if state.unavailable.is_some() {
            return;
        }

        let Some(mut recipe) = state.recipes.get(name).cloned() else {
            return;
        };
        if recipe.last_known_state == Some(new_state) {
            return;
        }
        recipe.last_known_state = Some(new_state);

        match self.backend.update(&recipe).await {
            Ok(()) => {
                state.recipes.insert(recipe.name.clone(), recipe);
            }
            Err(e) => {
                error!("Failed to record state of recipe '{}': {}", name, e);
                state.unavailable = Some(unavailable_reason(e));
            }
        }
    }

    /// Fails with `StoreUnavailable` unless writes can go through, retrying
    /// the backend first when the store is latched.
    pub async fn ensure_writable(&self) -> FurnaceResult<()> {
        let mut state = self.state.write().await;
        self.revive(&mut state).await
    }

    /// Reloads everything from the backend and clears the unavailable flag.
    pub async fn recover(&self) -> FurnaceResult<()> {
        let mut state = self.state.write().await;
        self.reload(&mut state).await
    }

    async fn revive(&self, state: &mut StoreState) -> FurnaceResult<()> {
        if state.unavailable.is_none() {
            return Ok(());
        }
        self.reload(state).await
    }

    async fn reload(&self, state: &mut StoreState) -> FurnaceResult<()> {
        match self.backend.load_all().await {
            Ok(recipes) => {
                state.recipes = recipes.into_iter().map(|r| (r.name.clone(), r)).collect();
                if state.unavailable.take().is_some() {
                    info!("Recipe store recovered");
                }
                Ok(())
            }
            Err(e) => {
                let reason = unavailable_reason(e);
                state.unavailable = Some(reason.clone());
                Err(FurnaceError::StoreUnavailable(reason))
            }
        }
    }
}

fn unavailable_reason(error: FurnaceError) -> String {
    match error {
        FurnaceError::StoreUnavailable(reason) => reason,
        other => other.to_string(),
    }
}

fn hostname_owner<'a>(state: &'a StoreState, hostname: &str, except: &str) -> Option<&'a str> {
    state
        .recipes
        .values()
        .find(|r| r.name != except && r.site_hostname.eq_ignore_ascii_case(hostname))
        .map(|r| r.name.as_str())
}

fn persist(state: &mut StoreState, result: FurnaceResult<()>) -> FurnaceResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(conflict @ FurnaceError::Conflict { .. }) => Err(conflict),
        Err(e) => {
            warn!("Recipe store write failed, refusing further writes: {}", e);
            let reason = unavailable_reason(e);
            state.unavailable = Some(reason.clone());
            Err(FurnaceError::StoreUnavailable(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServingEngine;
    use pretty_assertions::assert_eq;

    fn recipe(name: &str, site: &str) -> Recipe {
        Recipe::new(name, format!("/srv/{}", name), "8.2", ServingEngine::Nginx, site)
    }

    #[tokio::test]
    async fn put_get_list_delete() {
        let store = RecipeStore::in_memory().await.unwrap();
        store.put(recipe("beta", "beta.test")).await.unwrap();
        store.put(recipe("alpha", "alpha.test")).await.unwrap();

        let names: Vec<String> = store.list().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(store.get("alpha").await.unwrap().site_hostname, "alpha.test");

        store.delete("alpha").await.unwrap();
        assert!(matches!(
            store.get("alpha").await,
            Err(FurnaceError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("alpha").await,
            Err(FurnaceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_hostname_is_rejected_without_change() {
        let store = RecipeStore::in_memory().await.unwrap();
        store.put(recipe("alpha", "shared.test")).await.unwrap();

        let err = store.put(recipe("beta", "shared.test")).await.unwrap_err();
        assert!(matches!(err, FurnaceError::Conflict { .. }));
        assert_eq!(store.list().await.len(), 1);
        assert!(!store.contains("beta").await);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let store = RecipeStore::in_memory().await.unwrap();
        store.put(recipe("alpha", "alpha.test")).await.unwrap();
        let err = store.put(recipe("alpha", "other.test")).await.unwrap_err();
        assert!(matches!(err, FurnaceError::Conflict { .. }));
        assert_eq!(store.get("alpha").await.unwrap().site_hostname, "alpha.test");
    }

    #[tokio::test]
    async fn update_keeps_annotation_and_checks_hostnames() {
        let store = RecipeStore::in_memory().await.unwrap();
        store.put(recipe("alpha", "alpha.test")).await.unwrap();
        store.put(recipe("beta", "beta.test")).await.unwrap();
        store.annotate_state("alpha", EnvironmentState::Running).await;

        let mut edited = recipe("alpha", "alpha.test");
        edited.runtime_version = "8.3".into();
        store.update(edited).await.unwrap();

        let stored = store.get("alpha").await.unwrap();
        assert_eq!(stored.runtime_version, "8.3");
        assert_eq!(stored.last_known_state, Some(EnvironmentState::Running));

        let err = store.update(recipe("alpha", "beta.test")).await.unwrap_err();
        assert!(matches!(err, FurnaceError::Conflict { .. }));
    }

    #[tokio::test]
    async fn backend_failure_blocks_writes_but_serves_reads() {
        let backend = Arc::new(MemoryBackend::new());
        let store = RecipeStore::open(backend.clone()).await.unwrap();
        store.put(recipe("alpha", "alpha.test")).await.unwrap();

        backend.set_failing(true);
        let err = store.put(recipe("beta", "beta.test")).await.unwrap_err();
        assert!(matches!(err, FurnaceError::StoreUnavailable(_)));
        assert!(!store.is_available().await);

        let err = store.delete("alpha").await.unwrap_err();
        assert!(matches!(err, FurnaceError::StoreUnavailable(_)));
        assert_eq!(store.get("alpha").await.unwrap().name, "alpha");
        assert!(store.ensure_writable().await.is_err());
        assert!(store.recover().await.is_err());
    }

    #[tokio::test]
    async fn healthy_backend_clears_the_latch_on_next_write() {
        let backend = Arc::new(MemoryBackend::new());
        let store = RecipeStore::open(backend.clone()).await.unwrap();
        store.put(recipe("alpha", "alpha.test")).await.unwrap();

        backend.set_failing(true);
        store.annotate_state("alpha", EnvironmentState::Starting).await;
        assert!(!store.is_available().await);

        backend.set_failing(false);
        store.put(recipe("beta", "beta.test")).await.unwrap();
        assert!(store.is_available().await);
        assert_eq!(store.list().await.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_reason_is_not_nested() {
        let backend = Arc::new(MemoryBackend::new());
        let store = RecipeStore::open(backend.clone()).await.unwrap();
        backend.set_failing(true);

        let err = store.put(recipe("alpha", "alpha.test")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "recipe store unavailable: memory backend is failing"
        );
        assert_eq!(
            store.unavailable_reason().await.as_deref(),
            Some("memory backend is failing")
        );
    }
}
