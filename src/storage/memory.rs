use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::RecipeBackend;
use crate::core::{FurnaceError, FurnaceResult, Recipe};

/// Non-durable backend; `set_failing` simulates storage corruption.
#[derive(Default)]
pub struct MemoryBackend {
    recipes: Mutex<BTreeMap<String, Recipe>>,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> FurnaceResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FurnaceError::StoreUnavailable(
                "memory backend is failing".to_string(),
            ));
        }
        Ok(())
    }

    fn recipes(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Recipe>> {
        self.recipes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecipeBackend for MemoryBackend {
    async fn load_all(&self) -> FurnaceResult<Vec<Recipe>> {
        self.check()?;
        Ok(self.recipes().values().cloned().collect())
    }

    async fn insert(&self, recipe: &Recipe) -> FurnaceResult<()> {
        self.check()?;
        self.recipes().insert(recipe.name.clone(), recipe.clone());
        Ok(())
    }

    async fn update(&self, recipe: &Recipe) -> FurnaceResult<()> {
        self.check()?;
        self.recipes().insert(recipe.name.clone(), recipe.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> FurnaceResult<()> {
        self.check()?;
        self.recipes().remove(name);
        Ok(())
    }
}
