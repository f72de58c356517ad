//! Reader for the per-file YAML recipes (`~/.furnace/recipes/<name>.yml`)
//! written by earlier furnace releases.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::core::{FurnaceResult, Recipe, ServingEngine};
use crate::detection::extract_major_minor;

#[derive(Debug, Deserialize)]
struct LegacyRecipe {
    name: String,
    path: String,
    php_version: String,
    serve_with: String,
    site: String,
}

impl LegacyRecipe {
    fn into_recipe(self) -> FurnaceResult<Recipe> {
        let engine: ServingEngine = self.serve_with.parse()?;
        Ok(Recipe::new(
            self.name,
            PathBuf::from(self.path),
            extract_major_minor(&self.php_version),
            engine,
            self.site,
        ))
    }
}

/// Reads every `*.yml`/`*.yaml` recipe in `dir`, skipping unreadable files.
/// A missing directory yields no recipes.
pub async fn read_recipe_dir(dir: &Path) -> FurnaceResult<Vec<Recipe>> {
    let mut recipes = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(recipes),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if !is_yaml {
            continue;
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let parsed = serde_yaml::from_str::<LegacyRecipe>(&content)
            .map_err(|e| e.to_string())
            .and_then(|legacy| legacy.into_recipe().map_err(|e| e.to_string()));

        match parsed {
            Ok(recipe) => recipes.push(recipe),
            Err(e) => warn!("Skipping legacy recipe {}: {}", path.display(), e),
        }
    }

    recipes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(recipes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reads_legacy_yaml_recipes() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("shop.yml"),
            "name: shop\npath: /home/dev/shop\nphp_version: '^8.2'\nserve_with: apache\nsite: shop.test\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yml"), "name: [unclosed").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let recipes = read_recipe_dir(dir.path()).await.unwrap();
        assert_eq!(recipes.len(), 1);
        let shop = &recipes[0];
        assert_eq!(shop.name, "shop");
        assert_eq!(shop.runtime_version, "8.2");
        assert_eq!(shop.serving_engine, ServingEngine::Apache);
        assert_eq!(shop.site_hostname, "shop.test");
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let recipes = read_recipe_dir(&dir.path().join("nope")).await.unwrap();
        assert!(recipes.is_empty());
    }
}
