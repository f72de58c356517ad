use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::core::{FurnaceError, FurnaceResult, Recipe, RuntimeVersion, ServingEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectKind {
    Laravel,
    Composer,
    Unknown,
}

/// Inspects a project directory to suggest a recipe for it.
#[derive(Debug, Clone)]
pub struct ProjectDetector {
    pub base_path: PathBuf,
}

impl ProjectDetector {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn detect_project_kind(&self) -> ProjectKind {
        let has_composer = self.base_path.join("composer.json").is_file();
        if has_composer && self.base_path.join("artisan").is_file() {
            ProjectKind::Laravel
        } else if has_composer {
            ProjectKind::Composer
        } else {
            ProjectKind::Unknown
        }
    }

    /// PHP series required by `composer.json` (`require.php`), if declared.
    pub fn required_runtime(&self) -> Option<String> {
        let content = std::fs::read_to_string(self.base_path.join("composer.json")).ok()?;
        let json: Value = serde_json::from_str(&content).ok()?;
        let constraint = json.get("require")?.get("php")?.as_str()?;
        let series = extract_major_minor(constraint);
        RuntimeVersion::parse(&series).map(|v| v.series())
    }

    /// Builds a recipe for this project. Fails unless it is a Laravel project.
    pub fn suggest_recipe(
        &self,
        name: Option<String>,
        engine: ServingEngine,
        tld: &str,
        fallback_runtime: &str,
    ) -> FurnaceResult<Recipe> {
        if self.detect_project_kind() != ProjectKind::Laravel {
            return Err(FurnaceError::InvalidRecipe(format!(
                "{} is not a Laravel project (artisan and composer.json expected)",
                self.base_path.display()
            )));
        }

        let name = match name {
            Some(name) => name,
            None => self
                .base_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    FurnaceError::InvalidRecipe("cannot derive a name from the project path".into())
                })?,
        };
        let runtime = self
            .required_runtime()
            .unwrap_or_else(|| fallback_runtime.to_string());
        let site = format!("{}.{}", name.to_ascii_lowercase().replace('_', "-"), tld);

        Ok(Recipe::new(name, self.base_path.clone(), runtime, engine, site).normalized())
    }
}

/// Reduces a composer version constraint to `MAJOR.MINOR`:
/// `^8.2` -> `8.2`, `>=8.1.3` -> `8.1`, `~7.4|^8.0` -> `7.4`.
pub fn extract_major_minor(version: &str) -> String {
    let digits: String = version
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = digits.split('.');
    let major = parts.next().unwrap_or("");
    let minor = parts.next().unwrap_or("");
    if !major.is_empty() && !minor.is_empty() {
        format!("{}.{}", major, minor)
    } else {
        digits
    }
}

/// Runtime versions installed under `runtimes_dir`, sorted by version.
pub fn installed_runtimes(runtimes_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(runtimes_dir) else {
        return Vec::new();
    };

    let mut versions: Vec<(RuntimeVersion, String)> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            RuntimeVersion::parse(&name).map(|v| (v, name))
        })
        .collect();
    versions.sort();
    versions.into_iter().map(|(_, name)| name).collect()
}
