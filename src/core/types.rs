use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use super::error::{FurnaceError, FurnaceResult};

/// Web server fronting a recipe's PHP runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingEngine {
    Nginx,
    Apache,
}

impl ServingEngine {
    pub const ALL: [ServingEngine; 2] = [ServingEngine::Nginx, ServingEngine::Apache];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServingEngine::Nginx => "nginx",
            ServingEngine::Apache => "apache",
        }
    }
}

impl fmt::Display for ServingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServingEngine {
    type Err = FurnaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nginx" => Ok(ServingEngine::Nginx),
            "apache" | "apache2" | "httpd" => Ok(ServingEngine::Apache),
            other => Err(FurnaceError::InvalidRecipe(format!(
                "unsupported serving engine '{}'",
                other
            ))),
        }
    }
}

/// A named local environment definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub project_path: PathBuf,
    pub runtime_version: String,
    pub serving_engine: ServingEngine,
    pub site_hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_state: Option<EnvironmentState>,
}

impl Recipe {
    pub fn new(
        name: impl Into<String>,
        project_path: impl Into<PathBuf>,
        runtime_version: impl Into<String>,
        serving_engine: ServingEngine,
        site_hostname: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            project_path: project_path.into(),
            runtime_version: runtime_version.into(),
            serving_engine,
            site_hostname: site_hostname.into(),
            last_known_state: None,
        }
    }

    /// Trims user input and lowercases the hostname.
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.runtime_version = self.runtime_version.trim().to_string();
        self.site_hostname = self.site_hostname.trim().to_ascii_lowercase();
        self
    }

    pub fn validate(&self, allowed_tlds: &[String]) -> FurnaceResult<()> {
        validate_name(&self.name)?;

        if !self.project_path.is_absolute() {
            return Err(FurnaceError::InvalidRecipe(format!(
                "project path '{}' must be absolute",
                self.project_path.display()
            )));
        }

        if RuntimeVersion::parse(&self.runtime_version).is_none() {
            return Err(FurnaceError::InvalidRecipe(format!(
                "runtime version '{}' is not MAJOR.MINOR[.PATCH]",
                self.runtime_version
            )));
        }

        validate_hostname(&self.site_hostname, allowed_tlds)
    }

    /// `MAJOR.MINOR` series of the runtime version, e.g. `8.2` for `8.2.10`.
    pub fn runtime_series(&self) -> String {
        RuntimeVersion::parse(&self.runtime_version)
            .map(|v| v.series())
            .unwrap_or_else(|| self.runtime_version.clone())
    }
}

fn validate_name(name: &str) -> FurnaceResult<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    let starts_alnum = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);

    if name.is_empty() || name.len() > 64 || !valid_chars || !starts_alnum {
        return Err(FurnaceError::InvalidRecipe(format!(
            "recipe name '{}' must be 1-64 characters of [A-Za-z0-9_-] starting with a letter or digit",
            name
        )));
    }
    Ok(())
}

fn validate_hostname(hostname: &str, allowed_tlds: &[String]) -> FurnaceResult<()> {
    let invalid = |reason: &str| {
        Err(FurnaceError::InvalidRecipe(format!(
            "site hostname '{}' {}",
            hostname, reason
        )))
    };

    if hostname.is_empty() || hostname.len() > 253 {
        return invalid("must be 1-253 characters");
    }

    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 2 {
        return invalid("needs at least a name and a top-level domain");
    }

    for label in &labels {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !ok {
            return invalid("contains an invalid label");
        }
    }

    let tld = labels[labels.len() - 1];
    if !allowed_tlds.iter().any(|allowed| allowed == tld) {
        return invalid(&format!(
            "must end in a local-only domain ({})",
            allowed_tlds.join(", ")
        ));
    }

    Ok(())
}

/// Parsed `MAJOR.MINOR[.PATCH]` runtime version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl RuntimeVersion {
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => Some(p.parse().ok()?),
            None => None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn series(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }
}

/// Lifecycle of an environment instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Stopped,
    Starting,
    HealthChecking,
    Running,
    Stopping,
    Failed,
}

impl EnvironmentState {
    /// States in which the recipe holds an allocation.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EnvironmentState::Starting
                | EnvironmentState::HealthChecking
                | EnvironmentState::Running
                | EnvironmentState::Stopping
        )
    }

    pub fn can_transition_to(&self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Failed, Starting)
                | (Starting, HealthChecking)
                | (Starting, Failed)
                | (HealthChecking, Running)
                | (HealthChecking, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvironmentState::Stopped => "stopped",
            EnvironmentState::Starting => "starting",
            EnvironmentState::HealthChecking => "health_checking",
            EnvironmentState::Running => "running",
            EnvironmentState::Stopping => "stopping",
            EnvironmentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl FromStr for EnvironmentState {
    type Err = FurnaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(EnvironmentState::Stopped),
            "starting" => Ok(EnvironmentState::Starting),
            "health_checking" => Ok(EnvironmentState::HealthChecking),
            "running" => Ok(EnvironmentState::Running),
            "stopping" => Ok(EnvironmentState::Stopping),
            "failed" => Ok(EnvironmentState::Failed),
            other => Err(FurnaceError::Internal(format!(
                "unknown environment state '{}'",
                other
            ))),
        }
    }
}

/// Local name resolution entry for a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameBinding {
    pub address: IpAddr,
    pub hostname: String,
}

impl fmt::Display for HostnameBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.address, self.hostname)
    }
}

/// Network resources reserved for one active recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub recipe_name: String,
    pub port: u16,
    pub hostname_binding: HostnameBinding,
}

impl Allocation {
    pub fn hostname(&self) -> &str {
        &self.hostname_binding.hostname
    }

    pub fn address(&self) -> IpAddr {
        self.hostname_binding.address
    }
}

/// Runtime state of one recipe's environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInstance {
    pub recipe_name: String,
    pub state: EnvironmentState,
    pub runtime_process_id: Option<u32>,
    pub serving_process_id: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub allocation: Option<Allocation>,
    pub restarts: u32,
}

impl EnvironmentInstance {
    pub fn new(recipe_name: impl Into<String>) -> Self {
        Self {
            recipe_name: recipe_name.into(),
            state: EnvironmentState::Stopped,
            runtime_process_id: None,
            serving_process_id: None,
            started_at: None,
            last_health_check_at: None,
            last_error: None,
            allocation: None,
            restarts: 0,
        }
    }

    pub fn transition(&mut self, next: EnvironmentState) -> FurnaceResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(FurnaceError::conflict(
                &self.recipe_name,
                format!("cannot move from {} to {}", self.state, next),
            ));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn tlds() -> Vec<String> {
        vec!["test".to_string(), "localhost".to_string()]
    }

    fn alpha() -> Recipe {
        Recipe::new("alpha", "/srv/alpha", "8.2", ServingEngine::Nginx, "alpha.test")
    }

    #[test]
    fn accepts_alpha_recipe() {
        assert!(alpha().validate(&tlds()).is_ok());
    }

    #[test_case("", "empty name" ; "empty")]
    #[test_case("-alpha", "leading dash" ; "leading dash")]
    #[test_case("al pha", "space" ; "space")]
    #[test_case("../alpha", "path traversal" ; "traversal")]
    fn rejects_bad_names(name: &str, _why: &str) {
        let mut recipe = alpha();
        recipe.name = name.to_string();
        assert!(matches!(
            recipe.validate(&tlds()),
            Err(FurnaceError::InvalidRecipe(_))
        ));
    }

    #[test_case("alpha.com" ; "public tld")]
    #[test_case("alpha" ; "no tld")]
    #[test_case("-alpha.test" ; "leading dash label")]
    #[test_case("al_pha.test" ; "underscore")]
    #[test_case("alpha..test" ; "empty label")]
    fn rejects_bad_hostnames(host: &str) {
        let mut recipe = alpha();
        recipe.site_hostname = host.to_string();
        assert!(recipe.validate(&tlds()).is_err());
    }

    #[test]
    fn rejects_relative_project_path() {
        let mut recipe = alpha();
        recipe.project_path = PathBuf::from("srv/alpha");
        assert!(recipe.validate(&tlds()).is_err());
    }

    #[test_case("8.2", Some("8.2") ; "series")]
    #[test_case("8.2.10", Some("8.2") ; "with patch")]
    #[test_case("8", None ; "major only")]
    #[test_case("8.x", None ; "wildcard")]
    #[test_case("8.2.1.4", None ; "too many parts")]
    fn parses_runtime_versions(input: &str, series: Option<&str>) {
        assert_eq!(
            RuntimeVersion::parse(input).map(|v| v.series()),
            series.map(String::from)
        );
    }

    #[test]
    fn normalizes_hostname_case() {
        let mut recipe = alpha();
        recipe.site_hostname = " Alpha.TEST ".to_string();
        let recipe = recipe.normalized();
        assert_eq!(recipe.site_hostname, "alpha.test");
        assert!(recipe.validate(&tlds()).is_ok());
    }

    #[test]
    fn engine_parsing_accepts_aliases() {
        assert_eq!("httpd".parse::<ServingEngine>().unwrap(), ServingEngine::Apache);
        assert_eq!("NGINX".parse::<ServingEngine>().unwrap(), ServingEngine::Nginx);
        assert!("caddy".parse::<ServingEngine>().is_err());
    }

    #[test]
    fn state_machine_allows_documented_transitions() {
        use EnvironmentState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Starting));
        assert!(HealthChecking.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn invalid_transition_is_a_conflict() {
        let mut instance = EnvironmentInstance::new("alpha");
        let err = instance.transition(EnvironmentState::Running).unwrap_err();
        assert!(matches!(err, FurnaceError::Conflict { .. }));
        assert_eq!(instance.state, EnvironmentState::Stopped);
    }
}
