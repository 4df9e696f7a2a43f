//! `.env` loading and layered environment merging.
//!
//! A service's environment is assembled from four layers, lowest to highest
//! precedence:
//!
//! 1. the orchestrator's own OS environment
//! 2. project context (values shared by every service of the project)
//! 3. the project's `.env` file (or the service's `env_file`)
//! 4. the environment declared on the service itself
//!
//! Later layers win on key collision.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// Load environment variables from a single .env file.
///
/// Parsing is delegated to dotenvy (KEY=VALUE, comments, quoting). Every
/// variable name is validated afterwards.
pub fn load_env_file<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(Error::Config(format!(
            "Environment file not found: {}",
            path.display()
        )));
    }

    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read environment file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut env_vars = HashMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| {
            Error::Config(format!(
                "Failed to parse environment file {}: {}",
                path.display(),
                e
            ))
        })?;
        validate_env_name(&key)?;
        env_vars.insert(key, value);
    }

    Ok(env_vars)
}

/// Load `file` relative to `project_dir` if it exists; a missing file is an
/// empty layer, not an error.
pub fn load_optional_env_file(project_dir: &Path, file: &str) -> Result<HashMap<String, String>> {
    let path = project_dir.join(file);
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No env file, skipping");
        return Ok(HashMap::new());
    }
    load_env_file(path)
}

/// The four environment layers of a service start.
#[derive(Debug, Clone, Default)]
pub struct EnvLayers {
    pub os: HashMap<String, String>,
    pub project: HashMap<String, String>,
    pub dotenv: HashMap<String, String>,
    pub service: HashMap<String, String>,
}

impl EnvLayers {
    /// Layers seeded with the current process environment.
    pub fn from_os() -> Self {
        Self {
            os: std::env::vars().collect(),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, project: HashMap<String, String>) -> Self {
        self.project = project;
        self
    }

    pub fn with_dotenv(mut self, dotenv: HashMap<String, String>) -> Self {
        self.dotenv = dotenv;
        self
    }

    pub fn with_service(mut self, service: HashMap<String, String>) -> Self {
        self.service = service;
        self
    }

    /// Flatten the layers; later layers win.
    pub fn merge(&self) -> HashMap<String, String> {
        let mut merged = self.os.clone();
        merged.extend(self.project.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(self.dotenv.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(self.service.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Validate an environment variable name.
///
/// Names must start with a letter or underscore and contain only ASCII
/// alphanumerics and underscores.
pub fn validate_env_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(Error::Config(
            "Environment variable name cannot be empty".to_string(),
        ));
    };

    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(Error::Config(format!(
            "Invalid environment variable name '{}': must start with a letter or underscore",
            name
        )));
    }

    if let Some((i, c)) = name
        .chars()
        .enumerate()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
    {
        return Err(Error::Config(format!(
            "Invalid environment variable name '{}': character '{}' at position {} is not allowed",
            name, c, i
        )));
    }

    Ok(())
}
