use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding where per-project state is kept.
pub const STATE_DIR_ENV: &str = "DEVFLEET_STATE_DIR";

/// One persisted service → port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAssignment {
    pub service_name: String,
    pub port: u16,
    pub last_used: DateTime<Utc>,
}

impl PortAssignment {
    pub fn new(service_name: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            last_used: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Utc::now();
    }
}

/// Persistence for a project's port table.
///
/// # Implementations
///
/// - [`JsonFilePortStore`] - `~/.devfleet/ports/<project-hash>.json`
/// - [`MemoryPortStore`] - in-process only, for isolated runs and tests
pub trait PortStore: Send + Sync {
    /// Load every saved assignment, keyed by service name.
    fn load(&self) -> Result<HashMap<String, PortAssignment>>;

    /// Replace the saved table.
    fn save(&self, assignments: &HashMap<String, PortAssignment>) -> Result<()>;
}

/// Stable identifier of a project directory.
///
/// FNV-1a over the canonical path, so the same checkout always maps to the
/// same port file regardless of how it was reached.
pub fn project_hash(project_dir: &Path) -> String {
    let canonical =
        std::fs::canonicalize(project_dir).unwrap_or_else(|_| project_dir.to_path_buf());
    let bytes = canonical.as_os_str().as_encoded_bytes();
    format!("{:08x}", fnv1a_32(bytes))
}

/// FNV-1a 32-bit hash, deterministic across Rust versions and platforms.
fn fnv1a_32(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 2_166_136_261;
    const FNV_PRIME: u32 = 16_777_619;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Root directory for devfleet state.
pub fn state_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".devfleet"))
        .ok_or_else(|| Error::State("Could not determine home directory".to_string()))
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PortFile {
    #[serde(default)]
    project: String,
    #[serde(default)]
    assignments: Vec<PortAssignment>,
}

/// Port table persisted as JSON, one file per project.
///
/// Writes go to a temp file that is synced and renamed into place, under an
/// exclusive `fs2` lock so two orchestrators of the same project do not
/// interleave.
#[derive(Debug, Clone)]
pub struct JsonFilePortStore {
    path: PathBuf,
    project: String,
}

impl JsonFilePortStore {
    /// Store for `project_dir` under the default state directory.
    pub fn for_project(project_dir: &Path) -> Result<Self> {
        let dir = state_dir()?.join("ports");
        Ok(Self::in_dir(&dir, project_dir))
    }

    /// Store for `project_dir` inside an explicit directory.
    pub fn in_dir(dir: &Path, project_dir: &Path) -> Self {
        Self {
            path: dir.join(format!("{}.json", project_hash(project_dir))),
            project: project_dir.display().to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<fs::File> {
        use fs2::FileExt;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::State(format!(
                    "Failed to create state directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let lock_path = self.path.with_extension("lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::State(format!("Cannot open '{}': {}", lock_path.display(), e)))?;
        file.lock_exclusive()
            .map_err(|e| Error::State(format!("Cannot lock '{}': {}", lock_path.display(), e)))?;
        Ok(file)
    }

    fn atomic_write(path: &Path, contents: &str) -> Result<()> {
        use std::io::Write;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .map_err(|e| Error::State(format!("Failed to create temp file: {}", e)))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| Error::State(format!("Failed to write temp file: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::State(format!("Failed to sync temp file: {}", e)))?;
        drop(file);

        fs::rename(&temp_path, path)
            .map_err(|e| Error::State(format!("Failed to rename temp file: {}", e)))?;
        Ok(())
    }
}

impl PortStore for JsonFilePortStore {
    fn load(&self) -> Result<HashMap<String, PortAssignment>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let file: PortFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                // A corrupt table only costs stable URLs; start over.
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable port file");
                return Ok(HashMap::new());
            }
        };
        Ok(file
            .assignments
            .into_iter()
            .map(|a| (a.service_name.clone(), a))
            .collect())
    }

    fn save(&self, assignments: &HashMap<String, PortAssignment>) -> Result<()> {
        use fs2::FileExt;

        let lock = self.lock_file()?;
        let mut list: Vec<PortAssignment> = assignments.values().cloned().collect();
        list.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        let file = PortFile {
            project: self.project.clone(),
            assignments: list,
        };
        let json = serde_json::to_string_pretty(&file)?;
        let result = Self::atomic_write(&self.path, &json);
        let _ = lock.unlock();
        result
    }
}

/// Port table kept only in memory.
#[derive(Debug, Default)]
pub struct MemoryPortStore {
    assignments: Mutex<HashMap<String, PortAssignment>>,
}

impl MemoryPortStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PortStore for MemoryPortStore {
    fn load(&self) -> Result<HashMap<String, PortAssignment>> {
        Ok(self.assignments.lock().clone())
    }

    fn save(&self, assignments: &HashMap<String, PortAssignment>) -> Result<()> {
        *self.assignments.lock() = assignments.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_project_hash_is_stable() {
        let dir = TempDir::new().unwrap();
        let a = project_hash(dir.path());
        let b = project_hash(&dir.path().join("."));
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_project_hash_differs_per_project() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        assert_ne!(project_hash(a.path()), project_hash(b.path()));
    }

    #[test]
    fn test_json_store_roundtrip_camel_case() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let store = JsonFilePortStore::in_dir(state.path(), project.path());

        assert!(store.load().unwrap().is_empty());

        let mut table = HashMap::new();
        table.insert("api".to_string(), PortAssignment::new("api", 4100));
        store.save(&table).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"serviceName\": \"api\""));
        assert!(raw.contains("\"lastUsed\""));

        let loaded = store.load().unwrap();
        assert_eq!(loaded["api"].port, 4100);
    }

    #[test]
    fn test_json_store_ignores_corrupt_file() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let store = JsonFilePortStore::in_dir(state.path(), project.path());
        fs::create_dir_all(state.path()).unwrap();
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
