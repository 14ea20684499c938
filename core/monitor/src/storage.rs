//! Storage configuration and small-state persistence.
//!
//! All paths under the Vigil storage root are decided here. Production code
//! uses `StorageConfig::default()` (`~/.vigil`); tests inject a temp root via
//! `StorageConfig::with_root()`.
//!
//! Besides path management this module holds the one-JSON-value-per-key
//! store used for operator niceties (last-selected service and the like) and
//! the clean-shutdown marker.

use std::path::{Path, PathBuf};

use fs_err as fs;
use serde_json::Value;

use crate::error::StorageError;

/// Filename suffix of probe statefiles under `services/`.
pub const STATEFILE_EXT: &str = ".statefile";

const SHUTDOWN_KEY: &str = "clean-shutdown";

/// Central configuration for all Vigil storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = dirs::home_dir().expect("Could not find home directory");
        Self {
            root: home.join(".vigil"),
        }
    }
}

impl StorageConfig {
    /// Creates a StorageConfig with a custom root directory.
    /// Used for testing with temp directories.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of probe statefiles, one per monitored service.
    /// Keep the layout in sync with the `vigil-probe` writer.
    pub fn services_dir(&self) -> PathBuf {
        self.root.join("services")
    }

    /// Path of the statefile for a logical service name.
    pub fn statefile_path(&self, name: &str) -> PathBuf {
        self.services_dir()
            .join(format!("{}{}", sanitize_key(name), STATEFILE_EXT))
    }

    /// Path of the small-state file for a storage key.
    pub fn state_path(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }

    /// Ensures the root and services directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.services_dir())?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Small-state storage: one JSON value per key
    // ─────────────────────────────────────────────────────────────────────

    /// Loads the value stored for `key`, or `None` if it was never set.
    pub fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.state_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StorageError::Io {
                    context: format!("reading {}", path.display()),
                    source: err,
                })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StorageError::Json {
                context: format!("parsing {}", path.display()),
                source: err,
            })
    }

    /// Stores a value for `key`, creating the root directory on first write.
    pub fn store(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).map_err(|err| StorageError::Io {
            context: format!("creating {}", self.root.display()),
            source: err,
        })?;
        let path = self.state_path(key);
        let raw = serde_json::to_string(value).map_err(|err| StorageError::Json {
            context: format!("serializing value for {key}"),
            source: err,
        })?;
        fs::write(&path, raw).map_err(|err| StorageError::Io {
            context: format!("writing {}", path.display()),
            source: err,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Clean-shutdown tracking
    // ─────────────────────────────────────────────────────────────────────

    /// True if `mark_clean_shutdown` was called before the process last shut
    /// down. A missing marker (including first run) reads as unclean.
    pub fn did_shutdown_cleanly(&self) -> bool {
        self.state_path(SHUTDOWN_KEY).exists()
    }

    /// Records a clean shutdown for the next launch to observe.
    pub fn mark_clean_shutdown(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).map_err(|err| StorageError::Io {
            context: format!("creating {}", self.root.display()),
            source: err,
        })?;
        let path = self.state_path(SHUTDOWN_KEY);
        fs::write(&path, "").map_err(|err| StorageError::Io {
            context: format!("writing {}", path.display()),
            source: err,
        })
    }

    /// Clears the last-recorded shutdown marker. Tolerates one that was
    /// never written.
    pub fn clear_shutdown(&self) -> Result<(), StorageError> {
        let path = self.state_path(SHUTDOWN_KEY);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io {
                context: format!("removing {}", path.display()),
                source: err,
            }),
        }
    }
}

/// Restricts a storage key or service name to filename-safe characters.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_config() -> (TempDir, StorageConfig) {
        let temp = TempDir::new().expect("temp dir");
        let config = StorageConfig::with_root(temp.path().join("vigil"));
        (temp, config)
    }

    #[test]
    fn statefile_path_appends_extension() {
        let config = StorageConfig::with_root(PathBuf::from("/tmp/vigil"));
        assert_eq!(
            config.statefile_path("web"),
            PathBuf::from("/tmp/vigil/services/web.statefile")
        );
    }

    #[test]
    fn statefile_path_sanitizes_group_qualified_names() {
        let config = StorageConfig::with_root(PathBuf::from("/tmp/vigil"));
        assert_eq!(
            config.statefile_path("api:web/0"),
            PathBuf::from("/tmp/vigil/services/api:web-0.statefile")
        );
    }

    #[test]
    fn load_returns_none_for_unset_key() {
        let (_temp, config) = temp_config();
        assert!(config.load("selected-service").expect("load").is_none());
    }

    #[test]
    fn store_then_load_roundtrips_and_creates_root() {
        let (_temp, config) = temp_config();
        config
            .store("selected-service", &json!("web"))
            .expect("store");
        assert_eq!(
            config.load("selected-service").expect("load"),
            Some(json!("web"))
        );
    }

    #[test]
    fn load_surfaces_corrupt_values() {
        let (_temp, config) = temp_config();
        config.ensure_dirs().expect("ensure dirs");
        fs::write(config.state_path("bad"), "{not json").expect("write");
        assert!(matches!(
            config.load("bad"),
            Err(StorageError::Json { .. })
        ));
    }

    #[test]
    fn shutdown_marker_lifecycle() {
        let (_temp, config) = temp_config();
        assert!(!config.did_shutdown_cleanly());
        config.mark_clean_shutdown().expect("mark");
        assert!(config.did_shutdown_cleanly());
        config.clear_shutdown().expect("clear");
        assert!(!config.did_shutdown_cleanly());
        // Clearing twice is fine.
        config.clear_shutdown().expect("clear again");
    }
}
