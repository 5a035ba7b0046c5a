//! Registry of relay nodes.
//!
//! Entries are keyed by `(address, port)`: a node that registers again from
//! the same endpoint replaces its previous entry (for example after a key
//! rotation) instead of being listed twice. Insertion order is preserved.

use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use veil_types::NodeRegistration;

use crate::{DirectoryError, Result};

/// Ordered set of node registrations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    nodes: Vec<NodeRegistration>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `registration`, replacing any entry for the same endpoint.
    ///
    /// Returns `true` when the endpoint was not registered before.
    pub fn upsert(&mut self, registration: NodeRegistration) -> bool {
        if let Some(existing) = self
            .nodes
            .iter_mut()
            .find(|r| r.same_endpoint(&registration))
        {
            *existing = registration;
            false
        } else {
            self.nodes.push(registration);
            true
        }
    }

    /// All registrations, in first-registration order.
    pub fn entries(&self) -> &[NodeRegistration] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Load a registry from `path`. A missing file yields an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Persistence`] if the file exists but cannot
    /// be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted registry, starting empty");
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(DirectoryError::Persistence(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&contents)
            .map_err(|e| DirectoryError::Persistence(format!("parse {}: {e}", path.display())))
    }

    /// Write the registry to `path` as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Persistence`] on serialization or I/O failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DirectoryError::Persistence(format!("serialize registry: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| DirectoryError::Persistence(format!("write {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(port: u16, key: u8) -> NodeRegistration {
        NodeRegistration::new("127.0.0.1", port, [key; 32])
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut registry = Registry::new();
        assert!(registry.upsert(reg(9001, 1)));
        assert!(!registry.upsert(reg(9001, 1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_key_for_same_endpoint() {
        let mut registry = Registry::new();
        registry.upsert(reg(9001, 1));
        registry.upsert(reg(9002, 2));
        registry.upsert(reg(9001, 3));
        assert_eq!(registry.len(), 2);
        // Position of the first registration is kept.
        assert_eq!(registry.entries()[0].public_key, [3u8; 32]);
        assert_eq!(registry.entries()[1].port, 9002);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json");
        let mut registry = Registry::new();
        registry.upsert(reg(9001, 0xaa));
        registry.upsert(reg(9002, 0xbb));
        registry.save(&path).expect("save");

        let raw = std::fs::read_to_string(&path).expect("read back");
        assert!(raw.contains("\"port\": 9001"));

        let loaded = Registry::load(&path).expect("load");
        assert_eq!(loaded, registry);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = Registry::load(&dir.path().join("absent.json")).expect("load");
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            Registry::load(&path),
            Err(DirectoryError::Persistence(_))
        ));
    }
}
