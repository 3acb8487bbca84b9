//! Endpoint nodes
//!
//! The registry is the authoritative namespace; a [`NodePublisher`] mirrors
//! it somewhere outside the process. [`DirectoryPublisher`] writes one file
//! per endpoint holding its identity as `major:minor`, the same format as a
//! sysfs `dev` attribute, so scripts can discover endpoints with `ls`.

use crate::error::{PciCharError, Result};
use crate::registry::EndpointId;
use std::fmt::Debug;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Materialises endpoint nodes
pub trait NodePublisher: Debug + Send + Sync {
    /// Create the node for `id` at namespace path `path`
    ///
    /// # Errors
    ///
    /// Returns `EndpointCreation` if the node cannot be created or already
    /// exists.
    fn create(&self, id: EndpointId, path: &str) -> Result<()>;

    /// Remove a node created by [`create`](Self::create)
    fn remove(&self, id: EndpointId, path: &str);
}

/// Keeps endpoints in-process only
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl NodePublisher for NullPublisher {
    fn create(&self, _id: EndpointId, _path: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _id: EndpointId, _path: &str) {}
}

/// Publishes endpoints as marker files under a directory
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    /// Publish below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory nodes are created under
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of the node for `path`
    #[must_use]
    pub fn node_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl NodePublisher for DirectoryPublisher {
    fn create(&self, id: EndpointId, path: &str) -> Result<()> {
        let node = self.node_path(path);
        if let Some(parent) = node.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PciCharError::endpoint_creation(path, e.to_string()))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&node)
            .map_err(|e| {
                PciCharError::endpoint_creation(path, format!("{}: {e}", node.display()))
            })?;
        writeln!(file, "{id}").map_err(|e| PciCharError::endpoint_creation(path, e.to_string()))?;

        tracing::debug!("Created node {}", node.display());
        Ok(())
    }

    fn remove(&self, id: EndpointId, path: &str) {
        let node = self.node_path(path);
        if let Err(e) = std::fs::remove_file(&node) {
            tracing::warn!("Cannot remove node {} ({id}): {e}", node.display());
            return;
        }
        tracing::debug!("Removed node {}", node.display());

        // Drop the per-device and namespace directories once empty.
        let mut dir = node.parent();
        while let Some(d) = dir {
            if d == self.root || std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(minor: u8) -> EndpointId {
        EndpointId::new(240, minor)
    }

    #[test]
    fn test_create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = DirectoryPublisher::new(dir.path());
        let path = "pci-char/01:00.01/bar3";

        publisher.create(id(3), path).unwrap();
        let node = dir.path().join(path);
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "240:3\n");

        publisher.remove(id(3), path);
        assert!(!node.exists());
        assert!(!dir.path().join("pci-char").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_existing_node_is_creation_error() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = DirectoryPublisher::new(dir.path());
        let path = "pci-char/01:00.01/bar0";

        publisher.create(id(0), path).unwrap();
        let err = publisher.create(id(0), path).unwrap_err();
        assert!(matches!(err, PciCharError::EndpointCreation { .. }));
    }

    #[test]
    fn test_sibling_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = DirectoryPublisher::new(dir.path());

        publisher.create(id(0), "pci-char/01:00.01/bar0").unwrap();
        publisher.create(id(2), "pci-char/01:00.01/bar2").unwrap();
        publisher.remove(id(0), "pci-char/01:00.01/bar0");
        assert!(dir.path().join("pci-char/01:00.01/bar2").exists());
    }
}
