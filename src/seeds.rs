//! Registry of known node addresses, shared through a plain file.
//!
//! One address per line. Nodes add themselves on startup and remove
//! themselves on shutdown; the file is deleted once it is empty.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::network::PeerHost;

pub const DEFAULT_MAX_SEED_NODES: usize = 20;

pub struct SeedRegistry {
    path: PathBuf,
    max_nodes: usize,
}

impl SeedRegistry {
    pub fn new(path: impl Into<PathBuf>, max_nodes: usize) -> Self {
        Self {
            path: path.into(),
            max_nodes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registered addresses; a missing file reads as empty.
    pub fn load(&self) -> io::Result<Vec<String>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn store(&self, nodes: &[String]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut contents = nodes.join("\n");
        contents.push('\n');
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)
    }

    /// Add `addr` unless it is already listed or the registry is full.
    /// Returns whether the address was added.
    pub fn register(&self, addr: &str) -> io::Result<bool> {
        let mut nodes = self.load()?;
        if nodes.iter().any(|n| n == addr) || nodes.len() >= self.max_nodes {
            return Ok(false);
        }
        nodes.push(addr.to_string());
        self.store(&nodes)?;
        info!(addr, registered = nodes.len(), "node registered as seed");
        Ok(true)
    }

    /// Remove `addr`, deleting the file when no address remains.
    pub fn unregister(&self, addr: &str) -> io::Result<()> {
        let nodes: Vec<String> = self.load()?.into_iter().filter(|n| n != addr).collect();
        if nodes.is_empty() {
            match fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
            info!(path = %self.path.display(), "seed registry emptied");
            return Ok(());
        }
        self.store(&nodes)
    }
}

/// Dial every candidate except `own_addr` and return the reachable ones.
pub async fn active_peers<H: PeerHost + ?Sized>(host: &H, candidates: &[String], own_addr: &str) -> Vec<String> {
    let mut active = Vec::new();
    for peer in candidates.iter().filter(|p| p.as_str() != own_addr) {
        if host.is_reachable(peer).await {
            debug!(%peer, "seed node active");
            active.push(peer.clone());
        } else {
            debug!(%peer, "seed node inactive");
        }
    }
    active
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SeedRegistry::new(dir.path().join("seeds.txt"), 2);
        assert!(registry.load().unwrap().is_empty());

        assert!(registry.register("127.0.0.1:1").unwrap());
        assert!(!registry.register("127.0.0.1:1").unwrap());
        assert!(registry.register("127.0.0.1:2").unwrap());
        assert!(!registry.register("127.0.0.1:3").unwrap());
        assert_eq!(registry.load().unwrap(), vec!["127.0.0.1:1", "127.0.0.1:2"]);

        registry.unregister("127.0.0.1:1").unwrap();
        assert_eq!(registry.load().unwrap(), vec!["127.0.0.1:2"]);
        registry.unregister("127.0.0.1:2").unwrap();
        assert!(!registry.path().exists());
        registry.unregister("127.0.0.1:2").unwrap();
    }
}
