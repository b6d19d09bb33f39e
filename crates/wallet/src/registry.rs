//! The cached server list: a JSON file of `[host, port, proto]` triples,
//! the only state the wallet core ever persists.

use std::fs;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use umbra_electrum::{PeerInfo, Protocol, ServerAddr};

use crate::{error::Error, Result};

/// Protocol versions whose scripthash methods match the wire contract.
const SUPPORTED_VERSIONS: [&str; 2] = ["1.1", "1.2"];

/// One server entry as stored on disk: `[host, port, proto]`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerEntry(pub String, pub u16, pub String);

impl ServerEntry {
    pub fn to_server_addr(&self) -> Result<ServerAddr> {
        Ok(ServerAddr::new(
            self.0.clone(),
            self.1,
            Protocol::from_tag(&self.2)?,
        ))
    }
}

pub struct ServerRegistry {
    path: PathBuf,
}

impl ServerRegistry {
    pub fn new(path: impl AsRef<Path>) -> Self {
        ServerRegistry {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Loads the cached list; a missing or corrupt file is an empty list.
    pub fn load(&self) -> Vec<ServerEntry> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("No cached server list at {:?}: {}", self.path, err);
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(servers) => servers,
            Err(err) => {
                log::warn!("Ignoring corrupt server list at {:?}: {}", self.path, err);
                Vec::new()
            }
        }
    }

    /// Persists a freshly fetched list, dropping entries whose protocol tag
    /// the transport cannot speak.
    pub fn save(&self, servers: &[ServerEntry]) -> Result<()> {
        let usable: Vec<&ServerEntry> = servers
            .iter()
            .filter(|entry| Protocol::from_tag(&entry.2).is_ok())
            .collect();
        fs::write(&self.path, serde_json::to_string(&usable)?)?;
        log::info!("Saved {} servers to {:?}", usable.len(), self.path);
        Ok(())
    }

    /// A random server from the cached list.
    pub fn pick_random(&self) -> Result<ServerAddr> {
        let servers = self.load();
        let entry = servers
            .choose(&mut rand::thread_rng())
            .ok_or(Error::NoServers)?;
        entry.to_server_addr()
    }

    /// Replaces the cache with the peers a connected server gossips about,
    /// keeping only peers speaking a supported protocol version.
    pub fn refresh_from_peers(&self, peers: &[PeerInfo]) -> Result<Vec<ServerEntry>> {
        let fresh: Vec<ServerEntry> = peers
            .iter()
            .filter(|peer| SUPPORTED_VERSIONS.contains(&peer.version.as_str()))
            .map(|peer| ServerEntry(peer.host.clone(), peer.port, peer.proto.clone()))
            .collect();
        if fresh.is_empty() {
            // An empty gossip round must not wipe a working cache.
            return Ok(fresh);
        }
        self.save(&fresh)?;
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, ServerRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServerRegistry::new(dir.path().join("servers.json"));
        (dir, registry)
    }

    #[test]
    fn missing_file_is_an_empty_list() {
        let (_dir, registry) = registry();
        assert!(registry.load().is_empty());
        assert!(matches!(registry.pick_random(), Err(Error::NoServers)));
    }

    #[test]
    fn corrupt_file_is_an_empty_list() {
        let (dir, registry) = registry();
        fs::write(dir.path().join("servers.json"), "{not json").unwrap();
        assert!(registry.load().is_empty());
    }

    #[test]
    fn save_load_round_trips_and_filters_unknown_protocols() {
        let (_dir, registry) = registry();
        let servers = vec![
            ServerEntry("fdkhv2bb7hqel2e7.onion".into(), 50001, "t".into()),
            ServerEntry("example.onion".into(), 50002, "s".into()),
            ServerEntry("legacy.onion".into(), 8081, "h".into()),
        ];
        registry.save(&servers).unwrap();

        let loaded = registry.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, "fdkhv2bb7hqel2e7.onion");

        let addr = registry.pick_random().unwrap();
        assert!(loaded.iter().any(|entry| entry.0 == addr.host));
    }

    #[test]
    fn peer_refresh_filters_versions_and_keeps_a_nonempty_cache() {
        let (_dir, registry) = registry();
        registry
            .save(&[ServerEntry("stale.onion".into(), 50001, "t".into())])
            .unwrap();

        let peers = vec![
            PeerInfo {
                host: "fresh.onion".into(),
                port: 50002,
                proto: "s".into(),
                version: "1.2".into(),
            },
            PeerInfo {
                host: "ancient.onion".into(),
                port: 50001,
                proto: "t".into(),
                version: "0.9".into(),
            },
        ];
        let fresh = registry.refresh_from_peers(&peers).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(registry.load(), fresh);

        // A round with no usable peers leaves the cache alone.
        let none = registry.refresh_from_peers(&[]).unwrap();
        assert!(none.is_empty());
        assert_eq!(registry.load(), fresh);
    }

    #[test]
    fn wire_format_is_an_array_of_triples() {
        let entry = ServerEntry("host.onion".into(), 50001, "t".into());
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"["host.onion",50001,"t"]"#
        );
        let parsed: ServerEntry =
            serde_json::from_str(r#"["host.onion", 50001, "t"]"#).unwrap();
        assert_eq!(parsed, entry);
    }
}
