//! Server selection for keys.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Virtual nodes placed on the ring per server.
const KETAMA_POINTS_PER_SERVER: usize = 160;

/// Server selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionLocator {
    /// Hash modulo server count.
    #[default]
    Array,
    /// Ketama consistent-hash ring.
    Ketama,
}

/// Maps keys to server indices.
#[derive(Debug, Clone)]
pub struct ServerLocator {
    servers: usize,
    ring: Option<BTreeMap<u32, usize>>,
}

impl ServerLocator {
    /// Build a locator over servers identified by `names`.
    pub fn new<S: AsRef<str>>(kind: SessionLocator, names: &[S]) -> Self {
        let ring = match kind {
            SessionLocator::Array => None,
            SessionLocator::Ketama => Some(build_ring(names)),
        };
        Self {
            servers: names.len(),
            ring,
        }
    }

    /// Strategy used by this locator.
    pub fn kind(&self) -> SessionLocator {
        if self.ring.is_some() {
            SessionLocator::Ketama
        } else {
            SessionLocator::Array
        }
    }

    /// Pick the server for `key`, skipping servers for which `available` is false.
    ///
    /// Returns `None` when no server is available.
    pub fn locate<F>(&self, key: &str, available: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        if self.servers == 0 {
            return None;
        }
        let hash = hash32(key.as_bytes());

        match &self.ring {
            Some(ring) => ring
                .range(hash..)
                .chain(ring.range(..hash))
                .map(|(_, idx)| *idx)
                .find(|idx| available(*idx)),
            None => {
                let start = hash as usize % self.servers;
                (0..self.servers)
                    .map(|offset| (start + offset) % self.servers)
                    .find(|idx| available(*idx))
            }
        }
    }
}

fn build_ring<S: AsRef<str>>(names: &[S]) -> BTreeMap<u32, usize> {
    let mut ring = BTreeMap::new();
    for (idx, name) in names.iter().enumerate() {
        for replica in 0..KETAMA_POINTS_PER_SERVER / 4 {
            let digest = Sha256::digest(format!("{}-{}", name.as_ref(), replica).as_bytes());
            for chunk in digest[..16].chunks_exact(4) {
                let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                ring.entry(point).or_insert(idx);
            }
        }
    }
    ring
}

fn hash32(bytes: &[u8]) -> u32 {
    let digest = Sha256::digest(bytes);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
