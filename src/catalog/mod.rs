//! Persisted, ordered catalog of known servers.
//!
//! Order is significant: index 0 is tried first. Every mutation is a
//! read-merge-write against the [`CatalogStore`] under a single lock, so
//! nothing survives between calls except what was persisted. Individual
//! operations are atomic, sequences of them are not.

mod entry;
mod reorder;
mod store;

pub use entry::{decode_entries, encode_entries, Capability, ServerEntry};
pub use reorder::{
    probe_round, select_probe_targets, select_promoted, ProbeResult, ReachabilityConfig,
    ReachabilityReorder, RoundReport,
};
pub use store::{CatalogStore, SqliteStore};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::transport::TransportKind;

/// Ordered server list persisted under one store key.
pub struct ServerCatalog {
    key: String,
    store: Arc<dyn CatalogStore>,
    embedded: Vec<ServerEntry>,
    lock: Mutex<()>,
}

impl ServerCatalog {
    /// Create a catalog persisted under `key`, with `embedded` as the
    /// baseline list merged in on every [`load`](Self::load).
    pub fn new(
        key: impl Into<String>,
        store: Arc<dyn CatalogStore>,
        embedded: Vec<ServerEntry>,
    ) -> Self {
        Self {
            key: key.into(),
            store,
            embedded,
            lock: Mutex::new(()),
        }
    }

    /// Store key of this catalog.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the persisted list, merge in the embedded baseline and persist
    /// the result.
    pub fn load(&self) -> Result<Vec<ServerEntry>> {
        self.mutate(|entries| {
            let added = merge_embedded(entries, &self.embedded);
            if added > 0 {
                debug!(catalog = %self.key, added, "merged embedded servers");
            }
            // Always rewrite so concurrent readers converge on the merged list.
            true
        })
    }

    /// Persisted list as it is, without merging.
    pub fn entries(&self) -> Result<Vec<ServerEntry>> {
        let _guard = self.lock.lock();
        self.read()
    }

    /// [`load`](Self::load), filtered to entries usable with `kind`.
    pub fn candidates(&self, kind: TransportKind) -> Result<Vec<ServerEntry>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|entry| entry.supports(kind))
            .collect())
    }

    /// Move `entry` to the front, inserting it if unknown.
    pub fn mark_succeeded(&self, entry: &ServerEntry) -> Result<()> {
        self.mutate(|entries| {
            move_to_front(entries, entry.clone());
            true
        })?;
        debug!(catalog = %self.key, server = %entry, "marked server succeeded");
        Ok(())
    }

    /// Move `entry` to the back. No-op on lists shorter than two or when
    /// the entry is unknown.
    pub fn mark_failed(&self, entry: &ServerEntry) -> Result<()> {
        let mut moved = false;
        self.mutate(|entries| {
            moved = move_to_back(entries, entry);
            moved
        })?;
        if moved {
            debug!(catalog = %self.key, server = %entry, "marked server failed");
        }
        Ok(())
    }

    /// Merge newly discovered entries: unknown ones go right behind the
    /// current best entry, known ones are refreshed in place.
    pub fn add_discovered(&self, discovered: &[ServerEntry]) -> Result<()> {
        let mut added = 0usize;
        self.mutate(|entries| {
            added = insert_discovered(entries, discovered);
            !discovered.is_empty()
        })?;
        info!(
            catalog = %self.key,
            discovered = discovered.len(),
            added,
            "merged discovered servers"
        );
        Ok(())
    }

    /// Move the entries with the given addresses, as a block in the given
    /// order, to the front. Everything else keeps its relative order.
    pub fn promote(&self, addresses: &[String]) -> Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }
        self.mutate(|entries| {
            promote_block(entries, addresses);
            true
        })?;
        Ok(())
    }

    fn mutate<F>(&self, f: F) -> Result<Vec<ServerEntry>>
    where
        F: FnOnce(&mut Vec<ServerEntry>) -> bool,
    {
        let _guard = self.lock.lock();
        let mut entries = self.read()?;
        if f(&mut entries) {
            self.write(&entries)?;
        }
        Ok(entries)
    }

    fn read(&self) -> Result<Vec<ServerEntry>> {
        Ok(self
            .store
            .load(&self.key)?
            .map(|blob| decode_entries(&blob))
            .unwrap_or_default())
    }

    fn write(&self, entries: &[ServerEntry]) -> Result<()> {
        self.store.save(&self.key, &encode_entries(entries)?)
    }
}

impl std::fmt::Debug for ServerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCatalog")
            .field("key", &self.key)
            .field("embedded", &self.embedded.len())
            .finish()
    }
}

/// Insert embedded entries missing from `entries` just behind the first
/// entry. Returns how many were added.
fn merge_embedded(entries: &mut Vec<ServerEntry>, embedded: &[ServerEntry]) -> usize {
    let missing: Vec<ServerEntry> = embedded
        .iter()
        .filter(|e| !entries.contains(e))
        .fold(Vec::new(), |mut acc, e| {
            if !acc.contains(e) {
                acc.push(e.clone());
            }
            acc
        });

    let added = missing.len();
    let at = entries.len().min(1);
    entries.splice(at..at, missing);
    added
}

fn move_to_front(entries: &mut Vec<ServerEntry>, entry: ServerEntry) {
    if let Some(pos) = entries.iter().position(|e| *e == entry) {
        entries.remove(pos);
    }
    entries.insert(0, entry);
}

fn move_to_back(entries: &mut Vec<ServerEntry>, entry: &ServerEntry) -> bool {
    if entries.len() < 2 {
        return false;
    }
    match entries.iter().position(|e| e == entry) {
        Some(pos) => {
            let failed = entries.remove(pos);
            entries.push(failed);
            true
        }
        None => false,
    }
}

fn insert_discovered(entries: &mut Vec<ServerEntry>, discovered: &[ServerEntry]) -> usize {
    let mut added = 0;
    for entry in discovered {
        if let Some(existing) = entries.iter_mut().find(|e| e.address == entry.address) {
            // Discovery is fresher than what we stored.
            *existing = entry.clone();
        } else {
            let at = entries.len().min(1);
            entries.insert(at, entry.clone());
            added += 1;
        }
    }
    added
}

fn promote_block(entries: &mut Vec<ServerEntry>, addresses: &[String]) {
    let mut block = Vec::with_capacity(addresses.len());
    for address in addresses {
        if let Some(pos) = entries.iter().position(|e| &e.address == address) {
            block.push(entries.remove(pos));
        }
    }
    entries.splice(0..0, block);
}
