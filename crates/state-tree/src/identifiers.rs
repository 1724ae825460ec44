//! The per-root identifier cache.
//!
//! Each root tree owns one cache mapping identifier strings to the container
//! nodes currently holding that identifier. Attaching a subtree merges its
//! private cache into the new root's; detaching splits off exactly the
//! entries under the detached subtree.

use std::collections::HashMap;

use crate::error::TreeError;
use crate::node::NodeId;

/// One cached registration: the node and its type identity, kept so that
/// same-typed duplicates are rejected at registration/merge time while
/// differently-typed nodes may share an identifier until a reference makes
/// the ambiguity observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CacheEntry {
    pub node: NodeId,
    pub type_id: u64,
}

/// Outcome of a cache lookup, before reference-level error mapping.
pub(crate) enum Resolution {
    None,
    One(NodeId),
    Many(Vec<NodeId>),
}

#[derive(Debug, Default)]
pub struct IdentifierCache {
    entries: HashMap<String, Vec<CacheEntry>>,
}

impl IdentifierCache {
    /// Registers a node under an identifier.
    ///
    /// Registering the same node twice, or a second node of the same type
    /// under one identifier, is an error.
    pub(crate) fn add(
        &mut self,
        identifier: &str,
        node: NodeId,
        type_id: u64,
    ) -> Result<(), TreeError> {
        let bucket = self.entries.entry(identifier.to_string()).or_default();
        if bucket
            .iter()
            .any(|entry| entry.node == node || entry.type_id == type_id)
        {
            return Err(TreeError::DuplicateIdentifier {
                identifier: identifier.to_string(),
            });
        }
        bucket.push(CacheEntry { node, type_id });
        Ok(())
    }

    /// Drops a node's registration when it dies or detaches.
    pub(crate) fn remove(&mut self, identifier: &str, node: NodeId) {
        if let Some(bucket) = self.entries.get_mut(identifier) {
            bucket.retain(|entry| entry.node != node);
            if bucket.is_empty() {
                self.entries.remove(identifier);
            }
        }
    }

    /// Finds the nodes registered under `identifier` accepted by `is_match`
    /// (assignability to a reference's target type).
    pub(crate) fn resolve(
        &self,
        identifier: &str,
        is_match: impl Fn(NodeId) -> bool,
    ) -> Resolution {
        let candidates: Vec<NodeId> = self
            .entries
            .get(identifier)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|entry| entry.node)
                    .filter(|node| is_match(*node))
                    .collect()
            })
            .unwrap_or_default();
        match candidates.len() {
            0 => Resolution::None,
            1 => Resolution::One(candidates[0]),
            _ => Resolution::Many(candidates),
        }
    }

    /// Merges another cache into this one, re-checking duplicates.
    pub(crate) fn merge(&mut self, other: IdentifierCache) -> Result<(), TreeError> {
        for (identifier, bucket) in other.entries {
            for entry in bucket {
                self.add(&identifier, entry.node, entry.type_id)?;
            }
        }
        Ok(())
    }

    /// Splits off the entries accepted by `is_under` (path under a detached
    /// subtree) into a new cache.
    pub(crate) fn split(&mut self, is_under: impl Fn(NodeId) -> bool) -> IdentifierCache {
        let mut split = IdentifierCache::default();
        for (identifier, bucket) in self.entries.iter_mut() {
            let mut kept = Vec::with_capacity(bucket.len());
            for entry in bucket.drain(..) {
                if is_under(entry.node) {
                    split
                        .entries
                        .entry(identifier.clone())
                        .or_default()
                        .push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *bucket = kept;
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
        split
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }
}
