//! The tree's structural units.
//!
//! Nodes live in an arena owned by [`crate::Tree`], keyed by [`NodeId`].
//! A child stores its parent's id (non-owning); a parent owns its children
//! through the child store. Two kinds exist:
//!
//! - container nodes (objects, lists, maps) own child ids, a memoized
//!   snapshot, middlewares, and subscriber lists;
//! - leaf nodes hold an opaque stored value and are replaced, never
//!   mutated, on change.

use std::any::Any;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;
use state_tree_reactive::{Atom, Memo, ObservableValue, Reaction};

use crate::action::Middleware;
use crate::identifiers::IdentifierCache;
use crate::patch::Patch;
use crate::types::TypeRef;

/// Stable identity of a node within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Lifecycle of a node.
///
/// `Dead` is terminal; the only backward move is the detach/reattach cycle
/// (`Detaching` back to `Finalized` under a new parent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeCycle {
    Initializing,
    Created,
    Finalized,
    Detaching,
    Dead,
}

/// Opaque environment handle shared by all nodes of one root tree.
pub type Environment = Rc<dyn Any>;

pub(crate) type SnapshotListener = Reaction<Value>;
pub(crate) type PatchListener = Box<dyn FnMut(&Patch, &Patch)>;

/// Child storage of a container node.
pub(crate) enum ChildStore {
    Object(IndexMap<String, NodeId>),
    List(Vec<NodeId>),
    Map(IndexMap<String, NodeId>),
}

impl ChildStore {
    pub(crate) fn ids(&self) -> Vec<NodeId> {
        match self {
            ChildStore::Object(map) | ChildStore::Map(map) => map.values().copied().collect(),
            ChildStore::List(items) => items.clone(),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<NodeId> {
        match self {
            ChildStore::Object(map) | ChildStore::Map(map) => map.get(key).copied(),
            ChildStore::List(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)).copied(),
        }
    }
}

/// A reference leaf's stored target: the identifier is captured eagerly,
/// the resolved node id is a lazily maintained cache.
pub(crate) struct StoredReference {
    pub identifier: Value,
    pub resolved: Cell<Option<NodeId>>,
}

/// What a leaf node holds.
pub(crate) enum LeafValue {
    Plain(Value),
    Reference(StoredReference),
}

pub(crate) struct ContainerState {
    pub children: ChildStore,
    pub identifier_attribute: Option<String>,
    /// Backed-up environment; populated on roots and detached subtrees.
    pub environment: Option<Environment>,
    pub running_action: bool,
    /// Consulted at the root only; every container carries it so a detached
    /// subtree becomes protectable on its own.
    pub protection: ObservableValue<bool>,
    /// Present on roots (and detached subtrees) only.
    pub identifier_cache: Option<IdentifierCache>,
    pub snapshot: Memo<Value>,
    pub snapshot_atom: Atom,
    pub middlewares: Vec<Middleware>,
    pub snapshot_subscribers: BTreeMap<u64, SnapshotListener>,
    pub patch_subscribers: BTreeMap<u64, PatchListener>,
    pub next_subscriber_id: u64,
}

impl ContainerState {
    pub(crate) fn new(
        children: ChildStore,
        identifier_attribute: Option<String>,
        is_root: bool,
    ) -> Self {
        Self {
            children,
            identifier_attribute,
            environment: None,
            running_action: false,
            protection: ObservableValue::new(true),
            identifier_cache: is_root.then(IdentifierCache::default),
            snapshot: Memo::new(),
            snapshot_atom: Atom::new(),
            middlewares: Vec::new(),
            snapshot_subscribers: BTreeMap::new(),
            patch_subscribers: BTreeMap::new(),
            next_subscriber_id: 1,
        }
    }

    pub(crate) fn bump_subscriber_id(&mut self) -> u64 {
        let id = self.next_subscriber_id;
        self.next_subscriber_id = self.next_subscriber_id.saturating_add(1);
        id
    }
}

pub(crate) struct LeafState {
    pub stored: LeafValue,
}

pub(crate) enum NodeVariant {
    Container(ContainerState),
    Leaf(LeafState),
}

/// One arena entry.
pub(crate) struct Node {
    pub id: NodeId,
    pub type_ref: TypeRef,
    pub parent: Option<NodeId>,
    pub subpath: String,
    pub state: LifeCycle,
    pub variant: NodeVariant,
}

impl Node {
    pub(crate) fn is_alive(&self) -> bool {
        self.state != LifeCycle::Dead
    }

    pub(crate) fn container(&self) -> Option<&ContainerState> {
        match &self.variant {
            NodeVariant::Container(state) => Some(state),
            NodeVariant::Leaf(_) => None,
        }
    }

    pub(crate) fn container_mut(&mut self) -> Option<&mut ContainerState> {
        match &mut self.variant {
            NodeVariant::Container(state) => Some(state),
            NodeVariant::Leaf(_) => None,
        }
    }

    pub(crate) fn leaf(&self) -> Option<&LeafState> {
        match &self.variant {
            NodeVariant::Leaf(state) => Some(state),
            NodeVariant::Container(_) => None,
        }
    }

    pub(crate) fn leaf_mut(&mut self) -> Option<&mut LeafState> {
        match &mut self.variant {
            NodeVariant::Leaf(state) => Some(state),
            NodeVariant::Container(_) => None,
        }
    }
}
