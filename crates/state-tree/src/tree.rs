//! The tree: an arena of typed nodes plus every public operation.
//!
//! All state of one or more root trees lives here. Mutation flows through a
//! single pipeline: assert writable, typecheck, reconcile the incoming value
//! into live child nodes, update storage, emit the reversible patch, then
//! invalidate and notify snapshots up the ancestor chain.

use std::collections::HashMap;

use serde_json::Value;
use state_tree_pointer::{escape_segment, join_pointer, parse_index, relative_pointer, split_pointer};
use state_tree_reactive::Reaction;
use tracing::{debug, warn};

use crate::action::{
    run_chain, Middleware, MiddlewareChain, MiddlewareEvent, SerializedActionCall, APPLY_PATCHES,
    APPLY_SNAPSHOT,
};
use crate::error::{TreeError, ValidationError};
use crate::node::{
    ChildStore, ContainerState, Environment, LeafState, LeafValue, LifeCycle, Node, NodeId,
    NodeVariant, StoredReference,
};
use crate::patch::{Patch, PatchOp, ReversiblePatch};
use crate::reconcile;
use crate::types::{Hook, TypeKind, TypeRef};

/// An incoming value for instantiation or reconciliation: either a plain
/// snapshot or an already-live node.
#[derive(Debug, Clone)]
pub enum Input {
    Value(Value),
    Node(NodeId),
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Value(value)
    }
}

impl From<NodeId> for Input {
    fn from(node: NodeId) -> Self {
        Input::Node(node)
    }
}

struct ActionFrame {
    id: u64,
    root_id: u64,
}

/// The node arena and all tree-level state.
///
/// A `Tree` may hold several independent root trees (e.g. a store plus a
/// detached subtree); each root carries its own identifier cache and
/// protection flag. A `Tree` is single-threaded by design.
pub struct Tree {
    nodes: HashMap<NodeId, Node>,
    next_node_id: u64,
    next_action_id: u64,
    next_middleware_id: u64,
    action_stack: Vec<ActionFrame>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            next_node_id: 1,
            next_action_id: 1,
            next_middleware_id: 1,
            action_stack: Vec::new(),
        }
    }

    // ── Creation ──────────────────────────────────────────────────────────

    /// Validates `snapshot` against `tree_type` and instantiates a new root
    /// tree from it. With no snapshot, the type's default applies.
    pub fn create(
        &mut self,
        tree_type: &TypeRef,
        snapshot: Option<Value>,
        environment: Option<Environment>,
    ) -> Result<NodeId, TreeError> {
        let snapshot = snapshot.unwrap_or_else(|| tree_type.default_snapshot());
        let errors = tree_type.validate(&snapshot, "");
        if !errors.is_empty() {
            return Err(TreeError::Validation(errors));
        }
        let root = self.instantiate(tree_type, None, "", Input::Value(snapshot))?;
        if let Some(env) = environment {
            if let Ok(container) = self.container_mut(root) {
                container.environment = Some(env);
            }
        }
        self.finalize_subtree(root)?;
        Ok(root)
    }

    pub(crate) fn instantiate(
        &mut self,
        tree_type: &TypeRef,
        parent: Option<NodeId>,
        subpath: &str,
        input: Input,
    ) -> Result<NodeId, TreeError> {
        let tree_type = tree_type.clone();
        match tree_type.kind() {
            TypeKind::Optional(def) => {
                let input = if matches!(&input, Input::Value(Value::Null)) {
                    let default = (def.default)();
                    let errors = def.base.validate(&default, subpath);
                    if !errors.is_empty() {
                        return Err(TreeError::Validation(errors));
                    }
                    Input::Value(default)
                } else {
                    input
                };
                self.instantiate(&def.base, parent, subpath, input)
            }
            TypeKind::Refinement(def) => {
                let base = def.base.clone();
                self.instantiate(&base, parent, subpath, input)
            }
            TypeKind::Late(def) => {
                let resolved = def.resolved();
                self.instantiate(&resolved, parent, subpath, input)
            }
            TypeKind::Union(_) => {
                let variant = self.determine_union_variant(&tree_type, &input)?;
                self.instantiate(&variant, parent, subpath, input)
            }
            TypeKind::Object(_) | TypeKind::List(_) | TypeKind::Map(_) => match input {
                Input::Node(node) => self.adopt(node, parent, subpath),
                Input::Value(value) => {
                    self.instantiate_container(&tree_type, parent, subpath, value)
                }
            },
            TypeKind::Identifier(_) => {
                let value = self.input_to_value(input)?;
                let placed = parent
                    .and_then(|p| self.nodes.get(&p))
                    .and_then(|n| n.container())
                    .is_some_and(|c| c.identifier_attribute.as_deref() == Some(subpath));
                if !placed {
                    return Err(TreeError::IdentifierPlacement);
                }
                Ok(self.insert_leaf(&tree_type, parent, subpath, LeafValue::Plain(value)))
            }
            TypeKind::Reference(_) => {
                let stored = match input {
                    Input::Node(target) => {
                        self.assert_alive(target)?;
                        let identifier = self
                            .identifier_value_of(target)?
                            .ok_or(TreeError::ReferenceWithoutIdentifier)?;
                        StoredReference {
                            identifier,
                            resolved: std::cell::Cell::new(Some(target)),
                        }
                    }
                    Input::Value(value) => StoredReference {
                        identifier: value,
                        resolved: std::cell::Cell::new(None),
                    },
                };
                Ok(self.insert_leaf(&tree_type, parent, subpath, LeafValue::Reference(stored)))
            }
            TypeKind::Custom(def) => {
                let value = self.input_to_value(input)?;
                let converted = (def.from_snapshot)(&value).map_err(|message| {
                    TreeError::Validation(vec![ValidationError {
                        path: subpath.to_string(),
                        value: value.clone(),
                        message,
                    }])
                })?;
                Ok(self.insert_leaf(&tree_type, parent, subpath, LeafValue::Plain(converted)))
            }
            _ => {
                let value = self.input_to_value(input)?;
                Ok(self.insert_leaf(&tree_type, parent, subpath, LeafValue::Plain(value)))
            }
        }
    }

    /// A live root node offered where a fresh instance is expected is
    /// reparented in place rather than recreated.
    fn adopt(
        &mut self,
        node: NodeId,
        parent: Option<NodeId>,
        subpath: &str,
    ) -> Result<NodeId, TreeError> {
        self.assert_alive(node)?;
        if let Some(parent) = parent {
            self.set_parent(node, parent, subpath)?;
        }
        Ok(node)
    }

    fn input_to_value(&self, input: Input) -> Result<Value, TreeError> {
        match input {
            Input::Value(value) => Ok(value),
            Input::Node(node) => self.snapshot_of(node),
        }
    }

    fn instantiate_container(
        &mut self,
        tree_type: &TypeRef,
        parent: Option<NodeId>,
        subpath: &str,
        value: Value,
    ) -> Result<NodeId, TreeError> {
        let id = self.alloc_id();
        let (store, identifier_attribute) = match tree_type.kind() {
            TypeKind::Object(def) => (
                ChildStore::Object(Default::default()),
                def.identifier_attribute.clone(),
            ),
            TypeKind::List(_) => (ChildStore::List(Vec::new()), None),
            TypeKind::Map(_) => (ChildStore::Map(Default::default()), None),
            _ => return Err(TreeError::WrongKind { expected: "container" }),
        };
        self.nodes.insert(
            id,
            Node {
                id,
                type_ref: tree_type.clone(),
                parent,
                subpath: subpath.to_string(),
                state: LifeCycle::Initializing,
                variant: NodeVariant::Container(ContainerState::new(
                    store,
                    identifier_attribute,
                    parent.is_none(),
                )),
            },
        );

        match tree_type.kind() {
            TypeKind::Object(def) => {
                let value = match &def.pre_process {
                    Some(pre) => pre(value),
                    None => value,
                };
                let properties: Vec<(String, TypeRef)> = def
                    .properties
                    .iter()
                    .map(|(name, t)| (name.clone(), t.clone()))
                    .collect();
                for (name, property_type) in properties {
                    let child_value = value.get(&name).cloned().unwrap_or(Value::Null);
                    let child =
                        self.instantiate(&property_type, Some(id), &name, Input::Value(child_value))?;
                    if let Ok(container) = self.container_mut(id) {
                        if let ChildStore::Object(children) = &mut container.children {
                            children.insert(name, child);
                        }
                    }
                }
            }
            TypeKind::List(element) => {
                let element = element.clone();
                let items = value.as_array().cloned().unwrap_or_default();
                for (index, item) in items.into_iter().enumerate() {
                    let child = self.instantiate(
                        &element,
                        Some(id),
                        &index.to_string(),
                        Input::Value(item),
                    )?;
                    if let Ok(container) = self.container_mut(id) {
                        if let ChildStore::List(children) = &mut container.children {
                            children.push(child);
                        }
                    }
                }
            }
            TypeKind::Map(value_type) => {
                let value_type = value_type.clone();
                let entries: Vec<(String, Value)> = value
                    .as_object()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                for (key, item) in entries {
                    let child =
                        self.instantiate(&value_type, Some(id), &key, Input::Value(item))?;
                    self.check_map_identifier(child, &key)?;
                    if let Ok(container) = self.container_mut(id) {
                        if let ChildStore::Map(children) = &mut container.children {
                            children.insert(key, child);
                        }
                    }
                }
            }
            _ => {}
        }

        self.register_identifier(id)?;
        self.fire_hook(id, Hook::AfterCreate)?;
        if let Ok(node) = self.node_mut(id) {
            node.state = LifeCycle::Created;
        }
        Ok(id)
    }

    fn insert_leaf(
        &mut self,
        tree_type: &TypeRef,
        parent: Option<NodeId>,
        subpath: &str,
        stored: LeafValue,
    ) -> NodeId {
        let id = self.alloc_id();
        self.nodes.insert(
            id,
            Node {
                id,
                type_ref: tree_type.clone(),
                parent,
                subpath: subpath.to_string(),
                state: LifeCycle::Created,
                variant: NodeVariant::Leaf(LeafState { stored }),
            },
        );
        id
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    /// Fires after-attach hooks top-down once every ancestor has finished
    /// its own creation; children finalize only after their parent.
    pub(crate) fn finalize_subtree(&mut self, node: NodeId) -> Result<(), TreeError> {
        let (state, parent) = match self.nodes.get(&node) {
            Some(n) => (n.state, n.parent),
            None => return Ok(()),
        };
        if state != LifeCycle::Created {
            return Ok(());
        }
        if let Some(parent) = parent {
            let parent_ready = self
                .nodes
                .get(&parent)
                .is_some_and(|p| p.state == LifeCycle::Finalized);
            if !parent_ready {
                return Ok(());
            }
            self.fire_hook(node, Hook::AfterAttach)?;
        }
        if let Ok(n) = self.node_mut(node) {
            n.state = LifeCycle::Finalized;
        }
        let children = self
            .nodes
            .get(&node)
            .and_then(|n| n.container())
            .map(|c| c.children.ids())
            .unwrap_or_default();
        for child in children {
            self.finalize_subtree(child)?;
        }
        Ok(())
    }

    // ── Arena access ──────────────────────────────────────────────────────

    pub(crate) fn node_ref(&self, node: NodeId) -> Result<&Node, TreeError> {
        self.nodes.get(&node).ok_or(TreeError::UnknownNode)
    }

    pub(crate) fn node_mut(&mut self, node: NodeId) -> Result<&mut Node, TreeError> {
        self.nodes.get_mut(&node).ok_or(TreeError::UnknownNode)
    }

    pub(crate) fn container_ref(&self, node: NodeId) -> Result<&ContainerState, TreeError> {
        self.node_ref(node)?
            .container()
            .ok_or(TreeError::WrongKind { expected: "container" })
    }

    pub(crate) fn container_mut(&mut self, node: NodeId) -> Result<&mut ContainerState, TreeError> {
        self.node_mut(node)?
            .container_mut()
            .ok_or(TreeError::WrongKind { expected: "container" })
    }

    pub(crate) fn leaf_ref(&self, node: NodeId) -> Result<&LeafState, TreeError> {
        self.node_ref(node)?
            .leaf()
            .ok_or(TreeError::WrongKind { expected: "leaf" })
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub fn is_alive(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(Node::is_alive)
    }

    pub fn lifecycle_of(&self, node: NodeId) -> Result<LifeCycle, TreeError> {
        Ok(self.node_ref(node)?.state)
    }

    pub fn type_of(&self, node: NodeId) -> Result<TypeRef, TreeError> {
        Ok(self.node_ref(node)?.type_ref.clone())
    }

    pub(crate) fn type_id_of(&self, node: NodeId) -> Result<u64, TreeError> {
        Ok(self.node_ref(node)?.type_ref.id())
    }

    pub fn parent_of(&self, node: NodeId) -> Result<Option<NodeId>, TreeError> {
        Ok(self.node_ref(node)?.parent)
    }

    pub fn subpath_of(&self, node: NodeId) -> Result<String, TreeError> {
        Ok(self.node_ref(node)?.subpath.clone())
    }

    pub fn root_of(&self, node: NodeId) -> Result<NodeId, TreeError> {
        let mut current = node;
        loop {
            match self.node_ref(current)?.parent {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
    }

    /// The escaped pointer of a node from its root ("" for the root itself).
    pub fn path_of(&self, node: NodeId) -> Result<String, TreeError> {
        let mut segments = Vec::new();
        let mut current = node;
        loop {
            let n = self.node_ref(current)?;
            match n.parent {
                Some(parent) => {
                    segments.push(n.subpath.clone());
                    current = parent;
                }
                None => break,
            }
        }
        segments.reverse();
        Ok(join_pointer(&segments))
    }

    /// The relative pointer leading from one node to another within a tree.
    pub fn relative_path_between(&self, from: NodeId, to: NodeId) -> Result<String, TreeError> {
        Ok(relative_pointer(&self.path_of(from)?, &self.path_of(to)?))
    }

    pub fn environment_of(&self, node: NodeId) -> Result<Option<Environment>, TreeError> {
        let root = self.root_of(node)?;
        Ok(self
            .node_ref(root)?
            .container()
            .and_then(|c| c.environment.clone()))
    }

    pub(crate) fn assert_alive(&self, node: NodeId) -> Result<(), TreeError> {
        let n = self.node_ref(node)?;
        if n.is_alive() {
            Ok(())
        } else {
            Err(TreeError::DeadNode {
                type_name: n.type_ref.name().to_string(),
            })
        }
    }

    /// The plain serializable value of a node's current state.
    pub fn snapshot_of(&self, node: NodeId) -> Result<Value, TreeError> {
        self.assert_alive(node)?;
        let n = self.node_ref(node)?;
        match &n.variant {
            NodeVariant::Leaf(leaf) => match &leaf.stored {
                LeafValue::Plain(value) => match n.type_ref.kind() {
                    TypeKind::Custom(def) => Ok((def.to_snapshot)(value)),
                    _ => Ok(value.clone()),
                },
                LeafValue::Reference(stored) => Ok(stored.identifier.clone()),
            },
            NodeVariant::Container(container) => {
                Ok(container
                    .snapshot
                    .get_or_compute(|| self.compute_snapshot(node)))
            }
        }
    }

    fn compute_snapshot(&self, node: NodeId) -> Value {
        let Some(n) = self.nodes.get(&node) else {
            return Value::Null;
        };
        let Some(container) = n.container() else {
            return Value::Null;
        };
        match (&n.type_ref.kind(), &container.children) {
            (TypeKind::Object(def), ChildStore::Object(children)) => {
                let mut out = serde_json::Map::new();
                for (name, child) in children {
                    out.insert(
                        name.clone(),
                        self.snapshot_of(*child).unwrap_or(Value::Null),
                    );
                }
                let snapshot = Value::Object(out);
                match &def.post_process {
                    Some(post) => post(snapshot),
                    None => snapshot,
                }
            }
            (TypeKind::List(_), ChildStore::List(children)) => Value::Array(
                children
                    .iter()
                    .map(|child| self.snapshot_of(*child).unwrap_or(Value::Null))
                    .collect(),
            ),
            (TypeKind::Map(_), ChildStore::Map(children)) => {
                let mut out = serde_json::Map::new();
                for (key, child) in children {
                    out.insert(key.clone(), self.snapshot_of(*child).unwrap_or(Value::Null));
                }
                Value::Object(out)
            }
            _ => Value::Null,
        }
    }

    /// Like [`Tree::snapshot_of`], but a reference leaf yields its resolved
    /// target's snapshot instead of the stored identifier.
    pub fn value_of(&self, node: NodeId) -> Result<Value, TreeError> {
        let n = self.node_ref(node)?;
        if matches!(n.type_ref.kind(), TypeKind::Reference(_)) {
            let target = self.dereference(node)?;
            return self.snapshot_of(target);
        }
        self.snapshot_of(node)
    }

    pub fn child_of(&self, node: NodeId, key: &str) -> Result<NodeId, TreeError> {
        self.assert_alive(node)?;
        let container = self.container_ref(node)?;
        container
            .children
            .get(key)
            .ok_or_else(|| TreeError::PathResolution {
                segment: key.to_string(),
                path: self.path_of(node).unwrap_or_default(),
            })
    }

    pub fn children_of(&self, node: NodeId) -> Result<Vec<NodeId>, TreeError> {
        self.assert_alive(node)?;
        Ok(self.container_ref(node)?.children.ids())
    }

    /// The snapshot of an object property; reference properties resolve to
    /// their target's snapshot.
    pub fn get_property(&self, node: NodeId, property: &str) -> Result<Value, TreeError> {
        self.value_of(self.child_of(node, property)?)
    }

    pub fn list_len(&self, node: NodeId) -> Result<usize, TreeError> {
        self.assert_alive(node)?;
        match &self.container_ref(node)?.children {
            ChildStore::List(children) => Ok(children.len()),
            _ => Err(TreeError::WrongKind { expected: "list" }),
        }
    }

    pub fn map_keys(&self, node: NodeId) -> Result<Vec<String>, TreeError> {
        self.assert_alive(node)?;
        match &self.container_ref(node)?.children {
            ChildStore::Map(children) => Ok(children.keys().cloned().collect()),
            _ => Err(TreeError::WrongKind { expected: "map" }),
        }
    }

    pub fn map_get(&self, node: NodeId, key: &str) -> Result<Option<NodeId>, TreeError> {
        self.assert_alive(node)?;
        match &self.container_ref(node)?.children {
            ChildStore::Map(children) => Ok(children.get(key).copied()),
            _ => Err(TreeError::WrongKind { expected: "map" }),
        }
    }

    /// Evaluates a named view registered on the node's object type.
    pub fn view(&self, node: NodeId, name: &str) -> Result<Value, TreeError> {
        self.assert_alive(node)?;
        let view = self
            .node_ref(node)?
            .type_ref
            .object_def()
            .and_then(|def| def.views.get(name))
            .cloned()
            .ok_or_else(|| TreeError::UnknownView {
                name: name.to_string(),
            })?;
        view(self, node)
    }

    pub(crate) fn identifier_attribute_of(&self, node: NodeId) -> Option<String> {
        self.nodes
            .get(&node)
            .and_then(|n| n.container())
            .and_then(|c| c.identifier_attribute.clone())
    }

    /// The raw identifier value of an identified object, read directly from
    /// the identifier leaf (usable during teardown).
    pub(crate) fn identifier_value_of(&self, node: NodeId) -> Result<Option<Value>, TreeError> {
        let n = self.node_ref(node)?;
        let Some(container) = n.container() else {
            return Ok(None);
        };
        let Some(attr) = &container.identifier_attribute else {
            return Ok(None);
        };
        let Some(child) = container.children.get(attr) else {
            return Ok(None);
        };
        match self.node_ref(child)?.leaf() {
            Some(leaf) => match &leaf.stored {
                LeafValue::Plain(value) => Ok(Some(value.clone())),
                LeafValue::Reference(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    // ── Identifier cache & references ─────────────────────────────────────

    fn register_identifier(&mut self, node: NodeId) -> Result<(), TreeError> {
        let Some(identifier) = self.identifier_value_of(node)? else {
            return Ok(());
        };
        let key = identifier_string(&identifier);
        let type_id = self.type_id_of(node)?;
        let root = self.root_of(node)?;
        let container = self.container_mut(root)?;
        match container.identifier_cache.as_mut() {
            Some(cache) => cache.add(&key, node, type_id),
            None => Ok(()),
        }
    }

    fn deregister_identifier(&mut self, node: NodeId) {
        let Ok(Some(identifier)) = self.identifier_value_of(node) else {
            return;
        };
        let key = identifier_string(&identifier);
        let Ok(root) = self.root_of(node) else {
            return;
        };
        if let Ok(container) = self.container_mut(root) {
            if let Some(cache) = container.identifier_cache.as_mut() {
                cache.remove(&key, node);
            }
        }
    }

    /// Finds the unique live node registered under `identifier` whose type
    /// is assignable to `target_type`, within the tree holding `node`.
    pub fn resolve_identifier(
        &self,
        node: NodeId,
        target_type: &TypeRef,
        identifier: &str,
    ) -> Result<NodeId, TreeError> {
        let root = self.root_of(node)?;
        let container = self.container_ref(root)?;
        let Some(cache) = container.identifier_cache.as_ref() else {
            return Err(TreeError::UnresolvedReference {
                identifier: identifier.to_string(),
                type_name: target_type.name().to_string(),
            });
        };
        let resolution = cache.resolve(identifier, |candidate| {
            self.nodes
                .get(&candidate)
                .is_some_and(|n| n.is_alive() && target_type.is_assignable_from(&n.type_ref))
        });
        match resolution {
            crate::identifiers::Resolution::One(found) => Ok(found),
            crate::identifiers::Resolution::None => Err(TreeError::UnresolvedReference {
                identifier: identifier.to_string(),
                type_name: target_type.name().to_string(),
            }),
            crate::identifiers::Resolution::Many(candidates) => {
                let paths: Vec<String> = candidates
                    .iter()
                    .map(|c| self.path_of(*c).unwrap_or_default())
                    .collect();
                Err(TreeError::AmbiguousReference {
                    identifier: identifier.to_string(),
                    type_name: target_type.name().to_string(),
                    candidates: paths.join(", "),
                })
            }
        }
    }

    /// Resolves a reference leaf to its target node: lazily through the
    /// identifier cache of the leaf's root, memoized until the target dies.
    pub fn dereference(&self, node: NodeId) -> Result<NodeId, TreeError> {
        self.assert_alive(node)?;
        let n = self.node_ref(node)?;
        let TypeKind::Reference(target_type) = n.type_ref.kind() else {
            return Err(TreeError::WrongKind { expected: "reference" });
        };
        let leaf = self.leaf_ref(node)?;
        let LeafValue::Reference(stored) = &leaf.stored else {
            return Err(TreeError::WrongKind { expected: "reference" });
        };
        if let Some(cached) = stored.resolved.get() {
            if self.is_alive(cached) {
                return Ok(cached);
            }
        }
        let identifier = identifier_string(&stored.identifier);
        let resolved = self.resolve_identifier(node, target_type, &identifier)?;
        stored.resolved.set(Some(resolved));
        Ok(resolved)
    }

    pub(crate) fn reference_matches(
        &self,
        node: NodeId,
        input: &Input,
    ) -> Result<bool, TreeError> {
        let Ok(leaf) = self.leaf_ref(node) else {
            return Ok(false);
        };
        let LeafValue::Reference(stored) = &leaf.stored else {
            return Ok(false);
        };
        match input {
            Input::Node(target) => Ok(stored.resolved.get() == Some(*target)),
            Input::Value(value) => Ok(stored.identifier == *value),
        }
    }

    // ── Path resolution ───────────────────────────────────────────────────

    /// Resolves a pointer from `node`: `""` jumps to the root, `".."` to
    /// the parent, `"."` stays, and reference leaves forward resolution to
    /// their target.
    pub fn resolve_path(&self, node: NodeId, pointer: &str) -> Result<NodeId, TreeError> {
        self.resolve_segments(node, &split_pointer(pointer))
    }

    pub fn try_resolve_path(&self, node: NodeId, pointer: &str) -> Option<NodeId> {
        self.resolve_path(node, pointer).ok()
    }

    pub(crate) fn resolve_segments(
        &self,
        start: NodeId,
        segments: &[String],
    ) -> Result<NodeId, TreeError> {
        let mut current = start;
        for (position, segment) in segments.iter().enumerate() {
            current = match segment.as_str() {
                "" => self.root_of(current)?,
                "." => current,
                ".." => self
                    .parent_of(current)?
                    .ok_or_else(|| TreeError::PathResolution {
                        segment: segment.clone(),
                        path: join_pointer(&segments[..position]),
                    })?,
                _ => {
                    let base = if matches!(
                        self.node_ref(current)?.type_ref.kind(),
                        TypeKind::Reference(_)
                    ) {
                        self.dereference(current)?
                    } else {
                        current
                    };
                    self.child_of(base, segment)
                        .map_err(|_| TreeError::PathResolution {
                            segment: segment.clone(),
                            path: join_pointer(&segments[..position]),
                        })?
                }
            };
        }
        Ok(current)
    }

    // ── Protection & write gating ─────────────────────────────────────────

    /// Re-enables write protection: mutations outside actions fail.
    pub fn protect(&mut self, node: NodeId) -> Result<(), TreeError> {
        let root = self.root_of(node)?;
        self.container_mut(root)?.protection.set(true);
        Ok(())
    }

    /// Disables write protection on the node's tree.
    pub fn unprotect(&mut self, node: NodeId) -> Result<(), TreeError> {
        let root = self.root_of(node)?;
        self.container_mut(root)?.protection.set(false);
        Ok(())
    }

    pub fn is_protected(&self, node: NodeId) -> Result<bool, TreeError> {
        let root = self.root_of(node)?;
        Ok(self
            .node_ref(root)?
            .container()
            .map(|c| *c.protection.get())
            .unwrap_or(false))
    }

    pub fn is_running_action(&self, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            let Some(n) = self.nodes.get(&id) else {
                return false;
            };
            if n.container().is_some_and(|c| c.running_action) {
                return true;
            }
            current = n.parent;
        }
        false
    }

    pub(crate) fn assert_writable(&self, node: NodeId) -> Result<(), TreeError> {
        self.assert_alive(node)?;
        if self.is_running_action(node) || !self.is_protected(node)? {
            Ok(())
        } else {
            Err(TreeError::NotWritable {
                path: self.path_of(node)?,
            })
        }
    }

    pub(crate) fn validate_input(
        &self,
        expected: &TypeRef,
        input: &Input,
        path: &str,
    ) -> Vec<ValidationError> {
        match input {
            Input::Value(value) => expected.validate(value, path),
            Input::Node(node) => match self.nodes.get(node) {
                Some(n) if n.is_alive() && expected.is_assignable_from(&n.type_ref) => Vec::new(),
                Some(n) => vec![ValidationError {
                    path: path.to_string(),
                    value: self.snapshot_of(*node).unwrap_or(Value::Null),
                    message: format!(
                        "a node of type '{}' is not assignable to '{}'",
                        n.type_ref.name(),
                        expected.name()
                    ),
                }],
                None => vec![ValidationError {
                    path: path.to_string(),
                    value: Value::Null,
                    message: "the value refers to a node that is not part of this tree".to_string(),
                }],
            },
        }
    }

    pub(crate) fn determine_union_variant(
        &self,
        union_type: &TypeRef,
        input: &Input,
    ) -> Result<TypeRef, TreeError> {
        let TypeKind::Union(def) = union_type.kind() else {
            return Err(TreeError::WrongKind { expected: "union" });
        };
        if let Some(dispatcher) = &def.dispatcher {
            let value = match input {
                Input::Value(value) => value.clone(),
                Input::Node(node) => self.snapshot_of(*node)?,
            };
            return dispatcher(&value).ok_or_else(|| TreeError::AmbiguousUnion {
                type_name: union_type.name().to_string(),
            });
        }
        let mut matches: Vec<TypeRef> = Vec::new();
        for variant in &def.variants {
            let applicable = match input {
                Input::Value(value) => variant.is(value),
                Input::Node(node) => self
                    .nodes
                    .get(node)
                    .is_some_and(|n| variant.is_assignable_from(&n.type_ref)),
            };
            if applicable {
                if def.eager {
                    return Ok(variant.clone());
                }
                matches.push(variant.clone());
            }
        }
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(TreeError::Validation(vec![ValidationError {
                path: String::new(),
                value: match input {
                    Input::Value(value) => value.clone(),
                    Input::Node(_) => Value::Null,
                },
                message: format!(
                    "no type is applicable for the union {}",
                    union_type.describe()
                ),
            }])),
            _ => Err(TreeError::AmbiguousUnion {
                type_name: union_type.name().to_string(),
            }),
        }
    }

    // ── Mutation pipeline ─────────────────────────────────────────────────

    /// Sets an object property, reconciling the incoming value into the
    /// live child node.
    pub fn set_property(
        &mut self,
        node: NodeId,
        property: &str,
        input: impl Into<Input>,
    ) -> Result<(), TreeError> {
        let input = input.into();
        self.assert_writable(node)?;
        let (property_type, old_child) = {
            let n = self.node_ref(node)?;
            let type_ref = n.type_ref.clone();
            let def = type_ref
                .object_def()
                .ok_or(TreeError::WrongKind { expected: "object" })?;
            let property_type =
                def.property(property)
                    .cloned()
                    .ok_or_else(|| TreeError::UnknownProperty {
                        name: property.to_string(),
                        type_name: type_ref.name().to_string(),
                    })?;
            let old_child = n
                .container()
                .and_then(|c| c.children.get(property))
                .ok_or_else(|| TreeError::UnknownProperty {
                    name: property.to_string(),
                    type_name: type_ref.name().to_string(),
                })?;
            (property_type, old_child)
        };
        if let Input::Node(incoming) = &input {
            if *incoming != old_child && self.parent_of(*incoming)? == Some(node) {
                return Err(TreeError::DoubleParent {
                    path: format!("{}/{}", self.path_of(node)?, property),
                    existing: self.path_of(*incoming)?,
                });
            }
        }
        let errors = self.validate_input(&property_type, &input, property);
        if !errors.is_empty() {
            return Err(TreeError::Validation(errors));
        }
        let old_snapshot = self.snapshot_of(old_child)?;
        let new_child =
            reconcile::value_as_node(self, &property_type, node, property, input, Some(old_child))?;
        if new_child == old_child {
            return Ok(());
        }
        if let Ok(container) = self.container_mut(node) {
            if let ChildStore::Object(children) = &mut container.children {
                children.insert(property.to_string(), new_child);
            }
        }
        let new_snapshot = self.snapshot_of(new_child)?;
        self.emit_patch(
            node,
            ReversiblePatch {
                op: PatchOp::Replace,
                path: escape_segment(property),
                value: Some(new_snapshot),
                old_value: Some(old_snapshot),
            },
        );
        self.after_mutation(node);
        Ok(())
    }

    /// Replaces `delete_count` elements at `index` with `inputs`.
    pub fn list_splice(
        &mut self,
        node: NodeId,
        index: usize,
        delete_count: usize,
        inputs: Vec<Input>,
    ) -> Result<(), TreeError> {
        self.assert_writable(node)?;
        let (element_type, removed) = {
            let n = self.node_ref(node)?;
            let TypeKind::List(element_type) = n.type_ref.kind() else {
                return Err(TreeError::WrongKind { expected: "list" });
            };
            let children = match n.container().map(|c| &c.children) {
                Some(ChildStore::List(children)) => children,
                _ => return Err(TreeError::WrongKind { expected: "list" }),
            };
            let len = children.len();
            if index > len {
                return Err(TreeError::IndexOutOfBounds { index, len });
            }
            let delete = delete_count.min(len - index);
            (element_type.clone(), children[index..index + delete].to_vec())
        };
        for (offset, input) in inputs.iter().enumerate() {
            let errors = self.validate_input(&element_type, input, &(index + offset).to_string());
            if !errors.is_empty() {
                return Err(TreeError::Validation(errors));
            }
        }
        let mut removed_snapshots = Vec::with_capacity(removed.len());
        for old in &removed {
            removed_snapshots.push(self.snapshot_of(*old)?);
        }
        let added_count = inputs.len();
        let added =
            reconcile::reconcile_list_items(self, &element_type, node, removed.clone(), inputs, index)?;
        {
            let container = self.container_mut(node)?;
            if let ChildStore::List(children) = &mut container.children {
                let _replaced: Vec<NodeId> = children
                    .splice(index..index + removed.len(), added.iter().copied())
                    .collect();
            }
        }
        // renumber the elements that shifted
        let tail: Vec<NodeId> = {
            let container = self.container_ref(node)?;
            match &container.children {
                ChildStore::List(children) => children[index + added_count..].to_vec(),
                _ => Vec::new(),
            }
        };
        for (offset, child) in tail.iter().enumerate() {
            if let Ok(n) = self.node_mut(*child) {
                n.subpath = (index + added_count + offset).to_string();
            }
        }
        for (offset, old_snapshot) in removed_snapshots.iter().enumerate().rev() {
            self.emit_patch(
                node,
                ReversiblePatch {
                    op: PatchOp::Remove,
                    path: (index + offset).to_string(),
                    value: None,
                    old_value: Some(old_snapshot.clone()),
                },
            );
        }
        for (offset, child) in added.iter().enumerate() {
            let snapshot = self.snapshot_of(*child)?;
            self.emit_patch(
                node,
                ReversiblePatch {
                    op: PatchOp::Add,
                    path: (index + offset).to_string(),
                    value: Some(snapshot),
                    old_value: None,
                },
            );
        }
        self.after_mutation(node);
        Ok(())
    }

    pub fn list_push(&mut self, node: NodeId, input: impl Into<Input>) -> Result<(), TreeError> {
        let len = self.list_len(node)?;
        self.list_splice(node, len, 0, vec![input.into()])
    }

    pub fn list_insert(
        &mut self,
        node: NodeId,
        index: usize,
        input: impl Into<Input>,
    ) -> Result<(), TreeError> {
        self.list_splice(node, index, 0, vec![input.into()])
    }

    pub fn list_remove(&mut self, node: NodeId, index: usize) -> Result<(), TreeError> {
        self.list_splice(node, index, 1, Vec::new())
    }

    /// Replaces the element at `index` in place.
    pub fn list_set(
        &mut self,
        node: NodeId,
        index: usize,
        input: impl Into<Input>,
    ) -> Result<(), TreeError> {
        let input = input.into();
        self.assert_writable(node)?;
        let (element_type, old_child) = {
            let n = self.node_ref(node)?;
            let TypeKind::List(element_type) = n.type_ref.kind() else {
                return Err(TreeError::WrongKind { expected: "list" });
            };
            let children = match n.container().map(|c| &c.children) {
                Some(ChildStore::List(children)) => children,
                _ => return Err(TreeError::WrongKind { expected: "list" }),
            };
            let old = children
                .get(index)
                .copied()
                .ok_or(TreeError::IndexOutOfBounds {
                    index,
                    len: children.len(),
                })?;
            (element_type.clone(), old)
        };
        if let Input::Node(incoming) = &input {
            if *incoming == old_child {
                return Ok(());
            }
        }
        let errors = self.validate_input(&element_type, &input, &index.to_string());
        if !errors.is_empty() {
            return Err(TreeError::Validation(errors));
        }
        let old_snapshot = self.snapshot_of(old_child)?;
        let new_children = reconcile::reconcile_list_items(
            self,
            &element_type,
            node,
            vec![old_child],
            vec![input],
            index,
        )?;
        let new_child = new_children[0];
        if new_child == old_child {
            return Ok(());
        }
        if let Ok(container) = self.container_mut(node) {
            if let ChildStore::List(children) = &mut container.children {
                children[index] = new_child;
            }
        }
        let new_snapshot = self.snapshot_of(new_child)?;
        self.emit_patch(
            node,
            ReversiblePatch {
                op: PatchOp::Replace,
                path: index.to_string(),
                value: Some(new_snapshot),
                old_value: Some(old_snapshot),
            },
        );
        self.after_mutation(node);
        Ok(())
    }

    /// Adds or replaces a map entry. A map of identified objects must store
    /// each object under its own identifier.
    pub fn map_set(
        &mut self,
        node: NodeId,
        key: &str,
        input: impl Into<Input>,
    ) -> Result<(), TreeError> {
        let input = input.into();
        self.assert_writable(node)?;
        let (value_type, existing) = {
            let n = self.node_ref(node)?;
            let TypeKind::Map(value_type) = n.type_ref.kind() else {
                return Err(TreeError::WrongKind { expected: "map" });
            };
            let children = match n.container().map(|c| &c.children) {
                Some(ChildStore::Map(children)) => children,
                _ => return Err(TreeError::WrongKind { expected: "map" }),
            };
            (value_type.clone(), children.get(key).copied())
        };
        let errors = self.validate_input(&value_type, &input, key);
        if !errors.is_empty() {
            return Err(TreeError::Validation(errors));
        }
        match existing {
            Some(old_child) => {
                if let Input::Node(incoming) = &input {
                    if *incoming == old_child {
                        return Ok(());
                    }
                }
                let old_snapshot = self.snapshot_of(old_child)?;
                let new_child = reconcile::value_as_node(
                    self,
                    &value_type,
                    node,
                    key,
                    input,
                    Some(old_child),
                )?;
                self.check_map_identifier(new_child, key)?;
                if new_child == old_child {
                    return Ok(());
                }
                if let Ok(container) = self.container_mut(node) {
                    if let ChildStore::Map(children) = &mut container.children {
                        children.insert(key.to_string(), new_child);
                    }
                }
                let new_snapshot = self.snapshot_of(new_child)?;
                self.emit_patch(
                    node,
                    ReversiblePatch {
                        op: PatchOp::Replace,
                        path: escape_segment(key),
                        value: Some(new_snapshot),
                        old_value: Some(old_snapshot),
                    },
                );
            }
            None => {
                if let Input::Node(incoming) = &input {
                    if self.parent_of(*incoming)? == Some(node) {
                        return Err(TreeError::DoubleParent {
                            path: format!("{}/{}", self.path_of(node)?, key),
                            existing: self.path_of(*incoming)?,
                        });
                    }
                }
                let new_child =
                    reconcile::value_as_node(self, &value_type, node, key, input, None)?;
                self.check_map_identifier(new_child, key)?;
                if let Ok(container) = self.container_mut(node) {
                    if let ChildStore::Map(children) = &mut container.children {
                        children.insert(key.to_string(), new_child);
                    }
                }
                let snapshot = self.snapshot_of(new_child)?;
                self.emit_patch(
                    node,
                    ReversiblePatch {
                        op: PatchOp::Add,
                        path: escape_segment(key),
                        value: Some(snapshot),
                        old_value: None,
                    },
                );
            }
        }
        self.after_mutation(node);
        Ok(())
    }

    /// Removes a map entry, disposing its node. Returns whether the key was
    /// present.
    pub fn map_remove(&mut self, node: NodeId, key: &str) -> Result<bool, TreeError> {
        self.assert_writable(node)?;
        let child = match &self.container_ref(node)?.children {
            ChildStore::Map(children) => children.get(key).copied(),
            _ => return Err(TreeError::WrongKind { expected: "map" }),
        };
        let Some(child) = child else {
            return Ok(false);
        };
        let old_snapshot = self.snapshot_of(child)?;
        self.dispose_subtree(child)?;
        if let Ok(container) = self.container_mut(node) {
            if let ChildStore::Map(children) = &mut container.children {
                children.shift_remove(key);
            }
        }
        self.emit_patch(
            node,
            ReversiblePatch {
                op: PatchOp::Remove,
                path: escape_segment(key),
                value: None,
                old_value: Some(old_snapshot),
            },
        );
        self.after_mutation(node);
        Ok(true)
    }

    fn check_map_identifier(&self, child: NodeId, key: &str) -> Result<(), TreeError> {
        if let Some(identifier) = self.identifier_value_of(child)? {
            let identifier = identifier_string(&identifier);
            if identifier != key {
                return Err(TreeError::MapKeyMismatch {
                    key: key.to_string(),
                    identifier,
                });
            }
        }
        Ok(())
    }

    // ── Snapshot & patch application ──────────────────────────────────────

    /// Applies a full snapshot to a container node, reconciling children in
    /// place. Runs as the reserved `@APPLY_SNAPSHOT` action.
    pub fn apply_snapshot(&mut self, node: NodeId, snapshot: Value) -> Result<(), TreeError> {
        self.assert_alive(node)?;
        self.container_ref(node)?;
        if self.snapshot_of(node)? == snapshot {
            return Ok(());
        }
        let root = self.root_of(node)?;
        let event = self.new_event(APPLY_SNAPSHOT, vec![snapshot.clone()], node, root);
        let mut body = {
            let snapshot = snapshot.clone();
            move |tree: &mut Tree| {
                tree.apply_snapshot_body(node, snapshot.clone())?;
                Ok(Value::Null)
            }
        };
        self.run_action(event, &mut body)?;
        Ok(())
    }

    fn apply_snapshot_body(&mut self, node: NodeId, snapshot: Value) -> Result<(), TreeError> {
        let type_ref = self.type_of(node)?;
        let errors = type_ref.validate(&snapshot, "");
        if !errors.is_empty() {
            return Err(TreeError::Validation(errors));
        }
        match type_ref.kind() {
            TypeKind::Object(def) => {
                let snapshot = match &def.pre_process {
                    Some(pre) => pre(snapshot),
                    None => snapshot,
                };
                let properties: Vec<String> = def.properties.keys().cloned().collect();
                for property in properties {
                    let value = snapshot.get(&property).cloned().unwrap_or(Value::Null);
                    self.set_property(node, &property, Input::Value(value))?;
                }
                Ok(())
            }
            TypeKind::List(_) => {
                let items: Vec<Input> = snapshot
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(Input::Value)
                    .collect();
                let len = self.list_len(node)?;
                self.list_splice(node, 0, len, items)
            }
            TypeKind::Map(_) => {
                let entries: Vec<(String, Value)> = snapshot
                    .as_object()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                let incoming: std::collections::HashSet<String> =
                    entries.iter().map(|(k, _)| k.clone()).collect();
                let stale: Vec<String> = self
                    .map_keys(node)?
                    .into_iter()
                    .filter(|k| !incoming.contains(k))
                    .collect();
                for (key, value) in entries {
                    self.map_set(node, &key, Input::Value(value))?;
                }
                for key in stale {
                    self.map_remove(node, &key)?;
                }
                Ok(())
            }
            _ => Err(TreeError::WrongKind { expected: "container" }),
        }
    }

    /// Applies serialized patches relative to `node`. Runs as the reserved
    /// `@APPLY_PATCHES` action.
    pub fn apply_patches(&mut self, node: NodeId, patches: &[Patch]) -> Result<(), TreeError> {
        self.assert_alive(node)?;
        self.container_ref(node)?;
        let root = self.root_of(node)?;
        let arguments = vec![serde_json::to_value(patches).unwrap_or(Value::Null)];
        let event = self.new_event(APPLY_PATCHES, arguments, node, root);
        let patches = patches.to_vec();
        let mut body = move |tree: &mut Tree| {
            for patch in &patches {
                let segments = split_pointer(&patch.path);
                let Some((last, parents)) = segments.split_last() else {
                    return Err(TreeError::MalformedPatch {
                        path: patch.path.clone(),
                    });
                };
                let target = tree.resolve_segments(node, parents)?;
                tree.apply_patch_locally(target, last, patch)?;
            }
            Ok(Value::Null)
        };
        self.run_action(event, &mut body)?;
        Ok(())
    }

    fn apply_patch_locally(
        &mut self,
        node: NodeId,
        subpath: &str,
        patch: &Patch,
    ) -> Result<(), TreeError> {
        let type_ref = self.type_of(node)?;
        match type_ref.kind() {
            TypeKind::Object(_) => match patch.op {
                PatchOp::Add | PatchOp::Replace => self.set_property(
                    node,
                    subpath,
                    Input::Value(patch.value.clone().unwrap_or(Value::Null)),
                ),
                PatchOp::Remove => Err(TreeError::UnsupportedPatchOp {
                    op: patch.op.to_string(),
                }),
            },
            TypeKind::List(_) => {
                let len = self.list_len(node)?;
                let index = parse_index(subpath, len).map_err(|_| TreeError::MalformedPatch {
                    path: patch.path.clone(),
                })?;
                match patch.op {
                    PatchOp::Replace => self.list_set(
                        node,
                        index,
                        Input::Value(patch.value.clone().unwrap_or(Value::Null)),
                    ),
                    PatchOp::Add => self.list_splice(
                        node,
                        index,
                        0,
                        vec![Input::Value(patch.value.clone().unwrap_or(Value::Null))],
                    ),
                    PatchOp::Remove => self.list_splice(node, index, 1, Vec::new()),
                }
            }
            TypeKind::Map(_) => match patch.op {
                PatchOp::Add | PatchOp::Replace => self.map_set(
                    node,
                    subpath,
                    Input::Value(patch.value.clone().unwrap_or(Value::Null)),
                ),
                PatchOp::Remove => {
                    self.map_remove(node, subpath)?;
                    Ok(())
                }
            },
            _ => Err(TreeError::WrongKind { expected: "container" }),
        }
    }

    // ── Actions & middleware ──────────────────────────────────────────────

    /// Invokes a named action registered on the node's type, threading the
    /// call through the middleware chain of the node and its ancestors.
    pub fn invoke(
        &mut self,
        node: NodeId,
        name: &str,
        arguments: Vec<Value>,
    ) -> Result<Value, TreeError> {
        self.assert_alive(node)?;
        let handler = self
            .node_ref(node)?
            .type_ref
            .object_def()
            .and_then(|def| def.actions.get(name))
            .cloned()
            .ok_or_else(|| TreeError::UnknownAction {
                name: name.to_string(),
            })?;
        let root = self.root_of(node)?;
        let event = self.new_event(name, arguments.clone(), node, root);
        let mut body = move |tree: &mut Tree| handler(tree, node, &arguments);
        self.run_action(event, &mut body)
    }

    fn new_event(
        &mut self,
        name: &str,
        arguments: Vec<Value>,
        context: NodeId,
        tree_root: NodeId,
    ) -> MiddlewareEvent {
        let id = self.next_action_id;
        self.next_action_id += 1;
        let (parent_id, root_id) = match self.action_stack.last() {
            Some(frame) => (frame.id, frame.root_id),
            None => (0, id),
        };
        MiddlewareEvent {
            id,
            parent_id,
            root_id,
            name: name.to_string(),
            arguments,
            context,
            tree_root,
        }
    }

    fn run_action(
        &mut self,
        event: MiddlewareEvent,
        terminal: &mut dyn FnMut(&mut Tree) -> Result<Value, TreeError>,
    ) -> Result<Value, TreeError> {
        self.assert_alive(event.context)?;
        let middlewares = self.collect_middlewares(event.context, &event.name)?;
        let previous = self.set_running(event.context, true);
        self.action_stack.push(ActionFrame {
            id: event.id,
            root_id: event.root_id,
        });
        let result = run_chain(self, &event, &middlewares, terminal);
        self.action_stack.pop();
        self.set_running(event.context, previous);
        result
    }

    fn set_running(&mut self, node: NodeId, running: bool) -> bool {
        match self.nodes.get_mut(&node).and_then(Node::container_mut) {
            Some(container) => {
                let previous = container.running_action;
                container.running_action = running;
                previous
            }
            None => false,
        }
    }

    fn collect_middlewares(
        &self,
        node: NodeId,
        action_name: &str,
    ) -> Result<Vec<Middleware>, TreeError> {
        let mut collected = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let n = self.node_ref(id)?;
            if let Some(container) = n.container() {
                for middleware in &container.middlewares {
                    if middleware.include_hooks || !action_name.starts_with('@') {
                        collected.push(middleware.clone());
                    }
                }
            }
            current = n.parent;
        }
        Ok(collected)
    }

    /// Registers a middleware on a node; it sees every action invoked on
    /// the node or its descendants. Returns the registration id.
    pub fn add_middleware(
        &mut self,
        node: NodeId,
        handler: impl Fn(&MiddlewareEvent, &mut MiddlewareChain<'_>) + 'static,
        include_hooks: bool,
    ) -> Result<u64, TreeError> {
        self.assert_alive(node)?;
        if !self.is_protected(node)? {
            warn!(
                "attaching middleware to an unprotected tree; changes made outside actions will bypass it"
            );
        }
        let id = self.next_middleware_id;
        self.next_middleware_id += 1;
        self.container_mut(node)?.middlewares.push(Middleware {
            id,
            handler: std::rc::Rc::new(handler),
            include_hooks,
        });
        Ok(id)
    }

    pub fn remove_middleware(&mut self, node: NodeId, id: u64) -> bool {
        match self.nodes.get_mut(&node).and_then(Node::container_mut) {
            Some(container) => {
                let before = container.middlewares.len();
                container.middlewares.retain(|m| m.id != id);
                container.middlewares.len() != before
            }
            None => false,
        }
    }

    /// Observes top-level action invocations at (or below) `node` as
    /// serialized calls, suitable for recording and replay.
    pub fn on_action(
        &mut self,
        node: NodeId,
        listener: impl FnMut(SerializedActionCall) + 'static,
    ) -> Result<u64, TreeError> {
        let listener = std::rc::Rc::new(std::cell::RefCell::new(listener));
        self.add_middleware(
            node,
            move |event, chain| {
                chain.next();
                if event.is_top_level() {
                    let tree = chain.tree();
                    let from = tree.path_of(node).unwrap_or_default();
                    let to = tree.path_of(event.context).unwrap_or_default();
                    let call = SerializedActionCall {
                        name: event.name.clone(),
                        path: relative_pointer(&from, &to),
                        arguments: event.arguments.clone(),
                    };
                    (&mut *listener.borrow_mut())(call);
                }
            },
            true,
        )
    }

    pub fn off_action(&mut self, node: NodeId, id: u64) -> bool {
        self.remove_middleware(node, id)
    }

    /// Applies a serialized action call: resolves the path relative to
    /// `node`, then dispatches by name through the action registry. The
    /// reserved names route to patch and snapshot application.
    pub fn apply_action(
        &mut self,
        node: NodeId,
        call: &SerializedActionCall,
    ) -> Result<Value, TreeError> {
        let target = self.resolve_path(node, &call.path)?;
        match call.name.as_str() {
            APPLY_PATCHES => {
                let patches: Vec<Patch> = serde_json::from_value(
                    call.arguments.first().cloned().unwrap_or(Value::Null),
                )
                .map_err(|_| TreeError::MalformedPatch {
                    path: call.path.clone(),
                })?;
                self.apply_patches(target, &patches)?;
                Ok(Value::Null)
            }
            APPLY_SNAPSHOT => {
                self.apply_snapshot(target, call.arguments.first().cloned().unwrap_or(Value::Null))?;
                Ok(Value::Null)
            }
            name => self.invoke(target, name, call.arguments.clone()),
        }
    }

    pub(crate) fn fire_hook(&mut self, node: NodeId, hook: Hook) -> Result<(), TreeError> {
        let Some(handler) = self
            .nodes
            .get(&node)
            .and_then(|n| n.type_ref.object_def())
            .and_then(|def| def.hooks.get(&hook))
            .cloned()
        else {
            return Ok(());
        };
        let previous = self.set_running(node, true);
        let result = handler(self, node);
        self.set_running(node, previous);
        result
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Observes the node's snapshot; the listener fires after each mutation
    /// that invalidated it.
    pub fn on_snapshot(
        &mut self,
        node: NodeId,
        listener: impl FnMut(&Value) + 'static,
    ) -> Result<u64, TreeError> {
        self.assert_alive(node)?;
        let container = self.container_mut(node)?;
        let reaction = Reaction::new(&container.snapshot_atom, listener);
        let id = container.bump_subscriber_id();
        container.snapshot_subscribers.insert(id, reaction);
        Ok(id)
    }

    pub fn off_snapshot(&mut self, node: NodeId, id: u64) -> bool {
        self.nodes
            .get_mut(&node)
            .and_then(Node::container_mut)
            .map(|c| c.snapshot_subscribers.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Observes (forward, inverse) patch pairs bubbling through the node.
    pub fn on_patch(
        &mut self,
        node: NodeId,
        listener: impl FnMut(&Patch, &Patch) + 'static,
    ) -> Result<u64, TreeError> {
        self.assert_alive(node)?;
        let container = self.container_mut(node)?;
        let id = container.bump_subscriber_id();
        container.patch_subscribers.insert(id, Box::new(listener));
        Ok(id)
    }

    pub fn off_patch(&mut self, node: NodeId, id: u64) -> bool {
        self.nodes
            .get_mut(&node)
            .and_then(Node::container_mut)
            .map(|c| c.patch_subscribers.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Localizes a reversible patch to every ancestor with subscribers and
    /// delivers the (forward, inverse) pair.
    pub(crate) fn emit_patch(&mut self, origin: NodeId, patch: ReversiblePatch) {
        let Ok(origin_path) = self.path_of(origin) else {
            return;
        };
        let full_path = format!("{}/{}", origin_path, patch.path);
        let mut targets = Vec::new();
        let mut current = Some(origin);
        while let Some(id) = current {
            let Ok(n) = self.node_ref(id) else { break };
            if n.container().is_some_and(|c| !c.patch_subscribers.is_empty()) {
                if let Ok(path) = self.path_of(id) {
                    targets.push((id, path.len()));
                }
            }
            current = n.parent;
        }
        for (id, prefix_len) in targets {
            let localized = patch.localized(full_path[prefix_len..].to_string());
            let (forward, inverse) = localized.split();
            let mut subscribers = match self.nodes.get_mut(&id).and_then(Node::container_mut) {
                Some(container) => std::mem::take(&mut container.patch_subscribers),
                None => continue,
            };
            for listener in subscribers.values_mut() {
                listener(&forward, &inverse);
            }
            if let Some(container) = self.nodes.get_mut(&id).and_then(Node::container_mut) {
                let added = std::mem::take(&mut container.patch_subscribers);
                subscribers.extend(added);
                container.patch_subscribers = subscribers;
            }
        }
    }

    /// Invalidates memoized snapshots from the mutated node to its root and
    /// notifies snapshot subscribers along the way (children first).
    pub(crate) fn after_mutation(&mut self, origin: NodeId) {
        let mut chain = Vec::new();
        let mut current = Some(origin);
        while let Some(id) = current {
            let Some(n) = self.nodes.get(&id) else { break };
            if n.container().is_some() {
                chain.push(id);
            }
            current = n.parent;
        }
        for id in &chain {
            if let Some(container) = self.nodes.get(id).and_then(Node::container) {
                container.snapshot.invalidate();
                container.snapshot_atom.report_changed();
            }
        }
        for id in &chain {
            let has_subscribers = self
                .nodes
                .get(id)
                .and_then(Node::container)
                .is_some_and(|c| !c.snapshot_subscribers.is_empty());
            if !has_subscribers {
                continue;
            }
            let Ok(snapshot) = self.snapshot_of(*id) else {
                continue;
            };
            let mut subscribers = match self.nodes.get_mut(id).and_then(Node::container_mut) {
                Some(container) => std::mem::take(&mut container.snapshot_subscribers),
                None => continue,
            };
            if let Some(container) = self.nodes.get(id).and_then(Node::container) {
                for reaction in subscribers.values_mut() {
                    reaction.check(&container.snapshot_atom, &snapshot);
                }
            }
            if let Some(container) = self.nodes.get_mut(id).and_then(Node::container_mut) {
                let added = std::mem::take(&mut container.snapshot_subscribers);
                subscribers.extend(added);
                container.snapshot_subscribers = subscribers;
            }
        }
    }

    // ── Attach, detach, dispose ───────────────────────────────────────────

    /// Attaches a rootless node under a parent, merging identifier caches
    /// and firing after-attach hooks. Moving a node that already has a
    /// different parent is an error.
    pub(crate) fn set_parent(
        &mut self,
        node: NodeId,
        new_parent: NodeId,
        subpath: &str,
    ) -> Result<(), TreeError> {
        let (current_parent, current_subpath) = {
            let n = self.node_ref(node)?;
            (n.parent, n.subpath.clone())
        };
        if current_parent == Some(new_parent) {
            if current_subpath != subpath {
                self.node_mut(node)?.subpath = subpath.to_string();
            }
            return Ok(());
        }
        if current_parent.is_some() {
            return Err(TreeError::DoubleParent {
                path: format!("{}/{}", self.path_of(new_parent)?, subpath),
                existing: self.path_of(node)?,
            });
        }
        if self.root_of(new_parent)? == node {
            return Err(TreeError::SelfContainment);
        }
        let root = self.root_of(new_parent)?;
        let node_env = self
            .nodes
            .get(&node)
            .and_then(|n| n.container())
            .and_then(|c| c.environment.clone());
        if let Some(env) = &node_env {
            let root_env = self
                .nodes
                .get(&root)
                .and_then(|n| n.container())
                .and_then(|c| c.environment.clone());
            let matches = root_env
                .as_ref()
                .is_some_and(|root_env| std::rc::Rc::ptr_eq(env, root_env));
            if !matches {
                return Err(TreeError::EnvironmentMismatch);
            }
        }
        let private_cache = self
            .nodes
            .get_mut(&node)
            .and_then(Node::container_mut)
            .and_then(|c| c.identifier_cache.take());
        if let Some(private_cache) = private_cache {
            if let Some(cache) = self
                .nodes
                .get_mut(&root)
                .and_then(Node::container_mut)
                .and_then(|c| c.identifier_cache.as_mut())
            {
                cache.merge(private_cache)?;
            }
        }
        {
            let n = self.node_mut(node)?;
            n.parent = Some(new_parent);
            n.subpath = subpath.to_string();
            if let Some(container) = n.container_mut() {
                container.environment = None;
            }
        }
        self.fire_hook(node, Hook::AfterAttach)?;
        self.finalize_subtree(node)?;
        Ok(())
    }

    /// Detaches a list or map child from its parent, leaving it a live,
    /// rootless tree that can be attached elsewhere (same environment).
    pub fn detach(&mut self, node: NodeId) -> Result<(), TreeError> {
        self.assert_alive(node)?;
        self.container_ref(node)?;
        let Some(parent) = self.parent_of(node)? else {
            return Ok(());
        };
        let parent_kind_ok = matches!(
            self.node_ref(parent)?.type_ref.kind(),
            TypeKind::List(_) | TypeKind::Map(_)
        );
        if !parent_kind_ok {
            return Err(TreeError::NotRemovable {
                path: self.path_of(node)?,
            });
        }
        self.assert_writable(parent)?;
        self.fire_hook(node, Hook::BeforeDetach)?;
        let environment = self.environment_of(node)?;
        let node_path = self.path_of(node)?;
        let subpath = self.subpath_of(node)?;
        let old_snapshot = self.snapshot_of(node)?;
        let root = self.root_of(node)?;
        self.node_mut(node)?.state = LifeCycle::Detaching;

        // split this subtree's slice out of the root identifier cache
        let split = {
            let mut cache = self
                .nodes
                .get_mut(&root)
                .and_then(Node::container_mut)
                .and_then(|c| c.identifier_cache.take())
                .unwrap_or_default();
            let prefix = format!("{node_path}/");
            let split = cache.split(|candidate| {
                self.path_of(candidate)
                    .map(|p| p == node_path || p.starts_with(&prefix))
                    .unwrap_or(false)
            });
            if let Some(container) = self.nodes.get_mut(&root).and_then(Node::container_mut) {
                container.identifier_cache = Some(cache);
            }
            split
        };

        // remove from the parent's storage
        {
            let container = self.container_mut(parent)?;
            match &mut container.children {
                ChildStore::List(children) => {
                    if let Ok(index) = subpath.parse::<usize>() {
                        if index < children.len() {
                            children.remove(index);
                        }
                    }
                }
                ChildStore::Map(children) => {
                    children.shift_remove(&subpath);
                }
                ChildStore::Object(_) => {}
            }
        }
        // renumber list siblings that shifted
        if let Ok(index) = subpath.parse::<usize>() {
            let tail: Vec<NodeId> = match &self.container_ref(parent)?.children {
                ChildStore::List(children) => children[index..].to_vec(),
                _ => Vec::new(),
            };
            for (offset, sibling) in tail.iter().enumerate() {
                if let Ok(n) = self.node_mut(*sibling) {
                    n.subpath = (index + offset).to_string();
                }
            }
        }
        {
            let n = self.node_mut(node)?;
            n.parent = None;
            n.subpath = String::new();
            n.state = LifeCycle::Finalized;
            if let Some(container) = n.container_mut() {
                container.environment = environment;
                container.identifier_cache = Some(split);
            }
        }
        self.emit_patch(
            parent,
            ReversiblePatch {
                op: PatchOp::Remove,
                path: escape_segment(&subpath),
                value: None,
                old_value: Some(old_snapshot),
            },
        );
        self.after_mutation(parent);
        debug!(%node, "subtree detached");
        Ok(())
    }

    /// Removes a node from its parent (list/map children) and disposes the
    /// whole subtree; a root is disposed directly.
    pub fn destroy(&mut self, node: NodeId) -> Result<(), TreeError> {
        self.assert_alive(node)?;
        match self.parent_of(node)? {
            None => self.dispose_subtree(node),
            Some(parent) => {
                let subpath = self.subpath_of(node)?;
                match self.node_ref(parent)?.type_ref.kind() {
                    TypeKind::List(_) => {
                        let index =
                            subpath
                                .parse::<usize>()
                                .map_err(|_| TreeError::MalformedPatch {
                                    path: subpath.clone(),
                                })?;
                        self.list_remove(parent, index)
                    }
                    TypeKind::Map(_) => {
                        self.map_remove(parent, &subpath)?;
                        Ok(())
                    }
                    _ => Err(TreeError::NotRemovable {
                        path: self.path_of(node)?,
                    }),
                }
            }
        }
    }

    /// Tears a subtree down: "about to die" (before-destroy hooks) fires on
    /// every node, leaves first, before any node finalizes death, so
    /// sibling and parent context stays valid during teardown.
    pub(crate) fn dispose_subtree(&mut self, node: NodeId) -> Result<(), TreeError> {
        match self.nodes.get(&node) {
            Some(n) if n.is_alive() && n.state != LifeCycle::Detaching => {}
            _ => return Ok(()),
        }
        let mut order = Vec::new();
        self.collect_post_order(node, &mut order)?;
        for id in &order {
            self.fire_hook(*id, Hook::BeforeDestroy)?;
        }
        for id in &order {
            self.finalize_death(*id);
        }
        Ok(())
    }

    fn collect_post_order(&self, node: NodeId, out: &mut Vec<NodeId>) -> Result<(), TreeError> {
        let children = self
            .node_ref(node)?
            .container()
            .map(|c| c.children.ids())
            .unwrap_or_default();
        for child in children {
            self.collect_post_order(child, out)?;
        }
        out.push(node);
        Ok(())
    }

    fn finalize_death(&mut self, node: NodeId) {
        self.deregister_identifier(node);
        if let Ok(n) = self.node_mut(node) {
            n.state = LifeCycle::Dead;
            if let Some(container) = n.container_mut() {
                container.middlewares.clear();
                container.snapshot_subscribers.clear();
                container.patch_subscribers.clear();
            }
        }
        debug!(%node, "node died");
    }
}

pub(crate) fn identifier_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
