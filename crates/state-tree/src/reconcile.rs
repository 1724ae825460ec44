//! Identity-aware reconciliation of live nodes against incoming values.
//!
//! The "same" rule: an old node and an incoming value match when the value
//! IS that node, when it equals the node's snapshot, or when both carry the
//! same declared identifier. Matching nodes are reused (mutated in place);
//! everything else is disposed and recreated.

use serde_json::Value;

use crate::error::TreeError;
use crate::node::NodeId;
use crate::tree::{Input, Tree};
use crate::types::{TypeKind, TypeRef};

pub(crate) fn are_same(tree: &Tree, old: NodeId, input: &Input) -> Result<bool, TreeError> {
    match input {
        Input::Node(node) => Ok(*node == old),
        Input::Value(value) => {
            if tree.snapshot_of(old)? == *value {
                return Ok(true);
            }
            // an identified object matches any snapshot carrying its identifier
            if let (Some(attr), Some(entries)) =
                (tree.identifier_attribute_of(old), value.as_object())
            {
                if let (Some(candidate), Some(current)) =
                    (entries.get(&attr), tree.identifier_value_of(old)?)
                {
                    return Ok(*candidate == current);
                }
            }
            Ok(false)
        }
    }
}

/// Decides whether to mutate `current` in place, adopt an incoming live
/// node, or dispose and recreate. Returns the node now living at
/// `current`'s position.
pub(crate) fn reconcile_value(
    tree: &mut Tree,
    expected: &TypeRef,
    current: NodeId,
    input: Input,
) -> Result<NodeId, TreeError> {
    if let Input::Value(value) = &input {
        if tree.snapshot_of(current)? == *value {
            return Ok(current);
        }
    }
    if let Input::Node(node) = &input {
        if *node == current {
            return Ok(current);
        }
    }

    match expected.kind() {
        TypeKind::Optional(def) => {
            let input = if matches!(&input, Input::Value(Value::Null)) {
                Input::Value((def.default)())
            } else {
                input
            };
            reconcile_value(tree, &def.base, current, input)
        }
        TypeKind::Refinement(def) => reconcile_value(tree, &def.base, current, input),
        TypeKind::Late(def) => {
            let resolved = def.resolved();
            reconcile_value(tree, &resolved, current, input)
        }
        TypeKind::Union(_) => {
            let variant = tree.determine_union_variant(expected, &input)?;
            reconcile_value(tree, &variant, current, input)
        }
        TypeKind::Identifier(_) => {
            // the equal case returned above; any change is a hard failure
            let from = tree.snapshot_of(current)?;
            let to = match &input {
                Input::Value(value) => value.clone(),
                Input::Node(_) => Value::Null,
            };
            Err(TreeError::IdentifierChanged {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
        TypeKind::Reference(_) => {
            if tree.reference_matches(current, &input)? {
                return Ok(current);
            }
            replace(tree, expected, current, input)
        }
        TypeKind::Object(_) | TypeKind::List(_) | TypeKind::Map(_) => {
            if tree.type_id_of(current)? == expected.id() {
                if let Input::Value(value) = &input {
                    if identifier_unchanged(tree, current, value)? {
                        tree.apply_snapshot(current, value.clone())?;
                        return Ok(current);
                    }
                }
            }
            replace(tree, expected, current, input)
        }
        // leaves are always replaced, never mutated
        _ => replace(tree, expected, current, input),
    }
}

fn identifier_unchanged(tree: &Tree, current: NodeId, value: &Value) -> Result<bool, TreeError> {
    let Some(attr) = tree.identifier_attribute_of(current) else {
        return Ok(true);
    };
    let Some(current_identifier) = tree.identifier_value_of(current)? else {
        return Ok(true);
    };
    Ok(value
        .as_object()
        .and_then(|entries| entries.get(&attr))
        .is_some_and(|candidate| *candidate == current_identifier))
}

fn replace(
    tree: &mut Tree,
    expected: &TypeRef,
    current: NodeId,
    input: Input,
) -> Result<NodeId, TreeError> {
    let parent = tree.parent_of(current)?;
    let subpath = tree.subpath_of(current)?;
    tree.dispose_subtree(current)?;
    // instantiate dispatches per kind: containers adopt a live node in
    // place, references capture its identifier, leaves take its snapshot
    tree.instantiate(expected, parent, &subpath, input)
}

/// Places `input` as a node under `parent` at `subpath`, reusing `old` when
/// reconcilable.
pub(crate) fn value_as_node(
    tree: &mut Tree,
    expected: &TypeRef,
    parent: NodeId,
    subpath: &str,
    input: Input,
    old: Option<NodeId>,
) -> Result<NodeId, TreeError> {
    if let Input::Node(node) = &input {
        let node = *node;
        tree.assert_alive(node)?;
        // the node already lives under this parent: a cheap move
        if tree.parent_of(node)? == Some(parent) {
            tree.set_parent(node, parent, subpath)?;
            if let Some(old) = old {
                if old != node {
                    tree.dispose_subtree(old)?;
                }
            }
            return Ok(node);
        }
    }
    if let Some(old) = old {
        let node = reconcile_value(tree, expected, old, input)?;
        tree.set_parent(node, parent, subpath)?;
        return Ok(node);
    }
    let node = tree.instantiate(expected, Some(parent), subpath, input)?;
    tree.finalize_subtree(node)?;
    Ok(node)
}

/// The lockstep list walk: disposes old elements with no counterpart,
/// instantiates or adopts new ones, and searches forward among remaining
/// old elements to reuse reordered matches.
///
/// `old_nodes` is the slice of children being replaced; the returned vector
/// has exactly one node per input, positioned from `base_index`.
pub(crate) fn reconcile_list_items(
    tree: &mut Tree,
    element_type: &TypeRef,
    parent: NodeId,
    mut old_nodes: Vec<NodeId>,
    new_inputs: Vec<Input>,
    base_index: usize,
) -> Result<Vec<NodeId>, TreeError> {
    let mut index = 0;
    loop {
        let has_new = index < new_inputs.len();
        let old = old_nodes.get(index).copied();
        match (old, has_new) {
            // both exhausted
            (None, false) => break,
            // the old element has no counterpart: it dies
            (Some(old), false) => {
                tree.dispose_subtree(old)?;
                old_nodes.remove(index);
            }
            // no old element: adopt or instantiate, unless the node is
            // already owned elsewhere under this same parent
            (None, true) => {
                let input = new_inputs[index].clone();
                if let Input::Node(node) = &input {
                    if tree.parent_of(*node)? == Some(parent) {
                        return Err(TreeError::DoubleParent {
                            path: format!(
                                "{}/{}",
                                tree.path_of(parent)?,
                                base_index + index
                            ),
                            existing: tree.path_of(*node)?,
                        });
                    }
                }
                let subpath = (base_index + index).to_string();
                let node = value_as_node(tree, element_type, parent, &subpath, input, None)?;
                old_nodes.insert(index, node);
                index += 1;
            }
            (Some(old), true) => {
                let input = new_inputs[index].clone();
                let subpath = (base_index + index).to_string();
                if are_same(tree, old, &input)? {
                    old_nodes[index] =
                        value_as_node(tree, element_type, parent, &subpath, input, Some(old))?;
                    index += 1;
                } else {
                    // search forward for a reorder match to reuse
                    let mut reuse = None;
                    for probe in (index + 1)..old_nodes.len() {
                        if are_same(tree, old_nodes[probe], &input)? {
                            reuse = Some(old_nodes.remove(probe));
                            break;
                        }
                    }
                    let node =
                        value_as_node(tree, element_type, parent, &subpath, input, reuse)?;
                    old_nodes.insert(index, node);
                    index += 1;
                }
            }
        }
    }
    Ok(old_nodes)
}
