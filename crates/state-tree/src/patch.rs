//! JSON-Pointer-addressed patches.
//!
//! Every intercepted mutation produces a [`ReversiblePatch`] carrying both
//! the new and the prior value. The wire-visible [`Patch`] is the stripped
//! forward form; the inverse is synthesized by swapping add/remove and
//! substituting the old value.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TreeError;
use crate::node::NodeId;
use crate::tree::Tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

impl std::fmt::Display for PatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PatchOp::Add => "add",
            PatchOp::Replace => "replace",
            PatchOp::Remove => "remove",
        };
        write!(f, "{name}")
    }
}

/// A single structural change, addressed by an escaped JSON Pointer path
/// relative to the subscribing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Internal patch form that additionally carries the pre-change value, so
/// the inverse patch can be synthesized.
#[derive(Debug, Clone, PartialEq)]
pub struct ReversiblePatch {
    pub op: PatchOp,
    pub path: String,
    pub value: Option<Value>,
    pub old_value: Option<Value>,
}

impl ReversiblePatch {
    /// Strips the prior value, leaving the plain forward patch.
    pub fn strip(&self) -> Patch {
        Patch {
            op: self.op,
            path: self.path.clone(),
            value: self.value.clone(),
        }
    }

    /// The patch that undoes this one: add and remove swap, the old value
    /// substitutes the new one.
    pub fn invert(&self) -> Patch {
        let op = match self.op {
            PatchOp::Add => PatchOp::Remove,
            PatchOp::Remove => PatchOp::Add,
            PatchOp::Replace => PatchOp::Replace,
        };
        Patch {
            op,
            path: self.path.clone(),
            value: self.old_value.clone(),
        }
    }

    pub fn split(&self) -> (Patch, Patch) {
        (self.strip(), self.invert())
    }

    /// The same patch re-addressed with a path prefix trimmed off, for
    /// delivery relative to an ancestor subscriber.
    pub(crate) fn localized(&self, local_path: String) -> ReversiblePatch {
        ReversiblePatch {
            op: self.op,
            path: local_path,
            value: self.value.clone(),
            old_value: self.old_value.clone(),
        }
    }
}

#[derive(Default)]
struct RecorderBuffers {
    patches: Vec<Patch>,
    inverse: Vec<Patch>,
}

/// Buffers the (forward, inverse) patch stream of a node for later replay
/// or undo.
pub struct PatchRecorder {
    node: NodeId,
    buffers: Rc<RefCell<RecorderBuffers>>,
    subscription: Option<u64>,
}

impl PatchRecorder {
    /// Starts recording patches emitted at (or below) `node`.
    pub fn start(tree: &mut Tree, node: NodeId) -> Result<Self, TreeError> {
        let mut recorder = Self {
            node,
            buffers: Rc::new(RefCell::new(RecorderBuffers::default())),
            subscription: None,
        };
        recorder.resume(tree)?;
        Ok(recorder)
    }

    /// Resumes recording after a [`PatchRecorder::stop`].
    pub fn resume(&mut self, tree: &mut Tree) -> Result<(), TreeError> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let buffers = self.buffers.clone();
        let id = tree.on_patch(self.node, move |patch, inverse| {
            let mut buffers = buffers.borrow_mut();
            buffers.patches.push(patch.clone());
            buffers.inverse.push(inverse.clone());
        })?;
        self.subscription = Some(id);
        Ok(())
    }

    pub fn stop(&mut self, tree: &mut Tree) {
        if let Some(id) = self.subscription.take() {
            let _ = tree.off_patch(self.node, id);
        }
    }

    pub fn clear(&mut self) {
        let mut buffers = self.buffers.borrow_mut();
        buffers.patches.clear();
        buffers.inverse.clear();
    }

    pub fn patches(&self) -> Vec<Patch> {
        self.buffers.borrow().patches.clone()
    }

    pub fn inverse_patches(&self) -> Vec<Patch> {
        self.buffers.borrow().inverse.clone()
    }

    /// Re-applies the recorded forward patches against `target`.
    pub fn replay(&self, tree: &mut Tree, target: NodeId) -> Result<(), TreeError> {
        tree.apply_patches(target, &self.patches())
    }

    /// Applies the inverse patches in reverse order, restoring the
    /// pre-recording state.
    pub fn undo(&self, tree: &mut Tree, target: NodeId) -> Result<(), TreeError> {
        let mut inverse = self.inverse_patches();
        inverse.reverse();
        tree.apply_patches(target, &inverse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invert_swaps_add_and_remove() {
        let patch = ReversiblePatch {
            op: PatchOp::Add,
            path: "/todos/0".into(),
            value: Some(json!({ "title": "x" })),
            old_value: None,
        };
        let (forward, inverse) = patch.split();
        assert_eq!(forward.op, PatchOp::Add);
        assert_eq!(inverse.op, PatchOp::Remove);
        assert_eq!(inverse.path, "/todos/0");

        let removal = ReversiblePatch {
            op: PatchOp::Remove,
            path: "/todos/0".into(),
            value: None,
            old_value: Some(json!({ "title": "x" })),
        };
        let inverse = removal.invert();
        assert_eq!(inverse.op, PatchOp::Add);
        assert_eq!(inverse.value, Some(json!({ "title": "x" })));
    }

    #[test]
    fn replace_inverts_to_replace_with_old_value() {
        let patch = ReversiblePatch {
            op: PatchOp::Replace,
            path: "/title".into(),
            value: Some(json!("new")),
            old_value: Some(json!("old")),
        };
        let inverse = patch.invert();
        assert_eq!(inverse.op, PatchOp::Replace);
        assert_eq!(inverse.value, Some(json!("old")));
    }

    #[test]
    fn wire_format_round_trips() {
        let patch = Patch {
            op: PatchOp::Replace,
            path: "/a~1b/0".into(),
            value: Some(json!(1)),
        };
        let text = serde_json::to_string(&patch).expect("patch should serialize");
        assert!(text.contains("\"op\":\"replace\""));
        let back: Patch = serde_json::from_str(&text).expect("patch should deserialize");
        assert_eq!(back, patch);

        let removal = Patch {
            op: PatchOp::Remove,
            path: "/a".into(),
            value: None,
        };
        let text = serde_json::to_string(&removal).expect("patch should serialize");
        assert!(!text.contains("value"));
    }
}
