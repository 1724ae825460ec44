//! A typed, observable, tree-structured state container.
//!
//! Application state is organized as a single tree of typed nodes, each
//! individually addressable, snapshot-able, patchable, and mutable only
//! through recorded actions.
//!
//! - [`types`] — schema combinators: primitives, literals, objects, lists,
//!   maps, unions, optionals, identifiers, references, and more.
//! - [`Tree`] — the node arena and every public operation: create,
//!   snapshot, apply-snapshot, patches, actions, subscriptions.
//! - [`Patch`] / [`PatchRecorder`] — JSON-Pointer patches with inverses.
//! - [`SerializedActionCall`] / [`ActionRecorder`] — replayable actions.
//!
//! ```
//! use serde_json::json;
//! use state_tree::{types, Tree};
//!
//! let todo = types::model("Todo")
//!     .prop("title", types::string())
//!     .prop("done", types::optional(types::boolean(), || json!(false)))
//!     .action("toggle", |tree, node, _args| {
//!         let done = tree.get_property(node, "done")?;
//!         let flipped = !done.as_bool().unwrap_or(false);
//!         tree.set_property(node, "done", json!(flipped))?;
//!         Ok(json!(flipped))
//!     })
//!     .build();
//!
//! let mut tree = Tree::new();
//! let root = tree.create(&todo, Some(json!({ "title": "write docs" })), None).unwrap();
//! assert_eq!(
//!     tree.snapshot_of(root).unwrap(),
//!     json!({ "title": "write docs", "done": false })
//! );
//! tree.invoke(root, "toggle", vec![]).unwrap();
//! assert_eq!(tree.get_property(root, "done").unwrap(), json!(true));
//! ```

mod action;
mod error;
mod identifiers;
mod node;
mod patch;
mod reconcile;
mod tree;

pub mod types;

pub use action::{
    ActionRecorder, MiddlewareChain, MiddlewareEvent, SerializedActionCall, APPLY_PATCHES,
    APPLY_SNAPSHOT,
};
pub use error::{TreeError, ValidationError};
pub use identifiers::IdentifierCache;
pub use node::{Environment, LifeCycle, NodeId};
pub use patch::{Patch, PatchOp, PatchRecorder, ReversiblePatch};
pub use tree::{Input, Tree};
