//! The action/middleware invocation pipeline.
//!
//! Every externally invoked mutating operation is wrapped in an identified
//! [`MiddlewareEvent`] and threaded through the middleware chain collected
//! from the acting node up to its root. Each middleware must call exactly
//! one of [`MiddlewareChain::next`] or [`MiddlewareChain::abort`]; the chain
//! terminates in the registered action body, which runs with write
//! protection satisfied.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::TreeError;
use crate::node::NodeId;
use crate::tree::Tree;

/// Reserved action name for serialized patch application.
pub const APPLY_PATCHES: &str = "@APPLY_PATCHES";

/// Reserved action name for serialized snapshot application.
pub const APPLY_SNAPSHOT: &str = "@APPLY_SNAPSHOT";

/// One action invocation, shared by the whole middleware chain.
///
/// Nested invocations inherit `root_id` (and take their caller's `id` as
/// `parent_id`), so every event of one logical top-level call correlates.
#[derive(Debug, Clone, PartialEq)]
pub struct MiddlewareEvent {
    pub id: u64,
    pub parent_id: u64,
    pub root_id: u64,
    pub name: String,
    pub arguments: Vec<Value>,
    /// The node the action was invoked on.
    pub context: NodeId,
    /// The root of that node's tree at invocation time.
    pub tree_root: NodeId,
}

impl MiddlewareEvent {
    pub fn is_top_level(&self) -> bool {
        self.id == self.root_id
    }
}

pub(crate) type MiddlewareHandler = Rc<dyn Fn(&MiddlewareEvent, &mut MiddlewareChain<'_>)>;

#[derive(Clone)]
pub(crate) struct Middleware {
    pub id: u64,
    pub handler: MiddlewareHandler,
    /// With this unset, the middleware skips the reserved `@`-prefixed
    /// events synthesized for patch/snapshot application.
    pub include_hooks: bool,
}

/// Handle given to a middleware for continuing or aborting the invocation.
pub struct MiddlewareChain<'a> {
    tree: &'a mut Tree,
    event: &'a MiddlewareEvent,
    rest: &'a [Middleware],
    terminal: &'a mut dyn FnMut(&mut Tree) -> Result<Value, TreeError>,
    result: Option<Result<Value, TreeError>>,
    next_called: bool,
    abort_called: bool,
}

impl<'a> MiddlewareChain<'a> {
    pub fn event(&self) -> &MiddlewareEvent {
        self.event
    }

    /// The tree the action runs against, for middlewares that need to read
    /// paths or state while handling the event.
    pub fn tree(&mut self) -> &mut Tree {
        &mut *self.tree
    }

    /// Runs the rest of the chain (and finally the action itself).
    pub fn next(&mut self) {
        if self.next_called {
            warn!(action = %self.event.name, "middleware invoked next() more than once");
            return;
        }
        self.next_called = true;
        let result = run_chain(&mut *self.tree, self.event, self.rest, &mut *self.terminal);
        self.result = Some(result);
    }

    /// Runs the rest of the chain, then transforms the eventual result.
    pub fn next_map(&mut self, transform: impl FnOnce(Value) -> Value) {
        if self.next_called {
            warn!(action = %self.event.name, "middleware invoked next() more than once");
            return;
        }
        self.next_called = true;
        let result = run_chain(&mut *self.tree, self.event, self.rest, &mut *self.terminal);
        self.result = Some(result.map(transform));
    }

    /// Substitutes a result and skips the rest of the chain.
    pub fn abort(&mut self, value: Value) {
        self.abort_called = true;
        self.result = Some(Ok(value));
    }
}

/// Walks the middleware chain recursively; the empty chain runs the action.
pub(crate) fn run_chain(
    tree: &mut Tree,
    event: &MiddlewareEvent,
    middlewares: &[Middleware],
    terminal: &mut dyn FnMut(&mut Tree) -> Result<Value, TreeError>,
) -> Result<Value, TreeError> {
    let Some((first, rest)) = middlewares.split_first() else {
        return terminal(tree);
    };
    let handler = first.handler.clone();
    let mut chain = MiddlewareChain {
        tree,
        event,
        rest,
        terminal,
        result: None,
        next_called: false,
        abort_called: false,
    };
    handler(event, &mut chain);
    if chain.next_called && chain.abort_called {
        warn!(
            action = %event.name,
            "middleware invoked both next() and abort(); the abort result wins"
        );
    }
    if !chain.next_called && !chain.abort_called {
        warn!(
            action = %event.name,
            "middleware invoked neither next() nor abort(); continuing the chain"
        );
        chain.next();
    }
    chain.result.take().unwrap_or(Ok(Value::Null))
}

/// A recorded top-level action call: the action name, the pointer of the
/// acting node relative to the listening node, and the serialized
/// arguments. Replayable against the same or a different tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedActionCall {
    pub name: String,
    pub path: String,
    pub arguments: Vec<Value>,
}

/// Buffers the top-level action stream of a node for later replay.
pub struct ActionRecorder {
    node: NodeId,
    calls: Rc<RefCell<Vec<SerializedActionCall>>>,
    subscription: Option<u64>,
}

impl ActionRecorder {
    pub fn start(tree: &mut Tree, node: NodeId) -> Result<Self, TreeError> {
        let mut recorder = Self {
            node,
            calls: Rc::new(RefCell::new(Vec::new())),
            subscription: None,
        };
        recorder.resume(tree)?;
        Ok(recorder)
    }

    pub fn resume(&mut self, tree: &mut Tree) -> Result<(), TreeError> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let calls = self.calls.clone();
        let id = tree.on_action(self.node, move |call| {
            calls.borrow_mut().push(call);
        })?;
        self.subscription = Some(id);
        Ok(())
    }

    pub fn stop(&mut self, tree: &mut Tree) {
        if let Some(id) = self.subscription.take() {
            let _ = tree.off_action(self.node, id);
        }
    }

    pub fn clear(&mut self) {
        self.calls.borrow_mut().clear();
    }

    pub fn calls(&self) -> Vec<SerializedActionCall> {
        self.calls.borrow().clone()
    }

    /// Re-applies the recorded calls against `target`.
    pub fn replay(&self, tree: &mut Tree, target: NodeId) -> Result<(), TreeError> {
        for call in self.calls() {
            tree.apply_action(target, &call)?;
        }
        Ok(())
    }
}
