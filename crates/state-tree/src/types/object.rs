use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::TreeError;
use crate::node::NodeId;
use crate::tree::Tree;
use crate::types::{TreeType, TypeFlags, TypeKind, TypeRef};

/// A registered action body. Receives the tree, the node the action was
/// invoked on, and the (JSON) arguments.
pub type ActionFn = Rc<dyn Fn(&mut Tree, NodeId, &[Value]) -> Result<Value, TreeError>>;

/// A named computed view over a node.
pub type ViewFn = Rc<dyn Fn(&Tree, NodeId) -> Result<Value, TreeError>>;

/// A lifecycle hook body.
pub type HookFn = Rc<dyn Fn(&mut Tree, NodeId) -> Result<(), TreeError>>;

/// Snapshot pre/post processor.
pub type SnapshotProcessor = Rc<dyn Fn(Value) -> Value>;

/// Lifecycle hooks an object type can register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    AfterCreate,
    AfterAttach,
    BeforeDetach,
    BeforeDestroy,
}

/// The definition backing an object (model) type: ordered typed properties,
/// the optional identifier attribute, and the action/view/hook registries.
///
/// Actions and views are dispatched by name lookup at invocation time.
pub struct ObjectDef {
    pub(crate) properties: IndexMap<String, TypeRef>,
    pub(crate) identifier_attribute: Option<String>,
    pub(crate) actions: HashMap<String, ActionFn>,
    pub(crate) views: HashMap<String, ViewFn>,
    pub(crate) hooks: HashMap<Hook, HookFn>,
    pub(crate) pre_process: Option<SnapshotProcessor>,
    pub(crate) post_process: Option<SnapshotProcessor>,
}

impl ObjectDef {
    pub fn property(&self, name: &str) -> Option<&TypeRef> {
        self.properties.get(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(|k| k.as_str())
    }

    pub fn identifier_attribute(&self) -> Option<&str> {
        self.identifier_attribute.as_deref()
    }
}

/// Builder for object (model) types.
///
/// ```
/// use state_tree::types;
///
/// let todo = types::model("Todo")
///     .prop("id", types::identifier())
///     .prop("title", types::string())
///     .prop("done", types::optional(types::boolean(), || false.into()))
///     .build();
/// assert_eq!(todo.name(), "Todo");
/// ```
pub struct ModelBuilder {
    name: String,
    def: ObjectDef,
}

impl ModelBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            def: ObjectDef {
                properties: IndexMap::new(),
                identifier_attribute: None,
                actions: HashMap::new(),
                views: HashMap::new(),
                hooks: HashMap::new(),
                pre_process: None,
                post_process: None,
            },
        }
    }

    /// Declares a typed property.
    ///
    /// Declaring a second identifier property is a schema definition error
    /// and panics.
    pub fn prop(mut self, name: &str, property_type: TypeRef) -> Self {
        if matches!(property_type.kind(), TypeKind::Identifier(_)) {
            if let Some(existing) = &self.def.identifier_attribute {
                panic!(
                    "cannot define property '{name}' as object identifier, \
                     property '{existing}' is already defined as identifier property"
                );
            }
            self.def.identifier_attribute = Some(name.to_string());
        }
        self.def
            .properties
            .insert(name.to_string(), property_type);
        self
    }

    /// Registers a named action.
    pub fn action(
        mut self,
        name: &str,
        body: impl Fn(&mut Tree, NodeId, &[Value]) -> Result<Value, TreeError> + 'static,
    ) -> Self {
        self.def.actions.insert(name.to_string(), Rc::new(body));
        self
    }

    /// Registers a named computed view.
    pub fn view(
        mut self,
        name: &str,
        body: impl Fn(&Tree, NodeId) -> Result<Value, TreeError> + 'static,
    ) -> Self {
        self.def.views.insert(name.to_string(), Rc::new(body));
        self
    }

    /// Registers a lifecycle hook.
    pub fn hook(
        mut self,
        hook: Hook,
        body: impl Fn(&mut Tree, NodeId) -> Result<(), TreeError> + 'static,
    ) -> Self {
        self.def.hooks.insert(hook, Rc::new(body));
        self
    }

    /// Transforms incoming snapshots before validation and instantiation.
    pub fn pre_process_snapshot(mut self, f: impl Fn(Value) -> Value + 'static) -> Self {
        self.def.pre_process = Some(Rc::new(f));
        self
    }

    /// Transforms outgoing snapshots.
    pub fn post_process_snapshot(mut self, f: impl Fn(Value) -> Value + 'static) -> Self {
        self.def.post_process = Some(Rc::new(f));
        self
    }

    pub fn build(self) -> TypeRef {
        TreeType::new(self.name, TypeFlags::OBJECT, TypeKind::Object(self.def))
    }
}
