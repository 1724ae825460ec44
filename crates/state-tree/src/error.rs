use serde_json::Value;
use thiserror::Error;

/// A single validation failure, produced as data by `TreeType::validate`.
///
/// Validation never throws; only enforcing callers (create, apply-snapshot,
/// typed writes) aggregate these into a [`TreeError::Validation`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Pointer-style path of the offending value, relative to the validated
    /// root ("" for the root itself).
    pub path: String,
    /// The offending value.
    pub value: Value,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "at path '{}': {}", self.path, self.message)
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("snapshot validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("node is not part of this tree")]
    UnknownNode,

    #[error("you are trying to read or write to an object that is no longer part of a state tree (type '{type_name}')")]
    DeadNode { type_name: String },

    #[error("cannot modify '{path}', the object is protected and can only be modified by using an action")]
    NotWritable { path: String },

    #[error("a node cannot exist twice in a state tree; failed to add it at '{path}', it already lives at '{existing}'")]
    DoubleParent { path: String, existing: String },

    #[error("a state tree is not allowed to contain itself")]
    SelfContainment,

    #[error("a state tree cannot be made part of another state tree as long as their environments are different")]
    EnvironmentMismatch,

    #[error("failed to resolve reference '{identifier}' to type '{type_name}': no matching node is alive in this tree")]
    UnresolvedReference {
        identifier: String,
        type_name: String,
    },

    #[error("cannot resolve a reference to type '{type_name}' with id '{identifier}' unambiguously: multiple candidates ({candidates})")]
    AmbiguousReference {
        identifier: String,
        type_name: String,
        candidates: String,
    },

    #[error("identifier '{identifier}' is already registered in this tree")]
    DuplicateIdentifier { identifier: String },

    #[error("tried to change identifier from '{from}' to '{to}'; changing identifiers is not allowed")]
    IdentifierChanged { from: String, to: String },

    #[error("identifier types can only be instantiated as a direct child of an object type")]
    IdentifierPlacement,

    #[error("can only store references to nodes with a defined identifier property")]
    ReferenceWithoutIdentifier,

    #[error("no type is applicable for the union '{type_name}', or more than one type is applicable without a dispatcher")]
    AmbiguousUnion { type_name: String },

    #[error("a map of objects with identifiers must store each object under its own identifier; tried key '{key}' for identifier '{identifier}'")]
    MapKeyMismatch { key: String, identifier: String },

    #[error("could not resolve '{segment}' while resolving '{path}'")]
    PathResolution { segment: String, path: String },

    #[error("no action '{name}' is registered on this node's type")]
    UnknownAction { name: String },

    #[error("no view '{name}' is registered on this node's type")]
    UnknownView { name: String },

    #[error("'{name}' is not a property of type '{type_name}'")]
    UnknownProperty { name: String, type_name: String },

    #[error("operation expects a {expected} node")]
    WrongKind { expected: &'static str },

    #[error("objects do not support the '{op}' patch operation")]
    UnsupportedPatchOp { op: String },

    #[error("malformed patch path '{path}'")]
    MalformedPatch { path: String },

    #[error("index {index} is out of bounds (length {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("cannot remove '{path}' from its parent; only list and map children can be removed")]
    NotRemovable { path: String },
}
