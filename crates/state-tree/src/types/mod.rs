//! The type-combinator system.
//!
//! A [`TreeType`] is an immutable schema descriptor: it validates snapshots,
//! instantiates nodes, and reconciles live nodes against replacement values.
//! Types compose by delegation over a closed [`TypeKind`] sum — a wrapper
//! (optional, union, refinement, late) forwards each operation to the type it
//! resolves to, never by inheriting behavior.
//!
//! Factory functions mirror the combinator set:
//!
//! ```
//! use state_tree::types;
//!
//! let filter = types::enumeration("Filter", &["All", "Active", "Completed"]);
//! let todos = types::list(types::model("Todo")
//!     .prop("id", types::identifier())
//!     .prop("title", types::string())
//!     .build());
//! assert_eq!(todos.describe(), "Todo[]");
//! assert!(filter.is(&"Active".into()));
//! ```

mod object;

pub use object::{ActionFn, Hook, HookFn, ModelBuilder, ObjectDef, SnapshotProcessor, ViewFn};

use std::cell::OnceCell;
use std::ops::BitOr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::ValidationError;

/// Shared handle to a type descriptor.
pub type TypeRef = Rc<TreeType>;

static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(1);

// ── TypeFlags ─────────────────────────────────────────────────────────────

/// Bit set describing what a type is, unioned through wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeFlags(u32);

impl TypeFlags {
    pub const STRING: TypeFlags = TypeFlags(1 << 0);
    pub const NUMBER: TypeFlags = TypeFlags(1 << 1);
    pub const INTEGER: TypeFlags = TypeFlags(1 << 2);
    pub const BOOLEAN: TypeFlags = TypeFlags(1 << 3);
    pub const NULL: TypeFlags = TypeFlags(1 << 4);
    pub const LITERAL: TypeFlags = TypeFlags(1 << 5);
    pub const FROZEN: TypeFlags = TypeFlags(1 << 6);
    pub const IDENTIFIER: TypeFlags = TypeFlags(1 << 7);
    pub const REFERENCE: TypeFlags = TypeFlags(1 << 8);
    pub const CUSTOM: TypeFlags = TypeFlags(1 << 9);
    pub const REFINEMENT: TypeFlags = TypeFlags(1 << 10);
    pub const OPTIONAL: TypeFlags = TypeFlags(1 << 11);
    pub const UNION: TypeFlags = TypeFlags(1 << 12);
    pub const LATE: TypeFlags = TypeFlags(1 << 13);
    pub const OBJECT: TypeFlags = TypeFlags(1 << 14);
    pub const LIST: TypeFlags = TypeFlags(1 << 15);
    pub const MAP: TypeFlags = TypeFlags(1 << 16);

    pub fn contains(self, other: TypeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TypeFlags {
    type Output = TypeFlags;

    fn bitor(self, rhs: TypeFlags) -> TypeFlags {
        TypeFlags(self.0 | rhs.0)
    }
}

// ── Kind definitions ──────────────────────────────────────────────────────

/// Base representation an identifier property accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierBase {
    Str,
    Int,
}

pub struct OptionalDef {
    pub(crate) base: TypeRef,
    pub(crate) default: Rc<dyn Fn() -> Value>,
}

pub struct UnionDef {
    pub(crate) variants: Vec<TypeRef>,
    pub(crate) dispatcher: Option<Rc<dyn Fn(&Value) -> Option<TypeRef>>>,
    /// With `eager`, the first applicable variant wins even when several
    /// apply; without it, more than one applicable variant is an error.
    pub(crate) eager: bool,
}

pub struct RefinementDef {
    pub(crate) base: TypeRef,
    pub(crate) predicate: Rc<dyn Fn(&Value) -> bool>,
    pub(crate) message: Rc<dyn Fn(&Value) -> String>,
}

pub struct LateDef {
    resolver: Rc<dyn Fn() -> TypeRef>,
    cell: OnceCell<TypeRef>,
}

impl LateDef {
    /// Resolves the inner type on first use, enabling recursive schemas.
    pub fn resolved(&self) -> TypeRef {
        self.cell.get_or_init(|| (self.resolver)()).clone()
    }
}

pub struct CustomDef {
    pub(crate) from_snapshot: Rc<dyn Fn(&Value) -> Result<Value, String>>,
    pub(crate) to_snapshot: Rc<dyn Fn(&Value) -> Value>,
    pub(crate) validate: Rc<dyn Fn(&Value) -> Option<String>>,
}

/// The closed sum of every type combinator.
pub enum TypeKind {
    String,
    Number,
    Integer,
    Boolean,
    Null,
    Literal(Value),
    Frozen,
    Identifier(IdentifierBase),
    Reference(TypeRef),
    Custom(CustomDef),
    Refinement(RefinementDef),
    Optional(OptionalDef),
    Union(UnionDef),
    Late(LateDef),
    Object(ObjectDef),
    List(TypeRef),
    Map(TypeRef),
}

// ── TreeType ──────────────────────────────────────────────────────────────

/// An immutable schema descriptor.
pub struct TreeType {
    id: u64,
    name: String,
    flags: TypeFlags,
    kind: TypeKind,
}

impl TreeType {
    pub(crate) fn new(name: String, flags: TypeFlags, kind: TypeKind) -> TypeRef {
        Rc::new(TreeType {
            id: NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            flags,
            kind,
        })
    }

    /// Stable identity of this descriptor; shared handles compare equal.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// Whether instantiating this type attaches a container node (objects,
    /// lists, maps) rather than a leaf.
    pub fn attaches_node(&self) -> bool {
        match &self.kind {
            TypeKind::Object(_) | TypeKind::List(_) | TypeKind::Map(_) => true,
            TypeKind::Optional(def) => def.base.attaches_node(),
            TypeKind::Refinement(def) => def.base.attaches_node(),
            TypeKind::Union(def) => def.variants.iter().any(|v| v.attaches_node()),
            TypeKind::Late(def) => def.resolved().attaches_node(),
            _ => false,
        }
    }

    /// The object definition, when this type is an object type.
    pub fn object_def(&self) -> Option<&ObjectDef> {
        match &self.kind {
            TypeKind::Object(def) => Some(def),
            _ => None,
        }
    }

    /// Human-readable shape description.
    pub fn describe(&self) -> String {
        match &self.kind {
            TypeKind::String
            | TypeKind::Number
            | TypeKind::Integer
            | TypeKind::Boolean
            | TypeKind::Null
            | TypeKind::Identifier(_)
            | TypeKind::Custom(_)
            | TypeKind::Refinement(_)
            | TypeKind::Late(_) => self.name.clone(),
            TypeKind::Literal(value) => value.to_string(),
            TypeKind::Frozen => "<any immutable value>".to_string(),
            TypeKind::Reference(target) => format!("reference({})", target.name()),
            TypeKind::Optional(def) => format!("{}?", def.base.describe()),
            TypeKind::Union(def) => {
                let inner: Vec<String> = def.variants.iter().map(|v| v.describe()).collect();
                format!("({})", inner.join(" | "))
            }
            TypeKind::Object(def) => {
                let props: Vec<String> = def
                    .properties
                    .iter()
                    .map(|(name, t)| format!("{}: {}", name, t.describe()))
                    .collect();
                format!("{{ {} }}", props.join("; "))
            }
            TypeKind::List(element) => format!("{}[]", element.name()),
            TypeKind::Map(value) => format!("Map<string, {}>", value.name()),
        }
    }

    /// Whether a node of type `other` can live where this type is expected.
    pub fn is_assignable_from(&self, other: &TreeType) -> bool {
        if self.id == other.id {
            return true;
        }
        match (&self.kind, &other.kind) {
            (TypeKind::String, TypeKind::String)
            | (TypeKind::Boolean, TypeKind::Boolean)
            | (TypeKind::Null, TypeKind::Null)
            | (TypeKind::Frozen, TypeKind::Frozen)
            | (TypeKind::Number, TypeKind::Number)
            | (TypeKind::Number, TypeKind::Integer)
            | (TypeKind::Integer, TypeKind::Integer) => true,
            (TypeKind::Literal(a), TypeKind::Literal(b)) => a == b,
            (TypeKind::Identifier(a), TypeKind::Identifier(b)) => a == b,
            (TypeKind::Union(def), _) => def.variants.iter().any(|v| v.is_assignable_from(other)),
            (TypeKind::Optional(def), _) => def.base.is_assignable_from(other),
            (TypeKind::Refinement(def), _) => def.base.is_assignable_from(other),
            (TypeKind::Late(def), _) => def.resolved().is_assignable_from(other),
            (TypeKind::Reference(target), _) => target.is_assignable_from(other),
            _ => false,
        }
    }

    /// The snapshot used when a caller creates an instance without one.
    pub fn default_snapshot(&self) -> Value {
        match &self.kind {
            TypeKind::Object(_) | TypeKind::Map(_) => Value::Object(Default::default()),
            TypeKind::List(_) => Value::Array(Vec::new()),
            TypeKind::Optional(def) => (def.default)(),
            TypeKind::Refinement(def) => def.base.default_snapshot(),
            TypeKind::Late(def) => def.resolved().default_snapshot(),
            _ => Value::Null,
        }
    }

    /// Validates a plain snapshot against this type.
    ///
    /// Pure: returns zero or more errors, never raises. Only enforcing
    /// callers aggregate the result into a failure.
    pub fn validate(&self, value: &Value, path: &str) -> Vec<ValidationError> {
        match &self.kind {
            TypeKind::String => self.check(value.is_string(), value, path, "value is not a string"),
            TypeKind::Number => self.check(value.is_number(), value, path, "value is not a number"),
            TypeKind::Integer => self.check(
                value.is_i64() || value.is_u64(),
                value,
                path,
                "value is not an integer",
            ),
            TypeKind::Boolean => {
                self.check(value.is_boolean(), value, path, "value is not a boolean")
            }
            TypeKind::Null => self.check(value.is_null(), value, path, "value is not null"),
            TypeKind::Frozen => Vec::new(),
            TypeKind::Literal(literal) => self.check(
                value == literal,
                value,
                path,
                &format!("value is not the literal {literal}"),
            ),
            TypeKind::Identifier(base) => {
                let ok = match base {
                    IdentifierBase::Str => value.is_string(),
                    IdentifierBase::Int => value.is_i64() || value.is_u64(),
                };
                self.check(ok, value, path, "value is not a valid identifier")
            }
            TypeKind::Reference(_) => self.check(
                value.is_string() || value.is_number(),
                value,
                path,
                "value is not a valid reference identifier",
            ),
            TypeKind::Custom(def) => match (def.validate)(value) {
                None => Vec::new(),
                Some(message) => vec![self.error(value, path, &message)],
            },
            TypeKind::Refinement(def) => {
                let errors = def.base.validate(value, path);
                if !errors.is_empty() {
                    return errors;
                }
                if (def.predicate)(value) {
                    Vec::new()
                } else {
                    vec![self.error(value, path, &(def.message)(value))]
                }
            }
            TypeKind::Optional(def) => {
                if value.is_null() {
                    Vec::new()
                } else {
                    def.base.validate(value, path)
                }
            }
            TypeKind::Union(def) => self.validate_union(def, value, path),
            TypeKind::Late(def) => def.resolved().validate(value, path),
            TypeKind::Object(def) => self.validate_object(def, value, path),
            TypeKind::List(element) => match value.as_array() {
                Some(items) => {
                    let mut errors = Vec::new();
                    for (index, item) in items.iter().enumerate() {
                        errors.extend(element.validate(item, &format!("{path}/{index}")));
                    }
                    errors
                }
                None => vec![self.error(value, path, "value is not an array")],
            },
            TypeKind::Map(value_type) => match value.as_object() {
                Some(entries) => {
                    let mut errors = Vec::new();
                    for (key, item) in entries {
                        errors.extend(value_type.validate(item, &format!("{path}/{key}")));
                    }
                    errors
                }
                None => vec![self.error(value, path, "value is not a map")],
            },
        }
    }

    /// Whether this type accepts the snapshot.
    pub fn is(&self, value: &Value) -> bool {
        self.validate(value, "").is_empty()
    }

    fn validate_union(&self, def: &UnionDef, value: &Value, path: &str) -> Vec<ValidationError> {
        if let Some(dispatcher) = &def.dispatcher {
            return match dispatcher(value) {
                Some(variant) => variant.validate(value, path),
                None => vec![self.error(value, path, "the union dispatcher rejected the value")],
            };
        }
        let mut all_errors = Vec::new();
        let mut applicable = 0;
        for variant in &def.variants {
            let errors = variant.validate(value, path);
            if errors.is_empty() {
                if def.eager {
                    return Vec::new();
                }
                applicable += 1;
            } else {
                all_errors.extend(errors);
            }
        }
        match applicable {
            1 => Vec::new(),
            0 => {
                let mut errors = vec![self.error(
                    value,
                    path,
                    &format!("no type is applicable for the union {}", self.describe()),
                )];
                errors.extend(all_errors);
                errors
            }
            _ => vec![self.error(
                value,
                path,
                &format!(
                    "multiple types are applicable for the union {} and no dispatcher is defined",
                    self.describe()
                ),
            )],
        }
    }

    fn validate_object(&self, def: &ObjectDef, value: &Value, path: &str) -> Vec<ValidationError> {
        let value = match &def.pre_process {
            Some(pre) => pre(value.clone()),
            None => value.clone(),
        };
        let Some(entries) = value.as_object() else {
            return vec![self.error(
                &value,
                path,
                &format!("value is not a valid snapshot for '{}'", self.name),
            )];
        };
        let mut errors = Vec::new();
        for (prop, prop_type) in &def.properties {
            let child = entries.get(prop).cloned().unwrap_or(Value::Null);
            errors.extend(prop_type.validate(&child, &format!("{path}/{prop}")));
        }
        errors
    }

    fn check(
        &self,
        ok: bool,
        value: &Value,
        path: &str,
        message: &str,
    ) -> Vec<ValidationError> {
        if ok {
            Vec::new()
        } else {
            vec![self.error(value, path, message)]
        }
    }

    fn error(&self, value: &Value, path: &str, message: &str) -> ValidationError {
        ValidationError {
            path: path.to_string(),
            value: value.clone(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Debug for TreeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeType")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

// ── Factories ─────────────────────────────────────────────────────────────

pub fn string() -> TypeRef {
    TreeType::new("string".into(), TypeFlags::STRING, TypeKind::String)
}

pub fn number() -> TypeRef {
    TreeType::new("number".into(), TypeFlags::NUMBER, TypeKind::Number)
}

pub fn integer() -> TypeRef {
    TreeType::new("integer".into(), TypeFlags::INTEGER, TypeKind::Integer)
}

pub fn boolean() -> TypeRef {
    TreeType::new("boolean".into(), TypeFlags::BOOLEAN, TypeKind::Boolean)
}

pub fn null() -> TypeRef {
    TreeType::new("null".into(), TypeFlags::NULL, TypeKind::Null)
}

pub fn literal(value: Value) -> TypeRef {
    let name = value.to_string();
    TreeType::new(name, TypeFlags::LITERAL, TypeKind::Literal(value))
}

/// Accepts any JSON value and stores it opaquely, without child nodes.
pub fn frozen() -> TypeRef {
    TreeType::new("frozen".into(), TypeFlags::FROZEN, TypeKind::Frozen)
}

/// A string identifier property; binds the holding property as the object's
/// identity within one tree.
pub fn identifier() -> TypeRef {
    TreeType::new(
        "identifier".into(),
        TypeFlags::IDENTIFIER,
        TypeKind::Identifier(IdentifierBase::Str),
    )
}

/// An integer identifier property.
pub fn identifier_int() -> TypeRef {
    TreeType::new(
        "identifierInt".into(),
        TypeFlags::IDENTIFIER | TypeFlags::INTEGER,
        TypeKind::Identifier(IdentifierBase::Int),
    )
}

/// A reference to a live node of `target` type, stored as its identifier.
pub fn reference(target: TypeRef) -> TypeRef {
    let name = format!("reference({})", target.name());
    TreeType::new(name, TypeFlags::REFERENCE, TypeKind::Reference(target))
}

/// Wraps `base` with a default used when the incoming value is absent.
pub fn optional(base: TypeRef, default: impl Fn() -> Value + 'static) -> TypeRef {
    let name = base.name().to_string();
    let flags = base.flags() | TypeFlags::OPTIONAL;
    TreeType::new(
        name,
        flags,
        TypeKind::Optional(OptionalDef {
            base,
            default: Rc::new(default),
        }),
    )
}

/// `optional(union(null | base))` with a null default.
pub fn maybe(base: TypeRef) -> TypeRef {
    optional(union(vec![null(), base]), || Value::Null)
}

/// A union resolved by testing each variant's `validate`. More than one
/// applicable variant without a dispatcher is an error.
pub fn union(variants: Vec<TypeRef>) -> TypeRef {
    new_union(variants, None, false)
}

/// A union resolved by testing variants in order; the first match wins.
pub fn union_eager(variants: Vec<TypeRef>) -> TypeRef {
    new_union(variants, None, true)
}

/// A union resolved by an explicit dispatcher.
pub fn union_dispatched(
    variants: Vec<TypeRef>,
    dispatcher: impl Fn(&Value) -> Option<TypeRef> + 'static,
) -> TypeRef {
    new_union(variants, Some(Rc::new(dispatcher)), false)
}

fn new_union(
    variants: Vec<TypeRef>,
    dispatcher: Option<Rc<dyn Fn(&Value) -> Option<TypeRef>>>,
    eager: bool,
) -> TypeRef {
    let name = format!(
        "({})",
        variants
            .iter()
            .map(|v| v.name().to_string())
            .collect::<Vec<_>>()
            .join(" | ")
    );
    let flags = variants
        .iter()
        .fold(TypeFlags::UNION, |acc, v| acc | v.flags());
    TreeType::new(
        name,
        flags,
        TypeKind::Union(UnionDef {
            variants,
            dispatcher,
            eager,
        }),
    )
}

/// A union of string literals.
pub fn enumeration(name: &str, values: &[&str]) -> TypeRef {
    let variants: Vec<TypeRef> = values
        .iter()
        .map(|v| literal(Value::String((*v).to_string())))
        .collect();
    let flags = variants
        .iter()
        .fold(TypeFlags::UNION, |acc, v| acc | v.flags());
    TreeType::new(
        name.to_string(),
        flags,
        TypeKind::Union(UnionDef {
            variants,
            dispatcher: None,
            eager: false,
        }),
    )
}

/// Narrows `base` with a predicate over the snapshot.
pub fn refinement(
    name: &str,
    base: TypeRef,
    predicate: impl Fn(&Value) -> bool + 'static,
    message: impl Fn(&Value) -> String + 'static,
) -> TypeRef {
    let flags = base.flags() | TypeFlags::REFINEMENT;
    TreeType::new(
        name.to_string(),
        flags,
        TypeKind::Refinement(RefinementDef {
            base,
            predicate: Rc::new(predicate),
            message: Rc::new(message),
        }),
    )
}

/// Defers resolution of the inner type to first use, enabling recursive
/// schemas.
pub fn late(name: &str, resolver: impl Fn() -> TypeRef + 'static) -> TypeRef {
    TreeType::new(
        name.to_string(),
        TypeFlags::LATE,
        TypeKind::Late(LateDef {
            resolver: Rc::new(resolver),
            cell: OnceCell::new(),
        }),
    )
}

/// A leaf type with caller-supplied conversion and validation.
pub fn custom(
    name: &str,
    from_snapshot: impl Fn(&Value) -> Result<Value, String> + 'static,
    to_snapshot: impl Fn(&Value) -> Value + 'static,
    validate: impl Fn(&Value) -> Option<String> + 'static,
) -> TypeRef {
    TreeType::new(
        name.to_string(),
        TypeFlags::CUSTOM,
        TypeKind::Custom(CustomDef {
            from_snapshot: Rc::new(from_snapshot),
            to_snapshot: Rc::new(to_snapshot),
            validate: Rc::new(validate),
        }),
    )
}

/// Starts an object (model) type definition.
pub fn model(name: &str) -> ModelBuilder {
    ModelBuilder::new(name)
}

/// An ordered list of `element` values.
pub fn list(element: TypeRef) -> TypeRef {
    let name = format!("{}[]", element.name());
    TreeType::new(name, TypeFlags::LIST, TypeKind::List(element))
}

/// A string-keyed map of `value` values.
pub fn map(value: TypeRef) -> TypeRef {
    let name = format!("Map<string, {}>", value.name());
    TreeType::new(name, TypeFlags::MAP, TypeKind::Map(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitive_validation() {
        assert!(string().is(&json!("hi")));
        assert!(!string().is(&json!(1)));
        assert!(integer().is(&json!(3)));
        assert!(!integer().is(&json!(3.5)));
        assert!(number().is(&json!(3.5)));
        assert!(boolean().is(&json!(false)));
        assert!(null().is(&Value::Null));
    }

    #[test]
    fn integer_identifiers_validate_numbers() {
        let t = identifier_int();
        assert!(t.is(&json!(7)));
        assert!(!t.is(&json!("7")));
        assert!(identifier().is(&json!("7")));
    }

    #[test]
    fn literal_and_enumeration() {
        let lit = literal(json!("All"));
        assert!(lit.is(&json!("All")));
        assert!(!lit.is(&json!("Active")));

        let filter = enumeration("Filter", &["All", "Active", "Completed"]);
        assert!(filter.is(&json!("Completed")));
        assert!(!filter.is(&json!("Nope")));
    }

    #[test]
    fn optional_accepts_null() {
        let t = optional(boolean(), || json!(false));
        assert!(t.is(&Value::Null));
        assert!(t.is(&json!(true)));
        assert!(!t.is(&json!("x")));
    }

    #[test]
    fn union_rejects_ambiguity_without_dispatcher() {
        let ambiguous = union(vec![number(), integer()]);
        let errors = ambiguous.validate(&json!(1), "");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("multiple types"));

        let eager = union_eager(vec![number(), integer()]);
        assert!(eager.is(&json!(1)));
    }

    #[test]
    fn object_validation_walks_properties() {
        let todo = model("Todo")
            .prop("title", string())
            .prop("done", optional(boolean(), || json!(false)))
            .build();

        assert!(todo.is(&json!({ "title": "x" })));
        let errors = todo.validate(&json!({ "title": 1 }), "");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/title");
    }

    #[test]
    fn list_and_map_validation() {
        let l = list(string());
        assert!(l.is(&json!(["a", "b"])));
        let errors = l.validate(&json!(["a", 1]), "");
        assert_eq!(errors[0].path, "/1");

        let m = map(integer());
        assert!(m.is(&json!({ "a": 1 })));
        assert!(!m.is(&json!([1])));
    }

    #[test]
    fn late_resolves_on_first_use() {
        let node = late("Named", || model("Named").prop("name", string()).build());
        assert!(node.is(&json!({ "name": "root" })));
        assert!(!node.is(&json!({ "name": 1 })));
        assert!(node.attaches_node());
    }

    #[test]
    fn describe_shapes() {
        let t = model("Todo").prop("title", string()).build();
        assert_eq!(t.describe(), "{ title: string }");
        assert_eq!(list(t.clone()).describe(), "Todo[]");
        assert_eq!(optional(string(), || json!("")).describe(), "string?");
    }

    #[test]
    #[should_panic(expected = "already defined as identifier")]
    fn double_identifier_panics() {
        let _ = model("Bad")
            .prop("a", identifier())
            .prop("b", identifier());
    }
}
