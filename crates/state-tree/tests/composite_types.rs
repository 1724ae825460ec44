use std::rc::Rc;

use serde_json::{json, Value};
use state_tree::types::{self, TypeRef};
use state_tree::{Input, Tree, TreeError};

#[test]
fn frozen_values_are_stored_opaquely() {
    let mut tree = Tree::new();
    let config = types::model("Config")
        .prop("name", types::string())
        .prop("extra", types::frozen())
        .build();
    let root = tree
        .create(
            &config,
            Some(json!({ "name": "app", "extra": { "nested": [1, 2, { "deep": true }] } })),
            None,
        )
        .unwrap();

    assert_eq!(
        tree.get_property(root, "extra").unwrap(),
        json!({ "nested": [1, 2, { "deep": true }] })
    );

    tree.unprotect(root).unwrap();
    tree.set_property(root, "extra", json!([null, "anything"]))
        .unwrap();
    assert_eq!(
        tree.snapshot_of(root).unwrap()["extra"],
        json!([null, "anything"])
    );
}

#[test]
fn literal_properties_only_accept_their_value() {
    let mut tree = Tree::new();
    let versioned = types::model("Versioned")
        .prop("version", types::optional(types::literal(json!(2)), || json!(2)))
        .prop("name", types::string())
        .build();
    let root = tree
        .create(&versioned, Some(json!({ "name": "x" })), None)
        .unwrap();
    assert_eq!(tree.get_property(root, "version").unwrap(), json!(2));

    tree.unprotect(root).unwrap();
    assert!(matches!(
        tree.set_property(root, "version", json!(3)).unwrap_err(),
        TreeError::Validation(_)
    ));
}

#[test]
fn dispatched_unions_pick_the_declared_variant() {
    let circle = types::model("Circle")
        .prop("kind", types::optional(types::literal(json!("circle")), || json!("circle")))
        .prop("radius", types::number())
        .build();
    let square = types::model("Square")
        .prop("kind", types::optional(types::literal(json!("square")), || json!("square")))
        .prop("side", types::number())
        .build();
    let shape = {
        let circle = circle.clone();
        let square = square.clone();
        types::union_dispatched(vec![circle.clone(), square.clone()], move |value| {
            match value.get("kind").and_then(Value::as_str) {
                Some("circle") => Some(circle.clone()),
                Some("square") => Some(square.clone()),
                _ => None,
            }
        })
    };
    let board = types::model("Board")
        .prop("shapes", types::list(shape))
        .build();

    let mut tree = Tree::new();
    let root = tree
        .create(
            &board,
            Some(json!({ "shapes": [
                { "kind": "circle", "radius": 2.0 },
                { "kind": "square", "side": 3.0 },
            ] })),
            None,
        )
        .unwrap();
    let shapes = tree.child_of(root, "shapes").unwrap();
    let first = tree.child_of(shapes, "0").unwrap();
    let second = tree.child_of(shapes, "1").unwrap();
    assert_eq!(tree.type_of(first).unwrap().name(), "Circle");
    assert_eq!(tree.type_of(second).unwrap().name(), "Square");

    let error = tree
        .create(&board, Some(json!({ "shapes": [{ "kind": "blob" }] })), None)
        .unwrap_err();
    assert!(matches!(error, TreeError::Validation(_)));
}

fn folder_type() -> TypeRef {
    types::model("Folder")
        .prop("name", types::string())
        .prop(
            "children",
            types::optional(types::list(types::late("Folder", folder_type)), || json!([])),
        )
        .build()
}

#[test]
fn late_types_allow_recursive_schemas() {
    let mut tree = Tree::new();
    let snapshot = json!({
        "name": "root",
        "children": [
            { "name": "src", "children": [{ "name": "lib" }] },
            { "name": "docs" },
        ]
    });
    let root = tree.create(&folder_type(), Some(snapshot), None).unwrap();

    assert_eq!(
        tree.snapshot_of(root).unwrap(),
        json!({
            "name": "root",
            "children": [
                { "name": "src", "children": [{ "name": "lib", "children": [] }] },
                { "name": "docs", "children": [] },
            ]
        })
    );
    let children = tree.child_of(root, "children").unwrap();
    let src = tree.child_of(children, "0").unwrap();
    assert_eq!(tree.path_of(src).unwrap(), "/children/0");
}

#[test]
fn custom_types_convert_between_wire_and_instance_form() {
    let point = types::custom(
        "Point",
        |value| {
            let text = value.as_str().ok_or("value is not a point string")?;
            let (x, y) = text.split_once(',').ok_or("value is not a point string")?;
            let x: f64 = x.trim().parse().map_err(|_| "invalid x coordinate")?;
            let y: f64 = y.trim().parse().map_err(|_| "invalid y coordinate")?;
            Ok(json!({ "x": x, "y": y }))
        },
        |instance| {
            let x = instance.get("x").and_then(Value::as_f64).unwrap_or(0.0);
            let y = instance.get("y").and_then(Value::as_f64).unwrap_or(0.0);
            json!(format!("{x},{y}"))
        },
        |value| {
            if value.as_str().is_some_and(|s| s.contains(',')) {
                None
            } else {
                Some("value is not a point string".to_string())
            }
        },
    );
    let canvas = types::model("Canvas").prop("origin", point).build();

    let mut tree = Tree::new();
    let root = tree
        .create(&canvas, Some(json!({ "origin": "1.5,2" })), None)
        .unwrap();
    assert_eq!(tree.snapshot_of(root).unwrap(), json!({ "origin": "1.5,2" }));

    let error = tree
        .create(&canvas, Some(json!({ "origin": "not a point" })), None)
        .unwrap_err();
    assert!(matches!(error, TreeError::Validation(_)));
}

#[test]
fn refinements_narrow_their_base_type() {
    let positive = types::refinement(
        "positive",
        types::number(),
        |value| value.as_f64().is_some_and(|n| n > 0.0),
        |_| "value must be positive".to_string(),
    );
    let account = types::model("Account").prop("balance", positive).build();

    let mut tree = Tree::new();
    assert!(tree
        .create(&account, Some(json!({ "balance": 10.0 })), None)
        .is_ok());
    let error = tree
        .create(&account, Some(json!({ "balance": -1.0 })), None)
        .unwrap_err();
    assert!(matches!(error, TreeError::Validation(_)));
}

#[test]
fn reattach_requires_matching_environments() {
    let item = types::model("Item").prop("name", types::string()).build();
    let store = types::model("Store")
        .prop("items", types::list(item.clone()))
        .build();

    let env_a: state_tree::Environment = Rc::new("env-a".to_string());
    let env_b: state_tree::Environment = Rc::new("env-b".to_string());

    let mut tree = Tree::new();
    let root = tree
        .create(&store, Some(json!({ "items": [] })), Some(env_a.clone()))
        .unwrap();
    tree.unprotect(root).unwrap();
    let items = tree.child_of(root, "items").unwrap();

    let stray = tree
        .create(&item, Some(json!({ "name": "x" })), Some(env_b))
        .unwrap();
    let error = tree.list_push(items, Input::Node(stray)).unwrap_err();
    assert!(matches!(error, TreeError::EnvironmentMismatch));

    let matching = tree
        .create(&item, Some(json!({ "name": "y" })), Some(env_a))
        .unwrap();
    tree.list_push(items, Input::Node(matching)).unwrap();
    assert_eq!(tree.list_len(items).unwrap(), 1);
}
