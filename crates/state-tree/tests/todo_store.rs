use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};
use state_tree::types::{self, TypeRef};
use state_tree::{Tree, TreeError};

fn todo_type() -> TypeRef {
    types::model("Todo")
        .prop("id", types::identifier())
        .prop("title", types::string())
        .prop("done", types::optional(types::boolean(), || json!(false)))
        .action("toggle", |tree, node, _args| {
            let done = tree
                .get_property(node, "done")?
                .as_bool()
                .unwrap_or(false);
            tree.set_property(node, "done", json!(!done))?;
            Ok(Value::Null)
        })
        .action("remove", |tree, node, _args| {
            // delegates to the store action so the removal runs in the
            // store's own action context
            let root = tree.root_of(node)?;
            let id = tree.get_property(node, "id")?;
            tree.invoke(root, "remove_todo", vec![id])
        })
        .build()
}

fn store_type() -> TypeRef {
    let filter = types::enumeration("Filter", &["All", "Active", "Completed"]);
    types::model("TodoStore")
        .prop("filter", types::optional(filter, || json!("All")))
        .prop("todos", types::list(todo_type()))
        .view("total_count", |tree, node| {
            let todos = tree.child_of(node, "todos")?;
            Ok(json!(tree.list_len(todos)?))
        })
        .view("filtered_todos", |tree, node| {
            let filter = tree.get_property(node, "filter")?;
            let todos = tree.child_of(node, "todos")?;
            let mut kept = Vec::new();
            for child in tree.children_of(todos)? {
                let snapshot = tree.snapshot_of(child)?;
                let done = snapshot
                    .get("done")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let matches = match filter.as_str() {
                    Some("Active") => !done,
                    Some("Completed") => done,
                    _ => true,
                };
                if matches {
                    kept.push(snapshot);
                }
            }
            Ok(Value::Array(kept))
        })
        .action("add_todo", |tree, node, args| {
            let id = args.first().cloned().unwrap_or(Value::Null);
            let title = args.get(1).cloned().unwrap_or(Value::Null);
            let todos = tree.child_of(node, "todos")?;
            tree.list_insert(todos, 0, json!({ "id": id, "title": title }))?;
            Ok(Value::Null)
        })
        .action("remove_todo", |tree, node, args| {
            let id = args.first().cloned().unwrap_or(Value::Null);
            let todos = tree.child_of(node, "todos")?;
            let children = tree.children_of(todos)?;
            for (index, child) in children.into_iter().enumerate() {
                if tree.get_property(child, "id")? == id {
                    tree.list_remove(todos, index)?;
                    break;
                }
            }
            Ok(Value::Null)
        })
        .action("set_filter", |tree, node, args| {
            let filter = args.first().cloned().unwrap_or(Value::Null);
            tree.set_property(node, "filter", filter)?;
            Ok(Value::Null)
        })
        .build()
}

fn seeded_store(tree: &mut Tree) -> state_tree::NodeId {
    tree.create(
        &store_type(),
        Some(json!({
            "todos": [
                { "id": "1", "title": "buy milk" },
                { "id": "2", "title": "write tests", "done": true },
            ]
        })),
        None,
    )
    .expect("store should instantiate")
}

#[test]
fn create_fills_defaults_and_round_trips() {
    let mut tree = Tree::new();
    let store = seeded_store(&mut tree);
    assert_eq!(
        tree.snapshot_of(store).unwrap(),
        json!({
            "filter": "All",
            "todos": [
                { "id": "1", "title": "buy milk", "done": false },
                { "id": "2", "title": "write tests", "done": true },
            ]
        })
    );
}

#[test]
fn add_todo_inserts_at_the_front() {
    let mut tree = Tree::new();
    let store = seeded_store(&mut tree);
    assert_eq!(tree.view(store, "total_count").unwrap(), json!(2));

    tree.invoke(store, "add_todo", vec![json!("3"), json!("x")])
        .unwrap();

    assert_eq!(tree.view(store, "total_count").unwrap(), json!(3));
    let todos = tree.child_of(store, "todos").unwrap();
    let first = tree.child_of(todos, "0").unwrap();
    assert_eq!(tree.get_property(first, "id").unwrap(), json!("3"));
    assert_eq!(tree.get_property(first, "title").unwrap(), json!("x"));
}

#[test]
fn remove_from_inside_the_todos_own_action() {
    let mut tree = Tree::new();
    let store = seeded_store(&mut tree);
    let todos = tree.child_of(store, "todos").unwrap();
    let doomed = tree.child_of(todos, "0").unwrap();

    tree.invoke(doomed, "remove", vec![]).unwrap();

    assert_eq!(tree.view(store, "total_count").unwrap(), json!(1));
    assert!(!tree.is_alive(doomed));
    let filtered = tree.view(store, "filtered_todos").unwrap();
    let titles: Vec<&str> = filtered
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t.get("title").and_then(Value::as_str))
        .collect();
    assert_eq!(titles, vec!["write tests"]);
}

#[test]
fn set_filter_drives_the_filtered_view() {
    let mut tree = Tree::new();
    let store = seeded_store(&mut tree);

    tree.invoke(store, "set_filter", vec![json!("Completed")])
        .unwrap();

    let filtered = tree.view(store, "filtered_todos").unwrap();
    assert_eq!(filtered.as_array().unwrap().len(), 1);
    assert_eq!(filtered[0]["id"], json!("2"));

    tree.invoke(store, "set_filter", vec![json!("Active")])
        .unwrap();
    let filtered = tree.view(store, "filtered_todos").unwrap();
    assert_eq!(filtered.as_array().unwrap().len(), 1);
    assert_eq!(filtered[0]["id"], json!("1"));
}

#[test]
fn set_filter_rejects_values_outside_the_enumeration() {
    let mut tree = Tree::new();
    let store = seeded_store(&mut tree);
    let error = tree
        .invoke(store, "set_filter", vec![json!("Nope")])
        .unwrap_err();
    assert!(matches!(error, TreeError::Validation(_)));
}

#[test]
fn toggle_flips_done_through_the_action_pipeline() {
    let mut tree = Tree::new();
    let store = seeded_store(&mut tree);
    let todos = tree.child_of(store, "todos").unwrap();
    let todo = tree.child_of(todos, "0").unwrap();

    tree.invoke(todo, "toggle", vec![]).unwrap();
    assert_eq!(tree.get_property(todo, "done").unwrap(), json!(true));
    tree.invoke(todo, "toggle", vec![]).unwrap();
    assert_eq!(tree.get_property(todo, "done").unwrap(), json!(false));
}

#[test]
fn nested_actions_share_one_root_id() {
    let mut tree = Tree::new();
    let store = seeded_store(&mut tree);
    let todos = tree.child_of(store, "todos").unwrap();
    let todo = tree.child_of(todos, "0").unwrap();

    let events: Rc<RefCell<Vec<(String, u64, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    tree.add_middleware(
        store,
        move |event, chain| {
            sink.borrow_mut()
                .push((event.name.clone(), event.id, event.root_id));
            chain.next();
        },
        true,
    )
    .unwrap();

    tree.invoke(todo, "remove", vec![]).unwrap();
    tree.invoke(store, "add_todo", vec![json!("9"), json!("later")])
        .unwrap();

    let events = events.borrow();
    let remove = events
        .iter()
        .find(|(name, _, _)| name == "remove")
        .expect("outer action seen");
    let remove_todo = events
        .iter()
        .find(|(name, _, _)| name == "remove_todo")
        .expect("nested action seen");
    let add = events
        .iter()
        .find(|(name, _, _)| name == "add_todo")
        .expect("second top-level action seen");

    // nested call inherits the outer root id
    assert_eq!(remove.1, remove.2);
    assert_eq!(remove_todo.2, remove.2);
    assert_ne!(remove_todo.1, remove_todo.2);
    // an independent top-level call gets a fresh root id
    assert_ne!(add.2, remove.2);
    assert_eq!(add.1, add.2);
}

#[test]
fn middleware_can_abort_an_action() {
    let mut tree = Tree::new();
    let store = seeded_store(&mut tree);

    tree.add_middleware(
        store,
        |event, chain| {
            if event.name == "add_todo" {
                chain.abort(json!("blocked"));
            } else {
                chain.next();
            }
        },
        true,
    )
    .unwrap();

    let result = tree
        .invoke(store, "add_todo", vec![json!("4"), json!("nope")])
        .unwrap();
    assert_eq!(result, json!("blocked"));
    assert_eq!(tree.view(store, "total_count").unwrap(), json!(2));
}
