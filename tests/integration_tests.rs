//! End-to-end integration tests
//!
//! Whole-stack flows: create, commit, ordered fetch and targeted
//! deletion; store-level batch mutations; entity routing across two
//! mounted stores.
//! Run with: cargo test --test integration_tests

use std::collections::HashMap;

use datastack::{
    AttributeKind, DataStack, EntitySchema, FetchRequest, MountOptions, OriginOptions, Predicate,
    ReadCapable, SortDescriptor, StackConfig, Value, WriteCapable,
};
use tempfile::TempDir;

fn item_schema() -> EntitySchema {
    EntitySchema::new("Item")
        .attribute("name", AttributeKind::Text)
        .attribute("age", AttributeKind::Integer)
}

async fn item_stack() -> DataStack {
    let stack = DataStack::new(StackConfig::new("integration")).unwrap();
    stack
        .mount(MountOptions::memory("primary"), vec![item_schema()])
        .await
        .unwrap();
    stack
}

#[tokio::test]
async fn test_item_lifecycle_end_to_end() {
    let stack = item_stack().await;
    let origin = stack.origin(OriginOptions::store()).unwrap();
    let context = origin.begin_update();

    context
        .perform_and_wait(|handle| async move {
            for (name, age) in [("a", 1i64), ("b", 9)] {
                let item = handle.create("Item").await?;
                item.set("name", name)?;
                item.set("age", age)?;
            }
            handle.commit().await?;
            Ok(())
        })
        .await
        .unwrap();
    assert!(stack.last_error().is_none());

    let ordered = stack
        .main()
        .fetch_all(FetchRequest::new("Item").sort_by(SortDescriptor::ascending("name")))
        .await
        .unwrap();
    let names: Vec<Value> = ordered.iter().map(|item| item.get("name")).collect();
    assert_eq!(names, vec![Value::from("a"), Value::from("b")]);

    let context = origin.begin_update();
    context
        .perform_and_wait(|handle| async move {
            let removed = handle
                .delete_all("Item", Some(&Predicate::gt("age", 1i64)))
                .await?;
            assert_eq!(removed, 1);
            handle.commit().await?;
            Ok(())
        })
        .await
        .unwrap();
    assert!(stack.last_error().is_none());

    let survivors = stack
        .main()
        .fetch_all(FetchRequest::new("Item"))
        .await
        .unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].get("name"), Value::from("a"));
    assert_eq!(stack.stats().await.total_rows, 1);
}

#[tokio::test]
async fn test_batch_mutations_flow_through_to_readers() {
    let stack = item_stack().await;
    let origin = stack.origin(OriginOptions::store()).unwrap();
    let context = origin.begin_update();

    context
        .perform_and_wait(|handle| async move {
            for (name, age) in [("a", 1i64), ("b", 2), ("c", 3)] {
                let item = handle.create("Item").await?;
                item.set("name", name)?;
                item.set("age", age)?;
            }
            handle.commit().await?;

            let mut changes = HashMap::new();
            changes.insert("age".to_string(), Value::Integer(50));
            let touched = handle
                .batch_update("Item", Some(&Predicate::gt("age", 1i64)), &changes)
                .await?;
            assert_eq!(touched.len(), 2);

            let dropped = handle
                .batch_delete("Item", Some(&Predicate::eq("name", "c")))
                .await?;
            assert_eq!(dropped.len(), 1);
            Ok(())
        })
        .await
        .unwrap();
    assert!(stack.last_error().is_none());

    // The store already holds the bulk result; a reader fetching now sees
    // it without any commit in between.
    let rows = stack
        .main()
        .fetch_properties(FetchRequest::new("Item").sort_by(SortDescriptor::ascending("name")))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["age"], Value::Integer(1));
    assert_eq!(rows[1]["age"], Value::Integer(50));
}

#[tokio::test]
async fn test_entities_route_to_their_own_stores() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("items.store");
    let note_schema = EntitySchema::new("Note").attribute("text", AttributeKind::Text);

    {
        let stack = DataStack::new(StackConfig::new("routing")).unwrap();
        stack
            .mount(MountOptions::durable("disk", &path), vec![item_schema()])
            .await
            .unwrap();
        stack
            .mount(MountOptions::memory("scratch"), vec![note_schema.clone()])
            .await
            .unwrap();
        assert_eq!(stack.stats().await.mounted_stores, 2);

        let origin = stack.origin(OriginOptions::store()).unwrap();
        let context = origin.begin_update();
        context
            .perform_and_wait(|handle| async move {
                let item = handle.create("Item").await?;
                item.set("name", "kept")?;
                let note = handle.create("Note").await?;
                note.set("text", "gone after restart")?;
                handle.commit().await?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(stack.last_error().is_none());
        assert_eq!(stack.stats().await.total_rows, 2);
    }

    // Same mounts again: the durable store still holds its rows, the
    // memory store starts empty.
    let stack = DataStack::new(StackConfig::new("routing")).unwrap();
    stack
        .mount(MountOptions::durable("disk", &path), vec![item_schema()])
        .await
        .unwrap();
    stack
        .mount(MountOptions::memory("scratch"), vec![note_schema])
        .await
        .unwrap();

    let items = stack
        .main()
        .fetch_all(FetchRequest::new("Item"))
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].get("name"), Value::from("kept"));
    assert_eq!(
        stack.main().count(FetchRequest::new("Note")).await.unwrap(),
        0
    );
}
