//! Store mount protocol tests
//!
//! Named configurations, the at-most-one entity mapping rule, durable
//! reopening, and the migration fallbacks.
//! Run with: cargo test --test mount_protocol_tests

use datastack::{
    AttributeKind, DataStack, EntitySchema, FetchRequest, MountOptions, OriginOptions,
    ReadCapable, StackConfig, StackError, StoreError, Value, WriteCapable,
};

fn item_schema() -> EntitySchema {
    EntitySchema::new("Item")
        .attribute("name", AttributeKind::Text)
        .attribute("age", AttributeKind::Integer)
}

fn bare_stack() -> DataStack {
    DataStack::new(StackConfig::new("mounts").without_root_layer()).unwrap()
}

async fn seed_items(stack: &DataStack, rows: &[(&str, i64)]) {
    let origin = stack.origin(OriginOptions::store()).unwrap();
    let context = origin.begin_update();
    let rows: Vec<(String, i64)> = rows.iter().map(|(n, a)| (n.to_string(), *a)).collect();
    context
        .perform_and_wait(move |handle| async move {
            for (name, age) in rows {
                let object = handle.create("Item").await?;
                object.set("name", name)?;
                object.set("age", age)?;
            }
            handle.commit().await.map(|_| ())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_entity_binds_to_at_most_one_store() {
    let stack = bare_stack();
    stack
        .mount(MountOptions::memory("primary"), vec![item_schema()])
        .await
        .unwrap();

    let err = stack
        .mount(MountOptions::memory("secondary"), vec![item_schema()])
        .await
        .unwrap_err();
    assert!(matches!(err, StackError::Configuration(_)));

    // The first mapping is untouched.
    let stats = stack.stats().await;
    assert_eq!(stats.mounted_stores, 1);
    assert_eq!(stats.registered_entities, 1);
}

#[tokio::test]
async fn test_remount_with_identical_options_is_noop() {
    let stack = bare_stack();
    stack
        .mount(MountOptions::memory("primary"), vec![item_schema()])
        .await
        .unwrap();
    stack
        .mount(MountOptions::memory("primary"), vec![item_schema()])
        .await
        .unwrap();

    assert_eq!(stack.stats().await.mounted_stores, 1);
}

#[tokio::test]
async fn test_same_name_with_different_options_is_incompatible() {
    let dir = tempfile::tempdir().unwrap();
    let stack = bare_stack();
    stack
        .mount(MountOptions::memory("primary"), vec![item_schema()])
        .await
        .unwrap();

    let err = stack
        .mount(
            MountOptions::durable("primary", dir.path().join("items.db")),
            vec![item_schema()],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StackError::Store(StoreError::IncompatibleStore(_))
    ));
}

#[tokio::test]
async fn test_durable_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.db");

    {
        let stack = bare_stack();
        stack
            .mount(
                MountOptions::durable("primary", &path),
                vec![item_schema()],
            )
            .await
            .unwrap();
        seed_items(&stack, &[("a", 1), ("b", 9)]).await;
    }

    let reopened = bare_stack();
    reopened
        .mount(
            MountOptions::durable("primary", &path),
            vec![item_schema()],
        )
        .await
        .unwrap();

    let objects = reopened
        .main()
        .fetch_all(FetchRequest::new("Item"))
        .await
        .unwrap();
    assert_eq!(objects.len(), 2);
    let mut names: Vec<String> = objects.iter().map(|o| o.get("name").to_string()).collect();
    names.sort();
    assert_eq!(names, ["a", "b"]);
}

#[tokio::test]
async fn test_schema_change_without_auto_migrate_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.db");

    {
        let stack = bare_stack();
        stack
            .mount(
                MountOptions::durable("primary", &path),
                vec![item_schema()],
            )
            .await
            .unwrap();
    }

    let changed = EntitySchema::new("Item").attribute("name", AttributeKind::Text);
    let err = bare_stack()
        .mount(MountOptions::durable("primary", &path), vec![changed])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StackError::Store(StoreError::SchemaMismatch(_))
    ));
}

#[tokio::test]
async fn test_auto_migrate_adds_optional_and_drops_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.db");

    {
        let stack = bare_stack();
        stack
            .mount(
                MountOptions::durable("primary", &path),
                vec![item_schema()],
            )
            .await
            .unwrap();
        seed_items(&stack, &[("a", 1)]).await;
    }

    let evolved = EntitySchema::new("Item")
        .attribute("name", AttributeKind::Text)
        .attribute("flag", AttributeKind::Boolean);
    let stack = bare_stack();
    stack
        .mount(
            MountOptions::durable("primary", &path).auto_migrate(),
            vec![evolved],
        )
        .await
        .unwrap();

    let objects = stack
        .main()
        .fetch_all(FetchRequest::new("Item"))
        .await
        .unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].get("name"), Value::from("a"));
    // "age" no longer exists, "flag" was never written.
    assert_eq!(objects[0].get("age"), Value::Null);
    assert_eq!(objects[0].get("flag"), Value::Null);
}

#[tokio::test]
async fn test_reset_on_failure_recreates_unmigratable_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.db");

    {
        let stack = bare_stack();
        stack
            .mount(
                MountOptions::durable("primary", &path),
                vec![item_schema()],
            )
            .await
            .unwrap();
        seed_items(&stack, &[("a", 1), ("b", 2)]).await;
    }

    // A new required attribute cannot be filled in by migration.
    let breaking = || {
        EntitySchema::new("Item")
            .attribute("name", AttributeKind::Text)
            .required_attribute("code", AttributeKind::Integer)
    };

    let err = bare_stack()
        .mount(
            MountOptions::durable("primary", &path).auto_migrate(),
            vec![breaking()],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StackError::Store(StoreError::SchemaMismatch(_))
    ));

    // With reset-on-failure the store is destroyed and recreated empty.
    let stack = bare_stack();
    stack
        .mount(
            MountOptions::durable("primary", &path)
                .auto_migrate()
                .reset_on_failure(),
            vec![breaking()],
        )
        .await
        .unwrap();
    let count = stack
        .main()
        .count(FetchRequest::new("Item"))
        .await
        .unwrap();
    assert_eq!(count, 0);
}
