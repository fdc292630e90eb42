//! Projection synchronization tests
//!
//! Live result sets feeding bound lists end to end: initial load,
//! incremental batches, section moves, and the filter reload path.
//! Run with: cargo test --test projection_sync_tests

use std::sync::Arc;
use std::time::Duration;

use datastack::sync::{BridgeDriver, ListBridge, ReconcileKind, SectionedList};
use datastack::{
    AttributeKind, DataStack, EntitySchema, FetchRequest, MountOptions, ObjectId, OriginOptions,
    Predicate, ReadCapable, SortDescriptor, StackConfig, TransactionOrigin, WriteCapable,
};
use tokio::sync::Mutex;

fn item_schema() -> EntitySchema {
    EntitySchema::new("Item")
        .attribute("name", AttributeKind::Text)
        .attribute("group", AttributeKind::Text)
}

fn by_name() -> FetchRequest {
    FetchRequest::new("Item").sort_by(SortDescriptor::ascending("name"))
}

async fn stack_with_origin() -> (DataStack, TransactionOrigin) {
    let stack = DataStack::new(StackConfig::new("projections")).unwrap();
    stack
        .mount(MountOptions::memory("primary"), vec![item_schema()])
        .await
        .unwrap();
    let origin = stack.origin(OriginOptions::main()).unwrap();
    (stack, origin)
}

async fn commit_items(origin: &TransactionOrigin, items: &[(&str, &str)]) {
    let context = origin.begin_update();
    let items: Vec<(String, String)> = items
        .iter()
        .map(|(n, g)| (n.to_string(), g.to_string()))
        .collect();
    context
        .perform_and_wait(move |handle| async move {
            for (name, group) in items {
                let object = handle.create("Item").await?;
                object.set("name", name)?;
                object.set("group", group)?;
            }
            handle.commit().await.map(|_| ())
        })
        .await
        .unwrap();
    context.wait().await.unwrap();
}

async fn id_of(stack: &DataStack, name: &str) -> ObjectId {
    stack
        .main()
        .fetch_one(FetchRequest::new("Item").filter(Predicate::eq("name", name)))
        .await
        .unwrap()
        .id()
}

async fn await_sections(
    bridge: &Arc<Mutex<ListBridge<SectionedList>>>,
    expected: &[Vec<ObjectId>],
) {
    for _ in 0..200 {
        {
            let bridge = bridge.lock().await;
            if bridge.list().sections() == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let bridge = bridge.lock().await;
    panic!(
        "list never reached the expected shape; last state {:?}",
        bridge.list().sections()
    );
}

#[tokio::test]
async fn test_list_follows_commits_incrementally() {
    let (stack, origin) = stack_with_origin().await;
    commit_items(&origin, &[("a", "g1"), ("b", "g2"), ("c", "g2")]).await;

    let results = stack.results(by_name(), Some("group")).await.unwrap();
    assert_eq!(results.snapshot().section_count(), 2);

    let bridge = Arc::new(Mutex::new(ListBridge::new(SectionedList::new())));
    let _driver = BridgeDriver::spawn(&results, bridge.clone());

    let (a, b, c) = (
        id_of(&stack, "a").await,
        id_of(&stack, "b").await,
        id_of(&stack, "c").await,
    );
    await_sections(&bridge, &[vec![a.clone()], vec![b.clone(), c.clone()]]).await;

    // d joins g1; b goes away; c changes section. g2 empties out and
    // its section disappears with it.
    let context = origin.begin_update();
    context
        .perform_and_wait(|handle| async move {
            let d = handle.create("Item").await?;
            d.set("name", "d")?;
            d.set("group", "g1")?;
            let b = handle
                .fetch_one(FetchRequest::new("Item").filter(Predicate::eq("name", "b")))
                .await?;
            handle.delete(&b).await?;
            let c = handle
                .fetch_one(FetchRequest::new("Item").filter(Predicate::eq("name", "c")))
                .await?;
            c.set("group", "g1")?;
            handle.commit().await.map(|_| ())
        })
        .await
        .unwrap();
    context.wait().await.unwrap();

    let d = id_of(&stack, "d").await;
    await_sections(&bridge, &[vec![a, c, d]]).await;

    let bridge = bridge.lock().await;
    assert_eq!(bridge.last_outcome(), Some(ReconcileKind::Incremental));
    // Per-section counts always match the projection afterwards.
    let projection = results.snapshot();
    assert_eq!(bridge.list().sections().len(), projection.section_count());
    for (section, mirrored) in projection.sections.iter().zip(bridge.list().sections()) {
        assert_eq!(section.items.len(), mirrored.len());
    }
}

#[tokio::test]
async fn test_filter_reloads_with_filter_output_counts() {
    let (stack, origin) = stack_with_origin().await;
    commit_items(&origin, &[("a", "g1"), ("b", "g1"), ("c", "g1")]).await;

    let results = stack.results(by_name(), Some("group")).await.unwrap();
    let bridge = Arc::new(Mutex::new(ListBridge::new(SectionedList::new())));
    let _driver = BridgeDriver::spawn(&results, bridge.clone());

    let (a, b, c) = (
        id_of(&stack, "a").await,
        id_of(&stack, "b").await,
        id_of(&stack, "c").await,
    );
    await_sections(&bridge, &[vec![a.clone(), b.clone(), c.clone()]]).await;

    // Hide "a"; every later batch reloads from the filtered snapshot.
    bridge.lock().await.set_filter(|snapshot| {
        let mut shaped = snapshot.clone();
        for section in &mut shaped.sections {
            section
                .items
                .retain(|entry| entry.data.get("name").map(|v| v.to_string()) != Some("a".into()));
        }
        shaped.sections.retain(|section| !section.items.is_empty());
        shaped
    });

    commit_items(&origin, &[("d", "g1")]).await;

    let d = id_of(&stack, "d").await;
    await_sections(&bridge, &[vec![b, c, d]]).await;

    let bridge = bridge.lock().await;
    assert_eq!(bridge.last_outcome(), Some(ReconcileKind::FilteredReload));
    // Projection still holds all four; the list holds the filter output.
    assert_eq!(results.snapshot().item_count(), 4);
    assert_eq!(bridge.list().item_count(), 3);
}

#[tokio::test]
async fn test_manual_refresh_emits_no_spurious_batches() {
    let (stack, origin) = stack_with_origin().await;
    commit_items(&origin, &[("a", "g1")]).await;

    let results = stack.results(by_name(), Some("group")).await.unwrap();
    let mut batches = results.subscribe();

    // Nothing changed, so a forced re-evaluation stays silent.
    results.refresh().await.unwrap();
    assert!(matches!(
        batches.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    commit_items(&origin, &[("b", "g2")]).await;
    let batch = tokio::time::timeout(Duration::from_secs(2), batches.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.snapshot.item_count(), 2);
    assert!(!batch.events.is_empty());
}
