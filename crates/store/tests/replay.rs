#![forbid(unsafe_code)]

use std::time::Duration;

use serde_json::json;
use walkthrough_core::{AmqCredentials, Notification, NotificationSink};
use walkthrough_store::{spawn_ingest, StateBuilder, StateStore};

fn instance(class: &str, name: &str) -> serde_json::Value {
    json!({
        "metadata": {"name": name, "namespace": "dev-walkthrough-projects"},
        "spec": {"clusterServiceClassExternalName": class}
    })
}

fn upsert(class: &str, name: &str) -> Notification {
    Notification::Upserted { key: class.into(), resource: instance(class, name) }
}

#[test]
fn replay_basic_sequence() {
    let mut sb = StateBuilder::new();
    let seq = vec![
        upsert("fuse", "fuse-1"),
        upsert("fuse", "fuse-1"),
        upsert("che", "che-1"),
        upsert("fuse", "fuse-2"),
        Notification::Removed { key: "che".into(), resource: instance("che", "che-1") },
    ];

    sb.apply(seq[..2].to_vec());
    let snap1 = sb.freeze();
    assert_eq!(snap1.epoch, 2);
    assert_eq!(snap1.len(), 1);

    sb.apply(seq[2..].to_vec());
    let snap2 = sb.freeze();
    assert_eq!(snap2.epoch, 5);
    assert_eq!(snap2.len(), 1);
    assert_eq!(snap2.get("fuse").unwrap()["metadata"]["name"], "fuse-2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingest_publishes_snapshots_and_epochs() {
    let (tx, handle) = spawn_ingest(64);
    let mut epochs = handle.subscribe_epoch();

    tx.notify(upsert("fuse", "fuse-1")).await;
    tx.notify(upsert("launcher", "launcher-1")).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.current().len() < 2 {
            epochs.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert!(*epochs.borrow() >= 1);

    drop(tx);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let snap = handle.current();
    assert_eq!(snap.services.keys().collect::<Vec<_>>(), vec!["fuse", "launcher"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seed_loads_instances_without_a_cluster() {
    let store = StateStore::spawn(16);
    let seeded = store
        .seed(vec![
            instance("fuse", "fuse-1"),
            instance("enmasse-standard", "enmasse-1"),
            json!({"metadata": {"name": "classless"}}),
        ])
        .await;
    assert_eq!(seeded, 2);

    let handle = store.handle();
    let mut epochs = handle.subscribe_epoch();
    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.current().len() < 2 {
            epochs.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert!(store.current().get("enmasse-standard").is_some());
    assert!(store.current().get("classless").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn low_queue_cap_still_applies_every_removal() {
    let store = StateStore::for_services(1, 3);
    store.notify(upsert("fuse", "fuse-1")).await;
    store.notify(upsert("che", "che-1")).await;
    store.notify(Notification::Removed { key: "fuse".into(), resource: instance("fuse", "fuse-1") }).await;
    store.notify(upsert("launcher", "launcher-1")).await;

    let handle = store.handle();
    let mut epochs = handle.subscribe_epoch();
    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.current().services.keys().collect::<Vec<_>>() != vec!["che", "launcher"] {
            epochs.changed().await.unwrap();
        }
    })
    .await
    .expect("fuse removal applied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn credentials_reach_the_snapshot() {
    let store = StateStore::for_services(16, 5);
    store
        .notify(Notification::Credentials(AmqCredentials { username: "admin".into(), password: "s3cret".into() }))
        .await;

    let handle = store.handle();
    let mut epochs = handle.subscribe_epoch();
    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.current().amq_credentials.is_none() {
            epochs.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    let snap = store.current();
    assert!(snap.is_empty());
    assert_eq!(snap.messaging("username"), Some("admin"));
    assert_eq!(snap.messaging("password"), Some("s3cret"));
    let wire = serde_json::to_value(&*snap).unwrap();
    assert_eq!(wire["amq_credentials"]["username"], "admin");
}
