mod common;

use common::{connection, udf};
use rotor::store::{
    Connection, DiskCache, EntityRecords, EntityStore, FunctionConfig, JsonFileLoader,
    ObjectStore, StoreHealthSource, StoreOptions, StoreStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn options(disk: &DiskCache) -> StoreOptions {
    StoreOptions {
        refresh_interval: Duration::from_secs(3600),
        disk_cache: Some(disk.clone()),
    }
}

async fn wait_for_snapshot(disk: &DiskCache, name: &str) {
    for _ in 0..100 {
        if disk.load::<EntityRecords<Connection>>(name).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no snapshot written for {name}");
}

#[tokio::test]
async fn test_connections_survive_unavailable_source() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("connections.json");
    let disk = DiskCache::new(tmp.path().join("cache"));
    std::fs::write(
        &file,
        serde_json::to_vec(&vec![connection("c1", &["udf.f1"]), connection("c2", &[])]).unwrap(),
    )
    .unwrap();

    let store = EntityStore::new(
        "connections",
        Arc::new(JsonFileLoader::<Connection>::new(&file)),
        options(&disk),
    );
    store.get().await.unwrap();
    assert_eq!(store.status(), StoreStatus::Ok);
    wait_for_snapshot(&disk, "connections").await;
    store.stop();

    std::fs::remove_file(&file).unwrap();
    let restarted: EntityStore<EntityRecords<Connection>> = EntityStore::new(
        "connections",
        Arc::new(JsonFileLoader::<Connection>::new(&file)),
        options(&disk),
    );
    let records = restarted.get().await.unwrap();
    assert_eq!(records.objects.len(), 2);
    assert_eq!(restarted.status(), StoreStatus::Outdated);
    assert!(restarted.get_object("c1").is_some());

    let health = restarted.health();
    assert_eq!(health.name, "connections");
    assert!(health.last_error.unwrap().contains("connections.json"));
}

#[tokio::test]
async fn test_function_changes_move_last_modified() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("functions.json");
    std::fs::write(&file, serde_json::to_vec(&vec![udf("f1", "append:a")]).unwrap()).unwrap();

    let store: EntityStore<EntityRecords<FunctionConfig>> = EntityStore::new(
        "functions",
        Arc::new(JsonFileLoader::<FunctionConfig>::new(&file)),
        StoreOptions {
            refresh_interval: Duration::from_secs(3600),
            disk_cache: None,
        },
    );
    store.get().await.unwrap();
    let first = store.last_modified().unwrap();

    store.refresh_now().await;
    assert_eq!(store.last_modified(), Some(first));

    tokio::time::sleep(Duration::from_millis(5)).await;
    std::fs::write(&file, serde_json::to_vec(&vec![udf("f1", "append:b")]).unwrap()).unwrap();
    store.refresh_now().await;
    assert!(store.last_modified().unwrap() > first);
    assert_eq!(store.get_object("f1").unwrap().code, "append:b");
}
