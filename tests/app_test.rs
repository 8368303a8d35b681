use rotor::dispatch::DispatchRequest;
use rotor::store::StoreStatus;
use rotor::{Rotor, RotorConfig};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

fn write_repository(dir: &TempDir) -> RotorConfig {
    let connections = dir.path().join("connections.json");
    let functions = dir.path().join("functions.json");
    std::fs::write(
        &connections,
        json!([{
            "id": "c1",
            "workspaceId": "ws",
            "type": "devnull",
            "streamId": "s1",
            "options": {"functions": [{"functionId": "builtin.transformation.ip-anonymization"}]},
            "updatedAt": "2024-01-01T00:00:00Z"
        }])
        .to_string(),
    )
    .unwrap();
    std::fs::write(&functions, "[]").unwrap();

    let mut config = RotorConfig::default().with_cache_dir(dir.path().join("cache"));
    config.repository.connections = connections.display().to_string();
    config.repository.functions = functions.display().to_string();
    config.metrics_flush_interval = Duration::from_millis(50);
    config
}

#[tokio::test]
async fn test_start_dispatch_stop() {
    let dir = TempDir::new().unwrap();
    let rotor = Rotor::start(write_repository(&dir)).await.unwrap();

    let health = rotor.health();
    assert_eq!(health.len(), 2);
    assert!(health.iter().all(|h| h.status == StoreStatus::Ok));

    let result = rotor
        .dispatcher
        .dispatch(DispatchRequest::for_event(
            "c1",
            json!({"type": "page", "context": {"ip": "192.168.7.42"}}),
        ))
        .await
        .unwrap();
    assert_eq!(result.events[0]["context"]["ip"], json!("192.168.7.0"));

    rotor.stop().await;
}

#[tokio::test]
async fn test_start_fails_without_repository() {
    let dir = TempDir::new().unwrap();
    let mut config = RotorConfig::default();
    config.repository.connections = dir.path().join("absent.json").display().to_string();
    config.repository.functions = dir.path().join("absent.json").display().to_string();

    assert!(Rotor::start(config).await.is_err());
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let config = RotorConfig::default().with_fetch_timeout(Duration::ZERO);
    assert!(Rotor::start(config).await.is_err());
}
