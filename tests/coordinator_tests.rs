use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use telemux::daemon::coordinator::DaemonCoordinator;
use telemux::daemon::snapshot::SnapshotBus;
use telemux::storage::RecordStore;
use telemux::storage::memory::MemoryStore;
use telemux::util::config::{AppConfig, StoreBackendConfig};
use telemux_core::error::PersistenceError;
use telemux_core::records::{Category, PersistedRecord, SubRecord};

struct UnreachableStore;

#[async_trait]
impl RecordStore for UnreachableStore {
    fn backend_name(&self) -> &'static str {
        "unreachable"
    }

    async fn ping(&self) -> Result<()> {
        Err(anyhow!("connection refused"))
    }

    async fn insert(&self, _record: SubRecord) -> Result<PersistedRecord, PersistenceError> {
        Err(PersistenceError::Unavailable)
    }

    async fn recent(&self, _category: Category, _limit: usize) -> Result<Vec<PersistedRecord>> {
        Ok(Vec::new())
    }
}

fn test_config(workspace: &std::path::Path) -> AppConfig {
    AppConfig {
        workspace_dir: workspace.to_path_buf(),
        store_backend: StoreBackendConfig::Memory,
        http_addr: "127.0.0.1:0".to_string(),
        ..AppConfig::default()
    }
}

#[tokio::test(flavor = "current_thread")]
async fn runs_until_shutdown_and_reports_health() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = DaemonCoordinator::from_app_config(&test_config(dir.path()));
    let store = coordinator.open_store().expect("memory store");
    let bus = Arc::new(SnapshotBus::new());

    coordinator
        .run(
            store,
            Arc::clone(&bus),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .expect("clean shutdown");

    let snapshot = bus.snapshot();
    assert_eq!(snapshot.storage.backend, "memory");
    assert_eq!(snapshot.config.replay_limit, 10);
    assert!(snapshot.health.iter().any(|h| h == "accepting ingress"));
    assert_eq!(snapshot.health.last().map(String::as_str), Some("stopped"));
}

#[tokio::test(flavor = "current_thread")]
async fn unreachable_store_is_fatal_before_binding() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = DaemonCoordinator::from_app_config(&test_config(dir.path()));
    let bus = Arc::new(SnapshotBus::new());

    let err = coordinator
        .run(Arc::new(UnreachableStore), Arc::clone(&bus), std::future::pending())
        .await
        .expect_err("ping failure");
    assert!(format!("{err:#}").contains("connection refused"));
    assert!(bus.snapshot().health.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn bad_listen_address_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig {
        http_addr: "not-an-address".to_string(),
        ..test_config(dir.path())
    };
    let coordinator = DaemonCoordinator::from_app_config(&config);
    let err = coordinator
        .run(
            Arc::new(MemoryStore::new()),
            Arc::new(SnapshotBus::new()),
            std::future::pending(),
        )
        .await
        .expect_err("bind failure");
    assert!(format!("{err:#}").contains("binding HTTP listener"));
}

#[test]
fn sqlite_backend_opens_inside_the_workspace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = AppConfig {
        store_backend: StoreBackendConfig::Sqlite3,
        ..test_config(dir.path())
    };
    let coordinator = DaemonCoordinator::from_app_config(&config);
    let store = coordinator.open_store().expect("sqlite store");
    assert_eq!(store.backend_name(), "sqlite3");
    assert!(telemux::util::paths::sqlite_db(dir.path()).exists());
    assert_eq!(coordinator.thread_registry().active_count(), 1);
    store.close();
    assert_eq!(coordinator.thread_registry().active_count(), 0);
}
