// Multi-device scenarios against a shared in-memory remote
// Run with: cargo test --test sync_scenarios

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::sync::Arc;

use tabsync::storage::filesystem::{FileIdentityStore, FileLocalStore};
use tabsync::storage::memory::{MemoryIdentityStore, MemoryLocalStore, MemoryRemote, StaticAuth};
use tabsync::{
    DeviceFilter, FilterReason, Group, GroupActions, ListenerOutcome, LocalStore, PendingOperations,
    RawChangeEvent, RawEventKind, RealtimeListener, ResolutionStrategy, SmartSyncJudge,
    StaticSystemState, SyncConfig, SyncCoordinator, SyncOrchestrator, SyncQueue, Tab,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
}

struct Device {
    local: Arc<MemoryLocalStore>,
    orchestrator: Arc<SyncOrchestrator>,
    coordinator: Arc<SyncCoordinator>,
    device: Arc<DeviceFilter>,
    actions: GroupActions,
    queue: SyncQueue,
    listener: RealtimeListener,
}

fn device(remote: &Arc<MemoryRemote>, platform: &str) -> Device {
    let config = SyncConfig {
        platform_tag: platform.into(),
        ..SyncConfig::default()
    };
    let local = Arc::new(MemoryLocalStore::new());
    let pending = PendingOperations::from_config(&config);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        local.clone(),
        remote.clone(),
        Arc::new(StaticAuth::new(true)),
        pending.clone(),
        &config,
    ));
    let device = Arc::new(DeviceFilter::new(Arc::new(MemoryIdentityStore::new()), &config));
    let coordinator = Arc::new(SyncCoordinator::new(
        pending,
        orchestrator.clone(),
        local.clone(),
        device.clone(),
    ));
    let (queue, _worker) = SyncQueue::start(orchestrator.clone(), &config);
    let actions = GroupActions::new(coordinator.clone(), local.clone(), device.clone())
        .with_queue(queue.clone());
    let listener = RealtimeListener::new(
        &coordinator,
        device.clone(),
        Arc::new(SmartSyncJudge::new(&config)),
        queue.clone(),
        local.clone(),
        Arc::new(StaticSystemState::default()),
    );

    Device {
        local,
        orchestrator,
        coordinator,
        device,
        actions,
        queue,
        listener,
    }
}

fn change_from(origin: &str, group: &Group) -> RawChangeEvent {
    let mut group = group.clone();
    group.device_id = Some(origin.to_string());
    let row = serde_json::to_value(&group).unwrap();
    RawChangeEvent {
        kind: RawEventKind::Update,
        new: row.as_object().cloned(),
        old: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_edit_on_one_device_reaches_the_other() {
    init_tracing();
    let remote = Arc::new(MemoryRemote::new());
    let laptop = device(&remote, "linux");
    let phone = device(&remote, "android");

    let group = laptop
        .actions
        .create_group("Reading", vec![Tab::new("https://docs.rs", "docs")])
        .await
        .unwrap();
    laptop.queue.wait_idle().await;

    // the realtime notification for the laptop's own write is dropped there
    let laptop_id = laptop.device.current_device_id().await.unwrap();
    let stored = laptop.local.snapshot().await;
    assert_eq!(
        laptop.listener.handle(change_from(&laptop_id, &stored[0])).await,
        ListenerOutcome::Ignored(FilterReason::OwnDevice)
    );

    // and processed on the phone
    let outcome = phone.listener.handle(change_from(&laptop_id, &stored[0])).await;
    assert!(matches!(outcome, ListenerOutcome::Scheduled(_)));
    phone.queue.wait_idle().await;

    let on_phone = phone.local.snapshot().await;
    assert_eq!(on_phone.len(), 1);
    assert_eq!(on_phone[0].id, group.id);
    assert_eq!(on_phone[0].device_id.as_deref(), Some(laptop_id.as_str()));
    assert_eq!(*phone.orchestrator.subscribe_groups().borrow(), on_phone);
}

#[tokio::test]
async fn test_newer_remote_rename_wins_on_pull() {
    init_tracing();
    let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let tab = Tab {
        id: "t1".into(),
        url: "https://a.dev".into(),
        title: "a".into(),
        favicon_url: None,
        created_at: t,
    };
    let local_copy = Group {
        id: "g1".into(),
        name: "Work".into(),
        tabs: vec![tab.clone()],
        is_locked: false,
        version: 2,
        updated_at: Some(t),
        device_id: None,
    };
    let remote_copy = Group {
        name: "Work (renamed)".into(),
        version: 3,
        updated_at: Some(t + chrono::Duration::seconds(40)),
        ..local_copy.clone()
    };

    let remote = Arc::new(MemoryRemote::with_groups(vec![remote_copy.clone()]));
    let laptop = device(&remote, "linux");
    laptop.local.set_groups(vec![local_copy.clone()]).await.unwrap();

    let resolver = tabsync::ConflictResolver::default();
    let record = resolver.check(&local_copy, &remote_copy).unwrap();
    assert_eq!(resolver.resolve(&record).strategy, ResolutionStrategy::RemoteWins);

    let result = laptop.orchestrator.pull_first().await;

    assert!(result.success);
    assert_eq!(laptop.local.snapshot().await, vec![remote_copy.clone()]);
    assert_eq!(laptop.local.snapshot().await[0].version, 3);
}

#[tokio::test(start_paused = true)]
async fn test_dedup_on_one_device_propagates() {
    init_tracing();
    let remote = Arc::new(MemoryRemote::new());
    let laptop = device(&remote, "linux");
    let phone = device(&remote, "android");

    let older = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let newer = older + chrono::Duration::seconds(5);
    let tab = |url: &str, title: &str, created_at| Tab {
        created_at,
        ..Tab::new(url, title)
    };

    laptop
        .actions
        .create_group(
            "Links",
            vec![tab("https://a.dev/", "first", older), tab("https://b.dev", "b", older)],
        )
        .await
        .unwrap();
    laptop
        .actions
        .create_group("More links", vec![tab("https://a.dev", "second", newer)])
        .await
        .unwrap();
    laptop.queue.wait_idle().await;

    let outcome = phone
        .coordinator
        .execute_protected_deduplication()
        .await
        .unwrap();
    assert_eq!(outcome.removed_count, 1);
    assert!(outcome.pushed);

    laptop.orchestrator.pull_first().await;
    let titles: Vec<String> = laptop
        .local
        .snapshot()
        .await
        .iter()
        .flat_map(|g| g.tabs.iter().map(|t| t.title.clone()))
        .collect();
    assert_eq!(titles, vec!["b".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn test_filesystem_backends_survive_restart() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let config = SyncConfig::default();
    let remote = Arc::new(MemoryRemote::new());

    let first_id = {
        let identity = Arc::new(FileIdentityStore::new(dir.path()).await.unwrap());
        let filter = DeviceFilter::new(identity, &config);
        let local = Arc::new(FileLocalStore::new(dir.path()).await.unwrap());
        let orchestrator = SyncOrchestrator::new(
            local.clone(),
            remote.clone(),
            Arc::new(StaticAuth::new(true)),
            PendingOperations::from_config(&config),
            &config,
        );
        remote
            .replace(vec![Group::new("Saved", vec![Tab::new("https://x.dev", "x")])])
            .await;
        assert!(orchestrator.pull_first().await.success);
        filter.current_device_id().await.unwrap()
    };

    let identity = Arc::new(FileIdentityStore::new(dir.path()).await.unwrap());
    let filter = DeviceFilter::new(identity, &config);
    assert_eq!(filter.current_device_id().await.unwrap(), first_id);

    let local = FileLocalStore::new(dir.path()).await.unwrap();
    assert_eq!(local.get_groups().await.unwrap(), remote.snapshot().await);
}

#[tokio::test]
async fn test_unreadable_local_file_never_wipes_remote() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let config = SyncConfig::default();
    let saved = Group::new("Saved", vec![Tab::new("https://x.dev", "x")]);
    let remote = Arc::new(MemoryRemote::with_groups(vec![saved.clone()]));

    let local = Arc::new(FileLocalStore::new(&data_dir).await.unwrap());
    std::fs::remove_dir(&data_dir).unwrap();
    std::fs::write(&data_dir, "not a directory").unwrap();

    let orchestrator = SyncOrchestrator::new(
        local,
        remote.clone(),
        Arc::new(StaticAuth::new(true)),
        PendingOperations::from_config(&config),
        &config,
    );
    let result = orchestrator.push_only().await;

    assert!(!result.success);
    assert!(matches!(result.error, Some(tabsync::SyncError::Storage(_))));
    assert_eq!(remote.snapshot().await, vec![saved]);
    assert_eq!(remote.stats().uploads, 0);
}
