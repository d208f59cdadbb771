use std::sync::Arc;
use std::time::Duration;

use backfill::{
    Backfill, BackfillConfig, BackfillError, ChunkStatus, PacingConfig, PacingMode, Purpose,
    SessionStatus, Timeframe,
};
use backfill_mock::{
    DynamicMockController, ManualClock, MemoryStore, MockBehavior, MockLinkFactory,
    fixtures::daily_bars,
};

mod helpers;
use helpers::{EQUITY, MSFT, clock_at, day, init_tracing, terminal};

fn scripted_terminal() -> (Arc<MockLinkFactory>, DynamicMockController) {
    let (factory, ctl) = terminal();
    ctl.accept(EQUITY, MSFT);
    ctl.set_bar_series(MSFT, daily_bars(day(2023, 1, 1), day(2024, 6, 1)));
    (factory, ctl)
}

fn builder(factory: Arc<MockLinkFactory>, clock: Arc<ManualClock>) -> backfill::BackfillBuilder {
    Backfill::builder()
        .with_link_factory(factory)
        .with_clock(clock)
        .connect_retries(2, Duration::from_millis(10))
        .chunk_delay(Duration::ZERO)
}

#[test]
fn build_requires_a_link_factory() {
    let res = Backfill::builder().build();
    assert!(matches!(res, Err(BackfillError::Validation(_))));
}

#[test]
fn build_opens_the_dedicated_connections() {
    let (factory, ctl) = scripted_terminal();
    let bf = builder(factory, clock_at(day(2024, 6, 1))).build().unwrap();

    let status = bf.allocator().status();
    assert_eq!(status.total(), 2);
    let purposes: Vec<_> = status.connections.iter().map(|c| c.purpose).collect();
    assert!(purposes.contains(&Purpose::SymbolValidation));
    assert!(purposes.contains(&Purpose::DataManager));
    assert_eq!(ctl.open_client_ids().len(), 2);

    assert_eq!(bf.shutdown(), 2);
    assert!(ctl.open_client_ids().is_empty());
}

#[test]
fn services_follow_replaced_connections_and_shutdown_closes_them() {
    let (factory, ctl) = scripted_terminal();
    let bf = builder(factory, clock_at(day(2024, 6, 1))).build().unwrap();
    let first: Vec<_> = bf.allocator().status().connections.iter().map(|c| c.client_id).collect();

    ctl.drop_all_connections();
    bf.allocator().acquire(Purpose::SymbolValidation, None).unwrap();
    let (_, done) = bf
        .download(MSFT, Timeframe::D1, day(2024, 1, 1), day(2024, 2, 1))
        .unwrap();
    assert!(done);

    let mut registered: Vec<_> =
        bf.allocator().status().connections.iter().map(|c| c.client_id).collect();
    let mut open = ctl.open_client_ids();
    registered.sort();
    open.sort();
    assert_eq!(open, registered);
    assert!(registered.iter().all(|id| !first.contains(id)));

    bf.shutdown();
    assert!(ctl.open_client_ids().is_empty());
}

#[test]
fn unreachable_terminal_fails_the_build() {
    let (factory, ctl) = scripted_terminal();
    ctl.refuse_connects(true);
    let res = builder(factory, clock_at(day(2024, 6, 1))).build();
    assert!(matches!(res, Err(BackfillError::Connection(_))));
}

#[test]
fn download_runs_end_to_end_and_persists_state() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (factory, _ctl) = scripted_terminal();
    let store = Arc::new(MemoryStore::new());
    let bf = builder(factory, clock_at(day(2024, 6, 1)))
        .data_dir(dir.path())
        .with_store(store.clone())
        .build()
        .unwrap();

    let (id, done) = bf
        .download("msft", Timeframe::D1, day(2024, 1, 1), day(2024, 3, 1))
        .unwrap();

    assert!(done);
    let summary = bf.sessions().status(&id).unwrap();
    assert_eq!(summary.total_chunks, 2);
    assert_eq!(summary.total_bars, 60);
    assert_eq!(store.get(MSFT, Timeframe::D1).map(|b| b.len()), Some(60));
    assert!(dir.path().join("symbol_cache.json").exists());
    assert!(dir.path().join("download_sessions.json").exists());
    assert_eq!(
        bf.config().validator.cache_path.as_deref(),
        Some(dir.path().join("symbol_cache.json").as_path())
    );
}

#[test]
fn unknown_symbols_are_rejected_before_any_session_exists() {
    let (factory, _ctl) = scripted_terminal();
    let bf = builder(factory, clock_at(day(2024, 6, 1))).build().unwrap();

    let res = bf.download("NOPE", Timeframe::D1, day(2024, 1, 1), day(2024, 2, 1));
    assert!(matches!(res, Err(BackfillError::Validation(_))));
    assert!(bf.sessions().list_sessions().is_empty());
}

#[test]
fn download_from_earliest_uses_the_discovered_range() {
    let (factory, ctl) = scripted_terminal();
    ctl.set_head_behavior(MSFT, MockBehavior::Return(Some(day(2024, 5, 1))));
    let bf = builder(factory, clock_at(day(2024, 6, 1))).build().unwrap();

    let (id, done) = bf.download_from_earliest(MSFT, Timeframe::D1).unwrap();

    assert!(done);
    let session = bf.sessions().session(&id).unwrap();
    assert_eq!(session.full_start, day(2024, 5, 1));
    assert_eq!(session.full_end, day(2024, 6, 1));
    assert_eq!(session.total_bars, 31);
}

#[test]
fn resume_all_picks_up_sessions_from_a_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock_at(day(2024, 6, 1));
    let (factory, ctl) = scripted_terminal();

    let id = {
        let mut cfg = BackfillConfig::default();
        cfg.sessions.default_max_retries = 1;
        let bf = builder(Arc::clone(&factory), Arc::clone(&clock))
            .with_config(cfg)
            .data_dir(dir.path())
            .build()
            .unwrap();
        ctl.push_bars_behavior(MSFT, MockBehavior::Fail(BackfillError::data("HMDS busy")));
        let (id, done) = bf
            .download(MSFT, Timeframe::D1, day(2024, 1, 1), day(2024, 3, 1))
            .unwrap();
        assert!(!done);
        assert_eq!(bf.sessions().status(&id).unwrap().status, SessionStatus::Failed);
        bf.shutdown();
        id
    };

    let bf = builder(factory, clock)
        .data_dir(dir.path())
        .build()
        .unwrap();
    assert_eq!(bf.sessions().resumable_sessions().len(), 1);
    assert_eq!(bf.resume_all(), 1);
    assert_eq!(bf.sessions().status(&id).unwrap().status, SessionStatus::Completed);
}

#[test]
fn pacing_budget_turns_excess_requests_into_chunk_failures() {
    let (factory, ctl) = scripted_terminal();
    let bf = builder(factory, clock_at(day(2024, 6, 1)))
        .pacing(PacingConfig {
            limit: 1,
            window: Duration::from_secs(60),
            mode: PacingMode::Fail,
            jitter_percent: 0,
            cooldown: Duration::from_secs(60),
        })
        .build()
        .unwrap();

    let (id, done) = bf
        .download(MSFT, Timeframe::D1, day(2024, 1, 1), day(2024, 3, 1))
        .unwrap();

    assert!(!done);
    let session = bf.sessions().session(&id).unwrap();
    assert_eq!(session.chunks[0].status, ChunkStatus::Completed);
    assert_eq!(session.chunks[1].status, ChunkStatus::Failed);
    assert!(session.chunks[1].error_message.is_some());
    assert_eq!(ctl.fetch_log().len(), 1);
}
