//! Property-style invariant checks (as opposed to the scripted scenarios
//! in `tests/scenarios.rs`): these assert things that must hold no matter
//! the exact timing of the background loops.

mod common;

use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use instance_engine::action_bus::Action;
use instance_engine::adapters::{SourceRegistry, TransportRegistry};
use instance_engine::instance_manager::InstanceManager;
use instance_engine::memory_budget::{MemoryBudget, AGENT_GLOBAL_WRITER_PERMIT};
use instance_engine::model::{InstanceProfile, InstanceState, Message};
use instance_engine::testing::{
    mock_source, mock_transport, single_use_source_ctor, single_use_transport_ctor,
};

#[test]
fn should_add_again_is_a_pure_function_of_store_state() {
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let earlier = now - chrono::Duration::seconds(10);
    let later = now + chrono::Duration::seconds(10);

    assert!(InstanceManager::should_add_again(None, now));

    let mut deleted = InstanceProfile::new("t", "i", "file", "proxy");
    deleted.state = InstanceState::Delete;
    deleted.modify_time = now;
    assert!(InstanceManager::should_add_again(Some(&deleted), earlier));
    assert!(InstanceManager::should_add_again(Some(&deleted), later));

    let mut finished = InstanceProfile::new("t", "i", "file", "proxy");
    finished.state = InstanceState::Finished;
    finished.modify_time = now;
    assert!(InstanceManager::should_add_again(Some(&finished), later));
    assert!(!InstanceManager::should_add_again(Some(&finished), earlier));
    assert!(!InstanceManager::should_add_again(Some(&finished), now));

    let mut live = InstanceProfile::new("t", "i", "file", "proxy");
    live.state = InstanceState::Default;
    live.modify_time = now;
    assert!(!InstanceManager::should_add_again(Some(&live), later));

    let mut fatal = InstanceProfile::new("t", "i", "file", "proxy");
    fatal.state = InstanceState::Fatal;
    assert!(!InstanceManager::should_add_again(Some(&fatal), later));
}

#[tokio::test(start_paused = true)]
async fn instance_map_never_exceeds_instance_limit() {
    let db = common::open_db();
    let sources = SourceRegistry::builder()
        .register("file", || {
            let (source, _handle) = mock_source(vec![]);
            Box::new(source) as Box<dyn instance_engine::adapters::SourceAdapter>
        })
        .build();
    let transports = TransportRegistry::builder()
        .register("proxy", || {
            let (transport, _handle) = mock_transport();
            Box::new(transport) as Box<dyn instance_engine::adapters::Transport>
        })
        .build();

    let manager = InstanceManager::new(
        common::task_profile("t1"),
        common::fast_config(3),
        &db.handle,
        MemoryBudget::new(),
        sources,
        transports,
    )
    .unwrap();
    manager.run();

    for i in 0..10 {
        manager.submit(Action::Add(InstanceProfile::new(
            "t1",
            format!("i{i}"),
            "file",
            "proxy",
        )));
    }

    // Poll repeatedly across many ticks: the cap must hold at every
    // observation, not just at the end.
    for _ in 0..100 {
        assert!(manager.instance_count() <= 3, "instance cap violated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn checkpointed_offsets_never_move_backwards() {
    let db = common::open_db();
    let messages: Vec<Message> = (0..5)
        .map(|i| Message::new(Bytes::from(format!("line-{i}")), (i * 10).to_string()))
        .collect();
    let (source, handle) = mock_source(messages);
    handle.close();
    let (transport, _transport_handle) = mock_transport();
    let sources = SourceRegistry::builder()
        .register("file", single_use_source_ctor(source))
        .build();
    let transports = TransportRegistry::builder()
        .register("proxy", single_use_transport_ctor(transport))
        .build();

    let mut config = common::fast_config(5);
    config.check_finish_at_least_count = 1;
    let manager = InstanceManager::new(
        common::task_profile("t1"),
        config,
        &db.handle,
        MemoryBudget::new(),
        sources,
        transports,
    )
    .unwrap();
    manager.run();
    manager.submit(Action::Add(InstanceProfile::new("t1", "i1", "file", "proxy")));

    let mut last_seen: i64 = -1;
    for _ in 0..400 {
        if let Some(record) = manager.debug_offset("i1").unwrap() {
            let current: i64 = record.offset.parse().unwrap();
            assert!(
                current >= last_seen,
                "offset regressed: {current} after {last_seen}"
            );
            last_seen = current;
        }
        if manager.instance_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last_seen, 40);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn memory_budget_returns_to_baseline_after_shutdown() {
    let db = common::open_db();
    // left open (never finished) and paired with a closed transport gate,
    // so a message is left genuinely in flight at shutdown time
    let (source, _handle) = mock_source(vec![
        Message::new(Bytes::from_static(b"aaaaa"), "10"),
        Message::new(Bytes::from_static(b"bbbbb"), "20"),
    ]);
    let (transport, transport_handle) = mock_transport();
    transport_handle.close_gate();
    let sources = SourceRegistry::builder()
        .register("file", single_use_source_ctor(source))
        .build();
    let transports = TransportRegistry::builder()
        .register("proxy", single_use_transport_ctor(transport))
        .build();

    let memory = MemoryBudget::new();
    let manager = InstanceManager::new(
        common::task_profile("t1"),
        common::fast_config(5),
        &db.handle,
        memory.clone(),
        sources,
        transports,
    )
    .unwrap();
    manager.run();
    manager.submit(Action::Add(InstanceProfile::new("t1", "i1", "file", "proxy")));

    common::wait_until(
        || async { memory.used(AGENT_GLOBAL_WRITER_PERMIT) > 0 },
        200,
        "at least one message to be held in flight",
    )
    .await;

    manager.shutdown().await;
    assert_eq!(memory.used(AGENT_GLOBAL_WRITER_PERMIT), 0);
}

#[tokio::test(start_paused = true)]
async fn reconciliation_is_idempotent_once_settled() {
    let db = common::open_db();
    let (source, handle) = mock_source(vec![]);
    handle.close();
    let (transport, _transport_handle) = mock_transport();
    let sources = SourceRegistry::builder()
        .register("file", single_use_source_ctor(source))
        .build();
    let transports = TransportRegistry::builder()
        .register("proxy", single_use_transport_ctor(transport))
        .build();

    let mut config = common::fast_config(5);
    config.check_finish_at_least_count = 1;

    let manager = InstanceManager::new(
        common::task_profile("t1"),
        config,
        &db.handle,
        MemoryBudget::new(),
        sources,
        transports,
    )
    .unwrap();
    manager.run();
    manager.submit(Action::Add(InstanceProfile::new("t1", "i1", "file", "proxy")));

    common::wait_until(
        || async {
            manager
                .debug_instance_profile("i1")
                .unwrap()
                .map(|p| p.state == InstanceState::Finished)
                .unwrap_or(false)
        },
        200,
        "instance to settle into FINISHED",
    )
    .await;

    // Several more core-loop ticks (each one calls the same reconciliation
    // pass) must not change anything further.
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.instance_count(), 0);
        let profile = manager.debug_instance_profile("i1").unwrap().unwrap();
        assert_eq!(profile.state, InstanceState::Finished);
    }

    manager.shutdown().await;
}
