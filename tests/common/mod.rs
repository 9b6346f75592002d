//! Shared scaffolding for the integration tests: a temp `sled` db, a
//! config tuned for fast paused-clock runs, and a small polling helper
//! since the background loops under test are driven by timers.

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use instance_engine::config::EngineConfig;
use instance_engine::instance_manager::TaskProfile;

static TRACING: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary, so a failing
/// scenario's `info!`/`warn!`/`error!` trail prints instead of being
/// silently dropped. Respects `RUST_LOG`, same as the teacher's own
/// test setup.
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct Db {
    pub _dir: tempfile::TempDir,
    pub handle: sled::Db,
}

pub fn open_db() -> Db {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = sled::open(dir.path()).expect("open sled db");
    Db { _dir: dir, handle }
}

/// Short intervals throughout: under `start_paused` these cost no real
/// wall-clock time, they just keep assertions close to the event that
/// triggered them.
pub fn fast_config(instance_limit: usize) -> EngineConfig {
    EngineConfig {
        instance_limit,
        batch_flush_interval_ms: 20,
        save_offset_interval_ms: 20,
        core_thread_sleep_secs: 1,
        check_finish_at_least_count: 3,
        instance_db_clean_interval_ms: 20,
        db_instance_expire_cycle_count: 3,
        agent_global_writer_permit: 10_000,
        action_bus_capacity: 10,
        clean_instance_once_limit: 10,
        field_splitter: String::new(),
        shutdown_grace_ms: 50,
    }
}

pub fn task_profile(task_id: &str) -> TaskProfile {
    TaskProfile {
        task_id: task_id.to_string(),
        is_real_time: false,
        is_retrying: false,
        retry_finish: false,
        cycle_unit: Duration::from_millis(1),
    }
}

/// Polls `cond` every 20ms of (paused, free) virtual time until it's true
/// or `max_ticks` is exceeded, in which case it panics with the supplied
/// message — a stuck condition here means the engine logic is wrong, not
/// that the test needs more patience.
pub async fn wait_until<F, Fut>(mut cond: F, max_ticks: usize, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..max_ticks {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}
