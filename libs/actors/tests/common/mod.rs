//! Shared helpers for runtime integration tests

#![allow(dead_code)]

use actor_config::{init_test_tracing, DeadLetterConfig, RuntimeConfig, SchedulerConfig, ShutdownConfig};
use actor_core::ActorSystem;
use std::thread;
use std::time::{Duration, Instant};

/// Small system with fast shutdown and dead letter capture enabled
pub fn test_system() -> ActorSystem {
    init_test_tracing();
    ActorSystem::new(RuntimeConfig {
        scheduler: SchedulerConfig {
            worker_threads: Some(4),
            quantum: 16,
        },
        dead_letters: DeadLetterConfig {
            log: true,
            capture_limit: 64,
        },
        shutdown: ShutdownConfig { timeout_ms: 1_000 },
        ..RuntimeConfig::default()
    })
    .expect("test configuration is valid")
}

/// Poll `predicate` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

pub const WAIT: Duration = Duration::from_secs(5);
