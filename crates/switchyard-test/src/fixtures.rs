//! Test fixtures and helpers.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use serde_json::Value;
use switchyard_shell::{AppUrl, ApplicationManager, ShellEventQueue, UrlResolver};
use switchyard_system::{Core, Handle, ReadMessage, Signals, SystemLimits, SystemResult};

static LOGGING: Once = Once::new();

/// Install a test-friendly subscriber once per process. Honours `RUST_LOG`.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A core with default limits and its own deferred runner.
///
/// # Panics
///
/// Panics if the deferred runner thread cannot be spawned.
#[must_use]
pub fn test_core() -> Arc<Core> {
    Arc::new(Core::new(SystemLimits::default()).expect("spawn core runner"))
}

/// Parse a URL known to be valid.
///
/// # Panics
///
/// Panics if `url` does not parse.
#[must_use]
pub fn test_url(url: &str) -> AppUrl {
    AppUrl::parse(url).expect("valid test url")
}

/// A manager resolving `app:` URLs against `file:///apps/`, plus the event
/// queue its application signals are posted to.
///
/// # Panics
///
/// Panics if the core cannot be created.
#[must_use]
pub fn test_manager() -> (Arc<Core>, ApplicationManager, ShellEventQueue) {
    let core = test_core();
    let (events, queue) = ShellEventQueue::new();
    let resolver = UrlResolver::new(test_url("file:///apps/"));
    let manager = ApplicationManager::new(Arc::clone(&core), resolver, events).expect("manager");
    (core, manager, queue)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Wait up to `timeout` for a message on `pipe` and read it.
///
/// # Errors
///
/// Returns the wait error (`DeadlineExceeded`, or `FailedPrecondition` once
/// the peer closed with nothing left to read) or the read error.
pub fn read_message_within(
    core: &Core,
    pipe: Handle,
    timeout: Duration,
) -> SystemResult<ReadMessage> {
    core.wait(pipe, Signals::READABLE, Some(timeout))?;
    core.read_message(pipe)
}

/// Wait for a JSON message on `pipe` and return it untyped, with its handles.
///
/// # Panics
///
/// Panics if nothing arrives within `timeout` or the payload is not JSON.
#[must_use]
pub fn read_json_within(core: &Core, pipe: Handle, timeout: Duration) -> (Value, Vec<Handle>) {
    let message = read_message_within(core, pipe, timeout).expect("message within timeout");
    let value = serde_json::from_slice(&message.bytes).expect("json payload");
    (value, message.handles)
}
