//! End-to-end tests of the child bootstrap: a real `switchyard-child` process
//! launched through a `ChildProcessHost`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use switchyard_channel::{ChannelManager, IoThread};
use switchyard_shell::runner::{NativeRunner, OutOfProcessRunner};
use switchyard_shell::{
    AppCompletion, ChildProcessHost, ChildProcessOptions, ChildState, CleanupPolicy,
    CompletionReason, FATAL_EXIT_CODE, NO_PROCESS_EXIT_CODE,
};
use switchyard_system::{Core, ResultCode, Signals, SystemLimits};
use switchyard_test::{init_test_logging, test_core};

const TIMEOUT: Duration = Duration::from_secs(20);

struct Fixture {
    core: Arc<Core>,
    channels: ChannelManager,
    io: Option<IoThread>,
}

impl Fixture {
    fn new() -> Self {
        init_test_logging();
        let core = test_core();
        let io = IoThread::spawn("test-io").unwrap();
        let channels = ChannelManager::new(Arc::clone(&core), io.handle());
        Self {
            core,
            channels,
            io: Some(io),
        }
    }

    fn options(&self, child_path: PathBuf) -> ChildProcessOptions {
        ChildProcessOptions {
            core: Arc::clone(&self.core),
            channels: self.channels.clone(),
            child_path,
            log_level: Some("warn".to_owned()),
            limits: SystemLimits::default(),
        }
    }

    fn child_options(&self) -> ChildProcessOptions {
        self.options(PathBuf::from(env!("CARGO_BIN_EXE_switchyard-child")))
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.channels.shutdown(Duration::from_secs(1));
        if let Some(io) = self.io.take() {
            io.shutdown();
        }
    }
}

fn completion() -> (AppCompletion, mpsc::Receiver<i32>) {
    let (tx, rx) = mpsc::channel();
    let completion = AppCompletion::new(move |result| {
        let _ = tx.send(result);
    });
    (completion, rx)
}

#[test]
fn test_exit_now_terminates_child_with_code() {
    let fixture = Fixture::new();
    let mut host = ChildProcessHost::new(fixture.child_options());
    host.start().unwrap();

    // Queued ahead of StartApp, so the child exits before loading anything.
    host.exit_now(42);
    let (_shell_end, request) = fixture.core.create_message_pipe().unwrap();
    let (completion, results) = completion();
    host.start_app(
        Path::new("/nonexistent/app.app"),
        CleanupPolicy::KeepAppPath,
        request,
        completion,
    );

    assert_eq!(host.join(), 42);
    assert_eq!(results.recv_timeout(TIMEOUT).unwrap(), ResultCode::Unknown.as_i32());
    assert!(results.try_recv().is_err());
    assert_eq!(host.state(), ChildState::Completed(CompletionReason::ConnectionLost));
}

#[test]
fn test_missing_app_reports_not_found() {
    let fixture = Fixture::new();
    let mut host = ChildProcessHost::new(fixture.child_options());
    host.start().unwrap();

    let (shell_end, request) = fixture.core.create_message_pipe().unwrap();
    let (completion, results) = completion();
    host.start_app(
        Path::new("/nonexistent/missing.app"),
        CleanupPolicy::KeepAppPath,
        request,
        completion,
    );

    assert_eq!(results.recv_timeout(TIMEOUT).unwrap(), ResultCode::NotFound.as_i32());
    assert_eq!(
        host.state(),
        ChildState::Completed(CompletionReason::AppCompleted(ResultCode::NotFound.as_i32()))
    );
    assert_eq!(host.join(), 0);

    // The child closed the application pipe it was handed.
    fixture
        .core
        .wait(shell_end, Signals::PEER_CLOSED, Some(TIMEOUT))
        .unwrap();
}

#[test]
fn test_launch_failure_reports_unavailable() {
    let fixture = Fixture::new();
    let dir = tempfile::tempdir().unwrap();
    let mut host = ChildProcessHost::new(fixture.options(dir.path().join("no-such-child")));
    host.start().unwrap();

    let (_shell_end, request) = fixture.core.create_message_pipe().unwrap();
    let (completion, results) = completion();
    host.start_app(
        Path::new("/nonexistent/app.app"),
        CleanupPolicy::KeepAppPath,
        request,
        completion,
    );

    assert_eq!(results.recv_timeout(TIMEOUT).unwrap(), ResultCode::Unavailable.as_i32());
    assert_eq!(host.join(), NO_PROCESS_EXIT_CODE);
    assert_eq!(host.state(), ChildState::Completed(CompletionReason::LaunchFailure));
}

#[test]
fn test_second_start_app_is_rejected() {
    let fixture = Fixture::new();
    let mut host = ChildProcessHost::new(fixture.child_options());
    host.start().unwrap();

    let (_first_end, first) = fixture.core.create_message_pipe().unwrap();
    let (first_completion, first_results) = completion();
    host.start_app(
        Path::new("/nonexistent/a.app"),
        CleanupPolicy::KeepAppPath,
        first,
        first_completion,
    );

    let (second_end, second) = fixture.core.create_message_pipe().unwrap();
    let (second_completion, second_results) = completion();
    host.start_app(
        Path::new("/nonexistent/b.app"),
        CleanupPolicy::KeepAppPath,
        second,
        second_completion,
    );

    assert_eq!(
        second_results.recv_timeout(TIMEOUT).unwrap(),
        ResultCode::FailedPrecondition.as_i32()
    );
    fixture
        .core
        .wait(second_end, Signals::PEER_CLOSED, Some(TIMEOUT))
        .unwrap();
    assert_eq!(first_results.recv_timeout(TIMEOUT).unwrap(), ResultCode::NotFound.as_i32());
    assert_eq!(host.join(), 0);
}

#[test]
fn test_out_of_process_runner_completes() {
    let fixture = Fixture::new();
    let mut runner = OutOfProcessRunner::new(fixture.child_options());

    let (_shell_end, request) = fixture.core.create_message_pipe().unwrap();
    let (completion, results) = completion();
    runner.start(
        Path::new("/nonexistent/runner.app"),
        CleanupPolicy::KeepAppPath,
        request,
        completion,
    );

    assert_eq!(results.recv_timeout(TIMEOUT).unwrap(), ResultCode::NotFound.as_i32());
    drop(runner);
}

#[test]
fn test_drop_during_launch_completes_once() {
    let fixture = Fixture::new();
    let mut host = ChildProcessHost::new(fixture.child_options());
    host.start().unwrap();

    let (_shell_end, request) = fixture.core.create_message_pipe().unwrap();
    let (completion, results) = completion();
    host.start_app(
        Path::new("/nonexistent/in-flight.app"),
        CleanupPolicy::KeepAppPath,
        request,
        completion,
    );
    drop(host);

    assert_eq!(results.recv_timeout(TIMEOUT).unwrap(), ResultCode::Unknown.as_i32());
    assert!(results.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_child_uses_forwarded_limits() {
    let fixture = Fixture::new();
    let mut options = fixture.child_options();
    // Too small for the child's AppStarted acknowledgement.
    options.limits.max_message_bytes = 8;
    let mut host = ChildProcessHost::new(options);
    host.start().unwrap();

    let (_shell_end, request) = fixture.core.create_message_pipe().unwrap();
    let (completion, results) = completion();
    host.start_app(
        Path::new("/nonexistent/limited.app"),
        CleanupPolicy::KeepAppPath,
        request,
        completion,
    );

    assert_eq!(host.join(), FATAL_EXIT_CODE);
    assert_eq!(results.recv_timeout(TIMEOUT).unwrap(), ResultCode::Unknown.as_i32());
    assert_eq!(host.state(), ChildState::Completed(CompletionReason::ConnectionLost));
}
