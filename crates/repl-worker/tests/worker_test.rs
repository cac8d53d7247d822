//! Session worker integration tests
//!
//! Runs the worker thread over the mock REPL module and drives it through
//! `SessionController`, as a front end would.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use repl_engine::{EngineError, HostConfig, Stream};
use repl_worker::{
    worker::{INTERRUPTED_NOTICE, QUIT_NOTICE, TRAP_NOTICE},
    Response, SessionController, SessionWorker, WorkerError, WorkerState,
};
use std::{thread, time::Duration};

const MOCK_REPL: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../test-collateral/mock_repl.wat"
);

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spawns a worker over the mock module and waits for its first `ready`,
/// returning the progress reported on the way.
fn spawn_ready() -> (SessionController, Vec<f64>) {
    setup();
    let mut controller =
        SessionWorker::spawn(MOCK_REPL.to_string(), HostConfig::default()).unwrap();
    let mut progress = Vec::new();
    let last = controller
        .recv_until_ready(|response| {
            if let Response::Progress { data } = response {
                progress.push(*data);
            }
        })
        .unwrap();
    assert_eq!(last, Response::Ready);
    assert_eq!(controller.state(), WorkerState::Ready);
    (controller, progress)
}

/// Runs `input` to completion, returning the output it produced.
fn run(controller: &mut SessionController, input: &str) -> Vec<(Stream, String)> {
    controller.run(input).unwrap();
    assert_eq!(controller.state(), WorkerState::Running);
    collect_output(controller)
}

fn collect_output(controller: &mut SessionController) -> Vec<(Stream, String)> {
    let mut output = Vec::new();
    let last = controller
        .recv_until_ready(|response| {
            if let Response::Output { stream, data } = response {
                output.push((*stream, data.clone()));
            }
        })
        .unwrap();
    assert_eq!(last, Response::Ready);
    output
}

fn is_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ProtocolViolation { .. })
    )
}

#[test]
fn loads_with_progress_then_runs() {
    let (mut controller, progress) = spawn_ready();
    assert_eq!(progress.last(), Some(&100.0));
    assert!(progress.windows(2).all(|w| w[0] < w[1]));

    let output = run(&mut controller, "1 + 2");
    assert_eq!(output, vec![(Stream::Stdout, "3\n".to_string())]);
    assert_eq!(controller.state(), WorkerState::Ready);
    controller.shutdown().unwrap();
}

#[test]
fn requests_are_refused_until_ready() {
    setup();
    let mut controller =
        SessionWorker::spawn(MOCK_REPL.to_string(), HostConfig::default()).unwrap();
    assert_eq!(controller.state(), WorkerState::Loading);
    assert!(is_violation(&controller.run("1 + 2").unwrap_err()));
    assert!(is_violation(&controller.stop().unwrap_err()));

    controller.recv_until_ready(|_| {}).unwrap();
    controller.run("1 + 2").unwrap();
    // A second request before `ready` is refused.
    assert!(is_violation(&controller.run("3 + 4").unwrap_err()));
    assert!(is_violation(&controller.format("x").unwrap_err()));
    collect_output(&mut controller);
    controller.shutdown().unwrap();
}

/// A stop reaches a run that polls `check_interrupt`.  The module reports
/// the interruption itself, so no extra notice is added.
#[test]
fn stop_interrupts_a_long_run() {
    let (mut controller, _) = spawn_ready();
    controller.run("loop").unwrap();
    thread::sleep(Duration::from_millis(200));
    controller.stop().unwrap();
    assert_eq!(controller.state(), WorkerState::PendingStop);

    let output = collect_output(&mut controller);
    assert_eq!(output, vec![(Stream::Stderr, "interrupted\n".to_string())]);
    assert_eq!(controller.state(), WorkerState::Ready);

    // The next run is unaffected.
    let output = run(&mut controller, "2 + 2");
    assert_eq!(output, vec![(Stream::Stdout, "4\n".to_string())]);
    controller.shutdown().unwrap();
}

/// A module that stops without writing to stderr gets the worker's notice.
#[test]
fn silent_interruption_gets_a_notice() {
    let (mut controller, _) = spawn_ready();
    controller.run("quiet").unwrap();
    thread::sleep(Duration::from_millis(200));
    controller.stop().unwrap();

    let output = collect_output(&mut controller);
    assert_eq!(output, vec![(Stream::Stderr, INTERRUPTED_NOTICE.to_string())]);
    assert_eq!(controller.state(), WorkerState::Ready);
    controller.shutdown().unwrap();
}

#[test]
fn quit_reloads_the_session() {
    let (mut controller, _) = spawn_ready();
    let output = run(&mut controller, ":quit");
    assert_eq!(output, vec![(Stream::Stdout, QUIT_NOTICE.to_string())]);
    let output = run(&mut controller, "1 + 1");
    assert_eq!(output, vec![(Stream::Stdout, "2\n".to_string())]);
    controller.shutdown().unwrap();
}

#[test]
fn trap_rebuilds_the_instance() {
    let (mut controller, _) = spawn_ready();
    let output = run(&mut controller, "recurse");
    assert_eq!(output, vec![(Stream::Stderr, TRAP_NOTICE.to_string())]);

    let output = run(&mut controller, "crash");
    assert_eq!(output, vec![(Stream::Stderr, TRAP_NOTICE.to_string())]);

    let output = run(&mut controller, "5 + 4");
    assert_eq!(output, vec![(Stream::Stdout, "9\n".to_string())]);
    controller.shutdown().unwrap();
}

#[test]
fn format_answers_with_format() {
    let (mut controller, _) = spawn_ready();
    controller.format("let x = 1").unwrap();
    let last = controller.recv_until_ready(|_| {}).unwrap();
    assert_eq!(
        last,
        Response::Format {
            data: Some("let x = 1\n".to_string())
        }
    );
    assert_eq!(controller.state(), WorkerState::Ready);

    controller.format("let x = 1\n").unwrap();
    let last = controller.recv_until_ready(|_| {}).unwrap();
    assert_eq!(last, Response::Format { data: None });
    controller.shutdown().unwrap();
}

#[test]
fn load_replaces_the_session() {
    let (mut controller, _) = spawn_ready();
    controller.load("let y = 2").unwrap();
    assert!(collect_output(&mut controller).is_empty());
    let output = run(&mut controller, "hi");
    assert_eq!(output, vec![(Stream::Stdout, "hi\n".to_string())]);
    controller.shutdown().unwrap();
}

#[test]
fn graphics_are_relayed_with_their_tag() {
    let (mut controller, _) = spawn_ready();
    let output = run(&mut controller, "svg");
    assert_eq!(output, vec![(Stream::Graphics, "<svg/>".to_string())]);
    controller.shutdown().unwrap();
}

#[test]
fn load_failure_is_reported_once() {
    setup();
    let mut controller =
        SessionWorker::spawn("file:///nonexistent/repl.wasm".to_string(), HostConfig::default())
            .unwrap();
    let err = controller.recv_until_ready(|_| {}).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkerError>(),
        Some(WorkerError::SessionFailed(_))
    ));
    assert_eq!(controller.state(), WorkerState::Loading);
    assert!(is_violation(&controller.run("1 + 2").unwrap_err()));

    // The worker has exited; nothing more arrives.
    let err = controller.recv().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkerError>(),
        Some(WorkerError::Disconnected)
    ));
    controller.shutdown().unwrap();
}
