#![cfg(unix)]

use childproc::{
    Capabilities, LaunchSpec, OutputKind, OutputSink, Process, ProcessError, ProcessState, SIGKILL,
    TimeoutKind, probe_capabilities, timeout_from_secs,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("childproc=debug")
        .with_test_writer()
        .try_init();
}

fn process(command: &str) -> Process {
    init_tracing();
    Process::new(LaunchSpec::new(command).unwrap(), probe_capabilities()).unwrap()
}

fn process_with(spec: LaunchSpec) -> Process {
    init_tracing();
    Process::new(spec, probe_capabilities()).unwrap()
}

#[test]
fn test_echo_hello() {
    let mut process = process("echo hello");
    assert_eq!(process.status(), ProcessState::Ready);

    assert_eq!(process.run(None).unwrap(), 0);
    assert_eq!(process.output().unwrap(), b"hello\n");
    assert_eq!(process.exit_code().unwrap(), Some(0));
    assert!(process.is_successful().unwrap());
    assert_eq!(process.exit_code_text().unwrap(), Some("OK"));
    assert!(process.is_terminated());
    assert_eq!(process.status(), ProcessState::Terminated);
    assert!(!process.has_been_signaled().unwrap());
}

#[test]
fn test_error_output_is_separate() {
    let mut process = process("echo out; echo err >&2; exit 2");
    assert_eq!(process.run(None).unwrap(), 2);
    assert_eq!(process.output().unwrap(), b"out\n");
    assert_eq!(process.error_output().unwrap(), b"err\n");
    assert!(!process.is_successful().unwrap());
    assert_eq!(
        process.exit_code_text().unwrap(),
        Some("Misuse of shell builtins")
    );
}

#[test]
fn test_input_round_trips_through_cat() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(512 * 1024).collect();
    let spec = LaunchSpec::builder()
        .command("cat")
        .input(payload.clone())
        .build()
        .unwrap();
    let mut process = process_with(spec);

    process.run(None).unwrap();
    assert_eq!(process.output().unwrap(), payload);
}

#[test]
fn test_reader_input() {
    let spec = LaunchSpec::builder()
        .command("tr a-z A-Z")
        .input(childproc::Input::reader(std::io::Cursor::new(b"shout".to_vec())))
        .build()
        .unwrap();
    let mut process = process_with(spec);

    process.run(None).unwrap();
    assert_eq!(process.output().unwrap(), b"SHOUT");
}

#[test]
fn test_incremental_output_concatenates_to_full_output() {
    let mut process = process("for i in 1 2 3 4 5; do echo line$i; sleep 0.05; done");
    process.start(None).unwrap();

    let mut collected = Vec::new();
    while process.is_running() {
        collected.extend(process.incremental_output().unwrap());
        std::thread::sleep(Duration::from_millis(20));
    }
    process.wait(None).unwrap();
    collected.extend(process.incremental_output().unwrap());

    assert_eq!(collected, process.output().unwrap());
    assert_eq!(
        String::from_utf8(collected).unwrap(),
        "line1\nline2\nline3\nline4\nline5\n"
    );
}

#[test]
fn test_clear_output() {
    let mut process = process("echo first; echo oops >&2");
    process.run(None).unwrap();

    process.clear_output().clear_error_output();
    assert!(process.output().unwrap().is_empty());
    assert!(process.incremental_error_output().unwrap().is_empty());
}

#[test]
fn test_double_start_fails() {
    let mut process = process("sleep 1");
    process.start(None).unwrap();

    let err = process.start(None).unwrap_err();
    assert!(matches!(err, ProcessError::Lifecycle(_)));

    process.stop(Duration::ZERO, None).unwrap();
    let err = process.start(None).unwrap_err();
    assert!(matches!(err, ProcessError::Lifecycle(_)));
}

#[test]
fn test_wait_before_start_fails() {
    let mut process = process("true");
    assert!(matches!(
        process.wait(None).unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
    assert!(matches!(
        process.output().unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
    assert!(matches!(
        process.signal(SIGKILL).unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
    assert!(matches!(
        process.has_been_signaled().unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
    assert_eq!(process.exit_code().unwrap(), None);
    assert_eq!(process.pid(), None);
}

#[test]
fn test_idle_timeout() {
    let spec = LaunchSpec::builder()
        .command("echo a; sleep 3; echo b")
        .idle_timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let mut process = process_with(spec);
    let started = Instant::now();

    let err = process.run(None).unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Timeout {
            kind: TimeoutKind::Idle,
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(process.is_terminated());
    assert_eq!(process.output().unwrap(), b"a\n");
}

#[test]
fn test_run_timeout() {
    let spec = LaunchSpec::builder()
        .command("sleep 5")
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let mut process = process_with(spec);

    let err = process.run(None).unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(
        err,
        ProcessError::Timeout {
            kind: TimeoutKind::Run,
            ..
        }
    ));
    assert!(process.is_terminated());
}

#[test]
fn test_stop_escalates_to_kill() {
    let mut process = process("trap '' TERM; echo ready; while true; do sleep 0.1; done");
    process.start(None).unwrap();
    while process.output().unwrap().is_empty() {
        std::thread::sleep(Duration::from_millis(10));
    }

    let started = Instant::now();
    let code = process.stop(Duration::from_millis(500), None).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));

    assert!(!process.is_running());
    assert_eq!(code, Some(128 + SIGKILL));
    assert!(process.has_been_signaled().unwrap());
    assert_eq!(process.term_signal().unwrap(), SIGKILL);
    // The kill was requested, so waiting does not flag it
    assert_eq!(process.wait(None).unwrap(), 128 + SIGKILL);
}

#[test]
fn test_stop_is_noop_when_terminated() {
    let mut process = process("exit 4");
    process.run(None).unwrap();
    assert_eq!(process.stop(Duration::from_secs(1), None).unwrap(), Some(4));
}

#[test]
fn test_requested_signal_is_not_unexpected() {
    let mut process = process("exec sleep 5");
    process.start(None).unwrap();
    assert!(process.pid().is_some());

    process.signal(SIGKILL).unwrap();
    assert_eq!(process.wait(None).unwrap(), 137);
    assert_eq!(process.exit_code_text().unwrap(), Some("Kill (terminate immediately)"));
}

#[test]
fn test_unexpected_signal() {
    let mut process = process("kill -9 $$");
    let err = process.run(None).unwrap_err();
    assert!(matches!(err, ProcessError::UnexpectedSignal(9)));
    assert_eq!(process.exit_code().unwrap(), Some(137));
}

#[test]
fn test_slow_producer_is_fully_captured() {
    let spec = LaunchSpec::builder()
        .command("for i in 1 2 3 4 5 6; do printf x; sleep 0.1; done")
        .no_timeout()
        .build()
        .unwrap();
    let mut process = process_with(spec);

    assert_eq!(process.run(None).unwrap(), 0);
    assert_eq!(process.output().unwrap(), b"xxxxxx");
}

#[test]
fn test_disabled_output() {
    let spec = LaunchSpec::builder()
        .command("echo hidden")
        .output_disabled(true)
        .build()
        .unwrap();
    let mut process = process_with(spec);

    let sink: Box<dyn OutputSink> = Box::new(|_kind: OutputKind, _data: &[u8]| {});
    assert!(matches!(
        process.start(Some(sink)).unwrap_err(),
        ProcessError::Lifecycle(_)
    ));

    assert_eq!(process.run(None).unwrap(), 0);
    assert!(matches!(
        process.output().unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
    assert!(matches!(
        process.error_output().unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
}

#[test]
fn test_sink_receives_output_in_order() {
    let seen: Arc<Mutex<Vec<(OutputKind, Vec<u8>)>>> = Arc::default();
    let recorder = Arc::clone(&seen);
    let sink: Box<dyn OutputSink> = Box::new(move |kind: OutputKind, data: &[u8]| {
        recorder.lock().unwrap().push((kind, data.to_vec()));
    });

    let mut process = process("echo one; sleep 0.1; echo two >&2");
    process.run(Some(sink)).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (OutputKind::Out, b"one\n".to_vec()),
            (OutputKind::Err, b"two\n".to_vec())
        ]
    );
    assert_eq!(process.output().unwrap(), b"one\n");
}

#[test]
fn test_must_run() {
    let mut process = process("exit 127");
    let err = process.must_run(None).unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Failed {
            code: 127,
            text: "Command not found"
        }
    ));

    let mut succeeding = self::process("true");
    assert!(succeeding.must_run(None).is_ok());
}

#[test]
fn test_restart_builds_a_fresh_handle() {
    let mut first = process("echo again");
    first.run(None).unwrap();

    let mut second = first.restart(None).unwrap();
    assert!(second.is_started());
    assert_eq!(second.wait(None).unwrap(), 0);
    assert_eq!(second.output().unwrap(), b"again\n");
    assert_eq!(first.output().unwrap(), b"again\n");

    let mut running = process("sleep 2");
    running.start(None).unwrap();
    assert!(matches!(
        running.restart(None).unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
}

#[test]
fn test_environment_and_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let spec = LaunchSpec::builder()
        .command("echo \"$GREETING\"; pwd")
        .env("GREETING", "bonjour")
        .working_directory(dir.path())
        .build()
        .unwrap();
    let mut process = process_with(spec);
    process.run(None).unwrap();

    let output = String::from_utf8(process.output().unwrap()).unwrap();
    let mut lines = output.lines();
    assert_eq!(lines.next(), Some("bonjour"));
    let cwd = std::path::Path::new(lines.next().unwrap()).canonicalize().unwrap();
    assert_eq!(cwd, dir.path().canonicalize().unwrap());
}

#[test]
fn test_sigchild_compat_reports_exit_code() {
    let spec = LaunchSpec::builder()
        .command("echo compat; exit 3")
        .sigchild_compat(true)
        .build()
        .unwrap();
    let mut process = process_with(spec);

    assert_eq!(process.run(None).unwrap(), 3);
    assert_eq!(process.output().unwrap(), b"compat\n");
    assert!(!process.has_been_signaled().unwrap());
}

#[test]
fn test_sigchild_compat_stop() {
    let spec = LaunchSpec::builder()
        .command("sleep 5")
        .sigchild_compat(true)
        .build()
        .unwrap();
    let mut process = process_with(spec);
    process.start(None).unwrap();
    assert!(process.pid().is_some());

    process.stop(Duration::from_secs(2), None).unwrap();
    assert!(process.is_terminated());
    assert!(process.has_been_signaled().unwrap());
}

#[test]
fn test_exit_status_snapshot() {
    let mut process = process("exit 7");
    assert!(matches!(
        process.exit_status().unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
    process.run(None).unwrap();

    let status = process.exit_status().unwrap();
    assert_eq!(status.code, 7);
    assert!(!status.success());
    assert!(!status.signaled);
    assert!(!status.stopped);
    assert_eq!(status.text(), "Unknown error");
    assert!(!process.has_been_stopped().unwrap());
    assert_eq!(process.stop_signal().unwrap(), 0);
}

#[test]
fn test_drop_stops_running_process() {
    let mut process = process("sleep 30");
    process.start(None).unwrap();
    let pid = process.pid().unwrap();
    drop(process);

    // The child was reaped, so signal 0 can no longer reach it
    let alive = std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap()
        .success();
    assert!(!alive);
}

#[test]
fn test_missing_command() {
    let mut process = process("definitely-not-a-command-childproc");
    assert_eq!(process.run(None).unwrap(), 127);
    assert_eq!(process.exit_code_text().unwrap(), Some("Command not found"));
    assert!(!process.error_output().unwrap().is_empty());
}

#[test]
fn test_edited_spec_is_validated_on_new() {
    init_tracing();
    let mut spec = LaunchSpec::new("echo hello").unwrap();
    spec.timings.chunk_size = 0;
    assert!(matches!(
        Process::new(spec, probe_capabilities()).unwrap_err(),
        ProcessError::Configuration(_)
    ));

    let mut spec = LaunchSpec::new("echo hello").unwrap();
    spec.output_disabled = true;
    spec.idle_timeout = Some(Duration::from_millis(100));
    assert!(matches!(
        Process::new(spec, probe_capabilities()).unwrap_err(),
        ProcessError::Configuration(_)
    ));
}

#[test]
fn test_negative_timeout_is_rejected() {
    assert!(matches!(
        timeout_from_secs(-1.0).unwrap_err(),
        ProcessError::Configuration(_)
    ));

    let mut spec = LaunchSpec::new("echo done").unwrap();
    spec.timeout = timeout_from_secs(0.0).unwrap();
    spec.idle_timeout = timeout_from_secs(2.5).unwrap();
    let mut process = process_with(spec);
    assert_eq!(process.run(None).unwrap(), 0);
    assert_eq!(process.output().unwrap(), b"done\n");
}

#[test]
fn test_stop_with_unbounded_grace() {
    let mut process = process("sleep 0.3");
    process.start(None).unwrap();

    process.stop(Duration::MAX, None).unwrap();
    assert!(process.is_terminated());
    assert!(process.has_been_signaled().unwrap());
}

#[test]
fn test_undeliverable_signal() {
    let mut process = process("exec sleep 5");
    process.start(None).unwrap();

    let err = process.signal(12345).unwrap_err();
    assert!(matches!(err, ProcessError::SignalDelivery { signal: 12345, .. }));
    assert!(process.is_running());

    process.stop(Duration::ZERO, None).unwrap();
}

#[test]
fn test_pty_output_is_captured() {
    if !probe_capabilities().pty_supported {
        return;
    }
    let spec = LaunchSpec::builder()
        .command("echo from-pty")
        .pty(true)
        .build()
        .unwrap();
    let mut process = process_with(spec);

    assert_eq!(process.run(None).unwrap(), 0);
    let output = String::from_utf8(process.output().unwrap()).unwrap();
    assert!(output.contains("from-pty"));
    assert!(process.error_output().unwrap().is_empty());
}

#[test]
fn test_tty_mode() {
    init_tracing();
    let spec = LaunchSpec::builder()
        .command("exit 5")
        .tty(true)
        .build()
        .unwrap();

    let without_tty = Capabilities {
        tty_supported: false,
        ..probe_capabilities()
    };
    assert!(matches!(
        Process::new(spec.clone(), without_tty).unwrap_err(),
        ProcessError::Configuration(_)
    ));

    if !probe_capabilities().tty_supported {
        return;
    }
    let mut process = process_with(spec);
    process.start(None).unwrap();
    assert!(process.is_started());
    assert_eq!(process.wait(None).unwrap(), 5);
}

#[test]
fn test_sigchild_compat_unknown_term_signal() {
    // Killing the wrapper shell loses the real exit code
    let spec = LaunchSpec::builder()
        .command("kill -9 $$")
        .sigchild_compat(true)
        .build()
        .unwrap();
    let mut process = process_with(spec);

    let err = process.run(None).unwrap_err();
    assert!(matches!(err, ProcessError::UnexpectedSignal(-1)));
    assert!(process.has_been_signaled().unwrap());
    assert_eq!(process.exit_code().unwrap(), Some(-1));
    assert!(matches!(
        process.term_signal().unwrap_err(),
        ProcessError::Lifecycle(_)
    ));
}
