//! Process supervision through the engine, with host isolation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::io::Cursor;
use std::time::Duration;

use paddock_common::error::PaddockError;
use paddock_common::types::{ContainerSpec, ProcessId, ProcessSpec, Signal};
use paddock_runtime::stream::{OutputBuffer, ProcessIo};
use support::{eventually, harness, spec};

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::new("/bin/sh").args(["-c", script])
}

fn captured() -> (ProcessIo, OutputBuffer, OutputBuffer) {
    let stdout = OutputBuffer::new();
    let stderr = OutputBuffer::new();
    let io = ProcessIo::new().with_stdout(stdout.clone()).with_stderr(stderr.clone());
    (io, stdout, stderr)
}

/// Whether `pid` exists and is not a zombie awaiting its reaper.
fn alive(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| stat.rsplit_once(')').map(|(_, rest)| rest.trim_start().to_owned()))
        .is_some_and(|rest| !rest.starts_with('Z'))
}

// ── Exit codes and output ────────────────────────────────────────────

#[tokio::test]
async fn exit_code_and_output_pass_through() {
    let h = harness();
    let handle = h.engine.create(spec("exit")).await.unwrap();
    let (io, stdout, stderr) = captured();

    let process = h.engine.run(&handle, &sh("echo out; echo err >&2; exit 3"), io).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 3);
    assert_eq!(stdout.text(), "out\n");
    assert_eq!(stderr.text(), "err\n");
    assert_eq!(process.exit_code(), Some(3));
}

#[tokio::test]
async fn process_env_overrides_container_env() {
    let h = harness();
    let container = ContainerSpec {
        env: vec!["CONTAINER_ENV=1".into(), "TEST=original".into()],
        ..spec("env")
    };
    let handle = h.engine.create(container).await.unwrap();
    let (io, stdout, _) = captured();

    let process_spec = sh("echo $CONTAINER_ENV $TEST $FRUIT").env("TEST=hello").env("FRUIT=banana");
    let process = h.engine.run(&handle, &process_spec, io).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(stdout.text(), "1 hello banana\n");
}

#[tokio::test]
async fn stdin_reaches_the_process() {
    let h = harness();
    let handle = h.engine.create(spec("stdin")).await.unwrap();
    let stdout = OutputBuffer::new();
    let io = ProcessIo::new()
        .with_stdin(Cursor::new(b"line one\nline two\n".to_vec()))
        .with_stdout(stdout.clone());

    let process = h.engine.run(&handle, &ProcessSpec::new("cat"), io).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(stdout.text(), "line one\nline two\n");
}

#[tokio::test]
async fn large_output_arrives_complete() {
    let h = harness();
    let handle = h.engine.create(spec("bulk")).await.unwrap();
    let (io, stdout, _) = captured();

    let process = h
        .engine
        .run(&handle, &sh("head -c 1048576 /dev/zero"), io)
        .await
        .unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(stdout.contents().len(), 1_048_576);
}

#[tokio::test]
async fn output_reaches_buffered_sinks_while_running() {
    let h = harness();
    let handle = h.engine.create(spec("live")).await.unwrap();
    let stdout = OutputBuffer::new();
    let io = ProcessIo::new().with_stdout(tokio::io::BufWriter::new(stdout.clone()));

    let process = h.engine.run(&handle, &sh("echo hi; sleep 3"), io).await.unwrap();
    assert!(eventually(Duration::from_millis(1500), || stdout.text() == "hi\n").await);
    assert!(process.is_running());
    h.engine.destroy(&handle).await.unwrap();
}

// ── Spawn failures ───────────────────────────────────────────────────

#[tokio::test]
async fn missing_executable_is_a_spawn_error() {
    let h = harness();
    let handle = h.engine.create(spec("missing")).await.unwrap();

    let err = h
        .engine
        .run(&handle, &ProcessSpec::new("/no/such/program"), ProcessIo::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PaddockError::Spawn { .. }));
    let err = h
        .engine
        .run(&handle, &ProcessSpec::new("no-such-program-anywhere"), ProcessIo::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PaddockError::Spawn { ref message } if message.contains("not found")));
    let err = h.engine.run(&handle, &ProcessSpec::new(""), ProcessIo::new()).await.unwrap_err();
    assert!(matches!(err, PaddockError::Spawn { .. }));
}

#[tokio::test]
async fn working_directory_is_created() {
    let h = harness();
    let handle = h.engine.create(spec("workdir")).await.unwrap();
    let (io, stdout, _) = captured();

    let process = h
        .engine
        .run(&handle, &ProcessSpec::new("pwd").dir("/work/nested"), io)
        .await
        .unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);
    assert!(h.rootfs.root_of("workdir").join("work/nested").is_dir());
    assert!(stdout.text().trim_end().ends_with("work/nested"));
}

// ── Signals ──────────────────────────────────────────────────────────

#[tokio::test]
async fn trapped_terminate_decides_the_exit_code() {
    let h = harness();
    let handle = h.engine.create(spec("trap")).await.unwrap();
    let (io, stdout, _) = captured();

    let process = h
        .engine
        .run(&handle, &sh("trap 'exit 42' TERM; sleep 20 & echo trapping; wait"), io)
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(5), || stdout.text().contains("trapping")).await);

    h.engine.signal(&handle, process.id(), Signal::Terminate).await.unwrap();
    let code = tokio::time::timeout(Duration::from_secs(10), h.engine.wait(&handle, process.id()))
        .await
        .expect("wait returned within 10s")
        .unwrap();
    assert_eq!(code, 42);
    h.engine.destroy(&handle).await.unwrap();
}

#[tokio::test]
async fn kill_reports_the_signal_in_the_exit_code() {
    let h = harness();
    let handle = h.engine.create(spec("kill")).await.unwrap();
    let process = h.engine.run(&handle, &ProcessSpec::new("sleep").arg("30"), ProcessIo::new()).await.unwrap();
    assert!(process.is_running());

    process.signal(Signal::Kill).unwrap();
    assert_eq!(process.wait().await.unwrap(), 137);
    process.signal(Signal::Terminate).unwrap();
}

#[tokio::test]
async fn concurrent_waiters_see_the_same_exit_code() {
    let h = harness();
    let handle = h.engine.create(spec("waiters")).await.unwrap();
    let process = h.engine.run(&handle, &sh("sleep 0.2; exit 7"), ProcessIo::new()).await.unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let process = process.clone();
            tokio::spawn(async move { process.wait().await.unwrap() })
        })
        .collect();
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), 7);
    }
}

// ── Attach and info ──────────────────────────────────────────────────

#[tokio::test]
async fn attach_finds_started_processes_only() {
    let h = harness();
    let handle = h.engine.create(spec("attach")).await.unwrap();
    let process = h.engine.run(&handle, &sh("sleep 0.3; exit 5"), ProcessIo::new()).await.unwrap();

    let info = h.engine.info(&handle).await.unwrap();
    assert_eq!(info.process_ids, [process.id()]);
    assert_eq!(h.engine.metrics(&handle).await.unwrap().process_count, 1);

    let attached = h.engine.attach(&handle, process.id()).await.unwrap();
    assert_eq!(attached.pid(), process.pid());
    assert_eq!(attached.wait().await.unwrap(), 5);

    let err = h.engine.attach(&handle, ProcessId::new(999_999)).await.unwrap_err();
    assert!(matches!(err, PaddockError::NotFound { kind: "process", .. }));
    assert!(h.engine.info(&handle).await.unwrap().process_ids.is_empty());
}

#[tokio::test]
async fn destroy_kills_processes_and_closes_the_container() {
    let h = harness();
    let handle = h.engine.create(spec("doomed")).await.unwrap();
    let process = h.engine.run(&handle, &ProcessSpec::new("sleep").arg("30"), ProcessIo::new()).await.unwrap();

    h.engine.destroy(&handle).await.unwrap();
    assert_eq!(process.exit_code(), Some(137));
    let err = h.engine.run(&handle, &ProcessSpec::new("true"), ProcessIo::new()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn destroy_kills_background_children() {
    let h = harness();
    let handle = h.engine.create(spec("orphans")).await.unwrap();
    let baseline = h.engine.workers().live();
    let (io, stdout, _) = captured();

    let process = h
        .engine
        .run(&handle, &sh("sleep 30 >/dev/null 2>&1 & echo $!; sleep 30 & wait"), io)
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(5), || stdout.text().ends_with('\n')).await);
    let child = stdout.text().trim().parse::<u32>().unwrap();
    assert!(alive(child));

    h.engine.destroy(&handle).await.unwrap();
    assert_eq!(process.exit_code(), Some(137));
    assert!(eventually(Duration::from_secs(5), || !alive(child)).await);
    let workers = h.engine.workers().clone();
    assert!(eventually(Duration::from_secs(5), || workers.live() == baseline).await);
}

#[tokio::test]
async fn destroy_kills_children_of_exited_leaders() {
    let h = harness();
    let handle = h.engine.create(spec("leftover")).await.unwrap();
    let baseline = h.engine.workers().live();
    let (io, stdout, _) = captured();

    let process = h.engine.run(&handle, &sh("sleep 30 & echo $!"), io).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);
    let child = stdout.text().trim().parse::<u32>().unwrap();

    h.engine.destroy(&handle).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || !alive(child)).await);
    let workers = h.engine.workers().clone();
    assert!(eventually(Duration::from_secs(5), || workers.live() == baseline).await);
}

// ── Leak detection ───────────────────────────────────────────────────

#[tokio::test]
async fn repeated_runs_return_workers_to_baseline() {
    let h = harness();
    let handle = h.engine.create(spec("leaks")).await.unwrap();
    let baseline = h.engine.workers().live();

    for i in 0..20 {
        let (io, stdout, _) = captured();
        let io = io.with_stdin(Cursor::new(Vec::new()));
        let process = h.engine.run(&handle, &sh(&format!("cat; echo {i}")), io).await.unwrap();
        assert_eq!(process.wait().await.unwrap(), 0);
        assert_eq!(stdout.text(), format!("{i}\n"));
    }

    let workers = h.engine.workers().clone();
    assert!(eventually(Duration::from_secs(5), || workers.live() == baseline).await);
    assert!(h.engine.capacity().diagnostics.stacks.is_empty());
}
