//! End-to-end tests against the real Linux backends.
//!
//! They need root, a delegated cgroup v2 tree, and a root filesystem with
//! `/bin/sh`, `dd` and the users `nobody`, `alice` and `bob` (homes under
//! `/home`) at `PADDOCK_TEST_ROOTFS`. The disk tests also need the data
//! directory on a filesystem mounted with project quotas. Run with
//! `cargo test -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;

use paddock_common::config::{IsolationMode, PaddockConfig};
use paddock_common::types::{
    ContainerHandle, ContainerSpec, DiskLimitScope, DiskLimits, Limits, MemoryLimits, ProcessSpec,
};
use paddock_runtime::engine::Engine;
use paddock_runtime::stream::{OutputBuffer, ProcessIo};

const MIB: u64 = 1024 * 1024;

fn engine(dir: &std::path::Path) -> Engine {
    let rootfs = std::env::var("PADDOCK_TEST_ROOTFS").expect("PADDOCK_TEST_ROOTFS names a root filesystem");
    let config = PaddockConfig {
        data_dir: dir.to_path_buf(),
        default_rootfs: Some(PathBuf::from(rootfs)),
        isolation: IsolationMode::Linux,
        cgroup_root: PathBuf::from("/sys/fs/cgroup/paddock-test"),
        ..PaddockConfig::default()
    };
    Engine::new(config).unwrap()
}

fn dd(count: u32) -> ProcessSpec {
    ProcessSpec::new("dd")
        .args([
            "if=/dev/urandom".to_owned(),
            "of=/dev/shm/x".to_owned(),
            "bs=1M".to_owned(),
            format!("count={count}"),
        ])
        .user("nobody")
}

fn sh(user: &str, script: &str) -> ProcessSpec {
    ProcessSpec::new("/bin/sh").args(["-c", script]).user(user)
}

fn write_home(user: &str, name: &str, mib: u64) -> ProcessSpec {
    sh(user, &format!("dd if=/dev/zero of=/home/{user}/{name} bs=1M count={mib}"))
}

/// Exit code, stdout and stderr of one process.
async fn output(engine: &Engine, handle: &ContainerHandle, spec: &ProcessSpec) -> (i32, String, String) {
    let stdout = OutputBuffer::new();
    let stderr = OutputBuffer::new();
    let io = ProcessIo::new().with_stdout(stdout.clone()).with_stderr(stderr.clone());
    let process = engine.run(handle, spec, io).await.unwrap();
    let code = process.wait().await.unwrap();
    (code, stdout.text(), stderr.text())
}

fn disk(scope: DiskLimitScope, hard: u64) -> ContainerSpec {
    ContainerSpec {
        limits: Limits {
            disk: DiskLimits {
                byte_hard: hard,
                scope,
                ..DiskLimits::default()
            },
            ..Limits::default()
        },
        ..ContainerSpec::default()
    }
}

// ── Memory ───────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "needs root, cgroup v2 and PADDOCK_TEST_ROOTFS"]
async fn shm_writes_are_charged_to_the_memory_limit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let spec = ContainerSpec {
        limits: Limits {
            memory: MemoryLimits { limit_in_bytes: 64 * MIB },
            ..Limits::default()
        },
        ..ContainerSpec::default()
    };

    let over = engine.create(spec.clone()).await.unwrap();
    let process = engine.run(&over, &dd(65), ProcessIo::new()).await.unwrap();
    assert_ne!(process.wait().await.unwrap(), 0);

    let under = engine.create(spec).await.unwrap();
    let process = engine.run(&under, &dd(60), ProcessIo::new()).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);

    engine.destroy_all().await.unwrap();
}

// ── Disk ─────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "needs root, project quotas and PADDOCK_TEST_ROOTFS"]
async fn users_share_one_disk_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let handle = engine.create(disk(DiskLimitScope::Exclusive, 10 * MIB)).await.unwrap();

    let (code, _, _) = output(&engine, &handle, &write_home("alice", "big", 8)).await;
    assert_eq!(code, 0);
    let (code, _, stderr) = output(&engine, &handle, &write_home("bob", "big", 3)).await;
    assert_ne!(code, 0, "{stderr}");
    let (code, _, stderr) = output(&engine, &handle, &sh("bob", "rm -f /home/bob/big")).await;
    assert_eq!(code, 0, "{stderr}");
    let (code, _, stderr) = output(&engine, &handle, &write_home("bob", "small", 1)).await;
    assert_eq!(code, 0, "{stderr}");

    engine.destroy_all().await.unwrap();
}

#[tokio::test]
#[ignore = "needs root, project quotas and PADDOCK_TEST_ROOTFS"]
async fn exclusive_ceiling_ignores_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let handle = engine.create(disk(DiskLimitScope::Exclusive, 10 * MIB)).await.unwrap();

    let (code, _, stderr) = output(&engine, &handle, &write_home("alice", "fits", 8)).await;
    assert_eq!(code, 0, "{stderr}");
    let (code, _, _) = output(&engine, &handle, &write_home("alice", "spills", 4)).await;
    assert_ne!(code, 0);
    let used = engine.metrics(&handle).await.unwrap().disk.exclusive_bytes_used;
    assert!(used <= 10 * MIB, "{used}");

    engine.destroy_all().await.unwrap();
}

#[tokio::test]
#[ignore = "needs root, project quotas and PADDOCK_TEST_ROOTFS"]
async fn total_ceiling_counts_the_image_when_writing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let sizing = engine.create(ContainerSpec::default()).await.unwrap();
    let usage = engine.metrics(&sizing).await.unwrap().disk;
    let image = usage.total_bytes_used - usage.exclusive_bytes_used;
    engine.destroy(&sizing).await.unwrap();

    let handle = engine.create(disk(DiskLimitScope::Total, image + 10 * MIB)).await.unwrap();
    let (code, _, stderr) = output(&engine, &handle, &write_home("alice", "fits", 8)).await;
    assert_eq!(code, 0, "{stderr}");
    let (code, _, _) = output(&engine, &handle, &write_home("alice", "spills", 4)).await;
    assert_ne!(code, 0);
    let total = engine.metrics(&handle).await.unwrap().disk.total_bytes_used;
    assert!(total <= image + 10 * MIB, "{total}");

    engine.destroy_all().await.unwrap();
}

// ── Working directory ────────────────────────────────────────────────

#[tokio::test]
#[ignore = "needs root, cgroup v2 and PADDOCK_TEST_ROOTFS"]
async fn unreachable_working_directory_fails_inside_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let handle = engine.create(ContainerSpec::default()).await.unwrap();
    let (code, _, _) = output(&engine, &handle, &sh("root", "mkdir -m 700 /home/alice/locked")).await;
    assert_eq!(code, 0);

    let spec = sh("alice", "true").dir("/home/alice/locked");
    let (code, _, stderr) = output(&engine, &handle, &spec).await;
    assert_ne!(code, 0);
    assert!(stderr.contains("Permission denied"), "{stderr}");

    engine.destroy_all().await.unwrap();
}

#[tokio::test]
#[ignore = "needs root, cgroup v2 and PADDOCK_TEST_ROOTFS"]
async fn missing_working_directory_is_created_for_the_user() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let handle = engine.create(ContainerSpec::default()).await.unwrap();
    let (code, _, _) = output(&engine, &handle, &sh("root", "mkdir -m 755 /home/alice/nopermissions")).await;
    assert_eq!(code, 0);

    let spec = sh("alice", "touch here && pwd").dir("/home/alice/nopermissions/nonexistent");
    let (code, stdout, stderr) = output(&engine, &handle, &spec).await;
    assert_eq!(code, 0, "{stderr}");
    assert_eq!(stdout.trim(), "/home/alice/nopermissions/nonexistent");

    engine.destroy_all().await.unwrap();
}

#[tokio::test]
#[ignore = "needs root, cgroup v2 and PADDOCK_TEST_ROOTFS"]
async fn working_directory_defaults_to_home() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let handle = engine.create(ContainerSpec::default()).await.unwrap();

    let (code, stdout, _) = output(&engine, &handle, &sh("alice", "pwd")).await;
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "/home/alice");

    engine.destroy_all().await.unwrap();
}

// ── Identity ─────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "needs root, cgroup v2 and PADDOCK_TEST_ROOTFS"]
async fn processes_see_their_own_hostname_and_root() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let handle = engine
        .create(ContainerSpec {
            handle: Some("e2e-host".into()),
            ..ContainerSpec::default()
        })
        .await
        .unwrap();

    let stdout = OutputBuffer::new();
    let io = ProcessIo::new().with_stdout(stdout.clone());
    let script = ProcessSpec::new("/bin/sh").args(["-c", "hostname; ls /etc/hosts; id -u"]).user("nobody");
    let process = engine.run(&handle, &script, io).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);

    let lines: Vec<String> = stdout.text().lines().map(str::to_owned).collect();
    assert_eq!(lines[0], "e2e-host");
    assert_eq!(lines[1], "/etc/hosts");
    assert_ne!(lines[2], "0");

    engine.destroy(&handle).await.unwrap();
}
