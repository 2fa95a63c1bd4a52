//! End-to-end job lifecycle scenarios through the real trampoline.
//!
//! This test uses `harness = false` so its `main` can install the re-exec
//! guard before anything else: starting a job re-executes this very binary,
//! and the guard is what routes that child into cgroup setup instead of back
//! into the test suite.
//!
//! The scenarios need root and a writable cgroup2 hierarchy; anywhere else
//! they are skipped with a notice.

use std::fs::OpenOptions;
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use overseer::resources::cgroup;
use overseer::{utils, JobState, JobStatus, OverseerError, Supervisor};

fn main() {
    overseer::reexec_guard();

    if !preconditions_met() {
        eprintln!("job_lifecycle: skipped (requires root and a writable cgroup2 hierarchy)");
        return;
    }

    echo_job_is_captured_and_replayable();
    running_job_can_be_stopped_once();
    staggered_output_blocks_until_written();
    directory_as_program_fails_synchronously();
    unknown_job_id_is_rejected();

    println!("job_lifecycle: all scenarios passed");
}

fn preconditions_met() -> bool {
    if !utils::is_root() || !utils::has_cgroup_v2() {
        return false;
    }

    // The trampoline will create the subtree and join it; probe that the
    // same operations are permitted here
    let Ok(root) = cgroup::cgroup2_mount_point() else {
        return false;
    };
    let subtree = root.join(cgroup::CONTROL_SUBTREE);
    if let Err(e) = std::fs::create_dir(&subtree) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return false;
        }
    }

    OpenOptions::new()
        .write(true)
        .open(subtree.join("cgroup.procs"))
        .is_ok()
}

fn string_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn wait_for_terminal(sup: &Supervisor, id: &str) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = sup.job_status(id).unwrap();
        if status.state != JobState::Started {
            return status;
        }
        assert!(Instant::now() < deadline, "job {id} never left Started");
        thread::sleep(Duration::from_millis(20));
    }
}

fn drain(sup: &Supervisor, id: &str, stderr: bool) -> Vec<u8> {
    let mut reader = if stderr {
        sup.job_stderr(id).unwrap()
    } else {
        sup.job_stdout(id).unwrap()
    };
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    out
}

fn echo_job_is_captured_and_replayable() {
    let sup = Supervisor::new();
    let id = sup
        .start_job("echo", &string_args(&["hello", "multipipe"]))
        .unwrap();

    assert_eq!(drain(&sup, &id, false), b"hello multipipe\n");
    assert!(drain(&sup, &id, true).is_empty());

    let status = wait_for_terminal(&sup, &id);
    assert_eq!(status.state, JobState::Done);
    assert_eq!(status.exit_code, Some(0));

    // A fresh reader replays the whole history after the job is done
    assert_eq!(drain(&sup, &id, false), b"hello multipipe\n");

    println!("job_lifecycle: echo scenario ok ({id})");
}

fn running_job_can_be_stopped_once() {
    let sup = Supervisor::new();
    let id = sup.start_job("sleep", &string_args(&["999"])).unwrap();

    assert_eq!(sup.job_status(&id).unwrap().state, JobState::Started);

    sup.stop_job(&id).unwrap();
    assert_eq!(sup.job_status(&id).unwrap().state, JobState::Stopped);

    assert!(matches!(sup.stop_job(&id), Err(OverseerError::JobFinished)));

    let status = wait_for_terminal(&sup, &id);
    assert_eq!(status.state, JobState::Stopped);

    println!("job_lifecycle: stop scenario ok ({id})");
}

fn staggered_output_blocks_until_written() {
    let sup = Supervisor::new();
    let id = sup
        .start_job(
            "sh",
            &string_args(&["-c", "echo hello && sleep 2 && echo world"]),
        )
        .unwrap();

    let mut reader = sup.job_stdout(&id).unwrap();
    let mut chunk = [0u8; 16];

    let n = reader.read(&mut chunk).unwrap();
    assert_eq!(&chunk[..n], b"hello\n");

    let before_second = Instant::now();
    let n = reader.read(&mut chunk).unwrap();
    assert_eq!(&chunk[..n], b"world\n");
    assert!(
        before_second.elapsed() >= Duration::from_millis(500),
        "second read should have blocked on the sleep"
    );

    assert_eq!(reader.read(&mut chunk).unwrap(), 0);

    println!("job_lifecycle: staggered output scenario ok ({id})");
}

fn directory_as_program_fails_synchronously() {
    let sup = Supervisor::new();
    let err = sup.start_job("/tmp", &[]).unwrap_err();
    assert!(
        matches!(err, OverseerError::Launch(_)),
        "expected a launch failure, got: {err}"
    );

    println!("job_lifecycle: launch failure scenario ok");
}

fn unknown_job_id_is_rejected() {
    let sup = Supervisor::new();
    assert!(matches!(
        sup.job_status("fake-id"),
        Err(OverseerError::UnknownJobId)
    ));
    assert!(matches!(
        sup.stop_job("fake-id"),
        Err(OverseerError::UnknownJobId)
    ));

    println!("job_lifecycle: unknown id scenario ok");
}
