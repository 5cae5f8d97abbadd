// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for timeout handling in a real process.
//!
//! Each test runs the `timeout-fixture` binary, waits until it reports that its listeners are
//! installed, and then times it out the way a supervising runner would: with `SIGALRM`, or with a
//! JSON message over an IPC channel.

use pretty_assertions::assert_eq;
use std::{
    io::{BufRead, BufReader, Read, Write},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
};

const TIMEOUT_MESSAGE: &[u8] = b"{\"abortReason\":\"timeout\"}\n";
const LATE_TIMEOUT: &str = "possible timeout: timeout signal received after tap end";

struct Fixture {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: ChildStderr,
}

struct FixtureOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl Fixture {
    fn spawn(envs: &[(&str, &str)]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_timeout-fixture"))
            .env_remove("TAP_CHILD_ID")
            .env_remove("TAP_IPC_FD")
            .env_remove("TAP_DEBUG")
            .envs(envs.iter().copied())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawned timeout-fixture");

        let stdin = child.stdin.take();
        let stdout = BufReader::new(child.stdout.take().expect("stdout is piped"));
        let stderr = child.stderr.take().expect("stderr is piped");
        Self {
            child,
            stdin,
            stdout,
            stderr,
        }
    }

    /// Reads stdout until the fixture is ready to be timed out, and returns what was read.
    fn wait_ready(&mut self) -> String {
        let mut seen = String::new();
        loop {
            let mut line = String::new();
            let n = self
                .stdout
                .read_line(&mut line)
                .expect("read from timeout-fixture");
            assert!(
                n > 0,
                "timeout-fixture exited before becoming ready, output so far:\n{seen}"
            );
            seen.push_str(&line);
            if line == "# ready\n" {
                return seen;
            }
        }
    }

    fn send_ipc(&mut self, message: &[u8]) {
        let stdin = self.stdin.as_mut().expect("stdin is open");
        stdin.write_all(message).expect("wrote IPC message");
        stdin.flush().expect("flushed IPC message");
    }

    #[cfg(unix)]
    fn send_sigalrm(&self) {
        let pid = libc::pid_t::try_from(self.child.id()).expect("pid fits in pid_t");
        // SAFETY: kill has no memory safety requirements.
        let res = unsafe { libc::kill(pid, libc::SIGALRM) };
        assert_eq!(res, 0, "sent SIGALRM to timeout-fixture");
    }

    fn finish(mut self) -> FixtureOutput {
        let mut stdout = String::new();
        self.stdout
            .read_to_string(&mut stdout)
            .expect("read stdout to the end");
        drop(self.stdin.take());
        let status = self.child.wait().expect("timeout-fixture exited");
        let mut stderr = String::new();
        self.stderr
            .read_to_string(&mut stderr)
            .expect("read stderr to the end");
        FixtureOutput {
            status,
            stdout,
            stderr,
        }
    }
}

fn assert_timed_out(output: &FixtureOutput, signal: &str) {
    assert_eq!(
        output.status.code(),
        Some(1),
        "a timed out run fails, stderr:\n{}",
        output.stderr
    );
    let stdout = &output.stdout;
    assert!(stdout.contains("not ok 1 - timeout!\n"), "stdout:\n{stdout}");
    assert!(
        stdout.contains(&format!("# signal: {signal}\n")),
        "stdout:\n{stdout}"
    );
    assert!(
        stdout.contains("# fail: 1\n# pass 0 / 1\n# fail\n# time="),
        "stdout:\n{stdout}"
    );
    assert!(
        !output.stderr.contains(LATE_TIMEOUT),
        "the aggregate was still open, stderr:\n{}",
        output.stderr
    );
}

#[test]
fn stdin_ipc_timeout_fails_run() {
    let mut fixture = Fixture::spawn(&[("TIMEOUT_FIXTURE_STDIN_IPC", "1")]);
    let preamble = fixture.wait_ready();
    assert_eq!(preamble, "TAP version 14\n# ready\n");

    fixture.send_ipc(b"{\"hello\":\"world\"}\n");
    fixture.send_ipc(TIMEOUT_MESSAGE);
    let output = fixture.finish();
    assert_timed_out(&output, "none");
}

#[test]
fn late_ipc_timeout_is_escalated() {
    let mut fixture = Fixture::spawn(&[
        ("TIMEOUT_FIXTURE_STDIN_IPC", "1"),
        ("TIMEOUT_FIXTURE_MODE", "finished"),
    ]);
    let preamble = fixture.wait_ready();
    assert!(
        preamble.contains("ok 1 - fine\n1..1\n# pass 1 / 1\n# time="),
        "the run finished before the timeout: {preamble}"
    );

    fixture.send_ipc(TIMEOUT_MESSAGE);
    let output = fixture.finish();
    assert!(output.stderr.contains(LATE_TIMEOUT), "stderr:\n{}", output.stderr);
    assert!(
        output.stderr.contains("\"Timeout\""),
        "pending handles are listed, stderr:\n{}",
        output.stderr
    );
    assert!(
        !output.stderr.contains("\"signal\""),
        "the signal is left out, stderr:\n{}",
        output.stderr
    );

    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(
                output.status.signal(),
                Some(libc::SIGALRM),
                "the fixture died of the re-raised signal: {:?}",
                output.status
            );
        } else {
            assert_eq!(
                output.status.code(),
                Some(1),
                "without signals the fixture exits with 1"
            );
        }
    }
}

#[cfg(unix)]
#[test]
fn sigalrm_fails_run() {
    let mut fixture = Fixture::spawn(&[]);
    fixture.wait_ready();
    fixture.send_sigalrm();
    let output = fixture.finish();
    assert_timed_out(&output, "SIGALRM");
}

#[cfg(unix)]
#[test]
fn ipc_descriptor_timeout_fails_run() {
    // The fixture's stdin is the IPC channel. It is still open when the fixture returns from
    // `main`, so `finish` only sees end of stdout if the pending read doesn't hold up exit.
    let mut fixture = Fixture::spawn(&[("TAP_IPC_FD", "0")]);
    fixture.wait_ready();
    fixture.send_ipc(TIMEOUT_MESSAGE);
    let output = fixture.finish();
    assert_timed_out(&output, "none");
}

#[cfg(unix)]
#[test]
fn repeated_timeouts_are_reported_once() {
    let mut fixture = Fixture::spawn(&[("TAP_IPC_FD", "0")]);
    fixture.wait_ready();
    // Both messages in one write: the fixture may exit as soon as it has read the first.
    fixture.send_ipc(&[TIMEOUT_MESSAGE, TIMEOUT_MESSAGE].concat());
    let output = fixture.finish();
    assert_timed_out(&output, "none");
    assert_eq!(
        output.stdout.matches("not ok 1 - timeout!").count(),
        1,
        "stdout:\n{}",
        output.stdout
    );
}

#[cfg(unix)]
#[test]
fn late_sigalrm_is_reraised() {
    use std::os::unix::process::ExitStatusExt;

    let mut fixture = Fixture::spawn(&[("TIMEOUT_FIXTURE_MODE", "finished")]);
    fixture.wait_ready();
    fixture.send_sigalrm();
    let output = fixture.finish();

    assert_eq!(
        output.status.signal(),
        Some(libc::SIGALRM),
        "status: {:?}, stderr:\n{}",
        output.status,
        output.stderr
    );
    assert!(output.stderr.contains(LATE_TIMEOUT), "stderr:\n{}", output.stderr);
}
