//! External command execution with a deadline
//!
//! Used for the few operations that have no netlink equivalent (the
//! iptables NAT rule). The child is polled and killed once the deadline
//! passes so a hung binary cannot stall provisioning.

use crate::error::{Error, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Combined output, stderr preferred when both are present
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Render a command line for logs and errors
pub fn display(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run `program` with `args`, killing it after `timeout`
///
/// A non-zero exit is not an error here; callers inspect `success`.
pub fn run(program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
    let line = display(program, args);
    debug!(command = %line, ?timeout, "running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::CommandFailed {
            command: line.clone(),
            message: e.to_string(),
        })?;

    // Pipes are drained while the child runs so a full pipe cannot block it
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = collect(stdout);
                let stderr = collect(stderr);

                debug!(command = %line, code = ?status.code(), "command finished");
                return Ok(CommandOutput {
                    success: status.success(),
                    exit_code: status.code(),
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    // Reap after kill
                    let _ = child.wait();
                    // Readers finish on their own once the pipes close
                    return Err(Error::Timeout {
                        what: line,
                        millis: timeout.as_millis() as u64,
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                return Err(Error::CommandFailed {
                    command: line,
                    message: format!("Failed to wait on process: {}", e),
                });
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
