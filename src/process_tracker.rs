//! In-process variant of the broker: one process, output fanned out to any
//! number of sinks attached while it runs.

use crate::errors::BrokerError;
use crate::fanout::{FanoutWriter, Sink};
use crate::process::{ParentIo, ProcessSpec, UNKNOWN_STATUS, prepare};
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

#[derive(Default)]
struct ExitStatus {
    code: Mutex<Option<i32>>,
    published: Condvar,
}

pub struct ProcessTracker {
    pid: u32,
    stdin: Mutex<Option<File>>,
    stdout: Arc<FanoutWriter>,
    stderr: Arc<FanoutWriter>,
    status: Arc<ExitStatus>,
}

impl ProcessTracker {
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, BrokerError> {
        let bin = spec.resolve()?;
        let (mut cmd, ParentIo { stdin, stdout, stderr }) =
            prepare(spec, &bin).map_err(BrokerError::Stdio)?;
        let mut child = cmd.spawn().map_err(BrokerError::Start)?;
        drop(cmd);

        let pid = child.id();
        info!(pid, path = %spec.path, "tracking process");

        let stdout_fanout = Arc::new(FanoutWriter::new());
        let stderr_fanout = Arc::new(FanoutWriter::new());

        let mut pumps = vec![start_pump(File::from(stdout), stdout_fanout.clone())];
        if spec.tty {
            // Same master as stdout; one reader is enough.
            drop(stderr);
            stderr_fanout.close();
        } else {
            pumps.push(start_pump(File::from(stderr), stderr_fanout.clone()));
        }

        let status = Arc::new(ExitStatus::default());
        let publish = status.clone();
        thread::spawn(move || {
            let code = match child.wait() {
                Ok(exit) => exit.code().unwrap_or(UNKNOWN_STATUS),
                Err(_) => UNKNOWN_STATUS,
            };
            // Status goes out only after all output has been delivered.
            for pump in pumps {
                let _ = pump.join();
            }
            debug!(pid, code, "tracked process exited");

            *lock(&publish.code) = Some(code);
            publish.published.notify_all();
        });

        Ok(ProcessTracker {
            pid,
            stdin: Mutex::new(Some(stdin)),
            stdout: stdout_fanout,
            stderr: stderr_fanout,
            status,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Receive output from now on. Returns false once output has ended.
    pub fn attach(&self, stdout: Sink, stderr: Sink) -> bool {
        let attached = self.stdout.add_sink(stdout);
        self.stderr.add_sink(stderr);
        attached
    }

    pub fn write_stdin(&self, data: &[u8]) -> io::Result<()> {
        match lock(&self.stdin).as_mut() {
            Some(stdin) => stdin.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed")),
        }
    }

    pub fn close_stdin(&self) {
        lock(&self.stdin).take();
    }

    pub fn exit_status(&self) -> Option<i32> {
        *lock(&self.status.code)
    }

    /// Block until the process has exited and its output is drained.
    pub fn wait(&self) -> i32 {
        let mut code = lock(&self.status.code);
        loop {
            if let Some(code) = *code {
                return code;
            }
            code = self
                .status
                .published
                .wait(code)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start_pump(mut from: File, to: Arc<FanoutWriter>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match from.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = to.write(&buf[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // EIO from a tty master whose slave closed.
                Err(_) => break,
            }
        }
        to.close();
    })
}
