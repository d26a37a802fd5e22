//! Launching one target process with either plain pipes or a pseudo-terminal
//! as its stdio.

use crate::errors::BrokerError;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::pty::{OpenptyResult, openpty};
use nix::unistd::{dup2, pipe2, setsid};
use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Status reported when a process's exit code cannot be determined.
pub const UNKNOWN_STATUS: i32 = 255;

/// What to run and how its stdio is wired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub tty: bool,
}

impl ProcessSpec {
    pub fn new(path: impl Into<String>, args: Vec<String>) -> Self {
        ProcessSpec {
            path: path.into(),
            args,
            tty: false,
        }
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Resolve `path` against `$PATH` the way a shell would.
    pub fn resolve(&self) -> Result<PathBuf, BrokerError> {
        lookup_path(&self.path).ok_or_else(|| BrokerError::ExecutableNotFound(self.path.clone()))
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Find an executable. Names containing a slash are used as given.
pub fn lookup_path(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Anonymous pipe, `(read end, write end)`, both close-on-exec.
pub fn pipe() -> io::Result<(File, File)> {
    let (reader, writer) = pipe2(OFlag::O_CLOEXEC)?;
    // SAFETY: both descriptors were just created and are owned by nobody else.
    unsafe { Ok((File::from_raw_fd(reader), File::from_raw_fd(writer))) }
}

/// Our ends of the target process's stdio.
pub struct ParentIo {
    /// Write side of the process's input.
    pub stdin: File,
    /// Read side of the process's output. With a tty this is the master.
    pub stdout: OwnedFd,
    /// Read side of the process's error output. With a tty, the same master.
    pub stderr: OwnedFd,
}

/// Build the command for `spec` with the child ends of its stdio attached.
///
/// The child ends live inside the returned `Command`, so dropping it after
/// spawning closes them in this process.
pub fn prepare(spec: &ProcessSpec, bin: &Path) -> io::Result<(Command, ParentIo)> {
    let mut cmd = Command::new(bin);
    cmd.arg0(&spec.path).args(&spec.args);

    let io = if spec.tty {
        let OpenptyResult { master, slave } = openpty(None, None)?;
        for fd in [&master, &slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }

        cmd.stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                setsid()?;
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        ParentIo {
            stdin: File::from(master.try_clone()?),
            stdout: master.try_clone()?,
            stderr: master,
        }
    } else {
        let (stdin_r, stdin_w) = pipe()?;
        let (stdout_r, stdout_w) = pipe()?;
        let (stderr_r, stderr_w) = pipe()?;

        cmd.stdin(Stdio::from(stdin_r))
            .stdout(Stdio::from(stdout_w))
            .stderr(Stdio::from(stderr_w));

        ParentIo {
            stdin: stdin_w,
            stdout: stdout_r.into(),
            stderr: stderr_r.into(),
        }
    };

    Ok((cmd, io))
}

/// Point our own stdin, stdout and stderr at /dev/null.
pub fn detach_stdio() -> io::Result<()> {
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}
