use crate::namespace::UserNamespace;
use crate::process::UNKNOWN_STATUS;
use crate::rootfs::enter_rootfs;
use crate::sync::{Handshake, PipeSynchronizer, pipe_pair};
use anyhow::{Context, Result};
use nix::sched::{CloneFlags, clone};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Gid, Pid, Uid, close, execvp, sethostname, setgid, setuid};
use std::env;
use std::ffi::{CString, NulError};
use std::os::fd::RawFd;
use std::path::PathBuf;
use tracing::{info, warn};

const STACK_SIZE: usize = 1024 * 1024; // 1MB stack

const CONTAINER_PATH: &str = "/bin:/sbin:/usr/bin:/usr/sbin";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub rootfs: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub hostname: String,
    /// `None` runs privileged, sharing the host's user namespace.
    pub user_namespace: Option<UserNamespace>,
}

impl RunConfig {
    fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS;
        if self.user_namespace.is_some() {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }
}

/// Clone the container's init into new namespaces, walk it through setup and
/// wait for it. Returns the container's exit code.
pub fn run_container(config: &RunConfig) -> Result<i32> {
    let (host, container) = pipe_pair().context("creating sync pipes")?;
    let host_fds = host.raw_fds();

    let mut stack = vec![0u8; STACK_SIZE];
    let mut container = Some(container);

    // The callback box, and with it the parent's copy of the container pipe
    // ends, is dropped as soon as clone returns.
    let child_pid = unsafe {
        clone(
            Box::new(move || match container.take() {
                Some(sync) => init_process(Handshake::new(sync), host_fds, config),
                None => 1,
            }),
            &mut stack,
            config.clone_flags(),
            Some(Signal::SIGCHLD as i32),
        )
    }
    .context("cloning container init")?;

    info!(pid = %child_pid, rootfs = ?config.rootfs, "container init cloned");

    if let Err(err) = prepare_host_side(Handshake::new(host), child_pid, config) {
        warn!(pid = %child_pid, "container setup failed, killing init");
        let _ = kill(child_pid, Signal::SIGKILL);
        let _ = waitpid(child_pid, None);
        return Err(err.context("container creation failed"));
    }

    info!(pid = %child_pid, "container ready");

    let code = match waitpid(child_pid, None)? {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => UNKNOWN_STATUS,
    };
    info!(pid = %child_pid, code, "container exited");
    Ok(code)
}

fn prepare_host_side(
    mut handshake: Handshake<PipeSynchronizer>,
    pid: Pid,
    config: &RunConfig,
) -> Result<()> {
    if let Some(userns) = &config.user_namespace {
        userns.apply(pid)?;
    }

    handshake.signal_ready().context("signalling container")?;
    handshake
        .await_namespaces()
        .context("waiting for container namespaces")?;
    handshake.finish()?;
    Ok(())
}

fn init_process(handshake: Handshake<PipeSynchronizer>, host_fds: [RawFd; 2], config: &RunConfig) -> isize {
    // Drop our copy of the host's ends so a dead host reads as EOF.
    for fd in host_fds {
        let _ = close(fd);
    }

    if let Err(err) = enter_container(handshake, config) {
        eprintln!("container init: {:#}", err);
        return 1;
    }

    exec_command(&config.command, &config.args)
}

fn enter_container(mut handshake: Handshake<PipeSynchronizer>, config: &RunConfig) -> Result<()> {
    handshake.await_ready().context("waiting for host")?;

    if config.user_namespace.is_some() {
        setgid(Gid::from_raw(0)).context("setgid")?;
        setuid(Uid::from_raw(0)).context("setuid")?;
    }

    sethostname(&config.hostname).context("sethostname")?;
    enter_rootfs(&config.rootfs)?;

    handshake
        .signal_namespaces_entered()
        .context("signalling host")?;
    handshake.finish()?;
    Ok(())
}

fn exec_args(command: &str, args: &[String]) -> Result<Vec<CString>, NulError> {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .map(CString::new)
        .collect()
}

fn exec_command(command: &str, args: &[String]) -> isize {
    let argv = match exec_args(command, args) {
        Ok(argv) => argv,
        Err(e) => {
            eprintln!("exec: invalid argument: {}", e);
            return 1;
        }
    };

    // Single threaded here: we are the freshly cloned init.
    unsafe { env::set_var("PATH", CONTAINER_PATH) };

    let Err(e) = execvp(&argv[0], &argv);
    eprintln!("exec {}: {}", command, e);
    1
}
