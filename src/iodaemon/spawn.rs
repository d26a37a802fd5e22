use super::frame::read_frames;
use super::handoff::{Handoff, Listener};
use crate::errors::BrokerError;
use crate::process::{ParentIo, ProcessSpec, UNKNOWN_STATUS, pipe, prepare};
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

type StartedHook = Box<dyn FnOnce(u32) + Send>;
type ExitHook = Box<dyn FnOnce(i32) + Send>;

/// Create the socket's directory and bind it.
pub fn listen(socket_path: &Path) -> Result<UnixListener, BrokerError> {
    let listen_error = |source| BrokerError::Listen {
        path: socket_path.to_path_buf(),
        source,
    };

    if let Some(dir) = socket_path.parent() {
        fs::create_dir_all(dir).map_err(listen_error)?;
    }
    UnixListener::bind(socket_path).map_err(listen_error)
}

/// Runs one process and lets any number of clients attach to its stdio.
///
/// Every accepted connection is handed the read ends of stdout, stderr and
/// the status stream, then its input frames are relayed to stdin on a
/// thread of its own. The first connection starts the process; later ones
/// only attach.
pub struct Broker<L> {
    listener: L,
    pending: Option<Command>,
    stdin: Arc<Mutex<Option<File>>>,
    stdout: OwnedFd,
    stderr: OwnedFd,
    status_reader: OwnedFd,
    status_writer: Option<File>,
    on_started: Option<StartedHook>,
    on_exit: Option<ExitHook>,
}

impl<L: Listener> Broker<L> {
    /// Resolve the executable and allocate its stdio; nothing runs yet.
    pub fn new(listener: L, spec: &ProcessSpec) -> Result<Self, BrokerError> {
        let bin = spec.resolve()?;
        let (cmd, ParentIo { stdin, stdout, stderr }) =
            prepare(spec, &bin).map_err(BrokerError::Stdio)?;
        let (status_reader, status_writer) = pipe().map_err(BrokerError::Stdio)?;

        Ok(Broker {
            listener,
            pending: Some(cmd),
            stdin: Arc::new(Mutex::new(Some(stdin))),
            stdout,
            stderr,
            status_reader: status_reader.into(),
            status_writer: Some(status_writer),
            on_started: None,
            on_exit: None,
        })
    }

    /// Called with the pid once the process has been started.
    pub fn on_started(mut self, hook: impl FnOnce(u32) + Send + 'static) -> Self {
        self.on_started = Some(Box::new(hook));
        self
    }

    /// Called once the exit status has been published.
    pub fn on_exit(mut self, hook: impl FnOnce(i32) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(hook));
        self
    }

    pub fn is_started(&self) -> bool {
        self.pending.is_none()
    }

    /// Accept connections until accepting fails.
    pub fn serve(mut self) -> Result<(), BrokerError> {
        loop {
            let conn = self.listener.accept().map_err(BrokerError::Accept)?;
            self.attach(conn)?;
        }
    }

    /// Hand the streams to one client, start the process if this is the
    /// first, and relay the client's input in the background.
    ///
    /// Only a failure to start the process is returned; a broken client is
    /// dropped.
    pub fn attach(&mut self, mut conn: L::Conn) -> Result<(), BrokerError> {
        let fds = [
            self.stdout.as_raw_fd(),
            self.stderr.as_raw_fd(),
            self.status_reader.as_raw_fd(),
        ];
        if let Err(err) = conn.hand_off(&fds) {
            warn!(%err, "failed to hand off streams, dropping client");
            return Ok(());
        }

        if let Some(cmd) = self.pending.take() {
            self.start(cmd)?;
        }

        let stdin = self.stdin.clone();
        thread::spawn(move || relay_input(conn, stdin));
        Ok(())
    }

    fn start(&mut self, mut cmd: Command) -> Result<(), BrokerError> {
        let child = cmd.spawn().map_err(BrokerError::Start)?;
        // Closes the child's ends of the pipes (or the tty) in this process.
        drop(cmd);

        let pid = child.id();
        info!(pid, "process started");

        if let Some(status_writer) = self.status_writer.take() {
            let on_exit = self.on_exit.take();
            thread::spawn(move || report_exit(child, status_writer, on_exit));
        }

        if let Some(hook) = self.on_started.take() {
            hook(pid);
        }
        Ok(())
    }
}

/// Sole owner of the child: wait for it and publish its status once.
fn report_exit(mut child: Child, mut status_writer: File, on_exit: Option<ExitHook>) {
    let code = match child.wait() {
        Ok(status) => status.code().unwrap_or(UNKNOWN_STATUS),
        Err(err) => {
            warn!(%err, "failed to wait for process");
            UNKNOWN_STATUS
        }
    };
    info!(pid = child.id(), code, "process exited");

    if let Err(err) = writeln!(status_writer, "{}", code) {
        warn!(%err, "failed to write exit status");
    }
    drop(status_writer);

    if let Some(hook) = on_exit {
        hook(code);
    }
}

/// Forward one client's frames to the shared stdin until the client stops,
/// sends garbage, or stdin breaks. Only this client is affected.
fn relay_input<C: Handoff>(conn: C, stdin: Arc<Mutex<Option<File>>>) {
    for frame in read_frames(conn) {
        let input = match frame {
            Ok(input) => input,
            Err(err) => {
                if !err.is_eof() {
                    debug!(%err, "undecodable frame, closing client");
                }
                break;
            }
        };

        let mut stdin = stdin.lock().unwrap_or_else(PoisonError::into_inner);
        let result = if input.eof {
            close_stdin(stdin.take())
        } else {
            match stdin.as_mut() {
                Some(writer) => writer.write_all(&input.data),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed")),
            }
        };

        if let Err(err) = result {
            debug!(%err, "stdin relay failed, closing client");
            break;
        }
    }
}

fn close_stdin(stdin: Option<File>) -> io::Result<()> {
    let stdin = stdin
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"))?;
    nix::unistd::close(stdin.into_raw_fd())?;
    Ok(())
}
