//! Passing descriptors to attaching clients.
//!
//! The broker only needs two things from its transport: accept the next
//! client, and give that client copies of some descriptors. Both sit behind
//! traits so the broker runs the same over a Unix socket or in memory.

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{self, IoSlice, IoSliceMut, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

/// Most descriptors one handoff will carry.
pub const MAX_HANDOFF_FDS: usize = 3;

/// An attached client: sends input frames, receives descriptors.
pub trait Handoff: Read + Send + 'static {
    fn hand_off(&mut self, fds: &[RawFd]) -> io::Result<()>;
}

pub trait Listener {
    type Conn: Handoff;

    fn accept(&mut self) -> io::Result<Self::Conn>;
}

impl Listener for UnixListener {
    type Conn = UnixStream;

    fn accept(&mut self) -> io::Result<UnixStream> {
        UnixListener::accept(self).map(|(stream, _)| stream)
    }
}

impl Handoff for UnixStream {
    /// Sends the descriptors as `SCM_RIGHTS` on a single zero byte; a stream
    /// socket drops ancillary data sent with an empty payload.
    fn hand_off(&mut self, fds: &[RawFd]) -> io::Result<()> {
        let payload = [0u8; 1];
        let iov = [IoSlice::new(&payload)];
        let cmsgs = [ControlMessage::ScmRights(fds)];
        sendmsg::<()>(self.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
        Ok(())
    }
}

/// Receive one handoff from the daemon. Descriptors arrive close-on-exec.
pub fn receive_fds(stream: &UnixStream) -> io::Result<Vec<OwnedFd>> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut space = nix::cmsg_space!([RawFd; MAX_HANDOFF_FDS]);

    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    if msg.bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "daemon closed the connection before handing off",
        ));
    }

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: the kernel just installed these descriptors for us.
            fds.extend(received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    Ok(fds)
}

/// In-process transport for exercising the broker without sockets.
pub mod memory {
    use super::{Handoff, Listener};
    use crate::iodaemon::frame::{Input, write_frame};
    use crate::process::pipe;
    use std::fs::File;
    use std::io::{self, Read};
    use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::sync::{Arc, Mutex, PoisonError};

    type Handed = Arc<Mutex<Option<Vec<OwnedFd>>>>;

    pub struct MemoryConn {
        input: File,
        handed: Handed,
    }

    impl Read for MemoryConn {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Handoff for MemoryConn {
        /// Duplicates the descriptors, as the kernel would for a socket peer.
        fn hand_off(&mut self, fds: &[RawFd]) -> io::Result<()> {
            let copies = fds
                .iter()
                .map(|&fd| {
                    // SAFETY: the broker keeps these open for the duration of the call.
                    unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()
                })
                .collect::<io::Result<Vec<_>>>()?;
            *self.handed.lock().unwrap_or_else(PoisonError::into_inner) = Some(copies);
            Ok(())
        }
    }

    /// Client half of an in-memory connection.
    pub struct MemoryClient {
        input: File,
        handed: Handed,
    }

    impl MemoryClient {
        /// Descriptors handed over so far, if any.
        pub fn take_fds(&self) -> Option<Vec<OwnedFd>> {
            self.handed.lock().unwrap_or_else(PoisonError::into_inner).take()
        }

        pub fn send(&mut self, input: &Input) -> io::Result<()> {
            write_frame(&mut self.input, input).map_err(io::Error::from)
        }
    }

    pub struct MemoryListener {
        incoming: Receiver<MemoryConn>,
    }

    impl Listener for MemoryListener {
        type Conn = MemoryConn;

        fn accept(&mut self) -> io::Result<MemoryConn> {
            self.incoming.recv().map_err(|_| {
                io::Error::new(io::ErrorKind::ConnectionAborted, "all connectors dropped")
            })
        }
    }

    #[derive(Clone)]
    pub struct MemoryConnector {
        outgoing: Sender<MemoryConn>,
    }

    impl MemoryConnector {
        pub fn connect(&self) -> io::Result<MemoryClient> {
            let (reader, writer) = pipe()?;
            let handed = Handed::default();
            self.outgoing
                .send(MemoryConn {
                    input: reader,
                    handed: handed.clone(),
                })
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
            Ok(MemoryClient {
                input: writer,
                handed,
            })
        }
    }

    pub fn listener() -> (MemoryConnector, MemoryListener) {
        let (outgoing, incoming) = channel();
        (MemoryConnector { outgoing }, MemoryListener { incoming })
    }
}
