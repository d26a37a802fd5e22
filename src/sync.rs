//! Host/container rendezvous over a pair of pipes.
//!
//! Container setup is a strict two-turn barrier: the host prepares the
//! environment (id maps) and signals, the container's init enters its
//! namespaces and signals back. [`Handshake`] tracks which turn we are on so
//! that a skipped step or a dead peer fails the creation instead of racing.

use crate::errors::SyncError;
use crate::process::pipe;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

/// Byte written for each turn. Anything else on the pipe is a protocol error.
const TURN: u8 = b'\n';

/// Something that can tell the peer its turn has come.
pub trait Signaller {
    fn signal(&mut self) -> Result<(), SyncError>;
}

/// Something that can block until the peer signals.
pub trait Waiter {
    fn wait(&mut self) -> Result<(), SyncError>;
}

/// One side of the pipe pair: reads the peer's signals, writes our own.
pub struct PipeSynchronizer {
    reader: File,
    writer: File,
}

/// Create connected synchronizers, `(host, container)`.
///
/// Both pipes are close-on-exec so the container's copy disappears once init
/// execs the workload.
pub fn pipe_pair() -> io::Result<(PipeSynchronizer, PipeSynchronizer)> {
    let (container_reader, host_writer) = pipe()?;
    let (host_reader, container_writer) = pipe()?;

    Ok((
        PipeSynchronizer {
            reader: host_reader,
            writer: host_writer,
        },
        PipeSynchronizer {
            reader: container_reader,
            writer: container_writer,
        },
    ))
}

impl PipeSynchronizer {
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.reader.as_raw_fd(), self.writer.as_raw_fd()]
    }
}

impl Signaller for PipeSynchronizer {
    fn signal(&mut self) -> Result<(), SyncError> {
        self.writer.write_all(&[TURN])?;
        Ok(())
    }
}

impl Waiter for PipeSynchronizer {
    fn wait(&mut self) -> Result<(), SyncError> {
        let mut byte = [0u8; 1];
        self.reader.read_exact(&mut byte)?;
        match byte[0] {
            TURN => Ok(()),
            other => Err(SyncError::UnexpectedSignal(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unsynced,
    HostSignaledReady,
    ContainerNamespacesEntered,
    Done,
    /// A signal failed; the setup attempt is over.
    Abandoned,
}

/// Phase machine for one container creation, usable from either side.
///
/// The host calls [`signal_ready`](Self::signal_ready) then
/// [`await_namespaces`](Self::await_namespaces); the container calls
/// [`await_ready`](Self::await_ready) then
/// [`signal_namespaces_entered`](Self::signal_namespaces_entered). Both
/// finish with [`finish`](Self::finish).
pub struct Handshake<C> {
    channel: C,
    phase: Phase,
}

impl<C: Signaller + Waiter> Handshake<C> {
    pub fn new(channel: C) -> Self {
        Handshake {
            channel,
            phase: Phase::Unsynced,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn signal_ready(&mut self) -> Result<(), SyncError> {
        self.advance(Phase::Unsynced, Phase::HostSignaledReady, C::signal)
    }

    pub fn await_ready(&mut self) -> Result<(), SyncError> {
        self.advance(Phase::Unsynced, Phase::HostSignaledReady, C::wait)
    }

    pub fn signal_namespaces_entered(&mut self) -> Result<(), SyncError> {
        self.advance(
            Phase::HostSignaledReady,
            Phase::ContainerNamespacesEntered,
            C::signal,
        )
    }

    pub fn await_namespaces(&mut self) -> Result<(), SyncError> {
        self.advance(
            Phase::HostSignaledReady,
            Phase::ContainerNamespacesEntered,
            C::wait,
        )
    }

    /// Close out the handshake, releasing the channel.
    pub fn finish(mut self) -> Result<C, SyncError> {
        self.advance(Phase::ContainerNamespacesEntered, Phase::Done, |_| Ok(()))?;
        Ok(self.channel)
    }

    fn advance(
        &mut self,
        expected: Phase,
        next: Phase,
        step: impl FnOnce(&mut C) -> Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        if self.phase != expected {
            return Err(SyncError::OutOfOrder {
                expected,
                found: self.phase,
            });
        }

        match step(&mut self.channel) {
            Ok(()) => {
                tracing::debug!(from = ?expected, to = ?next, "handshake advanced");
                self.phase = next;
                Ok(())
            }
            Err(err) => {
                self.phase = Phase::Abandoned;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use mockall::Sequence;
    use std::thread;
    use std::time::{Duration, Instant};

    mock! {
        Channel {}
        impl Signaller for Channel {
            fn signal(&mut self) -> Result<(), SyncError>;
        }
        impl Waiter for Channel {
            fn wait(&mut self) -> Result<(), SyncError>;
        }
    }

    #[test]
    fn test_host_side_signals_then_waits() {
        let mut seq = Sequence::new();
        let mut channel = MockChannel::new();
        channel
            .expect_signal()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        channel
            .expect_wait()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let mut handshake = Handshake::new(channel);
        handshake.signal_ready().unwrap();
        assert_eq!(handshake.phase(), Phase::HostSignaledReady);
        handshake.await_namespaces().unwrap();
        assert_eq!(handshake.phase(), Phase::ContainerNamespacesEntered);
        handshake.finish().unwrap();
    }

    #[test]
    fn test_phases_cannot_be_skipped() {
        let mut channel = MockChannel::new();
        channel.expect_signal().never();
        channel.expect_wait().never();

        let mut handshake = Handshake::new(channel);
        let err = handshake.signal_namespaces_entered().unwrap_err();

        assert!(matches!(
            err,
            SyncError::OutOfOrder {
                expected: Phase::HostSignaledReady,
                found: Phase::Unsynced,
            }
        ));
        assert_eq!(handshake.phase(), Phase::Unsynced);
    }

    #[test]
    fn test_failed_wait_abandons_handshake() {
        let mut channel = MockChannel::new();
        channel.expect_signal().times(1).returning(|| Ok(()));
        channel.expect_wait().times(1).returning(|| {
            Err(SyncError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer died",
            )))
        });

        let mut handshake = Handshake::new(channel);
        handshake.signal_ready().unwrap();
        assert!(matches!(
            handshake.await_namespaces(),
            Err(SyncError::Io(_))
        ));
        assert_eq!(handshake.phase(), Phase::Abandoned);
        assert!(handshake.finish().is_err());
    }

    #[test]
    fn test_finish_before_namespaces_fails() {
        let mut channel = MockChannel::new();
        channel.expect_signal().times(1).returning(|| Ok(()));

        let mut handshake = Handshake::new(channel);
        handshake.signal_ready().unwrap();

        assert!(matches!(
            handshake.finish(),
            Err(SyncError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_container_waits_for_delayed_host() {
        let (host, container) = pipe_pair().unwrap();
        let delay = Duration::from_millis(200);

        let host_thread = thread::spawn(move || {
            let mut handshake = Handshake::new(host);
            thread::sleep(delay);
            let signaled_at = Instant::now();
            handshake.signal_ready().unwrap();
            handshake.await_namespaces().unwrap();
            handshake.finish().unwrap();
            signaled_at
        });

        let mut handshake = Handshake::new(container);
        handshake.await_ready().unwrap();
        let proceeded_at = Instant::now();
        handshake.signal_namespaces_entered().unwrap();
        handshake.finish().unwrap();

        let signaled_at = host_thread.join().unwrap();
        assert!(proceeded_at >= signaled_at);
    }

    #[test]
    fn test_dead_peer_is_an_error() {
        let (host, container) = pipe_pair().unwrap();
        drop(host);

        let mut handshake = Handshake::new(container);
        let err = handshake.await_ready().unwrap_err();

        match err {
            SyncError::Io(err) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_garbage_byte_is_rejected() {
        let (host, mut container) = pipe_pair().unwrap();
        let PipeSynchronizer { mut writer, .. } = host;
        writer.write_all(b"x").unwrap();

        assert!(matches!(
            container.wait(),
            Err(SyncError::UnexpectedSignal(b'x'))
        ));
    }
}
