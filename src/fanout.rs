use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Returned (inside an `io::Error` of kind `BrokenPipe`) for writes after [`FanoutWriter::close`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("write after close")]
pub struct WriteAfterClose;

pub type Sink = Box<dyn Write + Send>;

#[derive(Default)]
struct Sinks {
    sinks: Vec<Sink>,
    closed: bool,
}

/// Copies every write to all attached sinks.
///
/// Sinks are best effort: an error from one sink is dropped and the write
/// still reports the full length, so a dead consumer never stalls the
/// producer. Sinks attached later only see data written after they joined.
#[derive(Default)]
pub struct FanoutWriter {
    state: Mutex<Sinks>,
}

impl FanoutWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Sinks> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, WriteAfterClose));
        }

        for sink in state.sinks.iter_mut() {
            if let Err(err) = sink.write_all(data) {
                tracing::trace!(%err, "dropping write to fanout sink");
            }
        }

        Ok(data.len())
    }

    /// Attach a sink. Returns false, dropping the sink, if already closed.
    pub fn add_sink(&self, sink: Sink) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.sinks.push(sink);
        true
    }

    /// Reject further writes and release every sink.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.sinks.clear();
    }

    pub fn sink_count(&self) -> usize {
        self.lock().sinks.len()
    }
}

impl Write for &FanoutWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        FanoutWriter::write(*self, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
