use super::frame::{Input, write_frame};
use super::handoff::{MAX_HANDOFF_FDS, receive_fds};
use crate::errors::LinkError;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use tracing::debug;

const INPUT_CHUNK: usize = 32 * 1024;

/// A client attached to a running broker.
pub struct Link {
    conn: UnixStream,
    pub stdout: File,
    pub stderr: File,
    status: BufReader<File>,
}

impl Link {
    pub fn attach(socket_path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let conn = UnixStream::connect(socket_path)?;
        let fds = receive_fds(&conn)?;
        let found = fds.len();

        let Ok([stdout, stderr, status]) = <[_; MAX_HANDOFF_FDS]>::try_from(fds) else {
            return Err(LinkError::MissingDescriptors {
                expected: MAX_HANDOFF_FDS,
                found,
            });
        };

        Ok(Link {
            conn,
            stdout: stdout.into(),
            stderr: stderr.into(),
            status: BufReader::new(status.into()),
        })
    }

    pub fn send(&mut self, data: &[u8]) -> Result<(), LinkError> {
        write_frame(&mut self.conn, &Input::data(data))?;
        Ok(())
    }

    /// Close the process's input. Nothing may be sent afterwards.
    pub fn close_input(&mut self) -> Result<(), LinkError> {
        write_frame(&mut self.conn, &Input::eof())?;
        Ok(())
    }

    /// Block until the daemon publishes the exit status.
    ///
    /// Only one attached client receives the status line.
    pub fn exit_status(&mut self) -> Result<i32, LinkError> {
        let mut line = String::new();
        self.status.read_line(&mut line)?;
        let trimmed = line.trim();
        trimmed
            .parse()
            .map_err(|_| LinkError::InvalidStatus(trimmed.to_string()))
    }

    /// Wire this process's own stdio to the remote one and return its exit code.
    pub fn run(mut self) -> Result<i32, LinkError> {
        let stdout = self.stdout.try_clone()?;
        let stderr = self.stderr.try_clone()?;
        let out_pump = thread::spawn(move || pump(stdout, io::stdout()));
        let err_pump = thread::spawn(move || pump(stderr, io::stderr()));

        let conn = self.conn.try_clone()?;
        thread::spawn(move || forward_stdin(io::stdin(), conn));

        let code = self.exit_status()?;
        let _ = out_pump.join();
        let _ = err_pump.join();
        Ok(code)
    }
}

fn pump(mut from: File, mut to: impl Write) {
    // A tty master reports EIO once the terminal is gone; treat any error as EOF.
    if let Err(err) = io::copy(&mut from, &mut to) {
        debug!(%err, "output stream ended");
    }
    let _ = to.flush();
}

fn forward_stdin(mut from: impl Read, mut conn: UnixStream) {
    let mut buf = vec![0u8; INPUT_CHUNK];
    loop {
        let frame = match from.read(&mut buf) {
            Ok(0) => Input::eof(),
            Ok(n) => Input::data(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(%err, "reading stdin failed");
                Input::eof()
            }
        };

        let eof = frame.eof;
        if write_frame(&mut conn, &frame).is_err() || eof {
            return;
        }
    }
}
