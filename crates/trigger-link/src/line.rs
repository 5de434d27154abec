use std::{
    io::{self, Read},
    time::Instant,
};

use tracing::warn;

/// Longest line kept while waiting for a terminator. A controller spewing
/// bytes without newlines is noise, not a trigger.
pub const MAX_LINE_BYTES: usize = 1024;

const READ_CHUNK: usize = 256;

/// Assembles newline-terminated lines from a reader with a read timeout.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next complete line, reading more input as needed.
    ///
    /// A reader timeout, or `deadline` passing while bytes trickle in without
    /// a terminator, yields `Ok(None)` and keeps any partial line for the next
    /// call. A reader at end of stream yields `UnexpectedEof`.
    pub fn read_line<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        deadline: Instant,
    ) -> io::Result<Option<String>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            match reader.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    self.enforce_limit();
                    if Instant::now() >= deadline {
                        return Ok(self.take_line());
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    return Ok(None);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Bytes buffered without a terminator yet.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn enforce_limit(&mut self) {
        if self.pending.len() > MAX_LINE_BYTES && !self.pending.contains(&b'\n') {
            warn!(
                "discarding {} byte(s) of unterminated serial input",
                self.pending.len()
            );
            self.pending.clear();
        }
    }
}
