//! Message contract between the host and the line controller.
//!
//! ## Wire format
//!
//! ```ignore
//!  direction        | payload                 | terminator
//!  ---              | ---                     | ---
//!  controller→host  | DETECTED                | \n (a preceding \r is tolerated)
//!  host→controller  | label, e.g. Red / Green | \n
//! ```
//!
//! Inbound lines are UTF-8; bytes that do not decode are replaced and the
//! line is treated as noise. Only an exact, case-sensitive `DETECTED` (after
//! trimming surrounding whitespace) triggers an inspection.

use std::io;

use thiserror::Error;

mod line;
mod serial;

pub use line::{LineBuffer, MAX_LINE_BYTES};
pub use serial::SerialTriggerChannel;

/// Token sent by the controller when an object reaches the inspection point.
pub const DETECTED: &str = "DETECTED";

/// Interpretation of one inbound line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger<'a> {
    /// An object is in position.
    Detected,
    /// Blank line.
    Idle,
    /// Anything else; logged and ignored.
    Other(&'a str),
}

impl<'a> Trigger<'a> {
    pub fn parse(line: &'a str) -> Self {
        match line.trim() {
            "" => Trigger::Idle,
            DETECTED => Trigger::Detected,
            other => Trigger::Other(other),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Trigger::Detected => "detected",
            Trigger::Idle => "idle",
            Trigger::Other(_) => "other",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open serial port {port:?}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial port {port:?} closed")]
    Disconnected { port: String },
    #[error("serial port {port:?} I/O failed")]
    Io {
        port: String,
        #[source]
        source: io::Error,
    },
}

/// Bidirectional line channel to the controller.
pub trait TriggerChannel {
    /// Wait for the next complete line, up to the channel's read timeout.
    ///
    /// `Ok(None)` means the timeout elapsed without a full line; it is not an
    /// error.
    fn poll(&mut self) -> Result<Option<String>, ChannelError>;

    /// Write `message` followed by a newline.
    fn send(&mut self, message: &str) -> Result<(), ChannelError>;

    /// Drop everything received but not yet returned by [`poll`](Self::poll).
    fn discard_pending(&mut self) -> Result<(), ChannelError>;

    /// Close the underlying link and open it again after a failure.
    fn reopen(&mut self) -> Result<(), ChannelError>;
}

impl<T: TriggerChannel + ?Sized> TriggerChannel for Box<T> {
    fn poll(&mut self) -> Result<Option<String>, ChannelError> {
        (**self).poll()
    }

    fn send(&mut self, message: &str) -> Result<(), ChannelError> {
        (**self).send(message)
    }

    fn discard_pending(&mut self) -> Result<(), ChannelError> {
        (**self).discard_pending()
    }

    fn reopen(&mut self) -> Result<(), ChannelError> {
        (**self).reopen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_detected_triggers() {
        assert_eq!(Trigger::parse("DETECTED"), Trigger::Detected);
        assert_eq!(Trigger::parse("  DETECTED\r"), Trigger::Detected);
        assert_eq!(Trigger::parse("detected"), Trigger::Other("detected"));
        assert_eq!(Trigger::parse("DETECTED!"), Trigger::Other("DETECTED!"));
        assert_eq!(Trigger::parse("DETEC\u{FFFD}TED"), Trigger::Other("DETEC\u{FFFD}TED"));
        assert_eq!(Trigger::parse(""), Trigger::Idle);
        assert_eq!(Trigger::parse(" \t "), Trigger::Idle);
    }
}
