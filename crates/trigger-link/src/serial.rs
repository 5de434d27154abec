use std::{
    io::{self, Write},
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, trace};

use crate::{ChannelError, LineBuffer, TriggerChannel};

/// Trigger channel over a serial port, e.g. an Arduino on `/dev/ttyACM0`.
pub struct SerialTriggerChannel {
    name: String,
    baud_rate: u32,
    read_timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
    lines: LineBuffer,
}

impl SerialTriggerChannel {
    /// Open `port` at `baud_rate`; reads give up after `read_timeout`.
    pub fn open(port: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, ChannelError> {
        let handle = open_port(port, baud_rate, read_timeout)?;
        Ok(Self::with_port(port.to_string(), handle, baud_rate, read_timeout))
    }

    fn with_port(
        name: String,
        port: Box<dyn SerialPort>,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Self {
        Self {
            name,
            baud_rate,
            read_timeout,
            port: Some(port),
            lines: LineBuffer::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, ChannelError> {
        self.port.as_mut().ok_or_else(|| ChannelError::Disconnected {
            port: self.name.clone(),
        })
    }

    fn io_error(&self, source: io::Error) -> ChannelError {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            ChannelError::Disconnected {
                port: self.name.clone(),
            }
        } else {
            ChannelError::Io {
                port: self.name.clone(),
                source,
            }
        }
    }
}

impl TriggerChannel for SerialTriggerChannel {
    fn poll(&mut self) -> Result<Option<String>, ChannelError> {
        let Some(port) = self.port.as_mut() else {
            return Err(ChannelError::Disconnected {
                port: self.name.clone(),
            });
        };
        let deadline = Instant::now() + self.read_timeout;
        match self.lines.read_line(port, deadline) {
            Ok(line) => Ok(line),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn send(&mut self, message: &str) -> Result<(), ChannelError> {
        let mut payload = Vec::with_capacity(message.len() + 1);
        payload.extend_from_slice(message.as_bytes());
        payload.push(b'\n');
        let port = self.port()?;
        let written = port.write_all(&payload).and_then(|()| port.flush());
        written.map_err(|err| self.io_error(err))?;
        trace!("serial {} <- {message:?}", self.name);
        Ok(())
    }

    fn discard_pending(&mut self) -> Result<(), ChannelError> {
        let buffered = self.lines.len();
        self.lines.clear();
        let cleared = self.port()?.clear(ClearBuffer::Input);
        cleared.map_err(|err| self.io_error(err.into()))?;
        if buffered > 0 {
            debug!("serial {}: discarded {buffered} buffered byte(s)", self.name);
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), ChannelError> {
        // The old handle holds the device exclusively; release it first.
        self.port = None;
        self.lines.clear();
        self.port = Some(open_port(&self.name, self.baud_rate, self.read_timeout)?);
        Ok(())
    }
}

fn open_port(
    port: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, ChannelError> {
    let handle = serialport::new(port, baud_rate)
        .timeout(read_timeout)
        .open()
        .map_err(|source| ChannelError::Open {
            port: port.to_string(),
            source,
        })?;
    debug!("serial port {port} open at {baud_rate} baud (timeout {read_timeout:?})");
    Ok(handle)
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Read;

    use serialport::TTYPort;

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    /// Channel on the controller side of a pseudo-terminal pair, plus the
    /// device end standing in for the controller.
    fn channel_pair() -> (SerialTriggerChannel, TTYPort) {
        let (host, mut device) = TTYPort::pair().unwrap();
        device.set_timeout(Duration::from_secs(1)).unwrap();
        let mut host: Box<dyn SerialPort> = Box::new(host);
        host.set_timeout(TIMEOUT).unwrap();
        let channel = SerialTriggerChannel::with_port("pty".to_string(), host, 9600, TIMEOUT);
        (channel, device)
    }

    #[test]
    fn send_writes_newline_terminated_label() {
        let (mut channel, mut device) = channel_pair();
        channel.send("Red").unwrap();

        let mut received = [0u8; 4];
        device.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"Red\n");
    }

    #[test]
    fn poll_times_out_without_input() {
        let (mut channel, _device) = channel_pair();
        assert!(channel.poll().unwrap().is_none());
    }

    #[test]
    fn poll_returns_complete_line() {
        let (mut channel, mut device) = channel_pair();
        device.write_all(b"DETECTED\n").unwrap();
        device.flush().unwrap();
        assert_eq!(channel.poll().unwrap().as_deref(), Some("DETECTED"));
    }

    #[test]
    fn discard_pending_drops_partial_input() {
        let (mut channel, mut device) = channel_pair();
        device.write_all(b"DETEC").unwrap();
        device.flush().unwrap();
        assert!(channel.poll().unwrap().is_none());

        channel.discard_pending().unwrap();
        device.write_all(b"TED\nRed\n").unwrap();
        device.flush().unwrap();
        assert_eq!(channel.poll().unwrap().as_deref(), Some("TED"));
        assert_eq!(channel.poll().unwrap().as_deref(), Some("Red"));
    }

    #[test]
    fn end_of_stream_maps_to_disconnected() {
        let (channel, _device) = channel_pair();
        let err = channel.io_error(io::ErrorKind::UnexpectedEof.into());
        assert!(matches!(err, ChannelError::Disconnected { .. }));
        let err = channel.io_error(io::ErrorKind::BrokenPipe.into());
        assert!(matches!(err, ChannelError::Io { .. }));
    }

    #[test]
    fn failed_reopen_leaves_channel_disconnected() {
        let (host, _device) = TTYPort::pair().unwrap();
        let mut channel = SerialTriggerChannel::with_port(
            "/dev/nonexistent-inspection-tty".to_string(),
            Box::new(host),
            9600,
            TIMEOUT,
        );

        assert!(matches!(channel.reopen(), Err(ChannelError::Open { .. })));
        assert!(matches!(channel.poll(), Err(ChannelError::Disconnected { .. })));
        assert!(matches!(channel.send("Red"), Err(ChannelError::Disconnected { .. })));
    }
}
