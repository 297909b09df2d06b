use super::{TelemetryTransport, TransportError};
use serialport::{ClearBuffer, SerialPort};
use std::{io::Read, time::Duration};
use tracing::{info, warn};

/// Anything longer than this without a newline is not a telemetry frame.
const MAX_LINE_LENGTH: usize = 1024;

/// Splits a byte stream into newline terminated lines.
#[derive(Debug, Default)]
struct LineFramer {
    rx_buffer: Vec<u8>,
}

impl LineFramer {
    fn has_line(&self) -> bool {
        self.rx_buffer.contains(&b'\n')
    }

    fn push(&mut self, bytes: &[u8]) {
        self.rx_buffer.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        match self.rx_buffer.iter().position(|b| *b == b'\n') {
            Some(end) => {
                let mut line: Vec<u8> = self.rx_buffer.drain(..=end).collect();
                line.pop();
                Some(line)
            }
            None => {
                if self.rx_buffer.len() > MAX_LINE_LENGTH {
                    warn!(
                        "Discarding {} bytes of serial data with no line ending",
                        self.rx_buffer.len()
                    );
                    self.rx_buffer.clear();
                }
                None
            }
        }
    }
}

pub(crate) struct SerialTransport {
    port: Box<dyn SerialPort>,
    framer: LineFramer,
}

impl SerialTransport {
    pub(crate) fn open(port: &str, baud: u32) -> Result<Self, TransportError> {
        let serial = serialport::new(port, baud)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|source| TransportError::Open {
                port: port.to_owned(),
                source,
            })?;

        // Whatever is waiting was sent before we were listening and is likely a partial frame
        serial.clear(ClearBuffer::Input)?;

        info!("{} is flushed and open at {} baud", port, baud);

        Ok(Self {
            port: serial,
            framer: LineFramer::default(),
        })
    }
}

impl TelemetryTransport for SerialTransport {
    fn data_available(&mut self) -> Result<bool, TransportError> {
        Ok(self.framer.has_line() || self.port.bytes_to_read()? > 0)
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.framer.has_line() {
            let available = usize::try_from(self.port.bytes_to_read()?).unwrap_or(MAX_LINE_LENGTH);

            if available > 0 {
                let mut chunk = vec![0u8; available.min(MAX_LINE_LENGTH)];
                let n = self.port.read(&mut chunk)?;
                self.framer.push(&chunk[..n]);
            }
        }

        Ok(self.framer.next_line())
    }
}
