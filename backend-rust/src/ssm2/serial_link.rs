//! Owns the raw serial handle. Byte-level I/O only; framing lives in `codec`.

use std::io;
use std::time::Duration;

/// Minimal transport seam so `SSM2Client` can run against a real port or a
/// scripted stub in tests.
pub trait SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Reads whatever is available right now into `buf`, returning the
    /// number of bytes read. Must not block past the port's configured
    /// read timeout.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn flush_input(&mut self) -> io::Result<()>;
}

pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32, read_timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(read_timeout)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Self { port })
    }
}

impl SerialTransport for SerialLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // A timeout with nothing to read is not an error here; the
            // caller polls again until its own deadline passes.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::collections::VecDeque;

    /// Scriptable transport for exercising `SSM2Client`/`read_chunked`
    /// without real hardware. Queued `replies` are returned byte-for-byte
    /// on each `read_available`; `fail_writes` lets tests simulate a dead
    /// link mid-request.
    #[derive(Default)]
    pub struct StubLink {
        pub inbound: VecDeque<u8>,
        pub written: Vec<u8>,
        pub fail_writes: bool,
    }

    impl StubLink {
        pub fn push_reply(&mut self, bytes: &[u8]) {
            self.inbound.extend(bytes.iter().copied());
        }
    }

    impl SerialTransport for StubLink {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stub write failure"));
            }
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }

        fn flush_input(&mut self) -> io::Result<()> {
            self.inbound.clear();
            Ok(())
        }
    }
}
