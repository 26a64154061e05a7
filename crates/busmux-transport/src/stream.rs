use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::Result;

/// A connected bus stream: implements Read + Write.
///
/// The protocol layers only ever see bytes, so a Unix socket standing in for
/// a serial line and a TCP serial bridge behave identically.
pub struct BusStream {
    inner: BusStreamInner,
}

enum BusStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl Read for BusStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.read(buf),
            BusStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for BusStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.write(buf),
            BusStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.flush(),
            BusStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl BusStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: BusStreamInner::Unix(stream),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        // Frames are small and latency bound; never wait to coalesce them.
        let _ = stream.set_nodelay(true);
        Self {
            inner: BusStreamInner::Tcp(stream),
        }
    }

    /// Create a connected pair of in-process streams, one per bus end.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            BusStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            BusStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            BusStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(_) => "unix-domain-socket",
            BusStreamInner::Tcp(_) => "tcp",
        }
    }

    #[cfg(feature = "async")]
    pub(crate) fn into_parts(self) -> StreamParts {
        match self.inner {
            #[cfg(unix)]
            BusStreamInner::Unix(stream) => StreamParts::Unix(stream),
            BusStreamInner::Tcp(stream) => StreamParts::Tcp(stream),
        }
    }
}

#[cfg(feature = "async")]
pub(crate) enum StreamParts {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl std::fmt::Debug for BusStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusStream")
            .field("type", &self.transport_name())
            .finish()
    }
}
