//! Tokio flavour of [`BusStream`](crate::BusStream).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::{BusStream, StreamParts};

/// A connected bus stream driven by the tokio reactor.
#[derive(Debug)]
pub enum AsyncBusStream {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

/// Connect to a listening endpoint from inside a tokio runtime.
pub async fn connect_async(endpoint: &Endpoint) -> Result<AsyncBusStream> {
    let connect_err = |source| TransportError::Connect {
        endpoint: endpoint.to_string(),
        source,
    };
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => tokio::net::UnixStream::connect(path)
            .await
            .map(AsyncBusStream::Unix)
            .map_err(connect_err),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(TransportError::Unsupported(endpoint.to_string())),
        Endpoint::Tcp(addr) => {
            let stream = tokio::net::TcpStream::connect(addr.as_str())
                .await
                .map_err(connect_err)?;
            let _ = stream.set_nodelay(true);
            Ok(AsyncBusStream::Tcp(stream))
        }
    }
}

impl BusStream {
    /// Move a blocking stream onto the tokio reactor.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn into_async(self) -> Result<AsyncBusStream> {
        match self.into_parts() {
            #[cfg(unix)]
            StreamParts::Unix(stream) => {
                stream.set_nonblocking(true)?;
                Ok(AsyncBusStream::Unix(tokio::net::UnixStream::from_std(
                    stream,
                )?))
            }
            StreamParts::Tcp(stream) => {
                stream.set_nonblocking(true)?;
                Ok(AsyncBusStream::Tcp(tokio::net::TcpStream::from_std(stream)?))
            }
        }
    }
}

impl AsyncRead for AsyncBusStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            AsyncBusStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            AsyncBusStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncBusStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            AsyncBusStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            AsyncBusStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            AsyncBusStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            AsyncBusStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            AsyncBusStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            AsyncBusStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
