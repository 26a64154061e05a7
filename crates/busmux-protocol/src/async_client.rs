//! Tokio flavour of the protocol client.

use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use busmux_frame::{Frame, MultiplexCodec, Received};

use crate::client::{check_request, validate_reply, ClientOptions, RequestBuilder};
use crate::error::{ClientError, ClientResult};
use crate::reply::Reply;
use crate::stats::Stats;

/// Async client over a `Framed` stream. Taking `&mut self` keeps at most
/// one request outstanding.
pub struct AsyncMultiplexClient<S> {
    framed: Framed<S, MultiplexCodec>,
    options: ClientOptions,
    /// Set after a timeout: the abandoned reply may still arrive.
    stale: bool,
    stats: Stats,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncMultiplexClient<S> {
    pub fn new(stream: S, options: ClientOptions) -> Self {
        let codec = MultiplexCodec::new(options.buffer_size);
        Self {
            framed: Framed::new(stream, codec),
            options,
            stale: false,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Send without asking for a reply.
    pub async fn send(&mut self, destination: u8, payload: &[u8]) -> ClientResult<()> {
        check_request(&self.options, destination, payload)?;
        let frame = Frame::new(self.options.source_id, destination, Bytes::copy_from_slice(payload));
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Send with the response flag set and wait up to `reply_timeout`.
    ///
    /// Frames that arrived after an earlier timeout are dropped before
    /// sending; one still in flight can be taken for this reply.
    pub async fn request(&mut self, destination: u8, payload: &[u8]) -> ClientResult<Frame> {
        check_request(&self.options, destination, payload)?;
        if self.stale {
            self.drop_late_frames();
        }
        let source_id = self.options.source_id;
        let frame = Frame::new(source_id, destination, Bytes::copy_from_slice(payload))
            .with_response_requested();
        self.framed.send(frame).await?;

        let framed = &mut self.framed;
        let wait = async move {
            while let Some(item) = framed.next().await {
                match item {
                    Ok(Received::Frame(frame))
                        if frame.source_id == destination && frame.destination_id == source_id =>
                    {
                        return Ok(frame);
                    }
                    Ok(Received::Frame(frame)) => {
                        debug!(source = frame.source_id, "skipping unrelated frame");
                    }
                    Ok(Received::Rejected(err)) => debug!(error = %err, "skipping damaged frame"),
                    Ok(Received::Discarded(bytes)) => debug!(len = bytes.len(), "skipping line noise"),
                    Err(err) => return Err(ClientError::from(err)),
                }
            }
            Err(ClientError::Disconnected("end of stream".into()))
        };
        match tokio::time::timeout(self.options.reply_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.stale = true;
                Err(ClientError::Timeout(self.options.reply_timeout))
            }
        }
    }

    fn drop_late_frames(&mut self) {
        while let Some(Some(item)) = self.framed.next().now_or_never() {
            if let Ok(Received::Frame(frame)) = item {
                debug!(source = frame.source_id, "dropping late frame");
            }
        }
        self.stale = false;
    }

    pub async fn query(&mut self, destination: u8, request: &RequestBuilder) -> ClientResult<Reply> {
        let frame = self.request(destination, request.payload()).await?;
        validate_reply(request, &frame.payload, &mut self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use busmux_frame::{encode_frame, FrameDecoder};

    use super::*;
    use crate::async_driver::serve_async;
    use crate::register::RegisterBank;
    use crate::server::{MultiplexServer, ServerOptions};
    use crate::value::{Value, ValueKind};

    #[tokio::test]
    async fn query_against_async_server() {
        let (client_io, node_io) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            let mut server = MultiplexServer::new(ServerOptions::default()).unwrap();
            let mut bank = RegisterBank::new();
            bank.define(1, 0i32);
            serve_async(&mut server, node_io, &mut bank).await.unwrap();
            bank
        });

        let mut client = AsyncMultiplexClient::new(client_io, ClientOptions::default());
        let write = RequestBuilder::new().write_single(1, 77i32);
        client.query(1, &write).await.unwrap();

        let read = RequestBuilder::new().read_single(1, ValueKind::Int32);
        let reply = client.query(1, &read).await.unwrap();
        assert_eq!(reply.read_result(1), Some(Ok(Value::Int32(77))));

        drop(client);
        let bank = task.await.unwrap();
        assert_eq!(bank.get(1), Some(Value::Int32(77)));
    }

    #[tokio::test]
    async fn silent_node_times_out() {
        let (client_io, _node_io) = tokio::io::duplex(1024);
        let options = ClientOptions {
            reply_timeout: Duration::from_millis(20),
            ..ClientOptions::default()
        };
        let mut client = AsyncMultiplexClient::new(client_io, options);
        assert!(matches!(
            client.request(4, &[]).await,
            Err(ClientError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn reply_arriving_after_timeout_is_dropped() {
        let (client_io, mut node_io) = tokio::io::duplex(1024);
        let options = ClientOptions {
            reply_timeout: Duration::from_millis(200),
            ..ClientOptions::default()
        };
        let mut client = AsyncMultiplexClient::new(client_io, options);
        let first = RequestBuilder::new().read_single(1, ValueKind::Int8);
        assert!(matches!(
            client.query(4, &first).await,
            Err(ClientError::Timeout(_))
        ));

        let mut late = BytesMut::new();
        encode_frame(4, false, 0, &[0x20, 0x01, 11], &mut late).unwrap();
        node_io.write_all(&late).await.unwrap();
        let node = tokio::spawn(async move {
            // the timed-out request, then the one to answer
            let mut rx = BytesMut::new();
            let mut decoder = FrameDecoder::new(256);
            let mut requests = 0;
            while requests < 2 {
                if decoder.decode(&mut rx).unwrap().is_some() {
                    requests += 1;
                    continue;
                }
                let mut chunk = [0u8; 64];
                let n = node_io.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed early");
                rx.extend_from_slice(&chunk[..n]);
            }
            let mut fresh = BytesMut::new();
            encode_frame(4, false, 0, &[0x20, 0x02, 22], &mut fresh).unwrap();
            node_io.write_all(&fresh).await.unwrap();
            node_io
        });

        let second = RequestBuilder::new().read_single(2, ValueKind::Int8);
        let reply = client.query(4, &second).await.unwrap();
        assert_eq!(reply.read_result(2), Some(Ok(Value::Int8(22))));
        drop(node.await.unwrap());
    }
}
