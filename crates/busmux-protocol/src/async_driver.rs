//! Tokio driver for [`MultiplexServer`].

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::info;

use busmux_frame::{MultiplexCodec, Received};

use crate::error::Result;
use crate::register::RegisterServer;
use crate::server::MultiplexServer;

/// Serve requests arriving on `stream` until it closes.
pub async fn serve_async<S, R>(
    server: &mut MultiplexServer,
    stream: S,
    registers: &mut R,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: RegisterServer + ?Sized,
{
    let codec = MultiplexCodec::new(server.options().buffer_size);
    let mut framed = Framed::new(stream, codec);

    while let Some(item) = framed.next().await {
        match item? {
            Received::Frame(frame) => {
                let reply = server
                    .process_frame(&frame, registers)
                    .map(Bytes::copy_from_slice);
                if let Some(reply) = reply {
                    let sent = framed.send(reply).await;
                    server.reply_sent();
                    sent?;
                }
            }
            Received::Rejected(err) => server.record_fault(&err),
            Received::Discarded(bytes) => server.record_discarded(&bytes),
        }
    }

    info!("bus stream closed");
    Ok(())
}
