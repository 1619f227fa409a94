use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use sidechannel_protocol::{Frame, Intercept, Multiplexer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

/// A send that did not make it onto the wire. Never retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer is not connected")]
    PeerGone,

    #[error("send failed")]
    Io(#[source] io::Error),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::PeerGone,
            _ => TransportError::Io(err),
        }
    }
}

/// Write side of the host connection. One call is one packet, written and
/// flushed before it returns.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send_packet(&self, packet: Bytes) -> Result<(), TransportError>;

    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        self.send_packet(frame.encode()).await
    }
}

/// Length-delimited packets over any async writer.
pub struct FramedSink<W> {
    inner: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
}

impl<W: AsyncWrite + Unpin + Send> FramedSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(FramedWrite::new(writer, LengthDelimitedCodec::new())),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PacketSink for FramedSink<W> {
    async fn send_packet(&self, packet: Bytes) -> Result<(), TransportError> {
        let mut framed = self.inner.lock().await;
        // `send` flushes
        framed.send(packet).await?;
        Ok(())
    }
}

/// In-process sink backed by a channel. A dropped receiver is a gone peer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PacketSink for ChannelSink {
    async fn send_packet(&self, packet: Bytes) -> Result<(), TransportError> {
        self.tx.send(packet).map_err(|_| TransportError::PeerGone)
    }
}

/// Read packets off the host connection until it closes.
///
/// Every packet goes through the multiplexer first: frames addressed to this
/// side go to `on_frame`, everything else is forwarded unchanged to `host`,
/// the host protocol's own decoder.
pub async fn pump<R, F>(
    reader: R,
    mux: Multiplexer,
    host: mpsc::UnboundedSender<Bytes>,
    mut on_frame: F,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    F: FnMut(Frame),
{
    let mut packets = FramedRead::new(reader, LengthDelimitedCodec::new());
    while let Some(packet) = packets.next().await {
        let mut packet: BytesMut = packet?;
        match mux.intercept(&mut packet) {
            Intercept::Passthrough => {
                trace!(len = packet.len(), "host packet");
                if host.send(packet.freeze()).is_err() {
                    warn!("host decoder is gone, dropping host packet");
                }
            }
            Intercept::Consumed(frame) => on_frame(frame),
            // already logged by the multiplexer
            Intercept::Dropped(_) => {}
        }
    }
    debug!(inbound = ?mux.inbound(), "connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidechannel_protocol::envelope::write_var_int;
    use uuid::Uuid;

    fn host_packet(id: i32, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        write_var_int(&mut buf, id);
        buf.extend_from_slice(body);
        buf.freeze()
    }

    #[tokio::test]
    async fn pump_splits_host_packets_from_frames() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let sink = FramedSink::new(server_end);

        let instruction = Frame::Instruction {
            message: Bytes::from_static(b"{\"id\":\"ping\"}"),
            sender: Bytes::from_static(b"{}"),
        };
        let response = Frame::QueryResponse {
            request_id: Uuid::new_v4(),
            value: Bytes::from_static(b"1"),
        };
        sink.send_packet(host_packet(0x26, b"chunk")).await.unwrap();
        sink.send_frame(&instruction).await.unwrap();
        sink.send_frame(&response).await.unwrap();
        sink.send_packet(host_packet(3, b"chat")).await.unwrap();
        drop(sink);

        let (host_tx, mut host_rx) = mpsc::unbounded_channel();
        let mut frames = Vec::new();
        pump(client_end, Multiplexer::client(), host_tx, |f| frames.push(f))
            .await
            .unwrap();

        assert_eq!(frames, vec![instruction]);
        assert_eq!(host_rx.recv().await.unwrap(), host_packet(0x26, b"chunk"));
        // a response is for the server side, so the client hands it to the host untouched
        assert_eq!(host_rx.recv().await.unwrap(), response.encode());
        assert_eq!(host_rx.recv().await.unwrap(), host_packet(3, b"chat"));
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let sink = FramedSink::new(a);
        let err = sink.send_packet(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerGone), "got {err:?}");

        let (sink, rx) = ChannelSink::new();
        drop(rx);
        assert!(matches!(
            sink.send_packet(Bytes::new()).await,
            Err(TransportError::PeerGone)
        ));
    }
}
