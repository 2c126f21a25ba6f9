use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::media;
use crate::session::{MediaStream, Session, SharedReceiver};
use std::sync::Arc;

/// How a media sink wants its packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 12-byte header followed by the payload
    Framed,

    /// Payload bytes only ("stripheader")
    PayloadOnly,
}

impl Framing {
    pub fn from_stripheader(strip: bool) -> Self {
        if strip {
            Framing::PayloadOnly
        } else {
            Framing::Framed
        }
    }

    fn chunk(self, packet: media::MediaPacket) -> Bytes {
        match self {
            Framing::Framed => packet.framed(),
            Framing::PayloadOnly => packet.payload,
        }
    }
}

/// Why a pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The device side errored or reached EOF
    Source,

    /// The sink went away; the session should be torn down
    Sink,

    /// The session was torn down underneath us
    Cancelled,
}

/// Forward framed packets from `reader` into a chunk channel until either
/// side gives up. Each packet is read and forwarded atomically as one
/// (header, payload) pair.
pub async fn pump_packets<R>(
    mut reader: R,
    cancel: CancellationToken,
    framing: Framing,
    tx: mpsc::Sender<Bytes>,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
{
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return PumpEnd::Cancelled,
            result = media::read_packet(&mut reader) => match result {
                Ok(packet) => packet,
                Err(_) => return PumpEnd::Source,
            },
        };

        if tx.send(framing.chunk(packet)).await.is_err() {
            return PumpEnd::Sink;
        }
    }
}

/// Forward framed packets from `reader` straight into an outbound writer
pub async fn pump_to_writer<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
    framing: Framing,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return PumpEnd::Cancelled,
            result = media::read_packet(&mut reader) => match result {
                Ok(packet) => packet,
                Err(_) => return PumpEnd::Source,
            },
        };

        if writer.write_all(&framing.chunk(packet)).await.is_err() {
            return PumpEnd::Sink;
        }
    }
}

/// Spawn an HTTP body pump for a connected media stream. The returned
/// receiver backs the response body; the client disappearing is the pump's
/// write error and requests a best-effort teardown.
pub fn spawn_body_pump(
    session: Arc<Session>,
    media: MediaStream,
    framing: Framing,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let end = pump_packets(media.stream, media.cancel, framing, tx).await;
        debug!(port = session.port, ?end, "HTTP media pump finished");
        if end == PumpEnd::Sink {
            session.request_disconnect();
        }
    });

    rx
}

/// Spawn a detached pump into a caller-supplied outbound socket
/// (`network`/`address` request). Runs until either side errors.
pub fn spawn_raw_pump<W>(session: Arc<Session>, media: MediaStream, framing: Framing, writer: W)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let end = pump_to_writer(media.stream, writer, media.cancel, framing).await;
        debug!(port = session.port, ?end, "Raw media pump finished");
        if end == PumpEnd::Sink {
            session.request_disconnect();
        }
    });
}

/// Dial the outbound sink for a `network`/`address` stream request
pub async fn dial_raw(
    network: &str,
    address: &str,
) -> std::io::Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match network {
        "tcp" | "tcp4" | "tcp6" => {
            let socket = tokio::net::TcpStream::connect(address).await?;
            Ok(Box::new(socket))
        }
        #[cfg(unix)]
        "unix" => {
            let socket = tokio::net::UnixStream::connect(address).await?;
            Ok(Box::new(socket))
        }
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "unsupported network",
        )),
    }
}

/// Spawn a pump turning channel lines (clipboard, UHID output) into
/// newline-terminated body chunks
pub fn spawn_line_pump(source: SharedReceiver<String>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            let line = {
                let mut guard = source.lock().await;
                guard.recv().await
            };

            let Some(mut line) = line else { return };
            line.push('\n');

            if tx.send(Bytes::from(line)).await.is_err() {
                return;
            }
        }
    });

    rx
}
