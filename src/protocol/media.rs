use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Media frame header size: PTS (8, opaque) + payload length (4, big-endian)
pub const HEADER_LEN: usize = 12;

/// One framed packet read from the video or audio socket.
///
/// The header is carried verbatim; the gateway never interprets the PTS
/// bytes, it only uses the length field to frame the payload.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub header: [u8; HEADER_LEN],
    pub payload: Bytes,
}

impl MediaPacket {
    /// Payload length as declared by the header
    pub fn declared_len(header: &[u8; HEADER_LEN]) -> usize {
        u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize
    }

    /// Header and payload as one contiguous buffer
    pub fn framed(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Read exactly one framed packet.
///
/// Both the header and the payload use full reads; a short read at any point
/// surfaces as an error, which ends the pump and the session.
pub async fn read_packet<R>(reader: &mut R) -> std::io::Result<MediaPacket>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = MediaPacket::declared_len(&header);
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(MediaPacket {
        header,
        payload: Bytes::from(payload),
    })
}
