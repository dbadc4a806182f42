//! Wire framing for the stream protocol
//!
//! Each frame is a 4-byte big-endian length header followed by exactly
//! that many bytes of JSON-encoded envelope. Frames over the configured
//! cap are rejected and the connection is closed; EOF at a frame
//! boundary is a clean close, EOF mid-frame is a protocol error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Default per-frame size cap (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Write one envelope frame and await the drain for backpressure
pub async fn write_frame<W>(
    writer: &mut W,
    envelope: &Envelope,
    max_frame_bytes: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > max_frame_bytes {
        return Err(Error::Protocol(format!(
            "outbound frame of {} bytes exceeds {} byte cap",
            payload.len(),
            max_frame_bytes
        )));
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one envelope frame.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > max_frame_bytes {
        return Err(Error::Protocol(format!(
            "inbound frame of {} bytes exceeds {} byte cap",
            length, max_frame_bytes
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Protocol("connection closed mid-frame".into())
        } else {
            Error::Io(e)
        }
    })?;

    let envelope: Envelope = serde_json::from_slice(&payload)
        .map_err(|e| Error::Protocol(format!("malformed envelope: {}", e)))?;
    envelope.validate()?;
    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{HMAC_SIZE, NONCE_SIZE, TAG_SIZE};

    fn sample_envelope() -> Envelope {
        Envelope {
            nonce: vec![1u8; NONCE_SIZE],
            ciphertext: vec![2u8; 48],
            tag: vec![3u8; TAG_SIZE],
            sequence: 9,
            key_id: "alice:bob".into(),
            hmac: vec![4u8; HMAC_SIZE],
        }
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let envelope = sample_envelope();
        write_frame(&mut client, &envelope, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();

        let read = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, envelope);
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let result = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(2 * 1024 * 1024u32).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_payload_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);

        let err = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn malformed_json_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let junk = b"{not json";
        client
            .write_all(&(junk.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(junk).await.unwrap();

        let err = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn oversized_outbound_frame_rejected() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut envelope = sample_envelope();
        envelope.ciphertext = vec![0u8; 600];

        let err = write_frame(&mut client, &envelope, 512).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
