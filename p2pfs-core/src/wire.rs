//! Record layer: each frame is bincode-encoded, sealed with the session key for
//! its direction, and sent as 4 bytes LE ciphertext length + ciphertext.

use bincode::Options;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::{decrypt_wire, encrypt_wire, WireCryptoError};
use crate::protocol::Frame;

pub(crate) const LEN_SIZE: usize = 4;
pub(crate) const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB
/// Poly1305 tag appended to every record.
const TAG_SIZE: usize = 16;
const MAX_RECORD_LEN: usize = MAX_FRAME_LEN as usize + TAG_SIZE;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_LEN as u64)
        .reject_trailing_bytes()
}

/// Encode a frame body (no length prefix; the record carries it).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    codec().serialize(frame).map_err(WireError::Encode)
}

/// Decode a buffer that must hold exactly one frame body.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    codec().deserialize(bytes).map_err(WireError::Decode)
}

/// Encode and seal `frame`, returning the bytes to put on the socket.
pub fn seal_record(key: &[u8; 32], nonce: u64, frame: &Frame) -> Result<Vec<u8>, WireError> {
    let cipher = encrypt_wire(key, nonce, &encode_frame(frame)?)?;
    let mut out = Vec::with_capacity(LEN_SIZE + cipher.len());
    out.extend_from_slice(&(cipher.len() as u32).to_le_bytes());
    out.extend_from_slice(&cipher);
    Ok(out)
}

pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &[u8; 32],
    nonce: u64,
    frame: &Frame,
) -> Result<(), WireError> {
    let record = seal_record(key, nonce, frame)?;
    writer.write_all(&record).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &[u8; 32],
    nonce: u64,
) -> Result<Frame, WireError> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Err(WireError::TooLarge(len));
    }
    let mut cipher = vec![0u8; len];
    reader.read_exact(&mut cipher).await?;
    let plain = decrypt_wire(key, nonce, &cipher)?;
    decode_frame(&plain)
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
    #[error("record of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("wire crypto: {0}")]
    Crypto(#[from] WireCryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FILE_SHARE_PROTOCOL;

    const KEY: [u8; 32] = [9u8; 32];

    fn sample_open() -> Frame {
        Frame::Open {
            stream: 1,
            protocol: FILE_SHARE_PROTOCOL.to_string(),
        }
    }

    #[test]
    fn body_has_no_length_prefix() {
        let frame = Frame::Close { stream: 7 };
        let body = encode_frame(&frame).unwrap();
        // variant index (u32) + stream id (u32)
        assert_eq!(body.len(), 8);
        assert_eq!(decode_frame(&body).unwrap(), frame);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut body = encode_frame(&sample_open()).unwrap();
        body.push(0);
        assert!(matches!(decode_frame(&body), Err(WireError::Decode(_))));
    }

    #[test]
    fn record_prefix_is_ciphertext_length() {
        let frame = sample_open();
        let record = seal_record(&KEY, 0, &frame).unwrap();
        let len = u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize;
        assert_eq!(len, record.len() - LEN_SIZE);
        assert_eq!(len, encode_frame(&frame).unwrap().len() + TAG_SIZE);
    }

    #[tokio::test]
    async fn records_in_sequence() {
        let a = sample_open();
        let b = Frame::Data {
            stream: 1,
            payload: vec![7u8; 300],
        };
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        write_record(&mut tx, &KEY, 0, &a).await.unwrap();
        write_record(&mut tx, &KEY, 1, &b).await.unwrap();
        assert_eq!(read_record(&mut rx, &KEY, 0).await.unwrap(), a);
        assert_eq!(read_record(&mut rx, &KEY, 1).await.unwrap(), b);
    }

    #[tokio::test]
    async fn wrong_nonce_or_tampering_fails() {
        let record = seal_record(&KEY, 3, &sample_open()).unwrap();
        let mut input = &record[..];
        assert!(matches!(
            read_record(&mut input, &KEY, 4).await,
            Err(WireError::Crypto(_))
        ));
        let mut tampered = record.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        let mut input = &tampered[..];
        assert!(matches!(
            read_record(&mut input, &KEY, 3).await,
            Err(WireError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let mut bytes = (MAX_RECORD_LEN as u32 + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        let mut input = &bytes[..];
        assert!(matches!(
            read_record(&mut input, &KEY, 0).await,
            Err(WireError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_record_is_io_error() {
        let record = seal_record(&KEY, 0, &sample_open()).unwrap();
        let mut input = &record[..record.len() - 1];
        assert!(matches!(
            read_record(&mut input, &KEY, 0).await,
            Err(WireError::Io(_))
        ));
    }
}
