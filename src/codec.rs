//! BER-frame reading and LDAP message decode/encode.
//!
//! `read_frame` isolates exactly one length-delimited BER TLV from an
//! `AsyncRead` stream, coalescing across however many short reads the
//! underlying socket happens to deliver. Decoding the isolated bytes into a
//! structural [`LdapMsg`] is then delegated to `ldap3_proto`'s own BER
//! codec, the same one the teacher proxy already depends on — this module
//! only owns the framing discipline, not the ASN.1 tree.

use bytes::BytesMut;
use ldap3_proto::proto::LdapMsg;
use ldap3_proto::LdapCodec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;

/// Long-form BER lengths with more than this many length octets cannot fit
/// a 64-bit byte count and are rejected as malformed.
const MAX_LENGTH_OCTETS: usize = 8;

/// Reads one complete BER frame (tag + length octets + content octets) from
/// `stream`. Driven by "bytes remaining", not by how many bytes a single
/// `read()` call happens to return — this is the direct fix for the
/// documented bug where large server replies arriving over several reads
/// were truncated after the first one.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<BytesMut, FrameError> {
    let mut buf = BytesMut::with_capacity(1024);

    let mut one = [0u8; 1];
    match stream.read(&mut one).await? {
        0 => return Err(FrameError::Closed),
        _ => buf.extend_from_slice(&one),
    }

    read_more(stream, &mut buf, 1).await?;
    let first_len_byte = buf[buf.len() - 1];

    let content_len: usize = if first_len_byte & 0x80 == 0 {
        first_len_byte as usize
    } else {
        let n_octets = (first_len_byte & 0x7f) as usize;
        if n_octets == 0 || n_octets > MAX_LENGTH_OCTETS {
            // n_octets == 0 is the reserved indefinite-length form, which
            // the LDAP ASN.1 module never produces.
            return Err(FrameError::Malformed);
        }
        read_more(stream, &mut buf, n_octets).await?;
        let len_bytes = &buf[buf.len() - n_octets..];
        let mut v: u64 = 0;
        for b in len_bytes {
            v = (v << 8) | u64::from(*b);
        }
        usize::try_from(v).map_err(|_| FrameError::Malformed)?
    };

    read_more(stream, &mut buf, content_len).await?;

    Ok(buf)
}

/// Reads `remaining` more bytes into `buf`, returning `Truncated` on EOF
/// before they all arrive.
async fn read_more<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut BytesMut,
    remaining: usize,
) -> Result<(), FrameError> {
    let mut remaining = remaining;
    let mut chunk = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(chunk.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(FrameError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);
        remaining -= n;
    }
    Ok(())
}

/// Decodes one already-isolated BER frame (as produced by [`read_frame`])
/// into a structural LDAP message.
pub fn decode_message(mut frame: BytesMut) -> Result<LdapMsg, FrameError> {
    let mut codec = LdapCodec::new(None);
    codec
        .decode(&mut frame)
        .map_err(|_| FrameError::Malformed)?
        .ok_or(FrameError::Truncated)
}

/// Re-encodes a decoded message back to its BER wire form.
pub fn encode_message(msg: LdapMsg) -> Result<BytesMut, FrameError> {
    let mut codec = LdapCodec::new(None);
    let mut buf = BytesMut::new();
    codec
        .encode(msg, &mut buf)
        .map_err(|_| FrameError::Malformed)?;
    Ok(buf)
}

/// Reads and decodes the next LDAP message from `stream`.
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<LdapMsg, FrameError> {
    let frame = read_frame(stream).await?;
    decode_message(frame)
}

/// Encodes and writes one LDAP message to `stream`, draining the write
/// fully (the source's partial-write bug class this guards against).
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg: LdapMsg,
) -> Result<(), FrameError> {
    let buf = encode_message(msg)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
