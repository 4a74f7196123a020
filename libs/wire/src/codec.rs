//! Framing helpers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::WireError;

/// Upper bound for a length-prefixed message body.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Upper bound for a newline-delimited preamble, including the newline.
pub const MAX_LINE_LEN: usize = 4096;

/// Largest gossip datagram we will emit or accept.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Write `msg` as `[u32 BE length][json]`.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(WireError::TooLarge {
            len: body.len(),
            max: MAX_MESSAGE_LEN,
        });
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one `[u32 BE length][json]` message. Never reads past its end.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_eof(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(WireError::TooLarge {
            len,
            max: MAX_MESSAGE_LEN,
        });
    }
    let mut body = vec![0u8; len];
    read_exact_or_eof(reader, &mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write `msg` as a single JSON line.
pub async fn write_line<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a single JSON line, byte by byte, so bytes that follow the newline
/// stay in the transport for whoever reads next.
pub async fn read_line<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::with_capacity(128);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::UnexpectedEof)
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() >= MAX_LINE_LEN {
            return Err(WireError::TooLarge {
                len: line.len() + 1,
                max: MAX_LINE_LEN,
            });
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(serde_json::from_slice(&line)?)
}

pub fn encode_datagram<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let buf = serde_json::to_vec(msg)?;
    if buf.len() > MAX_DATAGRAM_LEN {
        return Err(WireError::TooLarge {
            len: buf.len(),
            max: MAX_DATAGRAM_LEN,
        });
    }
    Ok(buf)
}

pub fn decode_datagram<T: DeserializeOwned>(buf: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(buf)?)
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::UnexpectedEof),
        Err(e) => Err(e.into()),
    }
}
