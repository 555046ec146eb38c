//! Length-prefixed frame encoding/decoding
//!
//! Wire format:
//! `[u32 length][u8 opcode][u64 sequence][u32 origin][i64 emitted_at_ms][payload]`,
//! all big-endian. The length counts everything after itself. A zero sequence
//! means "not sequenced", a zero origin means "server".

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::{ClientId, Command, Opcode};

/// Opcode, sequence, origin and timestamp
pub const HEADER_SIZE: usize = 1 + 8 + 4 + 8;

/// Default upper bound on a frame (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read one frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_size: u32) -> Result<Command> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;
    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
        return Err(Error::MalformedFrame("empty frame".into()));
    }
    if (len as usize) < HEADER_SIZE {
        return Err(Error::MalformedFrame(format!(
            "frame shorter than header: {} bytes",
            len
        )));
    }
    if len > max_size {
        return Err(Error::MalformedFrame(format!(
            "frame too large: {} bytes (max {})",
            len, max_size
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(map_eof)?;
    decode(&body)
}

/// Decode a frame body (everything after the length prefix)
pub fn decode(body: &[u8]) -> Result<Command> {
    if body.len() < HEADER_SIZE {
        return Err(Error::MalformedFrame("truncated header".into()));
    }
    let (header, payload) = body.split_at(HEADER_SIZE);

    let opcode = Opcode::from_u8(header[0])
        .ok_or_else(|| Error::MalformedFrame(format!("unknown opcode {}", header[0])))?;
    let sequence = u64::from_be_bytes(fixed(&header[1..9]));
    let origin = u32::from_be_bytes(fixed(&header[9..13]));
    let millis = i64::from_be_bytes(fixed(&header[13..21]));
    let emitted_at = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| Error::MalformedFrame(format!("timestamp out of range: {}", millis)))?;

    Ok(Command {
        opcode,
        payload: payload.to_vec(),
        origin: ClientId(origin),
        sequence: (sequence != 0).then_some(sequence),
        emitted_at,
    })
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Encode a command as a complete frame, length prefix included
pub fn encode(cmd: &Command) -> Vec<u8> {
    let len = (HEADER_SIZE + cmd.payload.len()) as u32;
    let mut buf = Vec::with_capacity(4 + len as usize);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(cmd.opcode as u8);
    buf.extend_from_slice(&cmd.sequence.unwrap_or(0).to_be_bytes());
    buf.extend_from_slice(&cmd.origin.0.to_be_bytes());
    buf.extend_from_slice(&cmd.emitted_at.timestamp_millis().to_be_bytes());
    buf.extend_from_slice(&cmd.payload);
    buf
}

/// Write one frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cmd: &Command,
    max_size: u32,
) -> Result<()> {
    let len = HEADER_SIZE + cmd.payload.len();
    if len > max_size as usize {
        return Err(Error::MalformedFrame(format!(
            "command too large: {} bytes (max {})",
            len, max_size
        )));
    }

    writer.write_all(&encode(cmd)).await?;
    writer.flush().await?;
    Ok(())
}
