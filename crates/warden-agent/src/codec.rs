//! Length-prefixed MessagePack framing.
//!
//! Each value travels as a 4-byte big-endian length followed by its msgpack
//! encoding in named (map) mode. The length is validated before any
//! allocation happens.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("encode failed: {0}")]
	Encode(#[from] rmp_serde::encode::Error),

	#[error("decode failed: {0}")]
	Decode(#[from] rmp_serde::decode::Error),

	#[error("frame of {size} bytes exceeds limit of {MAX_FRAME_SIZE}")]
	FrameTooLarge { size: usize },
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
	Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
	Ok(rmp_serde::from_slice(bytes)?)
}

/// Read one frame. `Ok(None)` means the peer closed the stream at a frame
/// boundary; EOF inside a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, CodecError>
where
	R: AsyncRead + Unpin,
{
	let mut len_buf = [0u8; 4];
	match reader.read_exact(&mut len_buf).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e.into()),
	}

	let len = u32::from_be_bytes(len_buf) as usize;
	if len > MAX_FRAME_SIZE {
		return Err(CodecError::FrameTooLarge { size: len });
	}

	let mut payload = vec![0u8; len];
	reader.read_exact(&mut payload).await?;
	Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
where
	W: AsyncWrite + Unpin,
{
	if payload.len() > MAX_FRAME_SIZE {
		return Err(CodecError::FrameTooLarge {
			size: payload.len(),
		});
	}
	writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
	writer.write_all(payload).await?;
	Ok(())
}

/// Read and decode one value. `Ok(None)` on clean EOF.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, CodecError>
where
	R: AsyncRead + Unpin,
	T: DeserializeOwned,
{
	match read_frame(reader).await? {
		Some(payload) => Ok(Some(decode(&payload)?)),
		None => Ok(None),
	}
}

pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
	W: AsyncWrite + Unpin,
	T: Serialize,
{
	let payload = encode(value)?;
	write_frame(writer, &payload).await
}
