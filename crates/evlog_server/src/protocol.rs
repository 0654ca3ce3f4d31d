//! Wire protocol of the segment server.
//!
//! Every message is one frame:
//!
//! ```text
//! | length u32 (big-endian) | CBOR body (length bytes) |
//! ```
//!
//! A connection carries [`Frame`]s in both directions. Requests carry an id
//! chosen by the client and are answered by a response with the same id,
//! possibly out of order. Raft messages are one-way.

use crate::error::WireError;
use evlog_codec::CloudEvent;
use evlog_core::{BlockId, RaftMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Segment server operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Allocate a block.
    CreateBlock {
        /// Block id, never 0.
        id: BlockId,
        /// Capacity in bytes.
        size: u64,
    },
    /// Delete a block and its data.
    RemoveBlock {
        /// Block id.
        id: BlockId,
    },
    /// Form the raft group of a segment.
    ActivateSegment {
        /// Owning event log.
        eventlog_id: u64,
        /// Segment id.
        segment_id: u64,
        /// Block id to endpoint of every replica.
        replicas: BTreeMap<BlockId, String>,
    },
    /// Mark a block as pending evacuation.
    InactivateSegment {
        /// Block id.
        id: BlockId,
    },
    /// Append events.
    AppendToBlock {
        /// Block id.
        id: BlockId,
        /// Events, at least one.
        events: Vec<CloudEvent>,
    },
    /// Read events, optionally waiting at the tail.
    ReadFromBlock {
        /// Block id.
        id: BlockId,
        /// First sequence number.
        seq: u64,
        /// Maximum number of events.
        num: u32,
        /// Milliseconds to wait at the tail; 0 returns at once.
        polling_timeout_ms: u32,
    },
    /// Offset of the first event stored at or after `stime`.
    LookupOffsetInBlock {
        /// Block id.
        id: BlockId,
        /// Store time in milliseconds.
        stime: i64,
    },
}

impl Request {
    /// Operation name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateBlock { .. } => "CreateBlock",
            Self::RemoveBlock { .. } => "RemoveBlock",
            Self::ActivateSegment { .. } => "ActivateSegment",
            Self::InactivateSegment { .. } => "InactivateSegment",
            Self::AppendToBlock { .. } => "AppendToBlock",
            Self::ReadFromBlock { .. } => "ReadFromBlock",
            Self::LookupOffsetInBlock { .. } => "LookupOffsetInBlock",
        }
    }
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Success without payload.
    Ok,
    /// Sequence numbers of appended events.
    Offsets(Vec<u64>),
    /// Events read.
    Events(Vec<CloudEvent>),
    /// Looked-up offset.
    Offset(u64),
    /// Failure.
    Error(WireError),
}

/// Unit of transmission on a segment server connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Client to server.
    Request {
        /// Correlation id.
        id: u64,
        /// Operation.
        request: Request,
    },
    /// Server to client.
    Response {
        /// Id of the answered request.
        id: u64,
        /// Result.
        response: Response,
    },
    /// Consensus traffic between servers.
    Raft(RaftMessage),
}

/// Serializes `value` into a frame and writes it.
///
/// # Errors
///
/// `InvalidData` if the value cannot be encoded or is too large, or the
/// write error.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut body = Vec::new();
    ciborium::into_writer(value, &mut body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", body.len()),
        ));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one frame. Returns `None` on a clean end of stream.
///
/// # Errors
///
/// `InvalidData` for oversized or undecodable frames, `UnexpectedEof` for a
/// stream cut mid-frame, or the read error.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    ciborium::from_reader(body.as_slice())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn frames_cross_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let sent = Frame::Request {
            id: 9,
            request: Request::ReadFromBlock {
                id: BlockId::new(1001),
                seq: 3,
                num: 10,
                polling_timeout_ms: 500,
            },
        };
        write_frame(&mut client, &sent).await.unwrap();
        write_frame(
            &mut client,
            &Frame::Response {
                id: 9,
                response: Response::Error(WireError {
                    kind: ErrorKind::OffsetOnEnd,
                    message: "tail".into(),
                }),
            },
        )
        .await
        .unwrap();
        drop(client);

        let first: Frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(first, sent);
        let second: Option<Frame> = read_frame(&mut server).await.unwrap();
        assert!(matches!(second, Some(Frame::Response { id: 9, .. })));
        let end: Option<Frame> = read_frame(&mut server).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(MAX_FRAME_LEN as u32 + 1).await.unwrap();
        let err = read_frame::<_, Frame>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(10).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);
        let err = read_frame::<_, Frame>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
