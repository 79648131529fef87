//! Length-prefixed message channel over any async byte stream.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON document.
//! A zero-length frame is the *null message*: the wake-up ping from host to
//! agent, and the ready / clean-shutdown signal from agent to host.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Largest frame either side accepts or sends.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("pipe i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pipe closed by peer")]
    Closed,
    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("message of {len} bytes exceeds the {max} byte frame limit")]
    TooLarge { len: usize, max: usize },
}

impl ChannelError {
    /// True when the peer can no longer be reached on this pipe.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ChannelError::Io(_) | ChannelError::Closed)
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LENGTH).new_codec()
}

pub struct FrameReader {
    inner: FramedRead<BoxedReader, LengthDelimitedCodec>,
}

impl FrameReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: FramedRead::new(Box::new(reader) as BoxedReader, codec()),
        }
    }

    /// `Ok(None)` is the null message. End of stream is
    /// [`ChannelError::Closed`].
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ChannelError> {
        match self.inner.next().await {
            None => Err(ChannelError::Closed),
            Some(Err(err)) => Err(ChannelError::Io(err)),
            Some(Ok(frame)) if frame.is_empty() => Ok(None),
            Some(Ok(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
        }
    }
}

pub struct FrameWriter {
    inner: FramedWrite<BoxedWriter, LengthDelimitedCodec>,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: FramedWrite::new(Box::new(writer) as BoxedWriter, codec()),
        }
    }

    /// Writes and flushes one frame. A message over [`MAX_FRAME_LENGTH`]
    /// is refused before anything reaches the pipe.
    pub async fn write_message<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), ChannelError> {
        let bytes = serde_json::to_vec(message)?;
        if bytes.len() > MAX_FRAME_LENGTH {
            return Err(ChannelError::TooLarge { len: bytes.len(), max: MAX_FRAME_LENGTH });
        }
        self.inner.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn write_null(&mut self) -> Result<(), ChannelError> {
        self.inner.send(Bytes::new()).await?;
        Ok(())
    }

    /// Flushes and shuts down the write side.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        SinkExt::<Bytes>::close(&mut self.inner).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::AsyncWriteExt;

    fn memory_pipe(capacity: usize) -> ((FrameReader, FrameWriter), (FrameReader, FrameWriter)) {
        let (host, agent) = tokio::io::duplex(capacity);
        let (host_read, host_write) = tokio::io::split(host);
        let (agent_read, agent_write) = tokio::io::split(agent);
        (
            (FrameReader::new(host_read), FrameWriter::new(host_write)),
            (FrameReader::new(agent_read), FrameWriter::new(agent_write)),
        )
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[tokio::test]
    async fn messages_and_null_frames_arrive_in_order() {
        let ((_, mut host_tx), (mut agent_rx, _)) = memory_pipe(1024);

        host_tx.write_message(&Ping { seq: 1 }).await.unwrap();
        host_tx.write_null().await.unwrap();
        host_tx.write_message(&Ping { seq: 2 }).await.unwrap();

        assert_eq!(agent_rx.read_message::<Ping>().await.unwrap(), Some(Ping { seq: 1 }));
        assert_eq!(agent_rx.read_message::<Ping>().await.unwrap(), None);
        assert_eq!(agent_rx.read_message::<Ping>().await.unwrap(), Some(Ping { seq: 2 }));
    }

    #[tokio::test]
    async fn null_frame_is_four_zero_bytes() {
        let (mut raw_rx, raw_tx) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(raw_tx);
        writer.write_null().await.unwrap();
        drop(writer);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut raw_rx, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn end_of_stream_is_closed() {
        let ((mut host_rx, _), (_, agent_tx)) = memory_pipe(64);
        drop(agent_tx);
        let err = host_rx.read_message::<Ping>().await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn garbage_frame_is_a_codec_error() {
        let (raw_rx, mut raw_tx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(raw_rx);
        raw_tx.write_all(&[0, 0, 0, 3, b'{', b'{', b'{']).await.unwrap();

        let err = reader.read_message::<Ping>().await.unwrap_err();
        assert!(matches!(err, ChannelError::Codec(_)));
        assert!(!err.is_disconnect());
    }

    #[tokio::test]
    async fn writing_to_a_dropped_peer_fails() {
        let ((_, mut host_tx), agent) = memory_pipe(64);
        drop(agent);
        assert!(host_tx.write_message(&Ping { seq: 9 }).await.is_err());
    }

    #[tokio::test]
    async fn oversized_message_is_refused_without_writing() {
        let ((_, mut host_tx), (mut agent_rx, _)) = memory_pipe(1024);
        let blob = "x".repeat(MAX_FRAME_LENGTH);

        let err = host_tx.write_message(&blob).await.unwrap_err();
        assert!(matches!(err, ChannelError::TooLarge { max: MAX_FRAME_LENGTH, .. }));
        assert!(!err.is_disconnect());

        // the pipe is still usable
        host_tx.write_message(&Ping { seq: 3 }).await.unwrap();
        assert_eq!(agent_rx.read_message::<Ping>().await.unwrap(), Some(Ping { seq: 3 }));
    }
}
