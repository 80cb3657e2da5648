//! Bridges between blocking protocol transfers and async byte streams
//!
//! Protocol libraries move file contents through `std::io::Read`/`Write`
//! on a blocking thread. Reads push chunks into a bounded channel drained by
//! the caller's stream; writes pump the caller's stream into a channel the
//! blocking transfer reads from.

use std::io::{self, Read, Write};

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::trace;

use crate::backend::ByteStream;
use crate::error::{RemoteFsError, Result};

/// Chunks buffered between producer and consumer
pub const CHANNEL_CAPACITY: usize = 8;

/// Blocking writer feeding a [`ByteStream`]
pub struct ChannelWriter {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream consumer dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `produce` on a blocking thread and stream what it writes
///
/// The stream ends cleanly only when `produce` returns `Ok`. An error, or a
/// panic of the transfer thread, is delivered as the final stream item.
pub fn spawn_reader<F>(produce: F) -> ByteStream
where
    F: FnOnce(&mut ChannelWriter) -> Result<()> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let status = tx.clone();

    let transfer = tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter { tx };
        produce(&mut writer)
    });

    tokio::spawn(async move {
        let outcome = match transfer.await {
            Ok(result) => result,
            Err(e) => Err(RemoteFsError::Transport(format!("transfer task failed: {}", e))),
        };
        if let Err(err) = outcome {
            trace!("read stream closing with error: {}", err);
            let _ = status.send(Err(err)).await;
        }
    });

    Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            let failed = item.is_err();
            yield item;
            if failed {
                break;
            }
        }
    })
}

/// Blocking reader drained from an async source
pub struct ChannelReader {
    rx: mpsc::Receiver<Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Feed `content` to `consume` running on a blocking thread
///
/// Returns once both the source is exhausted and `consume` has finished.
/// A source error takes precedence over the consumer's result.
pub async fn drain_into<F>(mut content: ByteStream, consume: F) -> Result<()>
where
    F: FnOnce(&mut ChannelReader) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let transfer = tokio::task::spawn_blocking(move || {
        let mut reader = ChannelReader::new(rx);
        consume(&mut reader)
    });

    let pump = async move {
        while let Some(item) = content.next().await {
            match item {
                Ok(chunk) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Consumer stopped early; its own result explains why
                        return Ok(());
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(RemoteFsError::Transport(format!("source failed: {}", e))))
                        .await;
                    return Err(e);
                }
            }
        }
        Ok(())
    };

    let (pumped, consumed) = tokio::join!(pump, transfer);
    let consumed = consumed
        .map_err(|e| RemoteFsError::Transport(format!("transfer task failed: {}", e)))?;
    pumped?;
    consumed
}

/// Stream yielding `data` as a single chunk
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Stream yielding nothing
pub fn empty_stream() -> ByteStream {
    Box::pin(futures::stream::empty())
}

/// Drain a stream into memory
pub async fn collect(mut stream: ByteStream) -> Result<Bytes> {
    let mut out = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out.freeze())
}
