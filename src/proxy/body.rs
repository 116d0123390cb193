//! Client-facing response body.
//!
//! # Responsibilities
//! - Buffer response bytes the way an HTTP response writer does
//! - Push buffered bytes to the client when the buffer fills or on flush
//! - Forward trailers and abort the client stream on backend failure
//!
//! # Data Flow
//! ```text
//! backend body ──copy_body──▶ ResponseWriter (buffer)
//!                                  │ full / flush()
//!                                  ▼
//!                          bounded channel ──▶ ChannelBody ──▶ hyper ──▶ client
//! ```

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use hyper::HeaderMap;
use tokio::sync::{mpsc, Mutex};

use crate::proxy::error::BoxError;
use crate::proxy::flusher::Flush;

/// Frames in flight between the writer and the HTTP layer.
const CHANNEL_FRAMES: usize = 4;

type Item = Result<Frame<Bytes>, io::Error>;

/// Create a connected writer/body pair holding up to `buffer_size` bytes
/// before a write is forced out.
pub fn response_channel(buffer_size: usize) -> (ResponseWriter, ChannelBody) {
    let (tx, rx) = mpsc::channel(CHANNEL_FRAMES);
    let writer = ResponseWriter {
        state: Arc::new(Mutex::new(WriterState {
            buf: BytesMut::with_capacity(buffer_size),
            capacity: buffer_size.max(1),
            tx: Some(tx),
        })),
    };
    (writer, ChannelBody { rx })
}

/// Body handed to the HTTP layer; yields whatever the writer pushes.
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<Item>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.rx.poll_recv(cx)
    }
}

/// Buffered writer feeding a [`ChannelBody`]. Clones share one buffer.
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    state: Arc<Mutex<WriterState>>,
}

#[derive(Debug)]
struct WriterState {
    buf: BytesMut,
    capacity: usize,
    tx: Option<mpsc::Sender<Item>>,
}

impl WriterState {
    async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.send(Ok(Frame::data(chunk))).await
    }

    async fn send(&mut self, item: Item) -> io::Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "response body already finished")
        })?;
        tx.send(item)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client stopped reading the response"))
    }
}

impl ResponseWriter {
    /// Buffer `data`, pushing the buffer out once it reaches capacity.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().await;
        state.buf.extend_from_slice(data);
        if state.buf.len() >= state.capacity {
            state.flush().await?;
        }
        Ok(())
    }

    /// Push everything buffered so far to the client.
    pub async fn flush(&self) -> io::Result<()> {
        self.state.lock().await.flush().await
    }

    /// Flush buffered data, then send trailers.
    pub async fn write_trailers(&self, trailers: HeaderMap) -> io::Result<()> {
        let mut state = self.state.lock().await;
        state.flush().await?;
        state.send(Ok(Frame::trailers(trailers))).await
    }

    /// Flush and end the body cleanly.
    pub async fn finish(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let flushed = state.flush().await;
        state.tx = None;
        flushed
    }

    /// End the body with an error so the client sees a truncated stream.
    ///
    /// Never waits on the client: if the channel is full the error frame is
    /// dropped and closing the channel still ends the body.
    pub async fn abort(&self, err: io::Error) {
        let mut state = self.state.lock().await;
        state.buf.clear();
        if let Some(tx) = state.tx.take() {
            let _ = tx.try_send(Err(err));
        }
    }

    /// Bytes written but not yet pushed to the client.
    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buf.len()
    }
}

impl Flush for ResponseWriter {
    fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(ResponseWriter::flush(self))
    }
}

/// Copy `body` into `writer` until end of stream, then finish the response.
///
/// A read error aborts the client response; a write error means the client
/// is gone. Either way the error is returned for logging.
pub async fn copy_body<B>(mut body: B, writer: &ResponseWriter) -> io::Result<u64>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let mut copied = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let err = io::Error::other(e);
                writer
                    .abort(io::Error::new(err.kind(), err.to_string()))
                    .await;
                return Err(err);
            }
        };
        match frame.into_data() {
            Ok(data) => {
                copied += data.len() as u64;
                writer.write(&data).await?;
            }
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    writer.write_trailers(trailers).await?;
                }
            }
        }
    }
    writer.finish().await?;
    Ok(copied)
}
