//! Half-close aware bidirectional relay.
//!
//! # Data Flow
//! ```text
//!   A.reader ──copy──▶ B.writer   (EOF/error → shutdown B.writer)
//!   B.reader ──copy──▶ A.writer   (EOF/error → shutdown A.writer)
//! ```
//!
//! Each direction ends on its own. When one side stops sending, only the
//! opposite write side is closed, so the other direction keeps flowing until
//! its own source ends. The pipe completes when both directions are done, at
//! which point every half has been dropped and both connections are closed.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::net::connection::{BoxedReader, BoxedWriter, HalfCloseStream};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes relayed in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Relays bytes between two half-close capable connections.
#[derive(Debug)]
pub struct HalfDuplexPipe {
    a: HalfCloseStream,
    b: HalfCloseStream,
}

impl HalfDuplexPipe {
    pub fn new(a: HalfCloseStream, b: HalfCloseStream) -> Self {
        Self { a, b }
    }

    /// Run both directions to completion.
    pub async fn run(self) -> PipeStats {
        let HalfCloseStream {
            reader: a_reader,
            writer: a_writer,
        } = self.a;
        let HalfCloseStream {
            reader: b_reader,
            writer: b_writer,
        } = self.b;

        let (a_to_b, b_to_a) = tokio::join!(
            copy_half("a->b", a_reader, b_writer),
            copy_half("b->a", b_reader, a_writer),
        );

        tracing::debug!(a_to_b, b_to_a, "Duplex pipe finished");
        PipeStats { a_to_b, b_to_a }
    }
}

/// Copy until `reader` ends or either side fails, then close `writer`'s
/// direction. Every byte read is written before the loop looks at its source
/// again.
async fn copy_half(direction: &'static str, mut reader: BoxedReader, mut writer: BoxedWriter) -> u64 {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::trace!(direction, "Source closed its output");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(direction, error = %e, "Read failed");
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            tracing::debug!(direction, error = %e, "Write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(direction, error = %e, "Flush failed");
            break;
        }
        copied += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        tracing::trace!(direction, error = %e, "Close-write failed");
    }
    copied
}
