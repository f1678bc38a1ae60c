//! Dedicated writer task for outgoing packets.
//!
//! Encoded packets are handed to a writer task over an mpsc channel. The
//! task owns the write half of the transport, so senders never wait on I/O
//! and ready packets are batched into single vectored writes.
//!
//! # Architecture
//!
//! ```text
//! Client/Worker ─┐
//! Job handles   ─┼─► mpsc::UnboundedSender<WriterMessage> ─► Writer Task ─► Transport
//! Read loop     ─┘
//! ```
//!
//! Sending is synchronous: protocol handlers running inside the read loop can
//! answer without awaiting.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{GearmanError, Result};

/// Maximum packets to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Message consumed by the writer task.
#[derive(Debug)]
pub enum WriterMessage {
    /// One encoded packet.
    Frame(Bytes),
    /// Write everything queued so far, then shut down the write half.
    End,
    /// Stop immediately, dropping queued packets.
    Close,
}

/// How the writer task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// Finished after [`WriterMessage::End`].
    Ended,
    /// Stopped by [`WriterMessage::Close`] or because every handle was dropped.
    Closed,
}

/// Handle for sending packets to the writer task.
///
/// This is cheaply cloneable and can be shared across jobs and tasks.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriterMessage>,
}

impl WriterHandle {
    /// Queue an encoded packet.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(WriterMessage::Frame(frame))
            .map_err(|_| GearmanError::ConnectionClosed)
    }

    /// Ask the writer to drain and shut down the write half.
    pub fn end(&self) {
        let _ = self.tx.send(WriterMessage::End);
    }

    /// Ask the writer to stop without draining.
    pub fn close(&self) {
        let _ = self.tx.send(WriterMessage::Close);
    }
}

/// Spawn the writer task and return a handle for sending packets.
///
/// The returned `JoinHandle` resolves when the task stops, with an error if
/// a write failed.
pub fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<Result<WriterExit>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WriterHandle { tx };
    let task = tokio::spawn(writer_loop(rx, writer));

    (handle, task)
}

/// Main writer loop - receives packets and writes them in batches.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
    mut writer: W,
) -> Result<WriterExit>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(WriterMessage::Frame(frame)) => frame,
            Some(WriterMessage::End) => {
                writer.shutdown().await?;
                return Ok(WriterExit::Ended);
            }
            Some(WriterMessage::Close) | None => return Ok(WriterExit::Closed),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        let mut control = None;
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(WriterMessage::Frame(frame)) => batch.push(frame),
                Ok(message) => {
                    control = Some(message);
                    break;
                }
                Err(_) => break,
            }
        }

        if let Some(WriterMessage::Close) = control {
            return Ok(WriterExit::Closed);
        }

        write_batch(&mut writer, &batch).await?;

        if let Some(WriterMessage::End) = control {
            writer.shutdown().await?;
            return Ok(WriterExit::Ended);
        }
    }
}

/// Write a batch of packets using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = batch.iter().map(|frame| IoSlice::new(frame)).collect();
    let total_size: usize = batch.iter().map(Bytes::len).sum();

    let mut total_written = writer.write_vectored(&slices).await?;

    while total_written < total_size {
        if total_written == 0 {
            return Err(GearmanError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        let remaining_slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(GearmanError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}
