//! Queued, cancellation-aware output stream.
//!
//! Outbound buffers are pushed onto a FIFO and written by a single
//! writer task, so at most one write is ever in flight per connection
//! and wire order matches push order. A failed write clears the queue
//! and surfaces one `Network` error; cancelling the connection aborts
//! the in-flight write and discards whatever is still queued.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Handle for pushing buffers onto a connection's output queue.
///
/// Cloneable; all clones feed the same writer task.
#[derive(Debug, Clone)]
pub struct QueuedOutput {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl QueuedOutput {
    /// Spawn the writer task over `sink`.
    ///
    /// Write failures are reported once through `errors`; the queue is
    /// discarded afterwards. The task exits when `cancel` fires, when
    /// every handle is dropped, or on the first write error.
    pub fn spawn<W>(
        mut sink: W,
        cancel: CancellationToken,
        errors: mpsc::UnboundedSender<Error>,
    ) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let task = tokio::spawn(async move {
            loop {
                let buf = tokio::select! {
                    _ = cancel.cancelled() => break,
                    buf = rx.recv() => match buf {
                        Some(buf) => buf,
                        None => break,
                    },
                };

                let write = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = sink.write_all(&buf) => res,
                };

                match write {
                    Ok(()) => trace!(len = buf.len(), "wrote buffer"),
                    Err(err) => {
                        debug!(%err, "write failed, discarding output queue");
                        // Drop everything queued behind the failed write.
                        while rx.try_recv().is_ok() {}
                        let _ = errors.send(Error::Network(format!(
                            "lost connection with server: {err}"
                        )));
                        break;
                    }
                }
            }
        });

        (Self { tx }, task)
    }

    /// Spawn a writer task that sends each queued buffer as one
    /// datagram to `peer`. Queue semantics match the stream writer:
    /// one send in flight, order preserved, failure discards the rest.
    pub fn spawn_datagram(
        socket: std::sync::Arc<tokio::net::UdpSocket>,
        peer: std::net::SocketAddr,
        cancel: CancellationToken,
        errors: mpsc::UnboundedSender<Error>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let task = tokio::spawn(async move {
            loop {
                let buf = tokio::select! {
                    _ = cancel.cancelled() => break,
                    buf = rx.recv() => match buf {
                        Some(buf) => buf,
                        None => break,
                    },
                };

                let send = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = socket.send_to(&buf, peer) => res,
                };

                match send {
                    Ok(_) => trace!(len = buf.len(), %peer, "sent datagram"),
                    Err(err) => {
                        debug!(%err, "datagram send failed, discarding output queue");
                        while rx.try_recv().is_ok() {}
                        let _ = errors.send(Error::Network(format!(
                            "lost connection with server: {err}"
                        )));
                        break;
                    }
                }
            }
        });

        (Self { tx }, task)
    }

    /// Queue a buffer for writing.
    ///
    /// Fails with [`Error::Cancelled`] once the writer task has exited.
    pub fn push(&self, buf: Bytes) -> Result<()> {
        self.tx.send(buf).map_err(|_| Error::Cancelled)
    }

    /// Queue a text line, appending CRLF.
    pub fn push_line(&self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.push(buf.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_order_preserved() {
        let (client, mut server) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();
        let (errors, _err_rx) = mpsc::unbounded_channel();
        let (out, task) = QueuedOutput::spawn(client, cancel, errors);

        out.push_line("one").unwrap();
        out.push_line("two").unwrap();
        out.push_line("three").unwrap();
        drop(out);
        task.await.unwrap();

        let mut got = String::new();
        server.read_to_string(&mut got).await.unwrap();
        assert_eq!(got, "one\r\ntwo\r\nthree\r\n");
    }

    #[tokio::test]
    async fn test_cancel_discards_queue() {
        let (client, mut server) = tokio::io::duplex(16);
        let cancel = CancellationToken::new();
        let (errors, _err_rx) = mpsc::unbounded_channel();
        let (out, task) = QueuedOutput::spawn(client, cancel.clone(), errors);

        cancel.cancel();
        task.await.unwrap();
        // The writer is gone; pushes now fail with Cancelled.
        let err = out.push(Bytes::from_static(b"late")).unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        drop(out);
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());
    }

    /// Writer that fails every write.
    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken")))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_single_error() {
        let cancel = CancellationToken::new();
        let (errors, mut err_rx) = mpsc::unbounded_channel();
        let (out, task) = QueuedOutput::spawn(BrokenSink, cancel, errors);

        out.push_line("a").unwrap();
        out.push_line("b").unwrap();
        task.await.unwrap();

        let err = err_rx.recv().await.unwrap();
        assert!(matches!(err, Error::Network(_)));
        assert!(err_rx.try_recv().is_err(), "only one error expected");
    }
}
