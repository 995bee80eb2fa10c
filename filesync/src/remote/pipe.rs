//! In-memory pipes carrying file content from the receive loop to readers

use std::io;
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Create a connected writer/reader pair
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Bytes::new(),
            done: false,
        },
    )
}

/// Write end, owned by the receive loop. Dropping it signals end of file.
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::UnboundedSender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Queue a chunk. Chunks for a reader that has gone away are discarded.
    pub fn write(&self, chunk: Bytes) {
        let _ = self.tx.send(Ok(chunk));
    }

    /// Fail the reader with `err` and close the pipe
    pub fn close_with_error(self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

/// Read end handed out by `read_file`
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    current: Bytes,
    done: bool,
}

impl AsyncRead for PipeReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let n = buf.remaining().min(this.current.len());
                buf.put_slice(&this.current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => this.current = chunk,
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Err(e));
                }
                None => this.done = true,
            }
        }
    }
}
