//! File content that is still streaming in after its node was created

use std::future::Future;
use std::path::PathBuf;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::copy::copier::Copier;
use crate::copy::node;
use crate::diff::ChangeKind;
use crate::error::Result;
use crate::pool::BufferPool;
use crate::stat::Stat;

/// A created regular file waiting for its content. Metadata is restored
/// and the change reported once the content is written.
pub(crate) struct PendingWrite<R> {
    pub reader: R,
    pub stat: Stat,
    pub target: PathBuf,
    pub copy_file_info: bool,
    pub target_existed: bool,
    pub notify: Option<ChangeKind>,
}

impl<R: AsyncRead + Unpin> PendingWrite<R> {
    pub async fn write(&mut self, pool: &BufferPool) -> Result<()> {
        node::write_file(&mut self.reader, &self.target, pool).await?;
        Ok(())
    }

    pub fn finish(&self, copier: &mut Copier) -> Result<()> {
        copier.finish(&self.stat, &self.target, self.copy_file_info, false, self.target_existed, false)?;
        match self.notify {
            Some(kind) => copier.notify_change(kind, &self.target, &self.stat),
            None => Ok(()),
        }
    }
}

/// Run `write` on every queued item concurrently until the queue is closed
/// and drained. The first error is returned.
pub(crate) async fn drain<T, W, Fut>(mut queued: mpsc::UnboundedReceiver<T>, write: W) -> Result<usize>
where
    W: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut running = FuturesUnordered::new();
    let mut open = true;
    let mut written = 0;
    loop {
        tokio::select! {
            item = queued.recv(), if open => match item {
                Some(item) => running.push(write(item)),
                None => open = false,
            },
            Some(result) = running.next(), if !running.is_empty() => {
                result?;
                written += 1;
            }
            else => return Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[tokio::test]
    async fn test_drain_runs_items_concurrently() {
        let (queue, queued) = mpsc::unbounded_channel();
        for i in 0..3 {
            queue.send(i).unwrap();
        }
        drop(queue);

        // Completes only when all three items are in flight at once
        let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(3));
        let written = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            drain(queued, |_| {
                let barrier = std::sync::Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(written, 3);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_error() {
        let (queue, queued) = mpsc::unbounded_channel();
        queue.send(1).unwrap();
        drop(queue);

        let err = drain(queued, |_| async { Err(SyncError::protocol_error("broken")) })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
