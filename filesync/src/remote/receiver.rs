//! The receiving side of a remote walk
//!
//! [`RemoteFs`] turns one packet connection into the [`WalkFs`]/[`ReadFs`]
//! pair. A single receive loop owns the incoming stream: it forwards
//! metadata to the walk callback and routes content chunks into the pipe
//! registered for the file id.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Result, SyncError};
use crate::fs::{local_path, ReadFs, WalkFs};
use crate::remote::codec::Packet;
use crate::remote::pipe::{pipe, PipeReader, PipeWriter};
use crate::stat::Stat;

/// Open content pipes, by file id and by path
#[derive(Debug, Default)]
struct Registry {
    by_id: HashMap<u32, PipeWriter>,
    by_path: HashMap<String, (u32, Option<PipeReader>)>,
    pending: usize,
}

impl Registry {
    fn register(&mut self, id: u32, path: &str) {
        let (writer, reader) = pipe();
        self.by_id.insert(id, writer);
        self.by_path.insert(path.to_string(), (id, Some(reader)));
    }

    fn close_all(&mut self, error: Option<&str>) {
        for (_, writer) in self.by_id.drain() {
            if let Some(message) = error {
                writer.close_with_error(io::Error::other(format!("remote walk failed: {}", message)));
            }
        }
        self.by_path.clear();
        self.pending = 0;
    }
}

/// Closes every pipe when the walk ends, including when its future is dropped
struct Teardown<'a> {
    registry: &'a Mutex<Registry>,
    receiving: &'a AtomicBool,
    error: Option<String>,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.receiving.store(false, Ordering::SeqCst);
        let mut registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        registry.close_all(self.error.as_deref());
    }
}

/// A remote tree reached through a packet stream and sink.
///
/// `walk` may be called once. `read_file` is only valid for files already
/// reported by that walk and only while it is still running.
///
/// Metadata is taken off the connection only as fast as the walk callback
/// accepts it, and content arrives on the same connection. A reader
/// returned by `read_file` must therefore be drained outside the callback.
pub struct RemoteFs<S, K> {
    stream: Mutex<Option<S>>,
    sink: tokio::sync::Mutex<K>,
    registry: Mutex<Registry>,
    receiving: AtomicBool,
    channel_capacity: usize,
}

impl<S, K> RemoteFs<S, K>
where
    S: Stream<Item = Result<Packet>> + Send + Unpin,
    K: Sink<Packet, Error = SyncError> + Send + Unpin,
{
    pub fn new(sink: K, stream: S) -> Self {
        Self::with_config(sink, stream, &EngineConfig::default())
    }

    pub fn with_config(sink: K, stream: S, config: &EngineConfig) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            sink: tokio::sync::Mutex::new(sink),
            registry: Mutex::new(Registry::default()),
            receiving: AtomicBool::new(false),
            channel_capacity: config.walk_channel_capacity.max(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn send(&self, packet: Packet) -> Result<()> {
        self.sink.lock().await.send(packet).await
    }

    async fn receive_loop(
        &self,
        ctx: &Context,
        mut stream: S,
        tx: mpsc::Sender<Stat>,
        mut consumer_done: oneshot::Receiver<()>,
    ) -> Result<()> {
        let mut tx = Some(tx);
        let mut next_id: u32 = 0;
        let mut walk_ended = false;
        let mut consumer_finished = false;
        let mut stream_open = true;

        loop {
            if walk_ended {
                tx = None;
            }
            if walk_ended && consumer_finished && self.registry().pending == 0 {
                self.send(Packet::Fin).await?;
                debug!(entries = next_id, "Remote walk complete, sent FIN");
                return Ok(());
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(ctx.cause()),
                _ = &mut consumer_done, if !consumer_finished => consumer_finished = true,
                packet = stream.next(), if stream_open => match packet {
                    Some(packet) => {
                        if let Some(stat) = self.handle_packet(packet?, &mut next_id, &mut walk_ended)? {
                            self.forward(ctx, tx.as_ref(), stat).await?;
                        }
                    }
                    None if walk_ended && self.registry().pending == 0 => stream_open = false,
                    None => {
                        return Err(SyncError::protocol_error("connection closed before the walk finished"));
                    }
                },
            }
        }
    }

    /// Hand `stat` to the walk. Nothing more is read off the connection
    /// until the walk takes it.
    async fn forward(&self, ctx: &Context, tx: Option<&mpsc::Sender<Stat>>, stat: Stat) -> Result<()> {
        let tx = tx.ok_or_else(|| SyncError::protocol_error("walk consumer stopped"))?;
        tokio::select! {
            sent = tx.send(stat) => sent.map_err(|_| SyncError::protocol_error("walk consumer stopped")),
            _ = ctx.cancelled() => Err(ctx.cause()),
        }
    }

    /// Apply one packet. Returns the metadata to forward, if any.
    fn handle_packet(&self, packet: Packet, next_id: &mut u32, walk_ended: &mut bool) -> Result<Option<Stat>> {
        match packet {
            Packet::Stat(None) => {
                *walk_ended = true;
                Ok(None)
            }
            Packet::Stat(Some(stat)) => {
                if *walk_ended {
                    return Err(SyncError::protocol_error(format!("stat for {} after end of walk", stat.path)));
                }
                local_path(&stat.path)?;
                let id = *next_id;
                *next_id += 1;
                if stat.is_regular() {
                    self.registry().register(id, &stat.path);
                }
                Ok(Some(stat))
            }
            Packet::Data { id, data } => {
                let mut registry = self.registry();
                if data.is_empty() {
                    let writer = registry.by_id.remove(&id).ok_or_else(|| {
                        SyncError::protocol_error(format!("end of data for unknown file {}", id))
                    })?;
                    drop(writer);
                    registry.pending = registry.pending.saturating_sub(1);
                } else {
                    let writer = registry
                        .by_id
                        .get(&id)
                        .ok_or_else(|| SyncError::protocol_error(format!("data for unknown file {}", id)))?;
                    writer.write(data);
                }
                Ok(None)
            }
            Packet::Err(message) => Err(SyncError::protocol_error(format!("error from sender: {}", message))),
            Packet::Req { .. } | Packet::Fin => Err(SyncError::protocol_error("unexpected packet from sender")),
        }
    }
}

impl<S, K> WalkFs for RemoteFs<S, K>
where
    S: Stream<Item = Result<Packet>> + Send + Unpin,
    K: Sink<Packet, Error = SyncError> + Send + Unpin,
{
    async fn walk<F, Fut>(&self, ctx: &Context, mut f: F) -> Result<()>
    where
        F: FnMut(Stat) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| SyncError::protocol_error("walk can only be called once"))?;

        let ctx = ctx.child();
        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let (done_tx, done_rx) = oneshot::channel();
        self.receiving.store(true, Ordering::SeqCst);
        let mut teardown = Teardown {
            registry: &self.registry,
            receiving: &self.receiving,
            error: Some("walk aborted".to_string()),
        };

        let consumer = async move {
            while let Some(stat) = rx.recv().await {
                f(stat).await?;
            }
            let _ = done_tx.send(());
            Ok(())
        };

        match tokio::try_join!(self.receive_loop(&ctx, stream, tx, done_rx), consumer) {
            Ok(_) => {
                teardown.error = None;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Remote walk aborted");
                ctx.cancel_with_cause(e.to_string());
                teardown.error = Some(e.to_string());
                Err(e)
            }
        }
    }
}

impl<S, K> ReadFs for RemoteFs<S, K>
where
    S: Stream<Item = Result<Packet>> + Send + Unpin,
    K: Sink<Packet, Error = SyncError> + Send + Unpin,
{
    type Reader = PipeReader;

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<PipeReader> {
        ctx.check()?;
        if !self.receiving.load(Ordering::SeqCst) {
            return Err(SyncError::protocol_error("read_file called outside of a running walk"));
        }
        let (id, reader) = {
            let mut registry = self.registry();
            let (id, reader) = match registry.by_path.get_mut(path) {
                Some((id, reader)) => (*id, reader.take()),
                None => {
                    return Err(SyncError::protocol_error(format!("{} was not reported by the walk", path)));
                }
            };
            let reader =
                reader.ok_or_else(|| SyncError::protocol_error(format!("{} was already requested", path)))?;
            registry.pending += 1;
            (id, reader)
        };
        self.send(Packet::Req { id }).await?;
        Ok(reader)
    }
}
