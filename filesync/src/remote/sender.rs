//! The serving side of a remote walk

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Result, SyncError};
use crate::fs::{ReadFs, WalkFs};
use crate::remote::codec::Packet;

/// Serves a [`WalkFs`] + [`ReadFs`] tree to a [`RemoteFs`](super::RemoteFs)
#[derive(Debug, Clone)]
pub struct Sender {
    data_chunk_size: usize,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

impl Sender {
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            data_chunk_size: config.data_chunk_size.max(1),
        }
    }

    /// Stream the walk of `fs` and answer content requests until the
    /// receiver sends FIN. Walk failures are reported to the receiver with
    /// an ERR packet before being returned.
    pub async fn send<F, K, S>(&self, ctx: &Context, fs: &F, sink: K, mut stream: S) -> Result<()>
    where
        F: WalkFs + ReadFs,
        K: Sink<Packet, Error = SyncError> + Send + Unpin,
        S: Stream<Item = Result<Packet>> + Send + Unpin,
    {
        let ctx = ctx.child();
        let sink = tokio::sync::Mutex::new(sink);
        let files: Mutex<HashMap<u32, String>> = Mutex::new(HashMap::new());

        let walk = async {
            let mut next_id: u32 = 0;
            let walked = fs
                .walk(&ctx, |stat| {
                    let id = next_id;
                    next_id += 1;
                    if stat.is_regular() {
                        files
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(id, stat.path.clone());
                    }
                    let sink = &sink;
                    async move { sink.lock().await.send(Packet::Stat(Some(stat))).await }
                })
                .await;
            match walked {
                Ok(()) => {
                    debug!(entries = next_id, "Sent walk");
                    sink.lock().await.send(Packet::Stat(None)).await
                }
                Err(e) => Err(self.report(&sink, e).await),
            }
        };

        let serve = async {
            loop {
                let packet = tokio::select! {
                    packet = stream.next() => packet,
                    _ = ctx.cancelled() => return Err(ctx.cause()),
                };
                match packet {
                    Some(Ok(Packet::Req { id })) => {
                        let path = files.lock().unwrap_or_else(|p| p.into_inner()).get(&id).cloned();
                        let Some(path) = path else {
                            let e = SyncError::protocol_error(format!("invalid file request {}", id));
                            return Err(self.report(&sink, e).await);
                        };
                        if let Err(e) = self.send_file(&ctx, fs, &sink, id, &path).await {
                            return Err(self.report(&sink, e).await);
                        }
                    }
                    Some(Ok(Packet::Fin)) => return Ok(()),
                    Some(Ok(Packet::Err(message))) => {
                        return Err(SyncError::protocol_error(format!("error from receiver: {}", message)));
                    }
                    Some(Ok(_)) => return Err(SyncError::protocol_error("unexpected packet from receiver")),
                    Some(Err(e)) => return Err(e),
                    None => return Err(SyncError::protocol_error("connection closed before FIN")),
                }
            }
        };

        let result = tokio::try_join!(walk, serve).map(|_| ());
        if let Err(e) = &result {
            ctx.cancel_with_cause(e.to_string());
        }
        result
    }

    async fn send_file<F, K>(
        &self,
        ctx: &Context,
        fs: &F,
        sink: &tokio::sync::Mutex<K>,
        id: u32,
        path: &str,
    ) -> Result<()>
    where
        F: ReadFs,
        K: Sink<Packet, Error = SyncError> + Send + Unpin,
    {
        let mut reader = fs.read_file(ctx, path).await?;
        let mut buf = vec![0u8; self.data_chunk_size];
        let mut total = 0usize;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n;
            let data = Bytes::copy_from_slice(&buf[..n]);
            sink.lock().await.send(Packet::Data { id, data }).await?;
        }
        sink.lock()
            .await
            .send(Packet::Data {
                id,
                data: Bytes::new(),
            })
            .await?;
        debug!(path, bytes = total, "Sent file content");
        Ok(())
    }

    async fn report<K>(&self, sink: &tokio::sync::Mutex<K>, err: SyncError) -> SyncError
    where
        K: Sink<Packet, Error = SyncError> + Send + Unpin,
    {
        warn!(error = %err, "Remote walk failed, notifying receiver");
        if let Err(send_err) = sink.lock().await.send(Packet::Err(err.to_string())).await {
            debug!(error = %send_err, "Could not deliver ERR packet");
        }
        err
    }
}
