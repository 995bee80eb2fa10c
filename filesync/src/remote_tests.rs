//! Tests for the remote walk protocol

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::SyncError;
use crate::fs::{LocalFs, ReadFs, WalkFs};
use crate::remote::{framed, framed_with_config, Packet, PacketSink, PacketStream, RemoteFs, Sender};
use crate::stat::Stat;
use crate::testutil::{create_tree, file_stat, Entry};

type TestRemote = RemoteFs<PacketStream<DuplexStream>, PacketSink<DuplexStream>>;

fn connect() -> (TestRemote, PacketSink<DuplexStream>, PacketStream<DuplexStream>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (sink, stream) = framed(client);
    let (peer_sink, peer_stream) = framed(server);
    (RemoteFs::new(sink, stream), peer_sink, peer_stream)
}

/// Walk `remote`, draining the content of every regular file on its own task
async fn walk_and_read(remote: &TestRemote, ctx: &Context) -> crate::Result<Vec<(Stat, Option<String>)>> {
    let entries: Mutex<Vec<(Stat, Option<JoinHandle<std::io::Result<String>>>)>> = Mutex::new(Vec::new());
    remote
        .walk(ctx, |stat| {
            let entries = &entries;
            async move {
                let content = if stat.is_regular() {
                    let mut reader = remote.read_file(ctx, &stat.path).await?;
                    Some(tokio::spawn(async move {
                        let mut content = String::new();
                        reader.read_to_string(&mut content).await?;
                        Ok::<_, std::io::Error>(content)
                    }))
                } else {
                    None
                };
                entries.lock().unwrap().push((stat, content));
                Ok(())
            }
        })
        .await?;

    let mut received = Vec::new();
    for (stat, content) in entries.into_inner().unwrap() {
        let content = match content {
            Some(task) => Some(task.await.unwrap()?),
            None => None,
        };
        received.push((stat, content));
    }
    Ok(received)
}

#[cfg(unix)]
#[tokio::test]
async fn test_walk_and_read_local_tree() {
    let src = TempDir::new().unwrap();
    create_tree(
        src.path(),
        &[
            Entry::File("a.txt", "alpha"),
            Entry::Dir("empty"),
            Entry::File("sub/b.txt", "bravo"),
            Entry::Symlink("sub/link", "b.txt"),
        ],
    );
    let local = LocalFs::new(src.path());
    let (remote, peer_sink, peer_stream) = connect();
    let ctx = Context::new();

    let sender = Sender::new();

    let (received, ()) = tokio::try_join!(
        walk_and_read(&remote, &ctx),
        sender.send(&ctx, &local, peer_sink, peer_stream),
    )
    .unwrap();

    let paths: Vec<&str> = received.iter().map(|(s, _)| s.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "empty", "sub", "sub/b.txt", "sub/link"]);
    assert_eq!(received[0].1.as_deref(), Some("alpha"));
    assert!(received[1].0.is_dir());
    assert_eq!(received[3].1.as_deref(), Some("bravo"));
    assert!(received[4].0.is_symlink());
    assert_eq!(received[4].0.linkname, "b.txt");
    assert!(received[4].1.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_many_entries_with_small_chunks() {
    let src = TempDir::new().unwrap();
    let big = "x".repeat(10_000);
    for i in 0..300 {
        let content = if i % 50 == 0 { big.clone() } else { format!("file {}", i) };
        std::fs::write(src.path().join(format!("f{:03}", i)), content).unwrap();
    }
    let config = EngineConfig {
        data_chunk_size: 1000,
        ..Default::default()
    };

    let (client, server) = tokio::io::duplex(4096);
    let (sink, stream) = framed_with_config(client, &config);
    let (peer_sink, peer_stream) = framed_with_config(server, &config);
    let remote = RemoteFs::with_config(sink, stream, &config);
    let local = LocalFs::with_config(src.path(), &config);
    let ctx = Context::new();

    let sender = Sender::with_config(&config);

    let (received, ()) = tokio::try_join!(
        walk_and_read(&remote, &ctx),
        sender.send(&ctx, &local, peer_sink, peer_stream),
    )
    .unwrap();

    assert_eq!(received.len(), 300);
    assert_eq!(received[0].1.as_deref(), Some(big.as_str()));
    assert_eq!(received[1].1.as_deref(), Some("file 1"));
    assert_eq!(received[299].0.path, "f299");
}

#[tokio::test]
async fn test_metadata_waits_for_a_stalled_walk() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (sink, stream) = framed(client);
    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);
    let stream = stream.inspect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let remote = RemoteFs::new(sink, stream);
    let (mut peer_sink, _peer_stream) = framed(server);
    let ctx = Context::new();

    tokio::spawn(async move {
        for i in 0..5000 {
            let stat = file_stat(&format!("f{:05}", i), 1);
            if peer_sink.send(Packet::Stat(Some(stat))).await.is_err() {
                return;
            }
        }
        let _ = peer_sink.send(Packet::Stat(None)).await;
        // Keep the connection open until the receiver is done
        std::future::pending::<()>().await;
    });

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let mut gate = Some(release_rx);
    let walk = remote.walk(&ctx, |_| {
        let gate = gate.take();
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(())
        }
    });
    let observed = Arc::clone(&pulled);
    let stalled = async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = observed.load(Ordering::SeqCst);
        release_tx.send(()).unwrap();
        seen
    };

    let (walked, seen) = tokio::time::timeout(Duration::from_secs(30), async { tokio::join!(walk, stalled) })
        .await
        .unwrap();
    walked.unwrap();
    let bound = EngineConfig::default().walk_channel_capacity + 2;
    assert!(seen <= bound, "{} packets read while the walk was stalled", seen);
    assert_eq!(pulled.load(Ordering::SeqCst), 5001);
}

#[tokio::test]
async fn test_error_from_sender() {
    let (remote, mut peer_sink, mut peer_stream) = connect();
    let ctx = Context::new();
    let (read_tx, read_rx) = oneshot::channel();
    let mut read_tx = Some(read_tx);

    let peer = async {
        peer_sink.send(Packet::Stat(Some(file_stat("foo", 3)))).await.unwrap();
        // Wait for the content request, then fail instead of answering it
        let req = peer_stream.next().await.unwrap().unwrap();
        assert_eq!(req, Packet::Req { id: 0 });
        peer_sink.send(Packet::Err("foo bar".to_string())).await.unwrap();
    };

    let walk = remote.walk(&ctx, |stat| {
        let read_tx = read_tx.take();
        let remote = &remote;
        let ctx = &ctx;
        async move {
            let mut reader = remote.read_file(ctx, &stat.path).await?;
            tokio::spawn(async move {
                let mut out = Vec::new();
                let result = reader.read_to_end(&mut out).await;
                if let Some(tx) = read_tx {
                    let _ = tx.send(result);
                }
            });
            Ok(())
        }
    });

    let (result, ()) = tokio::join!(walk, peer);
    let err = result.unwrap_err();
    assert!(err.to_string().contains("error from sender: foo bar"), "{}", err);

    let read_result = tokio::time::timeout(Duration::from_secs(5), read_rx).await.unwrap().unwrap();
    assert!(read_result.is_err());
}

#[tokio::test]
async fn test_walk_only_once() {
    let (remote, mut peer_sink, mut peer_stream) = connect();
    let ctx = Context::new();

    let peer = async {
        peer_sink.send(Packet::Stat(None)).await.unwrap();
        assert_eq!(peer_stream.next().await.unwrap().unwrap(), Packet::Fin);
    };
    let (first, ()) = tokio::join!(remote.walk(&ctx, |_| async { Ok(()) }), peer);
    first.unwrap();

    let err = remote.walk(&ctx, |_| async { Ok(()) }).await.unwrap_err();
    assert!(err.to_string().contains("only be called once"));
}

#[tokio::test]
async fn test_path_syntax_rejected() {
    for bad in ["../evil", "/etc/passwd", "a/../../b"] {
        let (remote, mut peer_sink, _peer_stream) = connect();
        peer_sink.send(Packet::Stat(Some(file_stat(bad, 1)))).await.unwrap();

        let err = remote
            .walk(&Context::new(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PathSyntax { .. }), "{}: {}", bad, err);
    }
}

#[tokio::test]
async fn test_read_file_requires_walked_path() {
    let (remote, mut peer_sink, mut peer_stream) = connect();
    let ctx = Context::new();

    let err = remote.read_file(&ctx, "foo").await.unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));

    let peer = async {
        peer_sink.send(Packet::Stat(Some(file_stat("foo", 1)))).await.unwrap();
        peer_sink.send(Packet::Stat(None)).await.unwrap();
        assert_eq!(peer_stream.next().await.unwrap().unwrap(), Packet::Fin);
    };
    let (remote_ref, ctx_ref) = (&remote, &ctx);
    let walk = remote.walk(&ctx, move |_| async move {
        match remote_ref.read_file(ctx_ref, "other").await {
            Err(SyncError::Protocol(_)) => Ok(()),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    });
    let (result, ()) = tokio::join!(walk, peer);
    result.unwrap();
}

#[tokio::test]
async fn test_cancelled_walk() {
    let (remote, mut peer_sink, _peer_stream) = connect();
    let ctx = Context::new();
    peer_sink.send(Packet::Stat(Some(file_stat("slow", 1)))).await.unwrap();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel_with_cause("build cancelled");
    });

    let err = remote.walk(&ctx, |_| async { Ok(()) }).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(err.to_string().contains("build cancelled"));
}

#[tokio::test]
async fn test_sender_reports_walk_error() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (mut sink, mut stream) = framed(client);
    let (peer_sink, peer_stream) = framed(server);
    let missing = LocalFs::new("/nonexistent/filesync/root");
    let ctx = Context::new();

    let err = Sender::new()
        .send(&ctx, &missing, peer_sink, peer_stream)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Walk { .. }));

    match stream.next().await.unwrap().unwrap() {
        Packet::Err(message) => assert!(message.contains("nonexistent")),
        other => panic!("expected ERR, got {:?}", other),
    }
    let _ = sink.close().await;
}
