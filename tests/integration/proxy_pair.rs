use crate::*;

use std::sync::atomic::Ordering;

use wanproxy_core::config::CodecStanza;

fn repetitive_payload(len: usize) -> Vec<u8> {
    b"telemetry-sample-0042: temperature=21.5 pressure=1013 status=nominal\n"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

#[tokio::test]
async fn plain_passthrough() -> anyhow::Result<()> {
    let origin = spawn_echo_origin().await?;
    let (client, _server) = spawn_pair(
        &origin,
        CodecStanza::default(),
        CodecStanza::default(),
        |_| {},
    )
    .await?;

    let payload = b"no codec, no compression, just a pipe".to_vec();
    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload);
    Ok(())
}

#[tokio::test]
async fn dedup_round_trip() -> anyhow::Result<()> {
    let origin = spawn_echo_origin().await?;
    let (client, _server) =
        spawn_pair(&origin, xcodec_memory(true), xcodec_memory(false), |_| {}).await?;

    let payload = repetitive_payload(64 * 1024);
    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload, "first transfer must be lossless");

    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload, "second transfer must be lossless");
    Ok(())
}

#[tokio::test]
async fn dedup_shrinks_repeated_traffic() -> anyhow::Result<()> {
    let origin = spawn_echo_origin().await?;
    let (client, _server) =
        spawn_pair(&origin, xcodec_memory(true), xcodec_memory(false), |_| {}).await?;

    let payload = repetitive_payload(64 * 1024);
    let (_, remote_counts) = client.listener.stream_counts();

    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload);
    let in_first = remote_counts.request_input.load(Ordering::Relaxed);
    let out_first = remote_counts.request_output.load(Ordering::Relaxed);
    assert_eq!(in_first, payload.len() as u64);

    // Same payload again: the dictionary is warm on both sides, so the
    // encoded request stream collapses to references.
    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload);
    let in_second = remote_counts.request_input.load(Ordering::Relaxed) - in_first;
    let out_second = remote_counts.request_output.load(Ordering::Relaxed) - out_first;

    assert_eq!(in_second, payload.len() as u64);
    assert!(
        out_second < in_second / 2,
        "expected heavy dedup on the second pass: {out_second} encoded bytes from {in_second}"
    );
    Ok(())
}

#[tokio::test]
async fn compression_and_dedup_stack() -> anyhow::Result<()> {
    let origin = spawn_echo_origin().await?;

    let mut client_remote = xcodec_memory(false);
    client_remote.compressor = Some(6);
    let mut server_local = xcodec_memory(false);
    server_local.compressor = Some(6);

    let (client, _server) = spawn_pair(&origin, client_remote, server_local, |_| {}).await?;

    let payload = repetitive_payload(32 * 1024);
    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload);
    Ok(())
}

#[tokio::test]
async fn secure_pair_round_trips() -> anyhow::Result<()> {
    let origin = spawn_echo_origin().await?;
    let (client, _server) = spawn_pair(
        &origin,
        xcodec_memory(false),
        xcodec_memory(false),
        |stanza| stanza.secure = true,
    )
    .await?;

    let payload = repetitive_payload(16 * 1024);
    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload, "ssh + dedup stack must be transparent");
    Ok(())
}

#[tokio::test]
async fn secure_plain_pair_round_trips() -> anyhow::Result<()> {
    // Encryption without any codec: raw bytes ride untagged in the SSH
    // packets between the proxies.
    let origin = spawn_echo_origin().await?;
    let (client, _server) = spawn_pair(
        &origin,
        CodecStanza::default(),
        CodecStanza::default(),
        |stanza| stanza.secure = true,
    )
    .await?;

    let payload = b"over the encrypted pair".to_vec();
    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload);
    Ok(())
}

#[tokio::test]
async fn interleaved_connections_share_the_dictionary() -> anyhow::Result<()> {
    let origin = spawn_echo_origin().await?;
    let (client, _server) =
        spawn_pair(&origin, xcodec_memory(false), xcodec_memory(false), |_| {}).await?;

    let payload = repetitive_payload(8 * 1024);
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let addr = client.addr();
        let payload = payload.clone();
        tasks.push(tokio::spawn(async move {
            echo_through(&addr, &payload).await
        }));
    }
    for task in tasks {
        let echoed = task.await??;
        assert_eq!(echoed, payload, "concurrent connections must not corrupt each other");
    }
    Ok(())
}

#[tokio::test]
async fn half_close_drains_both_directions() -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let origin = spawn_echo_origin().await?;
    let (client, _server) =
        spawn_pair(&origin, xcodec_memory(false), xcodec_memory(false), |_| {}).await?;

    let mut socket = TcpStream::connect(client.addr()).await?;
    let payload = repetitive_payload(4 * 1024);

    // Close our write side immediately after the payload; the response
    // must still arrive in full before EOF.
    socket.write_all(&payload).await?;
    socket.shutdown().await?;

    let mut echoed = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, socket.read_to_end(&mut echoed)).await??;
    assert_eq!(echoed, payload, "half-close must not cut the response short");
    Ok(())
}

#[tokio::test]
async fn coss_backed_pair_round_trips() -> anyhow::Result<()> {
    let origin = spawn_echo_origin().await?;
    let cache_dir = tempfile::tempdir()?;

    let mut server_local = xcodec_memory(false);
    server_local.cache = wanproxy_core::config::CacheKind::Coss;
    server_local.cache_path = cache_dir.path().to_path_buf();
    server_local.size_mb = 1;

    let (client, _server) =
        spawn_pair(&origin, xcodec_memory(false), server_local, |_| {}).await?;

    let payload = repetitive_payload(16 * 1024);
    let echoed = echo_through(&client.addr(), &payload).await?;
    assert_eq!(echoed, payload);

    // The cache directory now holds the identity and the cache file.
    assert!(cache_dir.path().join("UUID").exists());
    let uuid = std::fs::read_to_string(cache_dir.path().join("UUID"))?;
    assert!(cache_dir
        .path()
        .join(format!("{}.wpc", uuid.trim()))
        .exists());
    Ok(())
}
