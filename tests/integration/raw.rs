//! Protocol-level checks with a hand-driven peer.

use crate::*;

use ferry_core::{ChunkKind, ResponseCode};
use ferry_engine::chunk::split;

#[tokio::test(flavor = "multi_thread")]
async fn upload_is_acknowledged_per_chunk_then_ok() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), 5 * MIB).await?;

    let source = local.path().join("big.bin");
    let data = write_pattern(&source, 12 * MIB)?;
    let chunks = split(&source, "big.bin", 5 * MIB)?;
    let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ChunkKind::Start,
            ChunkKind::Middle,
            ChunkKind::Middle,
            ChunkKind::Middle,
            ChunkKind::End
        ]
    );

    let mut peer = RawPeer::connect(addr).await?;
    for chunk in chunks {
        peer.send(&Message::DataChunk(chunk)).await?;
    }
    peer.send(&Message::FileUploadTail {
        source_path: "big.bin".into(),
        dest_path: "big.bin".into(),
    })
    .await?;

    for n in 0..5 {
        let reply = peer.recv(Duration::from_secs(5)).await?;
        assert_eq!(reply, Message::ChunkAck, "reply {n}");
    }
    assert_eq!(peer.recv(Duration::from_secs(5)).await?, Message::ok());

    assert!(std::fs::read(server_root.path().join("big.bin"))? == data);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn download_streams_chunks_then_ok() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), 1000).await?;
    let data = write_pattern(&server_root.path().join("small.bin"), 2500)?;

    let mut peer = RawPeer::connect(addr).await?;
    peer.send(&Message::FileDownloadRequest {
        source_path: "small.bin".into(),
        dest_path: "here/small.bin".into(),
    })
    .await?;

    let mut received = Vec::new();
    let mut kinds = Vec::new();
    loop {
        match peer.recv(Duration::from_secs(5)).await? {
            Message::DataChunk(chunk) => {
                assert_eq!(chunk.store_path, "here/small.bin");
                kinds.push(chunk.kind);
                match chunk.payload {
                    ferry_core::ChunkPayload::Buffer(bytes) => received.extend_from_slice(&bytes),
                    ferry_core::ChunkPayload::Region(_) => bail!("inbound chunk decoded as region"),
                }
            }
            Message::Response { code } => {
                assert_eq!(code, ResponseCode::Ok);
                break;
            }
            other => bail!("unexpected message: {other:?}"),
        }
    }

    assert_eq!(kinds.first(), Some(&ChunkKind::Start));
    assert_eq!(kinds.last(), Some(&ChunkKind::End));
    assert_eq!(kinds.len(), 5);
    assert!(received == data);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn server_closes_idle_connection() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let mut server = FileServer::new(ServerConfig {
        root_path: server_root.path().to_path_buf(),
        bind_addr: [127, 0, 0, 1].into(),
        idle_detection_secs: 1,
        ..ServerConfig::default()
    })?;
    let addr = server.start(0).await?;

    let mut peer = RawPeer::connect(addr).await?;
    assert!(peer.closed_within(Duration::from_secs(4)).await);
    wait_until(Duration::from_secs(2), || server.registry().is_empty()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_frame_closes_connection() -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let server_root = tempfile::tempdir()?;
    let mut server = FileServer::new(ServerConfig {
        root_path: server_root.path().to_path_buf(),
        bind_addr: [127, 0, 0, 1].into(),
        max_frame_length: 64,
        ..ServerConfig::default()
    })?;
    let addr = server.start(0).await?;

    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    let header = ferry_core::wire::encode_header(1024, ferry_core::wire::type_id::CHUNK_ACK)?;
    stream.write_all(&header).await?;

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(3), async {
        use tokio::io::AsyncReadExt;
        // Drain the error response, if any, until end of stream.
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(read.is_ok(), "server kept the connection open");
    Ok(())
}
