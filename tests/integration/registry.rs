use crate::*;

use ferry_core::ResponseCode;
use ferry_engine::RegistryError;

#[tokio::test(flavor = "multi_thread")]
async fn registry_tracks_broadcasts_and_reads() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let (server, addr) = start_server(server_root.path(), MIB).await?;
    let registry = server.registry().clone();

    let mut a = RawPeer::connect(addr).await?;
    let mut b = RawPeer::connect(addr).await?;
    wait_until(Duration::from_secs(2), || registry.len() == 2).await?;

    let mut peers = registry.peers();
    peers.sort();
    let mut expected = vec![a.local_addr, b.local_addr];
    expected.sort();
    assert_eq!(peers, expected);
    assert!(registry.is_active(a.local_addr));

    // Broadcast reaches every connection.
    let sent = registry
        .broadcast(Message::response(ResponseCode::InternalError))
        .await?;
    assert_eq!(sent, 2);
    for peer in [&mut a, &mut b] {
        assert_eq!(
            peer.recv(Duration::from_secs(2)).await?,
            Message::response(ResponseCode::InternalError)
        );
    }

    // Non-request messages are queued per peer.
    a.send(&Message::ChunkAck).await?;
    assert_eq!(
        registry.read(a.local_addr, Duration::from_secs(2)).await?,
        Message::ChunkAck
    );
    assert!(matches!(
        registry.read(b.local_addr, Duration::from_millis(100)).await,
        Err(RegistryError::Timeout { .. })
    ));

    b.send(&Message::ok()).await?;
    let reader = {
        let registry = registry.clone();
        let peer = b.local_addr;
        tokio::task::spawn_blocking(move || registry.read_sync(peer))
    };
    assert_eq!(reader.await??, Message::ok());

    // Disconnects are noticed.
    let gone = a.local_addr;
    drop(a);
    wait_until(Duration::from_secs(2), || !registry.is_active(gone)).await?;
    assert_eq!(registry.peers(), vec![b.local_addr]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_tracked_connections() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let (server, addr) = start_server(server_root.path(), MIB).await?;

    let mut peer = RawPeer::connect(addr).await?;
    wait_until(Duration::from_secs(2), || server.registry().len() == 1).await?;

    server.shutdown();
    assert!(peer.closed_within(Duration::from_secs(2)).await);
    wait_until(Duration::from_secs(2), || server.registry().is_empty()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unread_acks_are_capped_per_peer() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let mut server = FileServer::new(ServerConfig {
        root_path: server_root.path().to_path_buf(),
        bind_addr: [127, 0, 0, 1].into(),
        inbound_queue_capacity: 4,
        ..ServerConfig::default()
    })?;
    let addr = server.start(0).await?;
    let registry = server.registry().clone();

    let mut peer = RawPeer::connect(addr).await?;
    wait_until(Duration::from_secs(2), || registry.len() == 1).await?;
    for _ in 0..50 {
        peer.send(&Message::ChunkAck).await?;
    }
    peer.send(&Message::ok()).await?;
    // Give the server time to consume everything sent.
    tokio::time::sleep(Duration::from_millis(300)).await;

    for _ in 0..4 {
        assert_eq!(
            registry.read(peer.local_addr, Duration::from_secs(1)).await?,
            Message::ChunkAck
        );
    }
    assert!(matches!(
        registry.read(peer.local_addr, Duration::from_millis(100)).await,
        Err(RegistryError::Timeout { .. })
    ));
    assert!(registry.is_active(peer.local_addr));
    Ok(())
}
