use crate::*;

use ferry_core::ResponseCode;
use ferry_engine::{LocalFile, RemoteFile, RequestError};

#[tokio::test(flavor = "multi_thread")]
async fn download_of_missing_file_reports_not_found() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), MIB).await?;

    let client = client(client_root.path(), MIB)?;
    let err = client
        .download_file(
            &RemoteFile::new("127.0.0.1", addr.port(), "nope.bin"),
            &LocalFile::new("nope.bin"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(ResponseCode::FileNotFound));
    assert!(!client_root.path().join("nope.bin").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn download_of_directory_reports_not_a_file() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    std::fs::create_dir(server_root.path().join("folder"))?;
    let (_server, addr) = start_server(server_root.path(), MIB).await?;

    let client = client(client_root.path(), MIB)?;
    let err = client
        .download_file(
            &RemoteFile::new("127.0.0.1", addr.port(), "folder"),
            &LocalFile::new("folder"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(ResponseCode::NotAFile));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn download_of_server_root_reports_not_a_file() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), MIB).await?;

    let client = client(client_root.path(), MIB)?;
    for source in [".", "/", "a/.."] {
        let remote = RemoteFile::new("127.0.0.1", addr.port(), source);
        let local = LocalFile::new("root.copy");
        let err = client.download_file(&remote, &local).await.unwrap_err();
        assert_eq!(err.code(), Some(ResponseCode::NotAFile), "source {source:?}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unaddressable_source_fails_before_any_chunk() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let huge = std::fs::File::create(server_root.path().join("huge.bin"))?;
    huge.set_len(ferry_core::wire::MAX_ADDRESSABLE_FILE_LEN + 1)?;
    let (_server, addr) = start_server(server_root.path(), 5 * MIB).await?;

    let client = client(client_root.path(), 5 * MIB)?;
    let remote = RemoteFile::new("127.0.0.1", addr.port(), "huge.bin");
    let local = LocalFile::new("huge.bin");
    let err = client.download_file(&remote, &local).await.unwrap_err();

    assert_eq!(err.code(), Some(ResponseCode::InternalError));
    assert!(!client_root.path().join("huge.bin").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn path_outside_root_is_an_internal_error() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), MIB).await?;

    let client = client(client_root.path(), MIB)?;
    let err = client
        .download_file(
            &RemoteFile::new("127.0.0.1", addr.port(), "../../etc/hostname"),
            &LocalFile::new("stolen"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(ResponseCode::InternalError));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_peer_is_reported_as_not_responding() -> Result<()> {
    let client_root = tempfile::tempdir()?;

    // Accepts and holds the socket without ever replying.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let holder = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(socket);
        Ok::<_, std::io::Error>(())
    });

    let client = FileClient::new(ClientConfig {
        idle_detection_secs: 1,
        ..client_config(client_root.path(), MIB)
    })?;
    let started = tokio::time::Instant::now();
    let err = client
        .download_file(
            &RemoteFile::new("127.0.0.1", port, "anything"),
            &LocalFile::new("anything"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(ResponseCode::PeerNotResponding));
    assert!(started.elapsed() < Duration::from_secs(5));
    holder.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_closing_early_resolves_as_channel_closed() -> Result<()> {
    let client_root = tempfile::tempdir()?;

    // Accepts and hangs up immediately.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let client = client(client_root.path(), MIB)?;
    let err = client
        .download_file(
            &RemoteFile::new("127.0.0.1", port, "anything"),
            &LocalFile::new("anything"),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            ferry_engine::ClientError::Request(RequestError::ChannelClosed)
                | ferry_engine::ClientError::Send(_)
        ),
        "unexpected error: {err}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_chunk_sequence_gets_error_response() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), MIB).await?;

    // END without a START: the store stage fails and the connection is
    // answered with an error code, then closed.
    let mut peer = RawPeer::connect(addr).await?;
    peer.send(&Message::DataChunk(ferry_core::DataChunk::from_bytes(
        ferry_core::ChunkKind::End,
        "orphan.bin",
        Default::default(),
    )))
    .await?;

    let reply = peer.recv(Duration::from_secs(2)).await?;
    assert_eq!(reply, Message::response(ResponseCode::InternalError));
    assert!(peer.closed_within(Duration::from_secs(2)).await);
    assert!(!server_root.path().join("orphan.bin").exists());
    Ok(())
}
