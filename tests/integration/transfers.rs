use crate::*;

use ferry_engine::{LocalFile, RemoteFile};

#[tokio::test(flavor = "multi_thread")]
async fn upload_in_five_mib_chunks_is_byte_identical() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), 5 * MIB).await?;

    let data = write_pattern(&client_root.path().join("data.bin"), 12 * MIB)?;
    let client = client(client_root.path(), 5 * MIB)?;
    client
        .upload_file(
            &LocalFile::new("data.bin"),
            &RemoteFile::new("127.0.0.1", addr.port(), "incoming/data.bin"),
        )
        .await?;

    let stored = std::fs::read(server_root.path().join("incoming/data.bin"))?;
    assert_eq!(stored.len(), data.len());
    assert!(stored == data, "uploaded content differs");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn download_is_byte_identical() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), MIB).await?;

    let data = write_pattern(&server_root.path().join("files/report.bin"), 3 * MIB + 17)?;
    let client = client(client_root.path(), MIB)?;
    client
        .download_file(
            &RemoteFile::new("127.0.0.1", addr.port(), "files/report.bin"),
            &LocalFile::new("copies/report.bin"),
        )
        .await?;

    let fetched = std::fs::read(client_root.path().join("copies/report.bin"))?;
    assert!(fetched == data, "downloaded content differs");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_file_round_trips() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), MIB).await?;

    std::fs::write(server_root.path().join("empty"), b"")?;
    let client = client(client_root.path(), MIB)?;
    client
        .download_file(
            &RemoteFile::new("127.0.0.1", addr.port(), "empty"),
            &LocalFile::new("empty.copy"),
        )
        .await?;

    let meta = std::fs::metadata(client_root.path().join("empty.copy"))?;
    assert!(meta.is_file());
    assert_eq!(meta.len(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn download_overwrites_existing_destination() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), 64 * 1024).await?;

    let data = write_pattern(&server_root.path().join("short.bin"), 100_000)?;
    write_pattern(&client_root.path().join("short.bin"), 400_000)?;

    let client = client(client_root.path(), 64 * 1024)?;
    client
        .download_file(
            &RemoteFile::new("127.0.0.1", addr.port(), "short.bin"),
            &LocalFile::new("short.bin"),
        )
        .await?;

    assert!(std::fs::read(client_root.path().join("short.bin"))? == data);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_uploads_do_not_interfere() -> Result<()> {
    let server_root = tempfile::tempdir()?;
    let client_root = tempfile::tempdir()?;
    let (_server, addr) = start_server(server_root.path(), MIB).await?;

    let a = write_pattern(&client_root.path().join("a.bin"), 2 * MIB + 3)?;
    let b = write_pattern(&client_root.path().join("b.bin"), MIB / 2)?;
    let client = client(client_root.path(), 256 * 1024)?;

    let port = addr.port();
    let (local_a, remote_a) = (LocalFile::new("a.bin"), RemoteFile::new("127.0.0.1", port, "a.bin"));
    let (local_b, remote_b) = (LocalFile::new("b.bin"), RemoteFile::new("127.0.0.1", port, "b.bin"));
    let (ra, rb) = tokio::join!(
        client.upload_file(&local_a, &remote_a),
        client.upload_file(&local_b, &remote_b),
    );
    ra?;
    rb?;

    assert!(std::fs::read(server_root.path().join("a.bin"))? == a);
    assert!(std::fs::read(server_root.path().join("b.bin"))? == b);
    Ok(())
}
