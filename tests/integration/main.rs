//! Ferry integration test harness.
//!
//! Every test runs a real server and client over loopback TCP, each with
//! its own temporary root directory:
//!
//!   cargo test --test integration
//!
//! Servers bind 127.0.0.1 on an ephemeral port, so tests can run in
//! parallel without sharing state.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::StreamExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use ferry_core::config::{ClientConfig, ServerConfig};
use ferry_core::{FrameCodec, Message};
use ferry_engine::{FileClient, FileServer};

mod failures;
mod raw;
mod registry;
mod transfers;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const MIB: u64 = 1024 * 1024;

/// Start a server rooted at `root` on an ephemeral loopback port.
pub async fn start_server(root: &Path, chunk_size: u64) -> Result<(FileServer, SocketAddr)> {
    let mut server = FileServer::new(ServerConfig {
        root_path: root.to_path_buf(),
        bind_addr: [127, 0, 0, 1].into(),
        chunk_size,
        ..ServerConfig::default()
    })?;
    let addr = server.start(0).await?;
    Ok((server, addr))
}

pub fn client_config(root: &Path, chunk_size: u64) -> ClientConfig {
    ClientConfig {
        root_path: root.to_path_buf(),
        chunk_size,
        ..ClientConfig::default()
    }
}

pub fn client(root: &Path, chunk_size: u64) -> Result<FileClient> {
    Ok(FileClient::new(client_config(root, chunk_size))?)
}

/// Write `len` bytes of a position-dependent pattern, so misplaced or
/// reordered ranges show up as content differences.
pub fn write_pattern(path: &Path, len: u64) -> Result<Vec<u8>> {
    let data: Vec<u8> = (0..len).map(|i| ((i * 31 + i / 4096) % 251) as u8).collect();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &data)?;
    Ok(data)
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// A hand-driven protocol peer: frames are written with the engine's
/// writer and read back through the frame codec.
pub struct RawPeer {
    pub local_addr: SocketAddr,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let local_addr = stream.local_addr()?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            local_addr,
            reader: FramedRead::new(read, FrameCodec::default()),
            writer,
        })
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        ferry_engine::connection::write_message(&mut self.writer, message).await?;
        Ok(())
    }

    /// Next decoded message, or an error on timeout or end of stream.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.reader.next()).await {
            Ok(Some(frame)) => {
                let frame = frame?;
                Ok(Message::decode(frame.type_id, frame.body)?)
            }
            Ok(None) => bail!("connection closed by peer"),
            Err(_) => bail!("no frame within {timeout:?}"),
        }
    }

    /// True once the peer has closed its side.
    pub async fn closed_within(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.reader.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        )
    }
}
