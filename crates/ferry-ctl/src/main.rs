//! ferry-ctl — command-line client for Ferry servers.

use anyhow::{Context, Result};

use ferry_core::config::FerryConfig;
use ferry_engine::{ClientError, FileClient, LocalFile, RemoteFile};

fn print_usage() {
    println!("Usage: ferry-ctl [--root <dir>] [--chunk-size <bytes>] <command>");
    println!();
    println!("Commands:");
    println!("  download <host:port> <remote> <local>   Fetch a file from a server");
    println!("  upload <local> <host:port> <remote>     Send a file to a server");
    println!();
    println!("Options:");
    println!("  --root <dir>          Client root directory (default: from config)");
    println!("  --chunk-size <bytes>  Upload chunk size (default: from config)");
}

fn parse_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("expected <host:port>, got {target}"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {target}"))?;
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_download(client: &FileClient, target: &str, remote: &str, local: &str) -> Result<()> {
    let (host, port) = parse_target(target)?;
    client
        .download_file(&RemoteFile::new(host, port, remote), &LocalFile::new(local))
        .await
        .map_err(report)?;
    println!(
        "Downloaded {} -> {}",
        remote,
        client.config().root_path.join(local).display()
    );
    Ok(())
}

async fn cmd_upload(client: &FileClient, local: &str, target: &str, remote: &str) -> Result<()> {
    let (host, port) = parse_target(target)?;
    client
        .upload_file(&LocalFile::new(local), &RemoteFile::new(host, port, remote))
        .await
        .map_err(report)?;
    println!("Uploaded {} -> {}:{}", local, target, remote);
    Ok(())
}

/// Attach the response code, when there is one, to the error chain.
fn report(e: ClientError) -> anyhow::Error {
    match e.code() {
        Some(code) => anyhow::Error::new(e).context(format!("transfer failed with code {}", code.code())),
        None => anyhow::Error::new(e).context("transfer failed"),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });

    // Parse options
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--root" => {
                i += 1;
                config.client.root_path = args.get(i).context("--root requires a value")?.into();
            }
            "--chunk-size" => {
                i += 1;
                config.client.chunk_size = args
                    .get(i)
                    .context("--chunk-size requires a value")?
                    .parse()
                    .context("--chunk-size must be a number")?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    if matches!(remaining.as_slice(), [] | ["help"] | ["--help"] | ["-h"]) {
        print_usage();
        return Ok(());
    }

    std::fs::create_dir_all(&config.client.root_path).with_context(|| {
        format!(
            "failed to create client root {}",
            config.client.root_path.display()
        )
    })?;
    let client = FileClient::new(config.client).context("failed to start client")?;

    match remaining.as_slice() {
        ["download", target, remote, local] => cmd_download(&client, target, remote, local).await,
        ["upload", local, target, remote]   => cmd_upload(&client, local, target, remote).await,
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
