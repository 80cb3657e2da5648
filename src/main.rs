//! remotefs command line entry point

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use remotefs::backend::ftp::FtpFactory;
use remotefs::backend::{Backend, BackendRegistry, ByteStream, FileInfo};
use remotefs::config::Config;
use remotefs::{RemoteFsError, Result};

/// Print usage information
fn print_usage() {
    eprintln!("Usage: remotefs <config.yaml> <command> [args...]");
    eprintln!();
    eprintln!("remotefs - browse FTP and SMB mounts through one interface");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  forms                          Print the login form of every backend");
    eprintln!("  ls    <mount> [path]           List a directory");
    eprintln!("  cat   <mount> <path>           Write a file to stdout");
    eprintln!("  put   <mount> <local> <path>   Upload a local file");
    eprintln!("  mkdir <mount> <path>           Create a directory");
    eprintln!("  rm    <mount> <path>           Remove a file, or a tree when path ends with /");
    eprintln!("  mv    <mount> <from> <to>      Rename within one mount");
    eprintln!("  touch <mount> <path>           Create an empty file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  remotefs /etc/remotefs/config.yaml ls public /pub/");
}

fn build_registry(config: &Config) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(FtpFactory::new(config.ftp.clone())));
    #[cfg(feature = "libsmbclient")]
    registry.register(Arc::new(remotefs::backend::samba::SambaFactory::new(
        config.samba.clone(),
    )));
    registry
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!("Loaded configuration from {:?}", config_path);

    let registry = build_registry(&config);
    let outcome = run(&config, &registry, &args[2], &args[3..]).await;
    registry.shutdown().await;

    if let Err(e) = outcome {
        eprintln!("remotefs: {} (status {})", e, e.http_status());
        std::process::exit(1);
    }
}

async fn run(
    config: &Config,
    registry: &BackendRegistry,
    command: &str,
    args: &[String],
) -> Result<()> {
    if command == "forms" {
        let forms: Vec<_> = registry.forms().into_iter().map(|(_, form)| form).collect();
        let rendered = serde_yaml::to_string(&forms)
            .map_err(|e| RemoteFsError::InvalidArgument(e.to_string()))?;
        print!("{}", rendered);
        return Ok(());
    }

    let (mount_name, rest) = args.split_first().ok_or_else(|| {
        print_usage();
        RemoteFsError::InvalidArgument(format!("{} needs a mount name", command))
    })?;
    let mount = config
        .mount(mount_name)
        .ok_or_else(|| RemoteFsError::NotFound(format!("mount {}", mount_name)))?;

    info!("Connecting to mount {} ({})", mount.name, mount.kind);
    let backend = registry.init(mount.kind.as_str(), mount.params.clone()).await?;

    match (command, rest) {
        ("ls", []) => {
            let path = if mount.params.is_set("path") {
                mount.params.get("path").to_string()
            } else {
                backend.home().await?
            };
            list(backend.as_ref(), &path).await
        }
        ("ls", [path]) => list(backend.as_ref(), path).await,
        ("cat", [path]) => cat(backend.as_ref(), path).await,
        ("put", [local, path]) => {
            let content = local_file_stream(Path::new(local)).await?;
            backend.write(path, content).await
        }
        ("mkdir", [path]) => backend.create_dir(path).await,
        ("rm", [path]) => backend.remove(path).await,
        ("mv", [from, to]) => backend.rename(from, to).await,
        ("touch", [path]) => backend.touch(path).await,
        _ => {
            print_usage();
            Err(RemoteFsError::InvalidArgument(format!(
                "unknown command or wrong arguments: {}",
                command
            )))
        }
    }
}

async fn list(backend: &dyn Backend, path: &str) -> Result<()> {
    let mut entries = backend.list(path).await?;
    entries.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));
    for entry in &entries {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

fn format_entry(entry: &FileInfo) -> String {
    let kind = if entry.is_dir() { 'd' } else { '-' };
    let mtime = entry
        .mtime
        .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{} {:>12} {:>16} {}", kind, entry.size, mtime, entry.name)
}

async fn cat(backend: &dyn Backend, path: &str) -> Result<()> {
    let mut stream = backend.read(path).await?;
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.next().await {
        stdout.write_all(&chunk?).await?;
    }
    stdout.flush().await?;
    Ok(())
}

/// Stream a local file in fixed-size chunks
async fn local_file_stream(path: &Path) -> Result<ByteStream> {
    let mut file = tokio::fs::File::open(path).await?;
    Ok(Box::pin(async_stream::stream! {
        loop {
            let mut buf = vec![0u8; 64 * 1024];
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    yield Ok(bytes::Bytes::from(buf));
                }
                Err(e) => {
                    yield Err(RemoteFsError::from(e));
                    break;
                }
            }
        }
    }))
}
