//! `keymux` CLI: serve a directory as mounted key-value storage over
//! HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keymux_core::{FsDriver, Storage};
use keymux_server::{ServerConfig, StorageServer};

#[derive(Parser)]
#[command(name = "keymux")]
#[command(version)]
#[command(about = "Serve a directory as key-value storage over HTTP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Arguments for the default command (serve).
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Start the storage server (the default command).
    Serve(ServeArgs),
}

#[derive(Args, Clone, Default)]
struct ServeArgs {
    /// Directory to serve.
    #[arg(value_name = "DIR")]
    path: Option<PathBuf>,

    /// Directory to serve (overrides the positional argument).
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Reject writes; every mutation becomes a silent no-op.
    #[arg(long)]
    read_only: bool,
}

impl ServeArgs {
    fn directory(&self) -> PathBuf {
        self.dir
            .clone()
            .or_else(|| self.path.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let args = match cli.command {
        Some(Command::Serve(args)) => args,
        None => cli.serve,
    };
    serve(args).await
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let dir = args.directory();
    let mut fs_config = keymux_core::FsDriverConfig::new(&dir);
    if args.read_only {
        fs_config = fs_config.read_only();
    }
    let driver = FsDriver::new(fs_config)?;
    let storage = Arc::new(Storage::with_root(Arc::new(driver)));

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        ..ServerConfig::default()
    };
    let mut server = StorageServer::new(storage, config);
    let port = server.start().await?;
    info!(dir = %dir.display(), port, "keymux serving");

    server
        .serve(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(err) => error!(%err, "failed to listen for shutdown signal"),
            }
        })
        .await?;

    info!("clean shutdown");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_prefers_the_flag_over_the_positional() {
        let args = ServeArgs {
            path: Some(PathBuf::from("positional")),
            dir: Some(PathBuf::from("flag")),
            ..ServeArgs::default()
        };
        assert_eq!(args.directory(), PathBuf::from("flag"));
    }

    #[test]
    fn directory_defaults_to_cwd() {
        assert_eq!(ServeArgs::default().directory(), PathBuf::from("."));
    }

    #[test]
    fn cli_parses_default_and_explicit_serve() {
        let cli = Cli::parse_from(["keymux", "--port", "9000", "data"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.port, 9000);
        assert_eq!(cli.serve.path, Some(PathBuf::from("data")));

        let cli = Cli::parse_from(["keymux", "serve", "--dir", "data", "--read-only"]);
        let Some(Command::Serve(args)) = cli.command else {
            panic!("expected serve subcommand");
        };
        assert_eq!(args.dir, Some(PathBuf::from("data")));
        assert!(args.read_only);
    }
}
