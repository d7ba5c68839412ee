use anyhow::Context;
use clap::Parser;
use etude_core::logging::{init_logging_json, init_logging_with_level};
use etude_core::{Server, ServerConfig};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "etude")]
#[command(about = "Multi-threaded HTTP/1.1 static file and CGI server")]
#[command(version)]
struct Args {
    /// TOML file with a [server] table; flags below override it
    #[arg(short, long, env = "ETUDE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "ETUDE_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "ETUDE_PORT")]
    port: Option<u16>,

    /// Directory to serve files and scripts from
    #[arg(short, long, env = "ETUDE_DOC_ROOT")]
    doc_root: Option<PathBuf>,

    /// Worker threads
    #[arg(short, long, env = "ETUDE_WORKERS")]
    workers: Option<usize>,

    /// Default log level; RUST_LOG takes precedence
    #[arg(long, env = "ETUDE_LOG", default_value = "info")]
    log_level: String,

    /// Log one JSON object per line
    #[arg(long)]
    log_json: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "log_level")]
    quiet: bool,
}

impl Args {
    fn log_level(&self) -> &str {
        if self.quiet { "warn" } else { &self.log_level }
    }

    /// Config file (or defaults) with command-line values laid over it.
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(doc_root) = &self.doc_root {
            config.doc_root = doc_root.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    // Load .env before clap reads ETUDE_* variables
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    if args.log_json {
        init_logging_json(args.log_level());
    } else {
        init_logging_with_level(args.log_level());
    }

    let config = args.server_config()?;
    let server = Server::bind(config).context("failed to start server")?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        if handle.is_shutdown() {
            warn!("second interrupt, exiting immediately");
            std::process::exit(130);
        }
        info!("interrupt received, shutting down");
        handle.shutdown();
    })
    .context("failed to install signal handler")?;

    if let Err(e) = server.run() {
        error!(error = %e, "server stopped with an error");
        return Err(e.into());
    }
    Ok(())
}
