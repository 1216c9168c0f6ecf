//! Relay Tunnel - CLI Entry Point
//!
//! Loads the YAML configuration, wires the client and runs the tunnel until
//! Ctrl-C or a fatal error.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use relay_tunnel::{Client, Config, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "relay-tunnel")]
#[command(version = VERSION)]
#[command(about = "Circumvention tunnel client with local SOCKS5, HTTP and DNS proxies")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Egress region (overrides config)
    #[arg(short = 'r', long = "region")]
    region: Option<String>,

    /// Route the whole device through the tunnel
    #[arg(long = "whole-device")]
    whole_device: bool,

    /// Log level (overrides config)
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // Install aws-lc-rs as the default crypto provider for rustls
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .thread_name("relay-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("relay_tunnel={}", level).parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match Config::load_async(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load configuration from {}: {}",
                args.config.display(),
                e
            );
            std::process::exit(1);
        }
    };

    // Apply CLI overrides
    if let Some(dir) = args.directory {
        config.data_dir = dir;
    }
    if let Some(region) = args.region {
        config.egress_region = region;
    }
    if args.whole_device {
        config.tunnel_whole_device = true;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level, &config.log_format)?;
    info!("Relay Tunnel v{}", VERSION);
    info!("Loaded configuration from: {}", args.config.display());

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let client = match Client::new(config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to initialize client: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = client.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.stop();
        }
    });

    if let Err(e) = client.run().await {
        error!("Tunnel error: {}", e);
        std::process::exit(1);
    }

    info!("Relay Tunnel stopped");
    Ok(())
}
