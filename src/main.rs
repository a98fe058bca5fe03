use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use netgauge::config::{self, AppConfig, ExecutionMode};
use netgauge::events::{MeasurementEvent, ProgressUpdate};
use netgauge::lan::{LanDiscovery, LanSpeedServer, LanSpeedSession};
use netgauge::provider::get_all_providers;
use netgauge::{report, MultiServerCoordinator};

#[derive(Parser)]
#[command(
    name = "netgauge",
    about = "Multi-provider internet speed tests and peer-to-peer LAN speed tests",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides NETGAUGE_CONFIG and the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers and whether their backend is installed
    Providers {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run internet speed tests against every enabled provider
    SpeedTest {
        /// Only run this provider (e.g. "Cloudflare")
        #[arg(long)]
        provider: Option<String>,

        /// Run providers one at a time instead of all at once
        #[arg(long)]
        sequential: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Serve LAN speed tests and advertise this host
    LanServe {
        /// Listen address
        #[arg(long)]
        bind: Option<String>,

        /// Do not announce this host on the LAN
        #[arg(long)]
        no_advertise: bool,
    },

    /// Listen for LAN peers and list them
    LanDiscover {
        /// Seconds to listen
        #[arg(long, default_value = "5")]
        wait: u64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run a LAN speed test against a peer
    LanTest {
        /// Peer address (host:port); discovered automatically when omitted
        #[arg(long)]
        peer: Option<SocketAddr>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(),
    };
    init_tracing(&cfg.logging.level, cli.log_json || cfg.logging.json);

    match cli.command {
        Commands::Providers { json } => list_providers(&cfg, json),
        Commands::SpeedTest {
            provider,
            sequential,
            json,
        } => speed_test(&cfg, provider, sequential, json).await,
        Commands::LanServe { bind, no_advertise } => lan_serve(cfg, bind, no_advertise).await,
        Commands::LanDiscover { wait, json } => lan_discover(&cfg, wait, json).await,
        Commands::LanTest { peer, json } => lan_test(&cfg, peer, json).await,
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancelled on the first CTRL-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    token
}

fn list_providers(cfg: &AppConfig, json: bool) -> Result<()> {
    let providers = get_all_providers(&cfg.providers);
    if json {
        let rows: Vec<_> = providers
            .iter()
            .map(|p| {
                serde_json::json!({
                    "descriptor": p.descriptor(),
                    "available": p.is_available(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<12} | {:<10} | {:<9} | Description", "Provider", "Parallel", "Installed");
    println!("{:-<12}-|-{:-<10}-|-{:-<9}-|-{:-<40}", "", "", "", "");
    for p in &providers {
        let d = p.descriptor();
        println!(
            "{:<12} | {:<10} | {:<9} | {}",
            d.name,
            if d.supports_parallel_mode { "yes" } else { "no" },
            if p.is_available() { "yes" } else { "no" },
            d.description
        );
    }
    Ok(())
}

async fn speed_test(cfg: &AppConfig, provider: Option<String>, sequential: bool, json: bool) -> Result<()> {
    let mut coordinator = MultiServerCoordinator::from_config(cfg);
    if sequential {
        coordinator = coordinator.with_mode(ExecutionMode::Sequential);
    }
    let coordinator = Arc::new(coordinator);

    let interrupt = ctrl_c_token();
    let stopper = Arc::clone(&coordinator);
    tokio::spawn(async move {
        interrupt.cancelled().await;
        stopper.stop_all().await;
    });

    if !json {
        let mut events = coordinator.subscribe();
        tokio::spawn(async move {
            let mut last_phase = std::collections::HashMap::new();
            while let Ok(event) = events.recv().await {
                if let MeasurementEvent::Progress {
                    update: ProgressUpdate::Provider(p),
                    ..
                } = event
                {
                    if last_phase.insert(p.provider.clone(), p.phase) != Some(p.phase) {
                        eprintln!("  {:<12} {}", p.provider, p.phase);
                    }
                }
            }
        });
    }

    let results = match provider {
        Some(name) => vec![coordinator.run_single(&name).await?],
        None => coordinator.run_all().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!();
        for result in &results {
            println!("{}", report::format_summary(result));
        }
    }

    if results.iter().all(|r| !r.is_success()) {
        bail!("no provider completed successfully");
    }
    Ok(())
}

async fn lan_serve(cfg: AppConfig, bind: Option<String>, no_advertise: bool) -> Result<()> {
    let mut server_cfg = cfg.lan.server.clone();
    if let Some(bind) = bind {
        server_cfg.listen_address = bind;
    }

    let host_id = uuid::Uuid::new_v4().to_string();
    let server = LanSpeedServer::bind(&server_cfg, host_id.clone()).await?;
    let addr = server.local_addr()?;

    println!();
    println!("  netgauge LAN server");
    println!("  ===================");
    println!("  Name    : {}", server.server_name());
    println!("  Host ID : {}", host_id);
    println!("  Listen  : {}", addr);
    println!();

    let discovery = LanDiscovery::new(cfg.lan.discovery.clone(), host_id, server.server_name().to_string());
    if !no_advertise {
        discovery
            .start_advertising(addr.port())
            .await
            .context("failed to start advertising")?;
    }

    let cancel = ctrl_c_token();
    server.serve(cancel).await?;
    discovery.shutdown().await;
    Ok(())
}

async fn lan_discover(cfg: &AppConfig, wait: u64, json: bool) -> Result<()> {
    let discovery = LanDiscovery::new(
        cfg.lan.discovery.clone(),
        uuid::Uuid::new_v4().to_string(),
        config::local_host_name(),
    );
    discovery.start_discovery().await?;

    let cancel = ctrl_c_token();
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
    }
    let devices = discovery.devices().await;
    discovery.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No LAN peers found.");
    } else {
        println!("{:<24} | {:<22} | Host ID", "Name", "Address");
        println!("{:-<24}-|-{:-<22}-|-{:-<36}", "", "", "");
        for d in devices {
            println!("{:<24} | {:<22} | {}", d.name, d.address, d.id);
        }
    }
    Ok(())
}

async fn lan_test(cfg: &AppConfig, peer: Option<SocketAddr>, json: bool) -> Result<()> {
    let (addr, name) = match peer {
        Some(addr) => (addr, String::new()),
        None => {
            let discovery = LanDiscovery::new(
                cfg.lan.discovery.clone(),
                uuid::Uuid::new_v4().to_string(),
                config::local_host_name(),
            );
            discovery.start_discovery().await?;
            // One advertisement interval plus slack is enough to hear every peer.
            tokio::time::sleep(cfg.lan.discovery.advertise_interval() + Duration::from_secs(1)).await;
            let devices = discovery.devices().await;
            discovery.shutdown().await;
            let device = devices
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no LAN peers found; pass --peer"))?;
            (device.address, device.name)
        }
    };

    let session = LanSpeedSession::new(cfg.lan.test.clone(), config::local_host_name());
    let interrupt = ctrl_c_token();
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        interrupt.cancelled().await;
        cancel.cancel();
    });

    if !json {
        let mut progress = session.subscribe();
        tokio::spawn(async move {
            let mut last = None;
            while progress.changed().await.is_ok() {
                let p = progress.borrow_and_update().clone();
                if last != Some(p.phase) {
                    eprintln!("  {}", p.phase);
                    last = Some(p.phase);
                }
            }
        });
    }

    let result = session
        .run(addr, &name)
        .await
        .with_context(|| format!("LAN test against {} failed", addr))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", report::format_lan_summary(&result));
    }
    Ok(())
}
