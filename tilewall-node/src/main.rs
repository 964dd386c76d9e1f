//! tilewall-node entry point.
//!
//! ```text
//! tilewall-node                    Run the role named in tilewall.toml
//! tilewall-node --config <path>    Load a custom config (TOML or JSON)
//! tilewall-node --role <role>      Override the configured role
//! tilewall-node --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tilewall_node::config::{Role, WallConfig};
use tilewall_node::service::WallService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tilewall-node", about = "Tiled display wall bridge, display node and sync coordinator")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "tilewall.toml")]
    config: PathBuf,

    /// Run this role instead of the configured one.
    #[arg(long, value_parser = parse_role)]
    role: Option<Role>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

fn parse_role(s: &str) -> Result<Role, String> {
    match s {
        "bridge" => Ok(Role::Bridge),
        "display" => Ok(Role::Display),
        "sync" => Ok(Role::Sync),
        other => Err(format!("unknown role {other:?} (bridge, display, sync)")),
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&WallConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = WallConfig::load(&cli.config);
    if let Some(role) = cli.role {
        config.role = role;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tilewall-node v{}", env!("CARGO_PKG_VERSION"));
    info!(role = ?config.role, transport = ?config.network.transport, "configuration loaded");

    let service = WallService::new(config);
    let ctx = service.context().clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        ctx.shutdown();
    });

    service.run().await?;
    Ok(())
}
