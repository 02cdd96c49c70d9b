//! Duo Bridge - Main Entry Point
//!
//! Speaks the JSON-lines bridge protocol on stdin/stdout for the host
//! identity provider.

use anyhow::Result;
use tracing::info;

use duo_bridge::config::log_filter;
use duo_bridge::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Logs go to stderr, stdout carries the protocol
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    print_banner();

    let config = Config::from_env()?;
    duo_bridge::run_stdio(config).await?;

    Ok(())
}

fn print_banner() {
    info!("╔═══════════════════════════════════════════════════╗");
    info!("║                                                   ║");
    info!("║   ██████╗ ██╗   ██╗ ██████╗                       ║");
    info!("║   ██╔══██╗██║   ██║██╔═══██╗                      ║");
    info!("║   ██║  ██║██║   ██║██║   ██║                      ║");
    info!("║   ██║  ██║██║   ██║██║   ██║                      ║");
    info!("║   ██████╔╝╚██████╔╝╚██████╔╝                      ║");
    info!("║   ╚═════╝  ╚═════╝  ╚═════╝                       ║");
    info!("║                                                   ║");
    info!("║   Duo Web second-factor bridge v{:<18}║", env!("CARGO_PKG_VERSION"));
    info!("║                                                   ║");
    info!("╚═══════════════════════════════════════════════════╝");
}
