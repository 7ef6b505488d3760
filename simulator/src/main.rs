use anyhow::Context;
use clap::Parser;
use midway_simulator::{Api, Simulator};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Pre-registered accounts, as `id:display name` or
    /// `id:display name:email`. May be repeated.
    #[arg(short, long)]
    account: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let simulator = Arc::new(Simulator::new());
    for entry in &args.account {
        let mut parts = entry.splitn(3, ':');
        let id = parts
            .next()
            .filter(|id| !id.is_empty())
            .with_context(|| format!("invalid account argument: {entry}"))?;
        let display_name = parts.next().unwrap_or(id);
        simulator.register_account(id, display_name, parts.next());
        info!(id, display_name, "registered account");
    }

    let api = Api::new(simulator);
    let app = api.router();

    // Start server
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}
