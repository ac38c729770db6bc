//! Dedicated lockstep server binary.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lockstep::net::server::{GameServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!(
        version = lockstep::VERSION,
        bind = %config.bind_addr,
        revision = %config.session.identity.revision,
        "starting lockstep server"
    );

    let server = GameServer::new(config);

    // The dedicated server carries no game rules of its own; each frame
    // just burns one draw so the seed stream advances.
    server
        .run(|_frame, rng| {
            rng.next_u32();
        })
        .await?;

    info!("server stopped");
    Ok(())
}
