use anyhow::Result;
use std::path::Path;
use tracing::info;

use stepper_comm_sim::SOCKET_PATH;
use stepper_comm_sim::emitter;

// No CLI and no environment surface: the socket path and timing are
// fixed protocol constants.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting speed emitter");
    info!("Control socket: {}", SOCKET_PATH);

    emitter::run(Path::new(SOCKET_PATH)).await
}
