use std::sync::Arc;

use direct_messaging::config::Config;
use direct_messaging::delivery::DeliveryChannel;
use direct_messaging::server::Server;
use direct_messaging::storage::Storage;
use direct_messaging::store::MessageStore;
use direct_messaging::uploads::LocalObjectStore;
use log::{debug, error, info};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    env_logger::init();

    let storage = Storage::new(&config.database_url)?;
    let store = MessageStore::open(storage, DeliveryChannel::new(config.push_buffer)).await?;
    info!("{} messages in {}", store.message_count().await?, config.database_url);
    let uploads = LocalObjectStore::new(&config.upload_dir).await?;

    // Stand-in for the notification service: log every created message.
    let mut created = store.delivery().events();
    tokio::spawn(async move {
        loop {
            match created.recv().await {
                Ok(message) => debug!("notify {} of message {}", message.receiver, message.id.0),
                Err(RecvError::Lagged(missed)) => debug!("notification feed skipped {} messages", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Start server in a separate task
    let server = Server::new(store, Arc::new(uploads)).with_max_frame(config.max_frame_bytes);
    let server_addr = config.server_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = server.run(&server_addr).await {
            error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down server...");

    Ok(())
}
