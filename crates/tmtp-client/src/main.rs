//! # tmtp-client
//!
//! Messaging client endpoint. Opens the local store, finishes any staged
//! operation a crash left behind, then keeps one relay link per service:
//! received messages land in the thread store and queued sends go out one
//! acknowledged record at a time.

mod config;

use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tmtp_net::{spawn_link, Event, LinkCommand, LinkHandle, LinkNotification};
use tmtp_store::{CrashHook, Registry};

use crate::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tmtp_client=debug,tmtp_net=debug")),
        )
        .init();

    info!("Starting tmtp client v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store (runs recovery)
    // -----------------------------------------------------------------------
    let crash = CrashHook::from_setting(config.crash_at.as_deref());
    let store_dir = config.store_dir.clone();
    let registry = tokio::task::spawn_blocking(move || Registry::open(store_dir, crash)).await??;
    let registry = Arc::new(registry);

    if let Some(service) = config.service_config() {
        if registry.get(&service.name).is_none() {
            let name = service.name.clone();
            let reg = registry.clone();
            tokio::task::spawn_blocking(move || reg.add_service(service)).await??;
            info!(service = %name, "Service created");
        }
    }

    let services = registry.services();
    if services.is_empty() {
        warn!("No services in store; set TMTP_SERVICE and TMTP_RELAY_ADDR to create one");
    }

    // -----------------------------------------------------------------------
    // 4. One relay link per service
    // -----------------------------------------------------------------------
    let mut links = Vec::new();
    for service in services {
        let name = service.name().to_string();
        info!(
            service = %name,
            queued = service.queue().len(),
            registered = service.config().is_registered(),
            "Starting relay link"
        );
        let LinkHandle {
            cmd_tx,
            mut notif_rx,
            task,
            ..
        } = spawn_link(service, config.link_config());

        tokio::spawn(async move {
            while let Some(notification) = notif_rx.recv().await {
                log_notification(&name, notification);
            }
        });
        links.push((cmd_tx, task));
    }

    // -----------------------------------------------------------------------
    // 5. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    for (cmd_tx, _) in &links {
        let _ = cmd_tx.send(LinkCommand::Shutdown).await;
    }
    for (_, task) in links {
        if let Err(e) = task.await {
            warn!(error = %e, "Link task failed");
        }
    }

    Ok(())
}

fn log_notification(service: &str, notification: LinkNotification) {
    match notification {
        LinkNotification::Connected { addr } => {
            info!(service, addr = %addr, "Relay connected");
        }
        LinkNotification::Disconnected { reason } => {
            info!(service, reason = %reason, "Relay disconnected");
        }
        LinkNotification::Event(Event::Delivered { id, outcome }) => {
            info!(service, id = %id, outcome = ?outcome, "Message received");
        }
        LinkNotification::Event(Event::Acked { id, outcome }) => {
            info!(service, id = %id, outcome = ?outcome, "Send completed");
        }
        LinkNotification::Event(Event::Rejected { id, error }) => {
            warn!(service, id = %id, error = %error, "Send rejected");
        }
        LinkNotification::Event(event) => {
            debug!(service, event = ?event, "Link event");
        }
    }
}
