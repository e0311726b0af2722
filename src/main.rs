use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podium::bus::BusConsumer;
use podium::config::{listen_address_from_env, ServerConfig};
use podium::registry::CapabilityRegistry;
use podium::services::ServiceDescriptor;
use podium::tasks::{BackgroundTask, TaskRunner, TaskState};
use podium::types::address;
use podium::InteractionServer;

const SERVICE_CAPABILITY: &str = "interaction.service";

/// Log everything arriving at a presenter-side address
fn spawn_presenter_log(mut consumer: BusConsumer) {
    tokio::spawn(async move {
        while let Some(body) = consumer.recv().await {
            tracing::info!("[{}] {}", consumer.address(), body);
        }
    });
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podium=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting podium...");

    let config = ServerConfig::from_env();
    let (host, port) = listen_address_from_env();

    let server = match InteractionServer::create(host, port, config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let capabilities: CapabilityRegistry<ServiceDescriptor> = CapabilityRegistry::new();
    for descriptor in ServiceDescriptor::defaults() {
        capabilities.register(SERVICE_CAPABILITY, Arc::new(descriptor));
    }
    let descriptors: Vec<ServiceDescriptor> = capabilities
        .lookup(SERVICE_CAPABILITY)
        .iter()
        .map(|d| d.as_ref().clone())
        .collect();

    for inbox in [address::CHAT_PRESENTER_INBOX, address::QUIZ_RESULTS] {
        match server.bus().consumer(inbox) {
            Ok(consumer) => spawn_presenter_log(consumer),
            Err(e) => tracing::warn!("Can not listen on {}: {}", inbox, e),
        }
    }

    let tasks = TaskRunner::new();
    tasks.add_start_action(|task| tracing::info!("Working: {}", task.name));

    let starting = server.clone();
    let mut start = BackgroundTask::new("Starting interaction server", async move {
        starting.start(&descriptors).await
    });
    let started = match tasks.start(&mut start) {
        Ok(handle) => handle.wait().await,
        Err(e) => {
            tracing::error!("{}", e);
            TaskState::Failed
        }
    };
    if started != TaskState::Succeeded {
        let _ = server.release();
        std::process::exit(1);
    }

    tracing::info!(
        "Attendees can join at http://{}:{}",
        server.host(),
        server.port()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down...");
    server.stop().await;
    let _ = server.release();
}
