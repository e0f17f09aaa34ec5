//! Process wiring.
//!
//! Every component is constructed once here and handed to its
//! collaborators explicitly; nothing is global.

use courier_bus::{Bridge, BridgePublisher, MessageBus};
use courier_core::{EventBus, GroupManager, Registry, SessionManager};
use courier_store::SharedClient;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub client: SharedClient,
    pub registry: Registry,
    pub sessions: SessionManager,
    pub bus: MessageBus,
    pub publisher: BridgePublisher,
    pub started: Instant,
    /// Root token; cancelling it stops every background task.
    pub shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &self.client.backend_name())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Connect the shared store and start the registry, the bridge and the
    /// relay consumers. Store failures degrade to local-only operation.
    pub async fn start(config: Config, shutdown: CancellationToken) -> Arc<Self> {
        let client = match SharedClient::connect(&config.store).await {
            Ok(client) => client,
            Err(err) => {
                error!(error = %err, "Shared store unavailable, continuing without it");
                SharedClient::disabled()
            }
        };

        let groups = GroupManager::for_client(&client, config.retention.group_ttl());
        let sessions = SessionManager::for_client(&client, config.retention.session_ttl());
        let events = EventBus::new();
        let (registry, registry_task) = Registry::spawn(
            config.registry.clone(),
            groups,
            events,
            shutdown.clone(),
        );
        let mut tasks = vec![registry_task];

        let bus = MessageBus::new(client.clone(), config.bus.clone());
        let bridge = Bridge::new(client.clone(), registry.clone(), &config.bridge);

        for topic in &config.bridge.relay_topics {
            match bridge.relay_topic(&bus, topic, shutdown.clone()).await {
                Ok(task) => tasks.push(task),
                Err(err) => warn!(topic = %topic, error = %err, "Failed to start relay"),
            }
        }
        match bridge.start(shutdown.clone()).await {
            Ok(task) => tasks.push(task),
            Err(err) => warn!(error = %err, "Bridge unavailable, delivering locally only"),
        }

        let publisher = BridgePublisher::new(client.clone(), registry.clone(), &config.bridge);
        info!(
            store = client.backend_name(),
            relays = config.bridge.relay_topics.len(),
            "Services started"
        );

        Arc::new(Self {
            config,
            client,
            registry,
            sessions,
            bus,
            publisher,
            started: Instant::now(),
            shutdown,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    /// Stop background work and wait for it to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.bus.shutdown().await;
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("Services stopped");
    }
}
