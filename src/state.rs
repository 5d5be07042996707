use std::sync::Arc;
use tokio::sync::broadcast;

use crate::alert::AlertSink;
use crate::config::WatchConfig;
use crate::dispatch::DispatchClient;
use crate::store::Store;

pub type SharedState = Arc<WatchState>;

/// Process-wide shared state. The store is the only shared-mutable piece;
/// everything else here is read-only after startup.
pub struct WatchState {
    pub config: WatchConfig,
    pub store: Store,
    pub alerts: Arc<dyn AlertSink>,
    pub dispatch: Option<DispatchClient>,
    pub http_client: reqwest::Client,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl WatchState {
    pub fn new(
        config: WatchConfig,
        store: Store,
        alerts: Arc<dyn AlertSink>,
        dispatch: Option<DispatchClient>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            store,
            alerts,
            dispatch,
            http_client,
            shutdown_tx,
        }
    }

    pub fn shutdown_requested(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
