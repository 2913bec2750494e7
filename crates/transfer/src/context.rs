use std::collections::HashMap;
use std::sync::Arc;

use stowage_store::ObjectStoreClient;
use stowage_tracker::{TrackerStore, default_tracker_dir};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TransferConfig;
use crate::progress::ProgressTracker;
use crate::retry::RetryPolicy;
use crate::TransferError;

/// Everything a transfer needs, built once by the caller and shared by
/// reference with every component.
pub struct TransferContext {
    pub config: TransferConfig,
    pub tracker: TrackerStore,
    pub progress: ProgressTracker,
    pub cancel: CancellationToken,
    clients: HashMap<String, Arc<dyn ObjectStoreClient>>,
}

impl TransferContext {
    pub fn new(config: TransferConfig, tracker: TrackerStore) -> Self {
        Self {
            config,
            tracker,
            progress: ProgressTracker::default(),
            cancel: CancellationToken::new(),
            clients: HashMap::new(),
        }
    }

    /// Validates `config` and opens its tracker directory (or the default
    /// one).
    pub fn from_config(config: TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;
        let dir = match config.tracker_dir.clone().or_else(default_tracker_dir) {
            Some(dir) => dir,
            None => {
                return Err(TransferError::Unsupported(
                    "no tracker directory configured and no home directory found".into(),
                ));
            }
        };
        debug!(dir = %dir.display(), "opening tracker directory");
        let tracker = TrackerStore::new(dir)?;
        Ok(Self::new(config, tracker))
    }

    /// Registers the client serving `client.provider()` URLs.
    pub fn with_client(mut self, client: Arc<dyn ObjectStoreClient>) -> Self {
        self.clients.insert(client.provider().to_string(), client);
        self
    }

    pub fn client(&self, provider: &str) -> Result<Arc<dyn ObjectStoreClient>, TransferError> {
        self.clients
            .get(provider)
            .cloned()
            .ok_or_else(|| TransferError::Unsupported(format!("no client for {provider}://")))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }

    pub fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }
}
