//! Helpers shared by the unit tests.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stowage_store::ObjectStoreClient;
use stowage_tracker::TrackerStore;

use crate::{TransferConfig, TransferContext};

/// A context backed by `client` with trackers under `tmp`, retry waits cut
/// to a millisecond and a small progress-less budget. `tweak` adjusts the
/// config further.
pub(crate) fn context(
    tmp: &tempfile::TempDir,
    client: Arc<dyn ObjectStoreClient>,
    tweak: impl FnOnce(&mut TransferConfig),
) -> TransferContext {
    let mut config = TransferConfig {
        tracker_dir: Some(tmp.path().join("trackers")),
        max_progressless_retries: 3,
        max_retry_delay_secs: 0.001,
        worker_count: 4,
        ..TransferConfig::default()
    };
    tweak(&mut config);
    config.validate().unwrap();
    let tracker = TrackerStore::new(tmp.path().join("trackers")).unwrap();
    TransferContext::new(config, tracker).with_client(client)
}

/// `len` bytes that differ between nearby offsets.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_right(13) as u8)
        .collect()
}

/// Config tweak for tests that cancel during a retry wait: waits long enough
/// to be interrupted and a budget that does not run out first.
pub(crate) fn patient(config: &mut TransferConfig) {
    config.max_progressless_retries = 1_000;
    config.max_retry_delay_secs = 30.0;
}

/// Cancels `ctx` from another thread once `delay` has passed.
pub(crate) fn cancel_after(ctx: &TransferContext, delay: Duration) -> JoinHandle<()> {
    let token = ctx.cancel.clone();
    thread::spawn(move || {
        thread::sleep(delay);
        token.cancel();
    })
}
