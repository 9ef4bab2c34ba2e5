// persister.rs — Debounced background flushing of the watermark store.
//
// Hook handlers sit on the host's critical path and must never wait on disk.
// They call `schedule()`, which only sends on a channel. A dedicated thread
// waits for the first request, keeps absorbing requests until the debounce
// window passes quietly, and then flushes once.
//
// Dropping the persister sends a shutdown, flushes whatever is outstanding,
// and joins the thread.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::watermark::WatermarkStore;

/// Default quiet period before a scheduled flush is written.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

enum PersistRequest {
    Flush,
    Shutdown,
}

/// Owns the background flush thread for one WatermarkStore.
pub struct WatermarkPersister {
    tx: Sender<PersistRequest>,
    handle: Option<JoinHandle<()>>,
}

impl WatermarkPersister {
    pub fn spawn(store: Arc<WatermarkStore>, debounce: Duration) -> Result<Self, StoreError> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("tg-watermark-persister".to_string())
            .spawn(move || run(store, rx, debounce))
            .map_err(|e| StoreError::io("tg-watermark-persister", e))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Request a flush. Never blocks.
    pub fn schedule(&self) {
        if self.tx.send(PersistRequest::Flush).is_err() {
            tracing::warn!("watermark persister has stopped; flush request dropped");
        }
    }
}

impl Drop for WatermarkPersister {
    fn drop(&mut self) {
        let _ = self.tx.send(PersistRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("watermark persister thread panicked");
            }
        }
    }
}

fn run(store: Arc<WatermarkStore>, rx: mpsc::Receiver<PersistRequest>, debounce: Duration) {
    loop {
        match rx.recv() {
            Ok(PersistRequest::Flush) => {
                let shutdown = absorb_until_quiet(&rx, debounce);
                write(&store);
                if shutdown {
                    return;
                }
            }
            Ok(PersistRequest::Shutdown) | Err(_) => {
                if store.is_dirty() {
                    write(&store);
                }
                return;
            }
        }
    }
}

/// Swallow flush requests until `debounce` passes without one. Returns
/// whether shutdown was requested meanwhile.
fn absorb_until_quiet(rx: &mpsc::Receiver<PersistRequest>, debounce: Duration) -> bool {
    let mut deadline = Instant::now() + debounce;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match rx.recv_timeout(remaining) {
            Ok(PersistRequest::Flush) => deadline = Instant::now() + debounce,
            Ok(PersistRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => return true,
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
}

fn write(store: &WatermarkStore) {
    if let Err(e) = store.flush() {
        tracing::error!(error = %e, "failed to persist watermarks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tg_taint::TrustLevel;

    #[test]
    fn drop_flushes_outstanding_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watermarks.json");
        let store = Arc::new(WatermarkStore::open(&path).unwrap());

        {
            let persister =
                WatermarkPersister::spawn(store.clone(), Duration::from_secs(60)).unwrap();
            store.escalate("s", TrustLevel::External, "page", "web_fetch");
            persister.schedule();
            persister.schedule();
        }

        let reloaded = WatermarkStore::open(&path).unwrap();
        assert_eq!(reloaded.get("s").unwrap().level, TrustLevel::External);
    }

    #[test]
    fn scheduled_flush_lands_after_debounce() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watermarks.json");
        let store = Arc::new(WatermarkStore::open(&path).unwrap());
        let persister = WatermarkPersister::spawn(store.clone(), Duration::from_millis(20)).unwrap();

        store.escalate("s", TrustLevel::Untrusted, "stranger", "message");
        persister.schedule();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !(path.exists() && !store.is_dirty()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!store.is_dirty());
        assert!(path.exists());
        drop(persister);
    }

    #[test]
    fn drop_without_changes_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watermarks.json");
        let store = Arc::new(WatermarkStore::open(&path).unwrap());
        drop(WatermarkPersister::spawn(store, DEFAULT_DEBOUNCE).unwrap());
        assert!(!path.exists());
    }
}
