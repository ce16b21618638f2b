//! Async callback worker (§4.8, C8): delivers "segment closed" and
//! "segment viewed" notifications without ever blocking the data path.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::warn;

/// `on_hls` — per reaped segment.
#[derive(Clone, Debug)]
pub struct HlsNotification {
    pub segment_path: PathBuf,
    pub segment_uri: String,
    pub m3u8_path: PathBuf,
    pub m3u8_uri: String,
    pub seq: u64,
    pub duration_secs: f64,
    /// Lazily computed content hash for downstream dedup/billing; never
    /// computed on the data path (§B "Segment hash/identity").
    pub sha256: Option<[u8; 32]>,
}

/// `on_hls_notify` — intended to drive a CDN warming fetch, fanned out up
/// to `nb_notify` times.
#[derive(Clone, Debug)]
pub struct HlsViewNotification {
    pub segment_uri: String,
}

pub enum CallbackTask {
    SegmentClosed(HlsNotification),
    SegmentViewed(HlsViewNotification),
}

/// Callers implement this to actually deliver notifications (HTTP webhook,
/// log sink, test recorder, etc).
#[async_trait::async_trait]
pub trait CallbackSink: Send + Sync {
    async fn on_hls(&self, notification: HlsNotification);
    async fn on_hls_notify(&self, notification: HlsViewNotification);
}

struct Shared {
    tasks: Mutex<VecDeque<CallbackTask>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// Bounded single-producer/single-consumer queue; on overflow the oldest
/// pending task is dropped and the drop is logged, never blocking the
/// sender (§4.8, §5 "async worker ... takes owned task objects").
pub struct CallbackWorker {
    shared: Arc<Shared>,
    handle: tokio::task::JoinHandle<()>,
}

impl CallbackWorker {
    pub fn spawn(sink: impl CallbackSink + 'static, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
        });
        let worker_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                let task = worker_shared.tasks.lock().unwrap().pop_front();
                match task {
                    Some(CallbackTask::SegmentClosed(mut n)) => {
                        n.sha256 = Self::hash_segment(&n.segment_path).await;
                        sink.on_hls(n).await
                    }
                    Some(CallbackTask::SegmentViewed(n)) => sink.on_hls_notify(n).await,
                    None => {
                        if worker_shared.closed.load(Ordering::Acquire) {
                            break;
                        }
                        worker_shared.notify.notified().await;
                    }
                }
            }
        });
        CallbackWorker { shared, handle }
    }

    /// Reads the closed segment back off disk and hashes it, off the data
    /// path (§B "Segment hash/identity"). A read failure (segment already
    /// disposed, unreadable path) is logged and leaves `sha256` unset rather
    /// than failing the notification.
    async fn hash_segment(path: &std::path::Path) -> Option<[u8; 32]> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                Some(hasher.finalize().into())
            }
            Err(e) => {
                warn!(%e, path = %path.display(), "failed to hash segment for callback");
                None
            }
        }
    }

    /// Enqueue a task; if the bounded queue is already at capacity, drop the
    /// oldest pending task to make room rather than block the sender (never
    /// stall the stream's data-path task on a slow callback sink).
    pub fn enqueue(&self, task: CallbackTask) {
        let mut tasks = self.shared.tasks.lock().unwrap();
        if tasks.len() >= self.shared.capacity {
            tasks.pop_front();
            warn!("callback queue full, dropping oldest notification");
        }
        tasks.push_back(task);
        drop(tasks);
        self.shared.notify.notify_one();
    }

    pub fn notify_segment_closed(&self, n: HlsNotification) {
        self.enqueue(CallbackTask::SegmentClosed(n));
    }

    /// Fan out a view notification `nb_notify` times, per operator setting.
    pub fn notify_segment_viewed(&self, uri: &str, nb_notify: u32) {
        for _ in 0..nb_notify.max(1) {
            self.enqueue(CallbackTask::SegmentViewed(HlsViewNotification {
                segment_uri: uri.to_string(),
            }));
        }
    }

    pub async fn shutdown(self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    struct CountingSink {
        hls: Arc<AtomicUsize>,
        notify: Arc<AtomicUsize>,
        last_sha256: Arc<StdMutex<Option<[u8; 32]>>>,
    }

    #[async_trait::async_trait]
    impl CallbackSink for CountingSink {
        async fn on_hls(&self, n: HlsNotification) {
            *self.last_sha256.lock().unwrap() = n.sha256;
            self.hls.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_hls_notify(&self, _n: HlsViewNotification) {
            self.notify.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn delivers_segment_closed_notifications() {
        let hls = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(AtomicUsize::new(0));
        let last_sha256 = Arc::new(StdMutex::new(None));
        let worker = CallbackWorker::spawn(
            CountingSink {
                hls: hls.clone(),
                notify: notify.clone(),
                last_sha256: last_sha256.clone(),
            },
            8,
        );
        worker.notify_segment_closed(HlsNotification {
            segment_path: "/tmp/x.ts".into(),
            segment_uri: "x.ts".into(),
            m3u8_path: "/tmp/live.m3u8".into(),
            m3u8_uri: "live.m3u8".into(),
            seq: 0,
            duration_secs: 6.0,
            sha256: None,
        });
        worker.notify_segment_viewed("x.ts", 3);
        worker.shutdown().await;
        assert_eq!(hls.load(Ordering::SeqCst), 1);
        assert_eq!(notify.load(Ordering::SeqCst), 3);
        // path doesn't exist, so the hash comes back unset rather than panicking
        assert_eq!(*last_sha256.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn computes_sha256_of_the_closed_segment_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0.ts");
        std::fs::write(&path, b"hello segment").unwrap();
        let mut expected = Sha256::new();
        expected.update(b"hello segment");
        let expected: [u8; 32] = expected.finalize().into();

        let hls = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(AtomicUsize::new(0));
        let last_sha256 = Arc::new(StdMutex::new(None));
        let worker = CallbackWorker::spawn(
            CountingSink {
                hls: hls.clone(),
                notify,
                last_sha256: last_sha256.clone(),
            },
            8,
        );
        worker.notify_segment_closed(HlsNotification {
            segment_path: path,
            segment_uri: "seg0.ts".into(),
            m3u8_path: "/tmp/live.m3u8".into(),
            m3u8_uri: "live.m3u8".into(),
            seq: 0,
            duration_secs: 6.0,
            sha256: None,
        });
        worker.shutdown().await;
        assert_eq!(hls.load(Ordering::SeqCst), 1);
        assert_eq!(*last_sha256.lock().unwrap(), Some(expected));
    }
}
