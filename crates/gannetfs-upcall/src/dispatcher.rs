//! Bounded worker-pool event dispatcher
//!
//! One logical queue, a fixed pool of worker threads. `submit` never waits
//! for an event to be processed; it only competes for queue space and fails
//! fast with `QueueFull` when there is none. Each accepted event is handed
//! to exactly one worker, which invokes the registered handler once and
//! then the optional caller-supplied completion callback with the result.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::{Result, UpcallError};
use crate::event::{InvalidateFlags, ObjectKey, UpcallEvent, UpdatedAttributes};

/// Handler vector supplied by the caching/state layer.
///
/// One method per event family, all defaulting to "accepted, nothing to
/// do", so a consumer only implements the families it cares about.
/// `handle` performs the dispatch and is what the workers call; overriding
/// it wholesale is possible but rarely useful.
pub trait UpcallHandler: Send + Sync {
    /// Cached state for an object is stale.
    fn invalidate(&self, export_id: u16, key: &ObjectKey, flags: InvalidateFlags) -> Result<()> {
        let _ = (export_id, key, flags);
        Ok(())
    }

    /// Fresh attribute values pushed by a backend.
    fn update_attributes(
        &self,
        export_id: u16,
        key: &ObjectKey,
        attributes: UpdatedAttributes,
    ) -> Result<()> {
        let _ = (export_id, key, attributes);
        Ok(())
    }

    /// A blocked lock was granted.
    fn lock_grant(&self, export_id: u16, key: &ObjectKey, owner: u64) -> Result<()> {
        let _ = (export_id, key, owner);
        Ok(())
    }

    /// A conflicting lock went away.
    fn lock_available(&self, export_id: u16, key: &ObjectKey, owner: u64) -> Result<()> {
        let _ = (export_id, key, owner);
        Ok(())
    }

    /// Directory entry appeared behind our back.
    fn link(
        &self,
        export_id: u16,
        dir_key: &ObjectKey,
        name: &str,
        target_key: Option<&ObjectKey>,
    ) -> Result<()> {
        let _ = (export_id, dir_key, name, target_key);
        Ok(())
    }

    /// Directory entry disappeared behind our back.
    fn unlink(&self, export_id: u16, dir_key: &ObjectKey, name: &str) -> Result<()> {
        let _ = (export_id, dir_key, name);
        Ok(())
    }

    /// Directory entry renamed behind our back.
    fn rename(&self, export_id: u16, dir_key: &ObjectKey, old_name: &str, new_name: &str) -> Result<()> {
        let _ = (export_id, dir_key, old_name, new_name);
        Ok(())
    }

    /// The backend wants a layout back.
    fn layout_recall(&self, export_id: u16, key: &ObjectKey, layout_type: u32, changed: bool) -> Result<()> {
        let _ = (export_id, key, layout_type, changed);
        Ok(())
    }

    /// The backend asks for recallable state to be shed.
    fn recall_any(&self, export_id: u16, keep: u32) -> Result<()> {
        let _ = (export_id, keep);
        Ok(())
    }

    /// Device address list changed.
    fn notify_device(&self, layout_type: u32, device_id: &[u8; 16], immediate: bool) -> Result<()> {
        let _ = (layout_type, device_id, immediate);
        Ok(())
    }

    /// The backend wants a delegation back.
    fn delegation_recall(&self, export_id: u16, key: &ObjectKey) -> Result<()> {
        let _ = (export_id, key);
        Ok(())
    }

    /// Dispatches an event to the matching family method.
    fn handle(&self, event: &UpcallEvent) -> Result<()> {
        match event {
            UpcallEvent::Invalidate { export_id, key, flags } => {
                self.invalidate(*export_id, key, *flags)
            }
            UpcallEvent::UpdateAttributes { export_id, key, attributes } => {
                self.update_attributes(*export_id, key, *attributes)
            }
            UpcallEvent::LockGrant { export_id, key, owner } => {
                self.lock_grant(*export_id, key, *owner)
            }
            UpcallEvent::LockAvailable { export_id, key, owner } => {
                self.lock_available(*export_id, key, *owner)
            }
            UpcallEvent::Link { export_id, dir_key, name, target_key } => {
                self.link(*export_id, dir_key, name, target_key.as_ref())
            }
            UpcallEvent::Unlink { export_id, dir_key, name } => {
                self.unlink(*export_id, dir_key, name)
            }
            UpcallEvent::Rename { export_id, dir_key, old_name, new_name } => {
                self.rename(*export_id, dir_key, old_name, new_name)
            }
            UpcallEvent::LayoutRecall { export_id, key, layout_type, changed } => {
                self.layout_recall(*export_id, key, *layout_type, *changed)
            }
            UpcallEvent::RecallAny { export_id, keep } => self.recall_any(*export_id, *keep),
            UpcallEvent::NotifyDevice { layout_type, device_id, immediate } => {
                self.notify_device(*layout_type, device_id, *immediate)
            }
            UpcallEvent::DelegationRecall { export_id, key } => {
                self.delegation_recall(*export_id, key)
            }
        }
    }
}

/// Completion callback invoked by the worker after the handler ran.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send>;

struct Job {
    event: UpcallEvent,
    completion: Option<Completion>,
}

/// Dispatcher sizing.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued-but-unprocessed events before `submit` fails.
    pub queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_depth: 1024,
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherStats {
    /// Events accepted by `submit`.
    pub submitted: u64,
    /// Events whose handler ran to completion (success or failure).
    pub delivered: u64,
    /// Submissions rejected because the queue was full.
    pub rejected: u64,
}

/// Bounded asynchronous upcall dispatcher.
pub struct UpcallDispatcher {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    submitted: AtomicU64,
    delivered: Arc<AtomicU64>,
    rejected: AtomicU64,
}

impl UpcallDispatcher {
    /// Starts the worker pool with the given handler.
    pub fn start(config: DispatcherConfig, handler: Arc<dyn UpcallHandler>) -> Arc<Self> {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(config.queue_depth.max(1));
        let delivered = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::with_capacity(config.workers.max(1));
        for worker_id in 0..config.workers.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            let delivered = delivered.clone();
            let handle = std::thread::Builder::new()
                .name(format!("upcall-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, rx, handler, delivered))
                .expect("failed to spawn upcall worker");
            handles.push(handle);
        }

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            shutting_down: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            delivered,
            rejected: AtomicU64::new(0),
        })
    }

    /// Queues an event for asynchronous delivery.
    ///
    /// Fails fast with `QueueFull` instead of blocking; `ShutDown` once
    /// shutdown has begun. A success means the event will be delivered to
    /// exactly one handler invocation.
    pub fn submit(&self, event: UpcallEvent) -> Result<()> {
        self.submit_with_completion(event, None)
    }

    /// Queues an event and a callback to run (on a worker thread) with the
    /// handler's result.
    pub fn submit_with_completion(
        &self,
        event: UpcallEvent,
        completion: Option<Completion>,
    ) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(UpcallError::ShutDown);
        }
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(UpcallError::ShutDown)?;
        match tx.try_send(Job { event, completion }) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("upcall queue full, event rejected");
                Err(UpcallError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(UpcallError::ShutDown),
        }
    }

    /// Stops accepting events, drains the queue, and joins the workers.
    ///
    /// Already-accepted events are still delivered; new submissions fail
    /// fast. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        // Dropping the sender disconnects the channel; workers drain what
        // remains and exit.
        self.tx.lock().take();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("upcall worker panicked during shutdown");
            }
        }
        tracing::debug!("upcall dispatcher shut down");
    }

    /// Current delivery counters.
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// True once shutdown has begun.
    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

fn worker_loop(
    worker_id: usize,
    rx: Receiver<Job>,
    handler: Arc<dyn UpcallHandler>,
    delivered: Arc<AtomicU64>,
) {
    tracing::debug!(worker_id, "upcall worker started");
    while let Ok(job) = rx.recv() {
        let result = handler.handle(&job.event);
        if let Err(err) = &result {
            tracing::warn!(worker_id, error = %err, "upcall handler failed");
        }
        delivered.fetch_add(1, Ordering::Relaxed);
        if let Some(completion) = job.completion {
            completion(result);
        }
    }
    tracing::debug!(worker_id, "upcall worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountingHandler {
        invalidations: AtomicUsize,
        total: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                invalidations: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
            })
        }
    }

    impl UpcallHandler for CountingHandler {
        fn invalidate(&self, _export_id: u16, _key: &ObjectKey, _flags: InvalidateFlags) -> Result<()> {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn recall_any(&self, _export_id: u16, _keep: u32) -> Result<()> {
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    impl UpcallHandler for FailingHandler {
        fn invalidate(&self, _export_id: u16, _key: &ObjectKey, _flags: InvalidateFlags) -> Result<()> {
            Err(UpcallError::Handler {
                reason: "nope".to_string(),
            })
        }
    }

    fn invalidate_event() -> UpcallEvent {
        UpcallEvent::Invalidate {
            export_id: 1,
            key: ObjectKey::from_bytes(b"obj"),
            flags: InvalidateFlags::attrs_and_content(),
        }
    }

    #[test]
    fn test_submit_delivers_exactly_once() {
        let handler = CountingHandler::new();
        let dispatcher = UpcallDispatcher::start(DispatcherConfig::default(), handler.clone());

        for _ in 0..10 {
            dispatcher.submit(invalidate_event()).unwrap();
        }
        dispatcher.shutdown();

        assert_eq!(handler.invalidations.load(Ordering::SeqCst), 10);
        assert_eq!(dispatcher.stats().delivered, 10);
    }

    #[test]
    fn test_completion_callback_receives_result() {
        let handler = CountingHandler::new();
        let dispatcher = UpcallDispatcher::start(DispatcherConfig::default(), handler);

        let (tx, rx) = mpsc::channel();
        dispatcher
            .submit_with_completion(
                invalidate_event(),
                Some(Box::new(move |res| {
                    tx.send(res).unwrap();
                })),
            )
            .unwrap();

        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(res.is_ok());
        dispatcher.shutdown();
    }

    #[test]
    fn test_completion_callback_sees_handler_failure() {
        let dispatcher =
            UpcallDispatcher::start(DispatcherConfig::default(), Arc::new(FailingHandler));

        let (tx, rx) = mpsc::channel();
        dispatcher
            .submit_with_completion(
                invalidate_event(),
                Some(Box::new(move |res| {
                    tx.send(res).unwrap();
                })),
            )
            .unwrap();

        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            res,
            Err(UpcallError::Handler {
                reason: "nope".to_string()
            })
        );
        dispatcher.shutdown();
    }

    #[test]
    fn test_queue_full_fails_fast() {
        // Single worker blocked forever would be flaky; instead use a
        // zero-worker-equivalent setup: tiny queue, slow handler.
        struct SlowHandler;
        impl UpcallHandler for SlowHandler {
            fn invalidate(&self, _e: u16, _k: &ObjectKey, _f: InvalidateFlags) -> Result<()> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }
        }

        let dispatcher = UpcallDispatcher::start(
            DispatcherConfig {
                workers: 1,
                queue_depth: 1,
            },
            Arc::new(SlowHandler),
        );

        // Saturate: one in flight, one queued, the rest must be rejected.
        let mut rejected = 0;
        for _ in 0..16 {
            if dispatcher.submit(invalidate_event()) == Err(UpcallError::QueueFull) {
                rejected += 1;
            }
        }
        assert!(rejected > 0);
        dispatcher.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_fails_fast() {
        let handler = CountingHandler::new();
        let dispatcher = UpcallDispatcher::start(DispatcherConfig::default(), handler);
        dispatcher.shutdown();

        assert_eq!(dispatcher.submit(invalidate_event()), Err(UpcallError::ShutDown));
        assert!(dispatcher.is_shut_down());
    }

    #[test]
    fn test_shutdown_drains_pending_events() {
        let handler = CountingHandler::new();
        let dispatcher = UpcallDispatcher::start(
            DispatcherConfig {
                workers: 2,
                queue_depth: 256,
            },
            handler.clone(),
        );

        let mut accepted = 0;
        for i in 0..100u32 {
            let ev = UpcallEvent::RecallAny {
                export_id: 1,
                keep: i,
            };
            if dispatcher.submit(ev).is_ok() {
                accepted += 1;
            }
        }
        dispatcher.shutdown();

        // Every accepted event was delivered before shutdown returned.
        assert_eq!(handler.total.load(Ordering::SeqCst), accepted);
    }

    #[test]
    fn test_stats_counts_submissions() {
        let handler = CountingHandler::new();
        let dispatcher = UpcallDispatcher::start(DispatcherConfig::default(), handler);
        dispatcher.submit(invalidate_event()).unwrap();
        dispatcher.submit(invalidate_event()).unwrap();
        dispatcher.shutdown();
        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.delivered, 2);
    }

    #[test]
    fn test_shutdown_twice_is_safe() {
        let handler = CountingHandler::new();
        let dispatcher = UpcallDispatcher::start(DispatcherConfig::default(), handler);
        dispatcher.shutdown();
        dispatcher.shutdown();
    }

    #[test]
    fn test_default_handler_accepts_all_families() {
        struct NoopHandler;
        impl UpcallHandler for NoopHandler {}

        let handler = NoopHandler;
        let events = vec![
            invalidate_event(),
            UpcallEvent::UpdateAttributes {
                export_id: 1,
                key: ObjectKey::from_bytes(b"a"),
                attributes: UpdatedAttributes {
                    size: Some(42),
                    mtime_seconds: Some(1),
                },
            },
            UpcallEvent::LockGrant {
                export_id: 1,
                key: ObjectKey::from_bytes(b"a"),
                owner: 9,
            },
            UpcallEvent::LockAvailable {
                export_id: 1,
                key: ObjectKey::from_bytes(b"a"),
                owner: 9,
            },
            UpcallEvent::Link {
                export_id: 1,
                dir_key: ObjectKey::from_bytes(b"d"),
                name: "n".to_string(),
                target_key: None,
            },
            UpcallEvent::Unlink {
                export_id: 1,
                dir_key: ObjectKey::from_bytes(b"d"),
                name: "n".to_string(),
            },
            UpcallEvent::Rename {
                export_id: 1,
                dir_key: ObjectKey::from_bytes(b"d"),
                old_name: "a".to_string(),
                new_name: "b".to_string(),
            },
            UpcallEvent::LayoutRecall {
                export_id: 1,
                key: ObjectKey::from_bytes(b"a"),
                layout_type: 1,
                changed: false,
            },
            UpcallEvent::RecallAny {
                export_id: 1,
                keep: 0,
            },
            UpcallEvent::NotifyDevice {
                layout_type: 1,
                device_id: [0; 16],
                immediate: false,
            },
            UpcallEvent::DelegationRecall {
                export_id: 1,
                key: ObjectKey::from_bytes(b"a"),
            },
        ];
        for ev in events {
            assert!(handler.handle(&ev).is_ok());
        }
    }
}
