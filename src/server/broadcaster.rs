//! Single-producer fan-out of RX audio to every connected consumer.
//!
//! One capture thread reads the device a frame at a time and hands each
//! frame to all registered targets. A slow or broken target can never stall
//! the producer or its peers: delivery is a plain method call that must not
//! block, and any target that declines or panics is dropped on the spot.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::audio::device::CaptureSource;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::worker;

/// A consumer endpoint receiving every RX frame.
pub trait BroadcastTarget: Send + Sync {
    fn target_id(&self) -> &str;

    /// Delivers one frame of RX audio. Must not block; return `false` to be
    /// removed from the broadcast.
    fn receive_rx_audio(&self, audio: &[u8]) -> bool;
}

type FailureListener = dyn Fn(&str, &str) + Send + Sync;

pub struct Broadcaster {
    config: StreamConfig,
    targets: DashMap<String, Arc<dyn BroadcastTarget>>,
    running: AtomicBool,
    failure_listener: Mutex<Option<Arc<FailureListener>>>,
    capture_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            targets: DashMap::new(),
            running: AtomicBool::new(false),
            failure_listener: Mutex::new(None),
            capture_thread: Mutex::new(None),
        }
    }

    /// Registers a callback invoked when a target fails and is removed.
    pub fn set_failure_listener(&self, listener: impl Fn(&str, &str) + Send + Sync + 'static) {
        *self.failure_listener.lock().unwrap() = Some(Arc::new(listener));
    }

    pub fn add_target(&self, target: Arc<dyn BroadcastTarget>) {
        let id = target.target_id().to_string();
        debug!("added broadcast target: {}", id);
        self.targets.insert(id, target);
    }

    pub fn remove_target(&self, target_id: &str) -> Option<Arc<dyn BroadcastTarget>> {
        let removed = self.targets.remove(target_id).map(|(_, target)| target);
        if removed.is_some() {
            debug!("removed broadcast target: {}", target_id);
        }
        removed
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts the capture loop over the given source.
    pub fn start(self: &Arc<Self>, mut source: Box<dyn CaptureSource>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let broadcaster = Arc::clone(self);
        let handle = worker::spawn("audio-broadcaster", move || {
            broadcaster.capture_loop(source.as_mut());
        })?;
        *self.capture_thread.lock().unwrap() = Some(handle);

        info!("broadcaster started");
        Ok(())
    }

    /// Stops the capture loop. The capture thread is abandoned if the
    /// device read does not return within a second.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.capture_thread.lock().unwrap().take() {
            if !worker::join_timeout(handle, Duration::from_secs(1)) {
                warn!("capture thread did not stop in time, abandoning it");
            }
        }
        info!("broadcaster stopped");
    }

    /// Broadcasts audio that did not come from the capture device, e.g.
    /// a recording being replayed to all clients.
    pub fn inject_audio(&self, audio: &[u8]) {
        if !audio.is_empty() && !self.targets.is_empty() {
            self.broadcast(audio);
        }
    }

    fn capture_loop(&self, source: &mut dyn CaptureSource) {
        let mut buf = vec![0u8; self.config.format.bytes_per_frame()];

        while self.running.load(Ordering::Acquire) {
            match source.read(&mut buf) {
                Ok(0) => {
                    if self.running.load(Ordering::Acquire) {
                        warn!("capture source reached end of stream");
                    }
                    break;
                }
                Ok(n) => self.broadcast(&buf[..n]),
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        warn!("capture error: {}", e);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        }
    }

    fn broadcast(&self, audio: &[u8]) {
        // Snapshot so no map lock is held across a target callback and
        // add/remove stay safe during delivery.
        let snapshot: Vec<(String, Arc<dyn BroadcastTarget>)> = self
            .targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (id, target) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| target.receive_rx_audio(audio))) {
                Ok(true) => {}
                Ok(false) => self.drop_target(&id, "target declined delivery"),
                Err(_) => self.drop_target(&id, "target panicked"),
            }
        }
    }

    fn drop_target(&self, target_id: &str, reason: &str) {
        self.targets.remove(target_id);
        warn!("broadcast target failed: {} ({})", target_id, reason);
        let listener = self.failure_listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener(target_id, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct RecordingTarget {
        id: String,
        received: Mutex<Vec<u8>>,
        accept: AtomicBool,
        panic_on_receive: AtomicBool,
    }

    impl RecordingTarget {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                received: Mutex::new(Vec::new()),
                accept: AtomicBool::new(true),
                panic_on_receive: AtomicBool::new(false),
            })
        }
    }

    impl BroadcastTarget for RecordingTarget {
        fn target_id(&self) -> &str {
            &self.id
        }

        fn receive_rx_audio(&self, audio: &[u8]) -> bool {
            if self.panic_on_receive.load(Ordering::Relaxed) {
                panic!("target exploded");
            }
            self.received.lock().unwrap().extend_from_slice(audio);
            self.accept.load(Ordering::Relaxed)
        }
    }

    /// Capture source producing a fixed byte pattern at frame cadence.
    struct PatternCapture {
        pattern: u8,
    }

    impl CaptureSource for PatternCapture {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            buf.fill(self.pattern);
            Ok(buf.len())
        }

        fn channels(&self) -> u8 {
            1
        }
    }

    #[test]
    fn test_inject_reaches_all_targets() {
        let broadcaster = Broadcaster::new(StreamConfig::default());
        let a = RecordingTarget::new("a");
        let b = RecordingTarget::new("b");
        broadcaster.add_target(a.clone());
        broadcaster.add_target(b.clone());

        broadcaster.inject_audio(&[1, 2, 3]);

        assert_eq!(*a.received.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*b.received.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_declining_target_removed_others_unaffected() {
        let broadcaster = Broadcaster::new(StreamConfig::default());
        let failures = Arc::new(Mutex::new(Vec::new()));
        {
            let failures = failures.clone();
            broadcaster.set_failure_listener(move |id, reason| {
                failures.lock().unwrap().push((id.to_string(), reason.to_string()));
            });
        }

        let good = RecordingTarget::new("good");
        let bad = RecordingTarget::new("bad");
        bad.accept.store(false, Ordering::Relaxed);
        broadcaster.add_target(good.clone());
        broadcaster.add_target(bad.clone());

        broadcaster.inject_audio(&[7; 4]);
        broadcaster.inject_audio(&[8; 4]);

        assert_eq!(broadcaster.target_count(), 1);
        assert_eq!(good.received.lock().unwrap().len(), 8);
        // The bad target saw only the first frame before removal.
        assert_eq!(bad.received.lock().unwrap().len(), 4);
        assert_eq!(failures.lock().unwrap().len(), 1);
        assert_eq!(failures.lock().unwrap()[0].0, "bad");
    }

    #[test]
    fn test_panicking_target_removed() {
        let broadcaster = Broadcaster::new(StreamConfig::default());
        let good = RecordingTarget::new("good");
        let bomb = RecordingTarget::new("bomb");
        bomb.panic_on_receive.store(true, Ordering::Relaxed);
        broadcaster.add_target(bomb);
        broadcaster.add_target(good.clone());

        broadcaster.inject_audio(&[9; 4]);

        assert_eq!(broadcaster.target_count(), 1);
        assert_eq!(good.received.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_capture_loop_delivers_frames() {
        let broadcaster = Arc::new(Broadcaster::new(StreamConfig::default()));
        let target = RecordingTarget::new("t");
        broadcaster.add_target(target.clone());

        broadcaster
            .start(Box::new(PatternCapture { pattern: 0x5A }))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if !target.received.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        broadcaster.stop();

        let received = target.received.lock().unwrap();
        assert!(!received.is_empty());
        assert!(received.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_remove_target_by_id() {
        let broadcaster = Broadcaster::new(StreamConfig::default());
        let target = RecordingTarget::new("t");
        broadcaster.add_target(target);
        assert!(broadcaster.has_targets());
        assert!(broadcaster.remove_target("t").is_some());
        assert!(broadcaster.remove_target("t").is_none());
        assert!(!broadcaster.has_targets());
    }

    #[test]
    fn test_add_during_broadcast_is_safe() {
        // A target that registers another target from inside the callback;
        // snapshot iteration must not deadlock.
        struct AddingTarget {
            broadcaster: Arc<Broadcaster>,
            added: AtomicUsize,
        }

        impl BroadcastTarget for AddingTarget {
            fn target_id(&self) -> &str {
                "adder"
            }

            fn receive_rx_audio(&self, _audio: &[u8]) -> bool {
                if self.added.fetch_add(1, Ordering::Relaxed) == 0 {
                    self.broadcaster.add_target(RecordingTarget::new("late"));
                }
                true
            }
        }

        let broadcaster = Arc::new(Broadcaster::new(StreamConfig::default()));
        broadcaster.add_target(Arc::new(AddingTarget {
            broadcaster: broadcaster.clone(),
            added: AtomicUsize::new(0),
        }));

        broadcaster.inject_audio(&[1; 4]);
        assert_eq!(broadcaster.target_count(), 2);
    }
}
