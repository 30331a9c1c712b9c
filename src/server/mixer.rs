//! TX arbitration: many client producers, one playback sink.
//!
//! At most one client owns the TX channel at a time. The first submission
//! claims a free channel; a strictly higher priority preempts the incumbent
//! (equal priority never does); ownership is released explicitly, on idle
//! timeout, or when the owner unregisters. Accepted audio lands in a single
//! ring buffer drained by the playback loop at frame cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::audio::buffer::RingBuffer;
use crate::audio::device::PlaybackSink;
use crate::config::{StreamConfig, MAX_INITIAL_BUFFERING_MS};
use crate::error::Result;
use crate::worker;

/// TX priority levels; the derived order is the arbitration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxPriority {
    /// Yields to all others.
    Low,
    /// Default for most clients.
    Normal,
    /// Preempts normal and low.
    High,
    /// Preempts everything.
    Exclusive,
}

impl TxPriority {
    /// Strictly-greater wins; equal priority keeps the incumbent.
    pub fn can_preempt(self, other: TxPriority) -> bool {
        self > other
    }
}

/// Outcome of one TX submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    /// Audio was written and will be played.
    Accepted,
    /// Another client holds the channel (or the sender is unknown).
    Rejected,
    /// Audio was written after preempting the previous owner.
    Preempted,
}

/// Capability set a TX-contributing client satisfies.
pub trait TxClient: Send + Sync {
    fn client_id(&self) -> &str;

    fn tx_priority(&self) -> TxPriority;

    /// The TX channel was granted to this client.
    fn on_tx_granted(&self) {}

    /// This client lost the channel to a higher-priority client.
    fn on_preempted(&self, _preempting_client_id: &str) {}

    /// The channel this client held was released.
    fn on_tx_released(&self) {}
}

/// Observer for arbitration events.
pub trait MixerListener: Send + Sync {
    fn on_tx_conflict(&self, _holding_client_id: &str, _requesting_client_id: &str) {}
    fn on_tx_owner_changed(&self, _new_owner: Option<&str>) {}
}

struct Ownership {
    owner: Option<(String, TxPriority)>,
    last_activity: Instant,
}

/// What a submission decided while the ownership lock was held; callbacks
/// fire only after it is released.
enum Transition {
    Claimed,
    Kept,
    Preempted { previous: String },
    Conflict { holder: String },
}

pub struct Mixer {
    config: StreamConfig,
    clients: DashMap<String, Arc<dyn TxClient>>,
    ownership: Mutex<Ownership>,
    tx_buffer: Arc<RingBuffer>,
    listener: Mutex<Option<Arc<dyn MixerListener>>>,
    running: AtomicBool,
    playback_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Mixer {
    pub fn new(config: StreamConfig) -> Self {
        let tx_buffer = Arc::new(RingBuffer::new(&config, "tx-mixer"));
        Self {
            config,
            clients: DashMap::new(),
            ownership: Mutex::new(Ownership {
                owner: None,
                last_activity: Instant::now(),
            }),
            tx_buffer,
            listener: Mutex::new(None),
            running: AtomicBool::new(false),
            playback_thread: Mutex::new(None),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn MixerListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    pub fn register_client(&self, client: Arc<dyn TxClient>) {
        let id = client.client_id().to_string();
        debug!("registered TX client: {}", id);
        self.clients.insert(id, client);
    }

    /// Unregisters a client, releasing the channel if it held it.
    pub fn unregister_client(&self, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            self.release_tx(client_id);
            debug!("unregistered TX client: {}", client_id);
        }
    }

    /// Submits TX audio on behalf of a client.
    pub fn submit_tx_audio(&self, client_id: &str, audio: &[u8]) -> TxResult {
        let Some(client) = self.clients.get(client_id).map(|entry| entry.value().clone()) else {
            return TxResult::Rejected;
        };

        let transition = {
            let mut ownership = self.ownership.lock().unwrap();
            match ownership.owner.take() {
                None => {
                    ownership.owner = Some((client_id.to_string(), client.tx_priority()));
                    ownership.last_activity = Instant::now();
                    self.tx_buffer.clear();
                    Transition::Claimed
                }
                Some((owner, priority)) if owner == client_id => {
                    ownership.owner = Some((owner, priority));
                    ownership.last_activity = Instant::now();
                    Transition::Kept
                }
                Some((owner, holder_priority)) => {
                    let requested = client.tx_priority();
                    if requested.can_preempt(holder_priority) {
                        ownership.owner = Some((client_id.to_string(), requested));
                        ownership.last_activity = Instant::now();
                        self.tx_buffer.clear();
                        Transition::Preempted { previous: owner }
                    } else {
                        let holder = owner.clone();
                        ownership.owner = Some((owner, holder_priority));
                        Transition::Conflict { holder }
                    }
                }
            }
        };

        match transition {
            Transition::Claimed => {
                debug!("TX channel claimed by {}", client_id);
                client.on_tx_granted();
                self.notify_owner_changed(Some(client_id));
                self.tx_buffer.write(audio);
                TxResult::Accepted
            }
            Transition::Kept => {
                self.tx_buffer.write(audio);
                TxResult::Accepted
            }
            Transition::Preempted { previous } => {
                info!("TX channel preempted: {} -> {}", previous, client_id);
                if let Some(prev) = self.clients.get(&previous).map(|e| e.value().clone()) {
                    prev.on_preempted(client_id);
                }
                client.on_tx_granted();
                self.notify_owner_changed(Some(client_id));
                self.tx_buffer.write(audio);
                TxResult::Preempted
            }
            Transition::Conflict { holder } => {
                let listener = self.listener.lock().unwrap().clone();
                if let Some(listener) = listener {
                    listener.on_tx_conflict(&holder, client_id);
                }
                TxResult::Rejected
            }
        }
    }

    /// Explicitly releases the channel if `client_id` holds it.
    pub fn release_tx(&self, client_id: &str) {
        let released = {
            let mut ownership = self.ownership.lock().unwrap();
            let is_owner = matches!(&ownership.owner, Some((owner, _)) if owner == client_id);
            if is_owner {
                ownership.owner = None;
                self.tx_buffer.clear();
            }
            is_owner
        };

        if released {
            debug!("TX channel released by {}", client_id);
            if let Some(client) = self.clients.get(client_id).map(|e| e.value().clone()) {
                client.on_tx_released();
            }
            self.notify_owner_changed(None);
        }
    }

    pub fn current_tx_owner(&self) -> Option<String> {
        self.ownership
            .lock()
            .unwrap()
            .owner
            .as_ref()
            .map(|(id, _)| id.clone())
    }

    pub fn is_tx_owner(&self, client_id: &str) -> bool {
        matches!(
            &self.ownership.lock().unwrap().owner,
            Some((owner, _)) if owner == client_id
        )
    }

    /// The single ring buffer feeding the playback sink. Host-originated
    /// audio may be written here directly.
    pub fn tx_buffer(&self) -> &Arc<RingBuffer> {
        &self.tx_buffer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts the playback loop over the given sink.
    pub fn start(self: &Arc<Self>, mut sink: Box<dyn PlaybackSink>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mixer = Arc::clone(self);
        let handle = worker::spawn("audio-mixer", move || {
            mixer.playback_loop(sink.as_mut());
        })?;
        *self.playback_thread.lock().unwrap() = Some(handle);

        info!("mixer started");
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.playback_thread.lock().unwrap().take() {
            if !worker::join_timeout(handle, Duration::from_secs(1)) {
                warn!("playback thread did not stop in time, abandoning it");
            }
        }

        {
            let mut ownership = self.ownership.lock().unwrap();
            ownership.owner = None;
        }
        self.tx_buffer.clear();
        info!("mixer stopped");
    }

    fn playback_loop(&self, sink: &mut dyn PlaybackSink) {
        let frame_bytes = self.config.format.bytes_per_frame();
        let read_timeout = Duration::from_millis(self.config.format.frame_duration_ms as u64 * 2);
        let mut buf = vec![0u8; frame_bytes];
        let silence = vec![0u8; frame_bytes];

        // Initial buffering, bounded so playback starts on time even when
        // nobody is transmitting yet.
        let buffering_start = Instant::now();
        while self.running.load(Ordering::Acquire) && !self.tx_buffer.has_reached_target_level() {
            if buffering_start.elapsed() >= Duration::from_millis(MAX_INITIAL_BUFFERING_MS) {
                if self.tx_buffer.available() > 0 {
                    warn!(
                        "initial buffering timeout, starting with {} ms buffered",
                        self.tx_buffer.buffer_level_ms()
                    );
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        while self.running.load(Ordering::Acquire) {
            self.check_idle_timeout();

            let n = self.tx_buffer.read(&mut buf, read_timeout);
            if n > 0 {
                if let Err(e) = sink.write(&buf[..n as usize]) {
                    if self.running.load(Ordering::Acquire) {
                        warn!("playback error: {}", e);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            } else if n == 0 && self.tx_buffer.available() == 0 {
                // Keep the device fed to preserve cadence.
                let _ = sink.write(&silence);
            } else if n < 0 {
                break;
            }
        }
    }

    fn check_idle_timeout(&self) {
        let idle_timeout = Duration::from_millis(self.config.tx_idle_timeout_ms);

        let released = {
            let mut ownership = self.ownership.lock().unwrap();
            let expired = match &ownership.owner {
                Some((owner, _)) if ownership.last_activity.elapsed() >= idle_timeout => {
                    Some(owner.clone())
                }
                _ => None,
            };
            if expired.is_some() {
                ownership.owner = None;
                self.tx_buffer.clear();
            }
            expired
        };

        if let Some(owner) = released {
            debug!("TX channel released after idle timeout: {}", owner);
            if let Some(client) = self.clients.get(&owner).map(|e| e.value().clone()) {
                client.on_tx_released();
            }
            self.notify_owner_changed(None);
        }
    }

    fn notify_owner_changed(&self, new_owner: Option<&str>) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_tx_owner_changed(new_owner);
        }
    }
}
