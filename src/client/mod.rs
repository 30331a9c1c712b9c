//! Client session: connect handshake, worker orchestration and
//! auto-reconnect.
//!
//! A connected client runs five workers: receive (drains the socket),
//! playback (RX ring to the playback device), capture (capture device to
//! the TX ring, only when a capture source is configured), send (TX ring to
//! the socket) and heartbeat (liveness, latency probes, statistics). A
//! supervisor thread owns the reconnect policy and is the only place
//! connection loss is acted on; workers just report it and exit.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::audio::buffer::RingBuffer;
use crate::audio::device::{CaptureSource, PlaybackSink};
use crate::config::{
    BufferPolicy, StreamConfig, DEFAULT_FRAME_ERROR_LIMIT, DEFAULT_PORT, MAX_INITIAL_BUFFERING_MS,
};
use crate::error::{AudioError, Result};
use crate::events::StreamListener;
use crate::protocol::control::{ClientInfo, ClientsUpdate, ControlMessage, ControlType, RejectReason};
use crate::protocol::handler::{ProtocolHandler, HEARTBEAT_INTERVAL};
use crate::protocol::packet::{PacketType, VERSION};
use crate::protocol::monotonic_ns;
use crate::stats::StreamStats;
use crate::worker;

/// Socket connect and handshake deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connections shorter than this count against the reconnect attempt cap.
const MIN_STABLE_CONNECTION: Duration = Duration::from_secs(5);

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Receive poll granularity inside the receive worker.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Heartbeat worker tick.
const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

type AudioListenerFn = dyn Fn(&[u8]) + Send + Sync;

/// Connection settings for [`AudioClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    /// Name sent in the CONNECT_REQUEST.
    pub client_name: String,
    /// Optional identification shared with the rest of the roster.
    pub client_info: Option<ClientInfo>,
    /// Buffer watermarks requested from the server; the server's audio
    /// format always wins, only the policy is negotiable.
    pub requested_policy: Option<BufferPolicy>,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Initial reconnect delay; doubles per failed attempt.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub frame_error_limit: u32,
}

impl ClientConfig {
    pub fn new(server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            client_name: "netaudio-client".to_string(),
            client_info: None,
            requested_policy: None,
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            frame_error_limit: DEFAULT_FRAME_ERROR_LIMIT,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

enum ClientEvent {
    ConnectionLost { generation: u64 },
}

/// Streaming client for a netaudio server.
pub struct AudioClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    stream_config: Mutex<StreamConfig>,

    capture: Mutex<Option<Box<dyn CaptureSource>>>,
    playback: Mutex<Option<Box<dyn PlaybackSink>>>,
    capture_configured: AtomicBool,
    playback_configured: AtomicBool,

    protocol: Mutex<Option<Arc<ProtocolHandler>>>,
    rx_buffer: Mutex<Option<Arc<RingBuffer>>>,
    tx_buffer: Mutex<Option<Arc<RingBuffer>>>,

    connected: AtomicBool,
    streaming: AtomicBool,
    closed: AtomicBool,
    /// Bumped on every connect and teardown; workers carry the generation
    /// they were spawned under and exit once it goes stale.
    generation: AtomicU64,
    connect_time: Mutex<Instant>,
    latency_ms: AtomicU64,

    // PTT mute flags: start in RX mode (not sending, hearing RX).
    capture_muted: AtomicBool,
    playback_muted: AtomicBool,

    reconnect_attempt: AtomicU32,
    reconnecting: AtomicBool,

    listeners: Mutex<Vec<Arc<dyn StreamListener>>>,
    audio_listeners: Mutex<Vec<Arc<AudioListenerFn>>>,
    roster: Mutex<Option<ClientsUpdate>>,

    events_tx: Sender<ClientEvent>,
    events_rx: Receiver<ClientEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AudioClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events_tx, events_rx) = bounded(8);
        Self {
            inner: Arc::new(ClientInner {
                config,
                stream_config: Mutex::new(StreamConfig::default()),
                capture: Mutex::new(None),
                playback: Mutex::new(None),
                capture_configured: AtomicBool::new(false),
                playback_configured: AtomicBool::new(false),
                protocol: Mutex::new(None),
                rx_buffer: Mutex::new(None),
                tx_buffer: Mutex::new(None),
                connected: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                connect_time: Mutex::new(Instant::now()),
                latency_ms: AtomicU64::new(0),
                capture_muted: AtomicBool::new(true),
                playback_muted: AtomicBool::new(false),
                reconnect_attempt: AtomicU32::new(0),
                reconnecting: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
                audio_listeners: Mutex::new(Vec::new()),
                roster: Mutex::new(None),
                events_tx,
                events_rx,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Sets the TX capture device (e.g. a virtual line fed by digital-mode
    /// software). Optional; without it the client is receive-only.
    pub fn set_capture_source(&self, source: Box<dyn CaptureSource>) {
        *self.inner.capture.lock().unwrap() = Some(source);
        self.inner.capture_configured.store(true, Ordering::Release);
    }

    /// Sets the RX playback device. Required before `connect`.
    pub fn set_playback_sink(&self, sink: Box<dyn PlaybackSink>) {
        *self.inner.playback.lock().unwrap() = Some(sink);
        self.inner.playback_configured.store(true, Ordering::Release);
    }

    pub fn add_stream_listener(&self, listener: Arc<dyn StreamListener>) {
        self.inner.listeners.lock().unwrap().push(listener);
    }

    pub fn remove_stream_listener(&self, listener: &Arc<dyn StreamListener>) {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Subscribes a raw-PCM observer of received RX audio.
    pub fn add_audio_listener(&self, listener: Arc<AudioListenerFn>) {
        self.inner.audio_listeners.lock().unwrap().push(listener);
    }

    pub fn remove_audio_listener(&self, listener: &Arc<AudioListenerFn>) {
        self.inner
            .audio_listeners
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Connects, performs the handshake and starts the workers.
    pub fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.connected.load(Ordering::Acquire) || inner.reconnecting.load(Ordering::Acquire) {
            return Err(AudioError::AlreadyRunning);
        }
        if !inner.playback_configured.load(Ordering::Acquire) {
            return Err(AudioError::InvalidConfig("playback sink not configured".into()));
        }

        inner.closed.store(false, Ordering::Release);
        inner.reconnect_attempt.store(0, Ordering::Relaxed);

        inner.connect_internal()?;
        self.ensure_supervisor()?;
        Ok(())
    }

    /// Sends a graceful DISCONNECT and tears everything down. Terminal: no
    /// reconnection is attempted.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) && !inner.connected.load(Ordering::Acquire) {
            return;
        }

        let protocol = inner.protocol.lock().unwrap().clone();
        if let Some(protocol) = protocol {
            let _ = protocol.send_control(&ControlMessage::disconnect());
        }

        inner.teardown_connection();
        inner.notify(|listener| listener.on_client_disconnected("local"));

        if let Some(handle) = inner.supervisor.lock().unwrap().take() {
            if !worker::join_timeout(handle, Duration::from_secs(1)) {
                warn!("client supervisor did not stop in time, abandoning it");
            }
        }
        info!("client disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire) && !self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::Acquire)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.reconnect_attempt.load(Ordering::Relaxed)
    }

    /// The negotiated stream configuration (valid once connected).
    pub fn stream_config(&self) -> StreamConfig {
        self.inner.stream_config.lock().unwrap().clone()
    }

    pub fn stats(&self) -> StreamStats {
        self.inner.stats()
    }

    /// Fires a latency probe; the measured half-RTT lands in
    /// [`measured_latency_ms`](AudioClient::measured_latency_ms).
    pub fn measure_latency(&self) {
        let protocol = self.inner.protocol.lock().unwrap().clone();
        if let Some(protocol) = protocol {
            let _ = protocol.send_control(&ControlMessage::latency_probe(monotonic_ns()));
        }
    }

    pub fn measured_latency_ms(&self) -> u64 {
        self.inner.latency_ms.load(Ordering::Relaxed)
    }

    // Roster, from the last CLIENTS_UPDATE broadcast.

    pub fn server_clients_info(&self) -> Option<ClientsUpdate> {
        self.inner.roster.lock().unwrap().clone()
    }

    pub fn server_client_count(&self) -> Option<u8> {
        self.server_clients_info().map(|update| update.client_count)
    }

    pub fn server_max_clients(&self) -> Option<u8> {
        self.server_clients_info().map(|update| update.max_clients)
    }

    pub fn server_tx_owner(&self) -> Option<String> {
        self.server_clients_info().and_then(|update| update.tx_owner)
    }

    pub fn server_client_ids(&self) -> Option<Vec<String>> {
        self.server_clients_info()
            .map(|update| update.clients.into_iter().map(|entry| entry.id).collect())
    }

    // PTT mute controls.

    /// When muted, captured audio is not sent to the server.
    pub fn set_capture_muted(&self, muted: bool) {
        self.inner.capture_muted.store(muted, Ordering::Release);
    }

    pub fn is_capture_muted(&self) -> bool {
        self.inner.capture_muted.load(Ordering::Acquire)
    }

    /// When muted, silence is played while the RX buffer keeps draining.
    pub fn set_playback_muted(&self, muted: bool) {
        self.inner.playback_muted.store(muted, Ordering::Release);
    }

    pub fn is_playback_muted(&self) -> bool {
        self.inner.playback_muted.load(Ordering::Acquire)
    }

    /// PTT pressed: send voice, mute RX playback to prevent feedback.
    /// PTT released: stop sending, hear RX again.
    pub fn set_ptt(&self, active: bool) {
        self.inner.capture_muted.store(!active, Ordering::Release);
        self.inner.playback_muted.store(active, Ordering::Release);
    }

    fn ensure_supervisor(&self) -> Result<()> {
        let mut supervisor = self.inner.supervisor.lock().unwrap();
        let running = supervisor
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if running {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let events_rx = self.inner.events_rx.clone();
        *supervisor = Some(worker::spawn("client-supervisor", move || {
            supervisor_loop(inner, events_rx);
        })?);
        Ok(())
    }
}

impl Drop for AudioClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ClientInner {
    /// A worker keeps running while its spawn generation is current.
    fn worker_alive(&self, generation: u64) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.connected.load(Ordering::Acquire)
            && self.generation.load(Ordering::Acquire) == generation
    }

    /// Sleeps in small slices so shutdown is observed promptly. Returns
    /// whether the worker is still alive.
    fn sleep_observing(&self, generation: u64, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if !self.worker_alive(generation) {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        self.worker_alive(generation)
    }

    fn connect_internal(self: &Arc<Self>) -> Result<()> {
        let addr = self.resolve_server_addr()?;
        let socket = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        let protocol = Arc::new(ProtocolHandler::with_frame_error_limit(
            socket,
            self.config.frame_error_limit,
        )?);

        self.handshake(&protocol)?;

        let stream_config = self.stream_config.lock().unwrap().clone();
        let rx_buffer = Arc::new(RingBuffer::new(&stream_config, "client-rx"));
        let tx_buffer = Arc::new(RingBuffer::new(&stream_config, "client-tx"));

        *self.protocol.lock().unwrap() = Some(protocol.clone());
        *self.rx_buffer.lock().unwrap() = Some(rx_buffer.clone());
        *self.tx_buffer.lock().unwrap() = Some(tx_buffer.clone());
        *self.connect_time.lock().unwrap() = Instant::now();

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.connected.store(true, Ordering::Release);
        self.streaming.store(true, Ordering::Release);

        if let Err(e) = self.spawn_workers(generation, &stream_config, protocol, rx_buffer, tx_buffer)
        {
            self.teardown_connection();
            return Err(e);
        }

        info!("connected to {} ({:?})", addr, stream_config.format);
        self.notify(|listener| listener.on_client_connected("local", &addr.to_string()));
        self.notify(|listener| listener.on_stream_started("local", &stream_config));
        Ok(())
    }

    fn resolve_server_addr(&self) -> Result<SocketAddr> {
        (self.config.server_host.as_str(), self.config.server_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                AudioError::InvalidConfig(format!(
                    "cannot resolve server address {}",
                    self.config.server_host
                ))
            })
    }

    /// Sends the CONNECT_REQUEST and processes responses until the server
    /// accepts or rejects. AUDIO_CONFIG is applied unconditionally as soon
    /// as it arrives; non-control traffic is ignored.
    fn handshake(&self, protocol: &ProtocolHandler) -> Result<()> {
        let request = ControlMessage::connect_request(
            &self.config.client_name,
            VERSION,
            self.config.requested_policy.as_ref(),
            self.config.client_info.as_ref(),
        );
        protocol.send_control(&request)?;

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AudioError::Handshake("timed out waiting for server".into()));
            }

            let Some(packet) = protocol.receive_packet(remaining)? else {
                return Err(AudioError::Handshake("timed out waiting for server".into()));
            };
            if packet.packet_type != PacketType::Control {
                continue;
            }
            let Some(message) = ControlMessage::deserialize(&packet.payload) else {
                continue;
            };

            match message.msg_type() {
                ControlType::AudioConfig => {
                    if let Some((format, policy)) = message.parse_audio_config() {
                        self.apply_audio_config(format, policy);
                    }
                }
                ControlType::ConnectAccept => return Ok(()),
                ControlType::ConnectReject => {
                    let (reason, message) = message
                        .parse_reject()
                        .unwrap_or((RejectReason::Rejected, String::new()));
                    return Err(AudioError::Rejected { reason, message });
                }
                _ => {}
            }
        }
    }

    fn apply_audio_config(&self, format: crate::config::StreamFormat, policy: Option<BufferPolicy>) {
        let mut config = self.stream_config.lock().unwrap();
        config.format = format;
        config.policy = policy.unwrap_or_default();
        debug!("applied server audio config: {:?} {:?}", config.format, config.policy);
    }

    fn spawn_workers(
        self: &Arc<Self>,
        generation: u64,
        stream_config: &StreamConfig,
        protocol: Arc<ProtocolHandler>,
        rx_buffer: Arc<RingBuffer>,
        tx_buffer: Arc<RingBuffer>,
    ) -> Result<()> {
        {
            let inner = Arc::clone(self);
            let protocol = protocol.clone();
            let rx_buffer = rx_buffer.clone();
            worker::spawn("client-receive", move || {
                receive_worker(inner, generation, protocol, rx_buffer);
            })?;
        }

        {
            let inner = Arc::clone(self);
            let config = stream_config.clone();
            let rx_buffer = rx_buffer.clone();
            worker::spawn("client-playback", move || {
                playback_worker(inner, generation, config, rx_buffer);
            })?;
        }

        if self.capture_configured.load(Ordering::Acquire) {
            {
                let inner = Arc::clone(self);
                let config = stream_config.clone();
                let tx_buffer = tx_buffer.clone();
                worker::spawn("client-capture", move || {
                    capture_worker(inner, generation, config, tx_buffer);
                })?;
            }
            {
                let inner = Arc::clone(self);
                let config = stream_config.clone();
                let protocol = protocol.clone();
                worker::spawn("client-send", move || {
                    send_worker(inner, generation, config, tx_buffer, protocol);
                })?;
            }
        }

        {
            let inner = Arc::clone(self);
            worker::spawn("client-heartbeat", move || {
                heartbeat_worker(inner, generation, protocol);
            })?;
        }

        Ok(())
    }

    /// Reports a connection loss to the supervisor. Safe to call from any
    /// worker; stale generations are ignored.
    fn report_connection_lost(&self, generation: u64, message: &str) {
        if self.closed.load(Ordering::Acquire)
            || self.generation.load(Ordering::Acquire) != generation
        {
            return;
        }
        self.notify_error(message);
        let _ = self.events_tx.try_send(ClientEvent::ConnectionLost { generation });
    }

    /// Stops workers and releases per-connection resources. Device handles
    /// are kept for the next connect.
    fn teardown_connection(&self) {
        let was_streaming = self.streaming.swap(false, Ordering::AcqRel);
        self.connected.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);

        if let Some(protocol) = self.protocol.lock().unwrap().take() {
            protocol.close();
        }
        if let Some(buffer) = self.rx_buffer.lock().unwrap().take() {
            buffer.close();
        }
        if let Some(buffer) = self.tx_buffer.lock().unwrap().take() {
            buffer.close();
        }

        if was_streaming {
            self.notify(|listener| listener.on_stream_stopped("local"));
        }
    }

    /// Acts on a reported connection loss: teardown, then reconnect or
    /// terminal close. Runs on the supervisor thread only.
    fn handle_connection_lost(self: &Arc<Self>) {
        let was_short_lived = self.connect_time.lock().unwrap().elapsed() < MIN_STABLE_CONNECTION;
        self.teardown_connection();

        if !self.config.auto_reconnect || self.closed.load(Ordering::Acquire) {
            self.finish_closed(None);
            return;
        }

        if was_short_lived {
            // Short-lived connections burn attempts so a misconfigured peer
            // cannot keep us in a hot reconnect loop.
            let attempt = self.reconnect_attempt.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt >= self.config.max_reconnect_attempts {
                self.finish_closed(Some(format!(
                    "connection unstable: failed {} times within {:?} of connecting",
                    attempt, MIN_STABLE_CONNECTION
                )));
                return;
            }
        } else {
            self.reconnect_attempt.store(0, Ordering::Relaxed);
        }

        self.reconnect_loop();
    }

    fn reconnect_loop(self: &Arc<Self>) {
        self.reconnecting.store(true, Ordering::Release);
        let mut delay = self.config.reconnect_delay;

        while !self.closed.load(Ordering::Acquire)
            && self.reconnect_attempt.load(Ordering::Relaxed) < self.config.max_reconnect_attempts
        {
            let attempt = self.reconnect_attempt.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                "reconnecting, attempt {}/{}",
                attempt, self.config.max_reconnect_attempts
            );
            self.notify(|listener| {
                listener.on_reconnecting(attempt, self.config.max_reconnect_attempts)
            });

            if !self.sleep_closed_aware(delay) {
                break;
            }

            match self.connect_internal() {
                Ok(()) => {
                    // The attempt counter is deliberately not reset here; a
                    // connection only proves itself after surviving the
                    // stability window.
                    self.reconnecting.store(false, Ordering::Release);
                    info!("reconnected after {} attempts", attempt);
                    self.notify(|listener| listener.on_reconnected());
                    return;
                }
                Err(e) => {
                    self.notify_error(&format!(
                        "reconnect attempt {}/{} failed: {}",
                        attempt, self.config.max_reconnect_attempts, e
                    ));
                    delay = (delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }

        self.reconnecting.store(false, Ordering::Release);
        if !self.closed.load(Ordering::Acquire) {
            self.finish_closed(Some(format!(
                "failed to reconnect after {} attempts",
                self.reconnect_attempt.load(Ordering::Relaxed)
            )));
        }
    }

    /// Terminal close from the supervisor side.
    fn finish_closed(&self, error: Option<String>) {
        self.closed.store(true, Ordering::Release);
        self.reconnecting.store(false, Ordering::Release);
        if let Some(message) = error {
            self.notify_error(&message);
        }
        self.notify(|listener| listener.on_client_disconnected("local"));
    }

    fn sleep_closed_aware(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        !self.closed.load(Ordering::Acquire)
    }

    fn write_playback(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.playback.lock().unwrap();
        match guard.as_mut() {
            Some(sink) => sink.write(data).map(|_| ()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "playback sink missing",
            )),
        }
    }

    fn handle_control_message(self: &Arc<Self>, generation: u64, payload: &[u8]) {
        let Some(message) = ControlMessage::deserialize(payload) else {
            return;
        };

        match message.msg_type() {
            ControlType::LatencyResponse => {
                if let Some(sent) = message.parse_latency_timestamp() {
                    let half_rtt_ms = monotonic_ns().saturating_sub(sent) / 1_000_000 / 2;
                    self.latency_ms.store(half_rtt_ms, Ordering::Relaxed);
                }
            }
            ControlType::ClientsUpdate => {
                if let Some(update) = message.parse_clients_update() {
                    *self.roster.lock().unwrap() = Some(update.clone());
                    self.notify(|listener| listener.on_clients_update(&update));
                }
            }
            ControlType::TxGranted => self.notify(|listener| listener.on_tx_granted()),
            ControlType::TxDenied => {
                let holder = message.parse_tx_client_id();
                self.notify(|listener| listener.on_tx_denied(holder.as_deref()));
            }
            ControlType::TxPreempted => {
                let preemptor = message.parse_tx_client_id();
                self.notify(|listener| listener.on_tx_preempted(preemptor.as_deref()));
            }
            ControlType::TxReleased => self.notify(|listener| listener.on_tx_released()),
            ControlType::AudioConfig => {
                if let Some((format, policy)) = message.parse_audio_config() {
                    self.apply_audio_config(format, policy);
                }
            }
            ControlType::Disconnect | ControlType::Error => {
                if let Some(text) = message.parse_error_message() {
                    self.notify_error(&text);
                }
                self.report_connection_lost(generation, "server closed the connection");
            }
            _ => {}
        }
    }

    fn stats(&self) -> StreamStats {
        let protocol = self.protocol.lock().unwrap().clone();
        let rx_buffer = self.rx_buffer.lock().unwrap().clone();
        let (Some(protocol), Some(rx_buffer)) = (protocol, rx_buffer) else {
            return StreamStats::default();
        };

        let buffer_stats = rx_buffer.stats();
        StreamStats {
            bytes_sent: protocol.bytes_sent(),
            bytes_received: protocol.bytes_received(),
            packets_sent: protocol.packets_sent(),
            packets_received: protocol.packets_received(),
            buffer_level_ms: rx_buffer.buffer_level_ms(),
            buffer_fill_percent: rx_buffer.fill_percent(),
            underrun_count: buffer_stats.underrun_count,
            overrun_count: buffer_stats.overrun_count,
            tx_bytes_submitted: 0,
            tx_bytes_accepted: 0,
            tx_denied_count: 0,
            crc_errors: protocol.crc_errors(),
            latency_ms: self.latency_ms.load(Ordering::Relaxed),
            connection_time_ms: self.connect_time.lock().unwrap().elapsed().as_millis() as u64,
            streaming: self.streaming.load(Ordering::Acquire),
        }
    }

    fn notify(&self, f: impl Fn(&Arc<dyn StreamListener>)) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in &listeners {
            f(listener);
        }
    }

    fn notify_error(&self, message: &str) {
        warn!("client error: {}", message);
        self.notify(|listener| listener.on_error(Some("local"), message));
    }
}

fn supervisor_loop(inner: Arc<ClientInner>, events_rx: Receiver<ClientEvent>) {
    loop {
        match events_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(ClientEvent::ConnectionLost { generation }) => {
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                if inner.generation.load(Ordering::Acquire) != generation {
                    continue;
                }
                inner.handle_connection_lost();
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("client supervisor exited");
}

fn receive_worker(
    inner: Arc<ClientInner>,
    generation: u64,
    protocol: Arc<ProtocolHandler>,
    rx_buffer: Arc<RingBuffer>,
) {
    while inner.worker_alive(generation) {
        match protocol.receive_packet(RECEIVE_POLL) {
            Ok(None) => continue,
            Ok(Some(packet)) => match packet.packet_type {
                PacketType::AudioRx => {
                    rx_buffer.write(&packet.payload);
                    let listeners = inner.audio_listeners.lock().unwrap().clone();
                    for listener in &listeners {
                        listener(&packet.payload);
                    }
                }
                PacketType::Control => inner.handle_control_message(generation, &packet.payload),
                PacketType::Heartbeat => {
                    let _ = protocol.send_control(&ControlMessage::heartbeat_ack());
                }
                PacketType::AudioTx => {}
            },
            Err(e) => {
                inner.report_connection_lost(generation, &format!("receive error: {}", e));
                break;
            }
        }
    }
}

fn playback_worker(
    inner: Arc<ClientInner>,
    generation: u64,
    config: StreamConfig,
    rx_buffer: Arc<RingBuffer>,
) {
    let frame_bytes = config.format.bytes_per_frame();
    let read_timeout = Duration::from_millis(config.format.frame_duration_ms as u64 * 2);
    let mut buf = vec![0u8; frame_bytes];
    let silence = vec![0u8; frame_bytes];

    // Pre-buffer, bounded so delivery stays on time even on a thin stream.
    let buffering_start = Instant::now();
    while inner.worker_alive(generation) && !rx_buffer.has_reached_target_level() {
        if buffering_start.elapsed() >= Duration::from_millis(MAX_INITIAL_BUFFERING_MS) {
            debug!(
                "initial buffering timeout, starting with {} bytes",
                rx_buffer.available()
            );
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    while inner.worker_alive(generation) {
        let n = rx_buffer.read(&mut buf, read_timeout);
        if n > 0 {
            let n = n as usize;
            // Muted playback still drains the buffer to keep cadence.
            let out = if inner.playback_muted.load(Ordering::Acquire) {
                &silence[..n]
            } else {
                &buf[..n]
            };
            if let Err(e) = inner.write_playback(out) {
                inner.report_connection_lost(generation, &format!("playback error: {}", e));
                break;
            }
        } else if n == 0 && rx_buffer.available() == 0 {
            if inner.write_playback(&silence).is_err() {
                break;
            }
        } else if n < 0 {
            break;
        }
    }
}

fn capture_worker(
    inner: Arc<ClientInner>,
    generation: u64,
    config: StreamConfig,
    tx_buffer: Arc<RingBuffer>,
) {
    let sample_bytes = config.format.bytes_per_sample();
    let frame_bytes = config.format.bytes_per_frame();

    let capture_channels = {
        let guard = inner.capture.lock().unwrap();
        match guard.as_ref() {
            Some(source) => source.channels(),
            None => return,
        }
    };
    // Mono capture on a stereo wire format: read half a frame and duplicate
    // each sample onto both channels.
    let mono_to_stereo = capture_channels == 1 && config.format.channels == 2;
    let read_size = if mono_to_stereo { frame_bytes / 2 } else { frame_bytes };

    let mut read_buf = vec![0u8; read_size];
    let mut stereo_buf = vec![0u8; frame_bytes];

    while inner.worker_alive(generation) {
        let result = {
            let mut guard = inner.capture.lock().unwrap();
            match guard.as_mut() {
                Some(source) => source.read(&mut read_buf),
                None => break,
            }
        };

        match result {
            Ok(0) => {
                inner.report_connection_lost(generation, "capture source reached end of stream");
                break;
            }
            Ok(n) => {
                if inner.capture_muted.load(Ordering::Acquire) {
                    continue;
                }
                if mono_to_stereo {
                    let mut out = 0;
                    let mut i = 0;
                    while i + sample_bytes <= n {
                        let sample = &read_buf[i..i + sample_bytes];
                        stereo_buf[out..out + sample_bytes].copy_from_slice(sample);
                        out += sample_bytes;
                        stereo_buf[out..out + sample_bytes].copy_from_slice(sample);
                        out += sample_bytes;
                        i += sample_bytes;
                    }
                    tx_buffer.write(&stereo_buf[..out]);
                } else {
                    tx_buffer.write(&read_buf[..n]);
                }
            }
            Err(e) => {
                if inner.worker_alive(generation) {
                    inner.report_connection_lost(generation, &format!("capture error: {}", e));
                }
                break;
            }
        }
    }
}

fn send_worker(
    inner: Arc<ClientInner>,
    generation: u64,
    config: StreamConfig,
    tx_buffer: Arc<RingBuffer>,
    protocol: Arc<ProtocolHandler>,
) {
    let frame_bytes = config.format.bytes_per_frame();
    let read_timeout = Duration::from_millis(config.format.frame_duration_ms as u64 * 2);
    let mut buf = vec![0u8; frame_bytes];

    while inner.worker_alive(generation) {
        let n = tx_buffer.read(&mut buf, read_timeout);
        if n > 0 {
            if let Err(e) = protocol.send_tx_audio(&buf[..n as usize]) {
                inner.report_connection_lost(generation, &format!("send error: {}", e));
                break;
            }
        } else if n < 0 {
            break;
        }
    }
}

fn heartbeat_worker(inner: Arc<ClientInner>, generation: u64, protocol: Arc<ProtocolHandler>) {
    let mut last_probe = Instant::now();

    while inner.worker_alive(generation) {
        if !inner.sleep_observing(generation, HEARTBEAT_TICK) {
            break;
        }

        if protocol.should_send_heartbeat() {
            if let Err(e) = protocol.send_heartbeat() {
                inner.report_connection_lost(generation, &format!("heartbeat error: {}", e));
                break;
            }
        }

        if protocol.is_connection_timed_out() {
            inner.report_connection_lost(generation, "connection timeout");
            break;
        }

        if last_probe.elapsed() >= HEARTBEAT_INTERVAL {
            last_probe = Instant::now();
            let _ = protocol.send_control(&ControlMessage::latency_probe(monotonic_ns()));
            let stats = inner.stats();
            inner.notify(|listener| listener.on_statistics_update("local", &stats));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_port, DEFAULT_PORT);
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_ptt_controls_both_mutes() {
        let client = AudioClient::new(ClientConfig::default());

        // Initial state: RX mode.
        assert!(client.is_capture_muted());
        assert!(!client.is_playback_muted());

        client.set_ptt(true);
        assert!(!client.is_capture_muted());
        assert!(client.is_playback_muted());

        client.set_ptt(false);
        assert!(client.is_capture_muted());
        assert!(!client.is_playback_muted());
    }

    #[test]
    fn test_connect_requires_playback_sink() {
        let client = AudioClient::new(ClientConfig::new("127.0.0.1", 1));
        assert!(matches!(
            client.connect(),
            Err(AudioError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_stats_default_when_disconnected() {
        let client = AudioClient::new(ClientConfig::default());
        assert_eq!(client.stats(), StreamStats::default());
        assert!(!client.is_connected());
        assert!(!client.is_streaming());
        assert!(client.server_clients_info().is_none());
    }
}
