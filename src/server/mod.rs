//! TCP server: accept loop, per-client sessions, RX broadcast and TX
//! arbitration wiring.

pub mod broadcaster;
pub mod mixer;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::audio::device::{CaptureSource, PlaybackSink};
use crate::config::StreamConfig;
use crate::error::{AudioError, Result};
use crate::events::StreamListener;
use crate::protocol::control::{ClientInfo, ControlMessage, ControlType, RejectReason};
use crate::protocol::handler::ProtocolHandler;
use crate::protocol::monotonic_ns;
use crate::protocol::packet::PacketType;
use crate::server::broadcaster::{BroadcastTarget, Broadcaster};
use crate::server::mixer::{Mixer, MixerListener, TxClient, TxPriority, TxResult};
use crate::stats::StreamStats;
use crate::worker;

/// How long the server waits for the CONNECT_REQUEST after accept.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive poll granularity inside the session receive worker.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Supervision tick in the session main loop.
const SUPERVISION_TICK: Duration = Duration::from_secs(1);

type AudioListenerFn = dyn Fn(&[u8]) + Send + Sync;

/// Multi-client audio streaming server.
///
/// Captures RX audio from a single device and broadcasts it to every
/// connected client; accepted TX audio from clients is arbitrated by
/// priority and played to the single playback device.
pub struct AudioServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    port: u16,
    config: StreamConfig,
    running: AtomicBool,

    capture_source: Mutex<Option<Box<dyn CaptureSource>>>,
    playback_sink: Mutex<Option<Box<dyn PlaybackSink>>>,
    capture_configured: AtomicBool,
    inject_only: AtomicBool,

    local_addr: Mutex<Option<SocketAddr>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,

    sessions: DashMap<String, Arc<ClientSession>>,
    client_id_counter: AtomicU32,

    broadcaster: Arc<Broadcaster>,
    mixer: Arc<Mixer>,

    listeners: Mutex<Vec<Arc<dyn StreamListener>>>,
    audio_listeners: Mutex<Vec<Arc<AudioListenerFn>>>,
    audio_listener_registered: AtomicBool,
}

impl AudioServer {
    pub fn new(port: u16) -> Self {
        Self::with_config(port, StreamConfig::default())
    }

    pub fn with_config(port: u16, config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                port,
                broadcaster: Arc::new(Broadcaster::new(config.clone())),
                mixer: Arc::new(Mixer::new(config.clone())),
                config,
                running: AtomicBool::new(false),
                capture_source: Mutex::new(None),
                playback_sink: Mutex::new(None),
                capture_configured: AtomicBool::new(false),
                inject_only: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                accept_thread: Mutex::new(None),
                sessions: DashMap::new(),
                client_id_counter: AtomicU32::new(1),
                listeners: Mutex::new(Vec::new()),
                audio_listeners: Mutex::new(Vec::new()),
                audio_listener_registered: AtomicBool::new(false),
            }),
        }
    }

    /// Sets the radio RX capture device. Must be called before `start`.
    pub fn set_capture_source(&self, source: Box<dyn CaptureSource>) {
        *self.inner.capture_source.lock().unwrap() = Some(source);
        self.inner.capture_configured.store(true, Ordering::Release);
    }

    /// Sets the radio TX playback device. Must be called before `start`.
    pub fn set_playback_sink(&self, sink: Box<dyn PlaybackSink>) {
        *self.inner.playback_sink.lock().unwrap() = Some(sink);
    }

    /// With no capture device, accept clients anyway; RX audio comes
    /// exclusively through [`inject_audio`](AudioServer::inject_audio).
    pub fn set_inject_only(&self, inject_only: bool) {
        self.inner.inject_only.store(inject_only, Ordering::Release);
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

    /// Subscribes a raw-PCM observer of the RX broadcast (waterfall/FFT
    /// consumers that are not full clients).
    pub fn add_audio_listener(&self, listener: Arc<AudioListenerFn>) {
        self.inner.audio_listeners.lock().unwrap().push(listener);

        if !self.inner.audio_listener_registered.swap(true, Ordering::AcqRel) {
            let target = Arc::new(AudioListenerTarget {
                server: Arc::downgrade(&self.inner),
            });
            self.inner.broadcaster.add_target(target);
        }
    }

    pub fn remove_audio_listener(&self, listener: &Arc<AudioListenerFn>) {
        let mut listeners = self.inner.audio_listeners.lock().unwrap();
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
        if listeners.is_empty()
            && self.inner.audio_listener_registered.swap(false, Ordering::AcqRel)
        {
            self.inner.broadcaster.remove_target(AUDIO_LISTENER_TARGET_ID);
        }
    }

    /// Starts listening and serving clients.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.config.validate()?;

        if inner.running.swap(true, Ordering::AcqRel) {
            return Err(AudioError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(("0.0.0.0", inner.port)) {
            Ok(listener) => listener,
            Err(e) => {
                inner.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        *inner.local_addr.lock().unwrap() = Some(local_addr);

        // Roster rebroadcast on TX ownership changes.
        inner.mixer.set_listener(Arc::new(ServerMixerListener {
            server: Arc::downgrade(inner),
        }));

        // A target that fails mid-broadcast takes its session down.
        {
            let server = Arc::downgrade(inner);
            inner.broadcaster.set_failure_listener(move |target_id, reason| {
                if let Some(server) = server.upgrade() {
                    if let Some(session) = server.sessions.get(target_id).map(|e| e.value().clone())
                    {
                        session.request_close();
                    }
                    server.notify_error(Some(target_id), reason);
                }
            });
        }

        if let Some(source) = inner.capture_source.lock().unwrap().take() {
            inner.broadcaster.start(source)?;
        }
        if let Some(sink) = inner.playback_sink.lock().unwrap().take() {
            inner.mixer.start(sink)?;
        }

        let server = Arc::clone(inner);
        let handle = worker::spawn("audio-accept", move || {
            server.accept_loop(listener);
        })?;
        *inner.accept_thread.lock().unwrap() = Some(handle);

        info!("audio server listening on {}", local_addr);
        inner.notify(|listener| listener.on_server_started(local_addr.port()));
        Ok(())
    }

    /// Stops the server and disconnects every client.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for entry in inner.sessions.iter() {
            entry.value().request_close();
        }

        inner.broadcaster.stop();
        inner.mixer.stop();

        // Wake the blocked accept() with a throwaway connection.
        if let Some(addr) = *inner.local_addr.lock().unwrap() {
            let wake = SocketAddr::new([127, 0, 0, 1].into(), addr.port());
            let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(200));
        }
        if let Some(handle) = inner.accept_thread.lock().unwrap().take() {
            if !worker::join_timeout(handle, Duration::from_secs(1)) {
                warn!("accept thread did not stop in time, abandoning it");
            }
        }

        info!("audio server stopped");
        inner.notify(|listener| listener.on_server_stopped());
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The bound address, available after `start` (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn client_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn has_clients(&self) -> bool {
        !self.inner.sessions.is_empty()
    }

    pub fn connected_client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn client_stats(&self, client_id: &str) -> Option<StreamStats> {
        self.inner
            .sessions
            .get(client_id)
            .map(|entry| entry.value().stats(&self.inner))
    }

    pub fn all_client_stats(&self) -> Vec<(String, StreamStats)> {
        self.inner
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats(&self.inner)))
            .collect()
    }

    /// The client currently holding the TX channel, if any.
    pub fn tx_owner(&self) -> Option<String> {
        self.inner.mixer.current_tx_owner()
    }

    /// Changes the arbitration priority of a connected client.
    pub fn set_client_tx_priority(&self, client_id: &str, priority: TxPriority) -> bool {
        match self.inner.sessions.get(client_id) {
            Some(entry) => {
                *entry.value().tx_priority.lock().unwrap() = priority;
                true
            }
            None => false,
        }
    }

    /// Broadcasts PCM to all connected clients as if it had been captured.
    pub fn inject_audio(&self, audio: &[u8]) {
        self.inner.broadcaster.inject_audio(audio);
    }

    /// Plays host-originated PCM to the radio via the mixer's TX ring so it
    /// cannot fight the playback loop.
    pub fn play_local_audio(&self, audio: &[u8]) {
        if !audio.is_empty() {
            self.inner.mixer.tx_buffer().write(audio);
        }
    }
}

impl Drop for AudioServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerInner {
    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((socket, addr)) => {
                    if self.running.load(Ordering::Acquire) {
                        self.clone().handle_new_client(socket, addr);
                    }
                }
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        self.notify_error(None, &format!("accept error: {}", e));
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        }
        debug!("accept loop exited");
    }

    fn handle_new_client(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        let client_id = format!("audio-{}", self.client_id_counter.fetch_add(1, Ordering::Relaxed));

        if !self.capture_configured.load(Ordering::Acquire)
            && !self.inject_only.load(Ordering::Acquire)
        {
            self.reject_client(socket, RejectReason::Rejected, "capture device not configured");
            return;
        }

        if self.sessions.len() >= self.config.max_clients {
            self.reject_client(
                socket,
                RejectReason::Busy,
                &format!("maximum clients ({}) reached", self.config.max_clients),
            );
            return;
        }

        let protocol =
            match ProtocolHandler::with_frame_error_limit(socket, self.config.frame_error_limit) {
                Ok(handler) => Arc::new(handler),
                Err(e) => {
                    self.notify_error(Some(&client_id), &format!("failed to create session: {}", e));
                    return;
                }
            };

        let session = Arc::new(ClientSession::new(
            client_id.clone(),
            protocol,
            self.config.clone(),
        ));
        self.sessions.insert(client_id.clone(), session.clone());

        info!("client connected: {} from {}", client_id, addr);
        self.notify(|listener| listener.on_client_connected(&client_id, &addr.to_string()));

        let server = Arc::clone(&self);
        let spawned = worker::spawn(&format!("session-{}", client_id), move || {
            session_main(server, session);
        });
        if let Err(e) = spawned {
            self.notify_error(Some(&client_id), &format!("failed to spawn session: {}", e));
            if let Some((_, session)) = self.sessions.remove(&client_id) {
                session.request_close();
            }
        }
    }

    fn reject_client(&self, socket: TcpStream, reason: RejectReason, message: &str) {
        debug!("rejecting client: {}", message);
        if let Ok(handler) = ProtocolHandler::new(socket) {
            let _ = handler.send_control(&ControlMessage::connect_reject(reason, message));
            // Drain the pending CONNECT_REQUEST so closing sends FIN rather
            // than RST, which could discard the rejection in flight.
            let _ = handler.receive_packet(Duration::from_millis(200));
            handler.close();
        }
    }

    /// Assembles the current roster and sends it to every active session.
    fn broadcast_clients_update(&self) {
        if self.sessions.is_empty() {
            return;
        }

        let mut clients: Vec<(String, Option<ClientInfo>)> = self
            .sessions
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().client_info.lock().unwrap().clone(),
                )
            })
            .collect();
        clients.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let update = ControlMessage::clients_update(
            clients.len(),
            self.config.max_clients,
            self.mixer.current_tx_owner().as_deref(),
            &clients,
        );

        // Per-session failures are tolerated; a dead session is reaped by
        // its own workers.
        let sessions: Vec<Arc<ClientSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.send_control(&update);
        }
    }

    fn notify(&self, f: impl Fn(&Arc<dyn StreamListener>)) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in &listeners {
            f(listener);
        }
    }

    fn notify_error(&self, client_id: Option<&str>, message: &str) {
        warn!("server error ({}): {}", client_id.unwrap_or("-"), message);
        self.notify(|listener| listener.on_error(client_id, message));
    }
}

const AUDIO_LISTENER_TARGET_ID: &str = "audio-listener-target";

/// Aggregate broadcast target forwarding RX PCM to raw audio listeners.
struct AudioListenerTarget {
    server: Weak<ServerInner>,
}

impl BroadcastTarget for AudioListenerTarget {
    fn target_id(&self) -> &str {
        AUDIO_LISTENER_TARGET_ID
    }

    fn receive_rx_audio(&self, audio: &[u8]) -> bool {
        let Some(server) = self.server.upgrade() else {
            return false;
        };
        let listeners = server.audio_listeners.lock().unwrap().clone();
        for listener in &listeners {
            listener(audio);
        }
        true
    }
}

struct ServerMixerListener {
    server: Weak<ServerInner>,
}

impl MixerListener for ServerMixerListener {
    fn on_tx_conflict(&self, holding_client_id: &str, requesting_client_id: &str) {
        debug!(
            "TX conflict: {} blocked by {}",
            requesting_client_id, holding_client_id
        );
    }

    fn on_tx_owner_changed(&self, new_owner: Option<&str>) {
        debug!("TX owner changed to {:?}", new_owner);
        if let Some(server) = self.server.upgrade() {
            server.broadcast_clients_update();
        }
    }
}

/// Server-side per-connection state machine.
///
/// One instance doubles as the session's [`BroadcastTarget`] (RX fan-out
/// writes through its protocol handler) and [`TxClient`] (arbitration
/// callbacks become control messages).
struct ClientSession {
    id: String,
    protocol: Arc<ProtocolHandler>,
    session_config: Mutex<StreamConfig>,
    client_info: Mutex<Option<ClientInfo>>,
    tx_priority: Mutex<TxPriority>,

    closed: AtomicBool,
    streaming: AtomicBool,
    connect_time: Instant,
    latency_ms: AtomicU64,

    tx_bytes_submitted: AtomicU64,
    tx_bytes_accepted: AtomicU64,
    tx_denied_count: AtomicU32,

    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    fn new(id: String, protocol: Arc<ProtocolHandler>, server_config: StreamConfig) -> Self {
        Self {
            id,
            protocol,
            session_config: Mutex::new(server_config),
            client_info: Mutex::new(None),
            tx_priority: Mutex::new(TxPriority::Normal),
            closed: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            connect_time: Instant::now(),
            latency_ms: AtomicU64::new(0),
            tx_bytes_submitted: AtomicU64::new(0),
            tx_bytes_accepted: AtomicU64::new(0),
            tx_denied_count: AtomicU32::new(0),
            receive_thread: Mutex::new(None),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the session for teardown and unblocks its workers. Idempotent;
    /// the session main thread performs the actual teardown exactly once.
    fn request_close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.protocol.close();
        }
    }

    fn send_control(&self, message: &ControlMessage) {
        if self.is_closed() || !self.streaming.load(Ordering::Acquire) {
            return;
        }
        // Send failures surface through the receive worker shortly after.
        let _ = self.protocol.send_control(message);
    }

    /// Waits for the CONNECT_REQUEST and merges the client's preferences.
    /// `Ok(false)` means a protocol violation: close silently, no retry.
    fn perform_handshake(&self) -> Result<bool> {
        let packet = match self.protocol.receive_packet(HANDSHAKE_TIMEOUT)? {
            Some(packet) => packet,
            None => return Ok(false),
        };
        if packet.packet_type != PacketType::Control {
            return Ok(false);
        }
        let Some(message) = ControlMessage::deserialize(&packet.payload) else {
            return Ok(false);
        };
        let Some(request) = message.parse_connect_request() else {
            return Ok(false);
        };

        // The server format stays authoritative; only the buffer policy may
        // follow the client's preference.
        if let Some(policy) = request.requested_policy {
            if policy.validate().is_ok() {
                let mut config = self.session_config.lock().unwrap();
                *config = config.with_policy(policy);
            } else {
                warn!("{}: ignoring invalid requested buffer policy", self.id);
            }
        }

        if let Some(info) = request.client_info {
            info!("client {} identified as {}", self.id, info.display_string());
            *self.client_info.lock().unwrap() = Some(info);
        }

        Ok(true)
    }

    fn handle_tx_audio(&self, server: &ServerInner, audio: &[u8]) {
        self.tx_bytes_submitted.fetch_add(audio.len() as u64, Ordering::Relaxed);

        match server.mixer.submit_tx_audio(&self.id, audio) {
            TxResult::Accepted | TxResult::Preempted => {
                self.tx_bytes_accepted.fetch_add(audio.len() as u64, Ordering::Relaxed);
            }
            TxResult::Rejected => {
                // First denial after each grant only, to avoid spam.
                if self.tx_denied_count.fetch_add(1, Ordering::Relaxed) == 0 {
                    let owner = server.mixer.current_tx_owner();
                    let _ = self
                        .protocol
                        .send_control(&ControlMessage::tx_denied(owner.as_deref()));
                }
            }
        }
    }

    fn handle_control(&self, payload: &[u8]) {
        let Some(message) = ControlMessage::deserialize(payload) else {
            return;
        };
        match message.msg_type() {
            ControlType::LatencyProbe => {
                if let Some(timestamp) = message.parse_latency_timestamp() {
                    let _ = self
                        .protocol
                        .send_control(&ControlMessage::latency_response(timestamp));
                }
            }
            ControlType::LatencyResponse => {
                if let Some(sent) = message.parse_latency_timestamp() {
                    let half_rtt_ms = monotonic_ns().saturating_sub(sent) / 1_000_000 / 2;
                    self.latency_ms.store(half_rtt_ms, Ordering::Relaxed);
                }
            }
            ControlType::Disconnect => {
                info!("client {} disconnected gracefully", self.id);
                self.request_close();
            }
            // Receiving anything already refreshed the liveness clock.
            ControlType::Heartbeat | ControlType::HeartbeatAck => {}
            _ => {}
        }
    }

    fn stats(&self, server: &ServerInner) -> StreamStats {
        let tx_buffer = server.mixer.tx_buffer();
        let buffer_stats = tx_buffer.stats();
        StreamStats {
            bytes_sent: self.protocol.bytes_sent(),
            bytes_received: self.protocol.bytes_received(),
            packets_sent: self.protocol.packets_sent(),
            packets_received: self.protocol.packets_received(),
            buffer_level_ms: tx_buffer.buffer_level_ms(),
            buffer_fill_percent: tx_buffer.fill_percent(),
            underrun_count: buffer_stats.underrun_count,
            overrun_count: buffer_stats.overrun_count,
            tx_bytes_submitted: self.tx_bytes_submitted.load(Ordering::Relaxed),
            tx_bytes_accepted: self.tx_bytes_accepted.load(Ordering::Relaxed),
            tx_denied_count: self.tx_denied_count.load(Ordering::Relaxed),
            crc_errors: self.protocol.crc_errors(),
            latency_ms: self.latency_ms.load(Ordering::Relaxed),
            connection_time_ms: self.connect_time.elapsed().as_millis() as u64,
            streaming: self.streaming.load(Ordering::Acquire),
        }
    }
}

impl BroadcastTarget for ClientSession {
    fn target_id(&self) -> &str {
        &self.id
    }

    fn receive_rx_audio(&self, audio: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.protocol.send_rx_audio(audio).is_ok()
    }
}

impl TxClient for ClientSession {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn tx_priority(&self) -> TxPriority {
        *self.tx_priority.lock().unwrap()
    }

    fn on_tx_granted(&self) {
        let _ = self.protocol.send_control(&ControlMessage::tx_granted());
        self.tx_denied_count.store(0, Ordering::Relaxed);
    }

    fn on_preempted(&self, preempting_client_id: &str) {
        let _ = self
            .protocol
            .send_control(&ControlMessage::tx_preempted(Some(preempting_client_id)));
    }

    fn on_tx_released(&self) {
        let _ = self.protocol.send_control(&ControlMessage::tx_released());
    }
}

/// Runs one session from handshake to teardown.
fn session_main(server: Arc<ServerInner>, session: Arc<ClientSession>) {
    let result = run_session(&server, &session);

    if let Err(e) = &result {
        if !session.is_closed() {
            server.notify_error(Some(&session.id), &format!("connection error: {}", e));
        }
    }

    // Terminal transition, reached exactly once per session.
    session.streaming.store(false, Ordering::Release);
    server.notify(|listener| listener.on_stream_stopped(&session.id));

    session.request_close();
    server.broadcaster.remove_target(&session.id);
    server.mixer.unregister_client(&session.id);
    server.sessions.remove(&session.id);

    if let Some(handle) = session.receive_thread.lock().unwrap().take() {
        if !worker::join_timeout(handle, Duration::from_secs(1)) {
            warn!("receive worker for {} did not stop in time", session.id);
        }
    }

    info!("client disconnected: {}", session.id);
    server.notify(|listener| listener.on_client_disconnected(&session.id));
    server.broadcast_clients_update();
}

fn run_session(server: &Arc<ServerInner>, session: &Arc<ClientSession>) -> Result<()> {
    if !session.perform_handshake()? {
        debug!("handshake failed for {}", session.id);
        return Ok(());
    }

    let session_config = session.session_config.lock().unwrap().clone();
    session
        .protocol
        .send_control(&ControlMessage::audio_config(&session_config))?;
    session.protocol.send_control(&ControlMessage::connect_accept())?;

    server.broadcaster.add_target(session.clone());
    server.mixer.register_client(session.clone());

    {
        let server = Arc::clone(server);
        let session_for_worker = Arc::clone(session);
        let handle = worker::spawn(&format!("receive-{}", session.id), move || {
            receive_worker(server, session_for_worker);
        })?;
        *session.receive_thread.lock().unwrap() = Some(handle);
    }

    session.streaming.store(true, Ordering::Release);
    server.notify(|listener| listener.on_stream_started(&session.id, &session_config));
    server.broadcast_clients_update();

    // Supervision: heartbeats, liveness, statistics.
    while !session.is_closed() && server.running.load(Ordering::Acquire) {
        if session.protocol.should_send_heartbeat() {
            session.protocol.send_heartbeat()?;
        }
        if session.protocol.is_connection_timed_out() {
            server.notify_error(Some(&session.id), "connection timeout");
            break;
        }

        let stats = session.stats(server);
        server.notify(|listener| listener.on_statistics_update(&session.id, &stats));

        std::thread::sleep(SUPERVISION_TICK);
    }

    Ok(())
}

fn receive_worker(server: Arc<ServerInner>, session: Arc<ClientSession>) {
    while !session.is_closed() && server.running.load(Ordering::Acquire) {
        match session.protocol.receive_packet(RECEIVE_POLL) {
            Ok(None) => continue,
            Ok(Some(packet)) => match packet.packet_type {
                PacketType::AudioTx => session.handle_tx_audio(&server, &packet.payload),
                PacketType::Control => session.handle_control(&packet.payload),
                // Receiving it already refreshed the liveness clock.
                PacketType::Heartbeat => {}
                PacketType::AudioRx => {}
            },
            Err(e) => {
                if !session.is_closed() {
                    server.notify_error(Some(&session.id), &format!("receive error: {}", e));
                    session.request_close();
                }
                break;
            }
        }
    }
}
