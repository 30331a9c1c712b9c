//! Loopback integration tests: a real server and client talking over TCP
//! with mock audio devices.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use netaudio::{
    AudioClient, AudioError, AudioServer, BufferPolicy, CaptureSource, ClientConfig, ClientInfo,
    PlaybackSink, RejectReason, StreamConfig,
};

/// Playback sink that records everything written to it.
struct CollectingSink {
    data: Arc<Mutex<Vec<u8>>>,
    channels: u8,
}

impl CollectingSink {
    fn new(channels: u8) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                data: data.clone(),
                channels,
            },
            data,
        )
    }
}

impl PlaybackSink for CollectingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.lock().unwrap().extend_from_slice(buf);
        // Pace roughly like a sound device so drain loops don't spin.
        std::thread::sleep(Duration::from_millis(1));
        Ok(buf.len())
    }

    fn channels(&self) -> u8 {
        self.channels
    }
}

/// Capture source producing a fixed byte pattern at frame cadence.
struct PatternCapture {
    pattern: u8,
    channels: u8,
    pace: Duration,
}

impl CaptureSource for PatternCapture {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        std::thread::sleep(self.pace);
        buf.fill(self.pattern);
        Ok(buf.len())
    }

    fn channels(&self) -> u8 {
        self.channels
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn start_inject_server(config: StreamConfig) -> (AudioServer, u16) {
    let server = AudioServer::with_config(0, config);
    server.set_inject_only(true);
    server.start().expect("server should start");
    let port = server.local_addr().expect("bound address").port();
    (server, port)
}

fn basic_client(port: u16) -> AudioClient {
    let mut config = ClientConfig::new("127.0.0.1", port);
    config.auto_reconnect = false;
    let client = AudioClient::new(config);
    let (sink, _) = CollectingSink::new(1);
    client.set_playback_sink(Box::new(sink));
    client
}

#[test]
fn test_handshake_negotiates_policy_and_streams_rx() -> Result<()> {
    let (server, port) = start_inject_server(StreamConfig::default());

    let mut config = ClientConfig::new("127.0.0.1", port);
    config.client_name = "c1".to_string();
    config.auto_reconnect = false;
    config.requested_policy = Some(BufferPolicy::new(80, 30, 240));
    config.client_info = Some(ClientInfo::new("KJ5HST", "Terry", "EM10"));

    let client = AudioClient::new(config);
    let (sink, _) = CollectingSink::new(1);
    client.set_playback_sink(Box::new(sink));

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        client.add_audio_listener(Arc::new(move |audio: &[u8]| {
            received.lock().unwrap().extend_from_slice(audio);
        }));
    }

    client.connect()?;
    assert!(client.is_connected());
    assert!(client.is_streaming());

    // The server's format is authoritative; the client's buffer policy
    // request was honored.
    let negotiated = client.stream_config();
    assert_eq!(negotiated.format.sample_rate, 48_000);
    assert_eq!(negotiated.policy, BufferPolicy::new(80, 30, 240));

    assert!(wait_until(Duration::from_secs(5), || server.client_count() == 1));

    // Inject a recognizable pattern and watch it arrive.
    let frame = vec![0x42u8; 1920];
    for _ in 0..10 {
        server.inject_audio(&frame);
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(wait_until(Duration::from_secs(5), || {
        !received.lock().unwrap().is_empty()
    }));
    assert!(received.lock().unwrap().iter().all(|&b| b == 0x42));

    // The roster broadcast reached the client.
    assert!(wait_until(Duration::from_secs(5), || {
        client.server_client_count() == Some(1)
    }));
    let roster = client.server_clients_info().unwrap();
    assert_eq!(roster.max_clients, 4);
    assert_eq!(roster.clients.len(), 1);
    assert_eq!(
        roster.clients[0].info.as_ref().map(|info| info.callsign.as_str()),
        Some("KJ5HST")
    );

    client.disconnect();
    assert!(wait_until(Duration::from_secs(5), || server.client_count() == 0));
    server.stop();
    Ok(())
}

#[test]
fn test_tx_audio_reaches_server_playback_sink() -> Result<()> {
    let server = AudioServer::with_config(0, StreamConfig::default());
    server.set_inject_only(true);
    let (sink, sink_data) = CollectingSink::new(1);
    server.set_playback_sink(Box::new(sink));
    server.start()?;
    let port = server.local_addr().unwrap().port();

    let mut config = ClientConfig::new("127.0.0.1", port);
    config.auto_reconnect = false;
    let client = AudioClient::new(config);
    let (playback, _) = CollectingSink::new(1);
    client.set_playback_sink(Box::new(playback));
    client.set_capture_source(Box::new(PatternCapture {
        pattern: 0x55,
        channels: 1,
        pace: Duration::from_millis(20),
    }));

    client.connect()?;
    client.set_ptt(true);
    assert!(!client.is_capture_muted());

    // Captured frames travel: capture -> TX ring -> wire -> mixer -> sink.
    assert!(wait_until(Duration::from_secs(10), || {
        sink_data.lock().unwrap().iter().any(|&b| b == 0x55)
    }));

    assert!(wait_until(Duration::from_secs(5), || {
        server.tx_owner().is_some()
    }));

    // Releasing PTT stops the TX stream; the idle timeout frees the channel.
    client.set_ptt(false);
    assert!(wait_until(Duration::from_secs(10), || {
        server.tx_owner().is_none()
    }));

    client.disconnect();
    server.stop();
    Ok(())
}

#[test]
fn test_server_rejects_when_full() -> Result<()> {
    let config = StreamConfig {
        max_clients: 1,
        ..StreamConfig::default()
    };
    let (server, port) = start_inject_server(config);

    let first = basic_client(port);
    first.connect()?;
    assert!(wait_until(Duration::from_secs(5), || server.client_count() == 1));

    let second = basic_client(port);
    match second.connect() {
        Err(AudioError::Rejected { reason, message }) => {
            assert_eq!(reason, RejectReason::Busy);
            assert!(message.contains("maximum clients"));
        }
        other => panic!("expected busy rejection, got {:?}", other.err()),
    }

    first.disconnect();
    server.stop();
    Ok(())
}

#[test]
fn test_latency_probe_measures_half_rtt() -> Result<()> {
    let (server, port) = start_inject_server(StreamConfig::default());

    let client = basic_client(port);
    client.connect()?;

    client.measure_latency();
    // Loopback latency is near zero; success is the response arriving and
    // the measurement being recorded (possibly as 0 ms).
    assert!(wait_until(Duration::from_secs(5), || {
        client.stats().packets_received > 0
    }));

    client.disconnect();
    server.stop();
    Ok(())
}

#[test]
fn test_heartbeats_keep_idle_connection_alive() -> Result<()> {
    let (server, port) = start_inject_server(StreamConfig::default());

    let client = basic_client(port);
    client.connect()?;

    // Nothing is streaming in either direction; both sides stay up purely
    // on heartbeats well past the heartbeat interval.
    std::thread::sleep(Duration::from_secs(7));
    assert!(client.is_connected());
    assert_eq!(server.client_count(), 1);

    client.disconnect();
    server.stop();
    Ok(())
}

#[test]
fn test_graceful_disconnect_updates_roster() -> Result<()> {
    let (server, port) = start_inject_server(StreamConfig::default());

    let a = basic_client(port);
    let b = basic_client(port);
    a.connect()?;
    b.connect()?;
    assert!(wait_until(Duration::from_secs(5), || server.client_count() == 2));
    assert!(wait_until(Duration::from_secs(5), || {
        b.server_client_count() == Some(2)
    }));

    a.disconnect();

    assert!(wait_until(Duration::from_secs(5), || server.client_count() == 1));
    assert!(wait_until(Duration::from_secs(5), || {
        b.server_client_count() == Some(1)
    }));

    b.disconnect();
    server.stop();
    Ok(())
}

#[test]
fn test_client_reconnects_after_server_restart() -> Result<()> {
    let (server, port) = start_inject_server(StreamConfig::default());

    let mut config = ClientConfig::new("127.0.0.1", port);
    config.auto_reconnect = true;
    config.reconnect_delay = Duration::from_millis(200);
    config.max_reconnect_delay = Duration::from_secs(1);
    let client = AudioClient::new(config);
    let (sink, _) = CollectingSink::new(1);
    client.set_playback_sink(Box::new(sink));

    client.connect()?;
    assert!(client.is_connected());

    server.stop();
    drop(server);

    // The client notices the dead connection and enters reconnection.
    assert!(wait_until(Duration::from_secs(10), || {
        !client.is_connected() || client.is_reconnecting()
    }));

    // Bring a server back on the same port; the backoff loop finds it.
    let server = AudioServer::with_config(port, StreamConfig::default());
    server.set_inject_only(true);
    server.start()?;

    assert!(wait_until(Duration::from_secs(20), || {
        client.is_connected() && server.client_count() == 1
    }));
    assert!(!client.is_reconnecting());

    client.disconnect();
    server.stop();
    Ok(())
}

#[test]
fn test_server_stop_notifies_listeners() -> Result<()> {
    struct CountingListener {
        started: AtomicU32,
        stopped: AtomicU32,
        connected: AtomicU32,
        disconnected: AtomicU32,
    }

    impl netaudio::StreamListener for CountingListener {
        fn on_server_started(&self, _port: u16) {
            self.started.fetch_add(1, Ordering::Relaxed);
        }
        fn on_server_stopped(&self) {
            self.stopped.fetch_add(1, Ordering::Relaxed);
        }
        fn on_client_connected(&self, _id: &str, _addr: &str) {
            self.connected.fetch_add(1, Ordering::Relaxed);
        }
        fn on_client_disconnected(&self, _id: &str) {
            self.disconnected.fetch_add(1, Ordering::Relaxed);
        }
    }

    let listener = Arc::new(CountingListener {
        started: AtomicU32::new(0),
        stopped: AtomicU32::new(0),
        connected: AtomicU32::new(0),
        disconnected: AtomicU32::new(0),
    });

    let server = AudioServer::with_config(0, StreamConfig::default());
    server.set_inject_only(true);
    server.add_stream_listener(listener.clone());
    server.start()?;
    let port = server.local_addr().unwrap().port();

    let client = basic_client(port);
    client.connect()?;
    assert!(wait_until(Duration::from_secs(5), || {
        listener.connected.load(Ordering::Relaxed) == 1
    }));

    client.disconnect();
    assert!(wait_until(Duration::from_secs(5), || {
        listener.disconnected.load(Ordering::Relaxed) == 1
    }));

    server.stop();
    assert_eq!(listener.started.load(Ordering::Relaxed), 1);
    assert_eq!(listener.stopped.load(Ordering::Relaxed), 1);
    Ok(())
}
