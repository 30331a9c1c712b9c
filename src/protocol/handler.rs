//! Stream-level protocol handling: framing, heartbeat timing and counters.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::DEFAULT_FRAME_ERROR_LIMIT;
use crate::error::{AudioError, Result};
use crate::protocol::control::ControlMessage;
use crate::protocol::monotonic_ns;
use crate::protocol::packet::{self, Packet};

/// A heartbeat is due after this much send silence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// The connection is considered dead after this much receive silence.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns one TCP connection and enforces packet framing on it.
///
/// Sends are serialized by a mutex so every packet reaches the wire whole;
/// receives validate magic, length and CRC, skipping corrupt frames until a
/// configurable number of consecutive failures escalates to a fatal error.
pub struct ProtocolHandler {
    stream: TcpStream,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    frame_error_limit: u32,

    sequence: AtomicU32,
    closed: AtomicBool,
    last_send_ns: AtomicU64,
    last_receive_ns: AtomicU64,

    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    crc_errors: AtomicU32,
    consecutive_errors: AtomicU32,
}

impl ProtocolHandler {
    pub fn new(stream: TcpStream) -> Result<Self> {
        Self::with_frame_error_limit(stream, DEFAULT_FRAME_ERROR_LIMIT)
    }

    pub fn with_frame_error_limit(stream: TcpStream, frame_error_limit: u32) -> Result<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);
        let now = monotonic_ns();
        Ok(Self {
            stream,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            frame_error_limit,
            sequence: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            last_send_ns: AtomicU64::new(now),
            last_receive_ns: AtomicU64::new(now),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            crc_errors: AtomicU32::new(0),
            consecutive_errors: AtomicU32::new(0),
        })
    }

    /// Sends one packet atomically and flushes.
    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AudioError::NotConnected);
        }

        let data = packet.encode();
        {
            let mut writer = self.writer.lock().unwrap();
            writer.write_all(&data)?;
            writer.flush()?;
        }

        self.last_send_ns.store(monotonic_ns(), Ordering::Release);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn send_rx_audio(&self, audio: &[u8]) -> Result<()> {
        self.send_packet(&Packet::rx_audio(self.next_sequence(), audio.to_vec()))
    }

    pub fn send_tx_audio(&self, audio: &[u8]) -> Result<()> {
        self.send_packet(&Packet::tx_audio(self.next_sequence(), audio.to_vec()))
    }

    pub fn send_control(&self, message: &ControlMessage) -> Result<()> {
        self.send_packet(&Packet::control(self.next_sequence(), message.serialize()))
    }

    pub fn send_heartbeat(&self) -> Result<()> {
        self.send_packet(&Packet::heartbeat(self.next_sequence()))
    }

    /// Receives one packet, waiting up to `timeout` for it to start
    /// arriving. `Duration::ZERO` blocks indefinitely.
    ///
    /// Returns `Ok(None)` on timeout and on discarded corrupt frames; the
    /// caller just retries. After `frame_error_limit` consecutive corrupt
    /// frames the connection is declared dead with
    /// [`AudioError::StreamCorrupted`].
    pub fn receive_packet(&self, timeout: Duration) -> Result<Option<Packet>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self.stream.set_read_timeout(timeout)?;

        let mut reader = self.reader.lock().unwrap();

        let mut header = [0u8; packet::HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let magic = u16::from_be_bytes([header[0], header[1]]);
        if magic != packet::MAGIC {
            // Do not try to realign mid-stream; count it and let the
            // caller retry from the next header boundary.
            debug!("invalid packet magic 0x{:04X}", magic);
            self.frame_error()?;
            return Ok(None);
        }

        let payload_len = u16::from_be_bytes([header[17], header[18]]) as usize;
        if payload_len > packet::MAX_PAYLOAD {
            // Consume the advertised bytes anyway to preserve frame
            // alignment on the stream.
            let mut skip = vec![0u8; payload_len + packet::CRC_SIZE];
            match reader.read_exact(&mut skip) {
                Ok(()) => {}
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            warn!("oversized payload length {}, frame discarded", payload_len);
            self.frame_error()?;
            return Ok(None);
        }

        let mut frame = vec![0u8; packet::Packet::wire_size(payload_len)];
        frame[..packet::HEADER_SIZE].copy_from_slice(&header);
        match reader.read_exact(&mut frame[packet::HEADER_SIZE..]) {
            Ok(()) => {}
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        drop(reader);

        let Some(received) = Packet::decode(&frame) else {
            debug!("packet failed CRC validation, {} bytes discarded", frame.len());
            self.frame_error()?;
            return Ok(None);
        };

        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.last_receive_ns.store(monotonic_ns(), Ordering::Release);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);

        Ok(Some(received))
    }

    fn frame_error(&self) -> Result<()> {
        self.crc_errors.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= self.frame_error_limit {
            warn!("{} consecutive frame errors, giving up on this connection", consecutive);
            return Err(AudioError::StreamCorrupted(consecutive));
        }
        Ok(())
    }

    /// Whether the heartbeat interval has elapsed since the last send.
    pub fn should_send_heartbeat(&self) -> bool {
        let idle = monotonic_ns().saturating_sub(self.last_send_ns.load(Ordering::Acquire));
        idle > HEARTBEAT_INTERVAL.as_nanos() as u64
    }

    /// Whether the peer has been silent past the connection timeout.
    pub fn is_connection_timed_out(&self) -> bool {
        let idle = monotonic_ns().saturating_sub(self.last_receive_ns.load(Ordering::Acquire));
        idle > CONNECTION_TIMEOUT.as_nanos() as u64
    }

    pub fn time_since_last_receive(&self) -> Duration {
        let idle = monotonic_ns().saturating_sub(self.last_receive_ns.load(Ordering::Acquire));
        Duration::from_nanos(idle)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }

    pub fn current_sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn crc_errors(&self) -> u32 {
        self.crc_errors.load(Ordering::Relaxed)
    }
}

impl Drop for ProtocolHandler {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::PacketType;
    use std::net::{TcpListener, TcpStream};

    /// A connected (client, server) socket pair over loopback.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_send_and_receive_audio() {
        let (a, b) = socket_pair();
        let sender = ProtocolHandler::new(a).unwrap();
        let receiver = ProtocolHandler::new(b).unwrap();

        sender.send_rx_audio(&[1, 2, 3, 4]).unwrap();

        let received = receiver
            .receive_packet(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(received.packet_type, PacketType::AudioRx);
        assert_eq!(received.payload, vec![1, 2, 3, 4]);
        assert_eq!(received.sequence, 0);

        assert_eq!(sender.packets_sent(), 1);
        assert_eq!(receiver.packets_received(), 1);
        assert!(receiver.bytes_received() > 0);
    }

    #[test]
    fn test_sequence_increments_per_send() {
        let (a, b) = socket_pair();
        let sender = ProtocolHandler::new(a).unwrap();
        let receiver = ProtocolHandler::new(b).unwrap();

        sender.send_heartbeat().unwrap();
        sender.send_heartbeat().unwrap();
        sender.send_tx_audio(&[0u8; 8]).unwrap();

        let timeout = Duration::from_secs(2);
        let sequences: Vec<u32> = (0..3)
            .map(|_| receiver.receive_packet(timeout).unwrap().unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_control_message_over_wire() {
        let (a, b) = socket_pair();
        let sender = ProtocolHandler::new(a).unwrap();
        let receiver = ProtocolHandler::new(b).unwrap();

        sender
            .send_control(&ControlMessage::latency_probe(12345))
            .unwrap();

        let received = receiver
            .receive_packet(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(received.packet_type, PacketType::Control);
        let msg = ControlMessage::deserialize(&received.payload).unwrap();
        assert_eq!(msg.parse_latency_timestamp(), Some(12345));
    }

    #[test]
    fn test_receive_timeout_returns_none() {
        let (a, _b) = socket_pair();
        let receiver = ProtocolHandler::new(a).unwrap();

        let result = receiver.receive_packet(Duration::from_millis(50)).unwrap();
        assert!(result.is_none());
        assert_eq!(receiver.crc_errors(), 0);
    }

    #[test]
    fn test_corrupted_frame_skipped_and_counted() {
        let (a, mut b) = socket_pair();
        let receiver = ProtocolHandler::new(a).unwrap();

        let mut frame = Packet::rx_audio(1, vec![0x00, 0xFF]).encode();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        b.write_all(&frame).unwrap();
        b.flush().unwrap();

        let result = receiver.receive_packet(Duration::from_secs(2)).unwrap();
        assert!(result.is_none());
        assert_eq!(receiver.crc_errors(), 1);

        // A good frame afterwards resets the consecutive counter.
        b.write_all(&Packet::heartbeat(2).encode()).unwrap();
        b.flush().unwrap();
        let received = receiver
            .receive_packet(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(received.packet_type, PacketType::Heartbeat);
    }

    #[test]
    fn test_consecutive_frame_errors_escalate() {
        let (a, mut b) = socket_pair();
        let receiver = ProtocolHandler::new(a).unwrap();

        // Five header-sized blocks with a bad magic each.
        let garbage = [0u8; packet::HEADER_SIZE];
        for _ in 0..5 {
            b.write_all(&garbage).unwrap();
        }
        b.flush().unwrap();

        let timeout = Duration::from_secs(2);
        for _ in 0..4 {
            assert!(receiver.receive_packet(timeout).unwrap().is_none());
        }
        let result = receiver.receive_packet(timeout);
        assert!(matches!(result, Err(AudioError::StreamCorrupted(5))));
        assert_eq!(receiver.crc_errors(), 5);
    }

    #[test]
    fn test_oversized_payload_consumed_for_alignment() {
        let (a, mut b) = socket_pair();
        let receiver = ProtocolHandler::new(a).unwrap();

        // Hand-build a header claiming a payload beyond MAX_PAYLOAD,
        // followed by that many bytes plus CRC, then a good packet.
        let bogus_len: u16 = (packet::MAX_PAYLOAD + 1) as u16;
        let mut header = Vec::new();
        header.extend_from_slice(&packet::MAGIC.to_be_bytes());
        header.push(packet::VERSION);
        header.push(0x00);
        header.push(0x00);
        header.extend_from_slice(&7u32.to_be_bytes());
        header.extend_from_slice(&0u64.to_be_bytes());
        header.extend_from_slice(&bogus_len.to_be_bytes());
        b.write_all(&header).unwrap();
        b.write_all(&vec![0u8; bogus_len as usize + packet::CRC_SIZE]).unwrap();
        b.write_all(&Packet::heartbeat(8).encode()).unwrap();
        b.flush().unwrap();

        let timeout = Duration::from_secs(2);
        assert!(receiver.receive_packet(timeout).unwrap().is_none());
        assert_eq!(receiver.crc_errors(), 1);

        // Stream stayed aligned: the next frame parses.
        let received = receiver.receive_packet(timeout).unwrap().unwrap();
        assert_eq!(received.packet_type, PacketType::Heartbeat);
        assert_eq!(received.sequence, 8);
    }

    #[test]
    fn test_fresh_handler_timing_queries() {
        let (a, _b) = socket_pair();
        let handler = ProtocolHandler::new(a).unwrap();
        assert!(!handler.should_send_heartbeat());
        assert!(!handler.is_connection_timed_out());
        assert!(handler.time_since_last_receive() < Duration::from_secs(1));
    }

    #[test]
    fn test_send_after_close_fails() {
        let (a, _b) = socket_pair();
        let handler = ProtocolHandler::new(a).unwrap();
        handler.close();
        assert!(handler.is_closed());
        assert!(matches!(
            handler.send_heartbeat(),
            Err(AudioError::NotConnected)
        ));
        assert!(handler.receive_packet(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_custom_frame_error_limit() {
        let (a, mut b) = socket_pair();
        let receiver = ProtocolHandler::with_frame_error_limit(a, 2).unwrap();

        let garbage = [0u8; packet::HEADER_SIZE];
        b.write_all(&garbage).unwrap();
        b.write_all(&garbage).unwrap();
        b.flush().unwrap();

        let timeout = Duration::from_secs(2);
        assert!(receiver.receive_packet(timeout).unwrap().is_none());
        assert!(matches!(
            receiver.receive_packet(timeout),
            Err(AudioError::StreamCorrupted(2))
        ));
    }
}
