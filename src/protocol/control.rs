//! Typed control messages carried as CONTROL packet payloads.
//!
//! Every message is `[tag:u8][body]`, fields big-endian, strings UTF-8 with
//! a u8 length prefix (truncated to 255 bytes on encode). Bodies grow only
//! through length-prefixed or flag-gated fields, so older peers can send
//! shorter payloads: parsers accept truncation at any field boundary and
//! default the missing fields.

use crate::config::{BufferPolicy, StreamConfig, StreamFormat};

/// Control message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    ConnectRequest,
    ConnectAccept,
    ConnectReject,
    AudioConfig,
    StreamStart,
    StreamStop,
    StreamPause,
    StreamResume,
    Heartbeat,
    HeartbeatAck,
    LatencyProbe,
    LatencyResponse,
    StatsUpdate,
    TxGranted,
    TxDenied,
    TxPreempted,
    TxReleased,
    ClientsUpdate,
    Error,
    Disconnect,
}

impl ControlType {
    pub fn value(self) -> u8 {
        match self {
            ControlType::ConnectRequest => 0x01,
            ControlType::ConnectAccept => 0x02,
            ControlType::ConnectReject => 0x03,
            ControlType::AudioConfig => 0x04,
            ControlType::StreamStart => 0x10,
            ControlType::StreamStop => 0x11,
            ControlType::StreamPause => 0x12,
            ControlType::StreamResume => 0x13,
            ControlType::Heartbeat => 0x20,
            ControlType::HeartbeatAck => 0x21,
            ControlType::LatencyProbe => 0x22,
            ControlType::LatencyResponse => 0x23,
            ControlType::StatsUpdate => 0x30,
            ControlType::TxGranted => 0x40,
            ControlType::TxDenied => 0x41,
            ControlType::TxPreempted => 0x42,
            ControlType::TxReleased => 0x43,
            ControlType::ClientsUpdate => 0x44,
            ControlType::Error => 0xFE,
            ControlType::Disconnect => 0xFF,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ControlType::ConnectRequest),
            0x02 => Some(ControlType::ConnectAccept),
            0x03 => Some(ControlType::ConnectReject),
            0x04 => Some(ControlType::AudioConfig),
            0x10 => Some(ControlType::StreamStart),
            0x11 => Some(ControlType::StreamStop),
            0x12 => Some(ControlType::StreamPause),
            0x13 => Some(ControlType::StreamResume),
            0x20 => Some(ControlType::Heartbeat),
            0x21 => Some(ControlType::HeartbeatAck),
            0x22 => Some(ControlType::LatencyProbe),
            0x23 => Some(ControlType::LatencyResponse),
            0x30 => Some(ControlType::StatsUpdate),
            0x40 => Some(ControlType::TxGranted),
            0x41 => Some(ControlType::TxDenied),
            0x42 => Some(ControlType::TxPreempted),
            0x43 => Some(ControlType::TxReleased),
            0x44 => Some(ControlType::ClientsUpdate),
            0xFE => Some(ControlType::Error),
            0xFF => Some(ControlType::Disconnect),
            _ => None,
        }
    }
}

/// Why the server turned a connection away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Server is at its client limit.
    Busy,
    VersionMismatch,
    FormatNotSupported,
    AuthFailed,
    /// Generic rejection.
    Rejected,
}

impl RejectReason {
    pub fn value(self) -> u8 {
        match self {
            RejectReason::Busy => 0x01,
            RejectReason::VersionMismatch => 0x02,
            RejectReason::FormatNotSupported => 0x03,
            RejectReason::AuthFailed => 0x04,
            RejectReason::Rejected => 0xFF,
        }
    }

    /// Unknown values fall back to the generic reason.
    pub fn from_value(value: u8) -> Self {
        match value {
            0x01 => RejectReason::Busy,
            0x02 => RejectReason::VersionMismatch,
            0x03 => RejectReason::FormatNotSupported,
            0x04 => RejectReason::AuthFailed,
            _ => RejectReason::Rejected,
        }
    }
}

/// Client identification shared with the rest of the roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub callsign: String,
    pub name: String,
    pub location: String,
}

impl ClientInfo {
    pub fn new(
        callsign: impl Into<String>,
        name: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            callsign: callsign.into(),
            name: name.into(),
            location: location.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.callsign.is_empty() && self.name.is_empty() && self.location.is_empty()
    }

    /// Most specific identification available: `CALL (Name, Location)`,
    /// degrading gracefully as fields go missing.
    pub fn display_string(&self) -> String {
        match (
            self.callsign.is_empty(),
            self.name.is_empty(),
            self.location.is_empty(),
        ) {
            (false, false, false) => format!("{} ({}, {})", self.callsign, self.name, self.location),
            (false, false, true) => format!("{} ({})", self.callsign, self.name),
            (false, true, false) => format!("{} ({})", self.callsign, self.location),
            (false, true, true) => self.callsign.clone(),
            (true, false, false) => format!("{} ({})", self.name, self.location),
            (true, false, true) => self.name.clone(),
            (true, true, false) => self.location.clone(),
            (true, true, true) => String::new(),
        }
    }
}

/// One roster entry in a CLIENTS_UPDATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub id: String,
    pub info: Option<ClientInfo>,
}

/// Parsed CLIENTS_UPDATE roster broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientsUpdate {
    pub client_count: u8,
    pub max_clients: u8,
    pub tx_owner: Option<String>,
    pub clients: Vec<ClientEntry>,
}

impl ClientsUpdate {
    /// Display string for a client id, preferring its ClientInfo.
    pub fn display_string(&self, client_id: &str) -> String {
        self.clients
            .iter()
            .find(|entry| entry.id == client_id)
            .and_then(|entry| entry.info.as_ref())
            .filter(|info| !info.is_empty())
            .map(|info| info.display_string())
            .unwrap_or_else(|| client_id.to_string())
    }
}

/// Parsed CONNECT_REQUEST fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: u8,
    pub client_name: String,
    pub requested_policy: Option<BufferPolicy>,
    pub client_info: Option<ClientInfo>,
}

/// Tolerant big-endian cursor; every accessor returns `None` past the end.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let value = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.bytes(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.bytes(8)?;
        Some(u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    /// u8-length-prefixed UTF-8 string.
    fn string(&mut self) -> Option<String> {
        let len = self.u8()? as usize;
        let bytes = self.bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Appends a u8 length prefix and the string bytes, truncated to 255.
fn put_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(255);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

fn encode_client_info(info: &ClientInfo) -> Vec<u8> {
    if info.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    put_string(&mut out, &info.callsign);
    put_string(&mut out, &info.name);
    put_string(&mut out, &info.location);
    out
}

/// Tolerates truncation after any completed field.
fn decode_client_info(reader: &mut Reader<'_>) -> ClientInfo {
    let callsign = reader.string().unwrap_or_default();
    let name = reader.string().unwrap_or_default();
    let location = reader.string().unwrap_or_default();
    ClientInfo {
        callsign,
        name,
        location,
    }
}

/// A control message: tag plus raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    msg_type: ControlType,
    data: Vec<u8>,
}

impl ControlMessage {
    pub fn new(msg_type: ControlType, data: Vec<u8>) -> Self {
        Self { msg_type, data }
    }

    pub fn msg_type(&self) -> ControlType {
        self.msg_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.msg_type.value());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn deserialize(payload: &[u8]) -> Option<Self> {
        let (&tag, data) = payload.split_first()?;
        Some(Self {
            msg_type: ControlType::from_value(tag)?,
            data: data.to_vec(),
        })
    }

    // Factories

    pub fn connect_request(
        client_name: &str,
        protocol_version: u8,
        requested_policy: Option<&BufferPolicy>,
        client_info: Option<&ClientInfo>,
    ) -> Self {
        let mut data = Vec::new();
        data.push(protocol_version);
        put_string(&mut data, client_name);

        match requested_policy {
            Some(policy) => {
                data.push(1);
                data.extend_from_slice(&policy.target_ms.to_be_bytes());
                data.extend_from_slice(&policy.min_ms.to_be_bytes());
                data.extend_from_slice(&policy.max_ms.to_be_bytes());
            }
            None => data.push(0),
        }

        let info_bytes = client_info.map(encode_client_info).unwrap_or_default();
        data.push(info_bytes.len().min(255) as u8);
        data.extend_from_slice(&info_bytes[..info_bytes.len().min(255)]);

        Self::new(ControlType::ConnectRequest, data)
    }

    pub fn connect_accept() -> Self {
        Self::new(ControlType::ConnectAccept, Vec::new())
    }

    pub fn connect_reject(reason: RejectReason, message: &str) -> Self {
        let mut data = Vec::new();
        data.push(reason.value());
        put_string(&mut data, message);
        Self::new(ControlType::ConnectReject, data)
    }

    pub fn audio_config(config: &StreamConfig) -> Self {
        let mut data = Vec::with_capacity(14);
        data.extend_from_slice(&config.format.sample_rate.to_be_bytes());
        data.push(config.format.bits_per_sample);
        data.push(config.format.channels);
        data.extend_from_slice(&config.format.frame_duration_ms.to_be_bytes());
        data.extend_from_slice(&config.policy.target_ms.to_be_bytes());
        data.extend_from_slice(&config.policy.min_ms.to_be_bytes());
        data.extend_from_slice(&config.policy.max_ms.to_be_bytes());
        Self::new(ControlType::AudioConfig, data)
    }

    pub fn stream_start() -> Self {
        Self::new(ControlType::StreamStart, Vec::new())
    }

    pub fn stream_stop() -> Self {
        Self::new(ControlType::StreamStop, Vec::new())
    }

    pub fn stream_pause() -> Self {
        Self::new(ControlType::StreamPause, Vec::new())
    }

    pub fn stream_resume() -> Self {
        Self::new(ControlType::StreamResume, Vec::new())
    }

    pub fn heartbeat() -> Self {
        Self::new(ControlType::Heartbeat, Vec::new())
    }

    pub fn heartbeat_ack() -> Self {
        Self::new(ControlType::HeartbeatAck, Vec::new())
    }

    pub fn latency_probe(probe_timestamp_ns: u64) -> Self {
        Self::new(ControlType::LatencyProbe, probe_timestamp_ns.to_be_bytes().to_vec())
    }

    pub fn latency_response(original_timestamp_ns: u64) -> Self {
        Self::new(
            ControlType::LatencyResponse,
            original_timestamp_ns.to_be_bytes().to_vec(),
        )
    }

    pub fn tx_granted() -> Self {
        Self::new(ControlType::TxGranted, Vec::new())
    }

    pub fn tx_denied(holding_client_id: Option<&str>) -> Self {
        let data = holding_client_id.map(|id| id.as_bytes().to_vec()).unwrap_or_default();
        Self::new(ControlType::TxDenied, data)
    }

    pub fn tx_preempted(preempting_client_id: Option<&str>) -> Self {
        let data = preempting_client_id
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default();
        Self::new(ControlType::TxPreempted, data)
    }

    pub fn tx_released() -> Self {
        Self::new(ControlType::TxReleased, Vec::new())
    }

    pub fn clients_update(
        client_count: usize,
        max_clients: usize,
        tx_owner: Option<&str>,
        clients: &[(String, Option<ClientInfo>)],
    ) -> Self {
        let mut data = Vec::new();
        data.push(client_count.min(255) as u8);
        data.push(max_clients.min(255) as u8);
        put_string(&mut data, tx_owner.unwrap_or(""));

        data.push(clients.len().min(255) as u8);
        for (id, info) in clients.iter().take(255) {
            put_string(&mut data, id);
            let info_bytes = info.as_ref().map(encode_client_info).unwrap_or_default();
            data.push(info_bytes.len().min(255) as u8);
            data.extend_from_slice(&info_bytes[..info_bytes.len().min(255)]);
        }

        Self::new(ControlType::ClientsUpdate, data)
    }

    pub fn error(message: &str) -> Self {
        Self::new(ControlType::Error, message.as_bytes().to_vec())
    }

    pub fn disconnect() -> Self {
        Self::new(ControlType::Disconnect, Vec::new())
    }

    // Parsers

    /// Parses a CONNECT_REQUEST body, tolerating truncation at any field
    /// boundary: missing trailing fields come back as defaults.
    pub fn parse_connect_request(&self) -> Option<ConnectRequest> {
        if self.msg_type != ControlType::ConnectRequest {
            return None;
        }
        let mut reader = Reader::new(&self.data);

        let protocol_version = reader.u8()?;
        let client_name = reader.string().unwrap_or_default();

        let mut request = ConnectRequest {
            protocol_version,
            client_name,
            requested_policy: None,
            client_info: None,
        };

        match reader.u8() {
            Some(1) => {
                let target_ms = match reader.u16() {
                    Some(v) => v,
                    None => return Some(request),
                };
                let min_ms = match reader.u16() {
                    Some(v) => v,
                    None => return Some(request),
                };
                let max_ms = match reader.u16() {
                    Some(v) => v,
                    None => return Some(request),
                };
                request.requested_policy = Some(BufferPolicy::new(target_ms, min_ms, max_ms));
            }
            Some(_) => {}
            None => return Some(request),
        }

        if let Some(info_len) = reader.u8() {
            if info_len > 0 {
                if let Some(info_bytes) = reader.bytes(info_len as usize) {
                    let info = decode_client_info(&mut Reader::new(info_bytes));
                    if !info.is_empty() {
                        request.client_info = Some(info);
                    }
                }
            }
        }

        Some(request)
    }

    /// Parses AUDIO_CONFIG; accepts both the 8-byte format-only body and
    /// the 14-byte body carrying the buffer policy.
    pub fn parse_audio_config(&self) -> Option<(StreamFormat, Option<BufferPolicy>)> {
        if self.msg_type != ControlType::AudioConfig {
            return None;
        }
        let mut reader = Reader::new(&self.data);

        let format = StreamFormat {
            sample_rate: reader.u32()?,
            bits_per_sample: reader.u8()?,
            channels: reader.u8()?,
            frame_duration_ms: reader.u16()?,
        };

        let policy = (|| {
            Some(BufferPolicy::new(reader.u16()?, reader.u16()?, reader.u16()?))
        })();

        Some((format, policy))
    }

    /// Timestamp from a LATENCY_PROBE or LATENCY_RESPONSE.
    pub fn parse_latency_timestamp(&self) -> Option<u64> {
        if !matches!(
            self.msg_type,
            ControlType::LatencyProbe | ControlType::LatencyResponse
        ) {
            return None;
        }
        Reader::new(&self.data).u64()
    }

    /// Client id carried by TX_DENIED or TX_PREEMPTED, if any.
    pub fn parse_tx_client_id(&self) -> Option<String> {
        if !matches!(self.msg_type, ControlType::TxDenied | ControlType::TxPreempted) {
            return None;
        }
        if self.data.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.data).into_owned())
    }

    /// Reason and text of a CONNECT_REJECT.
    pub fn parse_reject(&self) -> Option<(RejectReason, String)> {
        if self.msg_type != ControlType::ConnectReject {
            return None;
        }
        let mut reader = Reader::new(&self.data);
        let reason = RejectReason::from_value(reader.u8()?);
        let message = reader.string().unwrap_or_default();
        Some((reason, message))
    }

    /// Human-readable text of a CONNECT_REJECT or ERROR message.
    pub fn parse_error_message(&self) -> Option<String> {
        match self.msg_type {
            ControlType::ConnectReject => self.parse_reject().map(|(reason, message)| {
                if message.is_empty() {
                    format!("{:?}", reason)
                } else {
                    message
                }
            }),
            ControlType::Error if !self.data.is_empty() => {
                Some(String::from_utf8_lossy(&self.data).into_owned())
            }
            _ => None,
        }
    }

    /// Parses a CLIENTS_UPDATE roster.
    pub fn parse_clients_update(&self) -> Option<ClientsUpdate> {
        if self.msg_type != ControlType::ClientsUpdate {
            return None;
        }
        let mut reader = Reader::new(&self.data);

        let client_count = reader.u8()?;
        let max_clients = reader.u8()?;
        let tx_owner = reader.string().filter(|owner| !owner.is_empty());

        let mut clients = Vec::new();
        if let Some(count) = reader.u8() {
            for _ in 0..count {
                let id = match reader.string() {
                    Some(id) => id,
                    None => break,
                };
                let info = reader.u8().and_then(|info_len| {
                    if info_len == 0 {
                        return None;
                    }
                    let info_bytes = reader.bytes(info_len as usize)?;
                    let info = decode_client_info(&mut Reader::new(info_bytes));
                    (!info.is_empty()).then_some(info)
                });
                clients.push(ClientEntry { id, info });
            }
        }

        Some(ClientsUpdate {
            client_count,
            max_clients,
            tx_owner,
            clients,
        })
    }
}
