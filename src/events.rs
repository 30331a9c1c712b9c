//! Listener capability trait for stream lifecycle events.

use crate::config::StreamConfig;
use crate::protocol::control::ClientsUpdate;
use crate::stats::StreamStats;

/// Observer for server and client lifecycle events.
///
/// Every method has an empty default body so implementers subscribe only to
/// what they care about. Callbacks are invoked from worker threads and must
/// not block; panics inside a listener are not caught.
pub trait StreamListener: Send + Sync {
    fn on_server_started(&self, _port: u16) {}
    fn on_server_stopped(&self) {}

    fn on_client_connected(&self, _client_id: &str, _address: &str) {}
    fn on_client_disconnected(&self, _client_id: &str) {}

    fn on_stream_started(&self, _client_id: &str, _config: &StreamConfig) {}
    fn on_stream_stopped(&self, _client_id: &str) {}

    fn on_statistics_update(&self, _client_id: &str, _stats: &StreamStats) {}
    fn on_error(&self, _client_id: Option<&str>, _message: &str) {}

    /// Client side only: a reconnect attempt is about to be made.
    fn on_reconnecting(&self, _attempt: u32, _max_attempts: u32) {}
    /// Client side only: a reconnect attempt succeeded.
    fn on_reconnected(&self) {}

    /// The server's client roster or TX ownership changed.
    fn on_clients_update(&self, _update: &ClientsUpdate) {}

    fn on_tx_granted(&self) {}
    fn on_tx_denied(&self, _holding_client_id: Option<&str>) {}
    fn on_tx_preempted(&self, _preempting_client_id: Option<&str>) {}
    fn on_tx_released(&self) {}
}
