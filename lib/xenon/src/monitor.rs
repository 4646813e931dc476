use photon::status::Status;

/// Payload of a connect event: the canonical endpoint and when the
/// connection became operational.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub host_id: String,
    pub at: u64,
}

/// Payload of a disconnect event.
#[derive(Debug, Clone)]
pub struct DisconnectInfo {
    pub host_id: String,
    pub connected_at: u64,
    pub at: u64,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Connect(ConnectInfo),
    Disconnect(DisconnectInfo),
}

/// Optional monitoring plug-in. The core emits connection lifecycle
/// events; file-level traffic events belong to the layers above.
pub trait Monitor: Send + Sync {
    fn event(&self, event: &MonitorEvent);
}
