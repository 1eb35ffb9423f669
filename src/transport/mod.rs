pub mod dbus;
#[cfg(feature = "hci")]
pub mod hci;

use crate::address::BdAddr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Scan timing in Bluetooth units of 0.625 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub active: bool,
    pub interval: u16,
    pub window: u16,
    pub whitelist_only: bool,
    pub filter_duplicates: bool,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            active: true,
            interval: 18,
            window: 18,
            whitelist_only: false,
            filter_duplicates: false,
        }
    }
}

/// One observed advertisement, already split into typed AD fields.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub address: BdAddr,
    pub random_address: bool,
    pub rssi: Option<i16>,
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: Vec<(u16, Vec<u8>)>,
    pub service_data: Vec<(Uuid, Vec<u8>)>,
}

/// A discovered GATT characteristic. `value_handle` keys notifications and
/// writes; the CCC descriptor sits at `value_handle + 1` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub handle: u16,
    pub value_handle: u16,
    pub properties: u8,
}

#[derive(Debug, Clone)]
pub struct Service {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
    pub characteristics: Vec<Characteristic>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connect refused by peer")]
    ConnectRefused,
    #[error("insufficient permission for bluetooth operation")]
    ConnectPermission,
    #[error("connect failed: {0}")]
    ConnectTransport(String),
    #[error("scan setup failed: {0}")]
    ScanSetup(String),
    #[error("operation not supported by this controller")]
    NotSupported,
    #[error("attribute error response {0:#04x}")]
    Attribute(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("bluez: {0}")]
    DBus(String),
}

impl TransportError {
    /// Scan failures that stem from missing capabilities get a one-time
    /// operator hint; everything else is transient.
    pub fn is_permission(&self) -> bool {
        matches!(self, TransportError::ConnectPermission)
            || matches!(self, TransportError::Io(err) if err.kind() == std::io::ErrorKind::PermissionDenied)
    }
}

/// A uniform face over the two BLE back-ends. The scan controller and the
/// history downloader only ever talk to these traits.
pub trait Transport {
    type Session: GattSession;

    /// (Re)start scanning with the given parameters. Implementations stop
    /// any scan already running first, so this doubles as a restart.
    async fn start_scan(&mut self, params: &ScanParams) -> Result<(), TransportError>;

    async fn stop_scan(&mut self) -> Result<(), TransportError>;

    /// Replace the accept-list. Entries carry their address flavor
    /// implicitly (random static vs public, derived from the address bits).
    async fn set_whitelist(&mut self, addresses: &[BdAddr]) -> Result<(), TransportError>;

    async fn clear_whitelist(&mut self) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next advertisement. `Ok(None)` on
    /// timeout; the caller owns all deadline bookkeeping.
    async fn next_advertisement(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Advertisement>, TransportError>;

    /// Open an ATT session to a device. The address flavor is sent with
    /// the request; getting it wrong is the classic cause of refused
    /// connections.
    async fn connect(
        &mut self,
        address: BdAddr,
        timeout: Duration,
    ) -> Result<Self::Session, TransportError>;

    /// Release controller state held on behalf of this process.
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

pub trait GattSession {
    /// All primary services with their characteristics.
    async fn discover(&mut self) -> Result<Vec<Service>, TransportError>;

    /// Enable notifications on a characteristic (CCC write or StartNotify,
    /// depending on the back-end).
    async fn enable_notifications(
        &mut self,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError>;

    /// Write request; blocks until the write response arrives.
    async fn write_request(
        &mut self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next notification, keyed by value
    /// handle. `Ok(None)` on timeout.
    async fn next_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(u16, Vec<u8>)>, TransportError>;

    async fn disconnect(self) -> Result<(), TransportError>;
}
