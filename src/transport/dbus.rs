//! BlueZ D-Bus back-end over `bluer`.
//!
//! Discovery arrives as `InterfacesAdded`/`PropertiesChanged` signals which
//! bluer surfaces as adapter and per-device event streams; each relevant
//! change is turned into a fresh advertisement snapshot. BlueZ offers no
//! controller accept-list through D-Bus, so the whitelist filters in
//! software here; scan interval and window likewise stay with the daemon's
//! restart cadence rather than reaching the controller.

use super::{
    Advertisement, Characteristic, GattSession, ScanParams, Service, Transport, TransportError,
};
use crate::address::BdAddr;
use bluer::{Adapter, AdapterEvent, AddressType, DeviceEvent, DeviceProperty};
use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

const SERVICES_RESOLVED_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(250);
/// A fresh bus connection every day keeps long-running daemons clear of
/// accumulated bluezd proxy state.
const SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

async fn open_adapter(
    adapter_name: Option<&str>,
) -> Result<(bluer::Session, Adapter), TransportError> {
    let session = bluer::Session::new().await?;
    let adapter = match adapter_name {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    adapter.set_powered(true).await?;
    tracing::info!(
        adapter = adapter.name(),
        address = %adapter.address().await?,
        "opened bluez adapter"
    );
    Ok((session, adapter))
}

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        use bluer::ErrorKind;
        match err.kind {
            ErrorKind::ConnectionAttemptFailed => TransportError::ConnectRefused,
            ErrorKind::AuthenticationTimeout => TransportError::ConnectTimeout,
            ErrorKind::NotAuthorized | ErrorKind::NotPermitted => TransportError::ConnectPermission,
            ErrorKind::NotSupported => TransportError::NotSupported,
            _ => TransportError::DBus(err.to_string()),
        }
    }
}

fn to_bluer(address: BdAddr) -> bluer::Address {
    bluer::Address(address.0)
}

fn from_bluer(address: bluer::Address) -> BdAddr {
    BdAddr(address.0)
}

pub struct DbusTransport {
    _session: bluer::Session,
    adapter: Adapter,
    adapter_name: Option<String>,
    opened_at: tokio::time::Instant,
    last_params: Option<ScanParams>,
    discovery: Option<BoxStream<'static, AdapterEvent>>,
    device_events: SelectAll<BoxStream<'static, (bluer::Address, DeviceEvent)>>,
    watched: BTreeSet<BdAddr>,
    whitelist: Option<BTreeSet<BdAddr>>,
    /// Devices this process caused BlueZ to cache; removed again on
    /// shutdown so the cache does not grow across restarts.
    cached: BTreeSet<BdAddr>,
    backlog: VecDeque<Advertisement>,
}

impl DbusTransport {
    pub async fn open(adapter_name: Option<&str>) -> Result<Self, TransportError> {
        let (session, adapter) = open_adapter(adapter_name).await?;
        Ok(Self {
            _session: session,
            adapter,
            adapter_name: adapter_name.map(str::to_string),
            opened_at: tokio::time::Instant::now(),
            last_params: None,
            discovery: None,
            device_events: SelectAll::new(),
            watched: BTreeSet::new(),
            whitelist: None,
            cached: BTreeSet::new(),
            backlog: VecDeque::new(),
        })
    }

    /// Tear down and reopen the bus connection, then resume scanning with
    /// the parameters that were in effect.
    async fn recycle(&mut self) -> Result<(), TransportError> {
        tracing::info!("recycling bluez session");
        self.discovery = None;
        self.device_events = SelectAll::new();
        self.watched.clear();

        let (session, adapter) = open_adapter(self.adapter_name.as_deref()).await?;
        self._session = session;
        self.adapter = adapter;
        self.opened_at = tokio::time::Instant::now();
        if let Some(params) = self.last_params {
            self.start_scan(&params).await?;
        }
        Ok(())
    }

    fn accepts(&self, address: &BdAddr) -> bool {
        match &self.whitelist {
            Some(whitelist) => whitelist.contains(address),
            None => true,
        }
    }

    /// Watch a device's property changes so later advertisements surface
    /// without a new `DeviceAdded` signal.
    async fn watch_device(&mut self, address: bluer::Address) {
        if !self.watched.insert(from_bluer(address)) {
            return;
        }
        let Ok(device) = self.adapter.device(address) else {
            return;
        };
        if let Ok(events) = device.events().await {
            self.device_events
                .push(events.map(move |event| (address, event)).boxed());
        }
    }

    /// Read the device's current properties into one advertisement.
    async fn snapshot(&mut self, address: bluer::Address) -> Option<Advertisement> {
        let device = self.adapter.device(address).ok()?;
        self.cached.insert(from_bluer(address));

        let mut adv = Advertisement {
            address: from_bluer(address),
            ..Advertisement::default()
        };
        adv.random_address = matches!(
            device.address_type().await.ok(),
            Some(AddressType::LeRandom)
        );
        adv.rssi = device.rssi().await.ok().flatten();
        adv.name = device.name().await.ok().flatten();
        if let Ok(Some(uuids)) = device.uuids().await {
            adv.service_uuids = uuids.into_iter().collect();
        }
        if let Ok(Some(data)) = device.manufacturer_data().await {
            adv.manufacturer_data = data.into_iter().collect();
        }
        if let Ok(Some(data)) = device.service_data().await {
            adv.service_data = data.into_iter().collect();
        }
        Some(adv)
    }
}

impl Transport for DbusTransport {
    type Session = DbusSession;

    async fn start_scan(&mut self, params: &ScanParams) -> Result<(), TransportError> {
        // Dropping the previous stream asks bluezd to stop discovery, so a
        // restart with new parameters is stop-then-start here too.
        self.discovery = None;

        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: !params.filter_duplicates,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;
        let stream = self
            .adapter
            .discover_devices()
            .await
            .map_err(|err| TransportError::ScanSetup(err.to_string()))?;
        self.discovery = Some(stream.boxed());
        self.last_params = Some(*params);
        tracing::info!(
            adapter = self.adapter.name(),
            interval_ms = params.interval as f64 * 0.625,
            window_ms = params.window as f64 * 0.625,
            whitelist = self.whitelist.is_some(),
            "discovery started"
        );
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.discovery = None;
        Ok(())
    }

    async fn set_whitelist(&mut self, addresses: &[BdAddr]) -> Result<(), TransportError> {
        if addresses.is_empty() {
            self.whitelist = None;
        } else {
            self.whitelist = Some(addresses.iter().copied().collect());
        }
        Ok(())
    }

    async fn clear_whitelist(&mut self) -> Result<(), TransportError> {
        self.whitelist = None;
        Ok(())
    }

    async fn next_advertisement(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Advertisement>, TransportError> {
        if let Some(adv) = self.backlog.pop_front() {
            return Ok(Some(adv));
        }
        if self.opened_at.elapsed() > SESSION_LIFETIME {
            if let Err(err) = self.recycle().await {
                tracing::warn!(error=%err, "bluez session recycle failed");
            }
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let has_discovery = self.discovery.is_some();
            let has_watchers = !self.device_events.is_empty();
            let address = {
                let discovery = self.discovery.as_mut();
                let device_events = &mut self.device_events;
                tokio::select! {
                    event = async {
                        match discovery {
                            Some(stream) => stream.next().await,
                            None => std::future::pending().await,
                        }
                    }, if has_discovery => {
                        match event {
                            Some(AdapterEvent::DeviceAdded(address)) => Some(address),
                            Some(_) => None,
                            None => return Ok(None),
                        }
                    }
                    event = device_events.next(), if has_watchers => {
                        match event {
                            Some((address, DeviceEvent::PropertyChanged(property)))
                                if advertisement_property(&property) => Some(address),
                            _ => None,
                        }
                    }
                    _ = tokio::time::sleep(remaining) => return Ok(None),
                }
            };

            let Some(address) = address else { continue };
            self.watch_device(address).await;
            if !self.accepts(&from_bluer(address)) {
                continue;
            }
            if let Some(adv) = self.snapshot(address).await {
                return Ok(Some(adv));
            }
        }
    }

    async fn connect(
        &mut self,
        address: BdAddr,
        timeout: Duration,
    ) -> Result<Self::Session, TransportError> {
        let device = self.adapter.device(to_bluer(address))?;
        self.cached.insert(address);

        match tokio::time::timeout(timeout, device.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_elapsed) => return Err(TransportError::ConnectTimeout),
        }

        // GATT objects appear only once BlueZ finishes its own discovery.
        let resolved_by = tokio::time::Instant::now() + SERVICES_RESOLVED_TIMEOUT;
        while !device.is_services_resolved().await? {
            if tokio::time::Instant::now() >= resolved_by {
                device.disconnect().await.ok();
                return Err(TransportError::ConnectTimeout);
            }
            tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
        }
        tracing::debug!(%address, "connected, services resolved");

        Ok(DbusSession {
            device,
            characteristics: HashMap::new(),
            notifications: SelectAll::new(),
        })
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.discovery = None;
        for address in std::mem::take(&mut self.cached) {
            if let Err(err) = self.adapter.remove_device(to_bluer(address)).await {
                tracing::debug!(%address, error=%err, "failed to remove cached device");
            }
        }
        Ok(())
    }
}

fn advertisement_property(property: &DeviceProperty) -> bool {
    matches!(
        property,
        DeviceProperty::ManufacturerData(_)
            | DeviceProperty::ServiceData(_)
            | DeviceProperty::Rssi(_)
    )
}

pub struct DbusSession {
    device: bluer::Device,
    characteristics: HashMap<u16, bluer::gatt::remote::Characteristic>,
    notifications: SelectAll<BoxStream<'static, (u16, Vec<u8>)>>,
}

impl GattSession for DbusSession {
    async fn discover(&mut self) -> Result<Vec<Service>, TransportError> {
        let mut services = Vec::new();
        for service in self.device.services().await? {
            let service_id = service.id();
            let uuid = service.uuid().await?;
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await? {
                let id = characteristic.id();
                let char_uuid = characteristic.uuid().await?;
                let flags = characteristic.flags().await?;
                let mut properties = 0u8;
                if flags.write {
                    properties |= 0x08;
                }
                if flags.notify {
                    properties |= 0x10;
                }
                characteristics.push(Characteristic {
                    uuid: char_uuid,
                    handle: id,
                    value_handle: id,
                    properties,
                });
                self.characteristics.insert(id, characteristic);
            }
            services.push(Service {
                uuid,
                start_handle: service_id,
                end_handle: service_id,
                characteristics,
            });
        }
        Ok(services)
    }

    async fn enable_notifications(
        &mut self,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError> {
        let remote = self
            .characteristics
            .get(&characteristic.value_handle)
            .ok_or_else(|| TransportError::DBus(String::from("characteristic not discovered")))?;
        let key = characteristic.value_handle;
        let stream = remote.notify().await?;
        self.notifications
            .push(stream.map(move |value| (key, value)).boxed());
        Ok(())
    }

    async fn write_request(
        &mut self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), TransportError> {
        use bluer::gatt::remote::CharacteristicWriteRequest;
        use bluer::gatt::WriteOp;
        let remote = self
            .characteristics
            .get(&characteristic.value_handle)
            .ok_or_else(|| TransportError::DBus(String::from("characteristic not discovered")))?;
        remote
            .write_ext(
                value,
                &CharacteristicWriteRequest {
                    op_type: WriteOp::Request,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn next_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(u16, Vec<u8>)>, TransportError> {
        if self.notifications.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        match tokio::time::timeout(timeout, self.notifications.next()).await {
            Ok(Some(notification)) => Ok(Some(notification)),
            Ok(None) => Ok(None),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn disconnect(self) -> Result<(), TransportError> {
        self.device.disconnect().await?;
        Ok(())
    }
}
