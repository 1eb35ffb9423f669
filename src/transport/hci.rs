//! Raw HCI socket back-end.
//!
//! Talks to the controller directly: HCI commands over an `AF_BLUETOOTH`
//! raw socket for scanning, whitelisting and connection setup, and ATT PDUs
//! over an L2CAP `SOCK_SEQPACKET` socket (CID 4) for GATT traffic. Wire
//! structures are decoded from owned byte slices with explicit bounds
//! checks throughout.

use super::{
    Advertisement, Characteristic, GattSession, ScanParams, Service, Transport, TransportError,
};
use crate::address::BdAddr;
use std::collections::VecDeque;
use std::fs;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use uuid::Uuid;

const BTPROTO_L2CAP: libc::c_int = 0;
const BTPROTO_HCI: libc::c_int = 1;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

const HCIDEVUP: libc::c_ulong = 0x400448C9;
const HCIDEVDOWN: libc::c_ulong = 0x400448CA;
const HCIGETDEVINFO: libc::c_ulong = 0x800448D3;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

const EVT_DISCONN_COMPLETE: u8 = 0x05;
const EVT_CMD_COMPLETE: u8 = 0x0E;
const EVT_CMD_STATUS: u8 = 0x0F;
const EVT_LE_META: u8 = 0x3E;

const LE_CONN_COMPLETE: u8 = 0x01;
const LE_ADVERTISING_REPORT: u8 = 0x02;
const LE_ENHANCED_CONN_COMPLETE: u8 = 0x0A;
const LE_EXT_ADVERTISING_REPORT: u8 = 0x0D;

const OGF_LINK_CTL: u16 = 0x01;
const OGF_HOST_CTL: u16 = 0x03;
const OGF_LE_CTL: u16 = 0x08;

const OCF_DISCONNECT: u16 = 0x0006;
const OCF_RESET: u16 = 0x0003;
const OCF_LE_SET_RANDOM_ADDRESS: u16 = 0x0005;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;
const OCF_LE_CREATE_CONN: u16 = 0x000D;
const OCF_LE_CREATE_CONN_CANCEL: u16 = 0x000E;
const OCF_LE_CLEAR_WHITE_LIST: u16 = 0x0010;
const OCF_LE_ADD_DEVICE_TO_WHITE_LIST: u16 = 0x0011;
const OCF_LE_SET_EXT_SCAN_PARAMETERS: u16 = 0x0041;
const OCF_LE_SET_EXT_SCAN_ENABLE: u16 = 0x0042;
const OCF_LE_EXT_CREATE_CONN: u16 = 0x0043;

const LE_PUBLIC_ADDRESS: u8 = 0x00;
const LE_RANDOM_ADDRESS: u8 = 0x01;
const BDADDR_LE_PUBLIC: u8 = 0x01;
const BDADDR_LE_RANDOM: u8 = 0x02;
const ATT_CID: u16 = 4;
const HCI_OE_USER_ENDED_CONNECTION: u8 = 0x13;

const ATT_OP_ERROR_RSP: u8 = 0x01;
const ATT_OP_READ_BY_TYPE_REQ: u8 = 0x08;
const ATT_OP_READ_BY_TYPE_RSP: u8 = 0x09;
const ATT_OP_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
const ATT_OP_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
const ATT_OP_WRITE_REQ: u8 = 0x12;
const ATT_OP_WRITE_RSP: u8 = 0x13;
const ATT_OP_HANDLE_VAL_NOT: u8 = 0x1B;

const ATT_ECODE_ATTR_NOT_FOUND: u8 = 0x0A;

const GATT_PRIMARY_SERVICE: u16 = 0x2800;
const GATT_CHARACTERISTIC: u16 = 0x2803;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// Kernel ABI mirrors; written whole and handed to the syscalls.
#[repr(C)]
#[allow(dead_code)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
#[allow(dead_code)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

#[repr(C)]
#[allow(dead_code)]
struct HciDevInfo {
    dev_id: u16,
    name: [u8; 8],
    bdaddr: [u8; 6],
    flags: u32,
    dev_type: u8,
    features: [u8; 8],
    pkt_type: u32,
    link_policy: u32,
    link_mode: u32,
    acl_mtu: u16,
    acl_pkts: u16,
    sco_mtu: u16,
    sco_pkts: u16,
    stat: [u32; 10],
}

fn opcode(ogf: u16, ocf: u16) -> u16 {
    ogf << 10 | ocf
}

fn os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Owned file descriptor with nonblocking I/O helpers.
struct Fd(RawFd);

impl Fd {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn bluetooth_socket(kind: libc::c_int, proto: libc::c_int) -> Result<Fd, TransportError> {
    let fd = unsafe {
        libc::socket(
            libc::AF_BLUETOOTH,
            kind | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            proto,
        )
    };
    if fd < 0 {
        let err = os_error();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return Err(TransportError::ConnectPermission);
        }
        return Err(TransportError::Io(err));
    }
    Ok(Fd(fd))
}

fn parse_device_index(name: Option<&str>) -> u16 {
    let Some(name) = name else { return 0 };
    name.trim_start_matches("hci").parse().unwrap_or(0)
}

/// A static random address in wire order: 6 bytes of entropy with the two
/// most significant bits set.
fn static_random_address() -> [u8; 6] {
    let mut bytes = [0u8; 6];
    if let Ok(mut file) = fs::File::open("/dev/urandom") {
        use std::io::Read;
        let _ = file.read_exact(&mut bytes);
    }
    bytes[5] |= 0xC0;
    bytes
}

pub struct HciTransport {
    dev_id: u16,
    socket: Arc<AsyncFd<Fd>>,
    scanning: bool,
    whitelist_active: bool,
    /// Reports parsed but not yet handed to the caller.
    backlog: VecDeque<Advertisement>,
}

impl HciTransport {
    /// Open the controller: bounce it down/up, bind a raw channel, install
    /// an all-events filter and set a fresh static random address.
    pub async fn open(adapter: Option<&str>) -> Result<Self, TransportError> {
        let dev_id = parse_device_index(adapter);

        let control = bluetooth_socket(libc::SOCK_RAW, BTPROTO_HCI)?;
        unsafe {
            // Power-cycling clears stale controller state; not fatal if the
            // process lacks CAP_NET_ADMIN.
            if libc::ioctl(control.0, HCIDEVDOWN, dev_id as libc::c_ulong) < 0 {
                tracing::debug!(error=%os_error(), "HCIDEVDOWN failed");
            }
            if libc::ioctl(control.0, HCIDEVUP, dev_id as libc::c_ulong) < 0 {
                tracing::debug!(error=%os_error(), "HCIDEVUP failed");
            }
            let mut info = std::mem::zeroed::<HciDevInfo>();
            info.dev_id = dev_id;
            if libc::ioctl(control.0, HCIGETDEVINFO, &mut info as *mut HciDevInfo) == 0 {
                let name_len = info.name.iter().position(|b| *b == 0).unwrap_or(8);
                tracing::info!(
                    adapter = %String::from_utf8_lossy(&info.name[..name_len]),
                    address = %BdAddr::from_le_bytes(info.bdaddr),
                    "opened bluetooth controller"
                );
            }
        }
        drop(control);

        let socket = bluetooth_socket(libc::SOCK_RAW, BTPROTO_HCI)?;
        let addr = SockaddrHci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let rc = unsafe {
            libc::bind(
                socket.0,
                &addr as *const SockaddrHci as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TransportError::Io(os_error()));
        }
        set_filter(&socket, &all_events_filter())?;

        let mut transport = Self {
            dev_id,
            socket: Arc::new(AsyncFd::new(socket).map_err(TransportError::Io)?),
            scanning: false,
            whitelist_active: false,
            backlog: VecDeque::new(),
        };
        transport
            .command(opcode(OGF_HOST_CTL, OCF_RESET), &[], CONTROL_TIMEOUT)
            .await
            .ok();

        let random = static_random_address();
        transport
            .command(
                opcode(OGF_LE_CTL, OCF_LE_SET_RANDOM_ADDRESS),
                &random,
                CONTROL_TIMEOUT,
            )
            .await
            .ok();
        Ok(transport)
    }

    async fn read_packet(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        read_packet_from(&self.socket, timeout).await
    }

    /// Issue one HCI command and wait for its command-complete or
    /// command-status event. Returns the status byte and any return
    /// parameters. Events that are not ours (advertising reports, mostly)
    /// are parsed into the backlog instead of being dropped.
    async fn command(
        &mut self,
        op: u16,
        params: &[u8],
        timeout: Duration,
    ) -> Result<(u8, Vec<u8>), TransportError> {
        let mut packet = Vec::with_capacity(4 + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&op.to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(params);
        self.socket.get_ref().write(&packet)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Io(std::io::Error::from(
                    std::io::ErrorKind::TimedOut,
                )));
            }
            let Some(packet) = self.read_packet(remaining).await? else {
                continue;
            };
            match classify_event(&packet, op) {
                EventKind::CommandResult { status, ret } => return Ok((status, ret)),
                EventKind::Advertisements(reports) => self.backlog.extend(reports),
                EventKind::Other => {}
            }
        }
    }

    /// Some controllers reject the standard LE command once extended
    /// commands are in play; the fallback to the extended variant lives
    /// here and nowhere else.
    async fn le_command_with_ext_fallback(
        &mut self,
        standard: (u16, Vec<u8>),
        extended: (u16, Vec<u8>),
    ) -> Result<u8, TransportError> {
        match self.command(standard.0, &standard.1, CONTROL_TIMEOUT).await {
            Ok((0, _)) => return Ok(0),
            Ok((status, _)) => {
                tracing::debug!(opcode = standard.0, status, "standard LE command failed, trying extended");
            }
            Err(err) => {
                tracing::debug!(opcode = standard.0, error=%err, "standard LE command failed, trying extended");
            }
        }
        let (status, _) = self.command(extended.0, &extended.1, CONTROL_TIMEOUT).await?;
        Ok(status)
    }

    async fn set_scan_enable(&mut self, enable: bool, filter_dup: bool) -> Result<u8, TransportError> {
        let flag = u8::from(enable);
        let dup = u8::from(filter_dup);
        let mut extended = vec![flag, dup];
        extended.extend_from_slice(&0u16.to_le_bytes()); // duration: continuous
        extended.extend_from_slice(&0u16.to_le_bytes()); // period
        self.le_command_with_ext_fallback(
            (opcode(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE), vec![flag, dup]),
            (opcode(OGF_LE_CTL, OCF_LE_SET_EXT_SCAN_ENABLE), extended),
        )
        .await
    }

    /// Wait for an LE connection-complete meta event for the given peer.
    async fn await_connection(
        &mut self,
        address: BdAddr,
        timeout: Duration,
    ) -> Result<u16, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::ConnectTimeout);
            }
            let Some(packet) = self.read_packet(remaining).await? else {
                continue;
            };
            if let Some((status, handle, peer)) = parse_connection_complete(&packet) {
                if peer != address {
                    continue;
                }
                return match status {
                    0x00 => Ok(handle),
                    0x02 | 0x04 => Err(TransportError::ConnectTimeout),
                    0x0F => Err(TransportError::ConnectRefused),
                    other => Err(TransportError::ConnectTransport(format!(
                        "connection failed with HCI status {other:#04x}"
                    ))),
                };
            }
            if let EventKind::Advertisements(reports) = classify_event(&packet, 0) {
                self.backlog.extend(reports);
            }
        }
    }
}

impl Transport for HciTransport {
    type Session = HciSession;

    async fn start_scan(&mut self, params: &ScanParams) -> Result<(), TransportError> {
        if self.scanning {
            self.stop_scan().await.ok();
        }
        let scan_type = u8::from(params.active);
        let filter_policy = u8::from(params.whitelist_only && self.whitelist_active);

        let mut standard = vec![scan_type];
        standard.extend_from_slice(&params.interval.to_le_bytes());
        standard.extend_from_slice(&params.window.to_le_bytes());
        standard.push(LE_RANDOM_ADDRESS);
        standard.push(filter_policy);

        let mut extended = vec![LE_RANDOM_ADDRESS, filter_policy, 0x01, scan_type];
        extended.extend_from_slice(&params.interval.to_le_bytes());
        extended.extend_from_slice(&params.window.to_le_bytes());

        let status = self
            .le_command_with_ext_fallback(
                (opcode(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS), standard),
                (opcode(OGF_LE_CTL, OCF_LE_SET_EXT_SCAN_PARAMETERS), extended),
            )
            .await
            .map_err(|err| TransportError::ScanSetup(err.to_string()))?;
        if status != 0 {
            return Err(TransportError::ScanSetup(format!(
                "scan parameters rejected with status {status:#04x}"
            )));
        }

        let status = self
            .set_scan_enable(true, params.filter_duplicates)
            .await
            .map_err(|err| TransportError::ScanSetup(err.to_string()))?;
        if status != 0 {
            return Err(TransportError::ScanSetup(format!(
                "scan enable rejected with status {status:#04x}"
            )));
        }
        self.scanning = true;
        tracing::info!(
            device = self.dev_id,
            interval_ms = params.interval as f64 * 0.625,
            window_ms = params.window as f64 * 0.625,
            active = params.active,
            whitelist = filter_policy == 1,
            "scanning started"
        );
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.set_scan_enable(false, false).await.ok();
        self.scanning = false;
        Ok(())
    }

    async fn set_whitelist(&mut self, addresses: &[BdAddr]) -> Result<(), TransportError> {
        self.command(
            opcode(OGF_LE_CTL, OCF_LE_CLEAR_WHITE_LIST),
            &[],
            CONTROL_TIMEOUT,
        )
        .await?;
        for address in addresses {
            let mut params = vec![if address.is_random_static() {
                LE_RANDOM_ADDRESS
            } else {
                LE_PUBLIC_ADDRESS
            }];
            params.extend_from_slice(&address.to_le_bytes());
            self.command(
                opcode(OGF_LE_CTL, OCF_LE_ADD_DEVICE_TO_WHITE_LIST),
                &params,
                CONTROL_TIMEOUT,
            )
            .await?;
        }
        self.whitelist_active = !addresses.is_empty();
        Ok(())
    }

    async fn clear_whitelist(&mut self) -> Result<(), TransportError> {
        self.command(
            opcode(OGF_LE_CTL, OCF_LE_CLEAR_WHITE_LIST),
            &[],
            CONTROL_TIMEOUT,
        )
        .await?;
        self.whitelist_active = false;
        Ok(())
    }

    async fn next_advertisement(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Advertisement>, TransportError> {
        if let Some(report) = self.backlog.pop_front() {
            return Ok(Some(report));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(packet) = self.read_packet(remaining).await? else {
                return Ok(None);
            };
            if let EventKind::Advertisements(mut reports) = classify_event(&packet, 0) {
                if let Some(first) = reports.pop_front() {
                    self.backlog.extend(reports);
                    return Ok(Some(first));
                }
            }
        }
    }

    async fn connect(
        &mut self,
        address: BdAddr,
        timeout: Duration,
    ) -> Result<Self::Session, TransportError> {
        let saved_filter = get_filter(self.socket.get_ref())?;
        let peer_type = if address.is_random_static() {
            LE_RANDOM_ADDRESS
        } else {
            LE_PUBLIC_ADDRESS
        };

        // Scan interval 96 (60 ms), window 48 (30 ms), connection interval
        // 24..40 (30..50 ms), supervision timeout 2000 (20 s).
        let mut standard = Vec::new();
        standard.extend_from_slice(&96u16.to_le_bytes());
        standard.extend_from_slice(&48u16.to_le_bytes());
        standard.push(0x00); // use peer address, not the whitelist
        standard.push(peer_type);
        standard.extend_from_slice(&address.to_le_bytes());
        standard.push(LE_RANDOM_ADDRESS);
        standard.extend_from_slice(&24u16.to_le_bytes());
        standard.extend_from_slice(&40u16.to_le_bytes());
        standard.extend_from_slice(&0u16.to_le_bytes());
        standard.extend_from_slice(&2000u16.to_le_bytes());
        standard.extend_from_slice(&0u16.to_le_bytes());
        standard.extend_from_slice(&0u16.to_le_bytes());

        let mut extended = vec![0x00, LE_RANDOM_ADDRESS, peer_type];
        extended.extend_from_slice(&address.to_le_bytes());
        extended.push(0x01); // initiate on 1M PHY
        extended.extend_from_slice(&96u16.to_le_bytes());
        extended.extend_from_slice(&48u16.to_le_bytes());
        extended.extend_from_slice(&24u16.to_le_bytes());
        extended.extend_from_slice(&40u16.to_le_bytes());
        extended.extend_from_slice(&0u16.to_le_bytes());
        extended.extend_from_slice(&2000u16.to_le_bytes());
        extended.extend_from_slice(&0u16.to_le_bytes());
        extended.extend_from_slice(&0u16.to_le_bytes());

        let status = self
            .le_command_with_ext_fallback(
                (opcode(OGF_LE_CTL, OCF_LE_CREATE_CONN), standard),
                (opcode(OGF_LE_CTL, OCF_LE_EXT_CREATE_CONN), extended),
            )
            .await?;
        if status != 0 {
            set_filter(self.socket.get_ref(), &saved_filter).ok();
            return Err(TransportError::ConnectTransport(format!(
                "create connection rejected with status {status:#04x}"
            )));
        }

        let handle = match self.await_connection(address, timeout).await {
            Ok(handle) => handle,
            Err(err) => {
                self.command(
                    opcode(OGF_LE_CTL, OCF_LE_CREATE_CONN_CANCEL),
                    &[],
                    CONTROL_TIMEOUT,
                )
                .await
                .ok();
                set_filter(self.socket.get_ref(), &saved_filter).ok();
                return Err(err);
            }
        };
        tracing::debug!(%address, handle, "LE connection established");

        match open_att_channel(address).await {
            Ok(l2cap) => Ok(HciSession {
                hci: Arc::clone(&self.socket),
                l2cap,
                conn_handle: handle,
                saved_filter,
                pending_notifications: VecDeque::new(),
            }),
            Err(err) => {
                disconnect_handle(self, handle).await;
                set_filter(self.socket.get_ref(), &saved_filter).ok();
                Err(err)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.scanning {
            self.stop_scan().await.ok();
        }
        Ok(())
    }
}

async fn disconnect_handle(transport: &mut HciTransport, handle: u16) {
    let mut params = Vec::new();
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(HCI_OE_USER_ENDED_CONNECTION);
    transport
        .command(
            opcode(OGF_LINK_CTL, OCF_DISCONNECT),
            &params,
            DISCONNECT_TIMEOUT,
        )
        .await
        .ok();
}

async fn read_packet_from(
    socket: &AsyncFd<Fd>,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut buf = [0u8; 512];
    let result = tokio::time::timeout(timeout, async {
        loop {
            let mut guard = socket.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
                Ok(Ok(n)) => return Ok::<usize, std::io::Error>(n),
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    })
    .await;
    match result {
        Ok(Ok(n)) => Ok(Some(buf[..n].to_vec())),
        Ok(Err(err)) => Err(TransportError::Io(err)),
        Err(_elapsed) => Ok(None),
    }
}

enum EventKind {
    CommandResult { status: u8, ret: Vec<u8> },
    Advertisements(VecDeque<Advertisement>),
    Other,
}

fn classify_event(packet: &[u8], expect_opcode: u16) -> EventKind {
    if packet.len() < 3 || packet[0] != HCI_EVENT_PKT {
        return EventKind::Other;
    }
    let event = packet[1];
    let len = packet[2] as usize;
    let Some(payload) = packet.get(3..3 + len) else {
        return EventKind::Other;
    };
    match event {
        EVT_CMD_COMPLETE if payload.len() >= 4 => {
            let op = u16::from_le_bytes([payload[1], payload[2]]);
            if op == expect_opcode {
                EventKind::CommandResult {
                    status: payload[3],
                    ret: payload[4..].to_vec(),
                }
            } else {
                EventKind::Other
            }
        }
        EVT_CMD_STATUS if payload.len() >= 4 => {
            let op = u16::from_le_bytes([payload[2], payload[3]]);
            if op == expect_opcode {
                EventKind::CommandResult {
                    status: payload[0],
                    ret: Vec::new(),
                }
            } else {
                EventKind::Other
            }
        }
        EVT_LE_META if !payload.is_empty() => match payload[0] {
            LE_ADVERTISING_REPORT => {
                EventKind::Advertisements(parse_advertising_report(&payload[1..], false))
            }
            LE_EXT_ADVERTISING_REPORT => {
                EventKind::Advertisements(parse_advertising_report(&payload[1..], true))
            }
            _ => EventKind::Other,
        },
        _ => EventKind::Other,
    }
}

fn parse_connection_complete(packet: &[u8]) -> Option<(u8, u16, BdAddr)> {
    if packet.len() < 3 || packet[0] != HCI_EVENT_PKT {
        return None;
    }
    let event = packet[1];
    let len = packet[2] as usize;
    let payload = packet.get(3..3 + len)?;
    if event != EVT_LE_META || payload.is_empty() {
        return None;
    }
    match payload[0] {
        // status, handle, role, peer type, peer address...
        LE_CONN_COMPLETE | LE_ENHANCED_CONN_COMPLETE if payload.len() >= 12 => {
            let status = payload[1];
            let handle = u16::from_le_bytes([payload[2], payload[3]]);
            let peer = BdAddr::from_le_bytes(payload[6..12].try_into().ok()?);
            Some((status, handle, peer))
        }
        _ => None,
    }
}

/// Parse one LE (extended) advertising report event into advertisements.
fn parse_advertising_report(payload: &[u8], extended: bool) -> VecDeque<Advertisement> {
    let mut out = VecDeque::new();
    let Some((&count, mut rest)) = payload.split_first() else {
        return out;
    };
    for _ in 0..count {
        let parsed = if extended {
            parse_extended_report(rest)
        } else {
            parse_legacy_report(rest)
        };
        let Some((adv, consumed)) = parsed else { break };
        rest = &rest[consumed..];
        out.push_back(adv);
    }
    out
}

fn parse_legacy_report(data: &[u8]) -> Option<(Advertisement, usize)> {
    // evt_type, addr_type, addr[6], data_len, data[], rssi
    if data.len() < 9 {
        return None;
    }
    let addr_type = data[1];
    let address = BdAddr::from_le_bytes(data[2..8].try_into().ok()?);
    let data_len = data[8] as usize;
    let end = 9 + data_len;
    let ad = data.get(9..end)?;
    let rssi = data.get(end).map(|&b| b as i8 as i16);
    let mut adv = parse_ad_structures(ad);
    adv.address = address;
    adv.random_address = addr_type == 0x01;
    adv.rssi = rssi.filter(|&r| r != 127);
    Some((adv, end + 1))
}

fn parse_extended_report(data: &[u8]) -> Option<(Advertisement, usize)> {
    // evt_type[2], addr_type, addr[6], phy[2], sid, tx_power, rssi,
    // interval[2], direct addr type + addr[6], data_len, data[]
    if data.len() < 24 {
        return None;
    }
    let addr_type = data[2];
    let address = BdAddr::from_le_bytes(data[3..9].try_into().ok()?);
    let rssi = data[13] as i8 as i16;
    let data_len = data[23] as usize;
    let end = 24 + data_len;
    let ad = data.get(24..end)?;
    let mut adv = parse_ad_structures(ad);
    adv.address = address;
    adv.random_address = addr_type == 0x01;
    adv.rssi = (rssi != 127).then_some(rssi);
    Some((adv, end))
}

/// Split raw advertising data into its typed AD structures.
pub fn parse_ad_structures(mut data: &[u8]) -> Advertisement {
    let mut adv = Advertisement::default();
    while let Some((&len, rest)) = data.split_first() {
        if len == 0 {
            break;
        }
        let Some(field) = rest.get(..len as usize) else {
            break;
        };
        data = &rest[len as usize..];
        let Some((&ad_type, value)) = field.split_first() else {
            continue;
        };
        match ad_type {
            // Shortened / complete local name
            0x08 | 0x09 => {
                adv.name = Some(String::from_utf8_lossy(value).into_owned());
            }
            // 16-bit service UUID lists
            0x02 | 0x03 => {
                for chunk in value.chunks_exact(2) {
                    let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                    adv.service_uuids.push(uuid_from_short(short));
                }
            }
            // 128-bit service UUID lists, little-endian on the wire
            0x06 | 0x07 => {
                for chunk in value.chunks_exact(16) {
                    let mut bytes: [u8; 16] = chunk.try_into().expect("chunk of 16");
                    bytes.reverse();
                    adv.service_uuids.push(Uuid::from_bytes(bytes));
                }
            }
            // 16-bit UUID service data
            0x16 if value.len() >= 2 => {
                let short = u16::from_le_bytes([value[0], value[1]]);
                adv.service_data
                    .push((uuid_from_short(short), value[2..].to_vec()));
            }
            // Manufacturer specific data: company id then payload
            0xFF if value.len() >= 2 => {
                let company = u16::from_le_bytes([value[0], value[1]]);
                adv.manufacturer_data.push((company, value[2..].to_vec()));
            }
            _ => {}
        }
    }
    adv
}

fn uuid_from_short(short: u16) -> Uuid {
    let mut bytes = [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34,
        0xFB,
    ];
    bytes[2..4].copy_from_slice(&short.to_be_bytes());
    Uuid::from_bytes(bytes)
}

fn all_events_filter() -> HciFilter {
    HciFilter {
        type_mask: 1 << HCI_EVENT_PKT,
        event_mask: [u32::MAX, u32::MAX],
        opcode: 0,
    }
}

fn get_filter(socket: &Fd) -> Result<HciFilter, TransportError> {
    let mut filter = HciFilter::default();
    let mut len = std::mem::size_of::<HciFilter>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket.0,
            SOL_HCI,
            HCI_FILTER,
            &mut filter as *mut HciFilter as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(TransportError::Io(os_error()));
    }
    Ok(filter)
}

fn set_filter(socket: &Fd, filter: &HciFilter) -> Result<(), TransportError> {
    let rc = unsafe {
        libc::setsockopt(
            socket.0,
            SOL_HCI,
            HCI_FILTER,
            filter as *const HciFilter as *const libc::c_void,
            std::mem::size_of::<HciFilter>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(TransportError::Io(os_error()));
    }
    Ok(())
}

/// Open the ATT channel (L2CAP CID 4) to an already-connected peer.
async fn open_att_channel(address: BdAddr) -> Result<AsyncFd<Fd>, TransportError> {
    let socket = bluetooth_socket(libc::SOCK_SEQPACKET, BTPROTO_L2CAP)?;

    let src = SockaddrL2 {
        l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        l2_psm: 0,
        l2_bdaddr: [0; 6],
        l2_cid: ATT_CID.to_le(),
        l2_bdaddr_type: BDADDR_LE_RANDOM,
    };
    let rc = unsafe {
        libc::bind(
            socket.0,
            &src as *const SockaddrL2 as *const libc::sockaddr,
            std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(TransportError::Io(os_error()));
    }

    let dst = SockaddrL2 {
        l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        l2_psm: 0,
        l2_bdaddr: address.to_le_bytes(),
        l2_cid: ATT_CID.to_le(),
        l2_bdaddr_type: if address.is_random_static() {
            BDADDR_LE_RANDOM
        } else {
            BDADDR_LE_PUBLIC
        },
    };
    let rc = unsafe {
        libc::connect(
            socket.0,
            &dst as *const SockaddrL2 as *const libc::sockaddr,
            std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(connect_error(err));
        }
    }

    let async_fd = AsyncFd::new(socket).map_err(TransportError::Io)?;
    let writable = tokio::time::timeout(Duration::from_secs(15), async_fd.writable()).await;
    match writable {
        Ok(Ok(mut guard)) => {
            guard.clear_ready();
        }
        Ok(Err(err)) => return Err(TransportError::Io(err)),
        Err(_elapsed) => return Err(TransportError::ConnectTimeout),
    }

    // connect(2) completion status lives in SO_ERROR.
    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            async_fd.get_ref().0,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(TransportError::Io(os_error()));
    }
    if so_error != 0 {
        return Err(connect_error(std::io::Error::from_raw_os_error(so_error)));
    }
    Ok(async_fd)
}

fn connect_error(err: std::io::Error) -> TransportError {
    match err.raw_os_error() {
        Some(libc::ECONNREFUSED) => TransportError::ConnectRefused,
        Some(libc::ETIMEDOUT) | Some(libc::EHOSTDOWN) | Some(libc::EHOSTUNREACH) => {
            TransportError::ConnectTimeout
        }
        Some(libc::EACCES) | Some(libc::EPERM) => TransportError::ConnectPermission,
        _ => TransportError::ConnectTransport(err.to_string()),
    }
}

pub struct HciSession {
    hci: Arc<AsyncFd<Fd>>,
    l2cap: AsyncFd<Fd>,
    conn_handle: u16,
    saved_filter: HciFilter,
    pending_notifications: VecDeque<(u16, Vec<u8>)>,
}

impl HciSession {
    async fn read_att(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        read_packet_from(&self.l2cap, timeout).await
    }

    /// Send one ATT request and wait for its response, buffering any
    /// notifications that arrive in between.
    async fn att_request(
        &mut self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let expected = request[0] + 1;
        self.l2cap.get_ref().write(request)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Io(std::io::Error::from(
                    std::io::ErrorKind::TimedOut,
                )));
            }
            let Some(pdu) = self.read_att(remaining).await? else {
                continue;
            };
            match pdu.first() {
                Some(&op) if op == expected => return Ok(pdu),
                Some(&ATT_OP_ERROR_RSP) if pdu.len() >= 5 && pdu[1] == request[0] => {
                    return Err(TransportError::Attribute(pdu[4]));
                }
                Some(&ATT_OP_HANDLE_VAL_NOT) => {
                    if let Some(notification) = parse_notification(&pdu) {
                        self.pending_notifications.push_back(notification);
                    }
                }
                _ => {}
            }
        }
    }
}

fn parse_notification(pdu: &[u8]) -> Option<(u16, Vec<u8>)> {
    if pdu.len() < 3 || pdu[0] != ATT_OP_HANDLE_VAL_NOT {
        return None;
    }
    let handle = u16::from_le_bytes([pdu[1], pdu[2]]);
    Some((handle, pdu[3..].to_vec()))
}

impl GattSession for HciSession {
    async fn discover(&mut self) -> Result<Vec<Service>, TransportError> {
        let mut services = Vec::new();
        let mut start: u16 = 0x0001;
        loop {
            let mut request = vec![ATT_OP_READ_BY_GROUP_TYPE_REQ];
            request.extend_from_slice(&start.to_le_bytes());
            request.extend_from_slice(&0xFFFFu16.to_le_bytes());
            request.extend_from_slice(&GATT_PRIMARY_SERVICE.to_le_bytes());
            let response = match self.att_request(&request, CONTROL_TIMEOUT).await {
                Ok(response) => response,
                Err(TransportError::Attribute(ATT_ECODE_ATTR_NOT_FOUND)) => break,
                Err(err) => return Err(err),
            };
            if response.len() < 2 || response[0] != ATT_OP_READ_BY_GROUP_TYPE_RSP {
                break;
            }
            let entry_len = response[1] as usize;
            if entry_len < 6 {
                break;
            }
            let mut advanced = false;
            for entry in response[2..].chunks_exact(entry_len) {
                let first = u16::from_le_bytes([entry[0], entry[1]]);
                let last = u16::from_le_bytes([entry[2], entry[3]]);
                let Some(uuid) = uuid_from_le(&entry[4..]) else {
                    continue;
                };
                services.push(Service {
                    uuid,
                    start_handle: first,
                    end_handle: last,
                    characteristics: Vec::new(),
                });
                if last == 0xFFFF {
                    advanced = false;
                    break;
                }
                start = last + 1;
                advanced = true;
            }
            if !advanced {
                break;
            }
        }

        for service in &mut services {
            service.characteristics =
                discover_characteristics(self, service.start_handle, service.end_handle).await?;
        }
        Ok(services)
    }

    async fn enable_notifications(
        &mut self,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError> {
        // Client Characteristic Configuration descriptor sits one handle
        // past the value.
        let ccc = characteristic.value_handle + 1;
        let mut request = vec![ATT_OP_WRITE_REQ];
        request.extend_from_slice(&ccc.to_le_bytes());
        request.extend_from_slice(&[0x01, 0x00]);
        match self.att_request(&request, CONTROL_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(TransportError::Attribute(code)) => Err(TransportError::Attribute(code)),
            Err(err) => Err(err),
        }
    }

    async fn write_request(
        &mut self,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let mut request = vec![ATT_OP_WRITE_REQ];
        request.extend_from_slice(&characteristic.value_handle.to_le_bytes());
        request.extend_from_slice(value);
        let response = self.att_request(&request, CONTROL_TIMEOUT).await?;
        if response.first() == Some(&ATT_OP_WRITE_RSP) {
            Ok(())
        } else {
            Err(TransportError::ConnectTransport(String::from(
                "unexpected response to write request",
            )))
        }
    }

    async fn next_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(u16, Vec<u8>)>, TransportError> {
        if let Some(notification) = self.pending_notifications.pop_front() {
            return Ok(Some(notification));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(pdu) = self.read_att(remaining).await? else {
                return Ok(None);
            };
            if let Some(notification) = parse_notification(&pdu) {
                return Ok(Some(notification));
            }
        }
    }

    async fn disconnect(self) -> Result<(), TransportError> {
        drop(self.l2cap);

        let mut params = Vec::new();
        params.extend_from_slice(&self.conn_handle.to_le_bytes());
        params.push(HCI_OE_USER_ENDED_CONNECTION);
        let mut packet = Vec::new();
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&opcode(OGF_LINK_CTL, OCF_DISCONNECT).to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        self.hci.get_ref().write(&packet)?;

        // Best effort: wait briefly for the disconnection-complete event.
        let deadline = tokio::time::Instant::now() + DISCONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match read_packet_from(&self.hci, remaining).await {
                Ok(Some(packet))
                    if packet.len() >= 2
                        && packet[0] == HCI_EVENT_PKT
                        && packet[1] == EVT_DISCONN_COMPLETE =>
                {
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }

        set_filter(self.hci.get_ref(), &self.saved_filter).ok();
        Ok(())
    }
}

async fn discover_characteristics(
    session: &mut HciSession,
    start_handle: u16,
    end_handle: u16,
) -> Result<Vec<Characteristic>, TransportError> {
    let mut characteristics = Vec::new();
    let mut start = start_handle;
    while start <= end_handle {
        let mut request = vec![ATT_OP_READ_BY_TYPE_REQ];
        request.extend_from_slice(&start.to_le_bytes());
        request.extend_from_slice(&end_handle.to_le_bytes());
        request.extend_from_slice(&GATT_CHARACTERISTIC.to_le_bytes());
        let response = match session.att_request(&request, CONTROL_TIMEOUT).await {
            Ok(response) => response,
            Err(TransportError::Attribute(ATT_ECODE_ATTR_NOT_FOUND)) => break,
            Err(err) => return Err(err),
        };
        if response.len() < 2 || response[0] != ATT_OP_READ_BY_TYPE_RSP {
            break;
        }
        let entry_len = response[1] as usize;
        if entry_len < 7 {
            break;
        }
        let mut advanced = false;
        for entry in response[2..].chunks_exact(entry_len) {
            let handle = u16::from_le_bytes([entry[0], entry[1]]);
            let properties = entry[2];
            let value_handle = u16::from_le_bytes([entry[3], entry[4]]);
            let Some(uuid) = uuid_from_le(&entry[5..]) else {
                continue;
            };
            characteristics.push(Characteristic {
                uuid,
                handle,
                value_handle,
                properties,
            });
            if value_handle == 0xFFFF {
                advanced = false;
                break;
            }
            start = value_handle + 1;
            advanced = true;
        }
        if !advanced {
            break;
        }
    }
    Ok(characteristics)
}

/// A 2- or 16-byte little-endian UUID off the wire, canonicalized.
fn uuid_from_le(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(uuid_from_short(u16::from_le_bytes([bytes[0], bytes[1]]))),
        16 => {
            let mut canonical: [u8; 16] = bytes.try_into().ok()?;
            canonical.reverse();
            Some(Uuid::from_bytes(canonical))
        }
        _ => None,
    }
}
