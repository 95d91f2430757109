//! Hardware collaborator interface for SDR radios on a hardware bus.
//!
//! Bus enumeration, the permission dialog, and opening the device are owned by
//! the host platform. The link only needs a device list, an asynchronous
//! grant/deny answer, and a duplex byte channel once access is granted.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::LinkError;
use crate::service::Command;

/// Buffer size of simulated radio channels
pub const SIMULATED_CHANNEL_BUFFER: usize = 64 * 1024;

/// Byte-oriented duplex channel to an opened radio
pub trait DuplexChannel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexChannel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned channel handed to the link on open
pub type LinkStream = Box<dyn DuplexChannel>;

/// A device present on the hardware bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Bus path or platform device name
    pub id: String,
    /// Product string reported by the device
    pub product_name: String,
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
}

impl DeviceInfo {
    /// Describe a device
    pub fn new(
        id: impl Into<String>,
        product_name: impl Into<String>,
        vendor_id: u16,
        product_id: u16,
    ) -> Self {
        Self {
            id: id.into(),
            product_name: product_name.into(),
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {:04x}:{:04x})",
            self.id, self.product_name, self.vendor_id, self.product_id
        )
    }
}

/// Supported radio families, recognised by USB vendor id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdrModel {
    /// Analog Devices ADALM-PLUTO
    PlutoSdr,
    /// Great Scott Gadgets HackRF
    HackRf,
    /// Ettus Research USRP
    Usrp,
}

impl SdrModel {
    /// Recognise a supported radio
    pub fn probe(device: &DeviceInfo) -> Option<Self> {
        match device.vendor_id {
            0x0456 => Some(SdrModel::PlutoSdr),
            0x1D50 => Some(SdrModel::HackRf),
            0x2500 => Some(SdrModel::Usrp),
            _ => None,
        }
    }
}

impl fmt::Display for SdrModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SdrModel::PlutoSdr => "PlutoSDR",
            SdrModel::HackRf => "HackRF",
            SdrModel::Usrp => "USRP",
        };
        f.write_str(name)
    }
}

/// One-shot answer to a permission request.
///
/// The answer is queued to the transport worker; it never touches link
/// state directly.
#[derive(Debug)]
pub struct PermissionResponder {
    link_id: u64,
    device: DeviceInfo,
    queue: mpsc::UnboundedSender<Command>,
}

impl PermissionResponder {
    pub(crate) fn new(link_id: u64, device: DeviceInfo, queue: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            link_id,
            device,
            queue,
        }
    }

    /// Device the request is for
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Grant access
    pub fn grant(self) {
        self.respond(true);
    }

    /// Deny access
    pub fn deny(self) {
        self.respond(false);
    }

    fn respond(self, granted: bool) {
        let command = Command::Permission {
            link_id: self.link_id,
            granted,
        };
        if self.queue.send(command).is_err() {
            debug!(
                "Permission answer for {} arrived after the transport stopped",
                self.device.id
            );
        }
    }
}

/// Platform hardware collaborator
pub trait HardwareTransport: Send + Sync + fmt::Debug {
    /// Devices currently on the bus
    fn enumerate(&self) -> Vec<DeviceInfo>;

    /// Ask for access to a device; the answer arrives through `responder`
    fn request_permission(&self, device: &DeviceInfo, responder: PermissionResponder);

    /// Open a device that access was granted for
    fn open(&self, device: &DeviceInfo) -> Result<LinkStream, LinkError>;
}

/// How the simulated radio answers permission requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionPolicy {
    /// Grant immediately
    Grant,
    /// Deny immediately
    Deny,
    /// Hold the request until [`SimulatedRadio::take_deferred`]
    Defer,
}

/// In-process radio backed by `tokio::io::duplex` channels.
///
/// In loopback mode every byte written to the radio is echoed back, which
/// makes a single node hear its own bursts. Otherwise the far end of each
/// opened channel is kept for the caller to drive.
#[derive(Debug)]
pub struct SimulatedRadio {
    devices: Mutex<Vec<DeviceInfo>>,
    policy: Mutex<PermissionPolicy>,
    loopback: bool,
    fail_next_open: Mutex<Option<String>>,
    deferred: Mutex<Vec<PermissionResponder>>,
    peers: Mutex<Vec<DuplexStream>>,
    opened: AtomicUsize,
}

impl SimulatedRadio {
    /// Radio whose far end is held for the caller
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            policy: Mutex::new(PermissionPolicy::Grant),
            loopback: false,
            fail_next_open: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
        }
    }

    /// Radio that echoes every burst back
    pub fn loopback(devices: Vec<DeviceInfo>) -> Self {
        Self {
            loopback: true,
            ..Self::new(devices)
        }
    }

    /// The simulated ADALM-PLUTO used by the binary
    pub fn pluto_device() -> DeviceInfo {
        DeviceInfo::new("/dev/bus/usb/001/004", "PlutoSDR (ADALM-PLUTO)", 0x0456, 0xB673)
    }

    /// Change how permission requests are answered
    pub fn set_policy(&self, policy: PermissionPolicy) {
        *lock(&self.policy) = policy;
    }

    /// Make the next `open` fail with a channel error
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        *lock(&self.fail_next_open) = Some(reason.into());
    }

    /// Replace the devices reported by `enumerate`
    pub fn set_devices(&self, devices: Vec<DeviceInfo>) {
        *lock(&self.devices) = devices;
    }

    /// Permission requests held under [`PermissionPolicy::Defer`]
    pub fn take_deferred(&self) -> Vec<PermissionResponder> {
        std::mem::take(&mut *lock(&self.deferred))
    }

    /// Far end of the oldest opened channel not yet taken
    pub fn take_peer(&self) -> Option<DuplexStream> {
        let mut peers = lock(&self.peers);
        if peers.is_empty() {
            None
        } else {
            Some(peers.remove(0))
        }
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl HardwareTransport for SimulatedRadio {
    fn enumerate(&self) -> Vec<DeviceInfo> {
        lock(&self.devices).clone()
    }

    fn request_permission(&self, device: &DeviceInfo, responder: PermissionResponder) {
        let policy = *lock(&self.policy);
        debug!("Permission request for {} ({:?})", device.id, policy);
        match policy {
            PermissionPolicy::Grant => responder.grant(),
            PermissionPolicy::Deny => responder.deny(),
            PermissionPolicy::Defer => lock(&self.deferred).push(responder),
        }
    }

    fn open(&self, device: &DeviceInfo) -> Result<LinkStream, LinkError> {
        if let Some(reason) = lock(&self.fail_next_open).take() {
            return Err(LinkError::Channel(reason));
        }

        let (near, far) = tokio::io::duplex(SIMULATED_CHANNEL_BUFFER);
        self.opened.fetch_add(1, Ordering::SeqCst);

        if self.loopback {
            let id = device.id.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(far);
                match tokio::io::copy(&mut reader, &mut writer).await {
                    Ok(echoed) => debug!("Loopback on {} ended after {}b", id, echoed),
                    Err(e) => debug!("Loopback on {} failed: {}", id, e),
                }
            });
        } else {
            lock(&self.peers).push(far);
        }

        info!("Opened simulated channel to {}", device);
        Ok(Box::new(near))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_supported_vendors() {
        let pluto = SimulatedRadio::pluto_device();
        assert_eq!(SdrModel::probe(&pluto), Some(SdrModel::PlutoSdr));

        let hackrf = DeviceInfo::new("usb1", "HackRF One", 0x1D50, 0x6089);
        assert_eq!(SdrModel::probe(&hackrf), Some(SdrModel::HackRf));

        let keyboard = DeviceInfo::new("usb2", "Keyboard", 0x046D, 0xC31C);
        assert_eq!(SdrModel::probe(&keyboard), None);
    }

    #[test]
    fn test_permission_policies() {
        let radio = SimulatedRadio::new(vec![]);
        let device = SimulatedRadio::pluto_device();
        let (tx, mut rx) = mpsc::unbounded_channel();

        radio.request_permission(&device, PermissionResponder::new(1, device.clone(), tx.clone()));
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Permission { link_id: 1, granted: true })
        ));

        radio.set_policy(PermissionPolicy::Deny);
        radio.request_permission(&device, PermissionResponder::new(2, device.clone(), tx.clone()));
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Permission { link_id: 2, granted: false })
        ));

        radio.set_policy(PermissionPolicy::Defer);
        radio.request_permission(&device, PermissionResponder::new(3, device.clone(), tx));
        assert!(rx.try_recv().is_err());

        let deferred = radio.take_deferred();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].device(), &device);
        deferred.into_iter().for_each(PermissionResponder::grant);
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Permission { link_id: 3, granted: true })
        ));
    }

    #[tokio::test]
    async fn test_open_and_fail_open() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let radio = SimulatedRadio::new(vec![SimulatedRadio::pluto_device()]);
        let device = radio.enumerate().remove(0);

        radio.fail_next_open("device busy");
        assert_eq!(
            radio.open(&device).err(),
            Some(LinkError::Channel("device busy".to_string()))
        );

        let mut near = radio.open(&device).unwrap();
        let mut far = radio.take_peer().unwrap();
        assert_eq!(radio.open_count(), 1);

        near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_loopback_echoes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let radio = SimulatedRadio::loopback(vec![]);
        let mut near = radio.open(&SimulatedRadio::pluto_device()).unwrap();
        assert!(radio.take_peer().is_none());

        near.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
    }
}
