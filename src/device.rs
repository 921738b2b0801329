//! Device attach/detach relay
//!
//! The platform device monitor reports storage devices as they come and
//! go. The relay keeps the set of known devices keyed by mount path and
//! forwards every change to subscribers.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Filesystem,
    Camera,
    Mtp,
    Unknown,
}

/// A device as reported by the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    /// Device exposes more than plain storage
    pub is_extended: bool,
    pub filesystem_path: PathBuf,
    pub vendor: String,
    pub product: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(DeviceInfo),
    Detached(DeviceInfo),
}

/// Checks whether a device path is still backed by a live mount
pub trait MountCheck: Send + Sync {
    fn is_mounted(&self, path: &Path) -> bool;
}

/// Treats a device as connected while its path exists
#[derive(Debug, Default, Clone, Copy)]
pub struct PathExists;

impl MountCheck for PathExists {
    fn is_mounted(&self, path: &Path) -> bool {
        path.exists()
    }
}

type Subscriber = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

pub struct DeviceRelay {
    devices: RwLock<BTreeMap<PathBuf, DeviceInfo>>,
    subscribers: RwLock<Vec<Subscriber>>,
    mounts: Box<dyn MountCheck>,
}

impl Default for DeviceRelay {
    fn default() -> Self {
        Self::new(Box::new(PathExists))
    }
}

impl DeviceRelay {
    pub fn new(mounts: Box<dyn MountCheck>) -> Self {
        DeviceRelay {
            devices: RwLock::new(BTreeMap::new()),
            subscribers: RwLock::new(Vec::new()),
            mounts,
        }
    }

    /// Register a callback for device events
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(callback));
    }

    fn publish(&self, event: DeviceEvent) {
        // Callbacks run without any relay lock held
        let subscribers: Vec<Subscriber> = self.subscribers.read().clone();
        for callback in subscribers {
            callback(&event);
        }
    }

    /// A device appeared. Re-attaching a known path replaces its record.
    pub fn on_device_attached(&self, device: DeviceInfo) {
        info!(
            path = ?device.filesystem_path,
            kind = ?device.device_type,
            vendor = %device.vendor,
            product = %device.product,
            "Device attached"
        );
        self.devices
            .write()
            .insert(device.filesystem_path.clone(), device.clone());
        self.publish(DeviceEvent::Attached(device));
    }

    pub fn on_device_detached(&self, path: &Path) -> Result<()> {
        let device = self
            .devices
            .write()
            .remove(path)
            .ok_or_else(|| Error::DeviceNotFound(path.display().to_string()))?;
        info!(path = ?path, "Device detached");
        self.publish(DeviceEvent::Detached(device));
        Ok(())
    }

    /// Drop devices whose mount has gone away without a detach notification
    pub fn filter_unconnected(&self) -> Vec<DeviceInfo> {
        let stale: Vec<DeviceInfo> = {
            let mut devices = self.devices.write();
            let gone: Vec<PathBuf> = devices
                .keys()
                .filter(|path| !self.mounts.is_mounted(path))
                .cloned()
                .collect();
            gone.iter().filter_map(|path| devices.remove(path)).collect()
        };

        for device in &stale {
            debug!(path = ?device.filesystem_path, "Dropping unconnected device");
            self.publish(DeviceEvent::Detached(device.clone()));
        }
        stale
    }

    /// Known devices ordered by path
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    struct FakeMounts(Arc<Mutex<HashSet<PathBuf>>>);

    impl MountCheck for FakeMounts {
        fn is_mounted(&self, path: &Path) -> bool {
            self.0.lock().contains(path)
        }
    }

    fn device(path: &str) -> DeviceInfo {
        DeviceInfo {
            device_type: DeviceType::Filesystem,
            is_extended: false,
            filesystem_path: PathBuf::from(path),
            vendor: "Acme".to_string(),
            product: "Stick".to_string(),
            device_id: format!("id-{}", path),
        }
    }

    #[test]
    fn test_attach_detach_events() {
        let relay = DeviceRelay::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        relay.subscribe(move |event| sink.lock().push(event.clone()));

        relay.on_device_attached(device("/media/a"));
        relay.on_device_attached(device("/media/b"));
        relay.on_device_detached(Path::new("/media/a")).unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], DeviceEvent::Detached(device("/media/a")));
        assert_eq!(relay.devices(), vec![device("/media/b")]);
    }

    #[test]
    fn test_detach_unknown() {
        let relay = DeviceRelay::default();
        assert!(matches!(
            relay.on_device_detached(Path::new("/nowhere")),
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_filter_unconnected() {
        let mounted = Arc::new(Mutex::new(HashSet::new()));
        mounted.lock().insert(PathBuf::from("/media/a"));
        let relay = DeviceRelay::new(Box::new(FakeMounts(Arc::clone(&mounted))));

        relay.on_device_attached(device("/media/a"));
        relay.on_device_attached(device("/media/b"));
        let dropped = relay.filter_unconnected();
        assert_eq!(dropped, vec![device("/media/b")]);
        assert_eq!(relay.devices(), vec![device("/media/a")]);
    }

    #[test]
    fn test_subscriber_may_query_relay() {
        let relay = Arc::new(DeviceRelay::default());
        let inner = Arc::clone(&relay);
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&counts);
        relay.subscribe(move |_| sink.lock().push(inner.devices().len()));

        relay.on_device_attached(device("/media/a"));
        assert_eq!(*counts.lock(), vec![1]);
    }
}
