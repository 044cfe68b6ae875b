//! Radio permission seam
//!
//! Mobile hosts must hold Bluetooth permissions before scanning or
//! advertising. The engine asks the host through `PermissionsProvider`
//! during `initialize()` and refuses to start without them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capabilities the engine needs from the host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Scan for advertising devices
    BluetoothScan,
    /// Advertise our own service
    BluetoothAdvertise,
    /// Open GATT links
    BluetoothConnect,
}

impl Permission {
    /// Everything the BLE transport uses
    pub const ALL: [Permission; 3] = [
        Permission::BluetoothScan,
        Permission::BluetoothAdvertise,
        Permission::BluetoothConnect,
    ];
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BluetoothScan => write!(f, "bluetooth-scan"),
            Self::BluetoothAdvertise => write!(f, "bluetooth-advertise"),
            Self::BluetoothConnect => write!(f, "bluetooth-connect"),
        }
    }
}

/// Host-side permission plumbing
pub trait PermissionsProvider: Send + Sync {
    /// Whether every required permission is currently held
    fn has_permissions(&self) -> bool;

    /// Prompt for the missing permissions; returns the outcome
    fn request(&self) -> bool;
}

/// Desktop hosts and simulators: nothing to ask for
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

impl PermissionsProvider for AlwaysGranted {
    fn has_permissions(&self) -> bool {
        true
    }

    fn request(&self) -> bool {
        true
    }
}

/// Fixed grant set, with the set a `request()` would grant
#[derive(Debug, Default)]
pub struct StaticPermissions {
    granted: Mutex<BTreeSet<Permission>>,
    grantable: BTreeSet<Permission>,
}

impl StaticPermissions {
    pub fn new(
        granted: impl IntoIterator<Item = Permission>,
        grantable: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            granted: Mutex::new(granted.into_iter().collect()),
            grantable: grantable.into_iter().collect(),
        }
    }

    /// Nothing granted, and the user declines every prompt
    pub fn denied() -> Self {
        Self::new([], [])
    }

    /// Permissions still missing
    pub fn missing(&self) -> Vec<Permission> {
        let granted = self.granted.lock();
        Permission::ALL
            .iter()
            .copied()
            .filter(|p| !granted.contains(p))
            .collect()
    }
}

impl PermissionsProvider for StaticPermissions {
    fn has_permissions(&self) -> bool {
        self.missing().is_empty()
    }

    fn request(&self) -> bool {
        let mut granted = self.granted.lock();
        for permission in Permission::ALL {
            if self.grantable.contains(&permission) {
                granted.insert(permission);
            }
        }
        Permission::ALL.iter().all(|p| granted.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_granted() {
        assert!(AlwaysGranted.has_permissions());
        assert!(AlwaysGranted.request());
    }

    #[test]
    fn test_request_grants_grantable() {
        let perms = StaticPermissions::new(
            [Permission::BluetoothScan],
            [Permission::BluetoothAdvertise, Permission::BluetoothConnect],
        );
        assert!(!perms.has_permissions());
        assert_eq!(perms.missing().len(), 2);

        assert!(perms.request());
        assert!(perms.has_permissions());
    }

    #[test]
    fn test_request_partially_declined() {
        let perms = StaticPermissions::new([], [Permission::BluetoothScan]);
        assert!(!perms.request());
        assert_eq!(
            perms.missing(),
            vec![Permission::BluetoothAdvertise, Permission::BluetoothConnect]
        );
    }

    #[test]
    fn test_denied() {
        let perms = StaticPermissions::denied();
        assert!(!perms.request());
        assert!(!perms.has_permissions());
    }

    #[test]
    fn test_permission_display() {
        assert_eq!(Permission::BluetoothScan.to_string(), "bluetooth-scan");
    }
}
