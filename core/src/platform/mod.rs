//! Platform integration seams
//!
//! Hosts (mobile apps, desktop shells, the CLI) plug in here:
//! - Permission checks before the radio is touched

pub mod permissions;

pub use permissions::{AlwaysGranted, Permission, PermissionsProvider, StaticPermissions};
