//! Per-slot capability flags checked before every external operation.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Permission {
    Read,
    Push,
    Execute,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub read: bool,
    pub push: bool,
    pub execute: bool,
    pub clear: bool,
}

impl Default for PermissionSet {
    /// Reads are open; everything that changes slot state is denied.
    fn default() -> Self {
        Self {
            read: true,
            push: false,
            execute: false,
            clear: false,
        }
    }
}

impl PermissionSet {
    pub fn all() -> Self {
        Self {
            read: true,
            push: true,
            execute: true,
            clear: true,
        }
    }

    pub fn none() -> Self {
        Self {
            read: false,
            push: false,
            execute: false,
            clear: false,
        }
    }

    pub fn allows(self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Push => self.push,
            Permission::Execute => self.execute,
            Permission::Clear => self.clear,
        }
    }

    pub fn with(mut self, permission: Permission, allowed: bool) -> Self {
        match permission {
            Permission::Read => self.read = allowed,
            Permission::Push => self.push = allowed,
            Permission::Execute => self.execute = allowed,
            Permission::Clear => self.clear = allowed,
        }
        self
    }

    pub(crate) fn check(self, permission: Permission, address: &str) -> Result<()> {
        if self.allows(permission) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied {
                address: address.to_string(),
                permission,
            })
        }
    }
}

/// Named presets applied with `apply_permission_group`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionGroup {
    Default,
    Admin,
    Execute,
    #[strum(serialize = "readonly")]
    #[serde(rename = "readonly")]
    ReadOnly,
}

impl PermissionGroup {
    pub fn permissions(self) -> PermissionSet {
        match self {
            Self::Default => PermissionSet {
                push: true,
                ..PermissionSet::default()
            },
            Self::Admin => PermissionSet::all(),
            Self::Execute => PermissionSet {
                execute: true,
                ..PermissionSet::default()
            },
            Self::ReadOnly => PermissionSet::default(),
        }
    }
}
