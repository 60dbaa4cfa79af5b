//! Slot lifecycle notifications for observers (UI, tests, persistence).

use serde::Serialize;

use crate::ids::{RequestId, UnitId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SlotEvent {
    Committed {
        address: String,
        unit_id: UnitId,
        version: u64,
    },
    Released {
        address: String,
        unit_id: UnitId,
    },
    HotSwapped {
        address: String,
        unit_id: UnitId,
        from_version: u64,
        to_version: u64,
        loaded: bool,
    },
    Executed {
        address: String,
        unit_id: UnitId,
        request_id: RequestId,
        version: u64,
        success: bool,
        duration_ms: u64,
    },
}

impl SlotEvent {
    pub fn address(&self) -> &str {
        match self {
            Self::Committed { address, .. }
            | Self::Released { address, .. }
            | Self::HotSwapped { address, .. }
            | Self::Executed { address, .. } => address,
        }
    }
}
