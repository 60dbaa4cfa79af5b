use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A slot reference in either addressing scheme.
///
/// `slot-7` is the 1-based global index in row declaration order; `b3` is
/// row `b`, position 3. Both forms resolve to the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotAddress {
    Flat(usize),
    Grid { row: String, position: usize },
}

impl SlotAddress {
    pub fn flat(index: usize) -> Self {
        Self::Flat(index)
    }

    pub fn grid(row: impl Into<String>, position: usize) -> Self {
        Self::Grid {
            row: row.into(),
            position,
        }
    }
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat(index) => write!(f, "slot-{index}"),
            Self::Grid { row, position } => write!(f, "{row}{position}"),
        }
    }
}

impl FromStr for SlotAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let not_found = || CoreError::SlotNotFound {
            address: s.to_string(),
        };

        if let Some(index) = raw.strip_prefix("slot-") {
            let index: usize = index.parse().map_err(|_| not_found())?;
            if index == 0 {
                return Err(not_found());
            }
            return Ok(Self::Flat(index));
        }

        let split = raw
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(not_found)?;
        let (row, position) = raw.split_at(split);
        if row.is_empty() || !row.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(not_found());
        }
        let position: usize = position.parse().map_err(|_| not_found())?;
        if position == 0 {
            return Err(not_found());
        }
        Ok(Self::Grid {
            row: row.to_string(),
            position,
        })
    }
}
