//! Bluetooth UUIDs
//! Attribute UUIDs may be 16-bit, 32-bit or 128-bit. Short forms are
//! expanded against the Bluetooth base UUID and printed back in their short
//! form, which is how the native stack spells them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// 0000xxxx-0000-1000-8000-00805f9b34fb
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const SHORT_MASK: u128 = 0xffff_ffff << 96;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid Bluetooth UUID: {0:?}")]
pub struct BtUuidParseError(pub String);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BtUuid(Uuid);

impl BtUuid {
    pub const fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    pub const fn from_u32(short: u32) -> Self {
        Self(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns the 32-bit alias when this UUID lives in the Bluetooth base range.
    pub fn as_u32(&self) -> Option<u32> {
        let value = self.0.as_u128();
        if value & !SHORT_MASK == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_u32().and_then(|short| u16::try_from(short).ok())
    }
}

impl From<Uuid> for BtUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<BtUuid> for Uuid {
    fn from(uuid: BtUuid) -> Self {
        uuid.0
    }
}

impl FromStr for BtUuid {
    type Err = BtUuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BtUuidParseError(s.to_string());
        match s.len() {
            4 => u16::from_str_radix(s, 16)
                .map(Self::from_u16)
                .map_err(|_| invalid()),
            8 => u32::from_str_radix(s, 16)
                .map(Self::from_u32)
                .map_err(|_| invalid()),
            36 => Uuid::parse_str(s).map(Self).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for BtUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.as_u16(), self.as_u32()) {
            (Some(short), _) => write!(f, "{:04x}", short),
            (None, Some(short)) => write!(f, "{:08x}", short),
            _ => write!(f, "{}", self.0.hyphenated()),
        }
    }
}

impl fmt::Debug for BtUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BtUuid({})", self)
    }
}

impl Serialize for BtUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BtUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
