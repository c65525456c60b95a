//! Constants used throughout the bridge
//! Wire sentinels and well-known attribute UUIDs.

use crate::core::bt_uuid::BtUuid;

/// TX power level value meaning "not present in the advertisement".
pub const TX_POWER_ABSENT: i8 = -128;

/// Connectable flag value meaning "not present in the advertisement".
pub const CONNECTABLE_ABSENT: i32 = -1;

/// Standard Bluetooth Service UUIDs
pub const UUID_BATTERY_SERVICE: BtUuid = BtUuid::from_u16(0x180f);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_BATTERY_LEVEL: BtUuid = BtUuid::from_u16(0x2a19);

/// Default maximum payload of a single write on a fresh ATT link (MTU 23 minus header).
pub const DEFAULT_ATT_PAYLOAD: usize = 20;

/// Code carried by the synthetic error that ends links when the radio powers off.
pub const POWER_LOSS_ERROR_CODE: i64 = -1;
