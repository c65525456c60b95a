//! Boundary data shapes
//! Byte sequences, string lists and handle lists as they cross the host
//! boundary, plus the advertisement-field layout with its "absent" sentinels.
//! All integers are little-endian; every length is a `u32`.
//!
//! Inside the crate everything is typed. These layouts are the byte ABI a
//! host adapter speaks: advertisements enter through
//! [`NativeEventSender::send_discovered`](crate::core::NativeEventSender::send_discovered),
//! and a host that cannot take Rust vectors receives handle lists as
//! [`HandleList`].

use thiserror::Error;

use crate::core::bt_uuid::BtUuid;
use crate::core::central::types::{AdvFields, ServiceData};
use crate::core::constants::{CONNECTABLE_ABSENT, TX_POWER_ABSENT};
use crate::core::handle::Handle;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("input truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid UUID string {0:?}")]
    InvalidUuid(String),
    #[error("service data has {uuids} UUIDs but {values} values")]
    LengthMismatch { uuids: usize, values: usize },
    #[error("connectable flag {0} is neither 0, 1 nor absent")]
    InvalidConnectable(i32),
}

fn take<'a>(input: &mut &'a [u8], needed: usize) -> Result<&'a [u8], MarshalError> {
    if input.len() < needed {
        return Err(MarshalError::Truncated {
            needed,
            remaining: input.len(),
        });
    }
    let (head, tail) = input.split_at(needed);
    *input = tail;
    Ok(head)
}

fn read_u32(input: &mut &[u8]) -> Result<u32, MarshalError> {
    let bytes = take(input, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u32).to_le_bytes());
}

/// Length-prefixed binary blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteSeq(pub Vec<u8>);

impl ByteSeq {
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_len(out, self.0.len());
        out.extend_from_slice(&self.0);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self, MarshalError> {
        let len = read_u32(input)? as usize;
        Ok(Self(take(input, len)?.to_vec()))
    }
}

/// Ordered list of strings, normally UUIDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringList(pub Vec<String>);

impl StringList {
    pub fn from_uuids(uuids: &[BtUuid]) -> Self {
        Self(uuids.iter().map(BtUuid::to_string).collect())
    }

    pub fn to_uuids(&self) -> Result<Vec<BtUuid>, MarshalError> {
        self.0
            .iter()
            .map(|s| s.parse().map_err(|_| MarshalError::InvalidUuid(s.clone())))
            .collect()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        write_len(out, self.0.len());
        for s in &self.0 {
            write_len(out, s.len());
            out.extend_from_slice(s.as_bytes());
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self, MarshalError> {
        let count = read_u32(input)? as usize;
        let mut strings = Vec::with_capacity(count.min(input.len()));
        for _ in 0..count {
            let len = read_u32(input)? as usize;
            let bytes = take(input, len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| MarshalError::InvalidUtf8)?;
            strings.push(s.to_string());
        }
        Ok(Self(strings))
    }
}

/// Ordered list of object handles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleList(pub Vec<Handle>);

impl HandleList {
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_len(out, self.0.len());
        for handle in &self.0 {
            out.extend_from_slice(&handle.to_raw().to_le_bytes());
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self, MarshalError> {
        let count = read_u32(input)? as usize;
        let mut handles = Vec::with_capacity(count.min(input.len() / 8));
        for _ in 0..count {
            let bytes = take(input, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            handles.push(Handle::from_raw(u64::from_le_bytes(raw)));
        }
        Ok(Self(handles))
    }
}

/// Advertisement fields in boundary form, with sentinels instead of options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvFieldsWire {
    pub name: Option<String>,
    pub manufacturer_data: ByteSeq,
    pub service_uuids: StringList,
    pub overflow_service_uuids: StringList,
    pub tx_power_level: i8,
    pub connectable: i32,
    pub service_data_uuids: StringList,
    pub service_data_values: Vec<ByteSeq>,
}

impl From<&AdvFields> for AdvFieldsWire {
    fn from(fields: &AdvFields) -> Self {
        Self {
            name: fields.local_name.clone(),
            manufacturer_data: ByteSeq(fields.manufacturer_data.clone()),
            service_uuids: StringList::from_uuids(&fields.service_uuids),
            overflow_service_uuids: StringList::from_uuids(&fields.overflow_service_uuids),
            tx_power_level: fields.tx_power_level.unwrap_or(TX_POWER_ABSENT),
            connectable: fields
                .connectable
                .map_or(CONNECTABLE_ABSENT, |connectable| connectable as i32),
            service_data_uuids: StringList(
                fields.service_data.iter().map(|sd| sd.uuid.to_string()).collect(),
            ),
            service_data_values: fields
                .service_data
                .iter()
                .map(|sd| ByteSeq(sd.data.clone()))
                .collect(),
        }
    }
}

impl TryFrom<AdvFieldsWire> for AdvFields {
    type Error = MarshalError;

    fn try_from(wire: AdvFieldsWire) -> Result<Self, Self::Error> {
        let uuids = wire.service_data_uuids.to_uuids()?;
        if uuids.len() != wire.service_data_values.len() {
            return Err(MarshalError::LengthMismatch {
                uuids: uuids.len(),
                values: wire.service_data_values.len(),
            });
        }
        let connectable = match wire.connectable {
            CONNECTABLE_ABSENT => None,
            0 => Some(false),
            1 => Some(true),
            other => return Err(MarshalError::InvalidConnectable(other)),
        };

        Ok(AdvFields {
            local_name: wire.name.filter(|name| !name.is_empty()),
            manufacturer_data: wire.manufacturer_data.0,
            service_uuids: wire.service_uuids.to_uuids()?,
            overflow_service_uuids: wire.overflow_service_uuids.to_uuids()?,
            tx_power_level: (wire.tx_power_level != TX_POWER_ABSENT).then_some(wire.tx_power_level),
            connectable,
            service_data: uuids
                .into_iter()
                .zip(wire.service_data_values)
                .map(|(uuid, data)| ServiceData { uuid, data: data.0 })
                .collect(),
        })
    }
}

impl AdvFieldsWire {
    /// Absent names are encoded as empty strings.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let name = self.name.as_deref().unwrap_or("");
        ByteSeq(name.as_bytes().to_vec()).encode(out);
        self.manufacturer_data.encode(out);
        self.service_uuids.encode(out);
        self.overflow_service_uuids.encode(out);
        out.push(self.tx_power_level as u8);
        out.extend_from_slice(&self.connectable.to_le_bytes());
        self.service_data_uuids.encode(out);
        write_len(out, self.service_data_values.len());
        for value in &self.service_data_values {
            value.encode(out);
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self, MarshalError> {
        let name = String::from_utf8(ByteSeq::decode(input)?.0).map_err(|_| MarshalError::InvalidUtf8)?;
        let manufacturer_data = ByteSeq::decode(input)?;
        let service_uuids = StringList::decode(input)?;
        let overflow_service_uuids = StringList::decode(input)?;
        let tx_power_level = take(input, 1)?[0] as i8;
        let connectable_bytes = take(input, 4)?;
        let connectable = i32::from_le_bytes([
            connectable_bytes[0],
            connectable_bytes[1],
            connectable_bytes[2],
            connectable_bytes[3],
        ]);
        let service_data_uuids = StringList::decode(input)?;
        let count = read_u32(input)? as usize;
        let mut service_data_values = Vec::with_capacity(count.min(input.len()));
        for _ in 0..count {
            service_data_values.push(ByteSeq::decode(input)?);
        }

        Ok(Self {
            name: (!name.is_empty()).then_some(name),
            manufacturer_data,
            service_uuids,
            overflow_service_uuids,
            tx_power_level,
            connectable,
            service_data_uuids,
            service_data_values,
        })
    }
}
