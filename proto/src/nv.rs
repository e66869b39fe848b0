// SPDX-License-Identifier: MIT
//! NV storage wire structures: per-index permission bits and the public
//! portion of an NV index's definition.

use crate::pcr::PcrInfoShort;
use crate::{decode_opaque, encode_opaque, Codec, CodecError, Digest};
use bitflags::bitflags;

bitflags! {
    /// `TPM_NV_PER_*` permission bits (spec §3 "NV index").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NvAttributes: u32 {
        const OwnerWrite = 0x0000_0002;
        const AuthWrite = 0x0000_0004;
        const PpWrite = 0x0000_0001;
        const GlobalLock = 0x8000_0000;
        const WriteAllWriteDefine = 0x0000_2000;
        const WriteDefine = 0x0000_1000;
        const WriteStClear = 0x0000_0800;
        const ReadStClear = 0x8000_0000 >> 1;
        const AuthRead = 0x0004_0000;
        const OwnerRead = 0x0002_0000;
        const PpRead = 0x0001_0000;
    }
}

/// `TPM_NV_DATA_PUBLIC`: everything about an NV index except its current
/// contents and area auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvDataPublic {
    pub nv_index: u32,
    pub pcr_info_read: Option<PcrInfoShort>,
    pub pcr_info_write: Option<PcrInfoShort>,
    pub permission: NvAttributes,
    pub data_size: u32,
}

impl Codec for NvDataPublic {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.nv_index.encode(buf);
        match &self.pcr_info_read {
            None => encode_opaque(&[], buf),
            Some(info) => {
                let mut inner = Vec::new();
                info.encode(&mut inner);
                encode_opaque(&inner, buf);
            }
        }
        match &self.pcr_info_write {
            None => encode_opaque(&[], buf),
            Some(info) => {
                let mut inner = Vec::new();
                info.encode(&mut inner);
                encode_opaque(&inner, buf);
            }
        }
        self.permission.bits().encode(buf);
        self.data_size.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (nv_index, buf) = u32::decode(buf)?;
        let (read_blob, buf) = decode_opaque(buf)?;
        let pcr_info_read = if read_blob.is_empty() {
            None
        } else {
            let (info, rest) = PcrInfoShort::decode(&read_blob)?;
            if !rest.is_empty() {
                return Err(CodecError::TrailingData);
            }
            Some(info)
        };
        let (write_blob, buf) = decode_opaque(buf)?;
        let pcr_info_write = if write_blob.is_empty() {
            None
        } else {
            let (info, rest) = PcrInfoShort::decode(&write_blob)?;
            if !rest.is_empty() {
                return Err(CodecError::TrailingData);
            }
            Some(info)
        };
        let (permission_raw, buf) = u32::decode(buf)?;
        let permission = NvAttributes::from_bits_truncate(permission_raw);
        let (data_size, buf) = u32::decode(buf)?;
        Ok((
            NvDataPublic {
                nv_index,
                pcr_info_read,
                pcr_info_write,
                permission,
                data_size,
            },
            buf,
        ))
    }
}

/// `TPM_DELEGATIONS`: `per1`/`per2` permission bitmasks attached to a
/// delegation row (spec §3 "Delegation family table").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegatePermissions {
    pub per1: u32,
    pub per2: u32,
}

impl Codec for DelegatePermissions {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.per1.encode(buf);
        self.per2.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (per1, buf) = u32::decode(buf)?;
        let (per2, buf) = u32::decode(buf)?;
        Ok((DelegatePermissions { per1, per2 }, buf))
    }
}

/// A counter's label plus its current 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    pub label: u32,
    pub value: u32,
}

impl Codec for CounterValue {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.label.encode(buf);
        self.value.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (label, buf) = u32::decode(buf)?;
        let (value, buf) = u32::decode(buf)?;
        Ok((CounterValue { label, value }, buf))
    }
}

/// `TPM_CURRENT_TICKS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentTicks {
    pub current_ticks: u64,
    pub tick_rate: u16,
    pub tick_nonce: Digest,
}

impl Codec for CurrentTicks {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend(self.current_ticks.to_be_bytes());
        self.tick_rate.encode(buf);
        self.tick_nonce.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (head, buf) = crate::split(buf, 8)?;
        let current_ticks = u64::from_be_bytes(head.try_into().unwrap());
        let (tick_rate, buf) = u16::decode(buf)?;
        let (tick_nonce, buf) = Digest::decode(buf)?;
        Ok((
            CurrentTicks {
                current_ticks,
                tick_rate,
                tick_nonce,
            },
            buf,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcr::PcrSelection;

    #[test]
    fn nv_data_public_round_trips() {
        let public = NvDataPublic {
            nv_index: 0x0000_0001,
            pcr_info_read: None,
            pcr_info_write: Some(PcrInfoShort {
                pcr_selection: PcrSelection::single(0),
                locality_at_release: 0,
                digest_at_release: [0u8; 20],
            }),
            permission: NvAttributes::OwnerWrite | NvAttributes::OwnerRead,
            data_size: 10,
        };
        let mut buf = Vec::new();
        public.encode(&mut buf);
        let (decoded, rest) = NvDataPublic::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, public);
    }

    #[test]
    fn counter_value_round_trips() {
        let value = CounterValue {
            label: 7,
            value: 42,
        };
        let mut buf = Vec::new();
        value.encode(&mut buf);
        let (decoded, rest) = CounterValue::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, value);
    }
}
