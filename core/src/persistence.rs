// SPDX-License-Identifier: MIT
//! Persistent, save-state and volatile blobs (spec §4.10).
//!
//! TPM 1.2 distinguishes three retention classes: data that survives every
//! power cycle (`TPM_PERMANENT_DATA`), data saved across `TPM_SaveState`
//! but cleared on a full `Startup(ST_CLEAR)` (`TPM_STCLEAR_DATA`), and data
//! that never survives a restart at all. Each persisted blob opens with a
//! 4-byte version tag; an unrecognized tag is a fatal error rather than a
//! best-effort parse; a partially-understood permanent-storage format is
//! worse than refusing to start.

use crate::error::{TpmError, TpmResult};
use tpm12_proto::nv::NvDataPublic;
use tpm12_proto::{Codec, Digest};

fn split(buf: &[u8], n: usize) -> TpmResult<(&[u8], &[u8])> {
    if buf.len() < n {
        return Err(TpmError::failed_self_test());
    }
    Ok(buf.split_at(n))
}

/// Version tag for `TPM_PERMANENT_DATA`.
pub const PERMANENT_TAG: u32 = 0x5450_4D31; // "TPM1"

/// Version tag for `TPM_STCLEAR_DATA` (save-state).
pub const SAVESTATE_TAG: u32 = 0x5453_4331; // "TSC1"

/// Everything that must survive a full power cycle: the owner auth, the
/// NV index table's public portions and contents, and delegation family
/// state. Key material is persisted separately by the key store (spec
/// §4.3) via the same blob so that a single `TPM_PERMANENT_DATA` write
/// captures the whole ownership state.
pub struct PermanentData {
    pub owner_auth: Option<Digest>,
    pub nv_indices: Vec<(NvDataPublic, Digest, Vec<u8>)>,
}

impl PermanentData {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        PERMANENT_TAG.encode(buf);
        match &self.owner_auth {
            None => buf.push(0),
            Some(auth) => {
                buf.push(1);
                auth.encode(buf);
            }
        }
        (self.nv_indices.len() as u32).encode(buf);
        for (public, area_auth, data) in &self.nv_indices {
            let mut inner = Vec::new();
            public.encode(&mut inner);
            (inner.len() as u32).encode(buf);
            buf.extend_from_slice(&inner);
            area_auth.encode(buf);
            (data.len() as u32).encode(buf);
            buf.extend_from_slice(data);
        }
    }

    pub fn decode(buf: &[u8]) -> TpmResult<Self> {
        let (tag, buf) = u32::decode(buf).map_err(|_| TpmError::failed_self_test())?;
        if tag != PERMANENT_TAG {
            return Err(TpmError::failed_self_test());
        }
        let (has_owner, mut buf) = u8::decode(buf).map_err(|_| TpmError::failed_self_test())?;
        let owner_auth = if has_owner != 0 {
            let (auth, rest) = Digest::decode(buf).map_err(|_| TpmError::failed_self_test())?;
            buf = rest;
            Some(auth)
        } else {
            None
        };
        let (count, mut buf) = u32::decode(buf).map_err(|_| TpmError::failed_self_test())?;
        let mut nv_indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (public_len, rest) = u32::decode(buf).map_err(|_| TpmError::failed_self_test())?;
            let (public_bytes, rest) = split(rest, public_len as usize).map_err(|_| TpmError::failed_self_test())?;
            let (public, remainder) = NvDataPublic::decode(public_bytes).map_err(|_| TpmError::failed_self_test())?;
            if !remainder.is_empty() {
                return Err(TpmError::failed_self_test());
            }
            let (area_auth, rest) = Digest::decode(rest).map_err(|_| TpmError::failed_self_test())?;
            let (data_len, rest) = u32::decode(rest).map_err(|_| TpmError::failed_self_test())?;
            let (data, rest) = split(rest, data_len as usize).map_err(|_| TpmError::failed_self_test())?;
            nv_indices.push((public, area_auth, data.to_vec()));
            buf = rest;
        }
        Ok(PermanentData {
            owner_auth,
            nv_indices,
        })
    }
}

/// Save-state data: the PCR values and NV write-define latches that
/// `TPM_SaveState` preserves across a suspend/resume cycle without a full
/// `Startup(ST_CLEAR)`.
pub struct SaveStateData {
    pub pcr_values: [Digest; tpm12_proto::pcr::NUM_PCRS],
}

impl SaveStateData {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        SAVESTATE_TAG.encode(buf);
        for value in &self.pcr_values {
            value.encode(buf);
        }
    }

    pub fn decode(buf: &[u8]) -> TpmResult<Self> {
        let (tag, mut buf) = u32::decode(buf).map_err(|_| TpmError::failed_self_test())?;
        if tag != SAVESTATE_TAG {
            return Err(TpmError::failed_self_test());
        }
        let mut pcr_values = [[0u8; 20]; tpm12_proto::pcr::NUM_PCRS];
        for slot in &mut pcr_values {
            let (value, rest) = Digest::decode(buf).map_err(|_| TpmError::failed_self_test())?;
            *slot = value;
            buf = rest;
        }
        Ok(SaveStateData { pcr_values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm12_proto::nv::NvAttributes;

    #[test]
    fn permanent_data_round_trips() {
        let data = PermanentData {
            owner_auth: Some([5u8; 20]),
            nv_indices: vec![(
                NvDataPublic {
                    nv_index: 1,
                    pcr_info_read: None,
                    pcr_info_write: None,
                    permission: NvAttributes::OwnerWrite,
                    data_size: 4,
                },
                [7u8; 20],
                vec![1, 2, 3, 4],
            )],
        };
        let mut buf = Vec::new();
        data.encode(&mut buf);
        let decoded = PermanentData::decode(&buf).unwrap();
        assert_eq!(decoded.owner_auth, data.owner_auth);
        assert_eq!(decoded.nv_indices.len(), 1);
        assert_eq!(decoded.nv_indices[0].1, [7u8; 20]);
        assert_eq!(decoded.nv_indices[0].2, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_version_tag_is_fatal() {
        let mut buf = Vec::new();
        0xFFFF_FFFFu32.encode(&mut buf);
        assert_eq!(PermanentData::decode(&buf), Err(TpmError::failed_self_test()));
    }

    #[test]
    fn savestate_round_trips() {
        let mut pcr_values = [[0u8; 20]; tpm12_proto::pcr::NUM_PCRS];
        pcr_values[5] = [9u8; 20];
        let data = SaveStateData { pcr_values };
        let mut buf = Vec::new();
        data.encode(&mut buf);
        let decoded = SaveStateData::decode(&buf).unwrap();
        assert_eq!(decoded.pcr_values, data.pcr_values);
    }
}
