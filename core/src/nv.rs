// SPDX-License-Identifier: MIT
//! NV storage: index definitions, permission enforcement, and the global
//! lock latch (spec §4.6).

use crate::error::{TpmError, TpmResult};
use crate::pcr::PcrEngine;
use std::collections::HashMap;
use tpm12_proto::nv::{NvAttributes, NvDataPublic};
use tpm12_proto::{Digest, Locality, NV_INDEX_LOCK};

struct NvIndex {
    public: NvDataPublic,
    data: Vec<u8>,
    write_defined: bool,
    auth: Digest,
}

/// NV storage. Defining index `0xFFFF_FFFF` with a zero size sets
/// `nv_locked`, after which no further `DefineSpace` succeeds until the
/// next `Startup(ST_CLEAR)` (spec §4.6 invariant).
pub struct NvStore {
    indices: HashMap<u32, NvIndex>,
    locked: bool,
}

impl Default for NvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NvStore {
    #[must_use]
    pub fn new() -> Self {
        NvStore {
            indices: HashMap::new(),
            locked: false,
        }
    }

    pub fn on_startup_clear(&mut self) {
        self.locked = false;
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// `NV_DefineSpace`. The sentinel index `NV_INDEX_LOCK` carries no
    /// storage of its own -- it only ever flips the lock latch.
    pub fn define_space(&mut self, public: NvDataPublic, area_auth: Digest) -> TpmResult<()> {
        if public.nv_index == NV_INDEX_LOCK {
            if public.data_size != 0 {
                return Err(TpmError::bad_parameter());
            }
            self.locked = true;
            return Ok(());
        }
        if self.locked {
            return Err(TpmError::Precondition(tpm12_proto::ResponseCode::AreaLocked));
        }
        if self.indices.contains_key(&public.nv_index) {
            // Redefining an existing index releases its previous contents.
            self.indices.remove(&public.nv_index);
        }
        let data_size = public.data_size as usize;
        self.indices.insert(
            public.nv_index,
            NvIndex {
                public,
                data: vec![0u8; data_size],
                write_defined: false,
                auth: area_auth,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn area_auth(&self, nv_index: u32) -> Option<Digest> {
        self.indices.get(&nv_index).map(|entry| entry.auth)
    }

    fn index(&self, nv_index: u32) -> TpmResult<&NvIndex> {
        self.indices.get(&nv_index).ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::BadIndex))
    }

    fn index_mut(&mut self, nv_index: u32) -> TpmResult<&mut NvIndex> {
        self.indices.get_mut(&nv_index).ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::BadIndex))
    }

    fn check_pcr_predicate(
        &self,
        predicate: &Option<tpm12_proto::pcr::PcrInfoShort>,
        pcr_engine: &PcrEngine,
        locality: Locality,
    ) -> TpmResult<()> {
        let Some(info) = predicate else { return Ok(()) };
        if locality.mask() & (1 << info.locality_at_release) == 0 {
            return Err(TpmError::bad_locality());
        }
        let actual = pcr_engine.composite(&info.pcr_selection);
        if actual != info.digest_at_release {
            return Err(TpmError::wrong_pcr_val());
        }
        Ok(())
    }

    /// `NV_WriteValue` / `NV_WriteValueAuth`, after the caller has already
    /// verified whichever auth session the index's permission bits
    /// require. `owner_authorized` distinguishes an owner-authorized
    /// write from one secured by the index's own auth (spec §4.6
    /// permission matrix).
    pub fn write_value(
        &mut self,
        nv_index: u32,
        offset: u32,
        data: &[u8],
        owner_authorized: bool,
        locality: Locality,
        pcr_engine: &PcrEngine,
    ) -> TpmResult<()> {
        let predicate = self.index(nv_index)?.public.pcr_info_write.clone();
        self.check_pcr_predicate(&predicate, pcr_engine, locality)?;
        let entry = self.index_mut(nv_index)?;
        let perm = entry.public.permission;
        if !owner_authorized && !perm.contains(NvAttributes::AuthWrite) && !perm.contains(NvAttributes::PpWrite) {
            return Err(TpmError::auth_fail());
        }
        if owner_authorized && !perm.contains(NvAttributes::OwnerWrite) && !perm.contains(NvAttributes::AuthWrite) {
            return Err(TpmError::auth_fail());
        }
        if entry.write_defined && (perm.contains(NvAttributes::WriteDefine) || perm.contains(NvAttributes::WriteAllWriteDefine)) {
            return Err(TpmError::Precondition(tpm12_proto::ResponseCode::AreaLocked));
        }
        let end = offset as usize + data.len();
        if end > entry.data.len() {
            return Err(TpmError::Protocol(tpm12_proto::ResponseCode::NotFullwrite));
        }
        entry.data[offset as usize..end].copy_from_slice(data);
        if perm.contains(NvAttributes::WriteDefine) || perm.contains(NvAttributes::WriteAllWriteDefine) {
            entry.write_defined = true;
        }
        Ok(())
    }

    /// `NV_ReadValue` / `NV_ReadValueAuth`.
    pub fn read_value(
        &self,
        nv_index: u32,
        offset: u32,
        len: u32,
        owner_authorized: bool,
        locality: Locality,
        pcr_engine: &PcrEngine,
    ) -> TpmResult<Vec<u8>> {
        let entry = self.index(nv_index)?;
        self.check_pcr_predicate(&entry.public.pcr_info_read, pcr_engine, locality)?;
        let perm = entry.public.permission;
        if !owner_authorized && !perm.contains(NvAttributes::AuthRead) && !perm.contains(NvAttributes::PpRead) {
            return Err(TpmError::auth_fail());
        }
        if owner_authorized && !perm.contains(NvAttributes::OwnerRead) && !perm.contains(NvAttributes::AuthRead) {
            return Err(TpmError::auth_fail());
        }
        let start = offset as usize;
        let end = start + len as usize;
        entry
            .data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(TpmError::bad_parameter)
    }

    #[must_use]
    pub fn get_public(&self, nv_index: u32) -> Option<&NvDataPublic> {
        self.indices.get(&nv_index).map(|e| &e.public)
    }

    /// Every currently defined index's public portion, area auth and
    /// contents, for `TPM_PERMANENT_DATA` persistence (spec §6.3).
    #[must_use]
    pub fn snapshot(&self) -> Vec<(NvDataPublic, Digest, Vec<u8>)> {
        self.indices
            .values()
            .map(|entry| (entry.public.clone(), entry.auth, entry.data.clone()))
            .collect()
    }

    /// Replaces the whole table with a snapshot taken by [`NvStore::snapshot`].
    /// Bypasses `define_space`'s validation: this data was already valid
    /// when it was saved.
    pub fn restore(&mut self, entries: Vec<(NvDataPublic, Digest, Vec<u8>)>) {
        self.indices.clear();
        self.locked = false;
        for (public, auth, data) in entries {
            self.indices.insert(
                public.nv_index,
                NvIndex {
                    public,
                    data,
                    write_defined: false,
                    auth,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm12_proto::pcr::PcrInfoShort;

    fn sample_public(index: u32, permission: NvAttributes, size: u32) -> NvDataPublic {
        NvDataPublic {
            nv_index: index,
            pcr_info_read: None,
            pcr_info_write: None,
            permission,
            data_size: size,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut nv = NvStore::new();
        nv.define_space(sample_public(1, NvAttributes::AuthWrite | NvAttributes::AuthRead, 16), [0u8; 20])
            .unwrap();
        let pcr = PcrEngine::new();
        nv.write_value(1, 0, b"hello world!", false, Locality(0), &pcr).unwrap();
        let read = nv.read_value(1, 0, 12, false, Locality(0), &pcr).unwrap();
        assert_eq!(read, b"hello world!");
    }

    #[test]
    fn global_lock_rejects_further_definitions() {
        let mut nv = NvStore::new();
        nv.define_space(sample_public(NV_INDEX_LOCK, NvAttributes::empty(), 0), [0u8; 20]).unwrap();
        assert!(nv.is_locked());
        let result = nv.define_space(sample_public(2, NvAttributes::AuthWrite, 8), [0u8; 20]);
        assert!(result.is_err());
    }

    #[test]
    fn write_define_latches_after_first_write() {
        let mut nv = NvStore::new();
        nv.define_space(sample_public(
            3,
            NvAttributes::AuthWrite | NvAttributes::AuthRead | NvAttributes::WriteDefine,
            4,
        ), [0u8; 20])
        .unwrap();
        let pcr = PcrEngine::new();
        nv.write_value(3, 0, b"abcd", false, Locality(0), &pcr).unwrap();
        let result = nv.write_value(3, 0, b"efgh", false, Locality(0), &pcr);
        assert!(result.is_err());
    }

    #[test]
    fn pcr_release_predicate_enforced_on_read() {
        let mut nv = NvStore::new();
        let mut public = sample_public(4, NvAttributes::AuthRead, 4);
        public.pcr_info_read = Some(PcrInfoShort {
            pcr_selection: tpm12_proto::pcr::PcrSelection::single(0),
            locality_at_release: 0,
            digest_at_release: [0xAA; 20],
        });
        nv.define_space(public, [0u8; 20]).unwrap();
        let pcr = PcrEngine::new();
        let result = nv.read_value(4, 0, 4, false, Locality(0), &pcr);
        assert_eq!(result, Err(TpmError::wrong_pcr_val()));
    }
}
