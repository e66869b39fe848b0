// SPDX-License-Identifier: MIT
//! Delegation family and row tables (spec §4.8).

use crate::error::{TpmError, TpmResult};
use std::collections::HashMap;
use tpm12_proto::nv::DelegatePermissions;
use tpm12_proto::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyState {
    Enabled,
    Disabled,
    Invalid,
}

pub struct Family {
    pub state: FamilyState,
    pub verification_count: u32,
    /// Admin bit flipped by `Delegate_Manage(ADMIN)`, independent of
    /// `state` (spec §4.8).
    pub admin: bool,
}

pub struct DelegateRow {
    pub family_id: u32,
    pub permissions: DelegatePermissions,
    pub label: u8,
    pub verification_count: u32,
    /// Digest binding this row to the blob the caller presented at
    /// `Delegate_VerifyAuth`, computed as
    /// `HMAC(delegateAuth, permissions || label || familyID)` at
    /// creation time.
    pub verification_digest: Digest,
    /// `Some(keyHandle)` for a `Delegate_CreateKeyDelegation` row, `None`
    /// for an owner-delegation row. Key-delegation rows are not gated by
    /// a family's enable/disable/invalidate/verification-count state --
    /// there is no family for them to belong to (spec §4.8).
    pub bound_key: Option<u32>,
}

/// Owner and key delegation: families gate whole groups of rows, and
/// `UpdateVerification` lets the owner invalidate every row in a family by
/// bumping its verification count without walking the row table (spec
/// §4.8 "Verification count").
pub struct DelegationTable {
    families: HashMap<u32, Family>,
    rows: HashMap<u32, DelegateRow>,
    next_family_id: u32,
    next_row_index: u32,
}

impl Default for DelegationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DelegationTable {
    #[must_use]
    pub fn new() -> Self {
        DelegationTable {
            families: HashMap::new(),
            rows: HashMap::new(),
            next_family_id: 1,
            next_row_index: 1,
        }
    }

    /// `Delegate_Manage(CREATE)`.
    pub fn manage_create(&mut self) -> u32 {
        let id = self.next_family_id;
        self.next_family_id += 1;
        self.families.insert(
            id,
            Family {
                state: FamilyState::Enabled,
                verification_count: 0,
                admin: false,
            },
        );
        id
    }

    /// `Delegate_Manage(ENABLE)`.
    pub fn manage_enable(&mut self, family_id: u32, enabled: bool) -> TpmResult<()> {
        let family = self.family_mut(family_id)?;
        if family.state == FamilyState::Invalid {
            return Err(TpmError::Protocol(tpm12_proto::ResponseCode::Invalidfamily));
        }
        family.state = if enabled {
            FamilyState::Enabled
        } else {
            FamilyState::Disabled
        };
        Ok(())
    }

    /// `Delegate_Manage(INVALIDATE)`: permanently invalidates the family.
    /// Once invalid it can never be re-enabled (spec §4.8 invariant).
    pub fn manage_invalidate(&mut self, family_id: u32) -> TpmResult<()> {
        let family = self.family_mut(family_id)?;
        family.state = FamilyState::Invalid;
        Ok(())
    }

    /// `Delegate_Manage(ADMIN)`: flips the family's admin bit, a capability
    /// flag kept separate from `state` so toggling it never interacts with
    /// enable/disable/invalidate. Returns the bit's new value.
    pub fn manage_admin(&mut self, family_id: u32) -> TpmResult<bool> {
        let family = self.family_mut(family_id)?;
        family.admin = !family.admin;
        Ok(family.admin)
    }

    fn family_mut(&mut self, family_id: u32) -> TpmResult<&mut Family> {
        self.families
            .get_mut(&family_id)
            .ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::Invalidfamily))
    }

    /// `Delegate_CreateOwnerDelegation` / `Delegate_CreateKeyDelegation`.
    /// Stores a new row bound to the family's current verification
    /// count, and returns the row index the caller should hand back on
    /// `Delegate_VerifyAuth`.
    pub fn create_row(
        &mut self,
        family_id: u32,
        permissions: DelegatePermissions,
        label: u8,
        verification_digest: Digest,
    ) -> TpmResult<u32> {
        let family = self
            .families
            .get(&family_id)
            .ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::Invalidfamily))?;
        if family.state != FamilyState::Enabled {
            return Err(TpmError::Protocol(tpm12_proto::ResponseCode::DelegateFamily));
        }
        let index = self.next_row_index;
        self.next_row_index += 1;
        self.rows.insert(
            index,
            DelegateRow {
                family_id,
                permissions,
                label,
                verification_count: family.verification_count,
                verification_digest,
                bound_key: None,
            },
        );
        Ok(index)
    }

    /// `Delegate_CreateKeyDelegation`: same row bookkeeping as
    /// `create_row`, but bound to a key handle rather than a family, so
    /// there is no enabled/verification-count gate to satisfy up front.
    pub fn create_key_row(
        &mut self,
        key_handle: u32,
        permissions: DelegatePermissions,
        label: u8,
        verification_digest: Digest,
    ) -> u32 {
        let index = self.next_row_index;
        self.next_row_index += 1;
        self.rows.insert(
            index,
            DelegateRow {
                family_id: 0,
                permissions,
                label,
                verification_count: 0,
                verification_digest,
                bound_key: Some(key_handle),
            },
        );
        index
    }

    /// `Delegate_LoadOwnerDelegation`: reinstalls a previously exported row
    /// at a host-chosen row index. This engine keeps the whole delegation
    /// table resident rather than letting rows travel to another TPM, so
    /// "loading" a blob means re-inserting its fields rather than
    /// decrypting them (see DESIGN.md).
    pub fn load_owner_delegation(
        &mut self,
        row_index: u32,
        family_id: u32,
        permissions: DelegatePermissions,
        label: u8,
        verification_count: u32,
        verification_digest: Digest,
    ) -> TpmResult<()> {
        if !self.families.contains_key(&family_id) {
            return Err(TpmError::Protocol(tpm12_proto::ResponseCode::Invalidfamily));
        }
        self.rows.insert(
            row_index,
            DelegateRow {
                family_id,
                permissions,
                label,
                verification_count,
                verification_digest,
                bound_key: None,
            },
        );
        self.next_row_index = self.next_row_index.max(row_index + 1);
        Ok(())
    }

    /// `Delegate_ReadTable`: a snapshot of every family and row, in
    /// ascending key order so the response is deterministic.
    pub fn read_table(&self) -> (Vec<(u32, &Family)>, Vec<(u32, &DelegateRow)>) {
        let mut families: Vec<_> = self.families.iter().map(|(id, family)| (*id, family)).collect();
        families.sort_by_key(|(id, _)| *id);
        let mut rows: Vec<_> = self.rows.iter().map(|(index, row)| (*index, row)).collect();
        rows.sort_by_key(|(index, _)| *index);
        (families, rows)
    }

    /// `Delegate_UpdateVerification`: bumps the family's verification
    /// count, which invalidates every row created against the old count
    /// without mutating the rows themselves.
    pub fn update_verification(&mut self, family_id: u32) -> TpmResult<u32> {
        let family = self.family_mut(family_id)?;
        family.verification_count += 1;
        Ok(family.verification_count)
    }

    /// The row's verification digest, used as the DSAP shared-secret seed
    /// when a caller opens a delegated session against it (spec §4.2
    /// DSAP, §4.8).
    pub fn row_secret(&self, row_index: u32) -> TpmResult<Digest> {
        self.rows
            .get(&row_index)
            .map(|row| row.verification_digest)
            .ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::BadDelegate))
    }

    /// `Delegate_VerifyAuth`: a row authorizes a command only if its
    /// family is enabled and its stamped verification count still
    /// matches the family's current one.
    pub fn verify_auth(&self, row_index: u32, presented_digest: &Digest) -> TpmResult<&DelegateRow> {
        let row = self
            .rows
            .get(&row_index)
            .ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::BadDelegate))?;
        if row.bound_key.is_none() {
            let family = self
                .families
                .get(&row.family_id)
                .ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::Invalidfamily))?;
            if family.state != FamilyState::Enabled {
                return Err(TpmError::Protocol(tpm12_proto::ResponseCode::DelegateFamily));
            }
            if row.verification_count != family.verification_count {
                return Err(TpmError::Protocol(tpm12_proto::ResponseCode::DelegateLock));
            }
        }
        if &row.verification_digest != presented_digest {
            return Err(TpmError::auth_fail());
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_permissions() -> DelegatePermissions {
        DelegatePermissions { per1: 0x1, per2: 0x0 }
    }

    #[test]
    fn row_created_against_current_verification_count_authorizes() {
        let mut table = DelegationTable::new();
        let family = table.manage_create();
        let digest = [9u8; 20];
        let row = table.create_row(family, sample_permissions(), 1, digest).unwrap();
        assert!(table.verify_auth(row, &digest).is_ok());
    }

    #[test]
    fn update_verification_invalidates_existing_rows() {
        let mut table = DelegationTable::new();
        let family = table.manage_create();
        let digest = [9u8; 20];
        let row = table.create_row(family, sample_permissions(), 1, digest).unwrap();
        table.update_verification(family).unwrap();
        let result = table.verify_auth(row, &digest);
        assert_eq!(result.err(), Some(TpmError::Protocol(tpm12_proto::ResponseCode::DelegateLock)));
    }

    #[test]
    fn invalidated_family_rejects_new_rows() {
        let mut table = DelegationTable::new();
        let family = table.manage_create();
        table.manage_invalidate(family).unwrap();
        let result = table.create_row(family, sample_permissions(), 1, [0u8; 20]);
        assert!(result.is_err());
        assert_eq!(table.manage_enable(family, true), Err(TpmError::Protocol(tpm12_proto::ResponseCode::Invalidfamily)));
    }
}
