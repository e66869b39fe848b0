// SPDX-License-Identifier: MIT
//! Key store: a finite key-slot table, parent-child key hierarchy, and the
//! migration and CMK pipelines (spec §4.3).

use crate::error::{TpmError, TpmResult};
use crate::pcr::PcrEngine;
use std::collections::HashMap;
use tpm12_crypto::{sha1, RsaKeyPair, RsaPublic};
use tpm12_proto::key::{AlgorithmId, Key12, StoreAsymkey};
use tpm12_proto::pcr::PcrInfo;
use tpm12_proto::{Codec, Digest, KeyFlags, EK_HANDLE, SRK_HANDLE};

/// Maximum number of transient (non-SRK/EK) loaded key slots
/// (`TPM_KEY_HANDLES`).
pub const MAX_KEY_SLOTS: usize = 8;

/// A loaded key: its public blob plus the decrypted private material, kept
/// only in volatile memory.
pub struct LoadedKey {
    pub blob: Key12,
    pub private: RsaKeyPair,
    pub usage_auth: Digest,
    pub migration_auth: Digest,
    pub owner_evict: bool,
    parent: u32,
}

pub struct KeyStore {
    slots: HashMap<u32, LoadedKey>,
    next_handle: u32,
    msa_list: Vec<Vec<u8>>,
}

/// `AuthorizeMigrationKey`/`CreateMigrationBlob`'s MIGRATE scheme
/// re-encrypts the key's plaintext directly under the destination public
/// key, with no random pad; REWRAP keeps the key under its original
/// parent but XORs the plaintext with a fresh pad first, and hands the
/// pad back to the caller as `rndBlob` so a later `ConvertMigrationBlob`
/// can strip it again (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationScheme {
    Migrate,
    Rewrap,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    #[must_use]
    pub fn new() -> Self {
        KeyStore {
            slots: HashMap::new(),
            next_handle: 0x8000_0001,
            msa_list: Vec::new(),
        }
    }

    fn alloc_transient_handle(&mut self) -> TpmResult<u32> {
        if self.slots.len() >= MAX_KEY_SLOTS {
            return Err(TpmError::no_space());
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(0x8000_0001);
        Ok(handle)
    }

    pub fn get(&self, handle: u32) -> TpmResult<&LoadedKey> {
        self.slots.get(&handle).ok_or_else(TpmError::invalid_key_handle)
    }

    /// Verifies the `TPM_STORE_ASYMKEY` integrity digest and any
    /// PCR-binding predicate, decrypts `encData` under the parent, and
    /// inserts the key into a fresh transient slot (spec §4.3
    /// `LoadKey2`).
    pub fn load_key2(
        &mut self,
        parent_handle: u32,
        blob: Key12,
        pcr_engine: &PcrEngine,
    ) -> TpmResult<u32> {
        let parent_private = match parent_handle {
            SRK_HANDLE | EK_HANDLE => self
                .get(parent_handle)
                .map(|k| &k.private)
                .map_err(|_| TpmError::no_srk())?,
            other => &self.get(other)?.private,
        };
        if let AlgorithmId::Rsa = blob.algorithm_parms.algorithm_id {
        } else {
            return Err(TpmError::bad_parameter());
        }
        let plaintext = parent_private
            .oaep_decrypt(&blob.enc_data)
            .map_err(|_| TpmError::Protocol(tpm12_proto::ResponseCode::Decrypterror))?;
        let (asym, remainder) =
            StoreAsymkey::decode(&plaintext).map_err(|_| TpmError::bad_parameter())?;
        if !remainder.is_empty() {
            return Err(TpmError::bad_parameter());
        }
        let expected_digest = sha1(&blob.pub_key);
        if expected_digest != asym.pub_data_digest {
            return Err(TpmError::Protocol(tpm12_proto::ResponseCode::Invalidkeyhandle));
        }
        self.verify_pcr_binding(&blob.pcr_info, pcr_engine)?;
        let private = reconstruct_rsa_private(&asym.priv_key, &blob.pub_key)?;
        let handle = self.alloc_transient_handle()?;
        self.slots.insert(
            handle,
            LoadedKey {
                blob,
                private,
                usage_auth: asym.usage_auth,
                migration_auth: asym.migration_auth,
                owner_evict: false,
                parent: parent_handle,
            },
        );
        Ok(handle)
    }

    fn verify_pcr_binding(&self, pcr_info: &PcrInfo, pcr_engine: &PcrEngine) -> TpmResult<()> {
        let Some(selection) = pcr_info.release_selection() else {
            return Ok(());
        };
        if selection.indices().is_empty() {
            return Ok(());
        }
        let expected = pcr_info.digest_at_release().ok_or_else(TpmError::bad_parameter)?;
        let actual = pcr_engine.composite(selection);
        if actual != *expected {
            return Err(TpmError::wrong_pcr_val());
        }
        if let PcrInfo::Long(long) = pcr_info {
            let creation_actual = pcr_engine.composite(&long.creation_pcr_selection);
            if creation_actual != long.digest_at_creation {
                return Err(TpmError::wrong_pcr_val());
            }
        }
        Ok(())
    }

    /// Generates a fresh RSA key pair, wraps its private half under the
    /// parent's public key with OAEP (label `"TCPA"`), and returns the
    /// encrypted blob the caller is expected to persist and later load
    /// with `load_key2` (spec §4.3 `CreateWrapKey`).
    pub fn create_wrap_key(
        &self,
        parent_handle: u32,
        bits: usize,
        usage: tpm12_proto::KeyUsage,
        flags: KeyFlags,
        usage_auth: Digest,
        migration_auth: Digest,
        pcr_info: PcrInfo,
    ) -> TpmResult<Key12> {
        let parent = self.get(parent_handle)?;
        let child = RsaKeyPair::generate(bits).map_err(|_| TpmError::bad_parameter())?;
        let pub_key = child.public().modulus_bytes();
        let priv_key = private_material_bytes(&child);
        let asym = StoreAsymkey {
            payload: 0x01,
            usage_auth,
            migration_auth,
            pub_data_digest: sha1(&pub_key),
            priv_key,
        };
        let mut plaintext = Vec::new();
        asym.encode(&mut plaintext);
        let enc_data = parent
            .private
            .public()
            .oaep_encrypt(&plaintext)
            .map_err(|_| TpmError::bad_parameter())?;
        Ok(Key12 {
            key_usage: usage,
            key_flags: flags,
            auth_data_usage: tpm12_proto::AuthDataUsage::Always,
            algorithm_parms: tpm12_proto::key::AlgorithmParms {
                algorithm_id: AlgorithmId::Rsa,
                enc_scheme: tpm12_proto::key::EncScheme::Oaep,
                sig_scheme: tpm12_proto::key::SigScheme::Pkcs1v15Sha1,
                rsa: tpm12_proto::key::RsaKeyParms {
                    key_length: bits as u32,
                    num_primes: 2,
                    exponent: vec![],
                },
            },
            pcr_info,
            pub_key,
            enc_data,
        })
    }

    #[must_use]
    pub fn get_pub_key(&self, handle: u32) -> Option<RsaPublic> {
        self.slots
            .get(&handle)
            .and_then(|k| RsaPublic::from_modulus(&k.blob.pub_key, None).ok())
    }

    pub fn evict_key(&mut self, handle: u32) -> TpmResult<()> {
        if handle == SRK_HANDLE {
            return Err(TpmError::bad_parameter());
        }
        self.slots.remove(&handle).ok_or_else(TpmError::invalid_key_handle)?;
        Ok(())
    }

    pub fn key_control_owner(&mut self, handle: u32, owner_evict: bool) -> TpmResult<()> {
        let key = self.slots.get_mut(&handle).ok_or_else(TpmError::invalid_key_handle)?;
        key.owner_evict = owner_evict;
        Ok(())
    }

    /// Inserts the SRK or EK at their fixed handles, bypassing the
    /// transient-slot capacity (spec §4.3 invariant).
    pub fn install_fixed(&mut self, handle: u32, blob: Key12, private: RsaKeyPair, auth: Digest) {
        self.slots.insert(
            handle,
            LoadedKey {
                blob,
                private,
                usage_auth: auth,
                migration_auth: [0u8; 20],
                owner_evict: false,
                parent: 0,
            },
        );
    }

    /// `AuthorizeMigrationKey`: the owner blesses one destination public
    /// key under one scheme, producing the `authBlob` `CreateMigrationBlob`
    /// must be presented with (spec §4.3). Not a secret -- it binds the
    /// scheme and destination together so a migration blob can't be
    /// replayed against a different destination or scheme than the owner
    /// approved.
    #[must_use]
    pub fn authorize_migration_key(scheme: MigrationScheme, destination: &RsaPublic) -> Digest {
        let mut preimage = vec![scheme as u8];
        preimage.extend_from_slice(&destination.modulus_bytes());
        sha1(&preimage)
    }

    /// `CreateMigrationBlob`: unwraps the key under its parent, checks it
    /// against the `authBlob` `authorize_migration_key` would have
    /// produced for this scheme and destination, and re-wraps it per
    /// `scheme`. Fails with a migration-specific error for a
    /// non-migratable key (spec §4.3, §8 quantified invariant).
    pub fn create_migration_blob(
        &self,
        key_handle: u32,
        scheme: MigrationScheme,
        auth_blob: &Digest,
        destination: &RsaPublic,
    ) -> TpmResult<(Vec<u8>, Vec<u8>)> {
        let key = self.get(key_handle)?;
        if !key.blob.key_flags.contains(KeyFlags::Migratable) {
            return Err(TpmError::bad_migration());
        }
        if Self::authorize_migration_key(scheme, destination) != *auth_blob {
            return Err(TpmError::bad_migration());
        }
        let parent = self.get(key.parent)?;
        let plaintext = parent
            .private
            .oaep_decrypt(&key.blob.enc_data)
            .map_err(|_| TpmError::bad_migration())?;
        match scheme {
            MigrationScheme::Migrate => {
                let migrated = destination.oaep_encrypt(&plaintext).map_err(|_| TpmError::bad_migration())?;
                Ok((Vec::new(), migrated))
            }
            MigrationScheme::Rewrap => {
                let mut pad = vec![0u8; plaintext.len()];
                tpm12_crypto::fill_random(&mut pad);
                let padded: Vec<u8> = plaintext.iter().zip(&pad).map(|(a, b)| a ^ b).collect();
                let migrated = parent
                    .private
                    .public()
                    .oaep_encrypt(&padded)
                    .map_err(|_| TpmError::bad_migration())?;
                Ok((pad, migrated))
            }
        }
    }

    /// Reverses `create_migration_blob` on the destination TPM: unwraps
    /// under `unwrap_handle`'s private key -- the destination's own loaded
    /// key for MIGRATE, the original parent for REWRAP -- undoes the
    /// REWRAP pad if present, then re-wraps under the new parent.
    pub fn convert_migration_blob(
        &self,
        unwrap_handle: u32,
        new_parent_handle: u32,
        scheme: MigrationScheme,
        rnd_blob: &[u8],
        migrated_blob: &[u8],
    ) -> TpmResult<Vec<u8>> {
        let unwrap_key = self.get(unwrap_handle)?;
        let plaintext = unwrap_key
            .private
            .oaep_decrypt(migrated_blob)
            .map_err(|_| TpmError::bad_migration())?;
        let plaintext = match scheme {
            MigrationScheme::Migrate => plaintext,
            MigrationScheme::Rewrap => {
                if rnd_blob.len() != plaintext.len() {
                    return Err(TpmError::bad_migration());
                }
                plaintext.iter().zip(rnd_blob).map(|(a, b)| a ^ b).collect()
            }
        };
        let new_parent = self.get(new_parent_handle)?;
        new_parent
            .private
            .public()
            .oaep_encrypt(&plaintext)
            .map_err(|_| TpmError::bad_migration())
    }

    /// `CMK_ApproveMA`: appends a migration selection authority's digest to
    /// the pre-approved list a CMK may migrate to (spec §4.3 last
    /// paragraph).
    pub fn cmk_approve_ma(&mut self, msa_digest: Vec<u8>) {
        self.msa_list.push(msa_digest);
    }

    /// `CMK_CreateTicket` / `CMK_CreateBlob` restriction check: the
    /// destination authority must already be on the MSA list.
    #[must_use]
    pub fn msa_is_approved(&self, msa_digest: &[u8]) -> bool {
        self.msa_list.iter().any(|entry| entry == msa_digest)
    }

    /// `CMK_CreateKey`: like `create_wrap_key`, but the new key is bound to
    /// a pre-approved migration selection authority instead of a
    /// caller-chosen migration auth, and flagged `MigrateAuthority` rather
    /// than plain `Migratable` -- only `cmk_create_blob`, not
    /// `create_migration_blob`, will ever touch it (spec §4.3 CMK
    /// pipeline).
    pub fn cmk_create_key(
        &self,
        parent_handle: u32,
        bits: usize,
        usage: tpm12_proto::KeyUsage,
        usage_auth: Digest,
        msa_digest: Digest,
    ) -> TpmResult<Key12> {
        if !self.msa_is_approved(&msa_digest) {
            return Err(TpmError::bad_migration());
        }
        self.create_wrap_key(
            parent_handle,
            bits,
            usage,
            KeyFlags::MigrateAuthority,
            usage_auth,
            msa_digest,
            PcrInfo::None,
        )
    }

    /// `CMK_CreateTicket`: re-proves a migration selection authority digest
    /// is still on the pre-approved MSA list, handing back a restriction
    /// ticket the caller must present unchanged to `cmk_create_blob`.
    pub fn cmk_create_ticket(&self, msa_digest: &Digest) -> TpmResult<Digest> {
        if !self.msa_is_approved(msa_digest) {
            return Err(TpmError::bad_migration());
        }
        Ok(sha1(msa_digest))
    }

    /// `CMK_CreateBlob`: migrates a CMK the same way `create_migration_blob`
    /// migrates a plain migratable key, gated on `MigrateAuthority` plus a
    /// matching restriction ticket instead of `Migratable` plus an
    /// `authBlob`.
    pub fn cmk_create_blob(
        &self,
        key_handle: u32,
        restriction_ticket: &Digest,
        destination: &RsaPublic,
    ) -> TpmResult<Vec<u8>> {
        let key = self.get(key_handle)?;
        if !key.blob.key_flags.contains(KeyFlags::MigrateAuthority) {
            return Err(TpmError::bad_migration());
        }
        if sha1(&key.migration_auth) != *restriction_ticket {
            return Err(TpmError::bad_migration());
        }
        let parent = self.get(key.parent)?;
        let plaintext = parent
            .private
            .oaep_decrypt(&key.blob.enc_data)
            .map_err(|_| TpmError::bad_migration())?;
        destination.oaep_encrypt(&plaintext).map_err(|_| TpmError::bad_migration())
    }

    /// `CMK_ConvertMigration`: reverses `cmk_create_blob` on the
    /// destination TPM, identical in shape to `convert_migration_blob`'s
    /// MIGRATE path.
    pub fn cmk_convert_migration(
        &self,
        destination_handle: u32,
        new_parent_handle: u32,
        migrated_blob: &[u8],
    ) -> TpmResult<Vec<u8>> {
        let destination_key = self.get(destination_handle)?;
        let plaintext = destination_key
            .private
            .oaep_decrypt(migrated_blob)
            .map_err(|_| TpmError::bad_migration())?;
        let new_parent = self.get(new_parent_handle)?;
        new_parent
            .private
            .public()
            .oaep_encrypt(&plaintext)
            .map_err(|_| TpmError::bad_migration())
    }
}

/// The TPM-private serialization format for an RSA private key inside
/// `TPM_STORE_ASYMKEY.privKey`: a PKCS#1 DER encoding of the private key,
/// which round-trips through `reconstruct_rsa_private` (the TCPA spec
/// leaves the exact private-blob encoding vendor-specific).
fn private_material_bytes(pair: &RsaKeyPair) -> Vec<u8> {
    pair.to_pkcs1_der().unwrap_or_default()
}

fn reconstruct_rsa_private(priv_key_bytes: &[u8], _pub_key: &[u8]) -> TpmResult<RsaKeyPair> {
    RsaKeyPair::from_pkcs1_der(priv_key_bytes).map_err(|_| TpmError::bad_parameter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm12_proto::{AuthDataUsage, KeyUsage};

    fn install_srk(store: &mut KeyStore) {
        let srk = RsaKeyPair::generate(1024).unwrap();
        let pub_key = srk.public().modulus_bytes();
        let blob = Key12 {
            key_usage: KeyUsage::Storage,
            key_flags: KeyFlags::empty(),
            auth_data_usage: AuthDataUsage::Always,
            algorithm_parms: tpm12_proto::key::AlgorithmParms {
                algorithm_id: AlgorithmId::Rsa,
                enc_scheme: tpm12_proto::key::EncScheme::Oaep,
                sig_scheme: tpm12_proto::key::SigScheme::None,
                rsa: tpm12_proto::key::RsaKeyParms {
                    key_length: 1024,
                    num_primes: 2,
                    exponent: vec![],
                },
            },
            pcr_info: PcrInfo::None,
            pub_key,
            enc_data: vec![],
        };
        store.install_fixed(SRK_HANDLE, blob, srk, [0u8; 20]);
    }

    #[test]
    fn wrap_then_load_round_trips() {
        let mut store = KeyStore::new();
        install_srk(&mut store);
        let pcr_engine = PcrEngine::new();
        let blob = store
            .create_wrap_key(
                SRK_HANDLE,
                1024,
                KeyUsage::Signing,
                KeyFlags::Migratable,
                [5u8; 20],
                [6u8; 20],
                PcrInfo::None,
            )
            .unwrap();
        let handle = store.load_key2(SRK_HANDLE, blob, &pcr_engine).unwrap();
        assert_eq!(store.get(handle).unwrap().usage_auth, [5u8; 20]);
    }

    #[test]
    fn load_key2_rejects_tampered_pub_digest() {
        let mut store = KeyStore::new();
        install_srk(&mut store);
        let pcr_engine = PcrEngine::new();
        let mut blob = store
            .create_wrap_key(
                SRK_HANDLE,
                1024,
                KeyUsage::Signing,
                KeyFlags::empty(),
                [1u8; 20],
                [2u8; 20],
                PcrInfo::None,
            )
            .unwrap();
        blob.pub_key[0] ^= 0xFF;
        assert!(store.load_key2(SRK_HANDLE, blob, &pcr_engine).is_err());
    }

    #[test]
    fn non_migratable_key_rejects_migration_blob_creation() {
        let mut store = KeyStore::new();
        install_srk(&mut store);
        let pcr_engine = PcrEngine::new();
        let blob = store
            .create_wrap_key(
                SRK_HANDLE,
                1024,
                KeyUsage::Signing,
                KeyFlags::empty(),
                [1u8; 20],
                [2u8; 20],
                PcrInfo::None,
            )
            .unwrap();
        let handle = store.load_key2(SRK_HANDLE, blob, &pcr_engine).unwrap();
        let destination = RsaKeyPair::generate(1024).unwrap().public();
        let auth_blob = KeyStore::authorize_migration_key(MigrationScheme::Migrate, &destination);
        assert_eq!(
            store.create_migration_blob(handle, MigrationScheme::Migrate, &auth_blob, &destination),
            Err(TpmError::bad_migration())
        );
    }

    #[test]
    fn migration_blob_round_trips_to_a_new_parent() {
        let mut store = KeyStore::new();
        install_srk(&mut store);
        let pcr_engine = PcrEngine::new();
        let blob = store
            .create_wrap_key(
                SRK_HANDLE,
                1024,
                KeyUsage::Signing,
                KeyFlags::Migratable,
                [1u8; 20],
                [2u8; 20],
                PcrInfo::None,
            )
            .unwrap();
        let handle = store.load_key2(SRK_HANDLE, blob, &pcr_engine).unwrap();

        let destination = RsaKeyPair::generate(1024).unwrap();
        let destination_handle = {
            let dest_blob = Key12 {
                key_usage: KeyUsage::Storage,
                key_flags: KeyFlags::empty(),
                auth_data_usage: AuthDataUsage::Always,
                algorithm_parms: tpm12_proto::key::AlgorithmParms {
                    algorithm_id: AlgorithmId::Rsa,
                    enc_scheme: tpm12_proto::key::EncScheme::Oaep,
                    sig_scheme: tpm12_proto::key::SigScheme::None,
                    rsa: tpm12_proto::key::RsaKeyParms {
                        key_length: 1024,
                        num_primes: 2,
                        exponent: vec![],
                    },
                },
                pcr_info: PcrInfo::None,
                pub_key: destination.public().modulus_bytes(),
                enc_data: vec![],
            };
            store.install_fixed(0x9000_0000, dest_blob, destination, [3u8; 20]);
            0x9000_0000
        };
        let destination_public = store.get_pub_key(destination_handle).unwrap();

        let auth_blob = KeyStore::authorize_migration_key(MigrationScheme::Migrate, &destination_public);
        let (rnd_blob, migrated) = store
            .create_migration_blob(handle, MigrationScheme::Migrate, &auth_blob, &destination_public)
            .unwrap();
        assert!(rnd_blob.is_empty());

        let converted = store
            .convert_migration_blob(destination_handle, SRK_HANDLE, MigrationScheme::Migrate, &rnd_blob, &migrated)
            .unwrap();
        assert!(!converted.is_empty());
    }

    #[test]
    fn cmk_create_blob_rejects_a_mismatched_ticket() {
        let mut store = KeyStore::new();
        install_srk(&mut store);
        let pcr_engine = PcrEngine::new();
        let msa_digest = [4u8; 20];
        store.cmk_approve_ma(msa_digest.to_vec());
        let blob = store
            .cmk_create_key(SRK_HANDLE, 1024, KeyUsage::Signing, [1u8; 20], msa_digest)
            .unwrap();
        let handle = store.load_key2(SRK_HANDLE, blob, &pcr_engine).unwrap();
        let destination = RsaKeyPair::generate(1024).unwrap().public();
        let wrong_ticket = [0u8; 20];
        assert_eq!(
            store.cmk_create_blob(handle, &wrong_ticket, &destination),
            Err(TpmError::bad_migration())
        );
        let ticket = store.cmk_create_ticket(&msa_digest).unwrap();
        assert!(store.cmk_create_blob(handle, &ticket, &destination).is_ok());
    }
}
