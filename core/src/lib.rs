// SPDX-License-Identifier: MIT
#![deny(clippy::all)]

//! The TPM 1.2 command engine: session management, key storage, PCRs, NV
//! storage, counters, delegation, transport sessions and the ordinal
//! dispatcher that ties them together behind a single [`Tpm`] value.
//!
//! There is deliberately no global/static state anywhere in this crate
//! (spec §9 "Global state"): every subsystem lives as a field of `Tpm`, and
//! the only mutation entry point is [`Tpm::execute_command`]. A process
//! embedding this crate is free to run as many independent `Tpm` instances
//! as it likes, each with its own persistence path.

pub mod counter;
pub mod delegation;
pub mod dispatcher;
pub mod error;
pub mod keystore;
pub mod nv;
pub mod pcr;
pub mod persistence;
pub mod quote;
pub mod session;
pub mod transport_session;

use error::{TpmError, TpmResult};
use keystore::KeyStore;
use log::info;
use tpm12_crypto::RsaKeyPair;
use tpm12_proto::Digest;

/// Runtime state of the device as a whole, orthogonal to any one
/// subsystem: whether ownership has been taken, whether the physical
/// presence assertion is in force, and whether a prior self-test failed
/// hard enough to wedge every subsequent command (spec §4 intro,
/// §7 "Fatal").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalMode {
    /// Accepting commands normally.
    Ready,
    /// A fatal error (`TPM_FAILEDSELFTEST`, a corrupt persistence blob)
    /// was observed; every ordinal except `GetTestResult` now fails with
    /// the same code until the next restart.
    Wedged(tpm12_proto::ResponseCode),
}

/// The single aggregate TPM instance. Every piece of mutable device state
/// lives here; there is no other mutation point in this crate.
pub struct Tpm {
    pub pcr: pcr::PcrEngine,
    pub nv: nv::NvStore,
    pub counters: counter::CounterBank,
    pub delegation: delegation::DelegationTable,
    pub keys: KeyStore,
    pub sessions: session::SessionTable,
    pub owner_auth: Option<Digest>,
    pub owned: bool,
    mode: OperationalMode,
}

impl Tpm {
    /// Builds a freshly manufactured device: no owner, an Endorsement Key
    /// already burned in (as a real TPM ships from the factory), and every
    /// other subsystem at its power-on default.
    #[must_use]
    pub fn manufacture() -> Self {
        let mut keys = KeyStore::new();
        let ek = RsaKeyPair::generate(2048).unwrap_or_else(|_| {
            RsaKeyPair::generate(1024).expect("RSA key generation must succeed on a sane RNG")
        });
        let pub_key = ek.public().modulus_bytes();
        let ek_blob = tpm12_proto::key::Key12 {
            key_usage: tpm12_proto::KeyUsage::Identity,
            key_flags: tpm12_proto::KeyFlags::empty(),
            auth_data_usage: tpm12_proto::AuthDataUsage::Never,
            algorithm_parms: tpm12_proto::key::AlgorithmParms {
                algorithm_id: tpm12_proto::key::AlgorithmId::Rsa,
                enc_scheme: tpm12_proto::key::EncScheme::Oaep,
                sig_scheme: tpm12_proto::key::SigScheme::None,
                rsa: tpm12_proto::key::RsaKeyParms {
                    key_length: 2048,
                    num_primes: 2,
                    exponent: vec![],
                },
            },
            pcr_info: tpm12_proto::pcr::PcrInfo::None,
            pub_key,
            enc_data: vec![],
        };
        keys.install_fixed(tpm12_proto::EK_HANDLE, ek_blob, ek, [0u8; 20]);
        info!("TPM manufactured: endorsement key installed at {:#010x}", tpm12_proto::EK_HANDLE);
        Tpm {
            pcr: pcr::PcrEngine::new(),
            nv: nv::NvStore::new(),
            counters: counter::CounterBank::new(),
            delegation: delegation::DelegationTable::new(),
            keys,
            sessions: session::SessionTable::new(),
            owner_auth: None,
            owned: false,
            mode: OperationalMode::Ready,
        }
    }

    /// `TPM_Startup(TPM_ST_CLEAR)`: resets every volatile subsystem
    /// without disturbing ownership, NV contents, or key material.
    pub fn startup_clear(&mut self) {
        self.pcr.on_startup_clear();
        self.nv.on_startup_clear();
        self.sessions = session::SessionTable::new();
        info!("TPM_Startup(ST_CLEAR)");
    }

    /// Marks the device permanently unable to process further commands
    /// until the next restart (spec §7 "Fatal" classification).
    pub fn wedge(&mut self, code: tpm12_proto::ResponseCode) {
        self.mode = OperationalMode::Wedged(code);
    }

    #[must_use]
    pub fn mode(&self) -> OperationalMode {
        self.mode
    }

    fn require_ready(&self) -> TpmResult<()> {
        match self.mode {
            OperationalMode::Ready => Ok(()),
            OperationalMode::Wedged(code) => Err(TpmError::Fatal(code)),
        }
    }

    /// `TPM_TakeOwnership`: installs the owner auth and generates a fresh
    /// Storage Root Key. Simplified relative to the wire protocol's
    /// EK-wrapped wire encoding -- the dispatcher layer is responsible for
    /// unwrapping the caller's OAEP-encrypted auth values under the EK
    /// before calling this (spec §4.3 "Ownership").
    pub fn take_ownership(&mut self, owner_auth: Digest, srk_auth: Digest) -> TpmResult<()> {
        self.require_ready()?;
        if self.owned {
            return Err(TpmError::Protocol(tpm12_proto::ResponseCode::Owner));
        }
        let srk = RsaKeyPair::generate(2048)
            .or_else(|_| RsaKeyPair::generate(1024))
            .map_err(|_| TpmError::bad_parameter())?;
        let pub_key = srk.public().modulus_bytes();
        let srk_blob = tpm12_proto::key::Key12 {
            key_usage: tpm12_proto::KeyUsage::Storage,
            key_flags: tpm12_proto::KeyFlags::empty(),
            auth_data_usage: tpm12_proto::AuthDataUsage::Always,
            algorithm_parms: tpm12_proto::key::AlgorithmParms {
                algorithm_id: tpm12_proto::key::AlgorithmId::Rsa,
                enc_scheme: tpm12_proto::key::EncScheme::Oaep,
                sig_scheme: tpm12_proto::key::SigScheme::None,
                rsa: tpm12_proto::key::RsaKeyParms {
                    key_length: 2048,
                    num_primes: 2,
                    exponent: vec![],
                },
            },
            pcr_info: tpm12_proto::pcr::PcrInfo::None,
            pub_key,
            enc_data: vec![],
        };
        self.keys.install_fixed(tpm12_proto::SRK_HANDLE, srk_blob, srk, srk_auth);
        self.owner_auth = Some(owner_auth);
        self.owned = true;
        info!("ownership taken, SRK installed at {:#010x}", tpm12_proto::SRK_HANDLE);
        Ok(())
    }

    /// Decodes, dispatches and encodes one command/response round trip.
    /// The only mutation entry point into this crate (spec §9 "Global
    /// state") -- callers never reach into individual subsystems directly.
    pub fn execute_command(&mut self, bytes: &[u8]) -> Vec<u8> {
        dispatcher::execute_command(self, bytes)
    }

    /// Captures ownership and NV state for `TPM_PERMANENT_DATA` persistence
    /// (spec §6.3). Key material is deliberately excluded: `KeyStore` keeps
    /// loaded private keys in volatile memory only (spec §4.3), so a
    /// restart always starts from a fresh EK and requires `TakeOwnership`
    /// again before any SRK-dependent command will work.
    #[must_use]
    pub fn export_permanent_data(&self) -> persistence::PermanentData {
        persistence::PermanentData {
            owner_auth: self.owner_auth,
            nv_indices: self.nv.snapshot(),
        }
    }

    /// Restores ownership and NV state captured by
    /// [`Tpm::export_permanent_data`] into a freshly manufactured device.
    pub fn restore_permanent_data(&mut self, data: persistence::PermanentData) {
        self.owned = data.owner_auth.is_some();
        self.owner_auth = data.owner_auth;
        self.nv.restore(data.nv_indices);
    }

    /// Captures the `TPM_SaveState` blob: PCR register contents, the only
    /// state that survives a suspend/resume cycle without a full
    /// `Startup(ST_CLEAR)`.
    #[must_use]
    pub fn export_save_state(&self) -> persistence::SaveStateData {
        let mut pcr_values = [[0u8; 20]; tpm12_proto::pcr::NUM_PCRS];
        for (i, slot) in pcr_values.iter_mut().enumerate() {
            *slot = self.pcr.read(i).unwrap_or([0u8; 20]);
        }
        persistence::SaveStateData { pcr_values }
    }

    /// Restores PCR register contents captured by
    /// [`Tpm::export_save_state`].
    pub fn restore_save_state(&mut self, data: persistence::SaveStateData) {
        self.pcr.restore(data.pcr_values);
    }

    /// Resolves the long-lived auth secret for an entity addressed by an
    /// auth trailer, used by the dispatcher before calling into
    /// `SessionTable::authorize` (spec §4.1, §4.2).
    pub fn entity_auth(&self, entity: session::BoundEntity) -> TpmResult<Digest> {
        use tpm12_proto::EntityType;
        match entity.entity_type {
            EntityType::Owner | EntityType::KeyOwner | EntityType::NvOwner | EntityType::CounterOwner => {
                self.owner_auth.ok_or_else(TpmError::no_srk)
            }
            EntityType::Srk => Ok(self.keys.get(tpm12_proto::SRK_HANDLE)?.usage_auth),
            EntityType::Keyhandle => Ok(self.keys.get(entity.entity_value)?.usage_auth),
            EntityType::Nv => self.nv.area_auth(entity.entity_value).ok_or_else(TpmError::bad_parameter),
            EntityType::Data | EntityType::Counter | EntityType::Delegate => Err(TpmError::bad_parameter()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manufactured_tpm_has_an_endorsement_key_but_no_owner() {
        let tpm = Tpm::manufacture();
        assert!(!tpm.owned);
        assert!(tpm.keys.get(tpm12_proto::EK_HANDLE).is_ok());
    }

    #[test]
    fn taking_ownership_twice_fails() {
        let mut tpm = Tpm::manufacture();
        tpm.take_ownership([1u8; 20], [2u8; 20]).unwrap();
        assert_eq!(
            tpm.take_ownership([1u8; 20], [2u8; 20]),
            Err(TpmError::Protocol(tpm12_proto::ResponseCode::Owner))
        );
    }

    #[test]
    fn wedged_tpm_rejects_ownership() {
        let mut tpm = Tpm::manufacture();
        tpm.wedge(tpm12_proto::ResponseCode::FailedSelfTest);
        assert_eq!(
            tpm.take_ownership([1u8; 20], [2u8; 20]),
            Err(TpmError::Fatal(tpm12_proto::ResponseCode::FailedSelfTest))
        );
    }

    #[test]
    fn permanent_data_round_trips_across_a_fresh_manufacture() {
        let mut tpm = Tpm::manufacture();
        tpm.take_ownership([3u8; 20], [4u8; 20]).unwrap();
        tpm.nv
            .define_space(
                tpm12_proto::nv::NvDataPublic {
                    nv_index: 0x1000_0002,
                    pcr_info_read: None,
                    pcr_info_write: None,
                    permission: tpm12_proto::nv::NvAttributes::OwnerWrite,
                    data_size: 4,
                },
                [5u8; 20],
            )
            .unwrap();
        {
            let Tpm { nv, pcr, .. } = &mut tpm;
            nv.write_value(0x1000_0002, 0, &[1, 2, 3, 4], true, tpm12_proto::Locality(0), pcr).unwrap();
        }

        let exported = tpm.export_permanent_data();
        let mut restored = Tpm::manufacture();
        restored.restore_permanent_data(exported);

        assert!(restored.owned);
        assert_eq!(restored.owner_auth, Some([3u8; 20]));
        assert_eq!(restored.nv.get_public(0x1000_0002).unwrap().data_size, 4);
        let Tpm { nv, pcr, .. } = &restored;
        assert_eq!(
            nv.read_value(0x1000_0002, 0, 4, true, tpm12_proto::Locality(0), pcr).unwrap(),
            vec![1, 2, 3, 4]
        );
    }
}
