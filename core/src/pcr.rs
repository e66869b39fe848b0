// SPDX-License-Identifier: MIT
//! PCR engine: 24 registers, extend/read/reset, and composite digests
//! (spec §4.4).

use crate::error::{TpmError, TpmResult};
use tpm12_crypto::sha1;
use tpm12_proto::pcr::{composite_preimage, PcrSelection, NUM_PCRS};
use tpm12_proto::{Digest, Locality};

/// Per-register reset policy: which localities may reset it, and whether
/// it may only be reset while the platform is in a "locked" (non-startup)
/// state.
#[derive(Debug, Clone, Copy)]
pub struct ResetPolicy {
    pub locality_mask: u8,
    pub resettable_only_when_locked: bool,
}

impl ResetPolicy {
    #[must_use]
    pub const fn never() -> Self {
        ResetPolicy {
            locality_mask: 0,
            resettable_only_when_locked: false,
        }
    }

    #[must_use]
    pub const fn from_locality_mask(mask: u8) -> Self {
        ResetPolicy {
            locality_mask: mask,
            resettable_only_when_locked: false,
        }
    }
}

pub struct PcrEngine {
    values: [Digest; NUM_PCRS],
    policies: [ResetPolicy; NUM_PCRS],
    locked: bool,
}

impl Default for PcrEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PcrEngine {
    /// PCRs 17-22 model the "debug" registers resettable from any
    /// locality; PCR 16 is resettable only from locality 4; everything
    /// else extend-only, matching the PC Client profile's typical policy
    /// (the general TPM 1.2 core spec leaves exact per-index policy to the
    /// platform profile).
    #[must_use]
    pub fn new() -> Self {
        let mut policies = [ResetPolicy::never(); NUM_PCRS];
        for policy in policies.iter_mut().take(23).skip(17) {
            *policy = ResetPolicy::from_locality_mask(0b1_1111);
        }
        policies[16] = ResetPolicy::from_locality_mask(1 << 4);
        PcrEngine {
            values: [[0u8; 20]; NUM_PCRS],
            policies,
            locked: false,
        }
    }

    pub fn extend(&mut self, index: usize, in_digest: &Digest) -> TpmResult<Digest> {
        let register = self.values.get_mut(index).ok_or_else(TpmError::bad_parameter)?;
        let mut preimage = Vec::with_capacity(40);
        preimage.extend_from_slice(register);
        preimage.extend_from_slice(in_digest);
        *register = sha1(&preimage);
        Ok(*register)
    }

    pub fn read(&self, index: usize) -> TpmResult<Digest> {
        self.values.get(index).copied().ok_or_else(TpmError::bad_parameter)
    }

    pub fn reset(&mut self, selection: &PcrSelection, locality: Locality) -> TpmResult<()> {
        for index in selection.indices() {
            let policy = self.policies.get(index).ok_or_else(TpmError::bad_parameter)?;
            if policy.locality_mask & locality.mask() == 0 {
                return Err(TpmError::bad_locality());
            }
            if policy.resettable_only_when_locked && !self.locked {
                return Err(TpmError::bad_locality());
            }
            self.values[index] = [0u8; 20];
        }
        Ok(())
    }

    #[must_use]
    pub fn composite(&self, selection: &PcrSelection) -> Digest {
        let values: Vec<Digest> = selection.indices().into_iter().map(|i| self.values[i]).collect();
        sha1(&composite_preimage(selection, &values))
    }

    /// Called on `Startup(ST_CLEAR)`: unlocks lock-only-resettable PCRs for
    /// this boot cycle.
    pub fn on_startup_clear(&mut self) {
        self.locked = false;
    }

    /// Loads register contents saved by `TPM_SaveState`, bypassing the
    /// extend-only/reset-only restrictions `extend`/`reset` enforce during
    /// normal operation -- a suspend/resume cycle restores exact values,
    /// it doesn't replay the extend chain that produced them.
    pub fn restore(&mut self, values: [Digest; NUM_PCRS]) {
        self.values = values;
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_matches_expected_digest() {
        let mut pcr = PcrEngine::new();
        let x = [1u8; 20];
        let y = [2u8; 20];
        pcr.extend(10, &x).unwrap();
        pcr.extend(10, &y).unwrap();
        let mut preimage1 = vec![0u8; 20];
        preimage1.extend_from_slice(&x);
        let expected_after_x = sha1(&preimage1);
        let mut preimage2 = expected_after_x.to_vec();
        preimage2.extend_from_slice(&y);
        let expected = sha1(&preimage2);
        assert_eq!(pcr.read(10).unwrap(), expected);
    }

    #[test]
    fn composite_matches_scenario_2() {
        let mut pcr = PcrEngine::new();
        pcr.extend(10, &[1u8; 20]).unwrap();
        pcr.extend(10, &[2u8; 20]).unwrap();
        let selection = PcrSelection::single(10);
        let composite = pcr.composite(&selection);
        let values = vec![pcr.read(10).unwrap()];
        let preimage = composite_preimage(&selection, &values);
        assert_eq!(composite, sha1(&preimage));
    }

    #[test]
    fn reset_rejected_outside_reset_locality() {
        let mut pcr = PcrEngine::new();
        let selection = PcrSelection::single(0);
        let result = pcr.reset(&selection, Locality(0));
        assert_eq!(result, Err(TpmError::bad_locality()));
    }
}
