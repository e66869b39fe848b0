// SPDX-License-Identifier: MIT
//! Monotonic counters, the tick session, and audit digest chaining
//! (spec §4.7).

use crate::error::{TpmError, TpmResult};
use tpm12_crypto::sha1;
use tpm12_proto::nv::{CounterValue, CurrentTicks};
use tpm12_proto::Digest;

/// Minimum number of ticks that must pass between two increments of the
/// same counter (spec §4.7 Open Question: counter rate limiting). One
/// tick is modeled as one call to `Tpm::tick()`, nominally a few
/// milliseconds of wall-clock time, so this bounds a counter to roughly
/// one increment per 5 seconds of real time.
pub const MIN_TICKS_BETWEEN_INCREMENTS: u64 = 5;

struct Counter {
    value: CounterValue,
    last_increment_tick: u64,
}

pub struct CounterBank {
    counters: std::collections::HashMap<u32, Counter>,
    next_label: u32,
    ticks: CurrentTicks,
    audit_digest: Digest,
    audited_ordinals: std::collections::HashSet<u32>,
}

impl Default for CounterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterBank {
    #[must_use]
    pub fn new() -> Self {
        CounterBank {
            counters: std::collections::HashMap::new(),
            next_label: 1,
            ticks: CurrentTicks {
                current_ticks: 0,
                tick_rate: 1,
                tick_nonce: [0u8; 20],
            },
            audit_digest: [0u8; 20],
            audited_ordinals: std::collections::HashSet::new(),
        }
    }

    /// `CreateCounter`. Returns the freshly allocated label.
    pub fn create_counter(&mut self, initial_value: u32) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        self.counters.insert(
            label,
            Counter {
                value: CounterValue {
                    label,
                    value: initial_value,
                },
                last_increment_tick: 0,
            },
        );
        label
    }

    /// `IncrementCounter`. Rejects an increment attempted before
    /// `MIN_TICKS_BETWEEN_INCREMENTS` ticks have elapsed since the last
    /// one, returning `TPM_RETRY` so a well-behaved caller backs off and
    /// retries (spec §7 "transient" classification).
    pub fn increment_counter(&mut self, label: u32) -> TpmResult<CounterValue> {
        let now = self.ticks.current_ticks;
        let counter = self
            .counters
            .get_mut(&label)
            .ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::BadCounter))?;
        if now.saturating_sub(counter.last_increment_tick) < MIN_TICKS_BETWEEN_INCREMENTS {
            return Err(TpmError::retry());
        }
        counter.value.value = counter.value.value.wrapping_add(1);
        counter.last_increment_tick = now;
        Ok(counter.value)
    }

    pub fn read_counter(&self, label: u32) -> TpmResult<CounterValue> {
        self.counters
            .get(&label)
            .map(|c| c.value)
            .ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::BadCounter))
    }

    pub fn release_counter(&mut self, label: u32) -> TpmResult<()> {
        self.counters
            .remove(&label)
            .map(|_| ())
            .ok_or_else(|| TpmError::Protocol(tpm12_proto::ResponseCode::BadCounter))
    }

    /// Advances the tick counter by one. Called once per command
    /// dispatch (spec §4.7, §9 "Clock").
    pub fn tick(&mut self) {
        self.ticks.current_ticks += 1;
    }

    #[must_use]
    pub fn read_current_ticks(&self) -> CurrentTicks {
        self.ticks
    }

    /// `SetOrdinalAuditStatus`: flags an ordinal as subject to audit
    /// digest chaining.
    pub fn set_ordinal_audit_status(&mut self, ordinal: u32, audited: bool) {
        if audited {
            self.audited_ordinals.insert(ordinal);
        } else {
            self.audited_ordinals.remove(&ordinal);
        }
    }

    #[must_use]
    pub fn ordinal_is_audited(&self, ordinal: u32) -> bool {
        self.audited_ordinals.contains(&ordinal)
    }

    /// Extends the running audit digest with one command/response pair:
    /// `auditDigest' = SHA1(auditDigest || SHA1(ordinal || inParamDigest)
    /// || SHA1(ordinal || outParamDigest))`, matching the construction
    /// `GetAuditDigestSigned` must be able to reproduce (spec §4.7).
    pub fn extend_audit(&mut self, ordinal: u32, in_param_digest: &Digest, out_param_digest: &Digest) {
        let mut in_preimage = Vec::with_capacity(24);
        in_preimage.extend_from_slice(&ordinal.to_be_bytes());
        in_preimage.extend_from_slice(in_param_digest);
        let in_digest = sha1(&in_preimage);

        let mut out_preimage = Vec::with_capacity(24);
        out_preimage.extend_from_slice(&ordinal.to_be_bytes());
        out_preimage.extend_from_slice(out_param_digest);
        let out_digest = sha1(&out_preimage);

        let mut preimage = Vec::with_capacity(60);
        preimage.extend_from_slice(&self.audit_digest);
        preimage.extend_from_slice(&in_digest);
        preimage.extend_from_slice(&out_digest);
        self.audit_digest = sha1(&preimage);
    }

    #[must_use]
    pub fn audit_digest(&self) -> Digest {
        self.audit_digest
    }

    /// `GetAuditDigestSigned(closeAudit=TRUE)`: clears the running digest
    /// once it has been signed off, so the next audited command starts a
    /// fresh chain.
    pub fn close_audit(&mut self) {
        self.audit_digest = [0u8; 20];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_is_rate_limited() {
        let mut bank = CounterBank::new();
        let label = bank.create_counter(0);
        assert!(bank.increment_counter(label).is_ok());
        assert_eq!(bank.increment_counter(label), Err(TpmError::retry()));
        for _ in 0..MIN_TICKS_BETWEEN_INCREMENTS {
            bank.tick();
        }
        assert!(bank.increment_counter(label).is_ok());
    }

    #[test]
    fn counter_value_is_monotonic() {
        let mut bank = CounterBank::new();
        let label = bank.create_counter(5);
        for _ in 0..MIN_TICKS_BETWEEN_INCREMENTS {
            bank.tick();
        }
        let updated = bank.increment_counter(label).unwrap();
        assert_eq!(updated.value, 6);
    }

    #[test]
    fn audit_digest_chains_deterministically() {
        let mut a = CounterBank::new();
        let mut b = CounterBank::new();
        a.extend_audit(0x16, &[1u8; 20], &[2u8; 20]);
        b.extend_audit(0x16, &[1u8; 20], &[2u8; 20]);
        assert_eq!(a.audit_digest(), b.audit_digest());
        a.extend_audit(0x17, &[3u8; 20], &[4u8; 20]);
        assert_ne!(a.audit_digest(), b.audit_digest());
    }
}
