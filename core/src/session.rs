// SPDX-License-Identifier: MIT
//! Session manager: OIAP, OSAP, DSAP and transport sessions, plus the
//! consecutive-auth-failure lockout timer (spec §3, §4.2, §9 "session
//! lockout policy").

use crate::error::{TpmError, TpmResult};
use log::{debug, warn};
use tpm12_crypto::{hmac_sha1, random_nonce};
use tpm12_proto::{Digest, EntityType};

/// Maximum concurrent auth (OIAP/OSAP/DSAP) sessions (spec §3
/// `TPM_MIN_AUTH_SESSIONS`).
pub const MAX_AUTH_SESSIONS: usize = 3;

/// Maximum concurrent transport sessions (spec §3 `TPM_MIN_TRANS_SESSIONS`).
pub const MAX_TRANSPORT_SESSIONS: usize = 2;

/// Consecutive `AuthFail` responses before lockout engages (spec §9 open
/// question, resolved: N = 3).
pub const LOCKOUT_THRESHOLD: u32 = 3;

/// Number of commands in the sliding window used to count consecutive
/// failures (spec §9 open question, resolved policy).
pub const LOCKOUT_WINDOW_COMMANDS: u32 = 10;

/// Cooldown, in "ticks" (one per command dispatched while locked out),
/// before the lockout clears on its own.
pub const LOCKOUT_COOLDOWN_TICKS: u32 = 60;

/// What kind of entity a session's shared secret is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundEntity {
    pub entity_type: EntityType,
    pub entity_value: u32,
}

/// One open authorization or transport session.
#[derive(Debug, Clone)]
pub enum Session {
    Oiap {
        nonce_even: Digest,
    },
    Osap {
        nonce_even: Digest,
        nonce_even_osap: Digest,
        shared_secret: Digest,
        entity: BoundEntity,
    },
    Dsap {
        nonce_even: Digest,
        shared_secret: Digest,
        row_index: u32,
    },
    Transport {
        nonce_even: Digest,
        session_key: [u8; 16],
        digest: Digest,
        encrypt: bool,
    },
}

impl Session {
    #[must_use]
    pub fn nonce_even(&self) -> Digest {
        match self {
            Session::Oiap { nonce_even }
            | Session::Osap { nonce_even, .. }
            | Session::Dsap { nonce_even, .. }
            | Session::Transport { nonce_even, .. } => *nonce_even,
        }
    }

    fn refresh_nonce(&mut self) -> Digest {
        let fresh = random_nonce();
        match self {
            Session::Oiap { nonce_even }
            | Session::Osap { nonce_even, .. }
            | Session::Dsap { nonce_even, .. }
            | Session::Transport { nonce_even, .. } => *nonce_even = fresh,
        }
        fresh
    }

    /// Resolves the shared secret this session authorizes with, given the
    /// long-lived auth of the entity the *current command* addresses. For
    /// OIAP, any entity's auth may be supplied by the caller (it is
    /// object-independent); for OSAP/DSAP the session is bound to one
    /// entity at Open time and using it against another fails (spec §4.2,
    /// §8 scenario 4).
    fn resolve_secret(&self, entity: BoundEntity, entity_auth: &Digest) -> TpmResult<Digest> {
        match self {
            Session::Oiap { .. } => Ok(*entity_auth),
            Session::Osap {
                shared_secret,
                entity: bound,
                ..
            } => {
                if *bound != entity {
                    return Err(TpmError::auth_fail());
                }
                Ok(*shared_secret)
            }
            Session::Dsap { shared_secret, .. } => Ok(*shared_secret),
            Session::Transport { .. } => Err(TpmError::bad_parameter()),
        }
    }
}

/// A slot in the session table: the session itself plus an LRU stamp used
/// for eviction when the table is full (spec §4.2 "Session eviction").
struct Slot {
    handle: u32,
    session: Session,
    last_used: u64,
}

/// Fixed-capacity, LRU-evicting table of open sessions.
#[derive(Default)]
pub struct SessionTable {
    auth_slots: Vec<Slot>,
    transport_slots: Vec<Slot>,
    next_handle: u32,
    clock: u64,
    consecutive_auth_failures: u32,
    commands_since_first_failure: u32,
    lockout_ticks_remaining: u32,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        SessionTable {
            auth_slots: Vec::new(),
            transport_slots: Vec::new(),
            next_handle: 0x0000_0001,
            clock: 0,
            consecutive_auth_failures: 0,
            commands_since_first_failure: 0,
            lockout_ticks_remaining: 0,
        }
    }

    fn alloc_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        handle
    }

    fn open(&mut self, session: Session, transport: bool) -> TpmResult<u32> {
        let (slots, cap) = if transport {
            (&mut self.transport_slots, MAX_TRANSPORT_SESSIONS)
        } else {
            (&mut self.auth_slots, MAX_AUTH_SESSIONS)
        };
        if slots.len() >= cap {
            // Evict least-recently-used rather than refuse outright.
            if let Some(lru_index) = slots
                .iter()
                .enumerate()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(index, _)| index)
            {
                let evicted = slots.remove(lru_index);
                debug!("session table full, evicting handle {:#010x}", evicted.handle);
            } else {
                return Err(TpmError::resources());
            }
        }
        let handle = self.alloc_handle();
        self.clock += 1;
        slots.push(Slot {
            handle,
            session,
            last_used: self.clock,
        });
        Ok(handle)
    }

    pub fn oiap_open(&mut self) -> TpmResult<(u32, Digest)> {
        let nonce_even = random_nonce();
        let handle = self.open(Session::Oiap { nonce_even }, false)?;
        Ok((handle, nonce_even))
    }

    pub fn osap_open(
        &mut self,
        entity: BoundEntity,
        entity_auth: &Digest,
        nonce_odd_osap: &Digest,
    ) -> TpmResult<(u32, Digest, Digest)> {
        let nonce_even = random_nonce();
        let nonce_even_osap = random_nonce();
        let shared_secret = hmac_sha1(
            entity_auth,
            &[nonce_even_osap.as_slice(), nonce_odd_osap.as_slice()].concat(),
        );
        let handle = self.open(
            Session::Osap {
                nonce_even,
                nonce_even_osap,
                shared_secret,
                entity,
            },
            false,
        )?;
        Ok((handle, nonce_even, nonce_even_osap))
    }

    pub fn dsap_open(
        &mut self,
        row_index: u32,
        row_auth: &Digest,
        nonce_odd_dsap: &Digest,
    ) -> TpmResult<(u32, Digest)> {
        let nonce_even = random_nonce();
        let shared_secret = hmac_sha1(row_auth, nonce_odd_dsap);
        let handle = self.open(
            Session::Dsap {
                nonce_even,
                shared_secret,
                row_index,
            },
            false,
        )?;
        Ok((handle, nonce_even))
    }

    pub fn transport_open(&mut self, session_key: [u8; 16], encrypt: bool) -> TpmResult<(u32, Digest)> {
        let nonce_even = random_nonce();
        let handle = self.open(
            Session::Transport {
                nonce_even,
                session_key,
                digest: [0u8; 20],
                encrypt,
            },
            true,
        )?;
        Ok((handle, nonce_even))
    }

    fn find_mut(&mut self, handle: u32) -> Option<&mut Slot> {
        self.auth_slots
            .iter_mut()
            .chain(self.transport_slots.iter_mut())
            .find(|slot| slot.handle == handle)
    }

    #[must_use]
    pub fn get(&self, handle: u32) -> Option<&Session> {
        self.auth_slots
            .iter()
            .chain(self.transport_slots.iter())
            .find(|slot| slot.handle == handle)
            .map(|slot| &slot.session)
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut Session> {
        self.find_mut(handle).map(|slot| &mut slot.session)
    }

    pub fn touch(&mut self, handle: u32) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(slot) = self.find_mut(handle) {
            slot.last_used = clock;
        }
    }

    pub fn flush_specific(&mut self, handle: u32) {
        self.auth_slots.retain(|slot| slot.handle != handle);
        self.transport_slots.retain(|slot| slot.handle != handle);
    }

    /// Verifies an inbound command HMAC for `handle` against `entity`'s
    /// long-lived auth, rotates the session's even nonce, and destroys the
    /// session if `continue_auth_session` is false (spec §4.1, §4.2).
    /// Returns the session's fresh even nonce and the shared secret it
    /// authorized with, so the caller can construct the matching outbound
    /// HMAC once the command's output parameters are known.
    #[allow(clippy::too_many_arguments)]
    pub fn authorize(
        &mut self,
        handle: u32,
        entity: BoundEntity,
        entity_auth: &Digest,
        h1: &Digest,
        nonce_odd: &Digest,
        continue_auth_session: bool,
        auth: &Digest,
    ) -> TpmResult<(Digest, Digest)> {
        if self.is_locked_out() {
            return Err(TpmError::defend_lock_running());
        }
        let nonce_even = self
            .get(handle)
            .ok_or_else(TpmError::auth_fail)?
            .nonce_even();
        let secret = self
            .get(handle)
            .ok_or_else(TpmError::auth_fail)?
            .resolve_secret(entity, entity_auth)?;
        let expected = tpm12_crypto::hmac_sha1(
            &secret,
            &[
                h1.as_slice(),
                nonce_even.as_slice(),
                nonce_odd.as_slice(),
                &[u8::from(continue_auth_session)],
            ]
            .concat(),
        );
        if expected != *auth {
            self.record_auth_failure();
            if !continue_auth_session {
                self.flush_specific(handle);
            }
            return Err(TpmError::auth_fail());
        }
        self.record_auth_success();
        let fresh = if let Some(session) = self.get_mut(handle) {
            session.refresh_nonce()
        } else {
            return Err(TpmError::auth_fail());
        };
        if !continue_auth_session {
            self.flush_specific(handle);
        } else {
            self.touch(handle);
        }
        Ok((fresh, secret))
    }

    fn record_auth_failure(&mut self) {
        self.consecutive_auth_failures += 1;
        self.commands_since_first_failure = 0;
        if self.consecutive_auth_failures >= LOCKOUT_THRESHOLD {
            warn!(
                "dictionary-attack threshold reached ({} consecutive auth failures), engaging lockout",
                self.consecutive_auth_failures
            );
            self.lockout_ticks_remaining = LOCKOUT_COOLDOWN_TICKS;
        }
    }

    fn record_auth_success(&mut self) {
        self.consecutive_auth_failures = 0;
        self.commands_since_first_failure = 0;
    }

    /// Called once per dispatched command to age the failure window and
    /// the lockout cooldown.
    pub fn tick(&mut self) {
        if self.lockout_ticks_remaining > 0 {
            self.lockout_ticks_remaining -= 1;
        } else if self.consecutive_auth_failures > 0 {
            self.commands_since_first_failure += 1;
            if self.commands_since_first_failure >= LOCKOUT_WINDOW_COMMANDS {
                self.consecutive_auth_failures = 0;
                self.commands_since_first_failure = 0;
            }
        }
    }

    #[must_use]
    pub fn is_locked_out(&self) -> bool {
        self.lockout_ticks_remaining > 0
    }

    /// `TPM_ResetLockValue` under owner auth.
    pub fn reset_lock_value(&mut self) {
        self.consecutive_auth_failures = 0;
        self.commands_since_first_failure = 0;
        self.lockout_ticks_remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oiap_round_trip_auth_succeeds() {
        let mut table = SessionTable::new();
        let (handle, nonce_even) = table.oiap_open().unwrap();
        let entity_auth = [5u8; 20];
        let h1 = [1u8; 20];
        let nonce_odd = random_nonce();
        let entity = BoundEntity {
            entity_type: EntityType::Keyhandle,
            entity_value: 7,
        };
        let auth = hmac_sha1(
            &entity_auth,
            &[h1.as_slice(), nonce_even.as_slice(), nonce_odd.as_slice(), &[1]].concat(),
        );
        let result = table.authorize(handle, entity, &entity_auth, &h1, &nonce_odd, true, &auth);
        assert!(result.is_ok());
        assert_eq!(result.unwrap().1, entity_auth);
    }

    #[test]
    fn flipping_a_bit_of_auth_fails() {
        let mut table = SessionTable::new();
        let (handle, nonce_even) = table.oiap_open().unwrap();
        let entity_auth = [5u8; 20];
        let h1 = [1u8; 20];
        let nonce_odd = random_nonce();
        let entity = BoundEntity {
            entity_type: EntityType::Keyhandle,
            entity_value: 7,
        };
        let mut auth = hmac_sha1(
            &entity_auth,
            &[h1.as_slice(), nonce_even.as_slice(), nonce_odd.as_slice(), &[1]].concat(),
        );
        auth[0] ^= 0x01;
        let result = table.authorize(handle, entity, &entity_auth, &h1, &nonce_odd, true, &auth);
        assert_eq!(result, Err(TpmError::auth_fail()));
    }

    #[test]
    fn osap_used_for_wrong_entity_fails() {
        let mut table = SessionTable::new();
        let entity = BoundEntity {
            entity_type: EntityType::Keyhandle,
            entity_value: 0x1111,
        };
        let other_entity = BoundEntity {
            entity_type: EntityType::Keyhandle,
            entity_value: 0x2222,
        };
        let entity_auth = [3u8; 20];
        let nonce_odd_osap = random_nonce();
        let (handle, nonce_even, _even_osap) = table
            .osap_open(entity, &entity_auth, &nonce_odd_osap)
            .unwrap();
        let h1 = [1u8; 20];
        let nonce_odd = random_nonce();
        let auth = [0u8; 20];
        let _ = nonce_even;
        let result = table.authorize(handle, other_entity, &entity_auth, &h1, &nonce_odd, true, &auth);
        assert_eq!(result, Err(TpmError::auth_fail()));
    }

    #[test]
    fn lockout_engages_after_threshold_failures() {
        let mut table = SessionTable::new();
        let entity = BoundEntity {
            entity_type: EntityType::Keyhandle,
            entity_value: 1,
        };
        let entity_auth = [5u8; 20];
        for _ in 0..LOCKOUT_THRESHOLD {
            let (handle, _) = table.oiap_open().unwrap();
            let h1 = [1u8; 20];
            let nonce_odd = random_nonce();
            let bad_auth = [0xFFu8; 20];
            let _ = table.authorize(handle, entity, &entity_auth, &h1, &nonce_odd, false, &bad_auth);
        }
        assert!(table.is_locked_out());
        let (handle, nonce_even) = table.oiap_open().unwrap();
        let h1 = [1u8; 20];
        let nonce_odd = random_nonce();
        let auth = hmac_sha1(
            &entity_auth,
            &[h1.as_slice(), nonce_even.as_slice(), nonce_odd.as_slice(), &[1]].concat(),
        );
        let result = table.authorize(handle, entity, &entity_auth, &h1, &nonce_odd, true, &auth);
        assert_eq!(result, Err(TpmError::defend_lock_running()));
    }
}
