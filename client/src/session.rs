// SPDX-License-Identifier: MIT
//! Host-side mirror of the session HMAC construction in
//! `tpm12_core::dispatcher` (spec §4.1, §4.2, §4.10 step 3): the same
//! `H1`/`H2` digests, the same nonce/continue-flag folding, computed here
//! instead of on the device so the two sides agree without either one
//! trusting the other.

use crate::error::{ClientError, ClientResult};
use log::warn;
use tpm12_crypto::{hmac_sha1, random_nonce, sha1};
use tpm12_proto::{AuthTrailer, Digest, ResponseAuthTrailer, ResponseCode};

/// An open OIAP/OSAP/DSAP session as seen from the host: just enough state
/// to keep building inbound HMACs and verifying outbound ones. The secret
/// itself is supplied by the caller on every use rather than cached here --
/// for OIAP it is whichever entity's auth the command addresses this time,
/// for OSAP/DSAP it is the secret derived once at `Open` (spec §4.2).
pub struct AuthSession {
    handle: u32,
    nonce_even: Digest,
    pending_nonce_odd: Digest,
}

impl AuthSession {
    #[must_use]
    pub fn new(handle: u32, nonce_even: Digest) -> Self {
        AuthSession {
            handle,
            nonce_even,
            pending_nonce_odd: [0u8; 20],
        }
    }

    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Builds the auth trailer for one command, generating a fresh odd
    /// nonce via the CSPRNG and remembering it for the matching
    /// `verify_response` call.
    pub fn begin_command(&mut self, ordinal: u32, params: &[u8], continue_session: bool, secret: &Digest) -> AuthTrailer {
        let nonce_odd = random_nonce();
        self.pending_nonce_odd = nonce_odd;
        let h1 = h1_digest(ordinal, params);
        let auth = hmac_sha1(
            secret,
            &[
                h1.as_slice(),
                self.nonce_even.as_slice(),
                nonce_odd.as_slice(),
                &[u8::from(continue_session)],
            ]
            .concat(),
        );
        AuthTrailer {
            session_handle: self.handle,
            nonce_odd,
            continue_auth_session: continue_session,
            auth,
        }
    }

    /// Verifies the response trailer against the same secret, then rotates
    /// the session's even nonce forward. Fails closed: a mismatched HMAC
    /// never updates `nonce_even`, so a tampered response cannot desync a
    /// session that the caller goes on to reuse.
    pub fn verify_response(
        &mut self,
        ordinal: u32,
        return_code: ResponseCode,
        out_params: &[u8],
        secret: &Digest,
        trailer: &ResponseAuthTrailer,
    ) -> ClientResult<()> {
        let h2 = h2_digest(return_code, ordinal, out_params);
        let expected = hmac_sha1(
            secret,
            &[
                h2.as_slice(),
                trailer.nonce_even.as_slice(),
                self.pending_nonce_odd.as_slice(),
                &[u8::from(trailer.continue_auth_session)],
            ]
            .concat(),
        );
        if expected != trailer.auth {
            warn!("response auth HMAC mismatch on session {}, ordinal {ordinal:#04x}", self.handle);
            return Err(ClientError::AuthTampered);
        }
        self.nonce_even = trailer.nonce_even;
        Ok(())
    }
}

pub(crate) fn h1_digest(ordinal: u32, params: &[u8]) -> Digest {
    let mut preimage = Vec::with_capacity(4 + params.len());
    preimage.extend_from_slice(&ordinal.to_be_bytes());
    preimage.extend_from_slice(params);
    sha1(&preimage)
}

pub(crate) fn h2_digest(return_code: ResponseCode, ordinal: u32, out_params: &[u8]) -> Digest {
    let mut preimage = Vec::with_capacity(8 + out_params.len());
    preimage.extend_from_slice(&(return_code as u32).to_be_bytes());
    preimage.extend_from_slice(&ordinal.to_be_bytes());
    preimage.extend_from_slice(out_params);
    sha1(&preimage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_command_and_verify_response_round_trip() {
        let mut session = AuthSession::new(7, [1u8; 20]);
        let secret = [9u8; 20];
        let params = [0u8, 1, 2, 3];
        let trailer = session.begin_command(0x14, &params, true, &secret);

        // Mirror the device side: it sees the same H1 and builds H2 from
        // whatever output parameters the command produced.
        let out_params = [0xAAu8; 4];
        let h2 = h2_digest(ResponseCode::Success, 0x14, &out_params);
        let fresh_nonce_even = [2u8; 20];
        let auth = hmac_sha1(
            &secret,
            &[
                h2.as_slice(),
                fresh_nonce_even.as_slice(),
                trailer.nonce_odd.as_slice(),
                &[1],
            ]
            .concat(),
        );
        let response_trailer = ResponseAuthTrailer {
            nonce_even: fresh_nonce_even,
            continue_auth_session: true,
            auth,
        };
        assert!(session
            .verify_response(0x14, ResponseCode::Success, &out_params, &secret, &response_trailer)
            .is_ok());
    }

    #[test]
    fn tampered_response_auth_is_rejected() {
        let mut session = AuthSession::new(7, [1u8; 20]);
        let secret = [9u8; 20];
        let trailer = session.begin_command(0x14, &[], true, &secret);
        let response_trailer = ResponseAuthTrailer {
            nonce_even: [2u8; 20],
            continue_auth_session: true,
            auth: [0u8; 20],
        };
        let _ = trailer;
        assert!(matches!(
            session.verify_response(0x14, ResponseCode::Success, &[], &secret, &response_trailer),
            Err(ClientError::AuthTampered)
        ));
    }
}
