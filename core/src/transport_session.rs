// SPDX-License-Identifier: MIT
//! Transport sessions: `EstablishTransport`, wrapped-command encryption and
//! digest chaining, and `ReleaseTransportSigned` (spec §4.9).

use crate::error::{TpmError, TpmResult};
use tpm12_crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt, mgf1_xor, sha1};
use tpm12_proto::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEncryption {
    /// `TPM_ALG_NULL`: no confidentiality, only the log digest is kept.
    None,
    /// `TPM_ALG_MGF1`: stream cipher via MGF1-SHA1 keystream XOR.
    Mgf1,
    /// `TPM_ALG_AES128`: CBC with PKCS#7 padding.
    Aes128,
}

/// One open transport session's running log. `TPM_TRANSPORT_LOG_IN` and
/// `_OUT` digests are chained independently, then combined into a single
/// `TPM_TRANSPORT_LOG_OUT.parametersSha1` the session compares on
/// `ExecuteTransport` and finally reports via `ReleaseTransportSigned`.
pub struct TransportLog {
    pub encryption: TransportEncryption,
    pub session_key: [u8; 16],
    log_in: Digest,
    log_out: Digest,
}

impl TransportLog {
    #[must_use]
    pub fn new(encryption: TransportEncryption, session_key: [u8; 16]) -> Self {
        TransportLog {
            encryption,
            session_key,
            log_in: [0u8; 20],
            log_out: [0u8; 20],
        }
    }

    /// Decrypts (if the session specifies encryption) and digest-chains
    /// one wrapped command's parameter area. Returns the plaintext
    /// parameters to hand to the dispatcher.
    pub fn unwrap_command(&mut self, ordinal: u32, wrapped: &[u8], iv: &[u8; 16]) -> TpmResult<Vec<u8>> {
        let plaintext = self.decrypt(wrapped, iv)?;
        self.chain_in(ordinal, &plaintext);
        Ok(plaintext)
    }

    /// Digest-chains and (if encrypting) encrypts one wrapped response's
    /// parameter area before it is sent back to the caller.
    pub fn wrap_response(&mut self, ordinal: u32, return_code: u32, plaintext: &[u8], iv: &[u8; 16]) -> Vec<u8> {
        self.chain_out(ordinal, return_code, plaintext);
        self.encrypt(plaintext, iv)
    }

    fn decrypt(&self, wrapped: &[u8], iv: &[u8; 16]) -> TpmResult<Vec<u8>> {
        match self.encryption {
            TransportEncryption::None => Ok(wrapped.to_vec()),
            TransportEncryption::Mgf1 => {
                let mut data = wrapped.to_vec();
                mgf1_xor(&self.session_key, &mut data);
                Ok(data)
            }
            TransportEncryption::Aes128 => {
                aes128_cbc_decrypt(&self.session_key, iv, wrapped).map_err(|_| TpmError::Precondition(tpm12_proto::ResponseCode::Decrypterror))
            }
        }
    }

    fn encrypt(&self, plaintext: &[u8], iv: &[u8; 16]) -> Vec<u8> {
        match self.encryption {
            TransportEncryption::None => plaintext.to_vec(),
            TransportEncryption::Mgf1 => {
                let mut data = plaintext.to_vec();
                mgf1_xor(&self.session_key, &mut data);
                data
            }
            TransportEncryption::Aes128 => aes128_cbc_encrypt(&self.session_key, iv, plaintext),
        }
    }

    fn chain_in(&mut self, ordinal: u32, plaintext: &[u8]) {
        let mut preimage = Vec::with_capacity(self.log_in.len() + 4 + plaintext.len());
        preimage.extend_from_slice(&self.log_in);
        preimage.extend_from_slice(&ordinal.to_be_bytes());
        preimage.extend_from_slice(plaintext);
        self.log_in = sha1(&preimage);
    }

    fn chain_out(&mut self, ordinal: u32, return_code: u32, plaintext: &[u8]) {
        let mut preimage = Vec::with_capacity(self.log_out.len() + 8 + plaintext.len());
        preimage.extend_from_slice(&self.log_out);
        preimage.extend_from_slice(&return_code.to_be_bytes());
        preimage.extend_from_slice(&ordinal.to_be_bytes());
        preimage.extend_from_slice(plaintext);
        self.log_out = sha1(&preimage);
    }

    /// The digest `ReleaseTransportSigned` signs: `SHA1(logIn || logOut)`.
    #[must_use]
    pub fn parameters_digest(&self) -> Digest {
        let mut preimage = Vec::with_capacity(40);
        preimage.extend_from_slice(&self.log_in);
        preimage.extend_from_slice(&self.log_out);
        sha1(&preimage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_wrap_round_trips() {
        let key = [7u8; 16];
        let iv = [3u8; 16];
        let mut sender = TransportLog::new(TransportEncryption::Aes128, key);
        let mut receiver = TransportLog::new(TransportEncryption::Aes128, key);
        let wrapped = sender.wrap_response(0x16, 0, b"pcr composite bytes", &iv);
        let recovered = receiver.unwrap_command(0x16, &wrapped, &iv).unwrap();
        assert_eq!(recovered, b"pcr composite bytes");
    }

    #[test]
    fn log_digests_diverge_between_mismatched_sessions() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let mut a = TransportLog::new(TransportEncryption::None, key);
        let mut b = TransportLog::new(TransportEncryption::None, key);
        a.unwrap_command(0x01, b"same bytes", &iv).unwrap();
        b.unwrap_command(0x02, b"same bytes", &iv).unwrap();
        assert_ne!(a.parameters_digest(), b.parameters_digest());
    }

    #[test]
    fn mgf1_stream_round_trips() {
        let key = [4u8; 16];
        let iv = [0u8; 16];
        let mut sender = TransportLog::new(TransportEncryption::Mgf1, key);
        let mut receiver = TransportLog::new(TransportEncryption::Mgf1, key);
        let wrapped = sender.wrap_response(0x3E, 0, b"extend digest payload", &iv);
        let recovered = receiver.unwrap_command(0x3E, &wrapped, &iv).unwrap();
        assert_eq!(recovered, b"extend digest payload");
    }
}
