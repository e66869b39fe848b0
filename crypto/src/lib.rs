// SPDX-License-Identifier: MIT
#![deny(clippy::all)]

//! Cryptographic primitives backing the TPM 1.2 stack.
//!
//! Per the design note in spec §9 ("RSA operations"), this crate reuses
//! vetted RustCrypto implementations for every asymmetric and modular
//! arithmetic operation -- nothing here hand-rolls modular exponentiation,
//! padding, or a hash compression function.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest as Sha1Digest, Sha1};
use thiserror::Error;

/// A SHA-1-sized digest, nonce, or auth value. Mirrors `tpm12_proto::Digest`
/// but this crate is intentionally free of a `tpm12-proto` dependency so it
/// can be reused by anything that only needs primitives.
pub type Digest = [u8; 20];

/// OAEP label used for every TPM key-wrap/unwrap operation (spec §4.3).
pub const TCPA_LABEL: &str = "TCPA";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("RSA key generation failed: {0}")]
    KeyGen(rsa::Error),
    #[error("signature verification failed")]
    BadSignature,
    #[error("ciphertext length is not a multiple of the AES block size")]
    BadCiphertextLength,
    #[error("unpadding failed during AES-CBC decryption")]
    BadPadding,
}

/// One-shot SHA-1 over a single buffer.
#[must_use]
pub fn sha1(data: &[u8]) -> Digest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Streaming SHA-1, used where a digest is built up across several
/// concatenated fields (PCR extend preimages, quote info, audit digest
/// chaining) without allocating the full concatenation up front.
#[derive(Default, Clone)]
pub struct Sha1State(Sha1);

impl Sha1State {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    #[must_use]
    pub fn finish(self) -> Digest {
        self.0.finalize().into()
    }
}

type HmacSha1 = Hmac<Sha1>;

/// `HMAC-SHA1(key, msg)`, used for both session-secret derivation (OSAP)
/// and command/response auth computation (spec §4.1, §4.2).
#[must_use]
pub fn hmac_sha1(key: &[u8], msg: &[u8]) -> Digest {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Verifies `auth == HMAC-SHA1(key, msg)` in constant time.
#[must_use]
pub fn hmac_sha1_verify(key: &[u8], msg: &[u8], auth: &Digest) -> bool {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.verify_slice(auth).is_ok()
}

/// Fills `out` with cryptographically secure random bytes, via the
/// platform CSPRNG (spec §4 intro: "secure random").
pub fn fill_random(out: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(out);
}

/// Generates a fresh 20-byte nonce.
#[must_use]
pub fn random_nonce() -> Digest {
    let mut nonce = [0u8; 20];
    fill_random(&mut nonce);
    nonce
}

/// MGF1-SHA1 keystream generation, used by transport-session parameter
/// encryption as an alternative to a block cipher (spec §9 "Padding of
/// transport-encrypted bodies").
#[must_use]
pub fn mgf1_sha1(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 0;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

/// XORs `data` with an MGF1-SHA1 keystream derived from `seed`, in place.
pub fn mgf1_xor(seed: &[u8], data: &mut [u8]) {
    let keystream = mgf1_sha1(seed, data.len());
    for (byte, mask) in data.iter_mut().zip(keystream.iter()) {
        *byte ^= mask;
    }
}

/// An RSA key pair as used for TPM storage, signing and binding keys.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
}

impl RsaKeyPair {
    /// Generates a fresh key pair of the given bit length (1024 or 2048 in
    /// practice).
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
            .map_err(CryptoError::KeyGen)?;
        Ok(RsaKeyPair { private })
    }

    /// Reconstructs a key pair from its raw modulus and private exponent,
    /// as stored inside a `TPM_STORE_ASYMKEY` private blob.
    pub fn from_components(
        modulus: &[u8],
        public_exponent: &[u8],
        private_exponent: &[u8],
        prime1: &[u8],
        prime2: &[u8],
    ) -> Result<Self, CryptoError> {
        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from_bytes_be(public_exponent);
        let d = BigUint::from_bytes_be(private_exponent);
        let p = BigUint::from_bytes_be(prime1);
        let q = BigUint::from_bytes_be(prime2);
        let private = RsaPrivateKey::from_components(n, e, d, vec![p, q])
            .map_err(CryptoError::KeyGen)?;
        Ok(RsaKeyPair { private })
    }

    #[must_use]
    pub fn public(&self) -> RsaPublic {
        RsaPublic {
            public: RsaPublicKey::from(&self.private),
        }
    }

    /// PKCS#1 v1.5 signature over a pre-computed SHA-1 digest.
    pub fn sign_pkcs1v15_sha1(&self, digest: &Digest) -> Result<Vec<u8>, CryptoError> {
        let scheme = Pkcs1v15Sign::new::<Sha1>();
        Ok(self.private.sign(scheme, digest)?)
    }

    /// OAEP decryption (unbind) with the fixed `"TCPA"` label (spec §4.3).
    pub fn oaep_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let padding = Oaep::new_with_label::<Sha1, _>(TCPA_LABEL);
        Ok(self.private.decrypt(padding, ciphertext)?)
    }

    /// Serializes the private key as PKCS#1 DER, the form this
    /// implementation stores inside a `TPM_STORE_ASYMKEY.privKey` blob.
    pub fn to_pkcs1_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.private
            .to_pkcs1_der()
            .map(|der| der.as_bytes().to_vec())
            .map_err(|_| CryptoError::BadPadding)
    }

    /// Reconstructs a key pair from its PKCS#1 DER encoding.
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs1_der(der).map_err(|_| CryptoError::BadPadding)?;
        Ok(RsaKeyPair { private })
    }
}

/// The public half of an RSA key, sufficient to verify signatures and
/// bind (OAEP-encrypt) data to it.
pub struct RsaPublic {
    public: RsaPublicKey,
}

impl RsaPublic {
    /// Imports a public key from a raw big-endian modulus and the standard
    /// TPM default exponent (65537) unless overridden.
    pub fn from_modulus(modulus: &[u8], exponent: Option<&[u8]>) -> Result<Self, CryptoError> {
        let n = BigUint::from_bytes_be(modulus);
        let e = match exponent {
            Some(bytes) if !bytes.is_empty() => BigUint::from_bytes_be(bytes),
            _ => BigUint::from(65537u32),
        };
        let public = RsaPublicKey::new(n, e).map_err(CryptoError::KeyGen)?;
        Ok(RsaPublic { public })
    }

    #[must_use]
    pub fn modulus_bytes(&self) -> Vec<u8> {
        self.public.n().to_bytes_be()
    }

    pub fn verify_pkcs1v15_sha1(&self, digest: &Digest, signature: &[u8]) -> Result<(), CryptoError> {
        let scheme = Pkcs1v15Sign::new::<Sha1>();
        self.public
            .verify(scheme, digest, signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// OAEP encryption (bind) with the fixed `"TCPA"` label (spec §4.3).
    pub fn oaep_encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let padding = Oaep::new_with_label::<Sha1, _>(TCPA_LABEL);
        Ok(self
            .public
            .encrypt(&mut rand::rngs::OsRng, padding, plaintext)?)
    }
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128-CBC encrypt with PKCS#7 padding, used for transport-session log
/// encryption and private-key-material wrapping (spec §4.9, §9).
pub fn aes128_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// AES-128-CBC decrypt with PKCS#7 unpadding.
pub fn aes128_cbc_decrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() % 16 != 0 || ciphertext.is_empty() {
        return Err(CryptoError::BadCiphertextLength);
    }
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_vector() {
        // SHA1("abc")
        let expected = [
            0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
            0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
        ];
        assert_eq!(sha1(b"abc"), expected);
    }

    #[test]
    fn streaming_sha1_matches_one_shot() {
        let mut state = Sha1State::new();
        state.update(b"ab").update(b"c");
        assert_eq!(state.finish(), sha1(b"abc"));
    }

    #[test]
    fn hmac_round_trips() {
        let key = b"shared-secret";
        let msg = b"command-digest";
        let mac = hmac_sha1(key, msg);
        assert!(hmac_sha1_verify(key, msg, &mac));
        let mut tampered = mac;
        tampered[0] ^= 0x01;
        assert!(!hmac_sha1_verify(key, msg, &tampered));
    }

    #[test]
    fn rsa_sign_verify_round_trips() {
        let pair = RsaKeyPair::generate(1024).unwrap();
        let digest = sha1(b"hello");
        let sig = pair.sign_pkcs1v15_sha1(&digest).unwrap();
        pair.public().verify_pkcs1v15_sha1(&digest, &sig).unwrap();
    }

    #[test]
    fn rsa_oaep_round_trips() {
        let pair = RsaKeyPair::generate(1024).unwrap();
        let plaintext = b"a 20 byte secret!!!!";
        let ciphertext = pair.public().oaep_encrypt(plaintext).unwrap();
        let decrypted = pair.oaep_decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_cbc_round_trips() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let plaintext = b"sealed TPM data that isn't block aligned";
        let ciphertext = aes128_cbc_encrypt(&key, &iv, plaintext);
        let decrypted = aes128_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn mgf1_xor_is_its_own_inverse() {
        let seed = b"transport-session-key";
        let mut data = b"wrapped command parameters".to_vec();
        let original = data.clone();
        mgf1_xor(seed, &mut data);
        assert_ne!(data, original);
        mgf1_xor(seed, &mut data);
        assert_eq!(data, original);
    }
}
