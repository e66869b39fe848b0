// SPDX-License-Identifier: MIT
//! `TPM_KEY` / `TPM_KEY12` structures and the `TPM_STORE_ASYMKEY` integrity
//! wrapper.

use crate::pcr::PcrInfo;
use crate::{decode_opaque, encode_opaque, AuthDataUsage, Codec, CodecError, Digest, KeyFlags, KeyUsage};
use strum_macros::FromRepr;

/// Version tag of a pre-1.2 (`TPM_KEY`) key blob: `0x01010000`.
pub const VERSION_1_1: u32 = 0x0101_0000;

/// Structure tag of a `TPM_KEY12` blob.
pub const STRUCT_TAG_KEY12: u16 = 0x0028;

/// `TPM_ALGORITHM_ID` values this implementation's key parameters use.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AlgorithmId {
    Rsa = 0x0000_0001,
    Sha = 0x0000_0004,
    Hmac = 0x0000_0005,
    Aes128 = 0x0000_0006,
    Mgf1 = 0x0000_0007,
}

/// `TPM_ENC_SCHEME` values.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EncScheme {
    None = 0x0001,
    Oaep = 0x0002,
    Pkcsv15 = 0x0003,
}

/// `TPM_SIG_SCHEME` values.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SigScheme {
    None = 0x0001,
    Pkcs1v15Sha1 = 0x0002,
    Pkcs1v15Der = 0x0003,
}

/// RSA-specific parameters nested inside `TPM_KEY_PARMS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaKeyParms {
    pub key_length: u32,
    pub num_primes: u32,
    pub exponent: Vec<u8>,
}

impl Codec for RsaKeyParms {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.key_length.encode(buf);
        self.num_primes.encode(buf);
        encode_opaque(&self.exponent, buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (key_length, buf) = u32::decode(buf)?;
        let (num_primes, buf) = u32::decode(buf)?;
        let (exponent, buf) = decode_opaque(buf)?;
        Ok((
            RsaKeyParms {
                key_length,
                num_primes,
                exponent,
            },
            buf,
        ))
    }
}

/// `TPM_KEY_PARMS`: algorithm id, enc/sig scheme, and algorithm-specific
/// parameters (only RSA is modeled, the only asymmetric algorithm this
/// implementation supports -- spec §9 "RSA operations").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmParms {
    pub algorithm_id: AlgorithmId,
    pub enc_scheme: EncScheme,
    pub sig_scheme: SigScheme,
    pub rsa: RsaKeyParms,
}

impl Codec for AlgorithmParms {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.algorithm_id as u32).encode(buf);
        (self.enc_scheme as u16).encode(buf);
        (self.sig_scheme as u16).encode(buf);
        let mut parms = Vec::new();
        self.rsa.encode(&mut parms);
        encode_opaque(&parms, buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (alg_raw, buf) = u32::decode(buf)?;
        let algorithm_id =
            AlgorithmId::from_repr(alg_raw).ok_or(CodecError::UnknownStructureTag(alg_raw))?;
        let (enc_raw, buf) = u16::decode(buf)?;
        let enc_scheme =
            EncScheme::from_repr(enc_raw).ok_or(CodecError::UnknownStructureTag(u32::from(enc_raw)))?;
        let (sig_raw, buf) = u16::decode(buf)?;
        let sig_scheme =
            SigScheme::from_repr(sig_raw).ok_or(CodecError::UnknownStructureTag(u32::from(sig_raw)))?;
        let (parms_blob, buf) = decode_opaque(buf)?;
        let (rsa, remainder) = RsaKeyParms::decode(&parms_blob)?;
        if !remainder.is_empty() {
            return Err(CodecError::TrailingData);
        }
        Ok((
            AlgorithmParms {
                algorithm_id,
                enc_scheme,
                sig_scheme,
                rsa,
            },
            buf,
        ))
    }
}

/// A `TPM_KEY12` blob -- the structure this implementation writes and
/// accepts. `TPM_KEY` (v1.1, `VERSION_1_1`) blobs are parsed for backward
/// compatibility but never produced, matching the §3 "Key" invariant that
/// the version tag discriminates the variant (spec §9 "Variant types over
/// casts").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key12 {
    pub key_usage: KeyUsage,
    pub key_flags: KeyFlags,
    pub auth_data_usage: AuthDataUsage,
    pub algorithm_parms: AlgorithmParms,
    pub pcr_info: PcrInfo,
    pub pub_key: Vec<u8>,
    pub enc_data: Vec<u8>,
}

impl Key12 {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        STRUCT_TAG_KEY12.encode(buf);
        0u16.encode(buf); // fill -- TPM_KEY12 reserved field
        (self.key_usage as u16).encode(buf);
        self.key_flags.bits().encode(buf);
        buf.push(self.auth_data_usage as u8);
        self.algorithm_parms.encode(buf);
        match &self.pcr_info {
            PcrInfo::None => encode_opaque(&[], buf),
            PcrInfo::Short(s) => {
                let mut inner = Vec::new();
                s.encode(&mut inner);
                encode_opaque(&inner, buf);
            }
            PcrInfo::Long(l) => {
                let mut inner = Vec::new();
                l.encode(&mut inner);
                encode_opaque(&inner, buf);
            }
        }
        encode_opaque(&self.pub_key, buf);
        encode_opaque(&self.enc_data, buf);
    }

    /// Decodes a `TPM_KEY12` body. `pcr_info_is_long` selects which
    /// `TPM_PCR_INFO` variant the opaque blob holds when non-empty -- the
    /// caller knows this from context (creation request vs. stored blob),
    /// matching how the original distinguishes `TPM_PCR_INFO` from
    /// `TPM_PCR_INFO_LONG` by call site rather than an on-wire tag.
    pub fn decode(buf: &[u8], pcr_info_is_long: bool) -> Result<(Self, &[u8]), CodecError> {
        let (struct_tag, buf) = u16::decode(buf)?;
        if struct_tag != STRUCT_TAG_KEY12 {
            return Err(CodecError::UnknownStructureTag(u32::from(struct_tag)));
        }
        let (_fill, buf) = u16::decode(buf)?;
        let (usage_raw, buf) = u16::decode(buf)?;
        let key_usage =
            KeyUsage::from_repr(usage_raw).ok_or(CodecError::UnknownStructureTag(u32::from(usage_raw)))?;
        let (flags_raw, buf) = u32::decode(buf)?;
        let key_flags = KeyFlags::from_bits_truncate(flags_raw);
        let (auth_raw, buf) = u8::decode(buf)?;
        let auth_data_usage = AuthDataUsage::from_repr(auth_raw)
            .ok_or(CodecError::UnknownStructureTag(u32::from(auth_raw)))?;
        let (algorithm_parms, buf) = AlgorithmParms::decode(buf)?;
        let (pcr_blob, buf) = decode_opaque(buf)?;
        let pcr_info = if pcr_blob.is_empty() {
            PcrInfo::None
        } else if pcr_info_is_long {
            let (long, rest) = PcrInfoLongAlias::decode(&pcr_blob)?;
            if !rest.is_empty() {
                return Err(CodecError::TrailingData);
            }
            PcrInfo::Long(long)
        } else {
            let (short, rest) = PcrInfoShortAlias::decode(&pcr_blob)?;
            if !rest.is_empty() {
                return Err(CodecError::TrailingData);
            }
            PcrInfo::Short(short)
        };
        let (pub_key, buf) = decode_opaque(buf)?;
        let (enc_data, buf) = decode_opaque(buf)?;
        Ok((
            Key12 {
                key_usage,
                key_flags,
                auth_data_usage,
                algorithm_parms,
                pcr_info,
                pub_key,
                enc_data,
            },
            buf,
        ))
    }
}

use crate::pcr::{PcrInfoLong as PcrInfoLongAlias, PcrInfoShort as PcrInfoShortAlias};

/// `TPM_STORE_ASYMKEY`: the plaintext structure wrapped inside `encData`
/// once decrypted under the parent key. `pub_data_digest` is the integrity
/// digest over the public half, verified on load (spec §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreAsymkey {
    pub payload: u8,
    pub usage_auth: Digest,
    pub migration_auth: Digest,
    pub pub_data_digest: Digest,
    pub priv_key: Vec<u8>,
}

impl Codec for StoreAsymkey {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.payload);
        self.usage_auth.encode(buf);
        self.migration_auth.encode(buf);
        self.pub_data_digest.encode(buf);
        encode_opaque(&self.priv_key, buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (payload, buf) = u8::decode(buf)?;
        let (usage_auth, buf) = Digest::decode(buf)?;
        let (migration_auth, buf) = Digest::decode(buf)?;
        let (pub_data_digest, buf) = Digest::decode(buf)?;
        let (priv_key, buf) = decode_opaque(buf)?;
        Ok((
            StoreAsymkey {
                payload,
                usage_auth,
                migration_auth,
                pub_data_digest,
                priv_key,
            },
            buf,
        ))
    }
}

/// `TPM_MIGRATIONKEYAUTH`: the blob produced by `AuthorizeMigrationKey`,
/// binding a destination public key to a migration scheme under owner
/// auth (spec §4.3 migration pipeline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationKeyAuth {
    pub migration_key: Vec<u8>,
    pub migration_scheme: u16,
    pub digest: Digest,
}

impl Codec for MigrationKeyAuth {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_opaque(&self.migration_key, buf);
        self.migration_scheme.encode(buf);
        self.digest.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (migration_key, buf) = decode_opaque(buf)?;
        let (migration_scheme, buf) = u16::decode(buf)?;
        let (digest, buf) = Digest::decode(buf)?;
        Ok((
            MigrationKeyAuth {
                migration_key,
                migration_scheme,
                digest,
            },
            buf,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcr::PcrSelection;

    fn sample_key() -> Key12 {
        Key12 {
            key_usage: KeyUsage::Signing,
            key_flags: KeyFlags::Migratable,
            auth_data_usage: AuthDataUsage::Always,
            algorithm_parms: AlgorithmParms {
                algorithm_id: AlgorithmId::Rsa,
                enc_scheme: EncScheme::None,
                sig_scheme: SigScheme::Pkcs1v15Sha1,
                rsa: RsaKeyParms {
                    key_length: 2048,
                    num_primes: 2,
                    exponent: vec![],
                },
            },
            pcr_info: PcrInfo::Short(crate::pcr::PcrInfoShort {
                pcr_selection: PcrSelection::single(10),
                locality_at_release: 1,
                digest_at_release: [1u8; 20],
            }),
            pub_key: vec![0xAB; 256],
            enc_data: vec![0xCD; 256],
        }
    }

    #[test]
    fn key12_round_trips() {
        let key = sample_key();
        let mut buf = Vec::new();
        key.encode(&mut buf);
        let (decoded, rest) = Key12::decode(&buf, false).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, key);
    }

    #[test]
    fn store_asymkey_round_trips() {
        let s = StoreAsymkey {
            payload: 0x01,
            usage_auth: [1u8; 20],
            migration_auth: [2u8; 20],
            pub_data_digest: [3u8; 20],
            priv_key: vec![9; 128],
        };
        let mut buf = Vec::new();
        s.encode(&mut buf);
        let (decoded, rest) = StoreAsymkey::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, s);
    }
}
