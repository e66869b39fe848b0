// SPDX-License-Identifier: MIT
//! Structures signed by `Quote`, `Quote2` and the vTPM `DeepQuote`
//! extension (spec §4.5), plus the generic `TPM_SIGN_INFO` wrapper used by
//! audit-digest and transport-release signatures (spec §4.8, §4.9).

use crate::pcr::{PcrInfoShort, PcrSelection};
use crate::{decode_opaque, encode_opaque, split, Codec, CodecError, Digest};

/// `TPM_QUOTE_INFO`: `version(4) || "QUOT"(4) || compositeHash(20) ||
/// externalData(20)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteInfo {
    pub version: [u8; 4],
    pub composite_hash: Digest,
    pub external_data: Digest,
}

impl QuoteInfo {
    pub const FIXED: [u8; 4] = *b"QUOT";

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version);
        buf.extend_from_slice(&Self::FIXED);
        self.composite_hash.encode(buf);
        self.external_data.encode(buf);
    }
}

/// `TPM_QUOTE_INFO2`: tag `0x0036`, fixed `"QUT2"`, a `TPM_PCR_INFO_SHORT`,
/// and the caller's anti-replay nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteInfo2 {
    pub pcr_info: PcrInfoShort,
    pub external_data: Digest,
}

impl QuoteInfo2 {
    pub const TAG: u16 = 0x0036;
    pub const FIXED: [u8; 4] = *b"QUT2";

    pub fn encode(&self, buf: &mut Vec<u8>) {
        Self::TAG.encode(buf);
        buf.extend_from_slice(&Self::FIXED);
        self.pcr_info.encode(buf);
        self.external_data.encode(buf);
    }
}

/// `TPM_SIGN_INFO`: a generic signed-statement wrapper used by audit
/// digests (`"ADIG"`) and transport release (`"TRAN"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInfo {
    pub fixed: [u8; 4],
    pub replay: Digest,
    pub data: Vec<u8>,
}

impl SignInfo {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        0x8019u16.encode(buf); // TPM_TAG_SIGNINFO
        buf.extend_from_slice(&self.fixed);
        self.replay.encode(buf);
        encode_opaque(&self.data, buf);
    }
}

/// The on-disk DeepQuote container, field order exactly as spec §4.5
/// specifies: physical PCR selection, `extraInfoFlags`, signature,
/// info-hash vector, PCR-value vector, followed by the nested vTPM quote's
/// signature and PCR composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeepQuoteContainer {
    pub physical_pcr_selection: PcrSelection,
    pub extra_info_flags: u32,
    pub signature: [u8; 256],
    pub info_hashes: Vec<Digest>,
    pub pcr_values: Vec<Digest>,
    pub vtpm_signature: Vec<u8>,
    pub vtpm_pcr_composite: Digest,
}

impl Codec for DeepQuoteContainer {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.physical_pcr_selection.encode(buf);
        self.extra_info_flags.encode(buf);
        buf.extend_from_slice(&self.signature);
        (self.info_hashes.len() as u32).encode(buf);
        for hash in &self.info_hashes {
            hash.encode(buf);
        }
        (self.pcr_values.len() as u32).encode(buf);
        for value in &self.pcr_values {
            value.encode(buf);
        }
        encode_opaque(&self.vtpm_signature, buf);
        self.vtpm_pcr_composite.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (physical_pcr_selection, buf) = PcrSelection::decode(buf)?;
        let (extra_info_flags, buf) = u32::decode(buf)?;
        let (sig_bytes, buf) = split(buf, 256)?;
        let mut signature = [0u8; 256];
        signature.copy_from_slice(sig_bytes);
        let (num_info_hashes, buf) = u32::decode(buf)?;
        let mut info_hashes = Vec::with_capacity(num_info_hashes as usize);
        let mut buf = buf;
        for _ in 0..num_info_hashes {
            let (hash, rest) = Digest::decode(buf)?;
            info_hashes.push(hash);
            buf = rest;
        }
        let (num_pcr_values, mut buf) = u32::decode(buf)?;
        let mut pcr_values = Vec::with_capacity(num_pcr_values as usize);
        for _ in 0..num_pcr_values {
            let (value, rest) = Digest::decode(buf)?;
            pcr_values.push(value);
            buf = rest;
        }
        let (vtpm_signature, buf) = decode_opaque(buf)?;
        let (vtpm_pcr_composite, buf) = Digest::decode(buf)?;
        Ok((
            DeepQuoteContainer {
                physical_pcr_selection,
                extra_info_flags,
                signature,
                info_hashes,
                pcr_values,
                vtpm_signature,
                vtpm_pcr_composite,
            },
            buf,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_quote_container_round_trips() {
        let dq = DeepQuoteContainer {
            physical_pcr_selection: PcrSelection::single(17),
            extra_info_flags: 0x0000_0003,
            signature: [0xAB; 256],
            info_hashes: vec![[1u8; 20], [2u8; 20]],
            pcr_values: vec![[3u8; 20]],
            vtpm_signature: vec![9, 9, 9],
            vtpm_pcr_composite: [4u8; 20],
        };
        let mut buf = Vec::new();
        dq.encode(&mut buf);
        let (decoded, rest) = DeepQuoteContainer::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, dq);
    }
}
