// SPDX-License-Identifier: MIT
//! PCR selection bitmaps and the two `TPM_PCR_INFO` variants.

use crate::{split, Codec, CodecError, Digest, Locality};

/// Number of PCR registers implemented (spec §3: "24 PCR registers").
pub const NUM_PCRS: usize = 24;

/// `ceil(NUM_PCRS / 8)` bytes needed to select every PCR.
pub const SELECT_SIZE: usize = NUM_PCRS.div_ceil(8);

/// `TPM_PCR_SELECTION`: `sizeOfSelect(u16 BE) || selectBytes`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcrSelection {
    pub select: Vec<u8>,
}

impl PcrSelection {
    #[must_use]
    pub fn empty() -> Self {
        PcrSelection {
            select: vec![0u8; SELECT_SIZE],
        }
    }

    #[must_use]
    pub fn single(index: usize) -> Self {
        let mut s = Self::empty();
        s.set(index);
        s
    }

    pub fn set(&mut self, index: usize) {
        if self.select.len() <= index / 8 {
            self.select.resize(index / 8 + 1, 0);
        }
        self.select[index / 8] |= 1 << (index % 8);
    }

    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        self.select
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    #[must_use]
    pub fn indices(&self) -> Vec<usize> {
        (0..self.select.len() * 8)
            .filter(|&i| self.is_set(i))
            .collect()
    }
}

impl Codec for PcrSelection {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.select.len() as u16).encode(buf);
        buf.extend_from_slice(&self.select);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (len, buf) = u16::decode(buf)?;
        let (select, buf) = split(buf, len as usize)?;
        Ok((
            PcrSelection {
                select: select.to_vec(),
            },
            buf,
        ))
    }
}

/// Computes `SHA1(sizeOfSelect(u16 BE) || selectBytes || valueSize(u32 BE)
/// || concat(selectedPcrValues))`, the PCR composite digest (spec §4.4).
#[must_use]
pub fn composite_preimage(selection: &PcrSelection, values: &[Digest]) -> Vec<u8> {
    let mut buf = Vec::new();
    selection.encode(&mut buf);
    ((values.len() * crate::DIGEST_SIZE) as u32).encode(&mut buf);
    for value in values {
        buf.extend_from_slice(value);
    }
    buf
}

/// `TPM_PCR_INFO` (short form): release selection plus the digests expected
/// at creation and release time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrInfoShort {
    pub pcr_selection: PcrSelection,
    pub locality_at_release: u8,
    pub digest_at_release: Digest,
}

impl Codec for PcrInfoShort {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.pcr_selection.encode(buf);
        buf.push(self.locality_at_release);
        self.digest_at_release.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (pcr_selection, buf) = PcrSelection::decode(buf)?;
        let (locality_at_release, buf) = u8::decode(buf)?;
        let (digest_at_release, buf) = Digest::decode(buf)?;
        Ok((
            PcrInfoShort {
                pcr_selection,
                locality_at_release,
                digest_at_release,
            },
            buf,
        ))
    }
}

/// `TPM_PCR_INFO_LONG`: adds creation-time locality and digest, used by
/// KEY12-era structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrInfoLong {
    pub locality_at_creation: u8,
    pub locality_at_release: u8,
    pub creation_pcr_selection: PcrSelection,
    pub release_pcr_selection: PcrSelection,
    pub digest_at_creation: Digest,
    pub digest_at_release: Digest,
}

impl Codec for PcrInfoLong {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.locality_at_creation);
        buf.push(self.locality_at_release);
        self.creation_pcr_selection.encode(buf);
        self.release_pcr_selection.encode(buf);
        self.digest_at_creation.encode(buf);
        self.digest_at_release.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (locality_at_creation, buf) = u8::decode(buf)?;
        let (locality_at_release, buf) = u8::decode(buf)?;
        let (creation_pcr_selection, buf) = PcrSelection::decode(buf)?;
        let (release_pcr_selection, buf) = PcrSelection::decode(buf)?;
        let (digest_at_creation, buf) = Digest::decode(buf)?;
        let (digest_at_release, buf) = Digest::decode(buf)?;
        Ok((
            PcrInfoLong {
                locality_at_creation,
                locality_at_release,
                creation_pcr_selection,
                release_pcr_selection,
                digest_at_creation,
                digest_at_release,
            },
            buf,
        ))
    }
}

/// Tagged variant over the two `TPM_PCR_INFO` forms a key blob may carry --
/// kept as a discriminated enum rather than an opaque byte array with
/// ad-hoc length math (spec §9 "Variant types over casts").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcrInfo {
    None,
    Short(PcrInfoShort),
    Long(PcrInfoLong),
}

impl PcrInfo {
    #[must_use]
    pub fn release_selection(&self) -> Option<&PcrSelection> {
        match self {
            PcrInfo::None => None,
            PcrInfo::Short(s) => Some(&s.pcr_selection),
            PcrInfo::Long(l) => Some(&l.release_pcr_selection),
        }
    }

    #[must_use]
    pub fn digest_at_release(&self) -> Option<&Digest> {
        match self {
            PcrInfo::None => None,
            PcrInfo::Short(s) => Some(&s.digest_at_release),
            PcrInfo::Long(l) => Some(&l.digest_at_release),
        }
    }

    #[must_use]
    pub fn locality_at_release(&self) -> Option<Locality> {
        match self {
            PcrInfo::None => None,
            PcrInfo::Short(s) => Some(Locality(s.locality_at_release)),
            PcrInfo::Long(l) => Some(Locality(l.locality_at_release)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_round_trips() {
        let mut sel = PcrSelection::empty();
        sel.set(10);
        sel.set(23);
        let mut buf = Vec::new();
        sel.encode(&mut buf);
        let (decoded, rest) = PcrSelection::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, sel);
        assert_eq!(decoded.indices(), vec![10, 23]);
    }

    #[test]
    fn pcr_info_short_round_trips() {
        let info = PcrInfoShort {
            pcr_selection: PcrSelection::single(10),
            locality_at_release: 1,
            digest_at_release: [3u8; 20],
        };
        let mut buf = Vec::new();
        info.encode(&mut buf);
        let (decoded, rest) = PcrInfoShort::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, info);
    }
}
