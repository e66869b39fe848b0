// SPDX-License-Identifier: MIT
//! Quote, Quote2 and DeepQuote attestation logic: building and signing the
//! quote-info structures off the current PCR state (spec §4.5).

use crate::error::TpmResult;
use crate::keystore::KeyStore;
use crate::pcr::PcrEngine;
use tpm12_crypto::sha1;
use tpm12_proto::pcr::{PcrInfoShort, PcrSelection};
use tpm12_proto::quote::{DeepQuoteContainer, QuoteInfo, QuoteInfo2};
use tpm12_proto::Digest;

/// `Quote`: signs `TPM_QUOTE_INFO` over the composite of `pcr_selection`
/// and the caller's anti-replay nonce. Returns the signature and the
/// composite digest the caller can independently recompute.
pub fn quote(
    keystore: &KeyStore,
    pcr_engine: &PcrEngine,
    signing_key_handle: u32,
    pcr_selection: &PcrSelection,
    external_data: Digest,
) -> TpmResult<(Vec<u8>, Digest)> {
    let composite = pcr_engine.composite(pcr_selection);
    let info = QuoteInfo {
        version: [1, 1, 0, 0],
        composite_hash: composite,
        external_data,
    };
    let mut preimage = Vec::new();
    info.encode(&mut preimage);
    let digest = sha1(&preimage);
    let key = keystore.get(signing_key_handle)?;
    let signature = key
        .private
        .sign_pkcs1v15_sha1(&digest)
        .map_err(|_| crate::error::TpmError::bad_parameter())?;
    Ok((signature, composite))
}

/// `Quote2`: like `Quote` but signs a `TPM_QUOTE_INFO2` that embeds the
/// full `TPM_PCR_INFO_SHORT` rather than a bare composite digest, so the
/// verifier can check the selection and locality without an out-of-band
/// side channel.
pub fn quote2(
    keystore: &KeyStore,
    pcr_engine: &PcrEngine,
    signing_key_handle: u32,
    pcr_selection: &PcrSelection,
    locality_at_release: u8,
    external_data: Digest,
) -> TpmResult<Vec<u8>> {
    let composite = pcr_engine.composite(pcr_selection);
    let info = QuoteInfo2 {
        pcr_info: PcrInfoShort {
            pcr_selection: pcr_selection.clone(),
            locality_at_release,
            digest_at_release: composite,
        },
        external_data,
    };
    let mut preimage = Vec::new();
    info.encode(&mut preimage);
    let digest = sha1(&preimage);
    let key = keystore.get(signing_key_handle)?;
    key.private
        .sign_pkcs1v15_sha1(&digest)
        .map_err(|_| crate::error::TpmError::bad_parameter())
}

/// Builds and signs a vTPM `DeepQuote`: a quote over the physical
/// platform's PCRs, carrying the nested virtual TPM's own quote
/// signature and PCR composite alongside (spec §4.5 "DeepQuote").
#[allow(clippy::too_many_arguments)]
pub fn deep_quote(
    keystore: &KeyStore,
    physical_pcr_engine: &PcrEngine,
    signing_key_handle: u32,
    physical_selection: &PcrSelection,
    extra_info_flags: u32,
    info_hashes: Vec<Digest>,
    vtpm_signature: Vec<u8>,
    vtpm_pcr_composite: Digest,
    external_data: Digest,
) -> TpmResult<DeepQuoteContainer> {
    let pcr_values: Vec<Digest> = physical_selection
        .indices()
        .into_iter()
        .map(|i| physical_pcr_engine.read(i))
        .collect::<TpmResult<_>>()?;
    let composite = physical_pcr_engine.composite(physical_selection);
    let info = QuoteInfo {
        version: [1, 1, 0, 0],
        composite_hash: composite,
        external_data,
    };
    let mut preimage = Vec::new();
    info.encode(&mut preimage);
    let digest = sha1(&preimage);
    let key = keystore.get(signing_key_handle)?;
    let raw_signature = key
        .private
        .sign_pkcs1v15_sha1(&digest)
        .map_err(|_| crate::error::TpmError::bad_parameter())?;
    let mut signature = [0u8; 256];
    let len = raw_signature.len().min(256);
    signature[..len].copy_from_slice(&raw_signature[..len]);
    Ok(DeepQuoteContainer {
        physical_pcr_selection: physical_selection.clone(),
        extra_info_flags,
        signature,
        info_hashes,
        pcr_values,
        vtpm_signature,
        vtpm_pcr_composite,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm12_crypto::RsaKeyPair;
    use tpm12_proto::key::{AlgorithmParms, EncScheme, Key12, RsaKeyParms, SigScheme};
    use tpm12_proto::pcr::PcrInfo;
    use tpm12_proto::{AuthDataUsage, KeyFlags, KeyUsage};

    fn install_signing_key(store: &mut KeyStore, handle: u32) {
        let pair = RsaKeyPair::generate(1024).unwrap();
        let pub_key = pair.public().modulus_bytes();
        let blob = Key12 {
            key_usage: KeyUsage::Signing,
            key_flags: KeyFlags::empty(),
            auth_data_usage: AuthDataUsage::Always,
            algorithm_parms: AlgorithmParms {
                algorithm_id: tpm12_proto::key::AlgorithmId::Rsa,
                enc_scheme: EncScheme::None,
                sig_scheme: SigScheme::Pkcs1v15Sha1,
                rsa: RsaKeyParms {
                    key_length: 1024,
                    num_primes: 2,
                    exponent: vec![],
                },
            },
            pcr_info: PcrInfo::None,
            pub_key,
            enc_data: vec![],
        };
        store.install_fixed(handle, blob, pair, [0u8; 20]);
    }

    #[test]
    fn quote_signature_verifies_against_the_signing_key() {
        let mut store = KeyStore::new();
        install_signing_key(&mut store, tpm12_proto::SRK_HANDLE);
        let mut pcr = PcrEngine::new();
        pcr.extend(10, &[1u8; 20]).unwrap();
        let selection = PcrSelection::single(10);
        let (signature, composite) =
            quote(&store, &pcr, tpm12_proto::SRK_HANDLE, &selection, [0u8; 20]).unwrap();
        let info = QuoteInfo {
            version: [1, 1, 0, 0],
            composite_hash: composite,
            external_data: [0u8; 20],
        };
        let mut preimage = Vec::new();
        info.encode(&mut preimage);
        let digest = sha1(&preimage);
        let public = store.get_pub_key(tpm12_proto::SRK_HANDLE).unwrap();
        assert!(public.verify_pkcs1v15_sha1(&digest, &signature).is_ok());
    }

    #[test]
    fn deep_quote_carries_every_selected_pcr_value() {
        let mut store = KeyStore::new();
        install_signing_key(&mut store, tpm12_proto::SRK_HANDLE);
        let mut pcr = PcrEngine::new();
        pcr.extend(17, &[2u8; 20]).unwrap();
        let selection = PcrSelection::single(17);
        let dq = deep_quote(
            &store,
            &pcr,
            tpm12_proto::SRK_HANDLE,
            &selection,
            0,
            vec![[7u8; 20]],
            vec![1, 2, 3],
            [9u8; 20],
            [0u8; 20],
        )
        .unwrap();
        assert_eq!(dq.pcr_values, vec![pcr.read(17).unwrap()]);
    }
}
