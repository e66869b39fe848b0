// SPDX-License-Identifier: MIT
//! One function per ordinal `tpm12-core::dispatcher` implements. Each
//! mirrors its handler in reverse: encode the inputs the dispatcher
//! decodes, decode the outputs it encodes (spec §4.10).

use crate::error::{ClientError, ClientResult};
use crate::session::AuthSession;
use crate::{call_auth, call_unauth, decode_opaque, encode_opaque, ordinal};
use std::io::{Read, Write};
use tpm12_crypto::random_nonce;
use tpm12_crypto::RsaPublic;
use tpm12_proto::key::Key12;
use tpm12_proto::nv::{CounterValue, CurrentTicks, DelegatePermissions, NvDataPublic};
use tpm12_proto::pcr::PcrSelection;
use tpm12_proto::quote::DeepQuoteContainer;
use tpm12_proto::{Codec, Digest, EntityType, KeyFlags, KeyUsage};

/// `TPM_OIAP`: opens a session not bound to any one entity.
pub fn oiap_open<T: Read + Write>(channel: &mut T) -> ClientResult<AuthSession> {
    let body = call_unauth(channel, ordinal::OIAP, &[])?;
    let (handle, body) = u32::decode(&body)?;
    let (nonce_even, _) = Digest::decode(body)?;
    Ok(AuthSession::new(handle, nonce_even))
}

/// `TPM_OSAP`: opens a session bound to `entity`, returning it alongside
/// the shared secret `HMAC(entityAuth, nonceEvenOSAP || nonceOddOSAP)` the
/// caller must supply to every subsequent `call_auth` against this session.
pub fn osap_open<T: Read + Write>(
    channel: &mut T,
    entity_type: EntityType,
    entity_value: u32,
    entity_auth: &Digest,
) -> ClientResult<(AuthSession, Digest)> {
    let nonce_odd_osap = random_nonce();
    let mut params = Vec::new();
    (entity_type as u16).encode(&mut params);
    entity_value.encode(&mut params);
    nonce_odd_osap.encode(&mut params);

    let body = call_unauth(channel, ordinal::OSAP, &params)?;
    let (handle, body) = u32::decode(&body)?;
    let (nonce_even, body) = Digest::decode(body)?;
    let (nonce_even_osap, _) = Digest::decode(body)?;
    let shared_secret = tpm12_crypto::hmac_sha1(
        entity_auth,
        &[nonce_even_osap.as_slice(), nonce_odd_osap.as_slice()].concat(),
    );
    Ok((AuthSession::new(handle, nonce_even), shared_secret))
}

/// `TPM_DSAP`: opens a session against a delegation row, secret
/// `HMAC(rowAuth, nonceOddDSAP)`.
pub fn dsap_open<T: Read + Write>(channel: &mut T, row_index: u32, row_auth: &Digest) -> ClientResult<(AuthSession, Digest)> {
    let nonce_odd_dsap = random_nonce();
    let mut params = Vec::new();
    row_index.encode(&mut params);
    nonce_odd_dsap.encode(&mut params);

    let body = call_unauth(channel, ordinal::DSAP, &params)?;
    let (handle, body) = u32::decode(&body)?;
    let (nonce_even, _) = Digest::decode(body)?;
    let shared_secret = tpm12_crypto::hmac_sha1(row_auth, &nonce_odd_dsap);
    Ok((AuthSession::new(handle, nonce_even), shared_secret))
}

/// `TPM_TakeOwnership`: the new owner and SRK auths travel OAEP-encrypted
/// under the endorsement key's public half, exactly as a real TPM requires
/// since they cross the wire before any session secures it.
#[allow(clippy::too_many_arguments)]
pub fn take_ownership<T: Read + Write>(
    channel: &mut T,
    ek_public: &RsaPublic,
    owner_auth: &Digest,
    srk_auth: &Digest,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    let enc_owner_auth = ek_public.oaep_encrypt(owner_auth).map_err(|_| ClientError::Crypto)?;
    let enc_srk_auth = ek_public.oaep_encrypt(srk_auth).map_err(|_| ClientError::Crypto)?;
    let mut params = Vec::new();
    encode_opaque(&enc_owner_auth, &mut params);
    encode_opaque(&enc_srk_auth, &mut params);
    call_auth(channel, ordinal::TAKE_OWNERSHIP, &params, session, owner_secret, continue_session)?;
    Ok(())
}

/// `TPM_Extend`.
pub fn extend<T: Read + Write>(channel: &mut T, pcr_index: u32, in_digest: &Digest) -> ClientResult<Digest> {
    let mut params = Vec::new();
    pcr_index.encode(&mut params);
    in_digest.encode(&mut params);
    let body = call_unauth(channel, ordinal::EXTEND, &params)?;
    let (out_digest, _) = Digest::decode(&body)?;
    Ok(out_digest)
}

/// `TPM_PcrRead`.
pub fn pcr_read<T: Read + Write>(channel: &mut T, pcr_index: u32) -> ClientResult<Digest> {
    let body = call_unauth(channel, ordinal::PCR_READ, &pcr_index.to_be_bytes())?;
    let (value, _) = Digest::decode(&body)?;
    Ok(value)
}

/// `TPM_Quote`: returns `(pcrCompositeHash, signature)`.
#[allow(clippy::too_many_arguments)]
pub fn quote<T: Read + Write>(
    channel: &mut T,
    key_handle: u32,
    external_data: &Digest,
    selection: &PcrSelection,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<(Digest, Vec<u8>)> {
    let mut params = Vec::new();
    key_handle.encode(&mut params);
    external_data.encode(&mut params);
    selection.encode(&mut params);
    let body = call_auth(channel, ordinal::QUOTE, &params, session, secret, continue_session)?;
    let (composite, body) = Digest::decode(&body)?;
    let (signature, _) = decode_opaque(body)?;
    Ok((composite, signature))
}

/// `TPM_Quote2`: returns the opaque `TPM_PCR_INFO_SHORT || ...` signature
/// blob, left undeserialized since the host has no further use for its
/// internal structure beyond verifying the signature.
#[allow(clippy::too_many_arguments)]
pub fn quote2<T: Read + Write>(
    channel: &mut T,
    key_handle: u32,
    external_data: &Digest,
    selection: &PcrSelection,
    locality_at_release: u8,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let mut params = Vec::new();
    key_handle.encode(&mut params);
    external_data.encode(&mut params);
    selection.encode(&mut params);
    locality_at_release.encode(&mut params);
    let body = call_auth(channel, ordinal::QUOTE2, &params, session, secret, continue_session)?;
    let (signature, _) = decode_opaque(&body)?;
    Ok(signature)
}

/// `TPM_CreateWrapKey`.
#[allow(clippy::too_many_arguments)]
pub fn create_wrap_key<T: Read + Write>(
    channel: &mut T,
    parent_handle: u32,
    usage_auth: &Digest,
    migration_auth: &Digest,
    key_length: u32,
    key_usage: KeyUsage,
    key_flags: KeyFlags,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<Key12> {
    let mut params = Vec::new();
    parent_handle.encode(&mut params);
    usage_auth.encode(&mut params);
    migration_auth.encode(&mut params);
    key_length.encode(&mut params);
    (key_usage as u16).encode(&mut params);
    key_flags.bits().encode(&mut params);
    let body = call_auth(channel, ordinal::CREATE_WRAP_KEY, &params, session, secret, continue_session)?;
    let (blob, _) = Key12::decode(&body, false)?;
    Ok(blob)
}

/// `TPM_LoadKey2`. Returns the newly assigned key handle.
pub fn load_key2<T: Read + Write>(
    channel: &mut T,
    parent_handle: u32,
    blob: &Key12,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<u32> {
    let mut params = Vec::new();
    parent_handle.encode(&mut params);
    let mut blob_bytes = Vec::new();
    blob.encode(&mut blob_bytes);
    encode_opaque(&blob_bytes, &mut params);
    let body = call_auth(channel, ordinal::LOAD_KEY2, &params, session, secret, continue_session)?;
    let (handle, _) = u32::decode(&body)?;
    Ok(handle)
}

/// `TPM_GetPubKey`. Returns the raw modulus bytes.
pub fn get_pub_key<T: Read + Write>(
    channel: &mut T,
    key_handle: u32,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let body = call_auth(channel, ordinal::GET_PUB_KEY, &key_handle.to_be_bytes(), session, secret, continue_session)?;
    let (modulus, _) = decode_opaque(&body)?;
    Ok(modulus)
}

/// `TPM_FlushSpecific`. Unauthenticated: flushing a handle you do not hold
/// costs you nothing the device will not already reject.
pub fn flush_specific<T: Read + Write>(channel: &mut T, handle: u32, resource_type: u32) -> ClientResult<()> {
    let mut params = Vec::new();
    handle.encode(&mut params);
    resource_type.encode(&mut params);
    call_unauth(channel, ordinal::FLUSH_SPECIFIC, &params)?;
    Ok(())
}

/// `TPM_NV_DefineSpace`, owner-authorized.
pub fn nv_define_space<T: Read + Write>(
    channel: &mut T,
    public: &NvDataPublic,
    area_auth: &Digest,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    let mut params = Vec::new();
    public.encode(&mut params);
    area_auth.encode(&mut params);
    call_auth(channel, ordinal::NV_DEFINE_SPACE, &params, session, owner_secret, continue_session)?;
    Ok(())
}

fn nv_write_params(nv_index: u32, offset: u32, data: &[u8]) -> Vec<u8> {
    let mut params = Vec::new();
    nv_index.encode(&mut params);
    offset.encode(&mut params);
    encode_opaque(data, &mut params);
    params
}

/// `TPM_NV_WriteValue`, owner-authorized.
pub fn nv_write_value<T: Read + Write>(
    channel: &mut T,
    nv_index: u32,
    offset: u32,
    data: &[u8],
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    let params = nv_write_params(nv_index, offset, data);
    call_auth(channel, ordinal::NV_WRITE_VALUE, &params, session, owner_secret, continue_session)?;
    Ok(())
}

/// `TPM_NV_WriteValueAuth`, authorized by the index's own area auth.
pub fn nv_write_value_auth<T: Read + Write>(
    channel: &mut T,
    nv_index: u32,
    offset: u32,
    data: &[u8],
    session: &mut AuthSession,
    area_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    let params = nv_write_params(nv_index, offset, data);
    call_auth(channel, ordinal::NV_WRITE_VALUE_AUTH, &params, session, area_secret, continue_session)?;
    Ok(())
}

fn nv_read_params(nv_index: u32, offset: u32, len: u32) -> Vec<u8> {
    let mut params = Vec::new();
    nv_index.encode(&mut params);
    offset.encode(&mut params);
    len.encode(&mut params);
    params
}

/// `TPM_NV_ReadValue`, owner-authorized.
pub fn nv_read_value<T: Read + Write>(
    channel: &mut T,
    nv_index: u32,
    offset: u32,
    len: u32,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let params = nv_read_params(nv_index, offset, len);
    let body = call_auth(channel, ordinal::NV_READ_VALUE, &params, session, owner_secret, continue_session)?;
    let (data, _) = decode_opaque(&body)?;
    Ok(data)
}

/// `TPM_NV_ReadValueAuth`, authorized by the index's own area auth.
pub fn nv_read_value_auth<T: Read + Write>(
    channel: &mut T,
    nv_index: u32,
    offset: u32,
    len: u32,
    session: &mut AuthSession,
    area_secret: &Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let params = nv_read_params(nv_index, offset, len);
    let body = call_auth(channel, ordinal::NV_READ_VALUE_AUTH, &params, session, area_secret, continue_session)?;
    let (data, _) = decode_opaque(&body)?;
    Ok(data)
}

/// `TPM_CreateCounter`, owner-authorized.
pub fn create_counter<T: Read + Write>(
    channel: &mut T,
    initial_value: u32,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<CounterValue> {
    let body = call_auth(
        channel,
        ordinal::CREATE_COUNTER,
        &initial_value.to_be_bytes(),
        session,
        owner_secret,
        continue_session,
    )?;
    let (value, _) = CounterValue::decode(&body)?;
    Ok(value)
}

/// `TPM_IncrementCounter`, owner-authorized and rate-limited by the device
/// (a too-soon call comes back as `ClientError::Tpm(ResponseCode::Retry)`).
pub fn increment_counter<T: Read + Write>(
    channel: &mut T,
    label: u32,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<CounterValue> {
    let body = call_auth(
        channel,
        ordinal::INCREMENT_COUNTER,
        &label.to_be_bytes(),
        session,
        owner_secret,
        continue_session,
    )?;
    let (value, _) = CounterValue::decode(&body)?;
    Ok(value)
}

/// `TPM_ReadCounter`. Unauthenticated.
pub fn read_counter<T: Read + Write>(channel: &mut T, label: u32) -> ClientResult<CounterValue> {
    let body = call_unauth(channel, ordinal::READ_COUNTER, &label.to_be_bytes())?;
    let (value, _) = CounterValue::decode(&body)?;
    Ok(value)
}

/// `TPM_ReleaseCounter`, owner-authorized.
pub fn release_counter<T: Read + Write>(
    channel: &mut T,
    label: u32,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    call_auth(channel, ordinal::RELEASE_COUNTER, &label.to_be_bytes(), session, owner_secret, continue_session)?;
    Ok(())
}

/// `TPM_ReadCurrentTicks`. Unauthenticated.
pub fn read_current_ticks<T: Read + Write>(channel: &mut T) -> ClientResult<CurrentTicks> {
    let body = call_unauth(channel, ordinal::READ_CURRENT_TICKS, &[])?;
    let (ticks, _) = CurrentTicks::decode(&body)?;
    Ok(ticks)
}

/// `TPM_SetOrdinalAuditStatus`, owner-authorized.
pub fn set_ordinal_audit_status<T: Read + Write>(
    channel: &mut T,
    target_ordinal: u32,
    audited: bool,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    let mut params = Vec::new();
    target_ordinal.encode(&mut params);
    u8::from(audited).encode(&mut params);
    call_auth(channel, ordinal::SET_ORDINAL_AUDIT_STATUS, &params, session, owner_secret, continue_session)?;
    Ok(())
}

/// `Delegate_Manage` opcodes, matching `tpm12_core::dispatcher`'s mapping
/// (0 = CREATE, 1 = ENABLE, 2 = DISABLE, 3 = INVALIDATE, 4 = ADMIN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateManageOp {
    Create,
    Enable,
    Disable,
    Invalidate,
    Admin,
}

/// What `delegate_manage` hands back: a fresh family id for `Create`, the
/// flipped admin bit for `Admin`, nothing for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateManageResult {
    FamilyId(u32),
    AdminBit(bool),
    None,
}

/// `Delegate_Manage`, owner-authorized.
pub fn delegate_manage<T: Read + Write>(
    channel: &mut T,
    family_id: u32,
    op: DelegateManageOp,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<DelegateManageResult> {
    let opcode = match op {
        DelegateManageOp::Create => 0u8,
        DelegateManageOp::Enable => 1,
        DelegateManageOp::Disable => 2,
        DelegateManageOp::Invalidate => 3,
        DelegateManageOp::Admin => 4,
    };
    let mut params = Vec::new();
    family_id.encode(&mut params);
    opcode.encode(&mut params);
    let body = call_auth(channel, ordinal::DELEGATE_MANAGE, &params, session, owner_secret, continue_session)?;
    match op {
        DelegateManageOp::Create => {
            let (id, _) = u32::decode(&body)?;
            Ok(DelegateManageResult::FamilyId(id))
        }
        DelegateManageOp::Admin => {
            let (admin, _) = u8::decode(&body)?;
            Ok(DelegateManageResult::AdminBit(admin != 0))
        }
        _ => Ok(DelegateManageResult::None),
    }
}

/// `Delegate_CreateOwnerDelegation`, owner-authorized. Returns the new row
/// index the caller presents to `Delegate_VerifyAuth` or `DSAP`.
#[allow(clippy::too_many_arguments)]
pub fn delegate_create_owner_delegation<T: Read + Write>(
    channel: &mut T,
    permissions: DelegatePermissions,
    label: u8,
    family_id: u32,
    verification_digest: &Digest,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<u32> {
    let mut params = Vec::new();
    permissions.per1.encode(&mut params);
    permissions.per2.encode(&mut params);
    label.encode(&mut params);
    family_id.encode(&mut params);
    verification_digest.encode(&mut params);
    let body = call_auth(
        channel,
        ordinal::DELEGATE_CREATE_OWNER_DELEGATION,
        &params,
        session,
        owner_secret,
        continue_session,
    )?;
    let (row, _) = u32::decode(&body)?;
    Ok(row)
}

/// `Delegate_UpdateVerification`, owner-authorized. Returns the family's
/// new verification count.
pub fn delegate_update_verification<T: Read + Write>(
    channel: &mut T,
    family_id: u32,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<u32> {
    let body = call_auth(
        channel,
        ordinal::DELEGATE_UPDATE_VERIFICATION,
        &family_id.to_be_bytes(),
        session,
        owner_secret,
        continue_session,
    )?;
    let (count, _) = u32::decode(&body)?;
    Ok(count)
}

/// `Delegate_VerifyAuth`. Unauthenticated: the presented digest is the
/// credential. Returns the row's family id on success.
pub fn delegate_verify_auth<T: Read + Write>(channel: &mut T, row_index: u32, digest: &Digest) -> ClientResult<u32> {
    let mut params = Vec::new();
    row_index.encode(&mut params);
    digest.encode(&mut params);
    let body = call_unauth(channel, ordinal::DELEGATE_VERIFY_AUTH, &params)?;
    let (family_id, _) = u32::decode(&body)?;
    Ok(family_id)
}

/// `TPM_EstablishTransport`: the AES-128 session key travels OAEP-encrypted
/// under the wrapping key, exactly like `TakeOwnership`'s auth values.
/// Returns `(transportHandle, currentTicks, nonceEven)`.
#[allow(clippy::too_many_arguments)]
pub fn establish_transport<T: Read + Write>(
    channel: &mut T,
    enc_key_handle: u32,
    wrapping_key_public: &RsaPublic,
    session_key: &[u8; 16],
    encrypt: bool,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<(u32, CurrentTicks, Digest)> {
    let enc_session_key = wrapping_key_public.oaep_encrypt(session_key).map_err(|_| ClientError::Crypto)?;
    let mut params = Vec::new();
    enc_key_handle.encode(&mut params);
    u8::from(encrypt).encode(&mut params);
    encode_opaque(&enc_session_key, &mut params);
    let body = call_auth(channel, ordinal::ESTABLISH_TRANSPORT, &params, session, secret, continue_session)?;
    let (handle, body) = u32::decode(&body)?;
    let (ticks, body) = CurrentTicks::decode(body)?;
    let (nonce_even, _) = Digest::decode(body)?;
    Ok((handle, ticks, nonce_even))
}

/// `TPM_ReleaseTransportSigned`. Returns the raw signature bytes over
/// `TPM_SIGN_INFO("TRAN", transportDigest)`.
#[allow(clippy::too_many_arguments)]
pub fn release_transport_signed<T: Read + Write>(
    channel: &mut T,
    signing_key_handle: u32,
    external_data: &Digest,
    transport_handle: u32,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let mut params = Vec::new();
    signing_key_handle.encode(&mut params);
    external_data.encode(&mut params);
    transport_handle.encode(&mut params);
    let body = call_auth(channel, ordinal::RELEASE_TRANSPORT_SIGNED, &params, session, secret, continue_session)?;
    let (signature, _) = decode_opaque(&body)?;
    Ok(signature)
}

/// `TPM_ResetLockValue`, owner-authorized.
pub fn reset_lock_value<T: Read + Write>(
    channel: &mut T,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    call_auth(channel, ordinal::RESET_LOCK_VALUE, &[], session, owner_secret, continue_session)?;
    Ok(())
}

/// `TPM_GetTestResult`. Always answered even while wedged or before
/// ownership, per spec §7.
pub fn get_test_result<T: Read + Write>(channel: &mut T) -> ClientResult<Vec<u8>> {
    let body = call_unauth(channel, ordinal::GET_TEST_RESULT, &[])?;
    let (report, _) = decode_opaque(&body)?;
    Ok(report)
}

/// `TPM_Startup(TPM_ST_CLEAR)`.
pub fn startup<T: Read + Write>(channel: &mut T) -> ClientResult<()> {
    call_unauth(channel, ordinal::STARTUP, &[])?;
    Ok(())
}

/// `TPM_SaveState`. Returns the opaque savestate blob bytes; this crate has
/// no need to interpret its structure.
pub fn save_state<T: Read + Write>(channel: &mut T) -> ClientResult<Vec<u8>> {
    call_unauth(channel, ordinal::SAVE_STATE, &[])
}

/// `TPM_PCR_Reset`. Unauthenticated, like `Extend`/`PcrRead`.
pub fn pcr_reset<T: Read + Write>(channel: &mut T, selection: &PcrSelection) -> ClientResult<()> {
    let mut params = Vec::new();
    selection.encode(&mut params);
    call_unauth(channel, ordinal::PCR_RESET, &params)?;
    Ok(())
}

/// `TPM_GetAuditDigestSigned`. Returns `(auditDigest, signature)`.
#[allow(clippy::too_many_arguments)]
pub fn get_audit_digest_signed<T: Read + Write>(
    channel: &mut T,
    key_handle: u32,
    close_audit: bool,
    anti_replay: &Digest,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<(Digest, Vec<u8>)> {
    let mut params = Vec::new();
    key_handle.encode(&mut params);
    u8::from(close_audit).encode(&mut params);
    anti_replay.encode(&mut params);
    let body = call_auth(channel, ordinal::GET_AUDIT_DIGEST_SIGNED, &params, session, secret, continue_session)?;
    let (digest, body) = Digest::decode(&body)?;
    let (signature, _) = decode_opaque(body)?;
    Ok((digest, signature))
}

/// `Delegate_CreateKeyDelegation`, authorized by the key whose commands the
/// new row will be allowed to exercise. Returns the new row index.
#[allow(clippy::too_many_arguments)]
pub fn delegate_create_key_delegation<T: Read + Write>(
    channel: &mut T,
    key_handle: u32,
    permissions: DelegatePermissions,
    label: u8,
    verification_digest: &Digest,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<u32> {
    let mut params = Vec::new();
    key_handle.encode(&mut params);
    permissions.per1.encode(&mut params);
    permissions.per2.encode(&mut params);
    label.encode(&mut params);
    verification_digest.encode(&mut params);
    let body = call_auth(
        channel,
        ordinal::DELEGATE_CREATE_KEY_DELEGATION,
        &params,
        session,
        secret,
        continue_session,
    )?;
    let (row, _) = u32::decode(&body)?;
    Ok(row)
}

/// `Delegate_LoadOwnerDelegation`, owner-authorized. Reinstalls a
/// previously exported row at `row_index`.
#[allow(clippy::too_many_arguments)]
pub fn delegate_load_owner_delegation<T: Read + Write>(
    channel: &mut T,
    row_index: u32,
    family_id: u32,
    permissions: DelegatePermissions,
    label: u8,
    verification_count: u32,
    verification_digest: &Digest,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    let mut params = Vec::new();
    row_index.encode(&mut params);
    family_id.encode(&mut params);
    permissions.per1.encode(&mut params);
    permissions.per2.encode(&mut params);
    label.encode(&mut params);
    verification_count.encode(&mut params);
    verification_digest.encode(&mut params);
    call_auth(
        channel,
        ordinal::DELEGATE_LOAD_OWNER_DELEGATION,
        &params,
        session,
        owner_secret,
        continue_session,
    )?;
    Ok(())
}

/// A read-out row from `Delegate_ReadTable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateRowSnapshot {
    pub index: u32,
    pub family_id: u32,
    pub permissions: DelegatePermissions,
    pub label: u8,
    pub verification_count: u32,
    pub verification_digest: Digest,
    pub bound_key: Option<u32>,
}

/// A read-out family from `Delegate_ReadTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegateFamilySnapshot {
    pub id: u32,
    pub state: u8,
    pub verification_count: u32,
    pub admin: bool,
}

/// `Delegate_ReadTable`. Unauthenticated: the table itself carries no
/// secrets, only row bookkeeping.
pub fn delegate_read_table<T: Read + Write>(
    channel: &mut T,
) -> ClientResult<(Vec<DelegateFamilySnapshot>, Vec<DelegateRowSnapshot>)> {
    let body = call_unauth(channel, ordinal::DELEGATE_READ_TABLE, &[])?;
    let (num_families, mut body) = u32::decode(&body)?;
    let mut families = Vec::with_capacity(num_families as usize);
    for _ in 0..num_families {
        let (id, rest) = u32::decode(body)?;
        let (state, rest) = u8::decode(rest)?;
        let (verification_count, rest) = u32::decode(rest)?;
        let (admin, rest) = u8::decode(rest)?;
        families.push(DelegateFamilySnapshot {
            id,
            state,
            verification_count,
            admin: admin != 0,
        });
        body = rest;
    }
    let (num_rows, mut body) = u32::decode(body)?;
    let mut rows = Vec::with_capacity(num_rows as usize);
    for _ in 0..num_rows {
        let (index, rest) = u32::decode(body)?;
        let (family_id, rest) = u32::decode(rest)?;
        let (per1, rest) = u32::decode(rest)?;
        let (per2, rest) = u32::decode(rest)?;
        let (label, rest) = u8::decode(rest)?;
        let (verification_count, rest) = u32::decode(rest)?;
        let (verification_digest, rest) = Digest::decode(rest)?;
        let (bound_key_raw, rest) = u32::decode(rest)?;
        rows.push(DelegateRowSnapshot {
            index,
            family_id,
            permissions: DelegatePermissions { per1, per2 },
            label,
            verification_count,
            verification_digest,
            bound_key: if bound_key_raw == 0 { None } else { Some(bound_key_raw) },
        });
        body = rest;
    }
    Ok((families, rows))
}

/// `DeepQuote`, a vTPM extension layered on top of `Quote` (spec §4.5).
#[allow(clippy::too_many_arguments)]
pub fn deep_quote<T: Read + Write>(
    channel: &mut T,
    key_handle: u32,
    external_data: &Digest,
    physical_selection: &PcrSelection,
    extra_info_flags: u32,
    info_hashes: &[Digest],
    vtpm_signature: &[u8],
    vtpm_pcr_composite: &Digest,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<DeepQuoteContainer> {
    let mut params = Vec::new();
    key_handle.encode(&mut params);
    external_data.encode(&mut params);
    physical_selection.encode(&mut params);
    extra_info_flags.encode(&mut params);
    (info_hashes.len() as u32).encode(&mut params);
    for hash in info_hashes {
        hash.encode(&mut params);
    }
    encode_opaque(vtpm_signature, &mut params);
    vtpm_pcr_composite.encode(&mut params);
    let body = call_auth(channel, ordinal::DEEP_QUOTE, &params, session, secret, continue_session)?;
    let (container, _) = DeepQuoteContainer::decode(&body)?;
    Ok(container)
}

/// `AuthorizeMigrationKey`'s MIGRATE/REWRAP scheme selector, matching
/// `tpm12_core::keystore::MigrationScheme`'s wire encoding (0 = MIGRATE,
/// 1 = REWRAP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationScheme {
    Migrate,
    Rewrap,
}

impl MigrationScheme {
    fn wire(self) -> u8 {
        match self {
            MigrationScheme::Migrate => 0,
            MigrationScheme::Rewrap => 1,
        }
    }
}

/// `TPM_AuthorizeMigrationKey`, owner-authorized. Returns the `authBlob`
/// `CreateMigrationBlob` must be handed back.
pub fn authorize_migration_key<T: Read + Write>(
    channel: &mut T,
    scheme: MigrationScheme,
    destination: &RsaPublic,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<Digest> {
    let mut params = Vec::new();
    scheme.wire().encode(&mut params);
    encode_opaque(&destination.modulus_bytes(), &mut params);
    let body = call_auth(channel, ordinal::AUTHORIZE_MIGRATION_KEY, &params, session, owner_secret, continue_session)?;
    let (auth_blob, _) = Digest::decode(&body)?;
    Ok(auth_blob)
}

/// `TPM_CreateMigrationBlob`, authorized by the key being migrated.
/// Returns `(rndBlob, migratedBlob)` -- `rndBlob` is empty under MIGRATE.
#[allow(clippy::too_many_arguments)]
pub fn create_migration_blob<T: Read + Write>(
    channel: &mut T,
    key_handle: u32,
    scheme: MigrationScheme,
    auth_blob: &Digest,
    destination: &RsaPublic,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<(Vec<u8>, Vec<u8>)> {
    let mut params = Vec::new();
    key_handle.encode(&mut params);
    scheme.wire().encode(&mut params);
    auth_blob.encode(&mut params);
    encode_opaque(&destination.modulus_bytes(), &mut params);
    let body = call_auth(channel, ordinal::CREATE_MIGRATION_BLOB, &params, session, secret, continue_session)?;
    let (rnd_blob, body) = decode_opaque(&body)?;
    let (migrated_blob, _) = decode_opaque(body)?;
    Ok((rnd_blob, migrated_blob))
}

/// `TPM_ConvertMigrationBlob`, authorized by the key that will unwrap the
/// migrated blob on the destination TPM.
#[allow(clippy::too_many_arguments)]
pub fn convert_migration_blob<T: Read + Write>(
    channel: &mut T,
    unwrap_handle: u32,
    new_parent_handle: u32,
    scheme: MigrationScheme,
    rnd_blob: &[u8],
    migrated_blob: &[u8],
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let mut params = Vec::new();
    unwrap_handle.encode(&mut params);
    new_parent_handle.encode(&mut params);
    scheme.wire().encode(&mut params);
    encode_opaque(rnd_blob, &mut params);
    encode_opaque(migrated_blob, &mut params);
    let body = call_auth(channel, ordinal::CONVERT_MIGRATION_BLOB, &params, session, secret, continue_session)?;
    let (converted, _) = decode_opaque(&body)?;
    Ok(converted)
}

/// `CMK_ApproveMA`, owner-authorized: appends a migration selection
/// authority's digest to the pre-approved list a CMK may migrate to.
pub fn cmk_approve_ma<T: Read + Write>(
    channel: &mut T,
    msa_digest: &[u8],
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<()> {
    let mut params = Vec::new();
    encode_opaque(msa_digest, &mut params);
    call_auth(channel, ordinal::CMK_APPROVE_MA, &params, session, owner_secret, continue_session)?;
    Ok(())
}

/// `CMK_CreateKey`, authorized by the parent key. Like `create_wrap_key`,
/// but bound to a pre-approved migration selection authority rather than a
/// caller-chosen migration auth.
#[allow(clippy::too_many_arguments)]
pub fn cmk_create_key<T: Read + Write>(
    channel: &mut T,
    parent_handle: u32,
    usage_auth: &Digest,
    msa_digest: &Digest,
    key_length: u32,
    key_usage: KeyUsage,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<Key12> {
    let mut params = Vec::new();
    parent_handle.encode(&mut params);
    usage_auth.encode(&mut params);
    msa_digest.encode(&mut params);
    key_length.encode(&mut params);
    (key_usage as u16).encode(&mut params);
    let body = call_auth(channel, ordinal::CMK_CREATE_KEY, &params, session, secret, continue_session)?;
    let (blob, _) = Key12::decode(&body, false)?;
    Ok(blob)
}

/// `CMK_CreateTicket`, owner-authorized. Returns the restriction ticket
/// `cmk_create_blob` requires.
pub fn cmk_create_ticket<T: Read + Write>(
    channel: &mut T,
    msa_digest: &Digest,
    session: &mut AuthSession,
    owner_secret: &Digest,
    continue_session: bool,
) -> ClientResult<Digest> {
    let body = call_auth(channel, ordinal::CMK_CREATE_TICKET, msa_digest, session, owner_secret, continue_session)?;
    let (ticket, _) = Digest::decode(&body)?;
    Ok(ticket)
}

/// `CMK_CreateBlob`, authorized by the CMK being migrated.
#[allow(clippy::too_many_arguments)]
pub fn cmk_create_blob<T: Read + Write>(
    channel: &mut T,
    key_handle: u32,
    restriction_ticket: &Digest,
    destination: &RsaPublic,
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let mut params = Vec::new();
    key_handle.encode(&mut params);
    restriction_ticket.encode(&mut params);
    encode_opaque(&destination.modulus_bytes(), &mut params);
    let body = call_auth(channel, ordinal::CMK_CREATE_BLOB, &params, session, secret, continue_session)?;
    let (migrated_blob, _) = decode_opaque(&body)?;
    Ok(migrated_blob)
}

/// `CMK_ConvertMigration`, authorized by the new parent key on the
/// destination TPM.
#[allow(clippy::too_many_arguments)]
pub fn cmk_convert_migration<T: Read + Write>(
    channel: &mut T,
    destination_handle: u32,
    new_parent_handle: u32,
    migrated_blob: &[u8],
    session: &mut AuthSession,
    secret: &Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let mut params = Vec::new();
    destination_handle.encode(&mut params);
    new_parent_handle.encode(&mut params);
    encode_opaque(migrated_blob, &mut params);
    let body = call_auth(channel, ordinal::CMK_CONVERT_MIGRATION, &params, session, secret, continue_session)?;
    let (converted, _) = decode_opaque(&body)?;
    Ok(converted)
}
