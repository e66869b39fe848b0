// SPDX-License-Identifier: MIT
//! The ordinal dispatcher: the single `ExecuteCommand(bytes) -> bytes` entry
//! point that ties every subsystem together (spec §4.1).
//!
//! Framing, auth-trailer splitting and the inbound/outbound HMAC
//! constructions live here; the actual command semantics are one small
//! function per ordinal, each borrowing whichever subsystem of [`Tpm`] it
//! needs. There is no other place in this crate that builds a response
//! buffer.

use crate::error::{TpmError, TpmResult};
use crate::session::BoundEntity;
use crate::Tpm;
use tpm12_crypto::{hmac_sha1, sha1};
use tpm12_proto::{
    AuthTrailer, Codec, CommandHeader, Digest, EntityType, ResponseAuthTrailer, ResponseCode,
    ResponseHeader, Tag,
};

/// TPM 1.2 ordinals this implementation understands. Values follow the TCG
/// TPM Main Part 3 Commands assignment; only the ordinals this engine
/// actually implements are listed.
pub mod ordinal {
    pub const OIAP: u32 = 0x0A;
    pub const OSAP: u32 = 0x0B;
    pub const TAKE_OWNERSHIP: u32 = 0x0D;
    pub const EXTEND: u32 = 0x14;
    pub const PCR_READ: u32 = 0x15;
    pub const QUOTE: u32 = 0x16;
    pub const CREATE_WRAP_KEY: u32 = 0x1F;
    pub const GET_PUB_KEY: u32 = 0x21;
    pub const DSAP: u32 = 0x11;
    pub const RESET_LOCK_VALUE: u32 = 0x40;
    pub const LOAD_KEY2: u32 = 0x41;
    pub const SET_ORDINAL_AUDIT_STATUS: u32 = 0x8C;
    pub const SAVE_STATE: u32 = 0x98;
    pub const STARTUP: u32 = 0x99;
    pub const GET_TEST_RESULT: u32 = 0x54;
    pub const FLUSH_SPECIFIC: u32 = 0xBA;
    pub const NV_DEFINE_SPACE: u32 = 0xCC;
    pub const NV_WRITE_VALUE: u32 = 0xCD;
    pub const NV_WRITE_VALUE_AUTH: u32 = 0xCE;
    pub const NV_READ_VALUE: u32 = 0xCF;
    pub const NV_READ_VALUE_AUTH: u32 = 0xD0;
    pub const DELEGATE_MANAGE: u32 = 0xD2;
    pub const DELEGATE_CREATE_OWNER_DELEGATION: u32 = 0xD5;
    pub const DELEGATE_UPDATE_VERIFICATION: u32 = 0xD3;
    pub const DELEGATE_VERIFY_AUTH: u32 = 0xD1;
    pub const QUOTE2: u32 = 0xD8;
    pub const CREATE_COUNTER: u32 = 0xDC;
    pub const INCREMENT_COUNTER: u32 = 0xDD;
    pub const READ_COUNTER: u32 = 0xDE;
    pub const RELEASE_COUNTER: u32 = 0xDF;
    pub const ESTABLISH_TRANSPORT: u32 = 0xE6;
    pub const RELEASE_TRANSPORT_SIGNED: u32 = 0xE8;
    pub const READ_CURRENT_TICKS: u32 = 0xF1;
    pub const PCR_RESET: u32 = 0xC8;
    pub const GET_AUDIT_DIGEST_SIGNED: u32 = 0xA6;
    pub const DELEGATE_CREATE_KEY_DELEGATION: u32 = 0xD4;
    pub const DELEGATE_LOAD_OWNER_DELEGATION: u32 = 0xD6;
    pub const DELEGATE_READ_TABLE: u32 = 0xDB;
    /// A vendor/vTPM-extension ordinal, not part of the core TCG Part 3
    /// assignment -- DeepQuote is a vTPM addition layered on top of
    /// ordinary `Quote` (spec §4.5).
    pub const DEEP_QUOTE: u32 = 0x8A;
    pub const AUTHORIZE_MIGRATION_KEY: u32 = 0x2B;
    pub const CREATE_MIGRATION_BLOB: u32 = 0x28;
    pub const CONVERT_MIGRATION_BLOB: u32 = 0x2A;
    pub const CMK_CREATE_KEY: u32 = 0x13;
    pub const CMK_CREATE_TICKET: u32 = 0x12;
    pub const CMK_APPROVE_MA: u32 = 0x1D;
    pub const CMK_CREATE_BLOB: u32 = 0x89;
    pub const CMK_CONVERT_MIGRATION: u32 = 0x24;
}

/// `TPM_RESOURCE_TYPE` values `FlushSpecific` branches on (spec §4.2
/// "Explicit FlushSpecific evicts by handle"). Not exposed by
/// `tpm12-proto` since no other ordinal needs them.
const TPM_RT_KEY: u32 = 0x01;
const TPM_RT_AUTH: u32 = 0x02;
const TPM_RT_TRANS: u32 = 0x04;

/// Size in bytes of one wire auth trailer (`sessionHandle || nonceOdd ||
/// continueFlag || auth`).
const AUTH_TRAILER_SIZE: usize = 4 + tpm12_proto::DIGEST_SIZE + 1 + tpm12_proto::DIGEST_SIZE;

/// The single mutation entry point: decodes one command, dispatches it, and
/// always returns a well-formed response buffer -- a malformed request
/// never panics, it comes back as a `TPM_RESULT` response with an empty
/// body (spec §4.1 "Every command returns a response").
pub fn execute_command(tpm: &mut Tpm, request: &[u8]) -> Vec<u8> {
    tpm.sessions.tick();
    tpm.counters.tick();
    match try_execute(tpm, request) {
        Ok(response) => response,
        Err(err) => error_response(request, err),
    }
}

fn error_response(request: &[u8], err: TpmError) -> Vec<u8> {
    let tag = CommandHeader::decode(request)
        .ok()
        .map_or(Tag::RspCommand, |(header, _)| header.tag.response_tag());
    let header = ResponseHeader {
        tag,
        param_size: ResponseHeader::SIZE as u32,
        return_code: err.code(),
    };
    let mut out = Vec::with_capacity(ResponseHeader::SIZE);
    header.encode(&mut out);
    out
}

fn try_execute(tpm: &mut Tpm, request: &[u8]) -> TpmResult<Vec<u8>> {
    let (header, body) = CommandHeader::decode(request).map_err(|_| TpmError::bad_tag())?;
    if header.param_size as usize != request.len() {
        return Err(TpmError::size());
    }
    let expected_auths = expected_auth_count(header.ordinal).ok_or_else(TpmError::bad_ordinal)?;
    if header.tag.auth_count() != expected_auths {
        return Err(TpmError::bad_tag());
    }
    if header.ordinal != ordinal::STARTUP && header.ordinal != ordinal::GET_TEST_RESULT {
        tpm.require_ready()?;
    }

    let trailer_len = expected_auths as usize * AUTH_TRAILER_SIZE;
    if body.len() < trailer_len {
        return Err(TpmError::size());
    }
    let (params, mut trailer_bytes) = body.split_at(body.len() - trailer_len);
    let mut auths = Vec::with_capacity(expected_auths as usize);
    for _ in 0..expected_auths {
        let (trailer, rest) = AuthTrailer::decode(trailer_bytes).map_err(|_| TpmError::size())?;
        auths.push(trailer);
        trailer_bytes = rest;
    }

    let mut h1_preimage = Vec::with_capacity(4 + params.len());
    h1_preimage.extend_from_slice(&header.ordinal.to_be_bytes());
    h1_preimage.extend_from_slice(params);
    let h1 = sha1(&h1_preimage);

    let (out_params, contexts) = dispatch(tpm, header.ordinal, params, &auths, &h1)?;

    if tpm.counters.ordinal_is_audited(header.ordinal) {
        let in_digest = sha1(params);
        let out_digest = sha1(&out_params);
        tpm.counters.extend_audit(header.ordinal, &in_digest, &out_digest);
    }

    let trailers: Vec<ResponseAuthTrailer> = contexts
        .iter()
        .map(|ctx| response_auth_trailer(ctx, header.ordinal, ResponseCode::Success, &out_params))
        .collect();

    let mut body = out_params;
    for trailer in &trailers {
        trailer.encode(&mut body);
    }
    let response_header = ResponseHeader {
        tag: header.tag.response_tag(),
        param_size: (ResponseHeader::SIZE + body.len()) as u32,
        return_code: ResponseCode::Success,
    };
    let mut response = Vec::with_capacity(ResponseHeader::SIZE + body.len());
    response_header.encode(&mut response);
    response.extend_from_slice(&body);
    Ok(response)
}

fn expected_auth_count(ord: u32) -> Option<u8> {
    use ordinal::*;
    Some(match ord {
        OIAP | OSAP | DSAP => 0,
        TAKE_OWNERSHIP => 1,
        EXTEND | PCR_READ => 0,
        QUOTE | QUOTE2 => 1,
        CREATE_WRAP_KEY => 1,
        LOAD_KEY2 => 1,
        GET_PUB_KEY => 1,
        FLUSH_SPECIFIC => 0,
        NV_DEFINE_SPACE => 1,
        NV_WRITE_VALUE => 1,
        NV_WRITE_VALUE_AUTH => 1,
        NV_READ_VALUE => 1,
        NV_READ_VALUE_AUTH => 1,
        CREATE_COUNTER => 1,
        INCREMENT_COUNTER => 1,
        READ_COUNTER => 0,
        RELEASE_COUNTER => 1,
        READ_CURRENT_TICKS => 0,
        SET_ORDINAL_AUDIT_STATUS => 1,
        DELEGATE_MANAGE => 1,
        DELEGATE_CREATE_OWNER_DELEGATION => 1,
        DELEGATE_UPDATE_VERIFICATION => 1,
        DELEGATE_VERIFY_AUTH => 0,
        ESTABLISH_TRANSPORT => 1,
        RELEASE_TRANSPORT_SIGNED => 1,
        RESET_LOCK_VALUE => 1,
        GET_TEST_RESULT => 0,
        STARTUP => 0,
        SAVE_STATE => 0,
        PCR_RESET => 0,
        GET_AUDIT_DIGEST_SIGNED => 1,
        DELEGATE_CREATE_KEY_DELEGATION => 1,
        DELEGATE_LOAD_OWNER_DELEGATION => 1,
        DELEGATE_READ_TABLE => 0,
        DEEP_QUOTE => 1,
        AUTHORIZE_MIGRATION_KEY => 1,
        CREATE_MIGRATION_BLOB => 1,
        CONVERT_MIGRATION_BLOB => 1,
        CMK_CREATE_KEY => 1,
        CMK_CREATE_TICKET => 1,
        CMK_APPROVE_MA => 1,
        CMK_CREATE_BLOB => 1,
        CMK_CONVERT_MIGRATION => 1,
        _ => return None,
    })
}

/// The per-session state an `auth1` call needs to carry forward to build
/// the matching outbound HMAC once a handler's output parameters are
/// known.
struct AuthContext {
    fresh_nonce: Digest,
    secret: Digest,
    nonce_odd: Digest,
    continue_auth_session: bool,
}

type HandlerResult = TpmResult<(Vec<u8>, Vec<AuthContext>)>;

#[allow(clippy::too_many_lines)]
fn dispatch(tpm: &mut Tpm, ord: u32, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    use ordinal::*;
    match ord {
        OIAP => op_oiap(tpm, params),
        OSAP => op_osap(tpm, params),
        DSAP => op_dsap(tpm, params),
        TAKE_OWNERSHIP => op_take_ownership(tpm, params, auths, h1),
        EXTEND => op_extend(tpm, params),
        PCR_READ => op_pcr_read(tpm, params),
        QUOTE => op_quote(tpm, params, auths, h1),
        QUOTE2 => op_quote2(tpm, params, auths, h1),
        CREATE_WRAP_KEY => op_create_wrap_key(tpm, params, auths, h1),
        LOAD_KEY2 => op_load_key2(tpm, params, auths, h1),
        GET_PUB_KEY => op_get_pub_key(tpm, params, auths, h1),
        FLUSH_SPECIFIC => op_flush_specific(tpm, params),
        NV_DEFINE_SPACE => op_nv_define_space(tpm, params, auths, h1),
        NV_WRITE_VALUE => op_nv_write_value(tpm, params, auths, h1),
        NV_WRITE_VALUE_AUTH => op_nv_write_value_auth(tpm, params, auths, h1),
        NV_READ_VALUE => op_nv_read_value(tpm, params, auths, h1),
        NV_READ_VALUE_AUTH => op_nv_read_value_auth(tpm, params, auths, h1),
        CREATE_COUNTER => op_create_counter(tpm, params, auths, h1),
        INCREMENT_COUNTER => op_increment_counter(tpm, params, auths, h1),
        READ_COUNTER => op_read_counter(tpm, params),
        RELEASE_COUNTER => op_release_counter(tpm, params, auths, h1),
        READ_CURRENT_TICKS => op_read_current_ticks(tpm),
        SET_ORDINAL_AUDIT_STATUS => op_set_ordinal_audit_status(tpm, params, auths, h1),
        DELEGATE_MANAGE => op_delegate_manage(tpm, params, auths, h1),
        DELEGATE_CREATE_OWNER_DELEGATION => op_delegate_create_owner_delegation(tpm, params, auths, h1),
        DELEGATE_UPDATE_VERIFICATION => op_delegate_update_verification(tpm, params, auths, h1),
        DELEGATE_VERIFY_AUTH => op_delegate_verify_auth(tpm, params),
        ESTABLISH_TRANSPORT => op_establish_transport(tpm, params, auths, h1),
        RELEASE_TRANSPORT_SIGNED => op_release_transport_signed(tpm, params, auths, h1),
        RESET_LOCK_VALUE => op_reset_lock_value(tpm, auths, h1),
        GET_TEST_RESULT => op_get_test_result(tpm),
        STARTUP => op_startup(tpm),
        SAVE_STATE => op_save_state(tpm),
        PCR_RESET => op_pcr_reset(tpm, params),
        GET_AUDIT_DIGEST_SIGNED => op_get_audit_digest_signed(tpm, params, auths, h1),
        DELEGATE_CREATE_KEY_DELEGATION => op_delegate_create_key_delegation(tpm, params, auths, h1),
        DELEGATE_LOAD_OWNER_DELEGATION => op_delegate_load_owner_delegation(tpm, params, auths, h1),
        DELEGATE_READ_TABLE => op_delegate_read_table(tpm),
        DEEP_QUOTE => op_deep_quote(tpm, params, auths, h1),
        AUTHORIZE_MIGRATION_KEY => op_authorize_migration_key(tpm, params, auths, h1),
        CREATE_MIGRATION_BLOB => op_create_migration_blob(tpm, params, auths, h1),
        CONVERT_MIGRATION_BLOB => op_convert_migration_blob(tpm, params, auths, h1),
        CMK_CREATE_KEY => op_cmk_create_key(tpm, params, auths, h1),
        CMK_CREATE_TICKET => op_cmk_create_ticket(tpm, params, auths, h1),
        CMK_APPROVE_MA => op_cmk_approve_ma(tpm, params, auths, h1),
        CMK_CREATE_BLOB => op_cmk_create_blob(tpm, params, auths, h1),
        CMK_CONVERT_MIGRATION => op_cmk_convert_migration(tpm, params, auths, h1),
        _ => Err(TpmError::bad_ordinal()),
    }
}

// --- shared helpers -------------------------------------------------------

fn decode_opaque(buf: &[u8]) -> TpmResult<(Vec<u8>, &[u8])> {
    let (len, buf) = u32::decode(buf).map_err(|_| TpmError::size())?;
    if buf.len() < len as usize {
        return Err(TpmError::size());
    }
    let (data, rest) = buf.split_at(len as usize);
    Ok((data.to_vec(), rest))
}

fn encode_opaque(data: &[u8], buf: &mut Vec<u8>) {
    (data.len() as u32).encode(buf);
    buf.extend_from_slice(data);
}

fn to_digest(bytes: &[u8]) -> TpmResult<Digest> {
    bytes.try_into().map_err(|_| TpmError::bad_parameter())
}

/// `Srk`-vs-`Keyhandle` entity addressing: the SRK's fixed handle is its own
/// entity type on the wire, every other loaded key is a plain key handle.
fn key_entity(handle: u32) -> BoundEntity {
    if handle == tpm12_proto::SRK_HANDLE {
        BoundEntity {
            entity_type: EntityType::Srk,
            entity_value: handle,
        }
    } else {
        BoundEntity {
            entity_type: EntityType::Keyhandle,
            entity_value: handle,
        }
    }
}

fn auth1(tpm: &mut Tpm, auths: &[AuthTrailer], entity: BoundEntity, entity_auth: &Digest, h1: &Digest) -> TpmResult<AuthContext> {
    let trailer = auths.first().ok_or_else(TpmError::auth_fail)?;
    let (fresh_nonce, secret) = tpm.sessions.authorize(
        trailer.session_handle,
        entity,
        entity_auth,
        h1,
        &trailer.nonce_odd,
        trailer.continue_auth_session,
        &trailer.auth,
    )?;
    Ok(AuthContext {
        fresh_nonce,
        secret,
        nonce_odd: trailer.nonce_odd,
        continue_auth_session: trailer.continue_auth_session,
    })
}

fn response_auth_trailer(ctx: &AuthContext, ordinal: u32, return_code: ResponseCode, out_params: &[u8]) -> ResponseAuthTrailer {
    let mut h2_preimage = Vec::with_capacity(8 + out_params.len());
    h2_preimage.extend_from_slice(&(return_code as u32).to_be_bytes());
    h2_preimage.extend_from_slice(&ordinal.to_be_bytes());
    h2_preimage.extend_from_slice(out_params);
    let h2 = sha1(&h2_preimage);
    let auth = hmac_sha1(
        &ctx.secret,
        &[
            h2.as_slice(),
            ctx.fresh_nonce.as_slice(),
            ctx.nonce_odd.as_slice(),
            &[u8::from(ctx.continue_auth_session)],
        ]
        .concat(),
    );
    ResponseAuthTrailer {
        nonce_even: ctx.fresh_nonce,
        continue_auth_session: ctx.continue_auth_session,
        auth,
    }
}

fn owner_entity() -> BoundEntity {
    BoundEntity {
        entity_type: EntityType::Owner,
        entity_value: 0,
    }
}

// --- sessions --------------------------------------------------------------

fn op_oiap(tpm: &mut Tpm, _params: &[u8]) -> HandlerResult {
    let (handle, nonce_even) = tpm.sessions.oiap_open()?;
    let mut out = Vec::new();
    handle.encode(&mut out);
    nonce_even.encode(&mut out);
    Ok((out, Vec::new()))
}

fn op_osap(tpm: &mut Tpm, params: &[u8]) -> HandlerResult {
    let (entity_type_raw, params) = u16::decode(params).map_err(|_| TpmError::size())?;
    let entity_type = EntityType::from_repr(entity_type_raw).ok_or_else(TpmError::bad_parameter)?;
    let (entity_value, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (nonce_odd_osap, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let entity = BoundEntity { entity_type, entity_value };
    let entity_auth = tpm.entity_auth(entity)?;
    let (handle, nonce_even, nonce_even_osap) = tpm.sessions.osap_open(entity, &entity_auth, &nonce_odd_osap)?;
    let mut out = Vec::new();
    handle.encode(&mut out);
    nonce_even.encode(&mut out);
    nonce_even_osap.encode(&mut out);
    Ok((out, Vec::new()))
}

fn op_dsap(tpm: &mut Tpm, params: &[u8]) -> HandlerResult {
    let (row_index, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (nonce_odd_dsap, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let row_auth = tpm.delegation.row_secret(row_index)?;
    let (handle, nonce_even) = tpm.sessions.dsap_open(row_index, &row_auth, &nonce_odd_dsap)?;
    let mut out = Vec::new();
    handle.encode(&mut out);
    nonce_even.encode(&mut out);
    Ok((out, Vec::new()))
}

// --- ownership ---------------------------------------------------------

fn op_take_ownership(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (enc_owner_auth, params) = decode_opaque(params)?;
    let (enc_srk_auth, _params) = decode_opaque(params)?;
    let (owner_auth_bytes, srk_auth_bytes) = {
        let ek = tpm.keys.get(tpm12_proto::EK_HANDLE)?;
        let owner_auth_bytes = ek
            .private
            .oaep_decrypt(&enc_owner_auth)
            .map_err(|_| TpmError::Protocol(ResponseCode::Decrypterror))?;
        let srk_auth_bytes = ek
            .private
            .oaep_decrypt(&enc_srk_auth)
            .map_err(|_| TpmError::Protocol(ResponseCode::Decrypterror))?;
        (owner_auth_bytes, srk_auth_bytes)
    };
    let owner_auth = to_digest(&owner_auth_bytes)?;
    let srk_auth = to_digest(&srk_auth_bytes)?;
    let entity = owner_entity();
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    tpm.take_ownership(owner_auth, srk_auth)?;
    Ok((Vec::new(), vec![ctx]))
}

// --- PCRs ----------------------------------------------------------------

fn op_extend(tpm: &mut Tpm, params: &[u8]) -> HandlerResult {
    let (pcr_index, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (in_digest, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let out_digest = tpm.pcr.extend(pcr_index as usize, &in_digest)?;
    let mut out = Vec::new();
    out_digest.encode(&mut out);
    Ok((out, Vec::new()))
}

fn op_pcr_read(tpm: &mut Tpm, params: &[u8]) -> HandlerResult {
    let (pcr_index, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let value = tpm.pcr.read(pcr_index as usize)?;
    let mut out = Vec::new();
    value.encode(&mut out);
    Ok((out, Vec::new()))
}

/// Unauthenticated, like `EXTEND`/`PCR_READ`: `PcrEngine::reset` already
/// gates every index by its locality policy, which stands in for a
/// session here the same way it does for the other PCR ordinals.
fn op_pcr_reset(tpm: &mut Tpm, params: &[u8]) -> HandlerResult {
    let (selection, _params) = tpm12_proto::pcr::PcrSelection::decode(params).map_err(|_| TpmError::size())?;
    tpm.pcr.reset(&selection, tpm12_proto::Locality(0))?;
    Ok((Vec::new(), Vec::new()))
}

// --- quoting ---------------------------------------------------------------

fn op_quote(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (external_data, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (selection, _params) = tpm12_proto::pcr::PcrSelection::decode(params).map_err(|_| TpmError::size())?;
    let entity = key_entity(key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let (signature, composite) = crate::quote::quote(&tpm.keys, &tpm.pcr, key_handle, &selection, external_data)?;
    let mut out = Vec::new();
    composite.encode(&mut out);
    encode_opaque(&signature, &mut out);
    Ok((out, vec![ctx]))
}

fn op_quote2(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (external_data, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (selection, params) = tpm12_proto::pcr::PcrSelection::decode(params).map_err(|_| TpmError::size())?;
    let (locality_at_release, _params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let entity = key_entity(key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let signature = crate::quote::quote2(&tpm.keys, &tpm.pcr, key_handle, &selection, locality_at_release, external_data)?;
    let mut out = Vec::new();
    encode_opaque(&signature, &mut out);
    Ok((out, vec![ctx]))
}

fn op_deep_quote(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (external_data, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (physical_selection, params) = tpm12_proto::pcr::PcrSelection::decode(params).map_err(|_| TpmError::size())?;
    let (extra_info_flags, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (num_info_hashes, mut params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let mut info_hashes = Vec::with_capacity(num_info_hashes as usize);
    for _ in 0..num_info_hashes {
        let (hash, rest) = Digest::decode(params).map_err(|_| TpmError::size())?;
        info_hashes.push(hash);
        params = rest;
    }
    let (vtpm_signature, params) = decode_opaque(params)?;
    let (vtpm_pcr_composite, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let entity = key_entity(key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let container = crate::quote::deep_quote(
        &tpm.keys,
        &tpm.pcr,
        key_handle,
        &physical_selection,
        extra_info_flags,
        info_hashes,
        vtpm_signature,
        vtpm_pcr_composite,
        external_data,
    )?;
    let mut out = Vec::new();
    container.encode(&mut out);
    Ok((out, vec![ctx]))
}

// --- keys --------------------------------------------------------------

fn op_create_wrap_key(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (parent_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (usage_auth, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (migration_auth, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (key_length, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (usage_raw, params) = u16::decode(params).map_err(|_| TpmError::size())?;
    let key_usage = tpm12_proto::KeyUsage::from_repr(usage_raw).ok_or_else(TpmError::bad_parameter)?;
    let (flags_raw, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let key_flags = tpm12_proto::KeyFlags::from_bits_truncate(flags_raw);
    let entity = key_entity(parent_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let blob = tpm.keys.create_wrap_key(
        parent_handle,
        key_length as usize,
        key_usage,
        key_flags,
        usage_auth,
        migration_auth,
        tpm12_proto::pcr::PcrInfo::None,
    )?;
    let mut out = Vec::new();
    blob.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_load_key2(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (parent_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (blob_bytes, _params) = decode_opaque(params)?;
    let (blob, remainder) = tpm12_proto::key::Key12::decode(&blob_bytes, false).map_err(|_| TpmError::bad_parameter())?;
    if !remainder.is_empty() {
        return Err(TpmError::bad_parameter());
    }
    let entity = key_entity(parent_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let Tpm { keys, pcr, .. } = tpm;
    let handle = keys.load_key2(parent_handle, blob, &*pcr)?;
    let mut out = Vec::new();
    handle.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_get_pub_key(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (key_handle, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let entity = key_entity(key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let public = tpm.keys.get_pub_key(key_handle).ok_or_else(TpmError::invalid_key_handle)?;
    let mut out = Vec::new();
    encode_opaque(&public.modulus_bytes(), &mut out);
    Ok((out, vec![ctx]))
}

fn op_flush_specific(tpm: &mut Tpm, params: &[u8]) -> HandlerResult {
    let (handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (resource_type, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    match resource_type {
        TPM_RT_AUTH | TPM_RT_TRANS => tpm.sessions.flush_specific(handle),
        TPM_RT_KEY => tpm.keys.evict_key(handle)?,
        _ => return Err(TpmError::bad_parameter()),
    }
    Ok((Vec::new(), Vec::new()))
}

// --- migration and CMK ------------------------------------------------------

fn decode_migration_scheme(raw: u8) -> TpmResult<crate::keystore::MigrationScheme> {
    match raw {
        0 => Ok(crate::keystore::MigrationScheme::Migrate),
        1 => Ok(crate::keystore::MigrationScheme::Rewrap),
        _ => Err(TpmError::bad_parameter()),
    }
}

fn decode_rsa_public(params: &[u8]) -> TpmResult<(tpm12_crypto::RsaPublic, &[u8])> {
    let (modulus, rest) = decode_opaque(params)?;
    let public = tpm12_crypto::RsaPublic::from_modulus(&modulus, None).map_err(|_| TpmError::bad_parameter())?;
    Ok((public, rest))
}

fn op_authorize_migration_key(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (scheme_raw, params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let (destination, _params) = decode_rsa_public(params)?;
    let scheme = decode_migration_scheme(scheme_raw)?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let auth_blob = crate::keystore::KeyStore::authorize_migration_key(scheme, &destination);
    let mut out = Vec::new();
    auth_blob.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_create_migration_blob(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (scheme_raw, params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let (auth_blob, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (destination, _params) = decode_rsa_public(params)?;
    let scheme = decode_migration_scheme(scheme_raw)?;
    let entity = key_entity(key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let (rnd_blob, migrated_blob) = tpm.keys.create_migration_blob(key_handle, scheme, &auth_blob, &destination)?;
    let mut out = Vec::new();
    encode_opaque(&rnd_blob, &mut out);
    encode_opaque(&migrated_blob, &mut out);
    Ok((out, vec![ctx]))
}

fn op_convert_migration_blob(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (unwrap_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (new_parent_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (scheme_raw, params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let (rnd_blob, params) = decode_opaque(params)?;
    let (migrated_blob, _params) = decode_opaque(params)?;
    let scheme = decode_migration_scheme(scheme_raw)?;
    let entity = key_entity(unwrap_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let converted = tpm
        .keys
        .convert_migration_blob(unwrap_handle, new_parent_handle, scheme, &rnd_blob, &migrated_blob)?;
    let mut out = Vec::new();
    encode_opaque(&converted, &mut out);
    Ok((out, vec![ctx]))
}

fn op_cmk_approve_ma(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (msa_digest, _params) = decode_opaque(params)?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    tpm.keys.cmk_approve_ma(msa_digest);
    Ok((Vec::new(), vec![ctx]))
}

fn op_cmk_create_key(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (parent_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (usage_auth, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (msa_digest, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (key_length, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (usage_raw, _params) = u16::decode(params).map_err(|_| TpmError::size())?;
    let key_usage = tpm12_proto::KeyUsage::from_repr(usage_raw).ok_or_else(TpmError::bad_parameter)?;
    let entity = key_entity(parent_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let blob = tpm.keys.cmk_create_key(parent_handle, key_length as usize, key_usage, usage_auth, msa_digest)?;
    let mut out = Vec::new();
    blob.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_cmk_create_ticket(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (msa_digest, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let ticket = tpm.keys.cmk_create_ticket(&msa_digest)?;
    let mut out = Vec::new();
    ticket.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_cmk_create_blob(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (restriction_ticket, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (destination, _params) = decode_rsa_public(params)?;
    let entity = key_entity(key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let migrated_blob = tpm.keys.cmk_create_blob(key_handle, &restriction_ticket, &destination)?;
    let mut out = Vec::new();
    encode_opaque(&migrated_blob, &mut out);
    Ok((out, vec![ctx]))
}

fn op_cmk_convert_migration(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (destination_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (new_parent_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (migrated_blob, _params) = decode_opaque(params)?;
    let entity = key_entity(new_parent_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let converted = tpm.keys.cmk_convert_migration(destination_handle, new_parent_handle, &migrated_blob)?;
    let mut out = Vec::new();
    encode_opaque(&converted, &mut out);
    Ok((out, vec![ctx]))
}

// --- NV storage ----------------------------------------------------------

fn op_nv_define_space(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (public, params) = tpm12_proto::nv::NvDataPublic::decode(params).map_err(|_| TpmError::bad_parameter())?;
    let (area_auth, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    tpm.nv.define_space(public, area_auth)?;
    Ok((Vec::new(), vec![ctx]))
}

fn op_nv_write_value(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (nv_index, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (offset, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (data, _params) = decode_opaque(params)?;
    let entity = BoundEntity {
        entity_type: EntityType::NvOwner,
        entity_value: nv_index,
    };
    let owner_auth = tpm.entity_auth(owner_entity())?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let Tpm { nv, pcr, .. } = tpm;
    nv.write_value(nv_index, offset, &data, true, tpm12_proto::Locality(0), &*pcr)?;
    Ok((Vec::new(), vec![ctx]))
}

fn op_nv_write_value_auth(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (nv_index, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (offset, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (data, _params) = decode_opaque(params)?;
    let entity = BoundEntity {
        entity_type: EntityType::Nv,
        entity_value: nv_index,
    };
    let area_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &area_auth, h1)?;
    let Tpm { nv, pcr, .. } = tpm;
    nv.write_value(nv_index, offset, &data, false, tpm12_proto::Locality(0), &*pcr)?;
    Ok((Vec::new(), vec![ctx]))
}

fn op_nv_read_value(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (nv_index, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (offset, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (len, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let entity = BoundEntity {
        entity_type: EntityType::NvOwner,
        entity_value: nv_index,
    };
    let owner_auth = tpm.entity_auth(owner_entity())?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let data = tpm.nv.read_value(nv_index, offset, len, true, tpm12_proto::Locality(0), &tpm.pcr)?;
    let mut out = Vec::new();
    encode_opaque(&data, &mut out);
    Ok((out, vec![ctx]))
}

fn op_nv_read_value_auth(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (nv_index, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (offset, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (len, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let entity = BoundEntity {
        entity_type: EntityType::Nv,
        entity_value: nv_index,
    };
    let area_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &area_auth, h1)?;
    let data = tpm.nv.read_value(nv_index, offset, len, false, tpm12_proto::Locality(0), &tpm.pcr)?;
    let mut out = Vec::new();
    encode_opaque(&data, &mut out);
    Ok((out, vec![ctx]))
}

// --- counters and ticks -----------------------------------------------------

fn op_create_counter(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (initial_value, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let label = tpm.counters.create_counter(initial_value);
    let value = tpm.counters.read_counter(label)?;
    let mut out = Vec::new();
    value.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_increment_counter(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (label, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let entity = BoundEntity {
        entity_type: EntityType::CounterOwner,
        entity_value: label,
    };
    let owner_auth = tpm.entity_auth(owner_entity())?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let value = tpm.counters.increment_counter(label)?;
    let mut out = Vec::new();
    value.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_read_counter(tpm: &mut Tpm, params: &[u8]) -> HandlerResult {
    let (label, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let value = tpm.counters.read_counter(label)?;
    let mut out = Vec::new();
    value.encode(&mut out);
    Ok((out, Vec::new()))
}

fn op_release_counter(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (label, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    tpm.counters.release_counter(label)?;
    Ok((Vec::new(), vec![ctx]))
}

fn op_read_current_ticks(tpm: &mut Tpm) -> HandlerResult {
    let ticks = tpm.counters.read_current_ticks();
    let mut out = Vec::new();
    ticks.encode(&mut out);
    Ok((out, Vec::new()))
}

fn op_set_ordinal_audit_status(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (target_ordinal, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (audited_raw, _params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    tpm.counters.set_ordinal_audit_status(target_ordinal, audited_raw != 0);
    Ok((Vec::new(), vec![ctx]))
}

/// `GetAuditDigestSigned`: signs the running audit digest inside a
/// `TPM_SIGN_INFO("ADIG", …)` container, mirroring how
/// `op_release_transport_signed` signs its own fixed-tag info structure
/// (spec §4.7). `closeAudit` clears the chain once it has been signed.
fn op_get_audit_digest_signed(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (close_audit_raw, params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let (anti_replay, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let entity = key_entity(key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let digest = tpm.counters.audit_digest();
    let info = tpm12_proto::quote::SignInfo {
        fixed: *b"ADIG",
        replay: anti_replay,
        data: digest.to_vec(),
    };
    let mut preimage = Vec::new();
    info.encode(&mut preimage);
    let to_sign = sha1(&preimage);
    let signature = {
        let key = tpm.keys.get(key_handle)?;
        key.private.sign_pkcs1v15_sha1(&to_sign).map_err(|_| TpmError::bad_parameter())?
    };
    if close_audit_raw != 0 {
        tpm.counters.close_audit();
    }
    let mut out = Vec::new();
    digest.encode(&mut out);
    encode_opaque(&signature, &mut out);
    Ok((out, vec![ctx]))
}

// --- delegation ------------------------------------------------------------

fn op_delegate_manage(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (family_id, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (opcode, _params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let mut out = Vec::new();
    match opcode {
        0 => {
            let id = tpm.delegation.manage_create();
            id.encode(&mut out);
        }
        1 => tpm.delegation.manage_enable(family_id, true)?,
        2 => tpm.delegation.manage_enable(family_id, false)?,
        3 => tpm.delegation.manage_invalidate(family_id)?,
        4 => {
            let admin = tpm.delegation.manage_admin(family_id)?;
            out.push(u8::from(admin));
        }
        _ => return Err(TpmError::bad_parameter()),
    }
    Ok((out, vec![ctx]))
}

fn op_delegate_create_owner_delegation(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (per1, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (per2, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (label, params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let (family_id, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (verification_digest, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let row = tpm.delegation.create_row(
        family_id,
        tpm12_proto::nv::DelegatePermissions { per1, per2 },
        label,
        verification_digest,
    )?;
    let mut out = Vec::new();
    row.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_delegate_update_verification(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (family_id, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    let count = tpm.delegation.update_verification(family_id)?;
    let mut out = Vec::new();
    count.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_delegate_verify_auth(tpm: &mut Tpm, params: &[u8]) -> HandlerResult {
    let (row_index, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (digest, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let row = tpm.delegation.verify_auth(row_index, &digest)?;
    let mut out = Vec::new();
    row.family_id.encode(&mut out);
    Ok((out, Vec::new()))
}

fn op_delegate_create_key_delegation(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (per1, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (per2, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (label, params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let (verification_digest, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let entity = key_entity(key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let row = tpm.delegation.create_key_row(
        key_handle,
        tpm12_proto::nv::DelegatePermissions { per1, per2 },
        label,
        verification_digest,
    );
    let mut out = Vec::new();
    row.encode(&mut out);
    Ok((out, vec![ctx]))
}

/// This engine keeps the whole delegation table resident rather than
/// letting rows travel to another TPM, so `blob` is the row's own fields
/// (family, permissions, label, verification count, digest) rather than
/// an opaque encrypted structure -- see `DelegationTable::load_owner_delegation`.
fn op_delegate_load_owner_delegation(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (row_index, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (family_id, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (per1, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (per2, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (label, params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let (verification_count, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (verification_digest, _params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    tpm.delegation.load_owner_delegation(
        row_index,
        family_id,
        tpm12_proto::nv::DelegatePermissions { per1, per2 },
        label,
        verification_count,
        verification_digest,
    )?;
    Ok((Vec::new(), vec![ctx]))
}

fn op_delegate_read_table(tpm: &mut Tpm) -> HandlerResult {
    let (families, rows) = tpm.delegation.read_table();
    let mut out = Vec::new();
    (families.len() as u32).encode(&mut out);
    for (id, family) in families {
        id.encode(&mut out);
        (family.state as u8).encode(&mut out);
        family.verification_count.encode(&mut out);
        u8::from(family.admin).encode(&mut out);
    }
    (rows.len() as u32).encode(&mut out);
    for (index, row) in rows {
        index.encode(&mut out);
        row.family_id.encode(&mut out);
        row.permissions.per1.encode(&mut out);
        row.permissions.per2.encode(&mut out);
        row.label.encode(&mut out);
        row.verification_count.encode(&mut out);
        row.verification_digest.encode(&mut out);
        row.bound_key.unwrap_or(0).encode(&mut out);
    }
    Ok((out, Vec::new()))
}

// --- transport sessions -----------------------------------------------------

fn op_establish_transport(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (enc_key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (encrypt_raw, params) = u8::decode(params).map_err(|_| TpmError::size())?;
    let (enc_session_key, _params) = decode_opaque(params)?;
    let entity = key_entity(enc_key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let session_key_bytes = {
        let key = tpm.keys.get(enc_key_handle)?;
        key.private
            .oaep_decrypt(&enc_session_key)
            .map_err(|_| TpmError::Protocol(ResponseCode::Decrypterror))?
    };
    if session_key_bytes.len() != 16 {
        return Err(TpmError::bad_parameter());
    }
    let mut session_key = [0u8; 16];
    session_key.copy_from_slice(&session_key_bytes);
    let encrypt = encrypt_raw != 0;
    let (handle, nonce_even) = tpm.sessions.transport_open(session_key, encrypt)?;
    let ticks = tpm.counters.read_current_ticks();
    let mut out = Vec::new();
    handle.encode(&mut out);
    ticks.encode(&mut out);
    nonce_even.encode(&mut out);
    Ok((out, vec![ctx]))
}

fn op_release_transport_signed(tpm: &mut Tpm, params: &[u8], auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let (signing_key_handle, params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let (external_data, params) = Digest::decode(params).map_err(|_| TpmError::size())?;
    let (transport_handle, _params) = u32::decode(params).map_err(|_| TpmError::size())?;
    let entity = key_entity(signing_key_handle);
    let entity_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &entity_auth, h1)?;
    let digest = match tpm.sessions.get(transport_handle) {
        Some(crate::session::Session::Transport { digest, .. }) => *digest,
        _ => return Err(TpmError::bad_parameter()),
    };
    let info = tpm12_proto::quote::SignInfo {
        fixed: *b"TRAN",
        replay: external_data,
        data: digest.to_vec(),
    };
    let mut preimage = Vec::new();
    info.encode(&mut preimage);
    let to_sign = sha1(&preimage);
    let signature = {
        let key = tpm.keys.get(signing_key_handle)?;
        key.private.sign_pkcs1v15_sha1(&to_sign).map_err(|_| TpmError::bad_parameter())?
    };
    let mut out = Vec::new();
    encode_opaque(&signature, &mut out);
    Ok((out, vec![ctx]))
}

// --- housekeeping ----------------------------------------------------------

fn op_reset_lock_value(tpm: &mut Tpm, auths: &[AuthTrailer], h1: &Digest) -> HandlerResult {
    let entity = owner_entity();
    let owner_auth = tpm.entity_auth(entity)?;
    let ctx = auth1(tpm, auths, entity, &owner_auth, h1)?;
    tpm.sessions.reset_lock_value();
    Ok((Vec::new(), vec![ctx]))
}

fn op_get_test_result(tpm: &mut Tpm) -> HandlerResult {
    match tpm.mode() {
        crate::OperationalMode::Ready => {
            let mut out = Vec::new();
            encode_opaque(b"self-test passed", &mut out);
            Ok((out, Vec::new()))
        }
        crate::OperationalMode::Wedged(code) => Err(TpmError::Fatal(code)),
    }
}

fn op_startup(tpm: &mut Tpm) -> HandlerResult {
    tpm.startup_clear();
    Ok((Vec::new(), Vec::new()))
}

fn op_save_state(tpm: &mut Tpm) -> HandlerResult {
    let mut out = Vec::new();
    tpm.export_save_state().encode(&mut out);
    Ok((out, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm12_crypto::random_nonce;

    fn push_auth_trailer(buf: &mut Vec<u8>, handle: u32, nonce_odd: &Digest, continue_session: bool, auth: &Digest) {
        let trailer = AuthTrailer {
            session_handle: handle,
            nonce_odd: *nonce_odd,
            continue_auth_session: continue_session,
            auth: *auth,
        };
        trailer.encode(buf);
    }

    fn command(tag: Tag, ordinal: u32, params: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(params);
        let header = CommandHeader {
            tag,
            param_size: (CommandHeader::SIZE + body.len()) as u32,
            ordinal,
        };
        let mut out = Vec::new();
        header.encode(&mut out);
        out.extend_from_slice(&body);
        out
    }

    fn decode_response(bytes: &[u8]) -> (ResponseHeader, Vec<u8>) {
        let (header, body) = ResponseHeader::decode(bytes).unwrap();
        (header, body.to_vec())
    }

    #[test]
    fn oiap_then_extend_round_trips_under_auth() {
        let mut tpm = Tpm::manufacture();
        tpm.take_ownership([1u8; 20], [2u8; 20]).unwrap();

        let oiap_request = command(Tag::RqCommand, ordinal::OIAP, &[]);
        let response = execute_command(&mut tpm, &oiap_request);
        let (header, body) = decode_response(&response);
        assert_eq!(header.return_code, ResponseCode::Success);
        let (session_handle, body) = u32::decode(&body).unwrap();
        let (nonce_even, _) = Digest::decode(body).unwrap();

        let pcr_index: u32 = 3;
        let in_digest = [7u8; 20];
        let mut params = Vec::new();
        pcr_index.encode(&mut params);
        in_digest.encode(&mut params);

        let mut h1_preimage = Vec::new();
        h1_preimage.extend_from_slice(&ordinal::EXTEND.to_be_bytes());
        h1_preimage.extend_from_slice(&params);
        let h1 = sha1(&h1_preimage);

        let nonce_odd = random_nonce();
        let owner_auth = [1u8; 20];
        let auth = hmac_sha1(
            &owner_auth,
            &[h1.as_slice(), nonce_even.as_slice(), nonce_odd.as_slice(), &[1]].concat(),
        );

        let mut request = command(Tag::RqAuth1Command, ordinal::EXTEND, &params);
        push_auth_trailer(&mut request, session_handle, &nonce_odd, true, &auth);
        // param_size must cover the trailer too.
        let total_len = request.len() as u32;
        request[2..6].copy_from_slice(&total_len.to_be_bytes());

        let response = execute_command(&mut tpm, &request);
        let (header, _body) = decode_response(&response);
        assert_eq!(header.return_code, ResponseCode::Success);
    }

    #[test]
    fn unknown_ordinal_reports_bad_ordinal() {
        let mut tpm = Tpm::manufacture();
        let request = command(Tag::RqCommand, 0xFFFF_FFFF, &[]);
        let response = execute_command(&mut tpm, &request);
        let (header, body) = decode_response(&response);
        assert_eq!(header.return_code, ResponseCode::BadOrdinal);
        assert!(body.is_empty());
    }

    #[test]
    fn wrong_tag_for_ordinal_reports_bad_tag() {
        let mut tpm = Tpm::manufacture();
        // Extend expects zero auth sessions; claiming one is a tag mismatch.
        let request = command(Tag::RqAuth1Command, ordinal::EXTEND, &[0u8; 24]);
        let response = execute_command(&mut tpm, &request);
        let (header, _) = decode_response(&response);
        assert_eq!(header.return_code, ResponseCode::Badtag);
    }

    #[test]
    fn tampered_param_size_is_rejected() {
        let mut tpm = Tpm::manufacture();
        let mut request = command(Tag::RqCommand, ordinal::PCR_READ, &0u32.to_be_bytes());
        let bogus_len = (request.len() + 5) as u32;
        request[2..6].copy_from_slice(&bogus_len.to_be_bytes());
        let response = execute_command(&mut tpm, &request);
        let (header, _) = decode_response(&response);
        assert_eq!(header.return_code, ResponseCode::BadParamSize);
    }

    #[test]
    fn extend_then_read_reports_the_same_digest() {
        let mut tpm = Tpm::manufacture();
        let mut params = Vec::new();
        5u32.encode(&mut params);
        [9u8; 20].encode(&mut params);
        let request = command(Tag::RqCommand, ordinal::EXTEND, &params);
        let response = execute_command(&mut tpm, &request);
        let (header, body) = decode_response(&response);
        assert_eq!(header.return_code, ResponseCode::Success);
        let (extended, _) = Digest::decode(&body).unwrap();

        let read_request = command(Tag::RqCommand, ordinal::PCR_READ, &5u32.to_be_bytes());
        let read_response = execute_command(&mut tpm, &read_request);
        let (read_header, read_body) = decode_response(&read_response);
        assert_eq!(read_header.return_code, ResponseCode::Success);
        let (read_digest, _) = Digest::decode(&read_body).unwrap();
        assert_eq!(read_digest, extended);
    }

    #[test]
    fn bit_flipped_auth_fails_and_locks_out_after_threshold() {
        let mut tpm = Tpm::manufacture();
        tpm.take_ownership([1u8; 20], [2u8; 20]).unwrap();

        for _ in 0..crate::session::LOCKOUT_THRESHOLD {
            let oiap_request = command(Tag::RqCommand, ordinal::OIAP, &[]);
            let response = execute_command(&mut tpm, &oiap_request);
            let (_, body) = decode_response(&response);
            let (session_handle, body) = u32::decode(&body).unwrap();
            let (nonce_even, _) = Digest::decode(body).unwrap();

            let params = 1u32.to_be_bytes().to_vec();
            let nonce_odd = random_nonce();
            let mut auth = hmac_sha1(&[1u8; 20], &[nonce_even.as_slice(), nonce_odd.as_slice(), &[1]].concat());
            auth[0] ^= 0xFF;

            let mut request = command(Tag::RqAuth1Command, ordinal::PCR_READ, &params);
            push_auth_trailer(&mut request, session_handle, &nonce_odd, true, &auth);
            let total_len = request.len() as u32;
            request[2..6].copy_from_slice(&total_len.to_be_bytes());
            let _ = execute_command(&mut tpm, &request);
        }
        assert!(tpm.sessions.is_locked_out());
    }
}
