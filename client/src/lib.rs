// SPDX-License-Identifier: MIT
#![deny(clippy::all)]

//! Host-side TSS for the TPM 1.2 stack: one function per implemented
//! ordinal (spec §4.10), each of which serializes its inputs with
//! `tpm12-proto`, frames them over any `Read + Write` channel, opens or
//! reuses a session to compute the inbound HMAC when auth is required, and
//! verifies the device's outbound HMAC before handing back typed output.
//!
//! Nothing in this crate keeps cross-call state beyond an [`AuthSession`]
//! the caller explicitly opened and owns -- there is no hidden cache.

pub mod error;
pub mod ops;
pub mod ordinal;
pub mod session;

pub use error::{ClientError, ClientResult};
pub use session::AuthSession;

use std::io::{Read, Write};
use tpm12_proto::{Codec, CommandHeader, ResponseCode, ResponseHeader, Tag};

/// Default ceiling on a single response frame. Matches the server's default
/// (spec.md §5 "Resource policy") so a well-behaved peer never trips it;
/// callers talking to a differently configured server can bypass this
/// crate's helpers and drive [`write_command`]/[`read_response`] directly.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 4096;

/// Size of one `ResponseAuthTrailer` on the wire (`nonceEven || continueFlag
/// || auth`).
pub(crate) const RESPONSE_AUTH_TRAILER_SIZE: usize = tpm12_proto::DIGEST_SIZE + 1 + tpm12_proto::DIGEST_SIZE;

/// Writes one framed command: header followed by its parameters (and, for
/// an authorized call, the auth trailer the caller has already appended).
pub fn write_command<T: Write>(channel: &mut T, tag: Tag, ordinal: u32, params: &[u8]) -> ClientResult<()> {
    let header = CommandHeader {
        tag,
        param_size: (CommandHeader::SIZE + params.len()) as u32,
        ordinal,
    };
    let mut buf = Vec::with_capacity(CommandHeader::SIZE + params.len());
    header.encode(&mut buf);
    buf.extend_from_slice(params);
    channel.write_all(&buf)?;
    channel.flush()?;
    Ok(())
}

/// Reads one framed response: the fixed header, then exactly `param_size -
/// 10` further bytes. Rejects an oversized frame before allocating a buffer
/// for it.
pub fn read_response<T: Read>(channel: &mut T, max_frame_size: u32) -> ClientResult<(ResponseCode, Vec<u8>)> {
    let mut header_buf = [0u8; ResponseHeader::SIZE];
    channel.read_exact(&mut header_buf)?;
    let (header, _) = ResponseHeader::decode(&header_buf)?;
    if header.param_size > max_frame_size {
        return Err(ClientError::FrameTooLarge(header.param_size, max_frame_size));
    }
    if (header.param_size as usize) < ResponseHeader::SIZE {
        return Err(ClientError::Codec(tpm12_proto::error::CodecError::Truncated));
    }
    let body_len = header.param_size as usize - ResponseHeader::SIZE;
    let mut body = vec![0u8; body_len];
    channel.read_exact(&mut body)?;
    Ok((header.return_code, body))
}

/// Sends an unauthenticated command and returns its output parameters,
/// failing with [`ClientError::Tpm`] if the device reported anything other
/// than success.
pub fn call_unauth<T: Read + Write>(channel: &mut T, ordinal: u32, params: &[u8]) -> ClientResult<Vec<u8>> {
    write_command(channel, Tag::RqCommand, ordinal, params)?;
    let (return_code, body) = read_response(channel, DEFAULT_MAX_FRAME_SIZE)?;
    if return_code != ResponseCode::Success {
        return Err(ClientError::Tpm(return_code));
    }
    Ok(body)
}

/// Sends a one-session authenticated command: builds the inbound trailer
/// from `session`, sends it, then verifies the outbound trailer and rotates
/// `session`'s nonce before returning the output parameters with the
/// trailer stripped off.
pub fn call_auth<T: Read + Write>(
    channel: &mut T,
    ordinal: u32,
    params: &[u8],
    session: &mut AuthSession,
    secret: &tpm12_proto::Digest,
    continue_session: bool,
) -> ClientResult<Vec<u8>> {
    let trailer = session.begin_command(ordinal, params, continue_session, secret);
    let mut full_params = params.to_vec();
    trailer.encode(&mut full_params);
    write_command(channel, Tag::RqAuth1Command, ordinal, &full_params)?;
    let (return_code, body) = read_response(channel, DEFAULT_MAX_FRAME_SIZE)?;
    if return_code != ResponseCode::Success {
        return Err(ClientError::Tpm(return_code));
    }
    if body.len() < RESPONSE_AUTH_TRAILER_SIZE {
        return Err(ClientError::Codec(tpm12_proto::error::CodecError::Truncated));
    }
    let split_at = body.len() - RESPONSE_AUTH_TRAILER_SIZE;
    let (out_params, trailer_bytes) = body.split_at(split_at);
    let (response_trailer, _) = tpm12_proto::ResponseAuthTrailer::decode(trailer_bytes)?;
    session.verify_response(ordinal, return_code, out_params, secret, &response_trailer)?;
    Ok(out_params.to_vec())
}

pub(crate) fn decode_opaque(buf: &[u8]) -> ClientResult<(Vec<u8>, &[u8])> {
    let (len, buf) = u32::decode(buf)?;
    if buf.len() < len as usize {
        return Err(ClientError::Codec(tpm12_proto::error::CodecError::Truncated));
    }
    let (data, rest) = buf.split_at(len as usize);
    Ok((data.to_vec(), rest))
}

pub(crate) fn encode_opaque(data: &[u8], buf: &mut Vec<u8>) {
    (data.len() as u32).encode(buf);
    buf.extend_from_slice(data);
}
