// SPDX-License-Identifier: MIT
#![deny(clippy::all)]

//! Bit-exact wire structures for the TPM 1.2 command/response protocol.
//!
//! Every multi-byte integer on the wire is big-endian; every digest, nonce
//! and auth value is a fixed 20-byte SHA-1-sized field. This crate only
//! knows how to serialize and deserialize the byte-exact TPM 1.2 structures
//! -- it has no notion of sessions, key slots or dispatch.

use bitflags::bitflags;
use strum_macros::FromRepr;

pub mod error;
pub mod key;
pub mod nv;
pub mod pcr;
pub mod quote;

pub use error::CodecError;

/// All digests, nonces and auth values in TPM 1.2 are 20 bytes (SHA-1 size).
pub const DIGEST_SIZE: usize = 20;

/// A SHA-1-sized digest, nonce, or auth value.
pub type Digest = [u8; DIGEST_SIZE];

/// Minimum size of a command or response header (`tag || paramSize`).
pub const HEADER_SIZE: usize = 6;

/// Fixed handle of the Storage Root Key. Never evicted by non-Clear paths.
pub const SRK_HANDLE: u32 = 0x4000_0000;

/// Fixed handle of the Endorsement Key.
pub const EK_HANDLE: u32 = 0x4000_0006;

/// Sentinel NV index whose definition with size 0 sets the global NV lock.
pub const NV_INDEX_LOCK: u32 = 0xFFFF_FFFF;

/// A type that can be serialized to and deserialized from the TPM 1.2 wire
/// format.
pub trait Codec: Sized {
    /// Appends the wire encoding of `self` to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Consumes a prefix of `buf` and returns the decoded value plus the
    /// unconsumed remainder.
    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError>;
}

impl Codec for u8 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self);
    }
    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (head, rest) = split(buf, 1)?;
        Ok((head[0], rest))
    }
}

impl Codec for u16 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend(self.to_be_bytes());
    }
    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (head, rest) = split(buf, 2)?;
        Ok((u16::from_be_bytes([head[0], head[1]]), rest))
    }
}

impl Codec for u32 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend(self.to_be_bytes());
    }
    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (head, rest) = split(buf, 4)?;
        Ok((u32::from_be_bytes([head[0], head[1], head[2], head[3]]), rest))
    }
}

impl Codec for Digest {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }
    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (head, rest) = split(buf, DIGEST_SIZE)?;
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(head);
        Ok((digest, rest))
    }
}

/// Splits `buf` into a head of `n` bytes and the remainder, failing with
/// `CodecError::Truncated` if there are fewer than `n` bytes available.
pub(crate) fn split(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), CodecError> {
    if buf.len() < n {
        return Err(CodecError::Truncated);
    }
    Ok(buf.split_at(n))
}

/// Reads a length-prefixed (`u32` BE) opaque byte blob.
pub(crate) fn decode_opaque(buf: &[u8]) -> Result<(Vec<u8>, &[u8]), CodecError> {
    let (len, rest) = u32::decode(buf)?;
    let (data, rest) = split(rest, len as usize)?;
    Ok((data.to_vec(), rest))
}

pub(crate) fn encode_opaque(data: &[u8], buf: &mut Vec<u8>) {
    (data.len() as u32).encode(buf);
    buf.extend_from_slice(data);
}

/// `TPM_TAG` values distinguishing no-auth, one-auth and two-auth commands
/// and their matching response tags.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    /// `TPM_TAG_RQU_COMMAND`: no sessions, legacy v1.1 framing.
    RqCommand = 0x00C1,
    /// `TPM_TAG_RQU_AUTH1_COMMAND`
    RqAuth1Command = 0x00C2,
    /// `TPM_TAG_RQU_AUTH2_COMMAND`
    RqAuth2Command = 0x00C3,
    /// `TPM_TAG_RSP_COMMAND`
    RspCommand = 0x00C4,
    /// `TPM_TAG_RSP_AUTH1_COMMAND`
    RspAuth1Command = 0x00C5,
    /// `TPM_TAG_RSP_AUTH2_COMMAND`
    RspAuth2Command = 0x00C6,
}

impl Tag {
    /// Number of auth trailers a command tag carries.
    #[must_use]
    pub fn auth_count(self) -> u8 {
        match self {
            Tag::RqCommand | Tag::RspCommand => 0,
            Tag::RqAuth1Command | Tag::RspAuth1Command => 1,
            Tag::RqAuth2Command | Tag::RspAuth2Command => 2,
        }
    }

    /// The response tag matching this request tag.
    #[must_use]
    pub fn response_tag(self) -> Tag {
        match self {
            Tag::RqCommand => Tag::RspCommand,
            Tag::RqAuth1Command => Tag::RspAuth1Command,
            Tag::RqAuth2Command => Tag::RspAuth2Command,
            other => other,
        }
    }
}

pub const RC_VER1: u32 = 0x0;
pub const RC_NON_FATAL: u32 = 0x800;

/// `TPM_RESULT` values. TPM 1.2 return codes are preserved bit-exactly on
/// the wire (spec §6.4): this enum never collapses distinct codes into a
/// single "internal error" bucket.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    Success = 0x0000_0000,
    AuthFail = 0x0000_0001,
    BadIndex = 0x0000_0002,
    BadParameter = 0x0000_0003,
    Audit = 0x0000_0004,
    Clear = 0x0000_0005,
    ClearDisabled = 0x0000_0006,
    Deactivated = 0x0000_0007,
    Disabled = 0x0000_0008,
    DisabledCmd = 0x0000_0009,
    Fail = 0x0000_000A,
    BadOrdinal = 0x0000_000B,
    InstallDisabled = 0x0000_000C,
    Invalidkeyhandle = 0x0000_000D,
    KeyNotFound = 0x0000_000E,
    InappropriateEnc = 0x0000_000F,
    MigrateFail = 0x0000_0010,
    InvalidPcrInfo = 0x0000_0011,
    NoSpace = 0x0000_0012,
    NoSrk = 0x0000_0013,
    NotSealedBlob = 0x0000_0014,
    BadKeyProperty = 0x0000_0015,
    BadMigration = 0x0000_0016,
    BadScheme = 0x0000_0017,
    BadDatasize = 0x0000_0018,
    BadMode = 0x0000_0019,
    BadPresence = 0x0000_001A,
    BadVersion = 0x0000_001B,
    NoWrapTransport = 0x0000_001C,
    AuditfailUnsuccessful = 0x0000_001D,
    AuditfailSuccessful = 0x0000_001E,
    NotResetable = 0x0000_001F,
    NotLocal = 0x0000_0020,
    BadType = 0x0000_0021,
    InvalidResource = 0x0000_0022,
    NotfiFo = 0x0000_0023,
    BadAttributes = 0x0000_0025,
    InvalidStructure = 0x0000_0026,
    KeyOwnerControl = 0x0000_0027,
    BadCounter = 0x0000_0028,
    NotFullwrite = 0x0000_0029,
    Context = 0x0000_002A,
    Resourcemissing = 0x0000_002B,
    DelegateLock = 0x0000_002C,
    DelegateFamily = 0x0000_002D,
    DelegateAdmin = 0x0000_002E,
    TransportNotExclusive = 0x0000_002F,
    Owner = 0x0000_0030,
    BadDelegate = 0x0000_0031,
    Badcontextsize = 0x0000_0032,
    Badcontextversion = 0x0000_0033,
    Notneeded = 0x0000_0034,
    Toomany = 0x0000_0035,
    Maptolpm = 0x0000_0036,
    Invalidfamily = 0x0000_0037,
    Nodelegation = 0x0000_0038,
    Badcontextcheck = 0x0000_0039,
    Badctxalloc = 0x0000_003A,
    Familycount = 0x0000_003B,
    Wrongpcrval = 0x0000_003C,
    BadParamSize = 0x0000_003D,
    Shaerror = 0x0000_003E,
    SizeOpnonzero = 0x0000_0040,
    Badtag = 0x0000_0041,
    IoerrorOpen = 0x0000_0042,
    Encrypterror = 0x0000_0043,
    Decrypterror = 0x0000_0044,
    InvalidAuthhandle = 0x0000_0045,
    NoEndorsement = 0x0000_0046,
    InvalidKeyusage = 0x0000_0047,
    Wrongentitytype = 0x0000_0048,
    InvalidPostinit = 0x0000_0049,
    Migratefailalgorithm = 0x0000_004A,
    Migratefailkeysize = 0x0000_004B,
    FailedSelfTest = 0x0000_004C,
    Auth2Fail = 0x0000_004D,
    Badtagorder = 0x0000_004E,
    AuthConflict = 0x0000_004F,
    AreaLocked = 0x0000_0050,
    BadLocality = 0x0000_0061,
    ReadOnly = 0x0000_0062,
    PerNoWrite = 0x0000_0063,
    FamilyCount2 = 0x0000_0064,
    WriteLocked = 0x0000_0065,
    BadAttributes2 = 0x0000_0066,
    Retry = RC_NON_FATAL + 0x0000_0001,
    NeedsSelftest = RC_NON_FATAL + 0x0000_0002,
    DoingSelftest = RC_NON_FATAL + 0x0000_0003,
    DefendLockRunning = RC_NON_FATAL + 0x0000_0004,
    Resources = 0x0000_0E00 | 0x0000_0012,
}

impl From<u32> for ResponseCode {
    /// Parses a raw `TPM_RESULT`. Unknown codes never map onto a known
    /// variant by coincidence -- callers that need the raw value should
    /// keep it alongside, this conversion is lossy only for truly
    /// unrecognized codes, which should not occur on a conformant wire.
    fn from(value: u32) -> ResponseCode {
        ResponseCode::from_repr(value).unwrap_or(ResponseCode::Fail)
    }
}

impl core::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// `TPM_ENTITY_TYPE` values used by OSAP/DSAP `Open` and by NV/key
/// authorization resolution.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EntityType {
    Keyhandle = 0x0001,
    Owner = 0x0002,
    Data = 0x0003,
    Srk = 0x0004,
    KeyOwner = 0x0005,
    Counter = 0x0006,
    CounterOwner = 0x0007,
    Nv = 0x000B,
    NvOwner = 0x000C,
    Delegate = 0x000D,
}

/// `TPM_KEY_USAGE` values.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyUsage {
    Signing = 0x0010,
    Storage = 0x0011,
    Identity = 0x0012,
    Authchange = 0x0013,
    Bind = 0x0014,
    Legacy = 0x0015,
    Migrate = 0x0016,
}

/// `TPM_AUTH_DATA_USAGE` values.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthDataUsage {
    Never = 0x00,
    Always = 0x01,
    Priv = 0x02,
}

bitflags! {
    /// `TPM_KEY_FLAGS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyFlags: u32 {
        const Migratable = 0x0000_0002;
        const Volatile = 0x0000_0004;
        const PcrIgnoredOnRead = 0x0000_0008;
        const MigrateAuthority = 0x0000_0010;
    }
}

/// Locality is a 5-bit enum `{0..4}` tagging the calling agent's trust
/// level on the command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locality(pub u8);

impl Locality {
    pub const MAX: u8 = 4;

    #[must_use]
    pub fn mask(self) -> u8 {
        1u8 << self.0
    }
}

/// An auth trailer, one per active session on a command, in the layout of
/// spec §4.1: `sessionHandle(u32) || oddNonce(20) || continueFlag(1) ||
/// auth(20)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTrailer {
    pub session_handle: u32,
    pub nonce_odd: Digest,
    pub continue_auth_session: bool,
    pub auth: Digest,
}

impl Codec for AuthTrailer {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.session_handle.encode(buf);
        self.nonce_odd.encode(buf);
        buf.push(u8::from(self.continue_auth_session));
        self.auth.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (session_handle, buf) = u32::decode(buf)?;
        let (nonce_odd, buf) = Digest::decode(buf)?;
        let (flag, buf) = u8::decode(buf)?;
        let (auth, buf) = Digest::decode(buf)?;
        Ok((
            AuthTrailer {
                session_handle,
                nonce_odd,
                continue_auth_session: flag != 0,
                auth,
            },
            buf,
        ))
    }
}

/// One session's trailer on a response: `nonceEven(20) || continueFlag(1) ||
/// auth(20)`. Unlike [`AuthTrailer`] this carries no session handle -- the
/// session is already identified by its position, matching the one on the
/// corresponding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseAuthTrailer {
    pub nonce_even: Digest,
    pub continue_auth_session: bool,
    pub auth: Digest,
}

impl Codec for ResponseAuthTrailer {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.nonce_even.encode(buf);
        buf.push(u8::from(self.continue_auth_session));
        self.auth.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (nonce_even, buf) = Digest::decode(buf)?;
        let (flag, buf) = u8::decode(buf)?;
        let (auth, buf) = Digest::decode(buf)?;
        Ok((
            ResponseAuthTrailer {
                nonce_even,
                continue_auth_session: flag != 0,
                auth,
            },
            buf,
        ))
    }
}

/// `tag || paramSize || ordinal` -- the fixed part of a command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub tag: Tag,
    pub param_size: u32,
    pub ordinal: u32,
}

impl CommandHeader {
    pub const SIZE: usize = 10;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        (self.tag as u16).encode(buf);
        self.param_size.encode(buf);
        self.ordinal.encode(buf);
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (tag_raw, buf) = u16::decode(buf)?;
        let tag = Tag::from_repr(tag_raw).ok_or(CodecError::UnknownTag(tag_raw))?;
        let (param_size, buf) = u32::decode(buf)?;
        let (ordinal, buf) = u32::decode(buf)?;
        Ok((
            CommandHeader {
                tag,
                param_size,
                ordinal,
            },
            buf,
        ))
    }
}

/// `tag || paramSize || returnCode` -- the fixed part of a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub tag: Tag,
    pub param_size: u32,
    pub return_code: ResponseCode,
}

impl ResponseHeader {
    pub const SIZE: usize = 10;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        (self.tag as u16).encode(buf);
        self.param_size.encode(buf);
        (self.return_code as u32).encode(buf);
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (tag_raw, buf) = u16::decode(buf)?;
        let tag = Tag::from_repr(tag_raw).ok_or(CodecError::UnknownTag(tag_raw))?;
        let (param_size, buf) = u32::decode(buf)?;
        let (rc_raw, buf) = u32::decode(buf)?;
        Ok((
            ResponseHeader {
                tag,
                param_size,
                return_code: ResponseCode::from(rc_raw),
            },
            buf,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_trailer_round_trips() {
        let trailer = AuthTrailer {
            session_handle: 0xDEAD_BEEF,
            nonce_odd: [7u8; DIGEST_SIZE],
            continue_auth_session: true,
            auth: [9u8; DIGEST_SIZE],
        };
        let mut buf = Vec::new();
        trailer.encode(&mut buf);
        let (decoded, rest) = AuthTrailer::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, trailer);
    }

    #[test]
    fn response_auth_trailer_round_trips() {
        let trailer = ResponseAuthTrailer {
            nonce_even: [3u8; DIGEST_SIZE],
            continue_auth_session: false,
            auth: [4u8; DIGEST_SIZE],
        };
        let mut buf = Vec::new();
        trailer.encode(&mut buf);
        let (decoded, rest) = ResponseAuthTrailer::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, trailer);
    }

    #[test]
    fn command_header_round_trips() {
        let header = CommandHeader {
            tag: Tag::RqAuth1Command,
            param_size: 42,
            ordinal: 0x17,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let (decoded, rest) = CommandHeader::decode(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, header);
    }

    #[test]
    fn response_code_bad_tag_rejected() {
        let mut buf = Vec::new();
        0xFFFFu16.encode(&mut buf);
        buf.extend([0, 0, 0, 10]);
        buf.extend([0, 0, 0, 0]);
        assert!(matches!(
            ResponseHeader::decode(&buf),
            Err(CodecError::UnknownTag(0xFFFF))
        ));
    }

    #[test]
    fn response_code_preserves_distinct_fmt1_codes() {
        assert_eq!(ResponseCode::from(0x0000_003C), ResponseCode::Wrongpcrval);
        assert_eq!(ResponseCode::from(0x0000_0001), ResponseCode::AuthFail);
        assert_ne!(ResponseCode::Wrongpcrval, ResponseCode::AuthFail);
    }

    #[test]
    fn tag_auth_counts() {
        assert_eq!(Tag::RqCommand.auth_count(), 0);
        assert_eq!(Tag::RqAuth1Command.auth_count(), 1);
        assert_eq!(Tag::RqAuth2Command.auth_count(), 2);
    }
}
