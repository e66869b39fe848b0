// SPDX-License-Identifier: MIT
use strum_macros::Display;

/// Errors produced while encoding or decoding the TPM 1.2 wire format.
///
/// This is a size/parsing error type only -- it never stands in for a
/// `TPM_RESULT`. Per the design note in spec §9, a length or structural
/// problem is never confused with a failure return code: callers that need
/// to turn a `CodecError` into a command failure map it explicitly (usually
/// onto `ResponseCode::BadParameter` or `ResponseCode::BadParamSize`).
#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum CodecError {
    /// Fewer bytes remained than the structure being decoded requires.
    Truncated,
    /// Bytes remained after a structure was fully decoded where none were
    /// expected (e.g. `paramSize` disagreed with the parsed length).
    TrailingData,
    /// A tag field did not match any known `TPM_TAG` value.
    UnknownTag(u16),
    /// A structure tag (key version word, PCR info discriminant, ...) did
    /// not match any known variant.
    UnknownStructureTag(u32),
    /// A length field exceeded the implementation's size ceiling.
    TooLarge,
}
