// SPDX-License-Identifier: MIT
use thiserror::Error;
use tpm12_proto::ResponseCode;

/// Every failure a TPM operation can produce, classified by the recovery
/// policy of spec §7. Each variant carries (or directly maps onto) the
/// `TPM_RESULT` that must appear bit-exact on the wire -- this type is
/// never collapsed into a generic "internal error".
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TpmError {
    #[error("{0}")]
    Protocol(ResponseCode),
    #[error("authorization failed: {0}")]
    Auth(ResponseCode),
    #[error("resource exhausted: {0}")]
    Resource(ResponseCode),
    #[error("precondition not met: {0}")]
    Precondition(ResponseCode),
    #[error("transient failure, retry: {0}")]
    Transient(ResponseCode),
    #[error("fatal: {0}")]
    Fatal(ResponseCode),
}

impl TpmError {
    /// The numeric `TPM_RESULT` to place on the wire for this failure.
    #[must_use]
    pub fn code(self) -> ResponseCode {
        match self {
            TpmError::Protocol(c)
            | TpmError::Auth(c)
            | TpmError::Resource(c)
            | TpmError::Precondition(c)
            | TpmError::Transient(c)
            | TpmError::Fatal(c) => c,
        }
    }

    #[must_use]
    pub fn bad_parameter() -> Self {
        TpmError::Protocol(ResponseCode::BadParameter)
    }

    #[must_use]
    pub fn bad_ordinal() -> Self {
        TpmError::Protocol(ResponseCode::BadOrdinal)
    }

    #[must_use]
    pub fn bad_tag() -> Self {
        TpmError::Protocol(ResponseCode::Badtag)
    }

    #[must_use]
    pub fn size() -> Self {
        TpmError::Protocol(ResponseCode::BadParamSize)
    }

    #[must_use]
    pub fn auth_fail() -> Self {
        TpmError::Auth(ResponseCode::AuthFail)
    }

    #[must_use]
    pub fn auth2_fail() -> Self {
        TpmError::Auth(ResponseCode::Auth2Fail)
    }

    #[must_use]
    pub fn auth_conflict() -> Self {
        TpmError::Auth(ResponseCode::AuthConflict)
    }

    #[must_use]
    pub fn defend_lock_running() -> Self {
        TpmError::Auth(ResponseCode::DefendLockRunning)
    }

    #[must_use]
    pub fn resources() -> Self {
        TpmError::Resource(ResponseCode::Resources)
    }

    #[must_use]
    pub fn no_space() -> Self {
        TpmError::Resource(ResponseCode::NoSpace)
    }

    #[must_use]
    pub fn no_srk() -> Self {
        TpmError::Resource(ResponseCode::NoSrk)
    }

    #[must_use]
    pub fn wrong_pcr_val() -> Self {
        TpmError::Precondition(ResponseCode::Wrongpcrval)
    }

    #[must_use]
    pub fn bad_locality() -> Self {
        TpmError::Precondition(ResponseCode::BadLocality)
    }

    #[must_use]
    pub fn not_sealed_blob() -> Self {
        TpmError::Precondition(ResponseCode::NotSealedBlob)
    }

    #[must_use]
    pub fn disabled() -> Self {
        TpmError::Precondition(ResponseCode::Disabled)
    }

    #[must_use]
    pub fn deactivated() -> Self {
        TpmError::Precondition(ResponseCode::Deactivated)
    }

    #[must_use]
    pub fn retry() -> Self {
        TpmError::Transient(ResponseCode::Retry)
    }

    #[must_use]
    pub fn failed_self_test() -> Self {
        TpmError::Fatal(ResponseCode::FailedSelfTest)
    }

    #[must_use]
    pub fn bad_migration() -> Self {
        TpmError::Protocol(ResponseCode::BadMigration)
    }

    #[must_use]
    pub fn key_not_found() -> Self {
        TpmError::Protocol(ResponseCode::KeyNotFound)
    }

    #[must_use]
    pub fn invalid_key_handle() -> Self {
        TpmError::Protocol(ResponseCode::Invalidkeyhandle)
    }
}

pub type TpmResult<T> = Result<T, TpmError>;
