// SPDX-License-Identifier: MIT
use std::io;
use thiserror::Error;
use tpm12_proto::{error::CodecError, ResponseCode};

/// Everything that can go wrong building, sending or verifying one command
/// from the host side. Unlike [`tpm12_core::error::TpmError`] this type
/// never discards the numeric `TPM_RESULT` a device actually returned --
/// callers that branch on a specific code match `ClientError::Tpm`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error talking to the TPM: {0}")]
    Io(#[from] io::Error),
    #[error("malformed TPM wire data: {0:?}")]
    Codec(CodecError),
    #[error("TPM returned {0}")]
    Tpm(ResponseCode),
    #[error("response auth HMAC did not match -- possible tamper or wrong secret")]
    AuthTampered,
    #[error("response frame of {0} bytes exceeded the {1}-byte ceiling")]
    FrameTooLarge(u32, u32),
    #[error("RSA-OAEP encryption of an auth value failed")]
    Crypto,
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        ClientError::Codec(err)
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
