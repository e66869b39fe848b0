// SPDX-License-Identifier: MIT
use std::io;
use thiserror::Error;

/// Everything a CLI invocation can fail with, beyond `tpm12-client`'s own
/// `ClientError` (which this just wraps and prints alongside).
#[derive(Debug, Error)]
pub enum CliError {
    #[error("could not reach the TPM at {0}: {1}")]
    Connect(String, io::Error),
    #[error("{0}")]
    Client(#[from] tpm12_client::ClientError),
    #[error("invalid hex digest '{0}', expected exactly 20 bytes")]
    BadDigest(String),
    #[error("could not read key blob from {0}: {1}")]
    ReadBlob(String, io::Error),
    #[error("could not write key blob to {0}: {1}")]
    WriteBlob(String, io::Error),
    #[error("stored key blob at {0} is malformed: {1:?}")]
    BadBlob(String, tpm12_proto::error::CodecError),
}

pub type CliResult<T> = Result<T, CliError>;
