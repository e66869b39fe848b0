// SPDX-License-Identifier: MIT
use std::io;
use thiserror::Error;

/// Failures that can keep the daemon from starting at all. Per-connection
/// I/O problems never reach this type -- they are logged and the
/// connection is simply dropped (spec §5 "Cancellation").
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("persisted state at {0} is corrupt: {1}")]
    CorruptState(String, tpm12_core::error::TpmError),
}
