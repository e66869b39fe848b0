// SPDX-License-Identifier: MIT
//! Reads and writes the `tpm12-core` persistence blobs to disk. The wire
//! format itself -- version tag, field layout -- lives entirely in
//! `tpm12_core::persistence`; this module only owns the file paths.

use crate::config::Config;
use crate::error::ServerError;
use log::{info, warn};
use std::path::Path;
use tpm12_core::persistence::{PermanentData, SaveStateData};
use tpm12_core::Tpm;

/// Loads persisted ownership/NV state into a freshly manufactured `Tpm`,
/// if `TPM12_STATE_DIR` is configured and a blob already exists there. A
/// missing file just means this is the device's first boot; a file that
/// fails to decode is fatal, matching `tpm12-core`'s own "an
/// unrecognized tag is worse than a best-effort parse" stance.
pub fn load_permanent_data(config: &Config, tpm: &mut Tpm) -> Result<(), ServerError> {
    let Some(path) = config.permanent_data_path() else {
        return Ok(());
    };
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("no persisted state at {} yet, starting fresh", path.display());
            return Ok(());
        }
        Err(err) => return Err(ServerError::Io(err)),
    };
    let data = PermanentData::decode(&bytes).map_err(|err| ServerError::CorruptState(path.display().to_string(), err))?;
    tpm.restore_permanent_data(data);
    info!("restored persisted state from {}", path.display());
    Ok(())
}

/// Writes the current ownership/NV state back out, if configured.
pub fn save_permanent_data(config: &Config, tpm: &Tpm) {
    let Some(path) = config.permanent_data_path() else {
        return;
    };
    let mut buf = Vec::new();
    tpm.export_permanent_data().encode(&mut buf);
    if let Err(err) = write_atomically(&path, &buf) {
        warn!("failed to persist state to {}: {err}", path.display());
    }
}

/// Loads the volatile-state (PCR) blob, if `TPM12_VOLATILE_STATE` is
/// configured. Unlike permanent state this sidecar is optional by nature
/// -- PCRs reset to zero on every `Startup(ST_CLEAR)` in any case -- so a
/// missing or corrupt file just means the device boots with cleared PCRs.
pub fn load_volatile_state(config: &Config, tpm: &mut Tpm) {
    let Some(path) = &config.volatile_state_path else {
        return;
    };
    match std::fs::read(path) {
        Ok(bytes) => match SaveStateData::decode(&bytes) {
            Ok(data) => {
                tpm.restore_save_state(data);
                info!("restored volatile state from {}", path.display());
            }
            Err(err) => warn!("volatile state at {} is corrupt, booting with cleared PCRs: {err}", path.display()),
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("could not read volatile state at {}: {err}", path.display()),
    }
}

pub fn save_volatile_state(config: &Config, tpm: &Tpm) {
    let Some(path) = &config.volatile_state_path else {
        return;
    };
    let mut buf = Vec::new();
    tpm.export_save_state().encode(&mut buf);
    if let Err(err) = write_atomically(path, &buf) {
        warn!("failed to persist volatile state to {}: {err}", path.display());
    }
}

/// Writes via a temporary file plus rename so a crash mid-write never
/// leaves a half-written blob that would fail `tpm12-core`'s decode on
/// the next boot.
fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)
}
