// SPDX-License-Identifier: MIT
//! Environment-driven configuration (spec §6.2).

use std::env;
use std::path::PathBuf;

/// Where to listen: a TCP port if `TPM_PORT` parses as decimal, otherwise
/// a UNIX domain socket at that path.
pub enum Endpoint {
    Tcp(u16),
    Unix(PathBuf),
}

pub struct Config {
    pub endpoint: Endpoint,
    pub state_dir: Option<PathBuf>,
    pub volatile_state_path: Option<PathBuf>,
    pub max_frame_size: u32,
    /// Hint only -- transport sessions pick MGF1-keystream vs AES-CBC
    /// parameter encryption based on this (spec §4.9, §9); `tpm12-core`
    /// does not yet branch on it (see DESIGN.md).
    pub transport_alg: String,
}

const DEFAULT_PORT: u16 = 2321;
const DEFAULT_MAX_FRAME_SIZE: u32 = 4096;

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        let endpoint = match env::var("TPM_PORT") {
            Ok(raw) => match raw.parse::<u16>() {
                Ok(port) => Endpoint::Tcp(port),
                Err(_) => Endpoint::Unix(PathBuf::from(raw)),
            },
            Err(_) => Endpoint::Tcp(DEFAULT_PORT),
        };
        let state_dir = env::var_os("TPM12_STATE_DIR").map(PathBuf::from);
        let volatile_state_path = env::var_os("TPM12_VOLATILE_STATE").map(PathBuf::from);
        let max_frame_size = env::var("TPM12_MAX_FRAME_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE);
        let transport_alg = env::var("TPM12_TRANSPORT_ALG").unwrap_or_else(|_| "mgf1".to_string());
        Config {
            endpoint,
            state_dir,
            volatile_state_path,
            max_frame_size,
            transport_alg,
        }
    }

    #[must_use]
    pub fn permanent_data_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join("permanent.bin"))
    }
}
