// SPDX-License-Identifier: MIT
//! TPM 1.2 transport socket daemon (spec §5, §6.1, §6.2): accepts a stream
//! connection, reads one framed command at a time, dispatches it against a
//! single shared `tpm12_core::Tpm`, and writes the response back. One
//! logical TPM instance per process, exactly as spec.md §6.1 assumes.
//!
//! Split into a library so the framing and persistence-on-every-command
//! logic can be driven directly in tests against an in-memory stream,
//! the same way `tpm12-client`'s tests drive `Tpm::execute_command`
//! through a `Loopback`.

pub mod config;
pub mod error;
pub mod persistence_io;

use log::{debug, warn};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use tpm12_core::Tpm;
use tpm12_proto::{Codec, CommandHeader, ResponseCode, ResponseHeader, Tag};

pub use config::{Config, Endpoint};
pub use error::ServerError;

pub fn spawn_connection<S>(stream: S, state: Arc<Mutex<Tpm>>, config: Arc<Config>)
where
    S: Read + Write + Send + 'static,
{
    thread::spawn(move || serve_connection(stream, &state, &config));
}

/// Reads and answers commands on one connection until the peer closes it
/// or sends something malformed enough that framing can no longer be
/// trusted. Per spec.md §5 "Cancellation", a command that was already
/// read always runs to completion even if the write of its response then
/// fails -- that failure is logged at `debug!`, not treated as fatal.
pub fn serve_connection<S: Read + Write>(mut stream: S, state: &Mutex<Tpm>, config: &Config) {
    loop {
        let mut header_buf = [0u8; CommandHeader::SIZE];
        if let Err(err) = stream.read_exact(&mut header_buf) {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                debug!("connection read error: {err}");
            }
            return;
        }

        let param_size = u32::from_be_bytes([header_buf[2], header_buf[3], header_buf[4], header_buf[5]]);
        if (param_size as usize) < CommandHeader::SIZE {
            write_error_response(&mut stream, ResponseCode::BadParamSize);
            return;
        }
        if param_size > config.max_frame_size {
            warn!("rejecting oversized frame ({param_size} bytes, ceiling {})", config.max_frame_size);
            write_error_response(&mut stream, ResponseCode::BadParamSize);
            return;
        }

        let mut request = header_buf.to_vec();
        request.resize(param_size as usize, 0);
        if let Err(err) = stream.read_exact(&mut request[CommandHeader::SIZE..]) {
            debug!("connection read error mid-frame: {err}");
            return;
        }

        let response = {
            let mut tpm = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            debug!("dispatching ordinal from a {param_size}-byte frame");
            let response = tpm.execute_command(&request);
            persistence_io::save_permanent_data(config, &tpm);
            persistence_io::save_volatile_state(config, &tpm);
            response
        };

        if let Err(err) = stream.write_all(&response) {
            debug!("could not write response, peer likely disconnected: {err}");
            return;
        }
        let _ = stream.flush();
    }
}

fn write_error_response<S: Write>(stream: &mut S, code: ResponseCode) {
    let header = ResponseHeader {
        tag: Tag::RspCommand,
        param_size: ResponseHeader::SIZE as u32,
        return_code: code,
    };
    let mut buf = Vec::with_capacity(ResponseHeader::SIZE);
    header.encode(&mut buf);
    let _ = stream.write_all(&buf);
}
