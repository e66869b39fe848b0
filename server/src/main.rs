// SPDX-License-Identifier: MIT
#![deny(clippy::all)]

//! Binary entry point: wires up `Config`, a manufactured `Tpm` restored
//! from any persisted state, and a listener socket, then hands every
//! accepted connection to [`tpm12_server::serve_connection`].

use log::{error, info, warn};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::{Arc, Mutex};
use tpm12_core::Tpm;
use tpm12_server::{persistence_io, spawn_connection, Config, Endpoint};

fn main() {
    env_logger::init();
    let config = Config::from_env();

    if let Some(dir) = &config.state_dir {
        if let Err(err) = std::fs::create_dir_all(dir) {
            error!("could not create state directory {}: {err}", dir.display());
            std::process::exit(1);
        }
    }

    let mut tpm = Tpm::manufacture();
    if let Err(err) = persistence_io::load_permanent_data(&config, &mut tpm) {
        error!("refusing to start with unreadable persisted state: {err}");
        std::process::exit(1);
    }
    persistence_io::load_volatile_state(&config, &mut tpm);
    info!("transport-session parameter encryption hint: {}", config.transport_alg);

    let state = Arc::new(Mutex::new(tpm));
    let config = Arc::new(config);

    match &config.endpoint {
        Endpoint::Tcp(port) => {
            let listener = TcpListener::bind(("0.0.0.0", *port)).unwrap_or_else(|err| {
                error!("could not bind TCP port {port}: {err}");
                std::process::exit(1);
            });
            info!("listening on tcp:{port}");
            for incoming in listener.incoming() {
                match incoming {
                    Ok(stream) => spawn_connection(stream, Arc::clone(&state), Arc::clone(&config)),
                    Err(err) => warn!("failed to accept a TCP connection: {err}"),
                }
            }
        }
        Endpoint::Unix(path) => {
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
            let listener = UnixListener::bind(path).unwrap_or_else(|err| {
                error!("could not bind UNIX socket {}: {err}", path.display());
                std::process::exit(1);
            });
            info!("listening on unix:{}", path.display());
            for incoming in listener.incoming() {
                match incoming {
                    Ok(stream) => spawn_connection(stream, Arc::clone(&state), Arc::clone(&config)),
                    Err(err) => warn!("failed to accept a UNIX connection: {err}"),
                }
            }
        }
    }
}
