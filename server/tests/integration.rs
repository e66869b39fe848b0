// SPDX-License-Identifier: MIT
//! Drives `tpm12_server::serve_connection` over a real `UnixStream` pair,
//! with `tpm12-client` on the far end acting as an ordinary peer would.
//! This exercises framing, oversized-frame rejection, and the
//! persist-after-every-command behavior together, the same way the
//! client crate's own tests exercise the codec against a live `Tpm`.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use tpm12_client::ops;
use tpm12_core::Tpm;
use tpm12_proto::{Codec, CommandHeader, ResponseCode, ResponseHeader, Tag};
use tpm12_server::config::{Config, Endpoint};
use tpm12_server::persistence_io;

fn test_config() -> Config {
    Config {
        endpoint: Endpoint::Tcp(0),
        state_dir: None,
        volatile_state_path: None,
        max_frame_size: 4096,
        transport_alg: "mgf1".to_string(),
    }
}

#[test]
fn startup_and_get_test_result_round_trip_over_a_real_socket() {
    let (client_end, server_end) = UnixStream::pair().expect("socket pair");
    let state = Arc::new(Mutex::new(Tpm::manufacture()));
    let config = test_config();

    let handle = std::thread::spawn(move || {
        tpm12_server::serve_connection(server_end, &state, &config);
    });

    let mut channel = client_end;
    ops::startup(&mut channel).expect("startup");
    let report = ops::get_test_result(&mut channel).expect("get test result");
    assert!(!report.is_empty());

    drop(channel);
    handle.join().expect("server thread did not panic");
}

#[test]
fn oversized_frame_is_rejected_and_the_connection_is_closed() {
    let (mut client_end, server_end) = UnixStream::pair().expect("socket pair");
    let state = Arc::new(Mutex::new(Tpm::manufacture()));
    let mut config = test_config();
    config.max_frame_size = 64;

    let handle = std::thread::spawn(move || {
        tpm12_server::serve_connection(server_end, &state, &config);
    });

    let header = CommandHeader {
        tag: Tag::RqCommand,
        param_size: 10_000,
        ordinal: 0x99, // STARTUP, never actually dispatched
    };
    let mut buf = Vec::new();
    header.encode(&mut buf);
    client_end.write_all(&buf).expect("write oversized header");
    client_end.flush().expect("flush");

    let mut response_header = [0u8; ResponseHeader::SIZE];
    client_end.read_exact(&mut response_header).expect("read error response");
    let (response, _) = ResponseHeader::decode(&response_header).expect("decode error response");
    assert_eq!(response.return_code, ResponseCode::BadParamSize);

    // The connection is closed rather than resynced: a further read sees EOF.
    let mut probe = [0u8; 1];
    let n = client_end.read(&mut probe).unwrap_or(0);
    assert_eq!(n, 0);

    handle.join().expect("server thread did not panic");
}

#[test]
fn owner_auth_persists_across_a_simulated_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (client_end, server_end) = UnixStream::pair().expect("socket pair");
    let state = Arc::new(Mutex::new(Tpm::manufacture()));
    let mut config = test_config();
    config.state_dir = Some(dir.path().to_path_buf());

    let handle = std::thread::spawn(move || {
        tpm12_server::serve_connection(server_end, &state, &config);
    });

    let mut channel = client_end;
    let owner_auth = [9u8; 20];
    let srk_auth = [10u8; 20];

    let mut session = ops::oiap_open(&mut channel).expect("oiap open for ek pub key");
    let ek_modulus = ops::get_pub_key(&mut channel, tpm12_proto::EK_HANDLE, &mut session, &[0u8; 20], false)
        .expect("get ek pub key");
    let ek_public = tpm12_crypto::RsaPublic::from_modulus(&ek_modulus, None).expect("rebuild ek public");

    let mut session = ops::oiap_open(&mut channel).expect("oiap open for take ownership");
    ops::take_ownership(&mut channel, &ek_public, &owner_auth, &srk_auth, &mut session, &owner_auth, false)
        .expect("take ownership");

    drop(channel);
    handle.join().expect("server thread did not panic");

    // Simulate a restart: a fresh Tpm restored from whatever the daemon
    // persisted should already be owned with the same owner secret.
    let config = {
        let mut c = test_config();
        c.state_dir = Some(dir.path().to_path_buf());
        c
    };
    let mut restarted = Tpm::manufacture();
    persistence_io::load_permanent_data(&config, &mut restarted).expect("reload persisted state");
    assert!(restarted.owned);
    assert_eq!(restarted.owner_auth, Some(owner_auth));
}
