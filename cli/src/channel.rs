// SPDX-License-Identifier: MIT
//! Connects to a `tpm12-server` the same way its own `--endpoint`/`TPM_PORT`
//! parsing works: a decimal port means TCP, anything else is a UNIX socket
//! path. Mirrored by hand rather than imported, the same way
//! `tpm12-client::ordinal` mirrors `tpm12-core::dispatcher::ordinal` -- the
//! CLI is a TSS consumer, not a server-internals consumer.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

/// Matches `tpm12-server`'s own default TCP port.
pub const DEFAULT_ENDPOINT: &str = "2321";

pub enum Channel {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Channel {
    pub fn connect(endpoint: &str) -> io::Result<Self> {
        match endpoint.parse::<u16>() {
            Ok(port) => Ok(Channel::Tcp(TcpStream::connect(("127.0.0.1", port))?)),
            Err(_) => Ok(Channel::Unix(UnixStream::connect(endpoint)?)),
        }
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Tcp(stream) => stream.read(buf),
            Channel::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Tcp(stream) => stream.write(buf),
            Channel::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Channel::Tcp(stream) => stream.flush(),
            Channel::Unix(stream) => stream.flush(),
        }
    }
}
