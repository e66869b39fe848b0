// SPDX-License-Identifier: MIT
#![deny(clippy::all)]

//! Thin command-line frontend over `tpm12-client`, covering the
//! end-to-end scenarios by hand: bring a device up, take ownership,
//! create and load a key, sign/quote, touch NV storage and PCRs, and
//! decode a numeric return code -- in the same spirit as the teacher's
//! single `tpm2-cli` binary with subcommands.

mod channel;
mod error;

use channel::Channel;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use error::{CliError, CliResult};
use log::error;
use std::fs;
use tpm12_client::ops;
use tpm12_proto::key::Key12;
use tpm12_proto::nv::NvAttributes;
use tpm12_proto::pcr::PcrSelection;
use tpm12_proto::{Digest, KeyFlags, KeyUsage, ResponseCode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A decimal TCP port or a UNIX socket path, matching `tpm12-server`'s
    /// own `TPM_PORT` convention.
    #[arg(short, long, default_value = channel::DEFAULT_ENDPOINT)]
    endpoint: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum, strum_macros::Display)]
enum KeyUsageArg {
    Signing,
    Storage,
    Bind,
    Legacy,
}

impl From<KeyUsageArg> for KeyUsage {
    fn from(arg: KeyUsageArg) -> Self {
        match arg {
            KeyUsageArg::Signing => KeyUsage::Signing,
            KeyUsageArg::Storage => KeyUsage::Storage,
            KeyUsageArg::Bind => KeyUsage::Bind,
            KeyUsageArg::Legacy => KeyUsage::Legacy,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// `TPM_Startup(ST_CLEAR)`.
    Startup,
    /// `TPM_TakeOwnership`.
    TakeOwnership {
        #[arg(long, value_parser = parse_digest)]
        owner_auth: Digest,
        #[arg(long, value_parser = parse_digest)]
        srk_auth: Digest,
    },
    /// `TPM_CreateWrapKey` under the SRK, writing the resulting blob to a file.
    CreateWrapKey {
        #[arg(long, default_value_t = tpm12_proto::SRK_HANDLE, value_parser = maybe_hex::<u32>)]
        parent: u32,
        #[arg(long, value_parser = parse_digest)]
        parent_auth: Digest,
        #[arg(long, value_parser = parse_digest)]
        usage_auth: Digest,
        #[arg(long, value_parser = parse_digest)]
        migration_auth: Digest,
        #[arg(long, default_value_t = 2048)]
        key_length: u32,
        #[arg(long, value_enum, default_value_t = KeyUsageArg::Bind)]
        usage: KeyUsageArg,
        #[arg(long)]
        out: String,
    },
    /// `TPM_LoadKey2`, printing the assigned transient key handle.
    LoadKey {
        #[arg(long, default_value_t = tpm12_proto::SRK_HANDLE, value_parser = maybe_hex::<u32>)]
        parent: u32,
        #[arg(long, value_parser = parse_digest)]
        parent_auth: Digest,
        #[arg(long)]
        blob: String,
    },
    /// Signs `external_data` with a loaded key over the selected PCRs, via
    /// `TPM_Quote` -- the only signing primitive this stack implements
    /// (there is no standalone `TPM_Sign` ordinal in the dispatcher).
    Sign {
        #[arg(long, value_parser = maybe_hex::<u32>)]
        key_handle: u32,
        #[arg(long, value_parser = parse_digest)]
        key_auth: Digest,
        #[arg(long, value_parser = parse_digest)]
        external_data: Digest,
        #[arg(long, value_delimiter = ',', default_value = "0")]
        pcrs: Vec<usize>,
    },
    /// `TPM_Quote`, printing the PCR composite hash and signature.
    Quote {
        #[arg(long, value_parser = maybe_hex::<u32>)]
        key_handle: u32,
        #[arg(long, value_parser = parse_digest)]
        key_auth: Digest,
        #[arg(long, value_parser = parse_digest)]
        external_data: Digest,
        #[arg(long, value_delimiter = ',', default_value = "0")]
        pcrs: Vec<usize>,
    },
    /// `TPM_NV_DefineSpace`, owner-authorized.
    NvDefine {
        #[arg(long, value_parser = maybe_hex::<u32>)]
        index: u32,
        #[arg(long)]
        size: u32,
        #[arg(long, value_parser = parse_digest)]
        owner_auth: Digest,
        #[arg(long, value_parser = parse_digest)]
        area_auth: Digest,
    },
    /// `TPM_NV_WriteValue`, owner-authorized.
    NvWrite {
        #[arg(long, value_parser = maybe_hex::<u32>)]
        index: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, value_parser = parse_hex_bytes)]
        data: Vec<u8>,
        #[arg(long, value_parser = parse_digest)]
        owner_auth: Digest,
    },
    /// `TPM_NV_ReadValue`, owner-authorized.
    NvRead {
        #[arg(long, value_parser = maybe_hex::<u32>)]
        index: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long)]
        len: u32,
        #[arg(long, value_parser = parse_digest)]
        owner_auth: Digest,
    },
    /// `TPM_PcrRead`.
    PcrRead {
        #[arg(long)]
        index: u32,
    },
    /// `TPM_Extend`.
    PcrExtend {
        #[arg(long)]
        index: u32,
        #[arg(long, value_parser = parse_digest)]
        digest: Digest,
    },
    /// `TPM_PCR_Reset`.
    PcrReset {
        #[arg(long, value_delimiter = ',')]
        pcrs: Vec<usize>,
    },
    /// Decode a numeric `TPM_RESULT` return code.
    Rc {
        #[arg(value_parser = maybe_hex::<u32>)]
        rc: u32,
    },
}

fn parse_digest(raw: &str) -> Result<Digest, String> {
    let bytes = parse_hex_bytes(raw)?;
    Digest::try_from(bytes).map_err(|_| format!("'{raw}' is not exactly {} bytes", tpm12_proto::DIGEST_SIZE))
}

fn parse_hex_bytes(raw: &str) -> Result<Vec<u8>, String> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    if raw.len() % 2 != 0 {
        return Err(format!("'{raw}' has an odd number of hex digits"));
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).map_err(|err| err.to_string()))
        .collect()
}

fn pcr_selection(indices: &[usize]) -> PcrSelection {
    let mut selection = PcrSelection::empty();
    for &index in indices {
        selection.set(index);
    }
    selection
}

fn run(cli: Cli) -> CliResult<()> {
    if let Commands::Rc { rc } = cli.command {
        println!("{} ({rc:#010x})", ResponseCode::from(rc));
        return Ok(());
    }

    let mut channel = Channel::connect(&cli.endpoint).map_err(|err| CliError::Connect(cli.endpoint.clone(), err))?;

    match cli.command {
        Commands::Rc { .. } => unreachable!("handled above"),
        Commands::Startup => {
            ops::startup(&mut channel)?;
            println!("ok");
        }
        Commands::TakeOwnership { owner_auth, srk_auth } => {
            let mut session = ops::oiap_open(&mut channel)?;
            let ek_modulus = ops::get_pub_key(&mut channel, tpm12_proto::EK_HANDLE, &mut session, &[0u8; 20], false)?;
            let ek_public =
                tpm12_crypto::RsaPublic::from_modulus(&ek_modulus, None).map_err(|_| tpm12_client::ClientError::Crypto)?;
            let mut session = ops::oiap_open(&mut channel)?;
            ops::take_ownership(&mut channel, &ek_public, &owner_auth, &srk_auth, &mut session, &owner_auth, false)?;
            println!("ownership taken");
        }
        Commands::CreateWrapKey {
            parent,
            parent_auth,
            usage_auth,
            migration_auth,
            key_length,
            usage,
            out,
        } => {
            let mut session = ops::oiap_open(&mut channel)?;
            let blob = ops::create_wrap_key(
                &mut channel,
                parent,
                &usage_auth,
                &migration_auth,
                key_length,
                usage.into(),
                KeyFlags::empty(),
                &mut session,
                &parent_auth,
                false,
            )?;
            let mut bytes = Vec::new();
            blob.encode(&mut bytes);
            fs::write(&out, &bytes).map_err(|err| CliError::WriteBlob(out.clone(), err))?;
            println!("wrote key blob to {out}");
        }
        Commands::LoadKey { parent, parent_auth, blob } => {
            let bytes = fs::read(&blob).map_err(|err| CliError::ReadBlob(blob.clone(), err))?;
            let (key, _) = Key12::decode(&bytes, false).map_err(|err| CliError::BadBlob(blob.clone(), err))?;
            let mut session = ops::oiap_open(&mut channel)?;
            let handle = ops::load_key2(&mut channel, parent, &key, &mut session, &parent_auth, false)?;
            println!("{handle:#010x}");
        }
        Commands::Sign {
            key_handle,
            key_auth,
            external_data,
            pcrs,
        }
        | Commands::Quote {
            key_handle,
            key_auth,
            external_data,
            pcrs,
        } => {
            let mut session = ops::oiap_open(&mut channel)?;
            let selection = pcr_selection(&pcrs);
            let (composite, signature) =
                ops::quote(&mut channel, key_handle, &external_data, &selection, &mut session, &key_auth, false)?;
            println!("pcrCompositeHash = {}", hex_string(&composite));
            println!("signature = {}", hex_string(&signature));
        }
        Commands::NvDefine {
            index,
            size,
            owner_auth,
            area_auth,
        } => {
            let public = tpm12_proto::nv::NvDataPublic {
                nv_index: index,
                pcr_info_read: None,
                pcr_info_write: None,
                permission: NvAttributes::OwnerWrite | NvAttributes::OwnerRead,
                data_size: size,
            };
            let mut session = ops::oiap_open(&mut channel)?;
            ops::nv_define_space(&mut channel, &public, &area_auth, &mut session, &owner_auth, false)?;
            println!("defined NV index {index:#010x}");
        }
        Commands::NvWrite {
            index,
            offset,
            data,
            owner_auth,
        } => {
            let mut session = ops::oiap_open(&mut channel)?;
            ops::nv_write_value(&mut channel, index, offset, &data, &mut session, &owner_auth, false)?;
            println!("wrote {} bytes to NV index {index:#010x}", data.len());
        }
        Commands::NvRead {
            index,
            offset,
            len,
            owner_auth,
        } => {
            let mut session = ops::oiap_open(&mut channel)?;
            let data = ops::nv_read_value(&mut channel, index, offset, len, &mut session, &owner_auth, false)?;
            println!("{}", hex_string(&data));
        }
        Commands::PcrRead { index } => {
            let value = ops::pcr_read(&mut channel, index)?;
            println!("{}", hex_string(&value));
        }
        Commands::PcrExtend { index, digest } => {
            let value = ops::extend(&mut channel, index, &digest)?;
            println!("{}", hex_string(&value));
        }
        Commands::PcrReset { pcrs } => {
            ops::pcr_reset(&mut channel, &pcr_selection(&pcrs))?;
            println!("ok");
        }
    }
    Ok(())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    run(cli).unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });
}
