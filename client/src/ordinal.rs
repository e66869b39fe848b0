// SPDX-License-Identifier: MIT
//! Ordinal constants for the subset of the TPM 1.2 command set this stack's
//! `tpm12-core` dispatcher implements. Kept in lockstep with
//! `tpm12_core::dispatcher::ordinal` by hand, the same way a host-side TSS
//! and a device firmware agree on command codes without sharing a crate.

pub const OIAP: u32 = 0x0A;
pub const OSAP: u32 = 0x0B;
pub const TAKE_OWNERSHIP: u32 = 0x0D;
pub const EXTEND: u32 = 0x14;
pub const PCR_READ: u32 = 0x15;
pub const QUOTE: u32 = 0x16;
pub const CREATE_WRAP_KEY: u32 = 0x1F;
pub const GET_PUB_KEY: u32 = 0x21;
pub const DSAP: u32 = 0x11;
pub const RESET_LOCK_VALUE: u32 = 0x40;
pub const LOAD_KEY2: u32 = 0x41;
pub const SET_ORDINAL_AUDIT_STATUS: u32 = 0x8C;
pub const SAVE_STATE: u32 = 0x98;
pub const STARTUP: u32 = 0x99;
pub const GET_TEST_RESULT: u32 = 0x54;
pub const FLUSH_SPECIFIC: u32 = 0xBA;
pub const NV_DEFINE_SPACE: u32 = 0xCC;
pub const NV_WRITE_VALUE: u32 = 0xCD;
pub const NV_WRITE_VALUE_AUTH: u32 = 0xCE;
pub const NV_READ_VALUE: u32 = 0xCF;
pub const NV_READ_VALUE_AUTH: u32 = 0xD0;
pub const DELEGATE_MANAGE: u32 = 0xD2;
pub const DELEGATE_CREATE_OWNER_DELEGATION: u32 = 0xD5;
pub const DELEGATE_UPDATE_VERIFICATION: u32 = 0xD3;
pub const DELEGATE_VERIFY_AUTH: u32 = 0xD1;
pub const QUOTE2: u32 = 0xD8;
pub const CREATE_COUNTER: u32 = 0xDC;
pub const INCREMENT_COUNTER: u32 = 0xDD;
pub const READ_COUNTER: u32 = 0xDE;
pub const RELEASE_COUNTER: u32 = 0xDF;
pub const ESTABLISH_TRANSPORT: u32 = 0xE6;
pub const RELEASE_TRANSPORT_SIGNED: u32 = 0xE8;
pub const READ_CURRENT_TICKS: u32 = 0xF1;
pub const PCR_RESET: u32 = 0xC8;
pub const GET_AUDIT_DIGEST_SIGNED: u32 = 0xA6;
pub const DELEGATE_CREATE_KEY_DELEGATION: u32 = 0xD4;
pub const DELEGATE_LOAD_OWNER_DELEGATION: u32 = 0xD6;
pub const DELEGATE_READ_TABLE: u32 = 0xDB;
/// A vendor/vTPM-extension ordinal, not part of the core TCG Part 3
/// assignment -- DeepQuote is a vTPM addition layered on top of ordinary
/// `Quote`.
pub const DEEP_QUOTE: u32 = 0x8A;
pub const AUTHORIZE_MIGRATION_KEY: u32 = 0x2B;
pub const CREATE_MIGRATION_BLOB: u32 = 0x28;
pub const CONVERT_MIGRATION_BLOB: u32 = 0x2A;
pub const CMK_CREATE_KEY: u32 = 0x13;
pub const CMK_CREATE_TICKET: u32 = 0x12;
pub const CMK_APPROVE_MA: u32 = 0x1D;
pub const CMK_CREATE_BLOB: u32 = 0x89;
pub const CMK_CONVERT_MIGRATION: u32 = 0x24;
