//! Webauthn-rp-core - A Webauthn relying party core for Rust Server Applications
//!
//! Webauthn is a standard allowing communication between servers, browsers and authenticators
//! to allow strong, passwordless, cryptographic authentication to be performed. This crate
//! implements the relying party side for FIDO U2F authenticators: registration with `fido-u2f`
//! attestation, assertion verification, and tracing attestation certificates to trusted roots
//! with the FIDO Metadata Service.
//!
//! To use this library yourself, you will want to reference the `WebauthnConfig` trait to
//! develop site specific policy and configuration, the `StorageBackend` trait to persist
//! challenges and credentials, and the `RelyingPartyManager` struct for Webauthn
//! interactions.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
// #![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
extern crate tracing;

#[macro_use]
mod macros;

mod constants;

pub mod attestation;
pub mod base64_data;
pub mod core;
pub mod crypto;
pub mod ephemeral;
pub mod error;
pub mod internals;
pub mod metadata;
pub mod proto;
pub mod storage;

pub use attestation::verify_attestation_ca_chain;
pub use attestation::AttestationFormat;

pub use crate::core::*;
pub use crate::error::WebauthnError;
pub use crate::metadata::{FidoMetadataClient, MdsTransport, MetadataSource};
pub use crate::storage::StorageBackend;
