//! Cryptographic primitives for aup.
//!
//! Provides BLAKE3 content identity (one-shot, incremental, streaming) and
//! Ed25519 signing/verification for releases.
//!
//! All crypto operations wrap established libraries, no custom cryptography.

pub mod hasher;
pub mod signer;

pub use hasher::{identify, identify_reader, ContentHasher};
pub use signer::{Signature, SignatureError, SigningKey, VerifyingKey};
