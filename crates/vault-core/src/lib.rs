//! RDP Vault Core - master password gate and credential lifecycle
//!
//! This crate provides:
//! - Argon2id master password digest with bounded retry and lockout
//! - AES-256-GCM encryption of credential fields, bound to the OS user
//! - Time-bounded exposure of credentials to the OS credential cache
//! - Plain-text audit logging of connections and revocations
//! - Server list and configuration storage

pub mod audit;
pub mod crypto;
pub mod error;
pub mod exposure;
pub mod master;
pub mod models;
pub mod platform;
pub mod storage;

pub use audit::*;
pub use crypto::*;
pub use error::*;
pub use exposure::*;
pub use master::*;
pub use models::*;
pub use platform::*;
pub use storage::*;
