//! Authentication module for the signed-in user and backend credentials.
//!
//! This module provides:
//! - `Session`: the persisted user session, exposed through `SessionProvider`
//! - `CredentialStore`: backend API keys in the OS keychain via keyring
//!
//! The session carries the user's time zone, which the hydration pass uses to
//! decide which month is "current".

pub mod credentials;
pub mod session;

pub use credentials::CredentialStore;
pub use session::{Session, SessionData, SessionProvider};
