//! REST client module for the hosted backend.
//!
//! This module provides the `RestBackend`, a PostgREST implementation of
//! [`Remote`](crate::remote::Remote), and the `RemoteError` taxonomy that the
//! coordinator classifies failures with.
//!
//! Requests carry the project `apikey` header and a bearer token: the signed-in
//! user's JWT when one is set, the anon key otherwise.

pub mod client;
pub mod error;

pub use client::RestBackend;
pub use error::RemoteError;
