//! Kubecraft registration service
//!
//! Exposes tenant onboarding to the command-line front end.
//!
//! # Endpoints
//!
//! - `POST /register` - `{"tenantName": "..."}` registers a tenant and returns its token
//! - `GET /health` - Health check

#![deny(missing_docs)]

pub mod args;
pub mod server;

pub use args::ConfigArgs;
pub use server::{router, serve, AppState, RegisterRequest, RegisterResponse};
