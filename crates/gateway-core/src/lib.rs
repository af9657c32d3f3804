//! Protocol translation and SSE streaming core for the OpenAI-compatible
//! gateway. This crate has no HTTP server of its own: it takes an already
//! decoded request body plus an [`account::Account`], rewrites it,
//! forwards it, and either returns a translated JSON body or drives a
//! `text/event-stream` pump. The binary crate that exposes this over axum
//! owns routing, auth, and the concrete collaborator implementations
//! (account storage, token refresh, rate limiting, ops logging).

pub mod account;
pub mod classifier;
pub mod codex_model;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod request_rewriter;
pub mod response_rewriter;
pub mod sse;
pub mod tool_correct;
pub mod usage;

pub use account::{Account, AccountType};
pub use error::{GatewayError, UpstreamFailoverError};
