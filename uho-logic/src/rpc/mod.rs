//! Solana JSON-RPC 2.0 client: current slot, paginated
//! signatures-for-address, and parsed transaction fetches, with bounded
//! retries on transient failures.

pub mod client;
pub mod types;

pub use client::{RpcSettings, SignaturesRequest, SolanaRpcClient, MAX_SIGNATURE_PAGE_LIMIT};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(u16),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Transient failures are retried by the client and translated into
    /// "retry next tick" by the poller; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(status) => *status >= 500,
            Self::Rpc { .. } | Self::InvalidResponse(_) => false,
        }
    }
}
