use crate::rpc::RpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid idl: {0}")]
    InvalidIdl(String),
    #[error("invalid view: {0}")]
    InvalidView(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("backfill range exceeds the demo cap of {max_slots} slots")]
    DemoLimit { max_slots: u64 },
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Machine code surfaced to the control plane alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidIdl(_) => "INVALID_IDL",
            Self::InvalidView(_) => "INVALID_VIEW",
            Self::Validation(_) => "INVALID_INPUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::DemoLimit { .. } => "DEMO_LIMIT",
            Self::Rpc(_) => "RPC_ERROR",
            Self::Db(_) => "DB_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<sea_orm::TransactionError<ServiceError>> for ServiceError {
    fn from(err: sea_orm::TransactionError<ServiceError>) -> Self {
        match err {
            sea_orm::TransactionError::Connection(e) => Self::Db(e),
            sea_orm::TransactionError::Transaction(e) => e,
        }
    }
}
