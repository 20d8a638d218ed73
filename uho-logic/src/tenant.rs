//! Tenant routing. Every tenant owns an isolated Postgres schema named
//! `u_<hex>`; the namespace string is validated before it reaches any
//! statement, which is the sole injection defense on this path.

use crate::error::ServiceError;
use futures::future::BoxFuture;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, Statement,
    TransactionTrait,
};
use uuid::Uuid;

pub type NamespaceCallback<'c, T> = BoxFuture<'c, Result<T, ServiceError>>;

/// `u_` + the first 12 hex characters of the tenant uuid.
pub fn namespace_for_tenant(tenant_id: &Uuid) -> String {
    let hex = tenant_id.simple().to_string();
    format!("u_{}", &hex[..12])
}

/// `/^u_[a-f0-9]{8,12}$/`
pub fn validate_namespace(namespace: &str) -> Result<(), ServiceError> {
    let valid = namespace
        .strip_prefix("u_")
        .is_some_and(|hex| {
            (8..=12).contains(&hex.len())
                && hex
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        });
    if valid {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "invalid tenant namespace {namespace:?}"
        )))
    }
}

pub async fn ensure_namespace(
    db: &DatabaseConnection,
    namespace: &str,
) -> Result<(), ServiceError> {
    validate_namespace(namespace)?;
    db.execute(Statement::from_string(
        DbBackend::Postgres,
        format!("CREATE SCHEMA IF NOT EXISTS \"{namespace}\""),
    ))
    .await?;
    Ok(())
}

/// Runs `f` inside a transaction whose `search_path` is pinned to the tenant
/// namespace. `SET LOCAL` scopes the setting to the transaction, so the
/// pooled connection is restored on every exit path — commit, rollback, and
/// unwind-triggered drop alike.
pub async fn with_namespace<F, T>(
    db: &DatabaseConnection,
    namespace: &str,
    f: F,
) -> Result<T, ServiceError>
where
    F: for<'c> FnOnce(&'c DatabaseTransaction) -> NamespaceCallback<'c, T> + Send,
    T: Send,
{
    validate_namespace(namespace)?;
    let txn = db.begin().await?;
    txn.execute(Statement::from_string(
        DbBackend::Postgres,
        format!("SET LOCAL search_path TO \"{namespace}\""),
    ))
    .await?;
    match f(&txn).await {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            // rollback failure is secondary to the original error
            let _ = txn.rollback().await;
            Err(err)
        }
    }
}
