//! Tenant schema compilation: per-event and per-instruction tables, the
//! fixed checkpoint/log/token tables, and materialized views, all emitted
//! as `IF NOT EXISTS` statements with validated, quoted identifiers.

pub mod ddl;
pub mod views;

use crate::error::ServiceError;

/// Metadata columns present on every event table; IDL field names colliding
/// with one of these are suffixed by [`column_name`].
pub const RESERVED_COLUMNS: &[&str] = &[
    "id",
    "slot",
    "block_time",
    "tx_signature",
    "ix_index",
    "inner_ix_index",
    "indexed_at",
];

/// `/^[a-zA-Z][a-zA-Z0-9_]{0,62}$/` — applied to every identifier derived
/// from an IDL before it is quoted into a statement.
pub fn validate_identifier(name: &str) -> Result<(), ServiceError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {
            name.len() <= 63
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidIdl(format!(
            "identifier {name:?} is not a valid SQL identifier"
        )))
    }
}

/// Double-quotes a previously validated identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Column name for an IDL field, suffixing collisions with the metadata set.
pub fn column_name(field_name: &str) -> String {
    if RESERVED_COLUMNS.contains(&field_name) {
        format!("{field_name}_field")
    } else {
        field_name.to_string()
    }
}

/// Column name for a positional instruction account.
pub fn account_column_name(account_name: &str) -> String {
    format!("acct_{account_name}")
}
