//! Anchor-dialect instruction parsing: derived `global:` discriminators and
//! depth-first flattening of nested account groups.

use super::descriptor::{
    anchor_instruction_discriminator, snake_case, InstructionDescriptor,
};
use crate::error::ServiceError;
use serde_json::Value;

pub(super) fn parse_instructions(
    raw: &Value,
) -> Result<Vec<InstructionDescriptor>, ServiceError> {
    let Some(instructions) = raw.get("instructions").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    instructions
        .iter()
        .map(|ix| {
            let name = ix
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ServiceError::InvalidIdl("instruction without a name".into()))?;
            let discriminator = match ix.get("discriminator") {
                Some(bytes) => {
                    let bytes = super::parse_discriminator_bytes(bytes)?;
                    if !matches!(bytes.len(), 1 | 2 | 4 | 8) {
                        return Err(ServiceError::InvalidIdl(format!(
                            "instruction {name} discriminator must be 1, 2, 4 or 8 bytes"
                        )));
                    }
                    bytes
                }
                None => anchor_instruction_discriminator(name).to_vec(),
            };
            let mut accounts = Vec::new();
            if let Some(raw_accounts) = ix.get("accounts") {
                flatten_accounts(raw_accounts, &mut accounts);
            }
            let args = match ix.get("args") {
                Some(args) => super::parse_fields(args)?,
                None => Vec::new(),
            };
            Ok(InstructionDescriptor {
                name: snake_case(name),
                discriminator,
                accounts,
                args,
            })
        })
        .collect()
}

/// Nested account groups (`{name, accounts: [..]}`) are flattened depth-first
/// into a single positional list.
fn flatten_accounts(accounts: &Value, out: &mut Vec<String>) {
    let Some(accounts) = accounts.as_array() else {
        return;
    };
    for account in accounts {
        if let Some(nested) = account.get("accounts") {
            flatten_accounts(nested, out);
        } else if let Some(name) = account.get("name").and_then(Value::as_str) {
            out.push(snake_case(name));
        }
    }
}
