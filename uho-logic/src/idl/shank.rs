//! Shank-dialect instruction parsing: declared variant tags encoded
//! little-endian at their declared width.

use super::descriptor::{snake_case, InstructionDescriptor};
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
            let discriminator = parse_discriminant(name, ix.get("discriminant"))?;
            let mut accounts = Vec::new();
            if let Some(raw_accounts) = ix.get("accounts").and_then(Value::as_array) {
                for account in raw_accounts {
                    if let Some(name) = account.get("name").and_then(Value::as_str) {
                        accounts.push(snake_case(name));
                    }
                }
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

pub(super) fn parse_discriminant(
    name: &str,
    discriminant: Option<&Value>,
) -> Result<Vec<u8>, ServiceError> {
    let discriminant = discriminant.ok_or_else(|| {
        ServiceError::InvalidIdl(format!("instruction {name} is missing a discriminant"))
    })?;
    let value = discriminant
        .get("value")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ServiceError::InvalidIdl(format!(
                "instruction {name} discriminant has no numeric value"
            ))
        })?;
    match discriminant.get("type").and_then(Value::as_str) {
        Some("u8") if value <= u8::MAX as u64 => Ok(vec![value as u8]),
        Some("u16") if value <= u16::MAX as u64 => Ok((value as u16).to_le_bytes().to_vec()),
        Some("u32") if value <= u32::MAX as u64 => Ok((value as u32).to_le_bytes().to_vec()),
        Some(other) => Err(ServiceError::InvalidIdl(format!(
            "instruction {name} discriminant width {other:?} is not one of u8/u16/u32"
        ))),
        None => Err(ServiceError::InvalidIdl(format!(
            "instruction {name} discriminant has no declared type"
        ))),
    }
}
