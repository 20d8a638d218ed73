//! IDL normalization: detects the on-disk dialect and produces a canonical
//! [`ProgramDescriptor`] with events, instructions, accounts, discriminators
//! and the SQL type mapping attached to every field.

pub mod descriptor;

mod anchor;
mod codama;
mod shank;

use crate::error::ServiceError;
use descriptor::{
    event_discriminator, snake_case, AccountDescriptor, EventDescriptor, FieldDescriptor,
    ProgramDescriptor, WireType,
};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlDialect {
    Anchor,
    Shank,
    Codama,
}

/// Detects the IDL dialect from the raw JSON document.
///
/// Codama wins when `metadata.origin` says so; Shank when either the origin
/// is declared or the document has no top-level `address` and its first
/// instruction carries a `discriminant` object; everything else is Anchor.
pub fn detect(raw: &Value) -> IdlDialect {
    let origin = raw
        .pointer("/metadata/origin")
        .and_then(Value::as_str);
    if matches!(origin, Some("codama") | Some("kinobi")) {
        return IdlDialect::Codama;
    }
    if origin == Some("shank") {
        return IdlDialect::Shank;
    }
    let first_instruction_has_discriminant = raw
        .get("instructions")
        .and_then(Value::as_array)
        .and_then(|ixs| ixs.first())
        .and_then(|ix| ix.get("discriminant"))
        .is_some_and(Value::is_object);
    if raw.get("address").is_none() && first_instruction_has_discriminant {
        return IdlDialect::Shank;
    }
    IdlDialect::Anchor
}

/// Parses a raw IDL into the canonical descriptor.
///
/// `fallback_program_id` covers dialects (Shank) whose documents omit the
/// program address; the registration call always carries one.
pub fn parse(
    raw: &Value,
    fallback_program_id: Option<&str>,
) -> Result<ProgramDescriptor, ServiceError> {
    let dialect = detect(raw);
    let types = build_type_registry(raw);
    let program_name = parse_program_name(raw)?;
    let program_id = resolve_program_id(raw, fallback_program_id)?;
    let events = parse_events(raw, &types)?;
    let instructions = match dialect {
        IdlDialect::Anchor => anchor::parse_instructions(raw)?,
        IdlDialect::Shank => shank::parse_instructions(raw)?,
        IdlDialect::Codama => codama::parse_instructions(raw)?,
    };
    let accounts = parse_accounts(raw, &types);

    Ok(ProgramDescriptor {
        program_id,
        program_name,
        events,
        instructions,
        accounts,
        types,
    })
}

fn parse_program_name(raw: &Value) -> Result<String, ServiceError> {
    let name = raw
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .or_else(|| raw.get("name").and_then(Value::as_str))
        .ok_or_else(|| ServiceError::InvalidIdl("missing program name".into()))?;
    let name = snake_case(name);
    if !is_valid_program_name(&name) {
        return Err(ServiceError::InvalidIdl(format!(
            "program name {name:?} is not a valid snake_case identifier"
        )));
    }
    Ok(name)
}

fn resolve_program_id(
    raw: &Value,
    fallback: Option<&str>,
) -> Result<String, ServiceError> {
    let address = raw
        .get("address")
        .and_then(Value::as_str)
        .or_else(|| raw.pointer("/metadata/address").and_then(Value::as_str))
        .or(fallback)
        .ok_or_else(|| ServiceError::InvalidIdl("missing program address".into()))?;
    validate_program_id(address)?;
    Ok(address.to_string())
}

pub fn validate_program_id(address: &str) -> Result<(), ServiceError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|_| ServiceError::InvalidIdl(format!("program id {address:?} is not base58")))?;
    if !(32..=44).contains(&address.len()) || decoded.len() != 32 {
        return Err(ServiceError::InvalidIdl(format!(
            "program id {address:?} is not a 32-byte base58 address"
        )));
    }
    Ok(())
}

fn is_valid_program_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Builds the `name -> fields` registry from the top-level `types[]` map.
///
/// First pass collects struct layouts; `defined` references between them are
/// resolved lazily at decode time, so a reference to a name that never shows
/// up here simply collapses to JSONB.
fn build_type_registry(raw: &Value) -> BTreeMap<String, Vec<FieldDescriptor>> {
    let mut registry = BTreeMap::new();
    let Some(types) = raw.get("types").and_then(Value::as_array) else {
        return registry;
    };
    for ty in types {
        let Some(name) = ty.get("name").and_then(Value::as_str) else {
            continue;
        };
        let Some(fields) = ty
            .pointer("/type/fields")
            .filter(|_| ty.pointer("/type/kind").and_then(Value::as_str) == Some("struct"))
        else {
            // enums and opaque kinds are not expanded
            continue;
        };
        if let Ok(fields) = parse_fields(fields) {
            registry.insert(name.to_string(), fields);
        }
    }
    registry
}

fn parse_events(
    raw: &Value,
    types: &BTreeMap<String, Vec<FieldDescriptor>>,
) -> Result<Vec<EventDescriptor>, ServiceError> {
    let Some(events) = raw.get("events").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    events
        .iter()
        .map(|event| {
            let name = event
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ServiceError::InvalidIdl("event without a name".into()))?;
            let discriminator = match event.get("discriminator") {
                Some(bytes) => parse_discriminator_bytes(bytes)?
                    .try_into()
                    .map_err(|_| {
                        ServiceError::InvalidIdl(format!(
                            "event {name} discriminator must be exactly 8 bytes"
                        ))
                    })?,
                None => event_discriminator(name),
            };
            let fields = match event.get("fields") {
                Some(fields) => parse_fields(fields)?,
                None => types.get(name).cloned().ok_or_else(|| {
                    ServiceError::InvalidIdl(format!(
                        "event {name} has no inline fields and no matching type"
                    ))
                })?,
            };
            Ok(EventDescriptor {
                name: snake_case(name),
                discriminator,
                fields,
            })
        })
        .collect()
}

fn parse_accounts(
    raw: &Value,
    types: &BTreeMap<String, Vec<FieldDescriptor>>,
) -> Vec<AccountDescriptor> {
    let Some(accounts) = raw.get("accounts").and_then(Value::as_array) else {
        return Vec::new();
    };
    accounts
        .iter()
        .filter_map(|account| {
            let name = account.get("name").and_then(Value::as_str)?;
            let fields = account
                .pointer("/type/fields")
                .and_then(|fields| parse_fields(fields).ok())
                .or_else(|| types.get(name).cloned())
                .unwrap_or_default();
            Some(AccountDescriptor {
                name: snake_case(name),
                fields,
            })
        })
        .collect()
}

pub(super) fn parse_fields(fields: &Value) -> Result<Vec<FieldDescriptor>, ServiceError> {
    let fields = fields
        .as_array()
        .ok_or_else(|| ServiceError::InvalidIdl("fields must be an array".into()))?;
    fields
        .iter()
        .map(|field| {
            let name = field
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ServiceError::InvalidIdl("field without a name".into()))?;
            let wire = field
                .get("type")
                .map(parse_wire_type)
                .unwrap_or(WireType::Unknown);
            let nullable = matches!(wire, WireType::Option(_));
            Ok(FieldDescriptor {
                name: snake_case(name),
                wire,
                nullable,
            })
        })
        .collect()
}

pub(super) fn parse_wire_type(ty: &Value) -> WireType {
    if let Some(name) = ty.as_str() {
        return match name {
            "u8" => WireType::U8,
            "u16" => WireType::U16,
            "u32" => WireType::U32,
            "u64" => WireType::U64,
            "u128" => WireType::U128,
            "i8" => WireType::I8,
            "i16" => WireType::I16,
            "i32" => WireType::I32,
            "i64" => WireType::I64,
            "i128" => WireType::I128,
            "f32" => WireType::F32,
            "f64" => WireType::F64,
            "bool" => WireType::Bool,
            "string" => WireType::String,
            "pubkey" | "publicKey" => WireType::Pubkey,
            "bytes" => WireType::Bytes,
            _ => WireType::Unknown,
        };
    }
    if let Some(inner) = ty.get("option").or_else(|| ty.get("coption")) {
        return WireType::Option(Box::new(parse_wire_type(inner)));
    }
    if let Some(inner) = ty.get("vec") {
        return WireType::Vec(Box::new(parse_wire_type(inner)));
    }
    if let Some(array) = ty.get("array").and_then(Value::as_array) {
        if let (Some(inner), Some(len)) = (array.first(), array.get(1).and_then(Value::as_u64)) {
            return WireType::Array(Box::new(parse_wire_type(inner)), len as usize);
        }
        return WireType::Unknown;
    }
    if let Some(defined) = ty.get("defined") {
        let name = defined
            .as_str()
            .or_else(|| defined.get("name").and_then(Value::as_str));
        return match name {
            Some(name) => WireType::Defined(name.to_string()),
            None => WireType::Unknown,
        };
    }
    WireType::Unknown
}

pub(super) fn parse_discriminator_bytes(bytes: &Value) -> Result<Vec<u8>, ServiceError> {
    let bytes = bytes
        .as_array()
        .ok_or_else(|| ServiceError::InvalidIdl("discriminator must be a byte array".into()))?;
    bytes
        .iter()
        .map(|b| {
            b.as_u64()
                .filter(|b| *b <= u8::MAX as u64)
                .map(|b| b as u8)
                .ok_or_else(|| {
                    ServiceError::InvalidIdl("discriminator bytes must be in 0..=255".into())
                })
        })
        .collect()
}
