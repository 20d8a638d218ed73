use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Canonical, dialect-independent description of a program interface.
/// Built once at subscription creation and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDescriptor {
    /// Base58 program address, 32..=44 characters.
    pub program_id: String,
    /// Snake-case program name used as the table prefix.
    pub program_name: String,
    pub events: Vec<EventDescriptor>,
    pub instructions: Vec<InstructionDescriptor>,
    pub accounts: Vec<AccountDescriptor>,
    /// Resolved `defined` type layouts, keyed by the declared type name.
    pub types: BTreeMap<String, Vec<FieldDescriptor>>,
}

impl ProgramDescriptor {
    pub fn event(&self, name: &str) -> Option<&EventDescriptor> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn instruction(&self, name: &str) -> Option<&InstructionDescriptor> {
        self.instructions.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventDescriptor {
    /// Snake-case event name used as the table suffix.
    pub name: String,
    pub discriminator: [u8; 8],
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstructionDescriptor {
    pub name: String,
    /// 1, 2, 4 or 8 bytes, matched against the leading instruction data.
    pub discriminator: Vec<u8>,
    /// Ordered account names, bound positionally at decode time.
    pub accounts: Vec<String>,
    pub args: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub wire: WireType,
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn sql_type(&self) -> SqlType {
        self.wire.sql_type()
    }
}

/// Wire-level Borsh type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum WireType {
    U8,
    U16,
    U32,
    U64,
    U128,
    I8,
    I16,
    I32,
    I64,
    I128,
    F32,
    F64,
    Bool,
    String,
    Pubkey,
    Bytes,
    Option(Box<WireType>),
    Vec(Box<WireType>),
    Array(Box<WireType>, usize),
    Defined(String),
    Unknown,
}

impl WireType {
    pub fn sql_type(&self) -> SqlType {
        match self {
            Self::U8 | Self::U16 | Self::U32 | Self::I8 | Self::I16 | Self::I32 => {
                SqlType::Integer
            }
            Self::U64 | Self::I64 => SqlType::BigInt,
            Self::U128 | Self::I128 => SqlType::Numeric,
            Self::F32 | Self::F64 => SqlType::DoublePrecision,
            Self::Bool => SqlType::Boolean,
            Self::String | Self::Pubkey => SqlType::Text,
            Self::Bytes => SqlType::Bytea,
            Self::Option(inner) => inner.sql_type(),
            Self::Vec(_) | Self::Array(_, _) | Self::Defined(_) | Self::Unknown => SqlType::Jsonb,
        }
    }
}

/// Relational column type a wire type maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    BigInt,
    Numeric,
    DoublePrecision,
    Boolean,
    Text,
    Bytea,
    Jsonb,
}

impl SqlType {
    pub fn ddl(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Numeric => "NUMERIC(39,0)",
            Self::DoublePrecision => "DOUBLE PRECISION",
            Self::Boolean => "BOOLEAN",
            Self::Text => "TEXT",
            Self::Bytea => "BYTEA",
            Self::Jsonb => "JSONB",
        }
    }
}

/// Converts camelCase / PascalCase identifiers to snake_case.
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower = false;
    for ch in input.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            for low in ch.to_lowercase() {
                out.push(low);
            }
            prev_lower = false;
        } else {
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}

/// Default Anchor event discriminator: `sha256("event:" + Name)[0..8]`.
pub fn event_discriminator(event_name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("event:{event_name}").as_bytes());
    digest[..8].try_into().expect("sha256 digest is 32 bytes")
}

/// Default Anchor instruction discriminator: `sha256("global:" + snake_name)[0..8]`.
pub fn anchor_instruction_discriminator(instruction_name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("global:{}", snake_case(instruction_name)).as_bytes());
    digest[..8].try_into().expect("sha256 digest is 32 bytes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_conversions() {
        assert_eq!(snake_case("SwapEvent"), "swap_event");
        assert_eq!(snake_case("tokenAmountIn"), "token_amount_in");
        assert_eq!(snake_case("already_snake"), "already_snake");
        assert_eq!(snake_case("HTTPServer"), "httpserver");
        assert_eq!(snake_case("v2Pool"), "v2_pool");
    }

    #[test]
    fn option_preserves_inner_sql_type() {
        assert_eq!(
            WireType::Option(Box::new(WireType::U64)).sql_type(),
            SqlType::BigInt
        );
        assert_eq!(
            WireType::Option(Box::new(WireType::Pubkey)).sql_type(),
            SqlType::Text
        );
    }

    #[test]
    fn container_types_map_to_jsonb() {
        assert_eq!(
            WireType::Vec(Box::new(WireType::U64)).sql_type(),
            SqlType::Jsonb
        );
        assert_eq!(
            WireType::Array(Box::new(WireType::U8), 4).sql_type(),
            SqlType::Jsonb
        );
        assert_eq!(
            WireType::Defined("PoolState".into()).sql_type(),
            SqlType::Jsonb
        );
        assert_eq!(WireType::Unknown.sql_type(), SqlType::Jsonb);
    }

    #[test]
    fn event_discriminator_is_derived_from_pascal_name() {
        let disc = event_discriminator("SwapEvent");
        assert_eq!(disc.len(), 8);
        assert_ne!(disc, event_discriminator("OtherEvent"));
        // stable across calls
        assert_eq!(disc, event_discriminator("SwapEvent"));
    }
}
