//! Cursor-based Borsh reader driven by runtime field layouts. The layouts
//! come from the IDL, so nothing here derives a serializer; every value is
//! read into JSON.

use crate::idl::descriptor::{FieldDescriptor, WireType};
use base64::prelude::*;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BorshError {
    #[error("unexpected end of data")]
    UnexpectedEof,
    #[error("invalid utf-8 in string")]
    Utf8,
    #[error("invalid option tag {0}")]
    OptionTag(u8),
    #[error("no known layout for type {0:?}")]
    UnknownLayout(String),
}

pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BorshError> {
        if self.remaining() < n {
            return Err(BorshError::UnexpectedEof);
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, BorshError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, BorshError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_string(&mut self) -> Result<String, BorshError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BorshError::Utf8)
    }
}

macro_rules! read_le {
    ($cursor:expr, $ty:ty) => {{
        let bytes = $cursor.take(std::mem::size_of::<$ty>())?;
        <$ty>::from_le_bytes(bytes.try_into().unwrap())
    }};
}

/// Reads one value of the given wire type, resolving `defined` references
/// through the descriptor's type registry.
pub fn read_value(
    cursor: &mut Cursor<'_>,
    wire: &WireType,
    types: &BTreeMap<String, Vec<FieldDescriptor>>,
) -> Result<Value, BorshError> {
    let value = match wire {
        WireType::U8 => Value::from(read_le!(cursor, u8)),
        WireType::U16 => Value::from(read_le!(cursor, u16)),
        WireType::U32 => Value::from(read_le!(cursor, u32)),
        WireType::U64 => Value::from(read_le!(cursor, u64)),
        WireType::I8 => Value::from(read_le!(cursor, i8)),
        WireType::I16 => Value::from(read_le!(cursor, i16)),
        WireType::I32 => Value::from(read_le!(cursor, i32)),
        WireType::I64 => Value::from(read_le!(cursor, i64)),
        // 128-bit integers exceed JSON number range; carried as strings
        WireType::U128 => Value::String(read_le!(cursor, u128).to_string()),
        WireType::I128 => Value::String(read_le!(cursor, i128).to_string()),
        WireType::F32 => Number::from_f64(read_le!(cursor, f32) as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        WireType::F64 => Number::from_f64(read_le!(cursor, f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        WireType::Bool => Value::Bool(cursor.read_u8()? != 0),
        WireType::String => Value::String(cursor.read_string()?),
        WireType::Pubkey => Value::String(bs58::encode(cursor.take(32)?).into_string()),
        WireType::Bytes => {
            let len = cursor.read_u32()? as usize;
            Value::String(BASE64_STANDARD.encode(cursor.take(len)?))
        }
        WireType::Option(inner) => match cursor.read_u8()? {
            0 => Value::Null,
            1 => read_value(cursor, inner, types)?,
            tag => return Err(BorshError::OptionTag(tag)),
        },
        WireType::Vec(inner) => {
            let len = cursor.read_u32()? as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(read_value(cursor, inner, types)?);
            }
            Value::Array(items)
        }
        WireType::Array(inner, len) => {
            let mut items = Vec::with_capacity(*len);
            for _ in 0..*len {
                items.push(read_value(cursor, inner, types)?);
            }
            Value::Array(items)
        }
        WireType::Defined(name) => {
            let fields = types
                .get(name)
                .ok_or_else(|| BorshError::UnknownLayout(name.clone()))?;
            Value::Object(read_struct(cursor, fields, types)?)
        }
        WireType::Unknown => return Err(BorshError::UnknownLayout("unknown".into())),
    };
    Ok(value)
}

/// Reads a struct as a field-name-keyed JSON object, in declaration order.
pub fn read_struct(
    cursor: &mut Cursor<'_>,
    fields: &[FieldDescriptor],
    types: &BTreeMap<String, Vec<FieldDescriptor>>,
) -> Result<Map<String, Value>, BorshError> {
    let mut out = Map::new();
    for field in fields {
        let value = read_value(cursor, &field.wire, types)?;
        out.insert(field.name.clone(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, wire: WireType) -> FieldDescriptor {
        let nullable = matches!(wire, WireType::Option(_));
        FieldDescriptor {
            name: name.into(),
            wire,
            nullable,
        }
    }

    #[test]
    fn reads_primitives_in_declaration_order() {
        let mut data = Vec::new();
        data.extend_from_slice(&1500u64.to_le_bytes());
        data.extend_from_slice(&(-7i32).to_le_bytes());
        data.push(1); // bool
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(b"mint");

        let fields = vec![
            field("amount", WireType::U64),
            field("tick", WireType::I32),
            field("closed", WireType::Bool),
            field("label", WireType::String),
        ];
        let mut cursor = Cursor::new(&data);
        let out = read_struct(&mut cursor, &fields, &BTreeMap::new()).unwrap();
        assert_eq!(
            Value::Object(out),
            json!({ "amount": 1500u64, "tick": -7, "closed": true, "label": "mint" })
        );
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn u128_is_read_as_decimal_string() {
        let data = 340_282_366_920_938_463_463_374u128.to_le_bytes();
        let mut cursor = Cursor::new(&data);
        let value = read_value(&mut cursor, &WireType::U128, &BTreeMap::new()).unwrap();
        assert_eq!(value, json!("340282366920938463463374"));
    }

    #[test]
    fn pubkeys_render_as_base58() {
        let data = [0u8; 32];
        let mut cursor = Cursor::new(&data);
        let value = read_value(&mut cursor, &WireType::Pubkey, &BTreeMap::new()).unwrap();
        assert_eq!(value, json!("11111111111111111111111111111111"));
    }

    #[test]
    fn options_read_their_tag() {
        let mut data = vec![1u8];
        data.extend_from_slice(&9u64.to_le_bytes());
        data.push(0);
        let wire = WireType::Option(Box::new(WireType::U64));
        let mut cursor = Cursor::new(&data);
        assert_eq!(
            read_value(&mut cursor, &wire, &BTreeMap::new()).unwrap(),
            json!(9u64)
        );
        assert_eq!(
            read_value(&mut cursor, &wire, &BTreeMap::new()).unwrap(),
            Value::Null
        );
        assert_eq!(
            read_value(&mut Cursor::new(&[7u8]), &wire, &BTreeMap::new()),
            Err(BorshError::OptionTag(7))
        );
    }

    #[test]
    fn vec_and_array_expand_to_json_arrays() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&10u16.to_le_bytes());
        data.extend_from_slice(&20u16.to_le_bytes());
        let mut cursor = Cursor::new(&data);
        let value = read_value(
            &mut cursor,
            &WireType::Vec(Box::new(WireType::U16)),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(value, json!([10, 20]));

        let data = [1u8, 2, 3];
        let mut cursor = Cursor::new(&data);
        let value = read_value(
            &mut cursor,
            &WireType::Array(Box::new(WireType::U8), 3),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn defined_types_resolve_through_the_registry() {
        let mut types = BTreeMap::new();
        types.insert(
            "Pair".to_string(),
            vec![field("base", WireType::U8), field("quote", WireType::U8)],
        );
        let data = [3u8, 4];
        let mut cursor = Cursor::new(&data);
        let value = read_value(
            &mut cursor,
            &WireType::Defined("Pair".into()),
            &types,
        )
        .unwrap();
        assert_eq!(value, json!({ "base": 3, "quote": 4 }));

        let err = read_value(
            &mut Cursor::new(&data),
            &WireType::Defined("Missing".into()),
            &types,
        )
        .unwrap_err();
        assert_eq!(err, BorshError::UnknownLayout("Missing".into()));
    }

    #[test]
    fn truncated_payloads_fail_with_eof() {
        let data = 5u32.to_le_bytes();
        let mut cursor = Cursor::new(&data);
        assert_eq!(
            read_value(&mut cursor, &WireType::U64, &BTreeMap::new()),
            Err(BorshError::UnexpectedEof)
        );
    }
}
