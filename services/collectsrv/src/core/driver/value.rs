//! Typed read/write dispatch
//!
//! Codecs return a `RawValue` (bits, registers, a scalar or text); the driver
//! turns it into a `NativeValue` by matching on the point's declared data type.
//! Writes go the other way: the business value is parsed into the native type
//! and, for register-oriented codecs, laid out as registers in the point's byte
//! order.

use edgelink_calc::CalcValue;
use edgelink_model::{ByteOrder, DataType};
use serde::Serialize;

use crate::error::{CollectError, Result};

/// Value as returned by a codec
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Scalar(f64),
    Text(String),
}

/// Value in the point's declared native type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NativeValue {
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Text(String),
}

impl NativeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::I16(v) => Some(f64::from(*v)),
            Self::U16(v) => Some(f64::from(*v)),
            Self::I32(v) => Some(f64::from(*v)),
            Self::U32(v) => Some(f64::from(*v)),
            Self::I64(v) => Some(*v as f64),
            Self::U64(v) => Some(*v as f64),
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Big-endian byte image
    fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bool(b) => u16::from(*b).to_be_bytes().to_vec(),
            Self::I16(v) => v.to_be_bytes().to_vec(),
            Self::U16(v) => v.to_be_bytes().to_vec(),
            Self::I32(v) => v.to_be_bytes().to_vec(),
            Self::U32(v) => v.to_be_bytes().to_vec(),
            Self::I64(v) => v.to_be_bytes().to_vec(),
            Self::U64(v) => v.to_be_bytes().to_vec(),
            Self::F32(v) => v.to_be_bytes().to_vec(),
            Self::F64(v) => v.to_be_bytes().to_vec(),
            Self::Text(s) => s.as_bytes().to_vec(),
        }
    }

    /// Register image in the given byte order
    pub fn to_registers(&self, byte_order: ByteOrder) -> Vec<u16> {
        byte_order.to_registers(&self.to_be_bytes())
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::I16(v) => (*v).into(),
            Self::U16(v) => (*v).into(),
            Self::I32(v) => (*v).into(),
            Self::U32(v) => (*v).into(),
            Self::I64(v) => (*v).into(),
            Self::U64(v) => (*v).into(),
            Self::F32(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::F64(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl From<NativeValue> for CalcValue {
    fn from(v: NativeValue) -> Self {
        match v {
            NativeValue::Text(s) => CalcValue::Text(s),
            other => CalcValue::Number(other.as_f64().unwrap_or(f64::NAN)),
        }
    }
}

fn word_bytes<const N: usize>(words: &[u16], byte_order: ByteOrder) -> Result<[u8; N]> {
    let needed = N / 2;
    if words.len() < needed {
        return Err(CollectError::protocol(format!(
            "Short response: need {} registers, got {}",
            needed,
            words.len()
        )));
    }
    let bytes = byte_order.to_bytes(&words[..needed]);
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    Ok(out)
}

fn first_bit(raw: &RawValue) -> Result<bool> {
    match raw {
        RawValue::Bits(bits) => bits
            .first()
            .copied()
            .ok_or_else(|| CollectError::protocol("Empty bit response")),
        RawValue::Words(words) => words
            .first()
            .map(|w| *w != 0)
            .ok_or_else(|| CollectError::protocol("Empty register response")),
        RawValue::Scalar(v) => Ok(*v != 0.0),
        RawValue::Text(s) => parse_bool(s)
            .ok_or_else(|| CollectError::protocol(format!("Not a boolean: '{}'", s))),
    }
}

fn scalar_of(raw: &RawValue) -> Option<f64> {
    match raw {
        RawValue::Scalar(v) => Some(*v),
        RawValue::Text(s) => s.trim().parse().ok(),
        RawValue::Bits(bits) => bits.first().map(|b| if *b { 1.0 } else { 0.0 }),
        RawValue::Words(_) => None,
    }
}

macro_rules! decode_int {
    ($raw:expr, $bo:expr, $ty:ty, $variant:ident, $n:literal) => {
        match $raw {
            RawValue::Words(words) => Ok(NativeValue::$variant(<$ty>::from_be_bytes(
                word_bytes::<$n>(&words, $bo)?,
            ))),
            other => {
                let v = scalar_of(&other).ok_or_else(|| {
                    CollectError::protocol(format!("Cannot read {} from {:?}", stringify!($ty), other))
                })?;
                if v.fract() != 0.0 || v < <$ty>::MIN as f64 || v > <$ty>::MAX as f64 {
                    return Err(CollectError::protocol(format!(
                        "Value {} does not fit {}",
                        v,
                        stringify!($ty)
                    )));
                }
                Ok(NativeValue::$variant(v as $ty))
            },
        }
    };
}

/// Decode a codec result according to the point's declared data type
pub fn decode(raw: RawValue, data_type: &DataType, byte_order: ByteOrder, length: u16) -> Result<NativeValue> {
    match data_type {
        DataType::Bool => first_bit(&raw).map(NativeValue::Bool),
        DataType::Short => decode_int!(raw, byte_order, i16, I16, 2),
        DataType::UShort => decode_int!(raw, byte_order, u16, U16, 2),
        DataType::Int => decode_int!(raw, byte_order, i32, I32, 4),
        DataType::UInt => decode_int!(raw, byte_order, u32, U32, 4),
        DataType::Long => decode_int!(raw, byte_order, i64, I64, 8),
        DataType::ULong => decode_int!(raw, byte_order, u64, U64, 8),
        DataType::Float => match raw {
            RawValue::Words(words) => Ok(NativeValue::F32(f32::from_be_bytes(word_bytes::<4>(
                &words, byte_order,
            )?))),
            other => scalar_of(&other)
                .map(|v| NativeValue::F32(v as f32))
                .ok_or_else(|| CollectError::protocol(format!("Cannot read float from {:?}", other))),
        },
        DataType::Double => match raw {
            RawValue::Words(words) => Ok(NativeValue::F64(f64::from_be_bytes(word_bytes::<8>(
                &words, byte_order,
            )?))),
            other => scalar_of(&other)
                .map(NativeValue::F64)
                .ok_or_else(|| CollectError::protocol(format!("Cannot read double from {:?}", other))),
        },
        DataType::String => match raw {
            RawValue::Words(words) => {
                let bytes = byte_order.to_bytes(&words);
                let take = if length == 0 { bytes.len() } else { (length as usize).min(bytes.len()) };
                let text = String::from_utf8_lossy(&bytes[..take])
                    .trim_end_matches('\0')
                    .to_string();
                Ok(NativeValue::Text(text))
            },
            RawValue::Text(s) => Ok(NativeValue::Text(s)),
            RawValue::Scalar(v) => Ok(NativeValue::Text(v.to_string())),
            RawValue::Bits(bits) => Ok(NativeValue::Text(
                bits.iter().map(|b| if *b { '1' } else { '0' }).collect(),
            )),
        },
        DataType::Unknown(tag) => Err(CollectError::unsupported(tag)),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

macro_rules! parse_int {
    ($value:expr, $ty:ty, $variant:ident) => {
        match $value {
            CalcValue::Number(n) => {
                if n.is_finite()
                    && n.fract() == 0.0
                    && *n >= <$ty>::MIN as f64
                    && *n <= <$ty>::MAX as f64
                {
                    Some(NativeValue::$variant(*n as $ty))
                } else {
                    None
                }
            },
            CalcValue::Text(s) => s.trim().parse::<$ty>().ok().map(NativeValue::$variant),
        }
    };
}

/// Parse a (raw) value into the point's native type; `None` when it does not fit
pub fn parse_native(data_type: &DataType, value: &CalcValue) -> Option<NativeValue> {
    match data_type {
        DataType::Bool => match value {
            CalcValue::Number(n) if *n == 0.0 => Some(NativeValue::Bool(false)),
            CalcValue::Number(n) if *n == 1.0 => Some(NativeValue::Bool(true)),
            CalcValue::Number(_) => None,
            CalcValue::Text(s) => parse_bool(s).map(NativeValue::Bool),
        },
        DataType::Short => parse_int!(value, i16, I16),
        DataType::UShort => parse_int!(value, u16, U16),
        DataType::Int => parse_int!(value, i32, I32),
        DataType::UInt => parse_int!(value, u32, U32),
        DataType::Long => parse_int!(value, i64, I64),
        DataType::ULong => parse_int!(value, u64, U64),
        DataType::Float => value
            .as_f64()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| NativeValue::F32(v as f32)),
        DataType::Double => value
            .as_f64()
            .ok()
            .filter(|v| v.is_finite())
            .map(NativeValue::F64),
        DataType::String => Some(NativeValue::Text(value.as_text())),
        DataType::Unknown(_) => None,
    }
}

/// Interpret an inbound write value: numeric when it parses, text otherwise
pub fn business_value(text: &str) -> CalcValue {
    match text.trim().parse::<f64>() {
        Ok(v) => CalcValue::Number(v),
        Err(_) => CalcValue::Text(text.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_decode_registers() {
        let v = decode(RawValue::Words(vec![0xFFFE]), &DataType::Short, ByteOrder::ABCD, 0).unwrap();
        assert_eq!(v, NativeValue::I16(-2));

        let v = decode(
            RawValue::Words(vec![0x0000, 0x4248]),
            &DataType::Float,
            ByteOrder::CDAB,
            0,
        )
        .unwrap();
        assert_eq!(v, NativeValue::F32(50.0));

        let v = decode(
            RawValue::Words(vec![0x0001, 0x0000]),
            &DataType::UInt,
            ByteOrder::ABCD,
            0,
        )
        .unwrap();
        assert_eq!(v, NativeValue::U32(65536));
    }

    #[test]
    fn test_decode_short_response() {
        let err = decode(RawValue::Words(vec![1]), &DataType::Double, ByteOrder::ABCD, 0).unwrap_err();
        assert!(matches!(err, CollectError::ProtocolDefault(_)));
    }

    #[test]
    fn test_decode_scalar_and_text() {
        assert_eq!(
            decode(RawValue::Scalar(42.0), &DataType::UShort, ByteOrder::ABCD, 0).unwrap(),
            NativeValue::U16(42)
        );
        assert!(decode(RawValue::Scalar(-1.0), &DataType::UShort, ByteOrder::ABCD, 0).is_err());
        assert_eq!(
            decode(RawValue::Text("on".into()), &DataType::Bool, ByteOrder::ABCD, 0).unwrap(),
            NativeValue::Bool(true)
        );
        assert_eq!(
            decode(
                RawValue::Words(vec![0x4142, 0x4300]),
                &DataType::String,
                ByteOrder::ABCD,
                4
            )
            .unwrap(),
            NativeValue::Text("ABC".into())
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = decode(
            RawValue::Scalar(1.0),
            &DataType::Unknown("bcd".into()),
            ByteOrder::ABCD,
            0,
        )
        .unwrap_err();
        assert_eq!(err, CollectError::UnsupportedDataType("bcd".into()));
    }

    #[test]
    fn test_parse_native() {
        assert_eq!(
            parse_native(&DataType::Short, &CalcValue::Number(-5.0)),
            Some(NativeValue::I16(-5))
        );
        assert_eq!(parse_native(&DataType::UShort, &CalcValue::Number(-5.0)), None);
        assert_eq!(parse_native(&DataType::UShort, &CalcValue::Number(1.5)), None);
        assert_eq!(parse_native(&DataType::Int, &"abc".into()), None);
        assert_eq!(
            parse_native(&DataType::Bool, &"off".into()),
            Some(NativeValue::Bool(false))
        );
        assert_eq!(parse_native(&DataType::Bool, &CalcValue::Number(2.0)), None);
        assert_eq!(
            parse_native(&DataType::Float, &"12.5".into()),
            Some(NativeValue::F32(12.5))
        );
    }

    #[test]
    fn test_encode_matches_decode() {
        let value = NativeValue::F32(-12.25);
        for order in [ByteOrder::ABCD, ByteOrder::BADC, ByteOrder::CDAB, ByteOrder::DCBA] {
            let regs = value.to_registers(order);
            assert_eq!(regs.len(), 2);
            assert_eq!(
                decode(RawValue::Words(regs), &DataType::Float, order, 0).unwrap(),
                value
            );
        }
    }
}
