use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use uint::construct_uint;

construct_uint! {
    /// 256-bit unsigned integer for raw on-chain amounts and accumulator math
    pub struct U256(4);
}

/// Largest mantissa a `Decimal` can hold (2^96 - 1).
const MAX_DECIMAL_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

/// Largest scale `Decimal` supports.
const MAX_DECIMAL_SCALE: u32 = 28;

/// 10^n as Decimal; `None` beyond Decimal range.
pub fn pow10(n: u32) -> Option<Decimal> {
    let mut out = Decimal::ONE;
    for _ in 0..n {
        out = out.checked_mul(Decimal::TEN)?;
    }
    Some(out)
}

/// 10^n as U256.
pub fn pow10_u256(n: u32) -> U256 {
    U256::exp10(n as usize)
}

// Raw integer -> human amount. Very large mantissas lose their lowest digits.
pub fn u256_to_decimal(value: U256, decimals: u32) -> Result<Decimal, ConversionError> {
    if decimals > MAX_DECIMAL_SCALE {
        return Err(ConversionError::ScaleTooLarge(decimals));
    }
    let max = U256::from(MAX_DECIMAL_MANTISSA);
    let mut mantissa = value;
    let mut scale = decimals;
    let mut shift = 0u32;
    while mantissa > max {
        mantissa = mantissa / U256::from(10u8);
        if scale > 0 {
            scale -= 1;
        } else {
            shift += 1;
        }
    }
    let mut out = Decimal::from_i128_with_scale(mantissa.low_u128() as i128, scale);
    for _ in 0..shift {
        out = out.checked_mul(Decimal::TEN).ok_or(ConversionError::Overflow)?;
    }
    Ok(out)
}

/// Parse a raw base-10 integer string (indexers send nats as strings).
pub fn parse_u256(raw: &str) -> Result<U256, ConversionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConversionError::InvalidInteger(raw.to_string()));
    }
    U256::from_dec_str(trimmed).map_err(|_| ConversionError::InvalidInteger(raw.to_string()))
}

/// Normalize a raw integer string into a human amount using token decimals.
pub fn normalize_amount(raw: &str, decimals: u32) -> Result<Decimal, ConversionError> {
    u256_to_decimal(parse_u256(raw)?, decimals)
}

/// Read a JSON string or number as a raw integer.
pub fn json_u256(value: &Value) -> Result<U256, ConversionError> {
    match value {
        Value::String(s) => parse_u256(s),
        Value::Number(n) => parse_u256(&n.to_string()),
        other => Err(ConversionError::InvalidInteger(other.to_string())),
    }
}

/// Read a JSON string or number as a Decimal (prices arrive as floats or strings).
pub fn json_decimal(value: &Value) -> Result<Decimal, ConversionError> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => return Err(ConversionError::InvalidDecimal(other.to_string())),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| ConversionError::InvalidDecimal(format!("{}: {}", text, e)))
}

/// Read a JSON string or number as a small integer (token ids, decimals).
pub fn json_u64(value: &Value) -> Result<u64, ConversionError> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| ConversionError::InvalidInteger(s.clone())),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ConversionError::InvalidInteger(n.to_string())),
        other => Err(ConversionError::InvalidInteger(other.to_string())),
    }
}

/// Serde adapter for U256 fields encoded as decimal strings (or plain numbers).
pub mod u256_string {
    use super::{json_u256, U256};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        json_u256(&raw).map_err(D::Error::custom)
    }
}

/// Serde adapter for u64 fields that indexers send as strings.
pub mod u64_string {
    use super::json_u64;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        json_u64(&raw).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),
    #[error("Invalid integer: {0}")]
    InvalidInteger(String),
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Scale too large: {0}")]
    ScaleTooLarge(u32),
}
