//! Value codecs: typed value <-> register bytes <-> display string
//!
//! A [`Codec`] is an immutable descriptor built from a [`CodecSpec`]. It turns a
//! [`Value`] into the bytes a Block stores (in the configured endianness) and
//! back, and parses/prints the display form used by `get_disp`/`set_disp` and by
//! configuration export.
//!
//! Codecs are shared through [`intern`], a plain memoization table keyed by the
//! spec, so thousands of identically typed registers share one instance.
//!
//! # Display formats
//!
//! | Kind            | Display                  | Accepted input                       |
//! |-----------------|--------------------------|--------------------------------------|
//! | unsigned int    | `0x1f`                   | `0x..`, `0o..`, `0b..`, decimal      |
//! | signed int      | `-3`                     | same, sign bit re-applied at width   |
//! | bool            | `True` / `False`         | case-insensitive `true` / `false`    |
//! | float / double  | shortest round-trip form | decimal, `inf`, `NaN`                |
//! | string          | verbatim                 | verbatim                             |

use crate::error::{RegError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Largest integer width a codec can carry
pub const MAX_INT_BITS: usize = 128;

/// Kind of value a codec converts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecKind {
    Int,
    Bool,
    String,
    Float,
    Double,
}

/// Byte order of a value inside the register space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Character encoding for string codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// One byte per character, code points 0..=255
    Latin1,
}

/// A typed register value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UInt(u128),
    Int(i128),
    Bool(bool),
    Str(String),
    Float(f64),
    List(Vec<Value>),
}

impl Value {
    /// Integer view of the value, if it has one
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::UInt(v) => i128::try_from(*v).ok(),
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(i128::from(*b)),
            _ => None,
        }
    }

    /// Unsigned view of the value, if it has one
    pub fn as_u128(&self) -> Option<u128> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u128::try_from(*v).ok(),
            Value::Bool(b) => Some(u128::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::UInt(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u128::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(u128::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i128::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(i128::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Parameters that fully determine a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecSpec {
    pub kind: CodecKind,
    /// Value width in bits (for strings: the field width)
    pub bit_width: usize,
    pub signed: bool,
    pub endian: Endian,
    pub encoding: Encoding,
}

impl CodecSpec {
    fn new(kind: CodecKind, bit_width: usize, signed: bool) -> Self {
        Self {
            kind,
            bit_width,
            signed,
            endian: Endian::Little,
            encoding: Encoding::Utf8,
        }
    }

    pub fn uint(bit_width: usize) -> Self {
        Self::new(CodecKind::Int, bit_width, false)
    }

    pub fn int(bit_width: usize) -> Self {
        Self::new(CodecKind::Int, bit_width, true)
    }

    pub fn boolean() -> Self {
        Self::new(CodecKind::Bool, 1, false)
    }

    /// String stored in a field of `bytes` bytes
    pub fn string(bytes: usize) -> Self {
        Self::new(CodecKind::String, bytes * 8, false)
    }

    pub fn float() -> Self {
        Self::new(CodecKind::Float, 32, true)
    }

    pub fn double() -> Self {
        Self::new(CodecKind::Double, 64, true)
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn big_endian(self) -> Self {
        self.with_endian(Endian::Big)
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// Stateless converter between [`Value`]s, bytes and display strings
#[derive(Debug, PartialEq, Eq)]
pub struct Codec {
    spec: CodecSpec,
}

impl Codec {
    /// Validate a spec and build a codec for it
    ///
    /// Prefer [`intern`] which shares instances.
    pub fn new(spec: CodecSpec) -> Result<Self> {
        let ok = match spec.kind {
            CodecKind::Int => (1..=MAX_INT_BITS).contains(&spec.bit_width),
            CodecKind::Bool => (1..=8).contains(&spec.bit_width),
            CodecKind::String => spec.bit_width > 0 && spec.bit_width % 8 == 0,
            CodecKind::Float => spec.bit_width == 32,
            CodecKind::Double => spec.bit_width == 64,
        };
        if !ok {
            return Err(RegError::Config(format!(
                "unsupported width {} for {:?} codec",
                spec.bit_width, spec.kind
            )));
        }
        Ok(Self { spec })
    }

    pub fn spec(&self) -> CodecSpec {
        self.spec
    }

    pub fn kind(&self) -> CodecKind {
        self.spec.kind
    }

    pub fn bit_width(&self) -> usize {
        self.spec.bit_width
    }

    pub fn is_signed(&self) -> bool {
        self.spec.signed
    }

    pub fn endian(&self) -> Endian {
        self.spec.endian
    }

    /// Number of bytes `to_bytes` produces for a scalar
    pub fn byte_len(&self) -> usize {
        match self.spec.kind {
            CodecKind::Bool => 1,
            _ => self.spec.bit_width.div_ceil(8),
        }
    }

    fn int_mask(&self) -> u128 {
        if self.spec.bit_width >= MAX_INT_BITS {
            u128::MAX
        } else {
            (1u128 << self.spec.bit_width) - 1
        }
    }

    /// Order little-endian bytes according to the configured endianness
    fn order(&self, mut bytes: Vec<u8>) -> Vec<u8> {
        if self.spec.endian == Endian::Big {
            bytes.reverse();
        }
        bytes
    }

    /// Encode a scalar value into register bytes
    pub fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        match self.spec.kind {
            CodecKind::Int => {
                let bits = self.int_bits(value)?;
                let n = self.byte_len();
                Ok(self.order(bits.to_le_bytes()[..n].to_vec()))
            }
            CodecKind::Bool => {
                let b = match value {
                    Value::Bool(b) => *b,
                    Value::UInt(0) | Value::Int(0) => false,
                    Value::UInt(1) | Value::Int(1) => true,
                    other => {
                        return Err(RegError::Format(format!(
                            "expected bool, got {:?}",
                            other
                        )))
                    }
                };
                Ok(vec![u8::from(b)])
            }
            CodecKind::String => {
                let s = value.as_str().ok_or_else(|| {
                    RegError::Format(format!("expected string, got {:?}", value))
                })?;
                let mut bytes = match self.spec.encoding {
                    Encoding::Utf8 => s.as_bytes().to_vec(),
                    Encoding::Latin1 => s
                        .chars()
                        .map(|c| {
                            u8::try_from(u32::from(c)).map_err(|_| {
                                RegError::Format(format!("'{}' is not representable in Latin-1", c))
                            })
                        })
                        .collect::<Result<Vec<u8>>>()?,
                };
                if bytes.contains(&0) {
                    return Err(RegError::Format(format!("{:?} contains a NUL byte", s)));
                }
                // The terminator is dropped when the text fills the field exactly
                let capacity = self.byte_len();
                if bytes.len() > capacity {
                    return Err(RegError::Format(format!(
                        "{:?} needs {} bytes, field holds {}",
                        s,
                        bytes.len(),
                        capacity
                    )));
                }
                if bytes.len() < capacity {
                    bytes.push(0);
                }
                Ok(bytes)
            }
            CodecKind::Float => {
                let wide = self.float_value(value)?;
                let v = wide as f32;
                if wide.is_finite() && !v.is_finite() {
                    return Err(RegError::Format(format!("{} is out of range for float", wide)));
                }
                Ok(self.order(v.to_le_bytes().to_vec()))
            }
            CodecKind::Double => {
                let v = self.float_value(value)?;
                Ok(self.order(v.to_le_bytes().to_vec()))
            }
        }
    }

    fn float_value(&self, value: &Value) -> Result<f64> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::UInt(v) => Ok(*v as f64),
            Value::Int(v) => Ok(*v as f64),
            other => Err(RegError::Format(format!("expected float, got {:?}", other))),
        }
    }

    /// Two's-complement bit pattern of an integer value at this codec's width
    fn int_bits(&self, value: &Value) -> Result<u128> {
        let width = self.spec.bit_width;
        let bits = match value {
            Value::UInt(v) => {
                let max = if self.spec.signed {
                    self.int_mask() >> 1
                } else {
                    self.int_mask()
                };
                if *v > max {
                    return Err(RegError::Format(format!(
                        "{} does not fit in {} bits",
                        v, width
                    )));
                }
                *v
            }
            Value::Int(v) => {
                let fits = if self.spec.signed {
                    if width >= MAX_INT_BITS {
                        true
                    } else {
                        let half = 1i128 << (width - 1);
                        (-half..half).contains(v)
                    }
                } else {
                    *v >= 0 && (*v as u128) <= self.int_mask()
                };
                if !fits {
                    return Err(RegError::Format(format!(
                        "{} does not fit in {} bits",
                        v, width
                    )));
                }
                (*v as u128) & self.int_mask()
            }
            Value::Bool(b) => u128::from(*b),
            other => {
                return Err(RegError::Format(format!(
                    "expected integer, got {:?}",
                    other
                )))
            }
        };
        Ok(bits)
    }

    /// Decode register bytes into a scalar value
    ///
    /// Short input is zero-extended; extra bytes are ignored.
    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Value> {
        match self.spec.kind {
            CodecKind::Int => {
                let mut le = self.le_bytes(bytes, self.byte_len());
                le.resize(16, 0);
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&le);
                let bits = u128::from_le_bytes(raw) & self.int_mask();
                Ok(self.int_from_bits(bits))
            }
            CodecKind::Bool => Ok(Value::Bool(bytes.first().is_some_and(|b| *b != 0))),
            CodecKind::String => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                let raw = &bytes[..end];
                let s = match self.spec.encoding {
                    Encoding::Utf8 => String::from_utf8_lossy(raw).into_owned(),
                    Encoding::Latin1 => raw.iter().map(|b| char::from(*b)).collect(),
                };
                Ok(Value::Str(s))
            }
            CodecKind::Float => {
                let le = self.le_bytes(bytes, 4);
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&le);
                Ok(Value::Float(f64::from(f32::from_le_bytes(raw))))
            }
            CodecKind::Double => {
                let le = self.le_bytes(bytes, 8);
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&le);
                Ok(Value::Float(f64::from_le_bytes(raw)))
            }
        }
    }

    /// First `n` bytes of `bytes` (zero padded) in little-endian order
    fn le_bytes(&self, bytes: &[u8], n: usize) -> Vec<u8> {
        let mut buf: Vec<u8> = bytes.iter().copied().take(n).collect();
        buf.resize(n, 0);
        if self.spec.endian == Endian::Big {
            buf.reverse();
        }
        buf
    }

    fn int_from_bits(&self, bits: u128) -> Value {
        let width = self.spec.bit_width;
        if !self.spec.signed {
            return Value::UInt(bits);
        }
        if width >= MAX_INT_BITS {
            return Value::Int(bits as i128);
        }
        if bits & (1u128 << (width - 1)) != 0 {
            Value::Int(bits as i128 - (1i128 << width))
        } else {
            Value::Int(bits as i128)
        }
    }

    /// Parse a display string into a value
    pub fn from_display(&self, text: &str) -> Result<Value> {
        let text = text.trim();
        match self.spec.kind {
            CodecKind::Int => self.parse_int(text),
            CodecKind::Bool => {
                if text.eq_ignore_ascii_case("true") {
                    Ok(Value::Bool(true))
                } else if text.eq_ignore_ascii_case("false") {
                    Ok(Value::Bool(false))
                } else {
                    Err(RegError::Format(format!("'{}' is not a bool", text)))
                }
            }
            CodecKind::String => Ok(Value::Str(text.to_string())),
            CodecKind::Float => text
                .parse::<f32>()
                .map(|v| Value::Float(f64::from(v)))
                .map_err(|e| RegError::Format(format!("'{}' is not a float: {}", text, e))),
            CodecKind::Double => text
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| RegError::Format(format!("'{}' is not a float: {}", text, e))),
        }
    }

    fn parse_int(&self, text: &str) -> Result<Value> {
        let bad = |why: &str| RegError::Format(format!("'{}' is not an integer: {}", text, why));

        let (negative, body) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let lower = body.to_ascii_lowercase();
        let (radix, digits) = if let Some(d) = lower.strip_prefix("0x") {
            (16, d)
        } else if let Some(d) = lower.strip_prefix("0b") {
            (2, d)
        } else if let Some(d) = lower.strip_prefix("0o") {
            (8, d)
        } else {
            (10, lower.as_str())
        };
        let digits: String = digits.chars().filter(|c| *c != '_').collect();
        if digits.is_empty() {
            return Err(bad("no digits"));
        }
        let magnitude = u128::from_str_radix(&digits, radix).map_err(|e| bad(&e.to_string()))?;

        if negative {
            if !self.spec.signed {
                return Err(bad("negative value for unsigned register"));
            }
            let value = i128::try_from(magnitude)
                .map(|m| -m)
                .or_else(|_| {
                    if magnitude == 1u128 << 127 {
                        Ok(i128::MIN)
                    } else {
                        Err(bad("out of range"))
                    }
                })?;
            // Range check at the codec width
            self.int_bits(&Value::Int(value))?;
            return Ok(Value::Int(value));
        }

        if magnitude > self.int_mask() {
            return Err(bad(&format!("does not fit in {} bits", self.spec.bit_width)));
        }
        Ok(self.int_from_bits(magnitude))
    }

    /// Default display string for a value
    pub fn to_display(&self, value: &Value) -> String {
        match (self.spec.kind, value) {
            (_, Value::Bool(true)) => "True".to_string(),
            (_, Value::Bool(false)) => "False".to_string(),
            (CodecKind::Float, Value::Float(v)) => format!("{}", *v as f32),
            (_, Value::UInt(v)) => format!("{:#x}", v),
            (_, Value::Int(v)) => v.to_string(),
            (_, Value::Float(v)) => format!("{}", v),
            (_, Value::Str(s)) => s.clone(),
            (_, Value::List(items)) => {
                let parts: Vec<String> = items.iter().map(|v| self.to_display(v)).collect();
                format!("[{}]", parts.join(", "))
            }
        }
    }

    /// Zero value for this codec
    pub fn default_value(&self) -> Value {
        match self.spec.kind {
            CodecKind::Int if self.spec.signed => Value::Int(0),
            CodecKind::Int => Value::UInt(0),
            CodecKind::Bool => Value::Bool(false),
            CodecKind::String => Value::Str(String::new()),
            CodecKind::Float | CodecKind::Double => Value::Float(0.0),
        }
    }
}

fn cache() -> &'static Mutex<HashMap<CodecSpec, Arc<Codec>>> {
    static CACHE: OnceLock<Mutex<HashMap<CodecSpec, Arc<Codec>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Shared codec for a spec, built on first use
pub fn intern(spec: CodecSpec) -> Result<Arc<Codec>> {
    let mut cache = cache().lock();
    if let Some(codec) = cache.get(&spec) {
        return Ok(codec.clone());
    }
    let codec = Arc::new(Codec::new(spec)?);
    cache.insert(spec, codec.clone());
    Ok(codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(spec: CodecSpec) -> Arc<Codec> {
        intern(spec).unwrap()
    }

    fn round_trip(c: &Codec, v: Value) {
        let bytes = c.to_bytes(&v).unwrap();
        assert_eq!(c.from_bytes(&bytes).unwrap(), v, "bytes {:02X?}", bytes);
    }

    #[test]
    fn test_uint_little_and_big_endian() {
        let le = codec(CodecSpec::uint(32));
        assert_eq!(
            le.to_bytes(&Value::UInt(0x1234_ABCD)).unwrap(),
            vec![0xCD, 0xAB, 0x34, 0x12]
        );
        let be = codec(CodecSpec::uint(32).big_endian());
        assert_eq!(
            be.to_bytes(&Value::UInt(0x1234_ABCD)).unwrap(),
            vec![0x12, 0x34, 0xAB, 0xCD]
        );
        assert_eq!(
            be.from_bytes(&[0x12, 0x34, 0xAB, 0xCD]).unwrap(),
            Value::UInt(0x1234_ABCD)
        );
    }

    #[test]
    fn test_int_boundaries() {
        let c = codec(CodecSpec::int(12));
        for v in [0i128, 1, -1, 2047, -2048] {
            round_trip(&c, Value::Int(v));
        }
        assert!(c.to_bytes(&Value::Int(2048)).is_err());
        assert!(c.to_bytes(&Value::Int(-2049)).is_err());
        assert_eq!(c.byte_len(), 2);
    }

    #[test]
    fn test_wide_integers() {
        let c = codec(CodecSpec::uint(128));
        round_trip(&c, Value::UInt(u128::MAX));
        let s = codec(CodecSpec::int(128));
        round_trip(&s, Value::Int(i128::MIN));
        round_trip(&s, Value::Int(i128::MAX));
        let odd = codec(CodecSpec::uint(72));
        round_trip(&odd, Value::UInt((1u128 << 72) - 1));
    }

    #[test]
    fn test_signed_display_parse_applies_twos_complement() {
        let c = codec(CodecSpec::int(8));
        assert_eq!(c.from_display("0xFF").unwrap(), Value::Int(-1));
        assert_eq!(c.from_display("0x7f").unwrap(), Value::Int(127));
        assert_eq!(c.from_display("-128").unwrap(), Value::Int(-128));
        assert_eq!(c.from_display("0b1000_0000").unwrap(), Value::Int(-128));
        assert!(c.from_display("0x100").is_err());
        assert!(c.from_display("-129").is_err());
    }

    #[test]
    fn test_unsigned_display() {
        let c = codec(CodecSpec::uint(16));
        assert_eq!(c.to_display(&Value::UInt(0xBEEF)), "0xbeef");
        assert_eq!(c.from_display("0xbeef").unwrap(), Value::UInt(0xBEEF));
        assert_eq!(c.from_display("48879").unwrap(), Value::UInt(0xBEEF));
        assert_eq!(c.from_display("0o17").unwrap(), Value::UInt(15));
        assert!(c.from_display("-1").is_err());
        assert!(c.from_display("0xZZ").is_err());
        assert!(c.from_display("").is_err());
    }

    #[test]
    fn test_bool_codec() {
        let c = codec(CodecSpec::boolean());
        assert_eq!(c.to_bytes(&Value::Bool(true)).unwrap(), vec![1]);
        round_trip(&c, Value::Bool(false));
        assert_eq!(c.from_display("TRUE").unwrap(), Value::Bool(true));
        assert_eq!(c.from_display("false").unwrap(), Value::Bool(false));
        assert!(c.from_display("yes").is_err());
        assert_eq!(c.to_display(&Value::Bool(true)), "True");
    }

    #[test]
    fn test_string_codec_nul_handling() {
        let c = codec(CodecSpec::string(16));
        assert_eq!(c.to_bytes(&Value::from("ab")).unwrap(), vec![b'a', b'b', 0]);
        assert_eq!(
            c.from_bytes(&[b'h', b'i', 0, 0, 0, 0]).unwrap(),
            Value::from("hi")
        );
        round_trip(&c, Value::from(""));
        round_trip(&c, Value::from("fifteen chars!!"));
    }

    #[test]
    fn test_string_length_checked_against_field() {
        let c = codec(CodecSpec::string(4));
        // Exactly filling the field drops the terminator
        assert_eq!(c.to_bytes(&Value::from("hell")).unwrap(), b"hell".to_vec());
        round_trip(&c, Value::from("hell"));
        assert_eq!(c.to_bytes(&Value::from("hel")).unwrap(), vec![b'h', b'e', b'l', 0]);

        assert!(matches!(c.to_bytes(&Value::from("hello")), Err(RegError::Format(_))));
        assert!(matches!(c.to_bytes(&Value::from("a\0b")), Err(RegError::Format(_))));
        // Multi-byte UTF-8 counts in bytes
        assert!(c.to_bytes(&Value::from("ééé")).is_err());
    }

    #[test]
    fn test_float_overflow_rejected() {
        let f = codec(CodecSpec::float());
        assert!(matches!(f.to_bytes(&Value::Float(1e39)), Err(RegError::Format(_))));
        assert!(f.to_bytes(&Value::Float(f64::INFINITY)).is_ok());
        assert!(f.to_bytes(&Value::Float(f64::NAN)).is_ok());
        assert!(codec(CodecSpec::double()).to_bytes(&Value::Float(1e39)).is_ok());
    }

    #[test]
    fn test_latin1_string() {
        let c = codec(CodecSpec::string(8).with_encoding(Encoding::Latin1));
        assert_eq!(c.to_bytes(&Value::from("é")).unwrap(), vec![0xE9, 0]);
        round_trip(&c, Value::from("café"));
        assert!(c.to_bytes(&Value::from("€")).is_err());
    }

    #[test]
    fn test_float_special_values() {
        let f = codec(CodecSpec::float());
        for v in [0.0f64, -0.0, 1.5, f64::from(f32::MIN_POSITIVE) / 2.0, f64::from(f32::MAX)] {
            round_trip(&f, Value::Float(v));
        }
        let neg_zero = f.from_bytes(&f.to_bytes(&Value::Float(-0.0)).unwrap()).unwrap();
        assert!(matches!(neg_zero, Value::Float(v) if v == 0.0 && v.is_sign_negative()));

        let d = codec(CodecSpec::double().big_endian());
        for v in [0.0f64, -0.0, 5e-324, f64::MAX, -2.5] {
            round_trip(&d, Value::Float(v));
        }
    }

    #[test]
    fn test_float_display_round_trip() {
        let f = codec(CodecSpec::float());
        let v = f.from_display("0.1").unwrap();
        assert_eq!(f.from_display(&f.to_display(&v)).unwrap(), v);
        let d = codec(CodecSpec::double());
        let v = Value::Float(1.0 / 3.0);
        assert_eq!(d.from_display(&d.to_display(&v)).unwrap(), v);
        assert!(d.from_display("1.2.3").is_err());
    }

    #[test]
    fn test_intern_shares_instances() {
        let a = intern(CodecSpec::uint(24)).unwrap();
        let b = intern(CodecSpec::uint(24)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = intern(CodecSpec::uint(24).big_endian()).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_invalid_specs_rejected() {
        assert!(Codec::new(CodecSpec::uint(0)).is_err());
        assert!(Codec::new(CodecSpec::uint(129)).is_err());
        assert!(Codec::new(CodecSpec {
            bit_width: 12,
            ..CodecSpec::string(1)
        })
        .is_err());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_uint_round_trip(width in 1usize..=128, raw in any::<u128>()) {
            let c = codec(CodecSpec::uint(width));
            let v = if width == 128 { raw } else { raw & ((1u128 << width) - 1) };
            let bytes = c.to_bytes(&Value::UInt(v)).unwrap();
            prop_assert_eq!(bytes.len(), width.div_ceil(8));
            prop_assert_eq!(c.from_bytes(&bytes).unwrap(), Value::UInt(v));
        }

        #[test]
        fn test_int_display_round_trip(width in 2usize..=64, raw in any::<i64>()) {
            let c = codec(CodecSpec::int(width));
            let half = 1i128 << (width - 1);
            let v = (i128::from(raw)).rem_euclid(2 * half) - half;
            let text = c.to_display(&Value::Int(v));
            prop_assert_eq!(c.from_display(&text).unwrap(), Value::Int(v));
        }

        #[test]
        fn test_double_round_trip(v in any::<f64>().prop_filter("not NaN", |v| !v.is_nan())) {
            let c = codec(CodecSpec::double());
            let bytes = c.to_bytes(&Value::Float(v)).unwrap();
            prop_assert_eq!(c.from_bytes(&bytes).unwrap(), Value::Float(v));
        }
    }
}
