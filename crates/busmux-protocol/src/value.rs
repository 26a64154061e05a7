//! Register values and their four wire representations.

use std::fmt;

use bytes::BufMut;

/// Register number. Devices expose up to 2^32 of them.
pub type Register = u32;

/// Which representation a value travels in.
///
/// The discriminant is the representation index used by the subframe type
/// tags: each tag group lists int8, int16, int32, float in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Int8 = 0,
    Int16 = 1,
    Int32 = 2,
    Float = 3,
}

impl ValueKind {
    pub const ALL: [ValueKind; 4] = [
        ValueKind::Int8,
        ValueKind::Int16,
        ValueKind::Int32,
        ValueKind::Float,
    ];

    /// Representation index, 0..=3.
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    /// Encoded size in bytes.
    pub fn size(self) -> usize {
        match self {
            ValueKind::Int8 => 1,
            ValueKind::Int16 => 2,
            ValueKind::Int32 | ValueKind::Float => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Int8 => "int8",
            ValueKind::Int16 => "int16",
            ValueKind::Int32 => "int32",
            ValueKind::Float => "float",
        }
    }

    /// Parse a textual value of this kind.
    pub fn parse_value(self, text: &str) -> Option<Value> {
        let text = text.trim();
        Some(match self {
            ValueKind::Int8 => Value::Int8(text.parse().ok()?),
            ValueKind::Int16 => Value::Int16(text.parse().ok()?),
            ValueKind::Int32 => Value::Int32(text.parse().ok()?),
            ValueKind::Float => Value::Float(text.parse().ok()?),
        })
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A register value in one of its representations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Float(f32),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int8(_) => ValueKind::Int8,
            Value::Int16(_) => ValueKind::Int16,
            Value::Int32(_) => ValueKind::Int32,
            Value::Float(_) => ValueKind::Float,
        }
    }

    /// Append the little-endian encoding.
    pub fn encode(&self, dst: &mut impl BufMut) {
        match *self {
            Value::Int8(v) => dst.put_i8(v),
            Value::Int16(v) => dst.put_i16_le(v),
            Value::Int32(v) => dst.put_i32_le(v),
            Value::Float(v) => dst.put_f32_le(v),
        }
    }

    /// Decode one value of `kind` from the front of `src`.
    ///
    /// Returns `None` when `src` is too short.
    pub fn decode(kind: ValueKind, src: &[u8]) -> Option<Value> {
        let bytes = src.get(..kind.size())?;
        Some(match kind {
            ValueKind::Int8 => Value::Int8(bytes[0] as i8),
            ValueKind::Int16 => Value::Int16(i16::from_le_bytes([bytes[0], bytes[1]])),
            ValueKind::Int32 => {
                Value::Int32(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            ValueKind::Float => {
                Value::Float(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
        })
    }

    /// Convert to another representation.
    ///
    /// Integers saturate at the target's range; floats truncate toward zero
    /// (NaN becomes 0).
    pub fn to_kind(self, kind: ValueKind) -> Value {
        match kind {
            ValueKind::Int8 => Value::Int8(self.as_i64().clamp(i8::MIN.into(), i8::MAX.into()) as i8),
            ValueKind::Int16 => {
                Value::Int16(self.as_i64().clamp(i16::MIN.into(), i16::MAX.into()) as i16)
            }
            ValueKind::Int32 => {
                Value::Int32(self.as_i64().clamp(i32::MIN.into(), i32::MAX.into()) as i32)
            }
            ValueKind::Float => Value::Float(self.as_f32()),
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Value::Int8(v) => v.into(),
            Value::Int16(v) => v.into(),
            Value::Int32(v) => v.into(),
            // `as` saturates and maps NaN to 0.
            Value::Float(v) => v as i64,
        }
    }

    fn as_f32(self) -> f32 {
        match self {
            Value::Int8(v) => v.into(),
            Value::Int16(v) => v.into(),
            Value::Int32(v) => v as f32,
            Value::Float(v) => v,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Int8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}
