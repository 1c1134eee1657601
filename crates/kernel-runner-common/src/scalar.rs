//! Type-tagged scalar kernel arguments.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, RunnerError};

/// The element type of a scalar kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ScalarKind {
    /// Size in bytes of a value of this kind as passed to a kernel.
    pub fn byte_size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Parse `raw` into a value of this kind; `name` is only used for the error.
    pub fn parse(self, name: &str, raw: &str) -> Result<ScalarValue> {
        let trimmed = raw.trim();
        let err = || RunnerError::ScalarParse {
            name: name.to_string(),
            raw: raw.to_string(),
            kind: self,
        };
        let value = match self {
            Self::I8 => ScalarValue::I8(trimmed.parse().map_err(|_| err())?),
            Self::U8 => ScalarValue::U8(trimmed.parse().map_err(|_| err())?),
            Self::I16 => ScalarValue::I16(trimmed.parse().map_err(|_| err())?),
            Self::U16 => ScalarValue::U16(trimmed.parse().map_err(|_| err())?),
            Self::I32 => ScalarValue::I32(trimmed.parse().map_err(|_| err())?),
            Self::U32 => ScalarValue::U32(trimmed.parse().map_err(|_| err())?),
            Self::I64 => ScalarValue::I64(trimmed.parse().map_err(|_| err())?),
            Self::U64 => ScalarValue::U64(trimmed.parse().map_err(|_| err())?),
            Self::F32 => ScalarValue::F32(trimmed.parse().map_err(|_| err())?),
            Self::F64 => ScalarValue::F64(trimmed.parse().map_err(|_| err())?),
        };
        Ok(value)
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// A scalar argument value together with its kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ScalarValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Self::I8(_) => ScalarKind::I8,
            Self::U8(_) => ScalarKind::U8,
            Self::I16(_) => ScalarKind::I16,
            Self::U16(_) => ScalarKind::U16,
            Self::I32(_) => ScalarKind::I32,
            Self::U32(_) => ScalarKind::U32,
            Self::I64(_) => ScalarKind::I64,
            Self::U64(_) => ScalarKind::U64,
            Self::F32(_) => ScalarKind::F32,
            Self::F64(_) => ScalarKind::F64,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.kind().byte_size()
    }

    /// Retrieve the payload as `T`.
    ///
    /// Reading under a different tag is an error naming both kinds.
    pub fn get<T: ScalarType>(&self, name: &str) -> Result<T> {
        T::extract(self).ok_or_else(|| RunnerError::ScalarTypeMismatch {
            name: name.to_string(),
            expected: T::KIND,
            actual: self.kind(),
        })
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
        }
    }
}

/// Rust types that can be stored in a [`ScalarValue`].
pub trait ScalarType: Copy + Sized {
    const KIND: ScalarKind;
    fn extract(value: &ScalarValue) -> Option<Self>;
}

macro_rules! impl_scalar_type {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl ScalarType for $ty {
                const KIND: ScalarKind = ScalarKind::$variant;

                fn extract(value: &ScalarValue) -> Option<Self> {
                    match *value {
                        ScalarValue::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for ScalarValue {
                fn from(v: $ty) -> Self {
                    ScalarValue::$variant(v)
                }
            }
        )*
    };
}

impl_scalar_type! {
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_each_kind() {
        assert_eq!(ScalarKind::I32.parse("n", " -12 ").unwrap(), ScalarValue::I32(-12));
        assert_eq!(ScalarKind::U64.parse("n", "42").unwrap(), ScalarValue::U64(42));
        assert_eq!(ScalarKind::F32.parse("a", "2.5").unwrap(), ScalarValue::F32(2.5));
        assert_eq!(ScalarKind::U8.parse("b", "255").unwrap(), ScalarValue::U8(255));
    }

    #[test]
    fn parse_failure_names_parameter() {
        let err = ScalarKind::U32.parse("length", "-1").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("length"));
        assert!(msg.contains("u32"));
    }

    #[test]
    fn get_with_matching_tag() {
        let v = ScalarValue::from(3.0f64);
        assert_eq!(v.get::<f64>("x").unwrap(), 3.0);
    }

    #[test]
    fn get_with_mismatched_tag_is_reported() {
        let v = ScalarValue::U32(7);
        match v.get::<i32>("count").unwrap_err() {
            RunnerError::ScalarTypeMismatch { name, expected, actual } => {
                assert_eq!(name, "count");
                assert_eq!(expected, ScalarKind::I32);
                assert_eq!(actual, ScalarKind::U32);
            }
            other => panic!("expected ScalarTypeMismatch, got: {other}"),
        }
    }

    #[test]
    fn byte_sizes_match_payload() {
        for (v, size) in [
            (ScalarValue::I8(1), 1),
            (ScalarValue::U16(1), 2),
            (ScalarValue::F32(1.0), 4),
            (ScalarValue::I64(1), 8),
        ] {
            assert_eq!(v.byte_size(), size);
        }
    }
}
