//! Maps single-character wire type tags to native values.
//!
//! Every basic type has a [`TypeInfo`] that knows how to move values between
//! their wire and native representations and how to describe them as a
//! property. Tags without an entry, including all container types, are
//! passed through unchanged as [`Value::Opaque`].

use {
    crate::dbus::{DbusError, ObjectPath, Signature, Variant},
    std::fmt::{Display, Formatter},
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NativeType {
    Bool,
    Int,
    Float,
    Str,
    Opaque,
}

/// A native value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Opaque(Variant),
}

impl Value {
    pub fn native_type(&self) -> NativeType {
        match self {
            Value::Bool(_) => NativeType::Bool,
            Value::Int(_) => NativeType::Int,
            Value::Float(_) => NativeType::Float,
            Value::Str(_) => NativeType::Str,
            Value::Opaque(_) => NativeType::Opaque,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Opaque(v) => write!(f, "<{}>", v.signature()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident,)*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    u8 => Int,
    i16 => Int,
    u16 => Int,
    i32 => Int,
    u32 => Int,
    i64 => Int,
    u64 => Int,
    f64 => Float,
    &str => Str,
    String => Str,
    Variant => Opaque,
}

/// The value constraints a property of a given type advertises.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ValueSpec {
    None,
    Bool { default: bool },
    Int { min: i128, max: i128, default: i128 },
    Float { min: f64, max: f64, default: f64 },
}

impl ValueSpec {
    pub fn default_value(&self) -> Option<Value> {
        match *self {
            ValueSpec::None => None,
            ValueSpec::Bool { default } => Some(Value::Bool(default)),
            ValueSpec::Int { default, .. } => Some(Value::Int(default)),
            ValueSpec::Float { default, .. } => Some(Value::Float(default)),
        }
    }

    /// Rejects numbers outside of the advertised range.
    pub fn check(&self, tag: &str, value: &Value) -> Result<(), DbusError> {
        let in_range = match (*self, value) {
            (ValueSpec::Int { min, max, .. }, Value::Int(n)) => (min..=max).contains(n),
            (ValueSpec::Float { min, max, .. }, Value::Float(n)) => (min..=max).contains(n),
            _ => true,
        };
        match in_range {
            true => Ok(()),
            false => Err(DbusError::ValueOutOfRange {
                tag: tag.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

impl Display for ValueSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSpec::None => Ok(()),
            ValueSpec::Bool { default } => write!(f, "default {}", default),
            ValueSpec::Int { min, max, default } => {
                write!(f, "range {}..={}, default {}", min, max, default)
            }
            ValueSpec::Float { min, max, default } => {
                write!(f, "range {:e}..={:e}, default {}", min, max, default)
            }
        }
    }
}

pub struct TypeInfo {
    /// The wire tag, or `None` for the pass-through entry.
    pub tag: Option<char>,
    pub native: NativeType,
    pub spec: ValueSpec,
    decode: fn(&Variant) -> Result<Value, DbusError>,
    encode: fn(&Value) -> Result<Variant, DbusError>,
}

impl TypeInfo {
    pub fn decode(&self, v: &Variant) -> Result<Value, DbusError> {
        (self.decode)(v)
    }

    pub fn encode(&self, v: &Value) -> Result<Variant, DbusError> {
        (self.encode)(v)
    }

    pub fn is_opaque(&self) -> bool {
        self.tag.is_none()
    }
}

fn invalid_variant(v: &Variant, expected: char) -> DbusError {
    DbusError::InvalidVariantType {
        expected: expected.to_string(),
        actual: v.signature(),
    }
}

fn invalid_value(v: &Value, tag: char, expected: NativeType) -> DbusError {
    DbusError::InvalidValueType {
        tag: tag.to_string(),
        expected,
        actual: v.native_type(),
    }
}

macro_rules! int_type {
    ($name:ident, $module:ident, $tag:expr, $variant:ident, $ty:ty) => {
        mod $module {
            use super::*;

            pub(super) fn decode(v: &Variant) -> Result<Value, DbusError> {
                match v {
                    Variant::$variant(n) => Ok(Value::Int(i128::from(*n))),
                    _ => Err(invalid_variant(v, $tag)),
                }
            }

            pub(super) fn encode(v: &Value) -> Result<Variant, DbusError> {
                let Value::Int(n) = v else {
                    return Err(invalid_value(v, $tag, NativeType::Int));
                };
                match <$ty>::try_from(*n) {
                    Ok(n) => Ok(Variant::$variant(n)),
                    Err(_) => Err(DbusError::ValueOutOfRange {
                        tag: $tag.to_string(),
                        value: n.to_string(),
                    }),
                }
            }
        }

        static $name: TypeInfo = TypeInfo {
            tag: Some($tag),
            native: NativeType::Int,
            spec: ValueSpec::Int {
                min: <$ty>::MIN as i128,
                max: <$ty>::MAX as i128,
                default: 0,
            },
            decode: $module::decode,
            encode: $module::encode,
        };
    };
}

int_type!(BYTE, byte, 'y', U8, u8);
int_type!(INT16, int16, 'n', I16, i16);
int_type!(UINT16, uint16, 'q', U16, u16);
int_type!(INT32, int32, 'i', I32, i32);
int_type!(UINT32, uint32, 'u', U32, u32);
int_type!(INT64, int64, 'x', I64, i64);
int_type!(UINT64, uint64, 't', U64, u64);

static BOOLEAN: TypeInfo = TypeInfo {
    tag: Some('b'),
    native: NativeType::Bool,
    spec: ValueSpec::Bool { default: false },
    decode: |v| match v {
        Variant::Bool(b) => Ok(Value::Bool(*b)),
        _ => Err(invalid_variant(v, 'b')),
    },
    encode: |v| match v {
        Value::Bool(b) => Ok(Variant::Bool(*b)),
        _ => Err(invalid_value(v, 'b', NativeType::Bool)),
    },
};

static DOUBLE: TypeInfo = TypeInfo {
    tag: Some('d'),
    native: NativeType::Float,
    spec: ValueSpec::Float {
        min: f64::MIN,
        max: f64::MAX,
        default: 0.0,
    },
    decode: |v| match v {
        Variant::F64(n) => Ok(Value::Float(*n)),
        _ => Err(invalid_variant(v, 'd')),
    },
    encode: |v| match v {
        Value::Float(n) => Ok(Variant::F64(*n)),
        Value::Int(n) => {
            let f = *n as f64;
            // The cast back saturates, so i128::MAX would compare equal.
            match f as i128 == *n && *n != i128::MAX {
                true => Ok(Variant::F64(f)),
                false => Err(DbusError::ValueOutOfRange {
                    tag: "d".to_string(),
                    value: n.to_string(),
                }),
            }
        }
        _ => Err(invalid_value(v, 'd', NativeType::Float)),
    },
};

static STRING: TypeInfo = TypeInfo {
    tag: Some('s'),
    native: NativeType::Str,
    spec: ValueSpec::None,
    decode: |v| match v {
        Variant::String(s) => Ok(Value::Str(s.clone())),
        _ => Err(invalid_variant(v, 's')),
    },
    encode: |v| match v {
        Value::Str(s) => Ok(Variant::String(s.clone())),
        _ => Err(invalid_value(v, 's', NativeType::Str)),
    },
};

static OBJECT_PATH: TypeInfo = TypeInfo {
    tag: Some('o'),
    native: NativeType::Str,
    spec: ValueSpec::None,
    decode: |v| match v {
        Variant::ObjectPath(s) => Ok(Value::Str(s.to_string())),
        _ => Err(invalid_variant(v, 'o')),
    },
    encode: |v| match v {
        Value::Str(s) => ObjectPath::new(s.as_str()).map(Variant::ObjectPath),
        _ => Err(invalid_value(v, 'o', NativeType::Str)),
    },
};

static SIGNATURE: TypeInfo = TypeInfo {
    tag: Some('g'),
    native: NativeType::Str,
    spec: ValueSpec::None,
    decode: |v| match v {
        Variant::Signature(s) => Ok(Value::Str(s.to_string())),
        _ => Err(invalid_variant(v, 'g')),
    },
    encode: |v| match v {
        Value::Str(s) => Signature::new(s.as_str()).map(Variant::Signature),
        _ => Err(invalid_value(v, 'g', NativeType::Str)),
    },
};

static VARIANT: TypeInfo = TypeInfo {
    tag: Some('v'),
    native: NativeType::Opaque,
    spec: ValueSpec::None,
    decode: |v| match v {
        Variant::Variant(inner) => Ok(Value::Opaque((**inner).clone())),
        _ => Err(invalid_variant(v, 'v')),
    },
    encode: |v| match v {
        Value::Opaque(inner) => Ok(Variant::Variant(Box::new(inner.clone()))),
        _ => Err(invalid_value(v, 'v', NativeType::Opaque)),
    },
};

static OPAQUE: TypeInfo = TypeInfo {
    tag: None,
    native: NativeType::Opaque,
    spec: ValueSpec::None,
    decode: |v| Ok(Value::Opaque(v.clone())),
    encode: |v| match v {
        Value::Opaque(v) => Ok(v.clone()),
        _ => Err(DbusError::InvalidValueType {
            tag: String::new(),
            expected: NativeType::Opaque,
            actual: v.native_type(),
        }),
    },
};

/// Returns the entry for a type signature. Signatures that are not a single
/// basic type map to the pass-through entry.
pub fn info_for(signature: &str) -> &'static TypeInfo {
    match signature {
        "b" => &BOOLEAN,
        "y" => &BYTE,
        "n" => &INT16,
        "q" => &UINT16,
        "i" => &INT32,
        "u" => &UINT32,
        "x" => &INT64,
        "t" => &UINT64,
        "d" => &DOUBLE,
        "s" => &STRING,
        "o" => &OBJECT_PATH,
        "g" => &SIGNATURE,
        "v" => &VARIANT,
        _ => &OPAQUE,
    }
}

pub fn decode(signature: &str, v: &Variant) -> Result<Value, DbusError> {
    info_for(signature).decode(v)
}

pub fn encode(signature: &str, v: &Value) -> Result<Variant, DbusError> {
    info_for(signature).encode(v)
}

/// Converts a value using its own type.
pub fn unpack(v: &Variant) -> Value {
    decode(&v.signature(), v).unwrap_or_else(|_| Value::Opaque(v.clone()))
}
