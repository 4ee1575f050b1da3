use {
    super::{
        TY_ARRAY, TY_BOOLEAN, TY_BYTE, TY_DOUBLE, TY_INT16, TY_INT32, TY_INT64, TY_OBJECT_PATH,
        TY_SIGNATURE, TY_STRING, TY_UINT16, TY_UINT32, TY_UINT64, TY_UNIX_FD, TY_VARIANT,
    },
    crate::dbus::{DbusError, DynamicType},
    std::{
        fmt::{Display, Formatter},
        ops::Deref,
    },
};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(s: impl Into<String>) -> Result<Self, DbusError> {
        let s = s.into();
        if !is_valid_object_path(&s) {
            return Err(DbusError::InvalidObjectPath(s));
        }
        Ok(Self(s))
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

fn is_valid_object_path(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('/') else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    rest.split('/').all(|el| {
        !el.is_empty()
            && el
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

impl Deref for ObjectPath {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A sequence of zero or more complete types.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn new(s: impl Into<String>) -> Result<Self, DbusError> {
        let s = s.into();
        let mut rem = s.as_bytes();
        while !rem.is_empty() {
            match DynamicType::from_signature(rem) {
                Ok((_, r)) => rem = r,
                Err(_) => return Err(DbusError::InvalidSignature(s)),
            }
        }
        Ok(Self(s))
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Deref for Signature {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A self-describing value as it travels over the bus.
#[derive(Clone, Debug, PartialEq)]
pub enum Variant {
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    Variant(Box<Variant>),
    /// An index into the file descriptors attached to a message.
    Fd(u32),
    Array(DynamicType, Vec<Variant>),
    DictEntry(Box<Variant>, Box<Variant>),
    Struct(Vec<Variant>),
}

impl Variant {
    fn unexpected(&self, expected: &str) -> DbusError {
        DbusError::InvalidVariantType {
            expected: expected.to_string(),
            actual: self.signature(),
        }
    }

    pub fn into_string(self) -> Result<String, DbusError> {
        match self {
            Variant::String(s) => Ok(s),
            _ => Err(self.unexpected("s")),
        }
    }

    pub fn into_object_path(self) -> Result<ObjectPath, DbusError> {
        match self {
            Variant::ObjectPath(s) => Ok(s),
            _ => Err(self.unexpected("o")),
        }
    }

    pub fn into_u32(self) -> Result<u32, DbusError> {
        match self {
            Variant::U32(s) => Ok(s),
            _ => Err(self.unexpected("u")),
        }
    }

    pub fn into_struct(self) -> Result<Vec<Variant>, DbusError> {
        match self {
            Variant::Struct(f) => Ok(f),
            _ => Err(self.unexpected("(...)")),
        }
    }

    pub fn into_array(self) -> Result<Vec<Variant>, DbusError> {
        match self {
            Variant::Array(_, v) => Ok(v),
            _ => Err(self.unexpected("a...")),
        }
    }

    pub fn into_variant(self) -> Result<Variant, DbusError> {
        match self {
            Variant::Variant(v) => Ok(*v),
            _ => Err(self.unexpected("v")),
        }
    }

    /// Builds an array of strings.
    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items = items.into_iter().map(|s| Variant::String(s.into())).collect();
        Variant::Array(DynamicType::String, items)
    }

    /// Builds an `a{sv}` dictionary.
    pub fn vardict<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Variant)>,
        S: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(k, v)| {
                Variant::DictEntry(
                    Box::new(Variant::String(k.into())),
                    Box::new(Variant::Variant(Box::new(v))),
                )
            })
            .collect();
        let ty = DynamicType::DictEntry(
            Box::new(DynamicType::String),
            Box::new(DynamicType::Variant),
        );
        Variant::Array(ty, entries)
    }

    pub fn signature(&self) -> String {
        let mut sig = vec![];
        self.write_signature(&mut sig);
        String::from_utf8_lossy(&sig).into_owned()
    }

    pub fn write_signature(&self, w: &mut Vec<u8>) {
        let c = match self {
            Variant::U8(..) => TY_BYTE,
            Variant::Bool(..) => TY_BOOLEAN,
            Variant::I16(..) => TY_INT16,
            Variant::U16(..) => TY_UINT16,
            Variant::I32(..) => TY_INT32,
            Variant::U32(..) => TY_UINT32,
            Variant::I64(..) => TY_INT64,
            Variant::U64(..) => TY_UINT64,
            Variant::F64(..) => TY_DOUBLE,
            Variant::String(..) => TY_STRING,
            Variant::ObjectPath(..) => TY_OBJECT_PATH,
            Variant::Signature(..) => TY_SIGNATURE,
            Variant::Variant(..) => TY_VARIANT,
            Variant::Fd(..) => TY_UNIX_FD,
            Variant::Array(el, _) => {
                w.push(TY_ARRAY);
                el.write_signature(w);
                return;
            }
            Variant::DictEntry(k, v) => {
                w.push(b'{');
                k.write_signature(w);
                v.write_signature(w);
                w.push(b'}');
                return;
            }
            Variant::Struct(f) => {
                w.push(b'(');
                for f in f {
                    f.write_signature(w);
                }
                w.push(b')');
                return;
            }
        };
        w.push(c);
    }
}
