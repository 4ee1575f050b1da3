use {
    super::{
        TY_ARRAY, TY_BOOLEAN, TY_BYTE, TY_DOUBLE, TY_INT16, TY_INT32, TY_INT64, TY_OBJECT_PATH,
        TY_SIGNATURE, TY_STRING, TY_UINT16, TY_UINT32, TY_UINT64, TY_UNIX_FD, TY_VARIANT,
    },
    crate::dbus::{DbusError, DynamicType, types::Variant},
};

const MAX_ARRAY_DEPTH: u32 = 32;
const MAX_STRUCT_DEPTH: u32 = 32;

#[derive(Copy, Clone, Default)]
struct Depth {
    array: u32,
    structs: u32,
}

impl Depth {
    fn array(self) -> Result<Self, DbusError> {
        if self.array >= MAX_ARRAY_DEPTH {
            return Err(DbusError::SignatureTooDeep);
        }
        Ok(Self {
            array: self.array + 1,
            ..self
        })
    }

    fn structs(self) -> Result<Self, DbusError> {
        if self.structs >= MAX_STRUCT_DEPTH {
            return Err(DbusError::SignatureTooDeep);
        }
        Ok(Self {
            structs: self.structs + 1,
            ..self
        })
    }
}

impl DynamicType {
    /// Parses the first complete type of `s` and returns the remainder.
    pub fn from_signature(s: &[u8]) -> Result<(DynamicType, &[u8]), DbusError> {
        Self::parse_complete(s, Depth::default())
    }

    fn parse_complete(s: &[u8], depth: Depth) -> Result<(DynamicType, &[u8]), DbusError> {
        let (ty, rem) = Self::parse(s, depth)?;
        if let DynamicType::DictEntry(..) = ty {
            return Err(DbusError::DictOutsideArray);
        }
        Ok((ty, rem))
    }

    /// Parses a signature that must consist of exactly one complete type.
    pub fn parse_single(s: &str) -> Result<DynamicType, DbusError> {
        let (ty, rem) = Self::from_signature(s.as_bytes())?;
        if !rem.is_empty() {
            return Err(DbusError::TrailingSignature);
        }
        Ok(ty)
    }

    fn parse(mut s: &[u8], depth: Depth) -> Result<(DynamicType, &[u8]), DbusError> {
        if s.is_empty() {
            return Err(DbusError::EmptySignature);
        }
        let first = s[0];
        s = &s[1..];
        let dp = match first {
            TY_BYTE => DynamicType::U8,
            TY_BOOLEAN => DynamicType::Bool,
            TY_INT16 => DynamicType::I16,
            TY_UINT16 => DynamicType::U16,
            TY_INT32 => DynamicType::I32,
            TY_UINT32 => DynamicType::U32,
            TY_INT64 => DynamicType::I64,
            TY_UINT64 => DynamicType::U64,
            TY_DOUBLE => DynamicType::F64,
            TY_STRING => DynamicType::String,
            TY_OBJECT_PATH => DynamicType::ObjectPath,
            TY_SIGNATURE => DynamicType::Signature,
            TY_VARIANT => DynamicType::Variant,
            TY_UNIX_FD => DynamicType::Fd,
            TY_ARRAY => {
                let (elty, rem) = Self::parse(s, depth.array()?)?;
                s = rem;
                DynamicType::Array(Box::new(elty))
            }
            b'{' => {
                let depth = depth.structs()?;
                let (keyty, rem) = Self::parse_complete(s, depth)?;
                let (valty, rem) = Self::parse_complete(rem, depth)?;
                if rem.is_empty() {
                    return Err(DbusError::UnterminatedDict);
                }
                if rem[0] != b'}' {
                    return Err(DbusError::DictTrailing);
                }
                s = &rem[1..];
                DynamicType::DictEntry(Box::new(keyty), Box::new(valty))
            }
            b'(' => {
                let depth = depth.structs()?;
                let mut fields = vec![];
                loop {
                    if s.is_empty() {
                        return Err(DbusError::UnterminatedStruct);
                    }
                    if s[0] == b')' {
                        s = &s[1..];
                        break DynamicType::Struct(fields);
                    }
                    let (fieldty, rem) = Self::parse_complete(s, depth)?;
                    s = rem;
                    fields.push(fieldty);
                }
            }
            _ => return Err(DbusError::UnknownType),
        };
        Ok((dp, s))
    }

    pub fn signature(&self) -> String {
        let mut sig = vec![];
        self.write_signature(&mut sig);
        String::from_utf8_lossy(&sig).into_owned()
    }

    pub fn write_signature(&self, w: &mut Vec<u8>) {
        let c = match self {
            DynamicType::U8 => TY_BYTE,
            DynamicType::Bool => TY_BOOLEAN,
            DynamicType::I16 => TY_INT16,
            DynamicType::U16 => TY_UINT16,
            DynamicType::I32 => TY_INT32,
            DynamicType::U32 => TY_UINT32,
            DynamicType::I64 => TY_INT64,
            DynamicType::U64 => TY_UINT64,
            DynamicType::F64 => TY_DOUBLE,
            DynamicType::String => TY_STRING,
            DynamicType::ObjectPath => TY_OBJECT_PATH,
            DynamicType::Signature => TY_SIGNATURE,
            DynamicType::Variant => TY_VARIANT,
            DynamicType::Fd => TY_UNIX_FD,
            DynamicType::Array(el) => {
                w.push(TY_ARRAY);
                el.write_signature(w);
                return;
            }
            DynamicType::DictEntry(k, v) => {
                w.push(b'{');
                k.write_signature(w);
                v.write_signature(w);
                w.push(b'}');
                return;
            }
            DynamicType::Struct(f) => {
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

    /// Whether `v` is a value of this type.
    pub fn matches(&self, v: &Variant) -> bool {
        match (self, v) {
            (DynamicType::U8, Variant::U8(_))
            | (DynamicType::Bool, Variant::Bool(_))
            | (DynamicType::I16, Variant::I16(_))
            | (DynamicType::U16, Variant::U16(_))
            | (DynamicType::I32, Variant::I32(_))
            | (DynamicType::U32, Variant::U32(_))
            | (DynamicType::I64, Variant::I64(_))
            | (DynamicType::U64, Variant::U64(_))
            | (DynamicType::F64, Variant::F64(_))
            | (DynamicType::String, Variant::String(_))
            | (DynamicType::ObjectPath, Variant::ObjectPath(_))
            | (DynamicType::Signature, Variant::Signature(_))
            | (DynamicType::Variant, Variant::Variant(_))
            | (DynamicType::Fd, Variant::Fd(_)) => true,
            (DynamicType::Array(el), Variant::Array(vel, items)) => {
                **el == *vel && items.iter().all(|i| el.matches(i))
            }
            (DynamicType::DictEntry(kt, vt), Variant::DictEntry(k, v)) => {
                kt.matches(k) && vt.matches(v)
            }
            (DynamicType::Struct(fields), Variant::Struct(values)) => {
                fields.len() == values.len()
                    && fields.iter().zip(values).all(|(f, v)| f.matches(v))
            }
            _ => false,
        }
    }
}
