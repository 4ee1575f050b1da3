//! The message-bus seam.
//!
//! Everything above this module talks to the bus through [`Connection`]. A
//! connection routes method calls, reports the owner of well-known names,
//! and delivers signals to subscriptions.

mod dynamic_type;
pub mod registry;
mod types;
pub mod util;

pub use types::*;
use {
    crate::cancellable::Cancellable,
    futures_util::future::{Either, LocalBoxFuture, select},
    std::{
        fmt::{Debug, Display},
        ops::BitOr,
        rc::Rc,
        time::Instant,
    },
    thiserror::Error,
};

pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
pub const ERROR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

/// A call timeout that never expires.
pub const TIMEOUT_INFINITE: i32 = -1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallError {
    pub name: String,
    pub msg: Option<String>,
}

impl CallError {
    pub fn new(name: &str, msg: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            msg: Some(msg.into()),
        }
    }
}

impl Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(msg) = &self.msg {
            write!(f, "{}: {}", self.name, msg)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

#[derive(Debug, Error)]
pub enum DbusError {
    #[error("Encountered an unknown type in a signature")]
    UnknownType,
    #[error("Signature is empty")]
    EmptySignature,
    #[error("Signature is not a single complete type")]
    TrailingSignature,
    #[error("Dict signature does not contain a terminating '}}'")]
    UnterminatedDict,
    #[error("Struct signature does not contain a terminating ')'")]
    UnterminatedStruct,
    #[error("Dict signature contains trailing types")]
    DictTrailing,
    #[error("Signature nests arrays or structs more than 32 levels deep")]
    SignatureTooDeep,
    #[error("Dict entries can only appear as array elements")]
    DictOutsideArray,
    #[error("Variant has type `{actual}` but `{expected}` was expected")]
    InvalidVariantType { expected: String, actual: String },
    #[error("Expected a value of kind {expected:?} for type `{tag}` but got {actual:?}")]
    InvalidValueType {
        tag: String,
        expected: registry::NativeType,
        actual: registry::NativeType,
    },
    #[error("Value {value} is out of range for type `{tag}`")]
    ValueOutOfRange { tag: String, value: String },
    #[error("`{0}` is not a valid object path")]
    InvalidObjectPath(String),
    #[error("`{0}` is not a valid signature")]
    InvalidSignature(String),
    #[error("The reply does not have the expected shape `{0}`")]
    UnexpectedReply(&'static str),
    #[error("{0}")]
    CallError(CallError),
    #[error("The operation was cancelled")]
    Cancelled,
    #[error("The connection was closed")]
    Killed,
    #[error("The connection broke while it was being established")]
    BrokenPipe,
    #[error("The bus refused the connection")]
    ConnectionRefused,
}

impl DbusError {
    /// Whether establishing a connection might succeed if it is retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbusError::BrokenPipe | DbusError::ConnectionRefused)
    }

    pub fn call_error_name(&self) -> Option<&str> {
        match self {
            DbusError::CallError(e) => Some(&e.name),
            _ => None,
        }
    }
}

impl From<CallError> for DbusError {
    fn from(value: CallError) -> Self {
        Self::CallError(value)
    }
}

const TY_BYTE: u8 = b'y';
const TY_BOOLEAN: u8 = b'b';
const TY_INT16: u8 = b'n';
const TY_UINT16: u8 = b'q';
const TY_INT32: u8 = b'i';
const TY_UINT32: u8 = b'u';
const TY_INT64: u8 = b'x';
const TY_UINT64: u8 = b't';
const TY_DOUBLE: u8 = b'd';
const TY_STRING: u8 = b's';
const TY_OBJECT_PATH: u8 = b'o';
const TY_SIGNATURE: u8 = b'g';
const TY_ARRAY: u8 = b'a';
const TY_VARIANT: u8 = b'v';
const TY_UNIX_FD: u8 = b'h';

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum DynamicType {
    U8,
    Bool,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F64,
    String,
    ObjectPath,
    Signature,
    Variant,
    Fd,
    Array(Box<DynamicType>),
    DictEntry(Box<DynamicType>, Box<DynamicType>),
    Struct(Vec<DynamicType>),
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CallFlags(pub u32);

impl CallFlags {
    pub const NONE: Self = Self(0);
    pub const NO_AUTO_START: Self = Self(1 << 0);
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CallFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Per-call settings that are passed through to the connection.
#[derive(Clone, Debug)]
pub struct CallParams {
    pub flags: CallFlags,
    pub timeout_ms: i32,
    pub cancellable: Option<Cancellable>,
}

impl Default for CallParams {
    fn default() -> Self {
        Self {
            flags: CallFlags::NONE,
            timeout_ms: TIMEOUT_INFINITE,
            cancellable: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// A struct holding the arguments, or `None` if the method takes none.
    pub body: Option<Variant>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignalMessage {
    /// The unique name of the emitting connection.
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Variant>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl MatchRule {
    /// Matches everything but the sender. Senders are resolved by the
    /// connection since a rule can name a well-known name.
    pub fn matches_message(&self, msg: &SignalMessage) -> bool {
        fn eq(rule: &Option<String>, v: &str) -> bool {
            rule.as_deref().map(|r| r == v).unwrap_or(true)
        }
        eq(&self.path, &msg.path)
            && eq(&self.interface, &msg.interface)
            && eq(&self.member, &msg.member)
    }
}

pub type SignalHandler = Rc<dyn Fn(&SignalMessage)>;

pub trait NameWatcher {
    fn appeared(&self, name: &str, owner: &str);
    fn vanished(&self, name: &str);
}

pub trait Connection {
    fn call(
        &self,
        msg: MethodCall,
        params: &CallParams,
    ) -> LocalBoxFuture<'static, Result<Option<Variant>, DbusError>>;

    fn call_sync(&self, msg: MethodCall, params: &CallParams)
    -> Result<Option<Variant>, DbusError>;

    /// Registers a watcher for `name`. The watcher is told about the current
    /// owner from a later dispatch, never from within this call.
    fn watch_name(&self, name: &str, watcher: Rc<dyn NameWatcher>) -> u64;

    fn unwatch_name(&self, id: u64);

    fn subscribe(&self, rule: MatchRule, handler: SignalHandler) -> Result<u64, DbusError>;

    fn unsubscribe(&self, id: u64);

    /// Processes pending incoming events. Called by wait loops before every
    /// iteration.
    fn dispatch(&self) {}

    /// The time at which [`Connection::dispatch`] has work to do, if known.
    fn next_dispatch(&self) -> Option<Instant> {
        None
    }
}

impl Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Connection")
    }
}

/// Establishes connections to a bus address.
pub trait Connector {
    fn connect(&self, address: &str)
    -> LocalBoxFuture<'static, Result<Rc<dyn Connection>, DbusError>>;
}

/// A name watch that is removed when dropped.
#[must_use]
pub struct NameWatch {
    conn: Rc<dyn Connection>,
    id: u64,
}

impl NameWatch {
    pub fn new(conn: &Rc<dyn Connection>, name: &str, watcher: Rc<dyn NameWatcher>) -> Self {
        let id = conn.watch_name(name, watcher);
        Self {
            conn: conn.clone(),
            id,
        }
    }
}

impl Drop for NameWatch {
    fn drop(&mut self) {
        self.conn.unwatch_name(self.id);
    }
}

/// A signal subscription that is removed when dropped.
#[must_use]
pub struct Subscription {
    conn: Rc<dyn Connection>,
    id: u64,
}

impl Subscription {
    pub fn new(
        conn: &Rc<dyn Connection>,
        rule: MatchRule,
        handler: SignalHandler,
    ) -> Result<Self, DbusError> {
        let id = conn.subscribe(rule, handler)?;
        Ok(Self {
            conn: conn.clone(),
            id,
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.conn.unsubscribe(self.id);
    }
}

/// Performs an asynchronous call that fails with [`DbusError::Cancelled`] as
/// soon as the cancellable of `params` is triggered.
pub async fn call_async(
    conn: &Rc<dyn Connection>,
    msg: MethodCall,
    params: &CallParams,
) -> Result<Option<Variant>, DbusError> {
    let Some(cancellable) = &params.cancellable else {
        return conn.call(msg, params).await;
    };
    cancellable.check()?;
    let call = conn.call(msg, params);
    match select(call, cancellable.cancelled()).await {
        Either::Left((res, _)) => res,
        Either::Right(_) => Err(DbusError::Cancelled),
    }
}

pub fn call_sync(
    conn: &Rc<dyn Connection>,
    msg: MethodCall,
    params: &CallParams,
) -> Result<Option<Variant>, DbusError> {
    if let Some(c) = &params.cancellable {
        c.check()?;
    }
    conn.call_sync(msg, params)
}
