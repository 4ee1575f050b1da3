use {
    crate::{
        cancellable::Cancellable,
        dbus::{
            CallFlags, CallParams, DbusError, MethodCall, TIMEOUT_INFINITE, Variant,
            registry::{self, Value},
        },
        introspection::MethodDescriptor,
        proxy::{ProxyError, proxy_type::Param},
    },
    std::fmt::{Debug, Formatter},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum BindError {
    #[error("Expected at most {expected} arguments but got {got}")]
    TooManyArguments { expected: usize, got: usize },
    #[error("Missing argument `{0}`")]
    MissingArgument(String),
    #[error("Argument `{0}` was given more than once")]
    DuplicateArgument(String),
    #[error("There is no argument named `{0}`")]
    UnknownArgument(String),
    #[error("Could not convert argument `{0}`")]
    Encode(String, #[source] DbusError),
}

pub type ReplyCallback = Box<dyn FnOnce(Result<Reply, ProxyError>)>;

/// The options every generated method accepts after its own arguments.
pub struct CallOptions {
    pub cancellable: Option<Cancellable>,
    pub flags: CallFlags,
    pub timeout_ms: i32,
    /// If set, the call is dispatched asynchronously and the reply is
    /// delivered here.
    pub callback: Option<ReplyCallback>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            cancellable: None,
            flags: CallFlags::NONE,
            timeout_ms: TIMEOUT_INFINITE,
            callback: None,
        }
    }
}

impl Debug for CallOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("cancellable", &self.cancellable)
            .field("flags", &self.flags)
            .field("timeout_ms", &self.timeout_ms)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl CallOptions {
    pub fn with_cancellable(mut self, cancellable: &Cancellable) -> Self {
        self.cancellable = Some(cancellable.clone());
        self
    }

    pub fn with_flags(mut self, flags: CallFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: i32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_callback(mut self, f: impl FnOnce(Result<Reply, ProxyError>) + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    pub fn params(&self) -> CallParams {
        CallParams {
            flags: self.flags,
            timeout_ms: self.timeout_ms,
            cancellable: self.cancellable.clone(),
        }
    }
}

/// The unpacked reply of a method call.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// The reply had no body or the call was dispatched asynchronously.
    None,
    Single(Value),
    Tuple(Vec<Value>),
}

impl Reply {
    pub fn from_values(mut values: Vec<Value>) -> Self {
        match values.len() {
            1 => Reply::Single(values.remove(0)),
            _ => Reply::Tuple(values),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Reply::None => true,
            Reply::Single(_) => false,
            Reply::Tuple(v) => v.is_empty(),
        }
    }

    pub fn into_single(self) -> Option<Value> {
        match self {
            Reply::Single(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            Reply::None => vec![],
            Reply::Single(v) => vec![v],
            Reply::Tuple(v) => v,
        }
    }
}

pub struct ProxyMethod {
    interface: String,
    name: String,
    params: Vec<Param>,
    returns: Vec<Param>,
}

impl ProxyMethod {
    pub(super) fn new(interface: &str, desc: &MethodDescriptor) -> Self {
        Self {
            interface: interface.to_string(),
            name: desc.name.clone(),
            params: desc.in_args.iter().map(Param::new).collect(),
            returns: desc.out_args.iter().map(Param::new).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn returns(&self) -> &[Param] {
        &self.returns
    }

    /// Binds arguments by position and then by name and packs them in
    /// declaration order. Methods without arguments have no body.
    pub fn bind(
        &self,
        positional: &[Value],
        named: &[(&str, Value)],
    ) -> Result<Option<Variant>, BindError> {
        if positional.len() > self.params.len() {
            return Err(BindError::TooManyArguments {
                expected: self.params.len(),
                got: positional.len(),
            });
        }
        let mut slots: Vec<Option<&Value>> = vec![None; self.params.len()];
        for (slot, value) in slots.iter_mut().zip(positional) {
            *slot = Some(value);
        }
        for (name, value) in named {
            let Some(idx) = self.params.iter().position(|p| p.name == *name) else {
                return Err(BindError::UnknownArgument(name.to_string()));
            };
            if slots[idx].is_some() {
                return Err(BindError::DuplicateArgument(name.to_string()));
            }
            slots[idx] = Some(value);
        }
        let mut body = Vec::with_capacity(self.params.len());
        for (param, slot) in self.params.iter().zip(slots) {
            let Some(value) = slot else {
                return Err(BindError::MissingArgument(param.name.clone()));
            };
            match param.info.encode(value) {
                Ok(v) => body.push(v),
                Err(e) => return Err(BindError::Encode(param.name.clone(), e)),
            }
        }
        match body.is_empty() {
            true => Ok(None),
            false => Ok(Some(Variant::Struct(body))),
        }
    }

    pub fn message(&self, destination: &str, path: &str, body: Option<Variant>) -> MethodCall {
        MethodCall {
            destination: destination.to_string(),
            path: path.to_string(),
            interface: self.interface.clone(),
            member: self.name.clone(),
            body,
        }
    }

    /// Converts a reply body using the declared return types where they
    /// line up with the reply.
    pub fn unpack_reply(&self, body: Option<Variant>) -> Result<Reply, DbusError> {
        let values = match body {
            None => return Ok(Reply::None),
            Some(Variant::Struct(values)) => values,
            Some(v) => vec![v],
        };
        if values.len() != self.returns.len() {
            log::debug!(
                "{}.{} returned {} values but declares {}",
                self.interface,
                self.name,
                values.len(),
                self.returns.len(),
            );
            return Ok(Reply::from_values(values.iter().map(registry::unpack).collect()));
        }
        let values = self
            .returns
            .iter()
            .zip(&values)
            .map(|(param, v)| param.info.decode(v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Reply::from_values(values))
    }

    pub fn signature(&self) -> String {
        let mut args: Vec<_> = self
            .params
            .iter()
            .map(|p| format!("{}: {}", p.name, p.signature))
            .collect();
        args.push("cancellable = None".to_string());
        args.push("flags = NONE".to_string());
        args.push(format!("timeout_ms = {}", TIMEOUT_INFINITE));
        args.push("callback = None".to_string());
        let mut s = format!("{}({})", self.name, args.join(", "));
        match self.returns.len() {
            0 => {}
            1 => s.push_str(&format!(" -> {}", self.returns[0].signature)),
            _ => {
                let returns: Vec<_> = self.returns.iter().map(|p| p.signature.as_str()).collect();
                s.push_str(&format!(" -> ({})", returns.join(", ")));
            }
        }
        s
    }
}
