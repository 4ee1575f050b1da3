//! Typed proxies for remote objects.
//!
//! A [`ProxyType`] is generated once per interface descriptor. A [`Proxy`]
//! binds a type to a destination and an object path, caches the remote
//! properties and forwards signals to listeners.

mod method;
mod proxy_type;
#[cfg(test)]
mod tests;

pub use {
    method::{BindError, CallOptions, ProxyMethod, Reply, ReplyCallback},
    proxy_type::{Param, PropertySpec, ProxyType, SignalSpec},
};
use {
    crate::{
        async_engine::AsyncEngine,
        cancellable::Cancellable,
        dbus::{
            self, CallParams, Connection, DbusError, MatchRule, MethodCall, PROPERTIES_CHANGED,
            PROPERTIES_INTERFACE, SignalHandler, SignalMessage, Subscription, Variant,
            registry::Value,
        },
        utils::{errorfmt::ErrorFmt, numcell::NumCell},
    },
    ahash::AHashMap,
    futures_util::{FutureExt, future::LocalBoxFuture},
    std::{
        cell::{Cell, RefCell},
        fmt::{Debug, Display, Formatter},
        rc::{Rc, Weak},
    },
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Interface {0} has no method {1}")]
    UnknownMethod(String, String),
    #[error("Interface {0} has no property {1}")]
    UnknownProperty(String, String),
    #[error("Interface {0} has no signal {1}")]
    UnknownSignal(String, String),
    #[error("Property {0} is not writable")]
    ReadOnly(String),
    #[error("Could not bind the arguments of {0}")]
    Bind(String, #[source] BindError),
    #[error("The cached value of property {0} is invalid")]
    InvalidProperty(String, #[source] DbusError),
    #[error(transparent)]
    Dbus(#[from] DbusError),
}

type NotifyHandler = Rc<dyn Fn(&Proxy, &str)>;
type SignalArgsHandler = Rc<dyn Fn(&Proxy, &[Value])>;

#[derive(Default)]
struct Listeners {
    next_id: NumCell<u64>,
    notify: RefCell<Vec<(u64, String, NotifyHandler)>>,
    signals: RefCell<Vec<(u64, String, SignalArgsHandler)>>,
}

/// A property or signal listener. Dropping the handle disconnects it.
#[must_use]
pub struct ListenerHandle {
    listeners: Weak<Listeners>,
    id: u64,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.notify.borrow_mut().retain(|(id, ..)| *id != self.id);
            listeners.signals.borrow_mut().retain(|(id, ..)| *id != self.id);
        }
    }
}

pub struct Proxy {
    conn: Rc<dyn Connection>,
    ty: Rc<ProxyType>,
    destination: String,
    path: String,
    cache: RefCell<AHashMap<String, Variant>>,
    listeners: Rc<Listeners>,
    subscriptions: RefCell<Vec<Subscription>>,
    fetch_invalidated: Cell<bool>,
}

impl Debug for Proxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("interface", &self.ty.interface_name())
            .field("destination", &self.destination)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Display for Proxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.ty.interface_name(),
            self.destination,
            self.path
        )
    }
}

impl Proxy {
    /// Creates a proxy without contacting the remote side. See
    /// [`Proxy::init`].
    pub fn new(
        conn: &Rc<dyn Connection>,
        ty: &Rc<ProxyType>,
        destination: &str,
        path: &str,
    ) -> Rc<Self> {
        Rc::new(Self {
            conn: conn.clone(),
            ty: ty.clone(),
            destination: destination.to_string(),
            path: path.to_string(),
            cache: Default::default(),
            listeners: Default::default(),
            subscriptions: Default::default(),
            fetch_invalidated: Cell::new(true),
        })
    }

    /// Subscribes to the signals of the interface and loads the initial
    /// property values. Failing to load the properties is not an error.
    pub async fn init(self: &Rc<Self>, cancellable: &Cancellable) -> Result<(), DbusError> {
        cancellable.check()?;
        self.subscribe()?;
        if self.ty.properties().next().is_none() {
            return Ok(());
        }
        let msg = MethodCall {
            destination: self.destination.clone(),
            path: self.path.clone(),
            interface: PROPERTIES_INTERFACE.to_string(),
            member: "GetAll".to_string(),
            body: Some(Variant::Struct(vec![Variant::String(
                self.ty.interface_name().to_string(),
            )])),
        };
        let params = CallParams {
            cancellable: Some(cancellable.clone()),
            ..Default::default()
        };
        match dbus::call_async(&self.conn, msg, &params).await {
            Ok(body) => self.load_all(body),
            Err(DbusError::Cancelled) => return Err(DbusError::Cancelled),
            Err(e) => {
                log::debug!("Could not load the properties of {}: {}", self, ErrorFmt(e));
            }
        }
        Ok(())
    }

    fn subscribe(self: &Rc<Self>) -> Result<(), DbusError> {
        let mut subs = self.subscriptions.borrow_mut();
        if !subs.is_empty() {
            return Ok(());
        }
        let handler: SignalHandler = {
            let slf = Rc::downgrade(self);
            Rc::new(move |msg| {
                if let Some(slf) = slf.upgrade() {
                    slf.handle_signal(msg);
                }
            })
        };
        let rule = |interface: &str, member: Option<&str>| MatchRule {
            sender: Some(self.destination.clone()),
            path: Some(self.path.clone()),
            interface: Some(interface.to_string()),
            member: member.map(|m| m.to_string()),
        };
        if self.ty.signals().next().is_some() {
            let rule = rule(self.ty.interface_name(), None);
            subs.push(Subscription::new(&self.conn, rule, handler.clone())?);
        }
        if self.ty.properties().next().is_some() {
            let rule = rule(PROPERTIES_INTERFACE, Some(PROPERTIES_CHANGED));
            subs.push(Subscription::new(&self.conn, rule, handler)?);
        }
        Ok(())
    }

    fn load_all(&self, body: Option<Variant>) {
        let entries = match body.map(|b| b.into_struct()) {
            Some(Ok(mut fields)) if fields.len() == 1 => fields.pop().map(|f| f.into_array()),
            _ => None,
        };
        let Some(Ok(entries)) = entries else {
            log::warn!("GetAll reply for {} is not of type (a{{sv}})", self);
            return;
        };
        let mut cache = self.cache.borrow_mut();
        for entry in entries {
            if let Some((name, value)) = vardict_entry(entry) {
                cache.insert(name, value);
            }
        }
    }

    pub fn connection(&self) -> &Rc<dyn Connection> {
        &self.conn
    }

    pub fn proxy_type(&self) -> &Rc<ProxyType> {
        &self.ty
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface_name(&self) -> &str {
        self.ty.interface_name()
    }

    /// Whether invalidated properties are fetched again. Enabled by default.
    pub fn set_fetch_invalidated(&self, fetch: bool) {
        self.fetch_invalidated.set(fetch);
    }

    fn method(&self, name: &str) -> Result<&ProxyMethod, ProxyError> {
        self.ty.method(name).ok_or_else(|| {
            ProxyError::UnknownMethod(self.interface_name().to_string(), name.to_string())
        })
    }

    pub fn property_spec(&self, name: &str) -> Result<&PropertySpec, ProxyError> {
        self.ty.property(name).ok_or_else(|| {
            ProxyError::UnknownProperty(self.interface_name().to_string(), name.to_string())
        })
    }

    pub fn cached_property(&self, name: &str) -> Option<Variant> {
        self.cache.borrow().get(name).cloned()
    }

    pub fn cached_property_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.cache.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// The last known value of a property, or `None` if it is not known.
    pub fn property(&self, name: &str) -> Result<Option<Value>, ProxyError> {
        let spec = self.property_spec(name)?;
        let Some(v) = self.cached_property(name) else {
            return Ok(None);
        };
        match spec.info.decode(&v) {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(ProxyError::InvalidProperty(name.to_string(), e)),
        }
    }

    pub fn set_property(&self, name: &str, value: Value) -> Result<(), ProxyError> {
        let spec = self.property_spec(name)?;
        if !spec.access.writable() {
            return Err(ProxyError::ReadOnly(name.to_string()));
        }
        spec.spec().check(&spec.signature, &value)?;
        let value = spec.info.encode(&value)?;
        let msg = MethodCall {
            destination: self.destination.clone(),
            path: self.path.clone(),
            interface: PROPERTIES_INTERFACE.to_string(),
            member: "Set".to_string(),
            body: Some(Variant::Struct(vec![
                Variant::String(self.interface_name().to_string()),
                Variant::String(name.to_string()),
                Variant::Variant(Box::new(value)),
            ])),
        };
        dbus::call_sync(&self.conn, msg, &CallParams::default())?;
        Ok(())
    }

    pub fn call(
        &self,
        method: &str,
        args: &[Value],
        options: CallOptions,
    ) -> Result<Reply, ProxyError> {
        self.call_named(method, args, &[], options)
    }

    /// Calls a method. Without a callback the call blocks and the unpacked
    /// reply is returned. With a callback the call runs on the thread-default
    /// engine, the callback receives the reply and `Reply::None` is returned.
    pub fn call_named(
        &self,
        method: &str,
        positional: &[Value],
        named: &[(&str, Value)],
        mut options: CallOptions,
    ) -> Result<Reply, ProxyError> {
        let m = self.method(method)?;
        let body = m
            .bind(positional, named)
            .map_err(|e| ProxyError::Bind(method.to_string(), e))?;
        let msg = m.message(&self.destination, &self.path, body);
        let params = options.params();
        if let Some(callback) = options.callback.take() {
            let ty = self.ty.clone();
            let method = method.to_string();
            self.dispatch(msg, params, move |res| {
                let res = res
                    .map_err(ProxyError::from)
                    .and_then(|body| unpack_reply(&ty, &method, body));
                callback(res);
            });
            return Ok(Reply::None);
        }
        let body = dbus::call_sync(&self.conn, msg, &params)?;
        Ok(m.unpack_reply(body)?)
    }

    /// Calls a method from code that is already running on an engine.
    pub fn call_future(
        &self,
        method: &str,
        args: &[Value],
        params: CallParams,
    ) -> LocalBoxFuture<'static, Result<Reply, ProxyError>> {
        let msg = self.method(method).and_then(|m| {
            let body = m
                .bind(args, &[])
                .map_err(|e| ProxyError::Bind(method.to_string(), e))?;
            Ok(m.message(&self.destination, &self.path, body))
        });
        let conn = self.conn.clone();
        let ty = self.ty.clone();
        let method = method.to_string();
        async move {
            let body = dbus::call_async(&conn, msg?, &params).await?;
            unpack_reply(&ty, &method, body)
        }
        .boxed_local()
    }

    fn dispatch(
        &self,
        msg: MethodCall,
        params: CallParams,
        on_reply: impl FnOnce(Result<Option<Variant>, DbusError>) + 'static,
    ) {
        match AsyncEngine::thread_default() {
            Some(eng) => {
                let conn = self.conn.clone();
                eng.spawn_detached(async move {
                    on_reply(dbus::call_async(&conn, msg, &params).await);
                });
            }
            None => on_reply(dbus::call_sync(&self.conn, msg, &params)),
        }
    }

    pub fn connect_notify(
        &self,
        property: &str,
        f: impl Fn(&Proxy, &str) + 'static,
    ) -> Result<ListenerHandle, ProxyError> {
        self.property_spec(property)?;
        let id = self.listeners.next_id.fetch_add(1);
        self.listeners
            .notify
            .borrow_mut()
            .push((id, property.to_string(), Rc::new(f)));
        Ok(self.handle(id))
    }

    pub fn connect_signal(
        &self,
        signal: &str,
        f: impl Fn(&Proxy, &[Value]) + 'static,
    ) -> Result<ListenerHandle, ProxyError> {
        if self.ty.signal(signal).is_none() {
            return Err(ProxyError::UnknownSignal(
                self.interface_name().to_string(),
                signal.to_string(),
            ));
        }
        let id = self.listeners.next_id.fetch_add(1);
        self.listeners
            .signals
            .borrow_mut()
            .push((id, signal.to_string(), Rc::new(f)));
        Ok(self.handle(id))
    }

    fn handle(&self, id: u64) -> ListenerHandle {
        ListenerHandle {
            listeners: Rc::downgrade(&self.listeners),
            id,
        }
    }

    fn notify(&self, property: &str) {
        let handlers: Vec<_> = self
            .listeners
            .notify
            .borrow()
            .iter()
            .filter(|(_, name, _)| name == property)
            .map(|(_, _, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(self, property);
        }
    }

    fn emit(&self, signal: &str, args: &[Value]) {
        let handlers: Vec<_> = self
            .listeners
            .signals
            .borrow()
            .iter()
            .filter(|(_, name, _)| name == signal)
            .map(|(_, _, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(self, args);
        }
    }

    fn handle_signal(self: &Rc<Self>, msg: &SignalMessage) {
        if msg.interface == PROPERTIES_INTERFACE && msg.member == PROPERTIES_CHANGED {
            self.handle_properties_changed(&msg.args);
            return;
        }
        if msg.interface != self.interface_name() {
            return;
        }
        let Some(spec) = self.ty.signal(&msg.member) else {
            log::debug!("{} emitted undeclared signal {}", self, msg.member);
            return;
        };
        if spec.args.len() != msg.args.len() {
            log::warn!(
                "Signal {} of {} has {} arguments but declares {}",
                msg.member,
                self,
                msg.args.len(),
                spec.args.len(),
            );
            return;
        }
        let args = spec
            .args
            .iter()
            .zip(&msg.args)
            .map(|(p, v)| p.info.decode(v))
            .collect::<Result<Vec<_>, _>>();
        match args {
            Ok(args) => self.emit(&msg.member, &args),
            Err(e) => log::warn!(
                "Could not decode signal {} of {}: {}",
                msg.member,
                self,
                ErrorFmt(e)
            ),
        }
    }

    fn handle_properties_changed(self: &Rc<Self>, args: &[Variant]) {
        let [
            Variant::String(interface),
            Variant::Array(_, changed),
            Variant::Array(_, invalidated),
        ] = args
        else {
            log::warn!("Ignoring malformed PropertiesChanged signal for {}", self);
            return;
        };
        if interface != self.interface_name() {
            return;
        }
        let mut changed_names = vec![];
        let mut invalidated_names = vec![];
        {
            let mut cache = self.cache.borrow_mut();
            for entry in changed {
                if let Some((name, value)) = vardict_entry(entry.clone()) {
                    cache.insert(name.clone(), value);
                    changed_names.push(name);
                }
            }
            for name in invalidated {
                if let Variant::String(name) = name {
                    cache.remove(name);
                    invalidated_names.push(name.clone());
                }
            }
        }
        for name in &changed_names {
            if self.ty.property(name).is_some() {
                self.notify(name);
            }
        }
        for name in invalidated_names {
            if self.fetch_invalidated.get() {
                self.refetch(name);
            } else if self.ty.property(&name).is_some() {
                self.notify(&name);
            }
        }
    }

    fn refetch(self: &Rc<Self>, name: String) {
        let msg = MethodCall {
            destination: self.destination.clone(),
            path: self.path.clone(),
            interface: PROPERTIES_INTERFACE.to_string(),
            member: "Get".to_string(),
            body: Some(Variant::Struct(vec![
                Variant::String(self.interface_name().to_string()),
                Variant::String(name.clone()),
            ])),
        };
        let slf = Rc::downgrade(self);
        self.dispatch(msg, CallParams::default(), move |res| {
            let Some(slf) = slf.upgrade() else {
                return;
            };
            let value = res.and_then(|body| match body {
                Some(body) => body.into_struct(),
                None => Ok(vec![]),
            });
            match value.map(|mut fields| fields.pop().map(|f| f.into_variant())) {
                Ok(Some(Ok(value))) => {
                    slf.cache.borrow_mut().insert(name.clone(), value);
                }
                Ok(_) => log::warn!("Get reply for {} of {} is malformed", name, slf),
                Err(e) => {
                    log::debug!("Could not fetch {} of {}: {}", name, slf, ErrorFmt(e));
                }
            }
            if slf.ty.property(&name).is_some() {
                slf.notify(&name);
            }
        });
    }
}

fn unpack_reply(ty: &ProxyType, method: &str, body: Option<Variant>) -> Result<Reply, ProxyError> {
    match ty.method(method) {
        Some(m) => Ok(m.unpack_reply(body)?),
        None => Err(ProxyError::UnknownMethod(
            ty.interface_name().to_string(),
            method.to_string(),
        )),
    }
}

fn vardict_entry(entry: Variant) -> Option<(String, Variant)> {
    let Variant::DictEntry(k, v) = entry else {
        return None;
    };
    match (*k, *v) {
        (Variant::String(k), Variant::Variant(v)) => Some((k, *v)),
        _ => None,
    }
}
