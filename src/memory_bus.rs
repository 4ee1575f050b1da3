//! An in-process bus.
//!
//! `MemoryBus` plays both sides of a session bus: the connection the harness
//! talks through, and the peers that own names and export objects. Peer-side
//! changes are either applied directly or scheduled to happen later, in which
//! case they are performed by [`Connection::dispatch`] once due.


use {
    crate::{
        cancellable::Cancellable,
        dbus::{
            CallError, CallParams, Connection, DbusError, ERROR_FAILED, ERROR_INVALID_ARGS,
            ERROR_PROPERTY_READ_ONLY, ERROR_SERVICE_UNKNOWN, ERROR_UNKNOWN_INTERFACE,
            ERROR_UNKNOWN_METHOD, ERROR_UNKNOWN_OBJECT, ERROR_UNKNOWN_PROPERTY,
            INTROSPECTABLE_INTERFACE, MatchRule, MethodCall, NameWatcher, PROPERTIES_CHANGED,
            PROPERTIES_INTERFACE, SignalHandler, SignalMessage, Variant,
        },
        introspection::{self, InterfaceDescriptor, NodeDescriptor, PropertyAccess, SchemaError},
        utils::numcell::NumCell,
    },
    ahash::AHashMap,
    futures_util::{FutureExt, future::LocalBoxFuture},
    std::{
        cell::RefCell,
        collections::{BTreeMap, BTreeSet, VecDeque},
        mem,
        rc::Rc,
        time::{Duration, Instant},
    },
};

type MethodHandler = Rc<dyn Fn(&[Variant]) -> Result<Vec<Variant>, CallError>>;

/// An interface exported by a peer.
pub struct MemoryInterface {
    descriptor: InterfaceDescriptor,
    properties: BTreeMap<String, Variant>,
    methods: AHashMap<String, MethodHandler>,
}

impl MemoryInterface {
    pub fn new(descriptor: InterfaceDescriptor) -> Self {
        Self {
            descriptor,
            properties: Default::default(),
            methods: Default::default(),
        }
    }

    pub fn from_xml(xml: &str) -> Result<Self, SchemaError> {
        Ok(Self::new(introspection::load(xml)?))
    }

    pub fn with_property(mut self, name: &str, value: Variant) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    /// Installs the implementation of a method. Methods without an
    /// implementation reply with no values.
    pub fn with_method(
        mut self,
        name: &str,
        f: impl Fn(&[Variant]) -> Result<Vec<Variant>, CallError> + 'static,
    ) -> Self {
        self.methods.insert(name.to_string(), Rc::new(f));
        self
    }
}

struct Watch {
    id: u64,
    name: String,
    watcher: Rc<dyn NameWatcher>,
}

struct Match {
    id: u64,
    rule: MatchRule,
    handler: SignalHandler,
}

type Action = Box<dyn FnOnce(&MemoryBus)>;

struct Scheduled {
    due: Instant,
    seq: u64,
    action: Action,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallRecord {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
}

pub struct MemoryBus {
    next_id: NumCell<u64>,
    next_peer: NumCell<u64>,
    peers: RefCell<BTreeSet<String>>,
    /// Well-known name to unique name.
    names: RefCell<AHashMap<String, String>>,
    /// (unique name, path) to interfaces.
    objects: RefCell<BTreeMap<(String, String), Vec<MemoryInterface>>>,
    watches: RefCell<Vec<Watch>>,
    matches: RefCell<Vec<Match>>,
    pending: RefCell<VecDeque<u64>>,
    scheduled: RefCell<Vec<Scheduled>>,
    calls: RefCell<Vec<CallRecord>>,
}

impl MemoryBus {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            next_id: NumCell::new(1),
            next_peer: NumCell::new(1),
            peers: Default::default(),
            names: Default::default(),
            objects: Default::default(),
            watches: Default::default(),
            matches: Default::default(),
            pending: Default::default(),
            scheduled: Default::default(),
            calls: Default::default(),
        })
    }

    pub fn connection(self: &Rc<Self>) -> Rc<dyn Connection> {
        self.clone()
    }

    /// Creates a peer and returns its unique name.
    pub fn add_peer(&self) -> String {
        let name = format!(":1.{}", self.next_peer.fetch_add(1));
        self.peers.borrow_mut().insert(name.clone());
        name
    }

    /// Removes a peer together with its names and objects.
    pub fn remove_peer(&self, peer: &str) {
        let owned: Vec<_> = self
            .names
            .borrow()
            .iter()
            .filter(|(_, owner)| *owner == peer)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.release_name(&name);
        }
        self.objects.borrow_mut().retain(|(owner, _), _| owner != peer);
        self.peers.borrow_mut().remove(peer);
    }

    pub fn request_name(&self, name: &str, peer: &str) {
        let prev = self
            .names
            .borrow_mut()
            .insert(name.to_string(), peer.to_string());
        if prev.as_deref() == Some(peer) {
            return;
        }
        log::debug!("{} now owns {}", peer, name);
        if prev.is_some() {
            self.notify_watchers(name, None);
        }
        self.notify_watchers(name, Some(peer));
    }

    pub fn release_name(&self, name: &str) {
        if self.names.borrow_mut().remove(name).is_some() {
            log::debug!("{} has been released", name);
            self.notify_watchers(name, None);
        }
    }

    pub fn name_owner(&self, name: &str) -> Option<String> {
        if name.starts_with(':') {
            return self.peers.borrow().get(name).cloned();
        }
        self.names.borrow().get(name).cloned()
    }

    pub fn export(&self, peer: &str, path: &str, interface: MemoryInterface) {
        let mut objects = self.objects.borrow_mut();
        let interfaces = objects
            .entry((peer.to_string(), path.to_string()))
            .or_default();
        interfaces.retain(|i| i.descriptor.name != interface.descriptor.name);
        interfaces.push(interface);
    }

    pub fn unexport(&self, peer: &str, path: &str, interface: &str) {
        let mut objects = self.objects.borrow_mut();
        let key = (peer.to_string(), path.to_string());
        if let Some(interfaces) = objects.get_mut(&key) {
            interfaces.retain(|i| i.descriptor.name != interface);
            if interfaces.is_empty() {
                objects.remove(&key);
            }
        }
    }

    /// Changes a property of an exported object and emits
    /// `PropertiesChanged` if the value differs.
    pub fn set_property(
        &self,
        peer: &str,
        path: &str,
        interface: &str,
        name: &str,
        value: Variant,
    ) {
        if self.store_property(peer, path, interface, name, value.clone()) {
            let changed = vec![(name.to_string(), value)];
            self.emit_properties_changed(peer, path, interface, changed, vec![]);
        }
    }

    /// Announces a property as invalidated without sending its value.
    pub fn invalidate_property(&self, peer: &str, path: &str, interface: &str, name: &str) {
        self.emit_properties_changed(peer, path, interface, vec![], vec![name.to_string()]);
    }

    fn store_property(
        &self,
        peer: &str,
        path: &str,
        interface: &str,
        name: &str,
        value: Variant,
    ) -> bool {
        let mut objects = self.objects.borrow_mut();
        let key = (peer.to_string(), path.to_string());
        let Some(iface) = objects
            .get_mut(&key)
            .and_then(|i| i.iter_mut().find(|i| i.descriptor.name == interface))
        else {
            log::warn!("{} does not export {} at {}", peer, interface, path);
            return false;
        };
        let prev = iface.properties.insert(name.to_string(), value.clone());
        prev.as_ref() != Some(&value)
    }

    fn emit_properties_changed(
        &self,
        peer: &str,
        path: &str,
        interface: &str,
        changed: Vec<(String, Variant)>,
        invalidated: Vec<String>,
    ) {
        let args = vec![
            Variant::String(interface.to_string()),
            Variant::vardict(changed),
            Variant::string_array(invalidated),
        ];
        self.emit_signal(peer, path, PROPERTIES_INTERFACE, PROPERTIES_CHANGED, args);
    }

    pub fn emit_signal(
        &self,
        peer: &str,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<Variant>,
    ) {
        let msg = SignalMessage {
            sender: peer.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            args,
        };
        let handlers: Vec<_> = self
            .matches
            .borrow()
            .iter()
            .filter(|m| self.sender_matches(&m.rule, peer) && m.rule.matches_message(&msg))
            .map(|m| m.handler.clone())
            .collect();
        for handler in handlers {
            handler(&msg);
        }
    }

    fn sender_matches(&self, rule: &MatchRule, peer: &str) -> bool {
        match &rule.sender {
            None => true,
            Some(s) if s == peer => true,
            Some(s) => self.names.borrow().get(s).map(|o| o == peer).unwrap_or(false),
        }
    }

    /// Runs `action` from the first dispatch at least `delay` from now.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce(&MemoryBus) + 'static) {
        self.scheduled.borrow_mut().push(Scheduled {
            due: Instant::now() + delay,
            seq: self.next_id.fetch_add(1),
            action: Box::new(action),
        });
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.borrow().clone()
    }

    pub fn count_calls(&self, interface: &str, member: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.interface == interface && c.member == member)
            .count()
    }

    pub fn num_watches(&self) -> usize {
        self.watches.borrow().len()
    }

    pub fn num_subscriptions(&self) -> usize {
        self.matches.borrow().len()
    }

    fn notify_watchers(&self, name: &str, owner: Option<&str>) {
        let watchers: Vec<_> = self
            .watches
            .borrow()
            .iter()
            .filter(|w| w.name == name)
            .map(|w| w.watcher.clone())
            .collect();
        for watcher in watchers {
            match owner {
                Some(owner) => watcher.appeared(name, owner),
                None => watcher.vanished(name),
            }
        }
    }

    fn handle_call(&self, msg: &MethodCall) -> Result<Option<Variant>, DbusError> {
        self.calls.borrow_mut().push(CallRecord {
            destination: msg.destination.clone(),
            path: msg.path.clone(),
            interface: msg.interface.clone(),
            member: msg.member.clone(),
        });
        let Some(owner) = self.name_owner(&msg.destination) else {
            return Err(CallError::new(
                ERROR_SERVICE_UNKNOWN,
                format!("The name {} is not owned", msg.destination),
            )
            .into());
        };
        let args = match &msg.body {
            None => vec![],
            Some(Variant::Struct(args)) => args.clone(),
            Some(_) => {
                return Err(CallError::new(ERROR_INVALID_ARGS, "Body is not a struct").into());
            }
        };
        let values = match (msg.interface.as_str(), msg.member.as_str()) {
            (INTROSPECTABLE_INTERFACE, "Introspect") => self.introspect(&owner, &msg.path)?,
            (PROPERTIES_INTERFACE, "Get") => self.get_property(&owner, &msg.path, &args)?,
            (PROPERTIES_INTERFACE, "GetAll") => self.get_all(&owner, &msg.path, &args)?,
            (PROPERTIES_INTERFACE, "Set") => self.set_property_call(&owner, &msg.path, args)?,
            _ => self.call_method(&owner, msg, &args)?,
        };
        Ok(Some(Variant::Struct(values)))
    }

    fn introspect(&self, owner: &str, path: &str) -> Result<Vec<Variant>, CallError> {
        let objects = self.objects.borrow();
        let mut node = NodeDescriptor::default();
        if let Some(interfaces) = objects.get(&(owner.to_string(), path.to_string())) {
            node.interfaces.push(introspection::introspectable().clone());
            node.interfaces.push(properties_descriptor());
            node.interfaces
                .extend(interfaces.iter().map(|i| i.descriptor.clone()));
        }
        let prefix = match path {
            "/" => "/".to_string(),
            _ => format!("{}/", path),
        };
        let mut children = BTreeSet::new();
        for (o, p) in objects.keys() {
            if o != owner {
                continue;
            }
            if let Some(rest) = p.strip_prefix(&prefix) {
                if let Some(child) = rest.split('/').next() {
                    if !child.is_empty() {
                        children.insert(child.to_string());
                    }
                }
            }
        }
        node.nodes = children
            .into_iter()
            .map(|name| NodeDescriptor {
                name: Some(name),
                ..Default::default()
            })
            .collect();
        match node.to_xml() {
            Ok(xml) => Ok(vec![Variant::String(xml)]),
            Err(e) => Err(CallError::new(ERROR_FAILED, e.to_string())),
        }
    }

    fn with_interface<T>(
        &self,
        owner: &str,
        path: &str,
        interface: &str,
        f: impl FnOnce(&mut MemoryInterface) -> Result<T, CallError>,
    ) -> Result<T, CallError> {
        let mut objects = self.objects.borrow_mut();
        let Some(interfaces) = objects.get_mut(&(owner.to_string(), path.to_string())) else {
            return Err(CallError::new(
                ERROR_UNKNOWN_OBJECT,
                format!("No such object path '{}'", path),
            ));
        };
        let Some(iface) = interfaces.iter_mut().find(|i| i.descriptor.name == interface) else {
            return Err(CallError::new(
                ERROR_UNKNOWN_INTERFACE,
                format!("No such interface '{}' at object path '{}'", interface, path),
            ));
        };
        f(iface)
    }

    fn get_property(
        &self,
        owner: &str,
        path: &str,
        args: &[Variant],
    ) -> Result<Vec<Variant>, CallError> {
        let [Variant::String(interface), Variant::String(name)] = args else {
            return Err(CallError::new(ERROR_INVALID_ARGS, "Expected (ss)"));
        };
        self.with_interface(owner, path, interface, |iface| {
            match iface.properties.get(name) {
                Some(v) => Ok(vec![Variant::Variant(Box::new(v.clone()))]),
                None => Err(CallError::new(
                    ERROR_UNKNOWN_PROPERTY,
                    format!("No such property '{}'", name),
                )),
            }
        })
    }

    fn get_all(
        &self,
        owner: &str,
        path: &str,
        args: &[Variant],
    ) -> Result<Vec<Variant>, CallError> {
        let [Variant::String(interface)] = args else {
            return Err(CallError::new(ERROR_INVALID_ARGS, "Expected (s)"));
        };
        self.with_interface(owner, path, interface, |iface| {
            let entries = iface
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()));
            Ok(vec![Variant::vardict(entries)])
        })
    }

    fn set_property_call(
        &self,
        owner: &str,
        path: &str,
        args: Vec<Variant>,
    ) -> Result<Vec<Variant>, CallError> {
        let Ok([Variant::String(interface), Variant::String(name), Variant::Variant(value)]) =
            <[Variant; 3]>::try_from(args)
        else {
            return Err(CallError::new(ERROR_INVALID_ARGS, "Expected (ssv)"));
        };
        let value = *value;
        self.with_interface(owner, path, &interface, |iface| {
            let Some(prop) = iface.descriptor.lookup_property(&name) else {
                return Err(CallError::new(
                    ERROR_UNKNOWN_PROPERTY,
                    format!("No such property '{}'", name),
                ));
            };
            if prop.access == PropertyAccess::Read {
                return Err(CallError::new(
                    ERROR_PROPERTY_READ_ONLY,
                    format!("Property '{}' is read-only", name),
                ));
            }
            if value.signature() != prop.signature {
                return Err(CallError::new(
                    ERROR_INVALID_ARGS,
                    format!("Property '{}' has type '{}'", name, prop.signature),
                ));
            }
            Ok(())
        })?;
        if self.store_property(owner, path, &interface, &name, value.clone()) {
            self.emit_properties_changed(owner, path, &interface, vec![(name, value)], vec![]);
        }
        Ok(vec![])
    }

    fn call_method(
        &self,
        owner: &str,
        msg: &MethodCall,
        args: &[Variant],
    ) -> Result<Vec<Variant>, CallError> {
        let handler = self.with_interface(owner, &msg.path, &msg.interface, |iface| {
            let Some(method) = iface.descriptor.lookup_method(&msg.member) else {
                return Err(CallError::new(
                    ERROR_UNKNOWN_METHOD,
                    format!("No such method '{}'", msg.member),
                ));
            };
            let expected: String = method.in_args.iter().map(|a| a.signature.as_str()).collect();
            let actual: String = args.iter().map(|a| a.signature()).collect();
            if expected != actual {
                return Err(CallError::new(
                    ERROR_INVALID_ARGS,
                    format!("Expected signature '{}', got '{}'", expected, actual),
                ));
            }
            Ok(iface.methods.get(&msg.member).cloned())
        })?;
        // No borrow is held while the handler runs.
        match handler {
            Some(handler) => handler(args),
            None => Ok(vec![]),
        }
    }

    fn check_cancelled(params: &CallParams) -> Result<(), DbusError> {
        params
            .cancellable
            .as_ref()
            .map(Cancellable::check)
            .unwrap_or(Ok(()))
    }
}

fn properties_descriptor() -> InterfaceDescriptor {
    const XML: &str = r#"<node>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="out"/>
    </method>
    <method name="GetAll">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="properties" type="a{sv}" direction="out"/>
    </method>
    <method name="Set">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="in"/>
    </method>
    <signal name="PropertiesChanged">
      <arg name="interface_name" type="s"/>
      <arg name="changed_properties" type="a{sv}"/>
      <arg name="invalidated_properties" type="as"/>
    </signal>
  </interface>
</node>
"#;
    introspection::load(XML).unwrap_or_else(|e| {
        log::error!("Could not load the properties descriptor: {}", e);
        InterfaceDescriptor::default()
    })
}

impl Connection for MemoryBus {
    fn call(
        &self,
        msg: MethodCall,
        params: &CallParams,
    ) -> LocalBoxFuture<'static, Result<Option<Variant>, DbusError>> {
        let res = Self::check_cancelled(params).and_then(|_| self.handle_call(&msg));
        async move { res }.boxed_local()
    }

    fn call_sync(
        &self,
        msg: MethodCall,
        params: &CallParams,
    ) -> Result<Option<Variant>, DbusError> {
        Self::check_cancelled(params)?;
        self.handle_call(&msg)
    }

    fn watch_name(&self, name: &str, watcher: Rc<dyn NameWatcher>) -> u64 {
        let id = self.next_id.fetch_add(1);
        self.watches.borrow_mut().push(Watch {
            id,
            name: name.to_string(),
            watcher,
        });
        self.pending.borrow_mut().push_back(id);
        id
    }

    fn unwatch_name(&self, id: u64) {
        self.watches.borrow_mut().retain(|w| w.id != id);
    }

    fn subscribe(&self, rule: MatchRule, handler: SignalHandler) -> Result<u64, DbusError> {
        let id = self.next_id.fetch_add(1);
        self.matches.borrow_mut().push(Match { id, rule, handler });
        Ok(id)
    }

    fn unsubscribe(&self, id: u64) {
        self.matches.borrow_mut().retain(|m| m.id != id);
    }

    fn dispatch(&self) {
        loop {
            let Some(id) = self.pending.borrow_mut().pop_front() else {
                break;
            };
            let watch = self
                .watches
                .borrow()
                .iter()
                .find(|w| w.id == id)
                .map(|w| (w.name.clone(), w.watcher.clone()));
            if let Some((name, watcher)) = watch {
                match self.name_owner(&name) {
                    Some(owner) => watcher.appeared(&name, &owner),
                    None => watcher.vanished(&name),
                }
            }
        }
        let now = Instant::now();
        let due = {
            let mut scheduled = self.scheduled.borrow_mut();
            let (mut due, rest): (Vec<_>, Vec<_>) =
                mem::take(&mut *scheduled).into_iter().partition(|s| s.due <= now);
            *scheduled = rest;
            due.sort_by_key(|s| (s.due, s.seq));
            due
        };
        for scheduled in due {
            (scheduled.action)(self);
        }
    }

    fn next_dispatch(&self) -> Option<Instant> {
        if !self.pending.borrow().is_empty() {
            return Some(Instant::now());
        }
        self.scheduled.borrow().iter().map(|s| s.due).min()
    }
}
