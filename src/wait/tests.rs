use {
    crate::{
        dbus::{
            CallError, CallParams, Connection, Connector, DbusError, INTROSPECTABLE_INTERFACE,
            MatchRule, MethodCall, NameWatcher, SignalHandler, Variant, registry::Value,
        },
        memory_bus::{MemoryBus, MemoryInterface},
        proxy::{Proxy, ProxyType},
        utils::{errorfmt::ErrorFmt, numcell::NumCell},
        wait::{
            ErrorSlot, RETRY_INTERVAL_MS, WaitContext, WaitError, wait_for_connection,
            wait_for_interface, wait_for_property,
        },
    },
    futures_util::{FutureExt, future::LocalBoxFuture},
    std::{
        cell::{Cell, RefCell},
        future::pending,
        mem,
        rc::Rc,
        time::{Duration, Instant},
    },
};

const SERVICE: &str = "com.example.Service";
const PATH: &str = "/com/example/Object";
const INTERFACE: &str = "com.example.Counter";

const COUNTER_XML: &str = r#"<node>
  <interface name="com.example.Counter">
    <method name="Add">
      <arg name="amount" type="u" direction="in"/>
      <arg name="total" type="u" direction="out"/>
    </method>
    <signal name="Overflow">
      <arg name="total" type="u"/>
    </signal>
    <property name="Count" type="u" access="readwrite"/>
  </interface>
</node>"#;

fn counter(count: u32) -> MemoryInterface {
    MemoryInterface::from_xml(COUNTER_XML)
        .unwrap()
        .with_property("Count", Variant::U32(count))
}

fn service(bus: &Rc<MemoryBus>) -> String {
    let peer = bus.add_peer();
    bus.export(&peer, PATH, counter(0));
    bus.request_name(SERVICE, &peer);
    peer
}

fn counter_proxy(bus: &Rc<MemoryBus>) -> Rc<Proxy> {
    let conn = bus.connection();
    wait_for_interface(&conn, SERVICE, PATH, INTERFACE, 1000, None).unwrap()
}

#[test]
fn interface_present() {
    let bus = MemoryBus::new();
    service(&bus);
    let proxy = counter_proxy(&bus);
    assert_eq!(proxy.interface_name(), INTERFACE);
    assert_eq!(proxy.destination(), SERVICE);
    assert_eq!(proxy.path(), PATH);
    assert_eq!(proxy.property("Count").unwrap(), Some(Value::Int(0)));
    assert_eq!(bus.count_calls(INTROSPECTABLE_INTERFACE, "Introspect"), 1);
    assert_eq!(bus.num_watches(), 0);
}

#[test]
fn interface_appears_after_retries() {
    let bus = MemoryBus::new();
    let peer = bus.add_peer();
    bus.request_name(SERVICE, &peer);
    bus.schedule(Duration::from_millis(150), move |bus| {
        bus.export(&peer, PATH, counter(5));
    });
    let start = Instant::now();
    let proxy = counter_proxy(&bus);
    assert!(start.elapsed() >= Duration::from_millis(2 * RETRY_INTERVAL_MS));
    assert_eq!(bus.count_calls(INTROSPECTABLE_INTERFACE, "Introspect"), 3);
    assert_eq!(proxy.property("Count").unwrap(), Some(Value::Int(5)));
}

#[test]
fn name_appears_later() {
    let bus = MemoryBus::new();
    bus.schedule(Duration::from_millis(50), |bus| {
        let peer = bus.add_peer();
        bus.export(&peer, PATH, counter(1));
        bus.request_name(SERVICE, &peer);
    });
    let proxy = counter_proxy(&bus);
    assert_eq!(proxy.property("Count").unwrap(), Some(Value::Int(1)));
}

#[test]
fn name_never_appears() {
    let bus = MemoryBus::new();
    let conn = bus.connection();
    let start = Instant::now();
    let err = wait_for_interface(&conn, SERVICE, PATH, INTERFACE, 200, None).unwrap_err();
    let elapsed = start.elapsed();
    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(err.destination, SERVICE);
    assert_eq!(err.interface, INTERFACE);
    assert_eq!(bus.num_watches(), 0);
    assert_eq!(bus.num_subscriptions(), 0);
    assert!(bus.calls().is_empty());
}

#[test]
fn interface_never_appears() {
    let bus = MemoryBus::new();
    let peer = bus.add_peer();
    bus.request_name(SERVICE, &peer);
    let conn = bus.connection();
    let err = wait_for_interface(&conn, SERVICE, PATH, INTERFACE, 250, None).unwrap_err();
    assert!(err.is_timeout());
    assert!(bus.count_calls(INTROSPECTABLE_INTERFACE, "Introspect") >= 2);
    assert_eq!(bus.num_watches(), 0);
    assert_eq!(bus.num_subscriptions(), 0);
}

#[test]
fn vanished_name_restarts_discovery() {
    let bus = MemoryBus::new();
    let first = bus.add_peer();
    bus.request_name(SERVICE, &first);
    bus.schedule(Duration::from_millis(50), |bus| bus.release_name(SERVICE));
    bus.schedule(Duration::from_millis(120), |bus| {
        let second = bus.add_peer();
        bus.export(&second, PATH, counter(2));
        bus.request_name(SERVICE, &second);
    });
    let proxy = counter_proxy(&bus);
    assert_eq!(proxy.property("Count").unwrap(), Some(Value::Int(2)));
    let introspected: Vec<_> = bus
        .calls()
        .into_iter()
        .filter(|c| c.member == "Introspect")
        .collect();
    assert!(introspected.len() >= 2);
    assert!(introspected.iter().all(|c| c.destination == SERVICE));
}

#[test]
fn supplied_proxy_type() {
    let bus = MemoryBus::new();
    service(&bus);
    let conn = bus.connection();
    let ty = ProxyType::from_xml(COUNTER_XML).unwrap();
    let proxy = wait_for_interface(&conn, SERVICE, PATH, INTERFACE, 1000, Some(&ty)).unwrap();
    assert!(Rc::ptr_eq(proxy.proxy_type(), &ty));
}

#[test]
fn mismatched_proxy_type() {
    let bus = MemoryBus::new();
    service(&bus);
    let conn = bus.connection();
    let ty = ProxyType::introspectable();
    let err = wait_for_interface(&conn, SERVICE, PATH, INTERFACE, 1000, Some(&ty)).unwrap_err();
    assert!(matches!(err.error, WaitError::ProxyTypeMismatch { .. }));
    assert!(bus.calls().is_empty());
}

/// Reports every name as owned and rejects every call.
#[derive(Default)]
struct DenyingConnection {
    watchers: RefCell<Vec<(String, Rc<dyn NameWatcher>)>>,
}

const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";

impl Connection for DenyingConnection {
    fn call(
        &self,
        _msg: MethodCall,
        _params: &CallParams,
    ) -> LocalBoxFuture<'static, Result<Option<Variant>, DbusError>> {
        let e = DbusError::from(CallError::new(ACCESS_DENIED, "Access denied"));
        async move { Err(e) }.boxed_local()
    }

    fn call_sync(
        &self,
        _msg: MethodCall,
        _params: &CallParams,
    ) -> Result<Option<Variant>, DbusError> {
        Err(CallError::new(ACCESS_DENIED, "Access denied").into())
    }

    fn watch_name(&self, name: &str, watcher: Rc<dyn NameWatcher>) -> u64 {
        self.watchers.borrow_mut().push((name.to_string(), watcher));
        1
    }

    fn unwatch_name(&self, _id: u64) {}

    fn subscribe(&self, _rule: MatchRule, _handler: SignalHandler) -> Result<u64, DbusError> {
        Ok(1)
    }

    fn unsubscribe(&self, _id: u64) {}

    fn dispatch(&self) {
        let watchers = mem::take(&mut *self.watchers.borrow_mut());
        for (name, watcher) in watchers {
            watcher.appeared(&name, ":1.1");
        }
    }

    fn next_dispatch(&self) -> Option<Instant> {
        match self.watchers.borrow().is_empty() {
            true => None,
            false => Some(Instant::now()),
        }
    }
}

#[test]
fn call_errors_are_fatal() {
    let conn: Rc<dyn Connection> = Rc::new(DenyingConnection::default());
    let start = Instant::now();
    let err = wait_for_interface(&conn, SERVICE, PATH, INTERFACE, 5000, None).unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(!err.is_timeout());
    match &err.error {
        WaitError::Call(e) => assert_eq!(e.call_error_name(), Some(ACCESS_DENIED)),
        e => panic!("unexpected error {}", ErrorFmt(e)),
    }
    let msg = ErrorFmt(&err).to_string();
    assert!(msg.contains(SERVICE), "{}", msg);
    assert!(msg.contains("Access denied"), "{}", msg);
}

/// Releases the service name from within the first `Introspect` call and
/// fails that call. Everything else goes to the bus.
struct ReleasingConnection {
    bus: Rc<MemoryBus>,
    inner: Rc<dyn Connection>,
    released: Cell<bool>,
}

impl ReleasingConnection {
    fn new(bus: &Rc<MemoryBus>) -> Rc<dyn Connection> {
        Rc::new(Self {
            bus: bus.clone(),
            inner: bus.connection(),
            released: Cell::new(false),
        })
    }
}

impl Connection for ReleasingConnection {
    fn call(
        &self,
        msg: MethodCall,
        params: &CallParams,
    ) -> LocalBoxFuture<'static, Result<Option<Variant>, DbusError>> {
        if msg.member != "Introspect" || self.released.replace(true) {
            return self.inner.call(msg, params);
        }
        self.bus.release_name(SERVICE);
        let e = DbusError::from(CallError::new(ACCESS_DENIED, "Access denied"));
        async move { Err(e) }.boxed_local()
    }

    fn call_sync(
        &self,
        msg: MethodCall,
        params: &CallParams,
    ) -> Result<Option<Variant>, DbusError> {
        self.inner.call_sync(msg, params)
    }

    fn watch_name(&self, name: &str, watcher: Rc<dyn NameWatcher>) -> u64 {
        self.inner.watch_name(name, watcher)
    }

    fn unwatch_name(&self, id: u64) {
        self.inner.unwatch_name(id)
    }

    fn subscribe(&self, rule: MatchRule, handler: SignalHandler) -> Result<u64, DbusError> {
        self.inner.subscribe(rule, handler)
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.unsubscribe(id)
    }

    fn dispatch(&self) {
        self.inner.dispatch()
    }

    fn next_dispatch(&self) -> Option<Instant> {
        self.inner.next_dispatch()
    }
}

#[test]
fn errors_of_a_vanishing_owner_restart_discovery() {
    let bus = MemoryBus::new();
    let peer = service(&bus);
    bus.schedule(Duration::from_millis(50), move |bus| {
        bus.request_name(SERVICE, &peer);
    });
    let conn = ReleasingConnection::new(&bus);
    let proxy = wait_for_interface(&conn, SERVICE, PATH, INTERFACE, 1000, None).unwrap();
    assert_eq!(proxy.property("Count").unwrap(), Some(Value::Int(0)));
    assert_eq!(bus.count_calls(INTROSPECTABLE_INTERFACE, "Introspect"), 1);
}

#[test]
fn errors_of_a_vanished_owner_are_reported_on_timeout() {
    let bus = MemoryBus::new();
    service(&bus);
    let conn = ReleasingConnection::new(&bus);
    let err = wait_for_interface(&conn, SERVICE, PATH, INTERFACE, 200, None).unwrap_err();
    assert!(err.is_timeout());
    match &err.error {
        WaitError::WithContext { error, context } => {
            assert!(matches!(**error, WaitError::Timeout(200)));
            match &**context {
                WaitError::Call(e) => assert_eq!(e.call_error_name(), Some(ACCESS_DENIED)),
                e => panic!("unexpected context {}", ErrorFmt(e)),
            }
        }
        e => panic!("unexpected error {}", ErrorFmt(e)),
    }
    assert!(ErrorFmt(&err).to_string().contains("Access denied"));
    assert_eq!(bus.num_watches(), 0);
}

#[test]
fn property_already_matches() {
    let bus = MemoryBus::new();
    service(&bus);
    let proxy = counter_proxy(&bus);
    let start = Instant::now();
    wait_for_property(&proxy, "Count", &Value::Int(0), 0).unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn property_matches_after_changes() {
    let bus = MemoryBus::new();
    let peer = service(&bus);
    let proxy = counter_proxy(&bus);
    for (delay, count) in [(20, 1), (40, 2), (60, 3)] {
        let peer = peer.clone();
        bus.schedule(Duration::from_millis(delay), move |bus| {
            bus.set_property(&peer, PATH, INTERFACE, "Count", Variant::U32(count));
        });
    }
    let seen = Rc::new(RefCell::new(vec![]));
    let _listener = proxy
        .connect_notify("Count", {
            let seen = seen.clone();
            move |proxy, name| {
                let value = proxy.property(name).unwrap();
                seen.borrow_mut().push(value);
            }
        })
        .unwrap();
    wait_for_property(&proxy, "Count", &Value::Int(3), 1000).unwrap();
    assert_eq!(
        *seen.borrow(),
        [Some(Value::Int(1)), Some(Value::Int(2)), Some(Value::Int(3))]
    );
}

#[test]
fn property_match_is_not_lost_to_a_later_change() {
    let bus = MemoryBus::new();
    let peer = service(&bus);
    let proxy = counter_proxy(&bus);
    bus.schedule(Duration::from_millis(20), move |bus| {
        bus.set_property(&peer, PATH, INTERFACE, "Count", Variant::U32(3));
        bus.set_property(&peer, PATH, INTERFACE, "Count", Variant::U32(4));
    });
    let start = Instant::now();
    wait_for_property(&proxy, "Count", &Value::Int(3), 1000).unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(proxy.property("Count").unwrap(), Some(Value::Int(4)));
}

#[test]
fn property_never_matches() {
    let bus = MemoryBus::new();
    let peer = service(&bus);
    let proxy = counter_proxy(&bus);
    bus.schedule(Duration::from_millis(20), move |bus| {
        bus.set_property(&peer, PATH, INTERFACE, "Count", Variant::U32(1));
    });
    let err = wait_for_property(&proxy, "Count", &Value::Int(7), 150).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(proxy.property("Count").unwrap(), Some(Value::Int(1)));
}

#[test]
fn unknown_property() {
    let bus = MemoryBus::new();
    service(&bus);
    let proxy = counter_proxy(&bus);
    let err = wait_for_property(&proxy, "Missing", &Value::Int(0), 100).unwrap_err();
    assert!(matches!(err, WaitError::Proxy(_)));
}

#[test]
fn error_slot_chains_errors() {
    let slot = ErrorSlot::default();
    assert!(!slot.is_set());
    slot.capture(WaitError::Cancelled);
    assert!(!slot.is_set());
    slot.capture(WaitError::Timeout(1));
    slot.capture(WaitError::Call(DbusError::Killed));
    assert!(slot.is_set());
    let err = slot.take().unwrap();
    assert!(!slot.is_set());
    let WaitError::WithContext { error, context } = &err else {
        panic!("unexpected error {}", ErrorFmt(&err));
    };
    assert!(matches!(**error, WaitError::Call(DbusError::Killed)));
    assert!(matches!(**context, WaitError::Timeout(1)));
    let err = err.with_context(WaitError::Timeout(2));
    let WaitError::WithContext { context, .. } = &err else {
        panic!("unexpected error {}", ErrorFmt(&err));
    };
    assert!(matches!(**context, WaitError::WithContext { .. }));
    let msg = ErrorFmt(&err).to_string();
    assert!(msg.contains("1 ms"), "{}", msg);
    assert!(msg.contains("2 ms"), "{}", msg);
    assert!(!err.is_timeout());
}

#[test]
fn captured_errors_stop_the_loop() {
    let cx = WaitContext::new(None, 5000);
    let errors = cx.errors().clone();
    let eng = cx.engine().clone();
    let start = Instant::now();
    let res: Result<(), WaitError> = cx.run(async move {
        eng.timeout(10).await;
        errors.capture(WaitError::ProxyTypeMismatch {
            expected: "a.A".to_string(),
            actual: "a.B".to_string(),
        });
        pending::<Result<(), WaitError>>().await
    });
    assert!(matches!(res, Err(WaitError::ProxyTypeMismatch { .. })));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn timeout_is_reported() {
    let cx = WaitContext::new(None, 50);
    let res: Result<(), WaitError> = cx.run(pending());
    assert!(matches!(res, Err(WaitError::Timeout(50))));
}

struct FlakyConnector {
    bus: Rc<MemoryBus>,
    attempts: NumCell<u32>,
    failures: u32,
    error: fn() -> DbusError,
}

impl Connector for FlakyConnector {
    fn connect(
        &self,
        _address: &str,
    ) -> LocalBoxFuture<'static, Result<Rc<dyn Connection>, DbusError>> {
        let attempt = self.attempts.fetch_add(1);
        let res = match attempt < self.failures {
            true => Err((self.error)()),
            false => Ok(self.bus.connection()),
        };
        async move { res }.boxed_local()
    }
}

fn flaky(failures: u32, error: fn() -> DbusError) -> Rc<FlakyConnector> {
    Rc::new(FlakyConnector {
        bus: MemoryBus::new(),
        attempts: NumCell::new(0),
        failures,
        error,
    })
}

#[test]
fn connection_retries_transient_errors() {
    let connector = flaky(2, || DbusError::BrokenPipe);
    let start = Instant::now();
    let dyn_connector: Rc<dyn Connector> = connector.clone();
    wait_for_connection(&dyn_connector, "unix:path=/tmp/bus", 1000).unwrap();
    assert_eq!(connector.attempts.get(), 3);
    assert!(start.elapsed() >= Duration::from_millis(2 * RETRY_INTERVAL_MS));
}

#[test]
fn connection_fails_fast() {
    let connector = flaky(1, || DbusError::Killed);
    let dyn_connector: Rc<dyn Connector> = connector.clone();
    let err = wait_for_connection(&dyn_connector, "unix:path=/tmp/bus", 1000).unwrap_err();
    assert!(matches!(err, WaitError::Call(DbusError::Killed)));
    assert_eq!(connector.attempts.get(), 1);
}

#[test]
fn connection_times_out() {
    let connector = flaky(u32::MAX, || DbusError::ConnectionRefused);
    let dyn_connector: Rc<dyn Connector> = connector.clone();
    let err = wait_for_connection(&dyn_connector, "unix:path=/tmp/bus", 250).unwrap_err();
    assert!(err.is_timeout());
    assert!(connector.attempts.get() >= 2);
}
