use {
    crate::{
        async_engine::AsyncEngine,
        cancellable::Cancellable,
        dbus::{DbusError, PROPERTIES_INTERFACE, Variant, registry::Value},
        introspection,
        memory_bus::{MemoryBus, MemoryInterface},
        proxy::{BindError, CallOptions, Proxy, ProxyError, ProxyType, Reply},
    },
    futures_util::FutureExt,
    std::{cell::RefCell, rc::Rc},
};

const NAME: &str = "com.example.Shapes";
const PATH: &str = "/com/example/Shapes";

const SHAPES_XML: &str = r#"<node>
  <interface name="com.example.Shapes">
    <method name="Area">
      <arg name="width" type="u" direction="in"/>
      <arg name="height" type="u" direction="in"/>
      <arg name="area" type="u" direction="out"/>
    </method>
    <method name="Reset"/>
    <method name="Bounds">
      <arg name="x" type="i" direction="out"/>
      <arg name="y" type="i" direction="out"/>
    </method>
    <method name="Label">
      <arg name="id" type="y" direction="in"/>
      <arg name="label" type="s" direction="in"/>
      <arg name="visible" type="b" direction="in"/>
    </method>
    <signal name="Moved">
      <arg name="x" type="i"/>
      <arg name="y" type="i"/>
    </signal>
    <property name="Width" type="u" access="readwrite"/>
    <property name="Title" type="s" access="read"/>
    <property name="Scale" type="d" access="readwrite"/>
  </interface>
</node>"#;

struct Fixture {
    bus: Rc<MemoryBus>,
    peer: String,
    proxy: Rc<Proxy>,
    labels: Rc<RefCell<Vec<Vec<Variant>>>>,
}

fn shapes(labels: &Rc<RefCell<Vec<Vec<Variant>>>>) -> MemoryInterface {
    let labels = labels.clone();
    MemoryInterface::from_xml(SHAPES_XML)
        .unwrap()
        .with_property("Width", Variant::U32(10))
        .with_property("Title", Variant::String("square".to_string()))
        .with_property("Scale", Variant::F64(1.0))
        .with_method("Area", |args| match args {
            [Variant::U32(w), Variant::U32(h)] => Ok(vec![Variant::U32(w * h)]),
            _ => Ok(vec![]),
        })
        .with_method("Bounds", |_| Ok(vec![Variant::I32(-1), Variant::I32(2)]))
        .with_method("Label", move |args| {
            labels.borrow_mut().push(args.to_vec());
            Ok(vec![])
        })
}

fn fixture() -> Fixture {
    let bus = MemoryBus::new();
    let peer = bus.add_peer();
    let labels = Rc::new(RefCell::new(vec![]));
    bus.export(&peer, PATH, shapes(&labels));
    bus.request_name(NAME, &peer);
    let ty = ProxyType::from_xml(SHAPES_XML).unwrap();
    let proxy = Proxy::new(&bus.connection(), &ty, NAME, PATH);
    proxy
        .init(&Cancellable::new())
        .now_or_never()
        .unwrap()
        .unwrap();
    Fixture {
        bus,
        peer,
        proxy,
        labels,
    }
}

#[test]
fn generation_is_memoized() {
    let a = ProxyType::from_xml(SHAPES_XML).unwrap();
    let b = ProxyType::from_xml(SHAPES_XML).unwrap();
    assert!(Rc::ptr_eq(&a, &b));
    let mut desc = introspection::load(SHAPES_XML).unwrap();
    desc.methods.pop();
    let c = ProxyType::generate(&desc);
    assert!(!Rc::ptr_eq(&a, &c));
    assert_eq!(c.interface_name(), NAME);
    assert!(c.method("Label").is_none());
    assert!(Rc::ptr_eq(
        &ProxyType::introspectable(),
        &ProxyType::introspectable()
    ));
}

#[test]
fn generated_surface() {
    let ty = ProxyType::from_xml(SHAPES_XML).unwrap();
    let methods: Vec<_> = ty.methods().map(|m| m.name()).collect();
    assert_eq!(methods, ["Area", "Reset", "Bounds", "Label"]);
    let area = ty.method("Area").unwrap();
    let params: Vec<_> = area.params().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(params, ["width", "height"]);
    assert_eq!(
        area.signature(),
        "Area(width: u, height: u, cancellable = None, flags = NONE, timeout_ms = -1, \
         callback = None) -> u"
    );
    let width = ty.property("Width").unwrap();
    assert!(width.access.writable());
    assert_eq!(width.spec().default_value(), Some(Value::Int(0)));
    assert!(ty.property("Title").unwrap().spec().default_value().is_none());
    let moved = ty.signal("Moved").unwrap();
    assert_eq!(moved.args.len(), 2);
    let text = ty.describe();
    assert!(text.starts_with("interface com.example.Shapes\n"), "{}", text);
    assert!(text.contains("signal Moved(x: i, y: i)"), "{}", text);
    assert!(text.contains("property Width: u (readwrite)"), "{}", text);
}

#[test]
fn bind_arguments() {
    let ty = ProxyType::from_xml(SHAPES_XML).unwrap();
    let label = ty.method("Label").unwrap();
    let expected = Variant::Struct(vec![
        Variant::U8(7),
        Variant::String("seven".to_string()),
        Variant::Bool(true),
    ]);
    let body = label
        .bind(&[7u8.into(), "seven".into(), true.into()], &[])
        .unwrap();
    assert_eq!(body.as_ref(), Some(&expected));
    let body = label
        .bind(&[7u8.into()], &[("visible", true.into()), ("label", "seven".into())])
        .unwrap();
    assert_eq!(body.as_ref(), Some(&expected));
    let reset = ty.method("Reset").unwrap();
    assert_eq!(reset.bind(&[], &[]).unwrap(), None);
}

#[test]
fn bind_errors() {
    let ty = ProxyType::from_xml(SHAPES_XML).unwrap();
    let area = ty.method("Area").unwrap();
    let one = || Value::from(1u32);
    assert!(matches!(
        area.bind(&[one(), one(), one()], &[]),
        Err(BindError::TooManyArguments {
            expected: 2,
            got: 3
        })
    ));
    match area.bind(&[one()], &[]) {
        Err(BindError::MissingArgument(name)) => assert_eq!(name, "height"),
        res => panic!("unexpected result {:?}", res),
    }
    match area.bind(&[one()], &[("width", one())]) {
        Err(BindError::DuplicateArgument(name)) => assert_eq!(name, "width"),
        res => panic!("unexpected result {:?}", res),
    }
    match area.bind(&[], &[("depth", one())]) {
        Err(BindError::UnknownArgument(name)) => assert_eq!(name, "depth"),
        res => panic!("unexpected result {:?}", res),
    }
    match area.bind(&[Value::Int(-1), one()], &[]) {
        Err(BindError::Encode(name, DbusError::ValueOutOfRange { .. })) => {
            assert_eq!(name, "width")
        }
        res => panic!("unexpected result {:?}", res),
    }
    assert!(matches!(
        area.bind(&["wide".into(), one()], &[]),
        Err(BindError::Encode(_, DbusError::InvalidValueType { .. }))
    ));
}

#[test]
fn reply_shapes() {
    let f = fixture();
    let call = |method: &str, args: &[Value]| {
        f.proxy
            .call(method, args, CallOptions::default())
            .unwrap()
    };
    assert_eq!(
        call("Area", &[3u32.into(), 4u32.into()]),
        Reply::Single(Value::Int(12))
    );
    assert_eq!(
        call("Bounds", &[]),
        Reply::Tuple(vec![Value::Int(-1), Value::Int(2)])
    );
    let reset = call("Reset", &[]);
    assert!(reset.is_empty());
    let ty = f.proxy.proxy_type();
    let reset = ty.method("Reset").unwrap();
    assert_eq!(reset.unpack_reply(None).unwrap(), Reply::None);
}

#[test]
fn arguments_are_packed_in_declaration_order() {
    let f = fixture();
    f.proxy
        .call_named(
            "Label",
            &[],
            &[
                ("visible", false.into()),
                ("label", "x".into()),
                ("id", 1u8.into()),
            ],
            CallOptions::default(),
        )
        .unwrap();
    assert_eq!(
        *f.labels.borrow(),
        [vec![
            Variant::U8(1),
            Variant::String("x".to_string()),
            Variant::Bool(false),
        ]]
    );
}

#[test]
fn call_errors() {
    let f = fixture();
    let err = f
        .proxy
        .call("Missing", &[], CallOptions::default())
        .unwrap_err();
    assert!(matches!(err, ProxyError::UnknownMethod(..)));
    let err = f
        .proxy
        .call("Area", &[1u32.into()], CallOptions::default())
        .unwrap_err();
    assert!(matches!(err, ProxyError::Bind(..)));
    let cancellable = Cancellable::new();
    cancellable.cancel();
    let options = CallOptions::default().with_cancellable(&cancellable);
    let err = f.proxy.call("Reset", &[], options).unwrap_err();
    assert!(matches!(err, ProxyError::Dbus(DbusError::Cancelled)));
    f.bus.release_name(NAME);
    let err = f
        .proxy
        .call("Reset", &[], CallOptions::default())
        .unwrap_err();
    assert!(matches!(err, ProxyError::Dbus(DbusError::CallError(_))));
}

#[test]
fn callback_without_engine() {
    let f = fixture();
    let got = Rc::new(RefCell::new(None));
    let options = CallOptions::default().with_callback({
        let got = got.clone();
        move |res| *got.borrow_mut() = Some(res.unwrap())
    });
    let reply = f
        .proxy
        .call("Area", &[2u32.into(), 5u32.into()], options)
        .unwrap();
    assert_eq!(reply, Reply::None);
    assert_eq!(*got.borrow(), Some(Reply::Single(Value::Int(10))));
}

#[test]
fn callback_with_engine() {
    let f = fixture();
    let eng = AsyncEngine::new();
    let _default = eng.push_thread_default();
    let got = Rc::new(RefCell::new(None));
    let options = CallOptions::default().with_callback({
        let got = got.clone();
        move |res| *got.borrow_mut() = Some(res.unwrap())
    });
    let reply = f
        .proxy
        .call("Area", &[2u32.into(), 5u32.into()], options)
        .unwrap();
    assert_eq!(reply, Reply::None);
    assert!(got.borrow().is_none());
    eng.dispatch();
    assert_eq!(*got.borrow(), Some(Reply::Single(Value::Int(10))));
    assert_eq!(eng.num_tasks(), 0);
}

#[test]
fn call_future() {
    let f = fixture();
    let reply = f
        .proxy
        .call_future("Area", &[6u32.into(), 7u32.into()], Default::default())
        .now_or_never()
        .unwrap()
        .unwrap();
    assert_eq!(reply.into_single(), Some(Value::Int(42)));
}

#[test]
fn initial_properties() {
    let f = fixture();
    assert_eq!(f.proxy.property("Width").unwrap(), Some(Value::Int(10)));
    assert_eq!(
        f.proxy.property("Title").unwrap(),
        Some(Value::Str("square".to_string()))
    );
    assert_eq!(f.proxy.property("Scale").unwrap(), Some(Value::Float(1.0)));
    assert_eq!(f.proxy.cached_property_names(), ["Scale", "Title", "Width"]);
    assert!(matches!(
        f.proxy.property("Depth"),
        Err(ProxyError::UnknownProperty(..))
    ));
    assert_eq!(f.bus.count_calls(PROPERTIES_INTERFACE, "GetAll"), 1);
}

#[test]
fn init_is_cancellable() {
    let bus = MemoryBus::new();
    let ty = ProxyType::from_xml(SHAPES_XML).unwrap();
    let proxy = Proxy::new(&bus.connection(), &ty, NAME, PATH);
    let cancellable = Cancellable::new();
    cancellable.cancel();
    let res = proxy.init(&cancellable).now_or_never().unwrap();
    assert!(matches!(res, Err(DbusError::Cancelled)));
    assert!(bus.calls().is_empty());
}

#[test]
fn missing_object_is_not_an_init_error() {
    let bus = MemoryBus::new();
    let ty = ProxyType::from_xml(SHAPES_XML).unwrap();
    let proxy = Proxy::new(&bus.connection(), &ty, NAME, PATH);
    let res = proxy.init(&Cancellable::new()).now_or_never().unwrap();
    assert!(res.is_ok());
    assert!(proxy.cached_property_names().is_empty());
    assert_eq!(proxy.property("Width").unwrap(), None);
}

#[test]
fn property_changes_notify() {
    let f = fixture();
    let seen = Rc::new(RefCell::new(vec![]));
    let handle = f
        .proxy
        .connect_notify("Width", {
            let seen = seen.clone();
            move |proxy, name| seen.borrow_mut().push(proxy.property(name).unwrap())
        })
        .unwrap();
    f.bus
        .set_property(&f.peer, PATH, NAME, "Width", Variant::U32(11));
    f.bus
        .set_property(&f.peer, PATH, NAME, "Title", Variant::String("x".into()));
    assert_eq!(*seen.borrow(), [Some(Value::Int(11))]);
    assert_eq!(
        f.proxy.property("Title").unwrap(),
        Some(Value::Str("x".to_string()))
    );
    drop(handle);
    f.bus
        .set_property(&f.peer, PATH, NAME, "Width", Variant::U32(12));
    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(f.proxy.property("Width").unwrap(), Some(Value::Int(12)));
}

#[test]
fn invalidated_properties_are_fetched() {
    let f = fixture();
    let notified = Rc::new(RefCell::new(vec![]));
    let _handle = f
        .proxy
        .connect_notify("Width", {
            let notified = notified.clone();
            move |proxy, name| notified.borrow_mut().push(proxy.property(name).unwrap())
        })
        .unwrap();
    f.bus.invalidate_property(&f.peer, PATH, NAME, "Width");
    assert_eq!(f.bus.count_calls(PROPERTIES_INTERFACE, "Get"), 1);
    assert_eq!(*notified.borrow(), [Some(Value::Int(10))]);

    let eng = AsyncEngine::new();
    let _default = eng.push_thread_default();
    f.bus.invalidate_property(&f.peer, PATH, NAME, "Width");
    assert_eq!(f.proxy.property("Width").unwrap(), None);
    eng.dispatch();
    assert_eq!(f.bus.count_calls(PROPERTIES_INTERFACE, "Get"), 2);
    assert_eq!(f.proxy.property("Width").unwrap(), Some(Value::Int(10)));
    assert_eq!(notified.borrow().len(), 2);
}

#[test]
fn invalidated_properties_without_fetching() {
    let f = fixture();
    f.proxy.set_fetch_invalidated(false);
    let notified = Rc::new(RefCell::new(0));
    let _handle = f
        .proxy
        .connect_notify("Width", {
            let notified = notified.clone();
            move |_, _| *notified.borrow_mut() += 1
        })
        .unwrap();
    f.bus.invalidate_property(&f.peer, PATH, NAME, "Width");
    assert_eq!(*notified.borrow(), 1);
    assert_eq!(f.proxy.property("Width").unwrap(), None);
    assert_eq!(f.bus.count_calls(PROPERTIES_INTERFACE, "Get"), 0);
}

#[test]
fn set_properties() {
    let f = fixture();
    f.proxy.set_property("Width", 20u32.into()).unwrap();
    assert_eq!(f.proxy.property("Width").unwrap(), Some(Value::Int(20)));
    f.proxy.set_property("Scale", Value::Int(2)).unwrap();
    assert_eq!(f.proxy.property("Scale").unwrap(), Some(Value::Float(2.0)));
    let err = f
        .proxy
        .set_property("Title", "circle".into())
        .unwrap_err();
    assert!(matches!(err, ProxyError::ReadOnly(_)));
    let err = f
        .proxy
        .set_property("Width", Value::Int(1 << 32))
        .unwrap_err();
    assert!(matches!(
        err,
        ProxyError::Dbus(DbusError::ValueOutOfRange { .. })
    ));
    let err = f.proxy.set_property("Width", "wide".into()).unwrap_err();
    assert!(matches!(
        err,
        ProxyError::Dbus(DbusError::InvalidValueType { .. })
    ));
    assert_eq!(f.bus.count_calls(PROPERTIES_INTERFACE, "Set"), 2);
}

#[test]
fn signals() {
    let f = fixture();
    let moves = Rc::new(RefCell::new(vec![]));
    let handle = f
        .proxy
        .connect_signal("Moved", {
            let moves = moves.clone();
            move |_, args| moves.borrow_mut().push(args.to_vec())
        })
        .unwrap();
    let emit = |args: Vec<Variant>| f.bus.emit_signal(&f.peer, PATH, NAME, "Moved", args);
    emit(vec![Variant::I32(1), Variant::I32(-2)]);
    emit(vec![Variant::I32(1)]);
    emit(vec![Variant::String("1".to_string()), Variant::I32(2)]);
    f.bus.emit_signal(&f.peer, PATH, NAME, "Undeclared", vec![]);
    assert_eq!(*moves.borrow(), [vec![Value::Int(1), Value::Int(-2)]]);
    drop(handle);
    emit(vec![Variant::I32(3), Variant::I32(4)]);
    assert_eq!(moves.borrow().len(), 1);
    assert!(matches!(
        f.proxy.connect_signal("Resized", |_, _| ()),
        Err(ProxyError::UnknownSignal(..))
    ));
}

#[test]
fn subscriptions_end_with_the_proxy() {
    let f = fixture();
    assert_eq!(f.bus.num_subscriptions(), 2);
    assert_eq!(f.proxy.to_string(), format!("{} at {}:{}", NAME, NAME, PATH));
    let Fixture { bus, proxy, .. } = f;
    drop(proxy);
    assert_eq!(bus.num_subscriptions(), 0);
}
