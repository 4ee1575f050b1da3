use crate::{
    dbus::DbusError,
    introspection::{
        self, ArgError, InterfaceError, MemberError, NodeError, PropertyAccess, PropertyError,
        SchemaError,
    },
};

const SCREENSHOT_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.gnome.Shell.Screenshot">
    <method name="ScreenshotArea">
      <arg type="i" direction="in" name="x"/>
      <arg type="i" direction="in" name="y"/>
      <arg type="i" direction="in" name="width"/>
      <arg type="i" direction="in" name="height"/>
      <arg type="b" direction="in" name="flash"/>
      <arg type="s" direction="in" name="filename"/>
      <arg type="b" direction="out" name="success"/>
      <arg type="s" direction="out" name="filename_used"/>
    </method>
    <method name="FlashArea">
      <arg type="i" name="x"/>
      <arg type="i" name="y"/>
      <arg type="i" name="width"/>
      <arg type="i" name="height"/>
    </method>
    <signal name="Taken">
      <arg type="s"/>
    </signal>
    <property name="Busy" type="b" access="read">
      <annotation name="org.freedesktop.DBus.Property.EmitsChangedSignal" value="true"/>
    </property>
    <property name="Quality" type="u" access="readwrite"/>
  </interface>
</node>
"#;

#[test]
fn load_interface() {
    let desc = introspection::load(SCREENSHOT_XML).unwrap();
    assert_eq!(desc.name, "org.gnome.Shell.Screenshot");
    let names: Vec<_> = desc.methods.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["ScreenshotArea", "FlashArea"]);
    let area = desc.lookup_method("ScreenshotArea").unwrap();
    let ins: Vec<_> = area.in_args.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(ins, ["x", "y", "width", "height", "flash", "filename"]);
    let outs: Vec<_> = area.out_args.iter().map(|a| a.signature.as_str()).collect();
    assert_eq!(outs, ["b", "s"]);
    let flash = desc.lookup_method("FlashArea").unwrap();
    assert_eq!(flash.in_args.len(), 4);
    assert!(flash.out_args.is_empty());
    let taken = desc.lookup_signal("Taken").unwrap();
    assert_eq!(taken.args[0].name, "arg_0");
    let busy = desc.lookup_property("Busy").unwrap();
    assert_eq!(busy.access, PropertyAccess::Read);
    assert_eq!(busy.annotations.len(), 1);
    let quality = desc.lookup_property("Quality").unwrap();
    assert!(quality.access.readable() && quality.access.writable());
}

#[test]
fn two_interfaces_are_rejected() {
    let xml = r#"<node>
        <interface name="a.A"/>
        <interface name="a.B"/>
    </node>"#;
    let res = introspection::load(xml);
    assert!(matches!(res, Err(SchemaError::InterfaceCount(2))));
    let res = introspection::load("<node/>");
    assert!(matches!(res, Err(SchemaError::InterfaceCount(0))));
}

#[test]
fn child_nodes_are_rejected() {
    let xml = r#"<node>
        <interface name="a.A"/>
        <node name="child"/>
    </node>"#;
    let err = introspection::load(xml).unwrap_err();
    assert!(matches!(err, SchemaError::ChildNodes));
    assert_eq!(
        err.to_string(),
        "Expected exactly one interface under root node, got child nodes"
    );
}

#[test]
fn root_annotations_are_rejected() {
    let xml = r#"<node>
        <annotation name="x" value="y"/>
        <interface name="a.A"/>
    </node>"#;
    assert!(matches!(
        introspection::load(xml),
        Err(SchemaError::RootAnnotations)
    ));
}

#[test]
fn missing_attributes_are_rejected() {
    let xml = r#"<node><interface><method name="M"/></interface></node>"#;
    assert!(matches!(
        introspection::load(xml),
        Err(SchemaError::Node(NodeError::Interface(InterfaceError::MissingName)))
    ));
    let xml = r#"<node>
        <interface name="a.A"><method name="M"><arg name="x"/></method></interface>
    </node>"#;
    match introspection::load(xml) {
        Err(SchemaError::Node(NodeError::Interface(InterfaceError::Method(
            name,
            MemberError::Arg(ArgError::MissingType),
        )))) => assert_eq!(name, "M"),
        res => panic!("unexpected result {:?}", res),
    }
    let xml = r#"<node>
        <interface name="a.A"><property name="P" access="read"/></interface>
    </node>"#;
    assert!(matches!(
        introspection::load(xml),
        Err(SchemaError::Node(NodeError::Interface(InterfaceError::Property(
            PropertyError::MissingType
        ))))
    ));
    let xml = r#"<node>
        <interface name="a.A"><property name="P" type="a{" access="read"/></interface>
    </node>"#;
    assert!(matches!(
        introspection::load(xml),
        Err(SchemaError::Node(NodeError::Interface(InterfaceError::Property(
            PropertyError::InvalidType(..)
        ))))
    ));
}

#[test]
fn malformed_documents_are_rejected() {
    assert!(matches!(
        introspection::parse_node(""),
        Err(SchemaError::MissingNode)
    ));
    assert!(matches!(
        introspection::parse_node("<interface name=\"a.A\"/>"),
        Err(SchemaError::UnexpectedRoot(_))
    ));
    assert!(matches!(
        introspection::parse_node("<node/><node/>"),
        Err(SchemaError::MultipleRoots)
    ));
    assert!(introspection::parse_node("<node><interface name=\"a.A\">").is_err());
}

#[test]
fn deeply_nested_types_are_rejected() {
    let xml = format!(
        r#"<node>
        <interface name="a.A"><property name="P" type="{}i" access="read"/></interface>
    </node>"#,
        "a".repeat(100_000),
    );
    assert!(matches!(
        introspection::parse_node(&xml),
        Err(SchemaError::Node(NodeError::Interface(InterfaceError::Property(
            PropertyError::InvalidType(_, DbusError::SignatureTooDeep)
        ))))
    ));
    let nodes = |n: usize| format!("{}{}", "<node>".repeat(n), "</node>".repeat(n));
    assert!(introspection::parse_node(&nodes(65)).is_ok());
    let mut err = match introspection::parse_node(&nodes(100_000)) {
        Err(SchemaError::Node(e)) => e,
        res => panic!("unexpected result {:?}", res.map(|_| ())),
    };
    while let NodeError::Node(inner) = err {
        err = *inner;
    }
    assert!(matches!(err, NodeError::TooDeep));
}

#[test]
fn live_documents_are_looked_up() {
    let xml = r#"<node>
        <interface name="org.freedesktop.DBus.Introspectable">
          <method name="Introspect"><arg type="s" direction="out"/></method>
        </interface>
        <interface name="org.gnome.Shell.Screenshot"/>
        <node name="Extensions"/>
        <unknown><nested/></unknown>
    </node>"#;
    let node = introspection::parse_node(xml).unwrap();
    assert_eq!(node.nodes.len(), 1);
    assert_eq!(node.nodes[0].name.as_deref(), Some("Extensions"));
    assert!(node.lookup_interface("org.gnome.Shell.Screenshot").is_some());
    assert!(node.lookup_interface("org.gnome.Shell.Eval").is_none());
}

#[test]
fn written_documents_parse_back() {
    let desc = introspection::load(SCREENSHOT_XML).unwrap();
    let xml = desc.to_xml().unwrap();
    assert_eq!(introspection::load(&xml).unwrap(), desc);
}

#[test]
fn introspectable_descriptor() {
    let parsed = introspection::load(introspection::INTROSPECTABLE_XML).unwrap();
    assert_eq!(&parsed, introspection::introspectable());
}
