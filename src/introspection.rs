//! Introspection documents: parsing, validation and writing.

mod ast;
mod parser;
#[cfg(test)]
mod tests;
mod writer;

pub use {
    ast::{
        Annotation, ArgDescriptor, Direction, InterfaceDescriptor, MethodDescriptor,
        NodeDescriptor, PropertyAccess, PropertyDescriptor, SignalDescriptor,
    },
    parser::{
        AnnotationError, ArgError, AttributeError, InterfaceError, MemberError, NodeError,
        PropertyError, SchemaError, load, parse_node,
    },
};
use {crate::dbus::INTROSPECTABLE_INTERFACE, std::sync::LazyLock};

pub const INTROSPECTABLE_XML: &str = r#"<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
</node>
"#;

static INTROSPECTABLE: LazyLock<InterfaceDescriptor> = LazyLock::new(|| InterfaceDescriptor {
    name: INTROSPECTABLE_INTERFACE.to_string(),
    methods: vec![MethodDescriptor {
        name: "Introspect".to_string(),
        in_args: vec![],
        out_args: vec![ArgDescriptor {
            name: "xml_data".to_string(),
            signature: "s".to_string(),
        }],
        annotations: vec![],
    }],
    properties: vec![],
    signals: vec![],
    annotations: vec![],
});

/// The descriptor of `org.freedesktop.DBus.Introspectable`.
pub fn introspectable() -> &'static InterfaceDescriptor {
    &INTROSPECTABLE
}
