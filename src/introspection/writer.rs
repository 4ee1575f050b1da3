use {
    crate::introspection::ast::{
        Annotation, ArgDescriptor, InterfaceDescriptor, NodeDescriptor, PropertyDescriptor,
    },
    quick_xml::{
        Writer,
        events::{BytesDecl, Event},
    },
    std::io,
};

type XmlWriter = Writer<Vec<u8>>;

impl NodeDescriptor {
    pub fn to_xml(&self) -> io::Result<String> {
        let mut writer = Writer::new_with_indent(vec![], b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        write_node(&mut writer, self)?;
        String::from_utf8(writer.into_inner()).map_err(io::Error::other)
    }
}

impl InterfaceDescriptor {
    /// Writes a document with this interface as the only child of the root
    /// node.
    pub fn to_xml(&self) -> io::Result<String> {
        let node = NodeDescriptor {
            interfaces: vec![self.clone()],
            ..Default::default()
        };
        node.to_xml()
    }
}

fn write_node(w: &mut XmlWriter, node: &NodeDescriptor) -> io::Result<()> {
    let mut el = w.create_element("node");
    if let Some(name) = &node.name {
        el = el.with_attribute(("name", name.as_str()));
    }
    if node.interfaces.is_empty() && node.nodes.is_empty() && node.annotations.is_empty() {
        el.write_empty()?;
        return Ok(());
    }
    el.write_inner_content(|w| {
        write_annotations(w, &node.annotations)?;
        for interface in &node.interfaces {
            write_interface(w, interface)?;
        }
        for child in &node.nodes {
            write_node(w, child)?;
        }
        Ok(())
    })?;
    Ok(())
}

fn write_interface(w: &mut XmlWriter, interface: &InterfaceDescriptor) -> io::Result<()> {
    w.create_element("interface")
        .with_attribute(("name", interface.name.as_str()))
        .write_inner_content(|w| {
            for method in &interface.methods {
                w.create_element("method")
                    .with_attribute(("name", method.name.as_str()))
                    .write_inner_content(|w| {
                        write_args(w, &method.in_args, Some("in"))?;
                        write_args(w, &method.out_args, Some("out"))?;
                        write_annotations(w, &method.annotations)
                    })?;
            }
            for signal in &interface.signals {
                w.create_element("signal")
                    .with_attribute(("name", signal.name.as_str()))
                    .write_inner_content(|w| {
                        write_args(w, &signal.args, None)?;
                        write_annotations(w, &signal.annotations)
                    })?;
            }
            for property in &interface.properties {
                write_property(w, property)?;
            }
            write_annotations(w, &interface.annotations)
        })?;
    Ok(())
}

fn write_args(
    w: &mut XmlWriter,
    args: &[ArgDescriptor],
    direction: Option<&str>,
) -> io::Result<()> {
    for arg in args {
        let mut el = w
            .create_element("arg")
            .with_attribute(("name", arg.name.as_str()))
            .with_attribute(("type", arg.signature.as_str()));
        if let Some(direction) = direction {
            el = el.with_attribute(("direction", direction));
        }
        el.write_empty()?;
    }
    Ok(())
}

fn write_property(w: &mut XmlWriter, property: &PropertyDescriptor) -> io::Result<()> {
    let el = w
        .create_element("property")
        .with_attribute(("name", property.name.as_str()))
        .with_attribute(("type", property.signature.as_str()))
        .with_attribute(("access", property.access.as_str()));
    if property.annotations.is_empty() {
        el.write_empty()?;
    } else {
        el.write_inner_content(|w| write_annotations(w, &property.annotations))?;
    }
    Ok(())
}

fn write_annotations(w: &mut XmlWriter, annotations: &[Annotation]) -> io::Result<()> {
    for annotation in annotations {
        w.create_element("annotation")
            .with_attribute(("name", annotation.name.as_str()))
            .with_attribute(("value", annotation.value.as_str()))
            .write_empty()?;
    }
    Ok(())
}
