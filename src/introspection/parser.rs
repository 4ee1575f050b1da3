use {
    crate::{
        dbus::{DbusError, DynamicType},
        introspection::ast::{
            Annotation, ArgDescriptor, Direction, InterfaceDescriptor, MethodDescriptor,
            NodeDescriptor, PropertyAccess, PropertyDescriptor, SignalDescriptor,
        },
    },
    quick_xml::{
        Reader,
        events::{
            BytesStart, Event,
            attributes::{AttrError, Attribute, Attributes},
        },
    },
    std::borrow::Cow,
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Could not read the next event")]
    ReadEvent(#[source] quick_xml::Error),
    #[error("The document does not contain a node element")]
    MissingNode,
    #[error("The root element is `{0}`, not `node`")]
    UnexpectedRoot(String),
    #[error("The document contains more than one root element")]
    MultipleRoots,
    #[error("Could not parse the node element")]
    Node(#[from] NodeError),
    #[error("Expected exactly one interface under root node, got child nodes")]
    ChildNodes,
    #[error("Expected exactly one interface under root node, got annotations for root node")]
    RootAnnotations,
    #[error("Expected exactly one interface under root node, got {0} interfaces")]
    InterfaceCount(usize),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("The document ends inside the element")]
    UnexpectedEof,
    #[error("Could not parse an attribute")]
    Attribute(#[from] AttributeError),
    #[error("Could not read the next event")]
    ReadEvent(#[from] quick_xml::Error),
    #[error("Could not parse an interface element")]
    Interface(#[from] InterfaceError),
    #[error("Could not parse a child node")]
    Node(#[source] Box<NodeError>),
    #[error("Nodes are nested more than {} levels deep", MAX_NODE_DEPTH)]
    TooDeep,
    #[error("Could not parse an annotation element")]
    Annotation(#[from] AnnotationError),
}

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("The document ends inside the element")]
    UnexpectedEof,
    #[error("Interface has no name")]
    MissingName,
    #[error("Could not parse an attribute")]
    Attribute(#[from] AttributeError),
    #[error("Could not read the next event")]
    ReadEvent(#[from] quick_xml::Error),
    #[error("Could not parse method {0}")]
    Method(String, #[source] MemberError),
    #[error("Could not parse signal {0}")]
    Signal(String, #[source] MemberError),
    #[error("Could not parse a property element")]
    Property(#[from] PropertyError),
    #[error("Could not parse an annotation element")]
    Annotation(#[from] AnnotationError),
}

#[derive(Debug, Error)]
pub enum MemberError {
    #[error("The document ends inside the element")]
    UnexpectedEof,
    #[error("Member has no name")]
    MissingName,
    #[error("Could not parse an attribute")]
    Attribute(#[from] AttributeError),
    #[error("Could not read the next event")]
    ReadEvent(#[from] quick_xml::Error),
    #[error("Could not parse an argument element")]
    Arg(#[from] ArgError),
    #[error("Could not parse an annotation element")]
    Annotation(#[from] AnnotationError),
}

#[derive(Debug, Error)]
pub enum ArgError {
    #[error("Argument has no type")]
    MissingType,
    #[error("Argument has an invalid type `{0}`")]
    InvalidType(String, #[source] DbusError),
    #[error("Unknown argument direction {}", .0)]
    UnknownDirection(String),
    #[error("Could not parse an attribute")]
    Attribute(#[from] AttributeError),
    #[error("Could not read the next event")]
    ReadEvent(#[from] quick_xml::Error),
}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("The document ends inside the element")]
    UnexpectedEof,
    #[error("Property has no name")]
    MissingName,
    #[error("Property has no type")]
    MissingType,
    #[error("Property has no access")]
    MissingAccess,
    #[error("Property has an invalid type `{0}`")]
    InvalidType(String, #[source] DbusError),
    #[error("Unknown property access {}", .0)]
    UnknownAccess(String),
    #[error("Could not parse an attribute")]
    Attribute(#[from] AttributeError),
    #[error("Could not read the next event")]
    ReadEvent(#[from] quick_xml::Error),
    #[error("Could not parse an annotation element")]
    Annotation(#[from] AnnotationError),
}

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("Annotation has no name")]
    MissingName,
    #[error("Annotation has no value")]
    MissingValue,
    #[error("Could not parse an attribute")]
    Attribute(#[from] AttributeError),
    #[error("Could not read the next event")]
    ReadEvent(#[from] quick_xml::Error),
}

#[derive(Debug, Error)]
pub enum AttributeError {
    #[error("quick_xml returned an error")]
    QuickXml(#[from] AttrError),
    #[error("Could not decode the value as UTF-8")]
    DecodeUtf8(#[from] quick_xml::Error),
}

type XmlReader<'a> = Reader<&'a [u8]>;

/// Parses any introspection document.
pub fn parse_node(xml: &str) -> Result<NodeDescriptor, SchemaError> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    let mut root = None;
    loop {
        let event = reader.read_event().map_err(SchemaError::ReadEvent)?;
        let (start, empty) = match event {
            Event::Start(s) => (s, false),
            Event::Empty(s) => (s, true),
            Event::Eof => break,
            _ => continue,
        };
        if root.is_some() {
            return Err(SchemaError::MultipleRoots);
        }
        match start.local_name().as_ref() {
            b"node" => root = Some(parse_node_element(&mut reader, start.attributes(), empty, 0)?),
            n => {
                let name = String::from_utf8_lossy(n).into_owned();
                return Err(SchemaError::UnexpectedRoot(name));
            }
        }
    }
    root.ok_or(SchemaError::MissingNode)
}

/// Parses a document that describes exactly one interface.
pub fn load(xml: &str) -> Result<InterfaceDescriptor, SchemaError> {
    let node = parse_node(xml)?;
    if !node.nodes.is_empty() {
        return Err(SchemaError::ChildNodes);
    }
    if !node.annotations.is_empty() {
        return Err(SchemaError::RootAnnotations);
    }
    let n = node.interfaces.len();
    match <[InterfaceDescriptor; 1]>::try_from(node.interfaces) {
        Ok([interface]) => Ok(interface),
        Err(_) => Err(SchemaError::InterfaceCount(n)),
    }
}

macro_rules! parse_attr {
    ($attr:expr) => {
        match $attr {
            Ok(ref attr) => parse_attr(attr),
            Err(e) => return Err(AttributeError::QuickXml(e).into()),
        }
    };
}

fn parse_attr<'a>(attr: &'a Attribute) -> Result<(&'a [u8], Cow<'a, str>), AttributeError> {
    let name = attr.key.local_name().into_inner();
    let value = attr.unescape_value().map_err(AttributeError::DecodeUtf8)?;
    Ok((name, value))
}

fn skip(reader: &mut XmlReader, start: &BytesStart, empty: bool) -> Result<(), quick_xml::Error> {
    if !empty {
        reader.read_to_end(start.name())?;
    }
    Ok(())
}

const MAX_NODE_DEPTH: usize = 64;

fn parse_node_element(
    reader: &mut XmlReader,
    attributes: Attributes,
    empty: bool,
    depth: usize,
) -> Result<NodeDescriptor, NodeError> {
    if depth > MAX_NODE_DEPTH {
        return Err(NodeError::TooDeep);
    }
    let mut node = NodeDescriptor::default();
    for attr in attributes {
        let (n, value) = parse_attr!(attr)?;
        match n {
            b"name" => node.name = Some(value.into_owned()),
            _ => continue,
        }
    }
    if !empty {
        loop {
            let event = reader.read_event().map_err(NodeError::ReadEvent)?;
            let (start, empty) = match event {
                Event::Start(s) => (s, false),
                Event::End(_) => break,
                Event::Empty(s) => (s, true),
                Event::Eof => return Err(NodeError::UnexpectedEof),
                _ => continue,
            };
            match start.local_name().as_ref() {
                b"interface" => node.interfaces.push(parse_interface(
                    reader,
                    start.attributes(),
                    empty,
                )?),
                b"node" => node.nodes.push(
                    parse_node_element(reader, start.attributes(), empty, depth + 1)
                        .map_err(|e| NodeError::Node(Box::new(e)))?,
                ),
                b"annotation" => {
                    node.annotations
                        .push(parse_annotation(reader, start.attributes(), empty)?)
                }
                _ => skip(reader, &start, empty)?,
            }
        }
    }
    Ok(node)
}

fn parse_interface(
    reader: &mut XmlReader,
    attributes: Attributes,
    empty: bool,
) -> Result<InterfaceDescriptor, InterfaceError> {
    let mut name = None;
    for attr in attributes {
        let (n, value) = parse_attr!(attr)?;
        match n {
            b"name" => name = Some(value.into_owned()),
            _ => continue,
        }
    }
    let mut methods = vec![];
    let mut properties = vec![];
    let mut signals = vec![];
    let mut annotations = vec![];
    if !empty {
        loop {
            let event = reader.read_event().map_err(InterfaceError::ReadEvent)?;
            let (start, empty) = match event {
                Event::Start(s) => (s, false),
                Event::End(_) => break,
                Event::Empty(s) => (s, true),
                Event::Eof => return Err(InterfaceError::UnexpectedEof),
                _ => continue,
            };
            match start.local_name().as_ref() {
                b"method" => {
                    let member = parse_member(reader, start.attributes(), empty, true);
                    let member = member.map_err(|(n, e)| InterfaceError::Method(n, e))?;
                    methods.push(MethodDescriptor {
                        name: member.name,
                        in_args: member.in_args,
                        out_args: member.out_args,
                        annotations: member.annotations,
                    });
                }
                b"signal" => {
                    let member = parse_member(reader, start.attributes(), empty, false);
                    let member = member.map_err(|(n, e)| InterfaceError::Signal(n, e))?;
                    signals.push(SignalDescriptor {
                        name: member.name,
                        args: member.out_args,
                        annotations: member.annotations,
                    });
                }
                b"property" => {
                    properties.push(parse_property(reader, start.attributes(), empty)?)
                }
                b"annotation" => {
                    annotations.push(parse_annotation(reader, start.attributes(), empty)?)
                }
                _ => skip(reader, &start, empty)?,
            }
        }
    }
    Ok(InterfaceDescriptor {
        name: name.ok_or(InterfaceError::MissingName)?,
        methods,
        properties,
        signals,
        annotations,
    })
}

struct Member {
    name: String,
    in_args: Vec<ArgDescriptor>,
    out_args: Vec<ArgDescriptor>,
    annotations: Vec<Annotation>,
}

/// Parses a method or a signal. Errors carry the member name if it is known.
fn parse_member(
    reader: &mut XmlReader,
    attributes: Attributes,
    empty: bool,
    method: bool,
) -> Result<Member, (String, MemberError)> {
    let mut name = None;
    let res = parse_member_(reader, attributes, empty, method, &mut name);
    res.map_err(|e| (name.unwrap_or_default(), e))
}

fn parse_member_(
    reader: &mut XmlReader,
    attributes: Attributes,
    empty: bool,
    method: bool,
    name: &mut Option<String>,
) -> Result<Member, MemberError> {
    for attr in attributes {
        let (n, value) = parse_attr!(attr)?;
        match n {
            b"name" => *name = Some(value.into_owned()),
            _ => continue,
        }
    }
    let mut in_args = vec![];
    let mut out_args = vec![];
    let mut annotations = vec![];
    if !empty {
        let mut pos = 0;
        loop {
            let event = reader.read_event().map_err(MemberError::ReadEvent)?;
            let (start, empty) = match event {
                Event::Start(s) => (s, false),
                Event::End(_) => break,
                Event::Empty(s) => (s, true),
                Event::Eof => return Err(MemberError::UnexpectedEof),
                _ => continue,
            };
            match start.local_name().as_ref() {
                b"arg" => {
                    let default = match method {
                        true => Direction::In,
                        false => Direction::Out,
                    };
                    let (arg, direction) =
                        parse_arg(reader, start.attributes(), empty, pos, default)?;
                    pos += 1;
                    match direction {
                        Direction::In => in_args.push(arg),
                        Direction::Out => out_args.push(arg),
                    }
                }
                b"annotation" => {
                    annotations.push(parse_annotation(reader, start.attributes(), empty)?)
                }
                _ => skip(reader, &start, empty)?,
            }
        }
    }
    Ok(Member {
        name: name.clone().ok_or(MemberError::MissingName)?,
        in_args,
        out_args,
        annotations,
    })
}

fn parse_arg(
    reader: &mut XmlReader,
    attributes: Attributes,
    empty: bool,
    pos: usize,
    default_direction: Direction,
) -> Result<(ArgDescriptor, Direction), ArgError> {
    let mut name = None;
    let mut ty = None;
    let mut direction = default_direction;
    for attr in attributes {
        let (n, value) = parse_attr!(attr)?;
        match n {
            b"name" => name = Some(value.into_owned()),
            b"type" => ty = Some(value.into_owned()),
            b"direction" => match value.as_ref() {
                "in" => direction = Direction::In,
                "out" => direction = Direction::Out,
                _ => return Err(ArgError::UnknownDirection(value.into_owned())),
            },
            _ => continue,
        }
    }
    if !empty {
        reader.read_to_end(quick_xml::name::QName(b"arg"))?;
    }
    let ty = ty.ok_or(ArgError::MissingType)?;
    if let Err(e) = DynamicType::parse_single(&ty) {
        return Err(ArgError::InvalidType(ty, e));
    }
    let arg = ArgDescriptor {
        name: name.unwrap_or_else(|| format!("arg_{}", pos)),
        signature: ty,
    };
    Ok((arg, direction))
}

fn parse_property(
    reader: &mut XmlReader,
    attributes: Attributes,
    empty: bool,
) -> Result<PropertyDescriptor, PropertyError> {
    let mut name = None;
    let mut ty = None;
    let mut access = None;
    for attr in attributes {
        let (n, value) = parse_attr!(attr)?;
        match n {
            b"name" => name = Some(value.into_owned()),
            b"type" => ty = Some(value.into_owned()),
            b"access" => match value.as_ref() {
                "read" => access = Some(PropertyAccess::Read),
                "write" => access = Some(PropertyAccess::Write),
                "readwrite" => access = Some(PropertyAccess::ReadWrite),
                _ => return Err(PropertyError::UnknownAccess(value.into_owned())),
            },
            _ => continue,
        }
    }
    let mut annotations = vec![];
    if !empty {
        loop {
            let event = reader.read_event().map_err(PropertyError::ReadEvent)?;
            let (start, empty) = match event {
                Event::Start(s) => (s, false),
                Event::End(_) => break,
                Event::Empty(s) => (s, true),
                Event::Eof => return Err(PropertyError::UnexpectedEof),
                _ => continue,
            };
            match start.local_name().as_ref() {
                b"annotation" => {
                    annotations.push(parse_annotation(reader, start.attributes(), empty)?)
                }
                _ => skip(reader, &start, empty)?,
            }
        }
    }
    let ty = ty.ok_or(PropertyError::MissingType)?;
    if let Err(e) = DynamicType::parse_single(&ty) {
        return Err(PropertyError::InvalidType(ty, e));
    }
    Ok(PropertyDescriptor {
        name: name.ok_or(PropertyError::MissingName)?,
        signature: ty,
        access: access.ok_or(PropertyError::MissingAccess)?,
        annotations,
    })
}

fn parse_annotation(
    reader: &mut XmlReader,
    attributes: Attributes,
    empty: bool,
) -> Result<Annotation, AnnotationError> {
    let mut name = None;
    let mut value = None;
    for attr in attributes {
        let (n, v) = parse_attr!(attr)?;
        match n {
            b"name" => name = Some(v.into_owned()),
            b"value" => value = Some(v.into_owned()),
            _ => continue,
        }
    }
    if !empty {
        reader.read_to_end(quick_xml::name::QName(b"annotation"))?;
    }
    Ok(Annotation {
        name: name.ok_or(AnnotationError::MissingName)?,
        value: value.ok_or(AnnotationError::MissingValue)?,
    })
}
