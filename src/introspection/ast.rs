#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeDescriptor {
    pub name: Option<String>,
    pub interfaces: Vec<InterfaceDescriptor>,
    pub nodes: Vec<NodeDescriptor>,
    pub annotations: Vec<Annotation>,
}

impl NodeDescriptor {
    pub fn lookup_interface(&self, name: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
    pub properties: Vec<PropertyDescriptor>,
    pub signals: Vec<SignalDescriptor>,
    pub annotations: Vec<Annotation>,
}

impl InterfaceDescriptor {
    pub fn lookup_method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn lookup_property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn lookup_signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MethodDescriptor {
    pub name: String,
    pub in_args: Vec<ArgDescriptor>,
    pub out_args: Vec<ArgDescriptor>,
    pub annotations: Vec<Annotation>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SignalDescriptor {
    pub name: String,
    pub args: Vec<ArgDescriptor>,
    pub annotations: Vec<Annotation>,
}

/// A method or signal argument. Unnamed arguments are named `arg_<n>` after
/// their position.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArgDescriptor {
    pub name: String,
    pub signature: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub signature: String,
    pub access: PropertyAccess,
    pub annotations: Vec<Annotation>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}
