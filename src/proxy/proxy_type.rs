use {
    crate::{
        dbus::registry::{self, TypeInfo, ValueSpec},
        introspection::{self, ArgDescriptor, InterfaceDescriptor, PropertyAccess, SchemaError},
        proxy::method::ProxyMethod,
    },
    ahash::AHashMap,
    indexmap::IndexMap,
    std::{cell::RefCell, fmt::Write, rc::Rc},
};

thread_local! {
    static TYPES: RefCell<AHashMap<String, Vec<Rc<ProxyType>>>> = RefCell::default();
}

/// A typed argument of a method or signal.
pub struct Param {
    pub name: String,
    pub signature: String,
    pub info: &'static TypeInfo,
}

impl Param {
    pub(super) fn new(arg: &ArgDescriptor) -> Self {
        Self {
            name: arg.name.clone(),
            signature: arg.signature.clone(),
            info: registry::info_for(&arg.signature),
        }
    }
}

pub struct PropertySpec {
    pub name: String,
    pub signature: String,
    pub info: &'static TypeInfo,
    pub access: PropertyAccess,
}

impl PropertySpec {
    pub fn spec(&self) -> &ValueSpec {
        &self.info.spec
    }
}

pub struct SignalSpec {
    pub name: String,
    pub args: Vec<Param>,
}

/// The typed surface generated from one interface descriptor.
pub struct ProxyType {
    descriptor: InterfaceDescriptor,
    methods: IndexMap<String, ProxyMethod>,
    properties: IndexMap<String, PropertySpec>,
    signals: IndexMap<String, SignalSpec>,
}

impl ProxyType {
    /// Returns the proxy type of `descriptor`. Equal descriptors share one
    /// type per thread.
    pub fn generate(descriptor: &InterfaceDescriptor) -> Rc<ProxyType> {
        TYPES.with(|types| {
            let mut types = types.borrow_mut();
            let candidates = types.entry(descriptor.name.clone()).or_default();
            if let Some(ty) = candidates.iter().find(|t| t.descriptor == *descriptor) {
                return ty.clone();
            }
            log::debug!("Generating proxy type for {}", descriptor.name);
            let ty = Rc::new(Self::build(descriptor));
            candidates.push(ty.clone());
            ty
        })
    }

    pub fn from_xml(xml: &str) -> Result<Rc<ProxyType>, SchemaError> {
        let descriptor = introspection::load(xml)?;
        Ok(Self::generate(&descriptor))
    }

    pub fn introspectable() -> Rc<ProxyType> {
        Self::generate(introspection::introspectable())
    }

    fn build(descriptor: &InterfaceDescriptor) -> Self {
        let methods = descriptor
            .methods
            .iter()
            .map(|m| (m.name.clone(), ProxyMethod::new(&descriptor.name, m)))
            .collect();
        let properties = descriptor
            .properties
            .iter()
            .map(|p| {
                let spec = PropertySpec {
                    name: p.name.clone(),
                    signature: p.signature.clone(),
                    info: registry::info_for(&p.signature),
                    access: p.access,
                };
                (p.name.clone(), spec)
            })
            .collect();
        let signals = descriptor
            .signals
            .iter()
            .map(|s| {
                let spec = SignalSpec {
                    name: s.name.clone(),
                    args: s.args.iter().map(Param::new).collect(),
                };
                (s.name.clone(), spec)
            })
            .collect();
        Self {
            descriptor: descriptor.clone(),
            methods,
            properties,
            signals,
        }
    }

    pub fn interface_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    pub fn method(&self, name: &str) -> Option<&ProxyMethod> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &ProxyMethod> {
        self.methods.values()
    }

    pub fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertySpec> {
        self.properties.values()
    }

    pub fn signal(&self, name: &str) -> Option<&SignalSpec> {
        self.signals.get(name)
    }

    pub fn signals(&self) -> impl Iterator<Item = &SignalSpec> {
        self.signals.values()
    }

    /// A human readable listing of the generated surface.
    pub fn describe(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "interface {}", self.interface_name());
        for method in self.methods() {
            let _ = writeln!(s, "  method {}", method.signature());
        }
        for prop in self.properties() {
            let _ = write!(
                s,
                "  property {}: {} ({})",
                prop.name,
                prop.signature,
                prop.access.as_str()
            );
            match prop.spec() {
                ValueSpec::None => {}
                spec => {
                    let _ = write!(s, " {}", spec);
                }
            }
            s.push('\n');
        }
        for signal in self.signals() {
            let args: Vec<_> = signal
                .args
                .iter()
                .map(|a| format!("{}: {}", a.name, a.signature))
                .collect();
            let _ = writeln!(s, "  signal {}({})", signal.name, args.join(", "));
        }
        s
    }
}
