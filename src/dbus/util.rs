//! One-shot blocking helpers for code that does not need a proxy.

use {
    crate::dbus::{
        self, CallParams, Connection, DbusError, MethodCall, PROPERTIES_INTERFACE, Variant,
    },
    std::rc::Rc,
};

/// Calls a method and returns the values of the reply.
pub fn call(
    conn: &Rc<dyn Connection>,
    destination: &str,
    path: &str,
    interface: &str,
    member: &str,
    args: Vec<Variant>,
    timeout_ms: i32,
) -> Result<Vec<Variant>, DbusError> {
    let msg = MethodCall {
        destination: destination.to_string(),
        path: path.to_string(),
        interface: interface.to_string(),
        member: member.to_string(),
        body: match args.is_empty() {
            true => None,
            false => Some(Variant::Struct(args)),
        },
    };
    let params = CallParams {
        timeout_ms,
        ..Default::default()
    };
    match dbus::call_sync(conn, msg, &params)? {
        Some(body) => body.into_struct(),
        None => Ok(vec![]),
    }
}

/// Reads a single property through `org.freedesktop.DBus.Properties.Get`.
pub fn get_property(
    conn: &Rc<dyn Connection>,
    destination: &str,
    path: &str,
    interface: &str,
    name: &str,
) -> Result<Variant, DbusError> {
    let args = vec![
        Variant::String(interface.to_string()),
        Variant::String(name.to_string()),
    ];
    let reply = call(
        conn,
        destination,
        path,
        PROPERTIES_INTERFACE,
        "Get",
        args,
        dbus::TIMEOUT_INFINITE,
    )?;
    match <[Variant; 1]>::try_from(reply) {
        Ok([v]) => v.into_variant(),
        Err(_) => Err(DbusError::UnexpectedReply("(v)")),
    }
}
