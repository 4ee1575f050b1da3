//! Blocking waits for remote state.
//!
//! Every wait runs its own [`AsyncEngine`] until the awaited state is reached,
//! an error is captured or the wall-clock budget of the wait is exhausted. All
//! tasks, timers, watches and subscriptions of the wait are gone when the
//! function returns.

#[cfg(test)]
mod tests;

use {
    crate::{
        async_engine::AsyncEngine,
        cancellable::CancelOnDrop,
        dbus::{
            CallParams, Connection, Connector, DbusError, NameWatch, NameWatcher,
            registry::Value,
        },
        introspection::{self, SchemaError},
        proxy::{Proxy, ProxyError, ProxyType},
        utils::{asyncevent::AsyncEvent, errorfmt::ErrorFmt, queue::AsyncQueue},
    },
    futures_util::future::{Either, select},
    std::{
        cell::{Cell, RefCell},
        future::Future,
        pin::pin,
        rc::Rc,
        time::{Duration, Instant},
    },
    thiserror::Error,
};

/// The delay between two attempts to find a missing interface or to connect.
pub const RETRY_INTERVAL_MS: u64 = 100;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitState {
    Idle,
    WatchingName,
    ResolvingIntrospectable,
    Introspecting,
    MatchingInterface,
    Ready,
    Failed,
    TimedOut,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("Could not parse the introspection data")]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Call(DbusError),
    #[error(transparent)]
    Proxy(ProxyError),
    #[error("The proxy type is for interface {actual} but {expected} was requested")]
    ProxyTypeMismatch { expected: String, actual: String },
    #[error("The operation was cancelled")]
    Cancelled,
    #[error("{}", ErrorFmt(&**error))]
    WithContext {
        error: Box<WaitError>,
        #[source]
        context: Box<WaitError>,
    },
}

impl From<DbusError> for WaitError {
    fn from(e: DbusError) -> Self {
        match e {
            DbusError::Cancelled => WaitError::Cancelled,
            e => WaitError::Call(e),
        }
    }
}

impl From<ProxyError> for WaitError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Dbus(e) => e.into(),
            e => WaitError::Proxy(e),
        }
    }
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        match self {
            WaitError::Timeout(_) => true,
            WaitError::WithContext { error, .. } => error.is_timeout(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            WaitError::Cancelled => true,
            WaitError::WithContext { error, .. } => error.is_cancelled(),
            _ => false,
        }
    }

    /// Records `earlier` as the innermost context of this error.
    pub fn with_context(self, earlier: WaitError) -> WaitError {
        match self {
            WaitError::WithContext { error, context } => WaitError::WithContext {
                error,
                context: Box::new(context.with_context(earlier)),
            },
            error => WaitError::WithContext {
                error: Box::new(error),
                context: Box::new(earlier),
            },
        }
    }
}

#[derive(Debug, Error)]
#[error("Could not acquire interface {interface} of {destination} at {path}")]
pub struct InterfaceWaitError {
    pub destination: String,
    pub path: String,
    pub interface: String,
    #[source]
    pub error: WaitError,
}

impl InterfaceWaitError {
    pub fn is_timeout(&self) -> bool {
        self.error.is_timeout()
    }
}

/// The single error of a wait. Storing an error stops the wait.
#[derive(Default)]
pub struct ErrorSlot {
    error: RefCell<Option<WaitError>>,
}

impl ErrorSlot {
    /// Stores an error. Cancellations are dropped. If an error is already
    /// stored, it becomes the context of the new one.
    pub fn capture(&self, e: WaitError) {
        if e.is_cancelled() {
            log::debug!("Ignoring cancellation");
            return;
        }
        let mut slot = self.error.borrow_mut();
        let e = match slot.take() {
            Some(prev) => e.with_context(prev),
            None => e,
        };
        *slot = Some(e);
    }

    pub fn is_set(&self) -> bool {
        self.error.borrow().is_some()
    }

    pub fn take(&self) -> Option<WaitError> {
        self.error.borrow_mut().take()
    }
}

/// The engine, the error slot and the timeout of one wait.
pub struct WaitContext {
    eng: Rc<AsyncEngine>,
    conn: Option<Rc<dyn Connection>>,
    errors: Rc<ErrorSlot>,
    timeout_ms: u64,
}

impl WaitContext {
    pub fn new(conn: Option<&Rc<dyn Connection>>, timeout_ms: u64) -> Self {
        Self {
            eng: AsyncEngine::new(),
            conn: conn.cloned(),
            errors: Default::default(),
            timeout_ms,
        }
    }

    pub fn engine(&self) -> &Rc<AsyncEngine> {
        &self.eng
    }

    pub fn errors(&self) -> &Rc<ErrorSlot> {
        &self.errors
    }

    /// Runs `f` until it completes, an error is captured or the timeout
    /// expires. Captured errors take precedence over the result of `f`.
    pub fn run<T, F>(self, f: F) -> Result<T, WaitError>
    where
        T: 'static,
        F: Future<Output = Result<T, WaitError>> + 'static,
    {
        let _default = self.eng.push_thread_default();
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        let timed_out = Rc::new(Cell::new(false));
        let result = Rc::new(RefCell::new(None));
        let timer = {
            let timeout = self.eng.timeout_at(deadline);
            let timed_out = timed_out.clone();
            self.eng.spawn(async move {
                timeout.await;
                timed_out.set(true);
            })
        };
        let main = {
            let result = result.clone();
            let errors = self.errors.clone();
            self.eng.spawn(async move {
                match f.await {
                    Ok(v) => *result.borrow_mut() = Some(v),
                    Err(e) => errors.capture(e),
                }
            })
        };
        while !timed_out.get() && !self.errors.is_set() && result.borrow().is_none() {
            if let Some(conn) = &self.conn {
                conn.dispatch();
            }
            let next = self.conn.as_ref().and_then(|c| c.next_dispatch());
            self.eng.iterate(next);
        }
        drop(main);
        drop(timer);
        self.eng.clear();
        if let Some(e) = self.errors.take() {
            return Err(e);
        }
        let result = result.borrow_mut().take();
        match result {
            Some(v) => Ok(v),
            None => Err(WaitError::Timeout(self.timeout_ms)),
        }
    }
}

fn call_timeout(timeout_ms: u64) -> i32 {
    i32::try_from(timeout_ms).unwrap_or(i32::MAX)
}

enum NameEvent {
    Appeared(String),
    Vanished,
}

struct Discovery {
    conn: Rc<dyn Connection>,
    destination: String,
    path: String,
    interface: String,
    proxy_type: Option<Rc<ProxyType>>,
    timeout_ms: u64,
    state: Cell<WaitState>,
    events: AsyncQueue<NameEvent>,
    last_error: RefCell<Option<WaitError>>,
}

impl NameWatcher for Discovery {
    fn appeared(&self, name: &str, owner: &str) {
        log::debug!("{} is owned by {}", name, owner);
        self.events.push(NameEvent::Appeared(owner.to_string()));
    }

    fn vanished(&self, name: &str) {
        log::debug!("{} has no owner", name);
        self.events.push(NameEvent::Vanished);
    }
}

impl Discovery {
    fn set_state(&self, state: WaitState) {
        let prev = self.state.replace(state);
        if prev != state {
            log::debug!(
                "{} at {}:{}: {:?} -> {:?}",
                self.interface,
                self.destination,
                self.path,
                prev,
                state,
            );
        }
    }

    async fn run(self: Rc<Self>, eng: Rc<AsyncEngine>) -> Result<Rc<Proxy>, WaitError> {
        let _watch = NameWatch::new(&self.conn, &self.destination, self.clone());
        self.set_state(WaitState::WatchingName);
        loop {
            let owner = loop {
                if let NameEvent::Appeared(owner) = self.events.pop().await {
                    break owner;
                }
            };
            log::debug!("Resolving {} through {}", self.interface, owner);
            let resolve = eng.spawn(self.clone().resolve(eng.clone()));
            let vanished = pin!(self.vanished());
            match select(resolve, vanished).await {
                Either::Left((Ok(proxy), _)) => return Ok(proxy),
                Either::Left((Err(e), _)) => {
                    if !self.events.any(|e| matches!(e, NameEvent::Vanished)) {
                        return Err(e);
                    }
                    log::debug!(
                        "{} vanished while resolving {}: {}",
                        self.destination,
                        self.interface,
                        ErrorFmt(&e),
                    );
                    *self.last_error.borrow_mut() = Some(e);
                }
                Either::Right((_, resolve)) => {
                    drop(resolve);
                    log::debug!("{} vanished, waiting for a new owner", self.destination);
                }
            }
            self.set_state(WaitState::WatchingName);
        }
    }

    async fn vanished(&self) {
        loop {
            if let NameEvent::Vanished = self.events.pop().await {
                return;
            }
        }
    }

    async fn resolve(self: Rc<Self>, eng: Rc<AsyncEngine>) -> Result<Rc<Proxy>, WaitError> {
        let scope = CancelOnDrop::new();
        let cancellable = scope.cancellable();
        self.set_state(WaitState::ResolvingIntrospectable);
        let introspectable = Proxy::new(
            &self.conn,
            &ProxyType::introspectable(),
            &self.destination,
            &self.path,
        );
        introspectable.init(cancellable).await?;
        log::info!("Created proxy for {}", introspectable);
        loop {
            self.set_state(WaitState::Introspecting);
            let params = CallParams {
                timeout_ms: call_timeout(self.timeout_ms),
                cancellable: Some(cancellable.clone()),
                ..Default::default()
            };
            let reply = introspectable
                .call_future("Introspect", &[], params)
                .await?;
            let Some(Value::Str(xml)) = reply.into_single() else {
                return Err(DbusError::UnexpectedReply("(s)").into());
            };
            self.set_state(WaitState::MatchingInterface);
            let node = introspection::parse_node(&xml)?;
            if let Some(desc) = node.lookup_interface(&self.interface) {
                let ty = match &self.proxy_type {
                    Some(ty) => ty.clone(),
                    None => ProxyType::generate(desc),
                };
                let proxy = Proxy::new(&self.conn, &ty, &self.destination, &self.path);
                proxy.init(cancellable).await?;
                log::info!("Created proxy for {}", proxy);
                return Ok(proxy);
            }
            log::debug!(
                "{} does not expose {} at {} yet",
                self.destination,
                self.interface,
                self.path,
            );
            eng.timeout(RETRY_INTERVAL_MS).await;
        }
    }
}

/// Waits until `destination` exports `interface` at `path` and returns a
/// proxy for it.
///
/// The proxy uses `proxy_type` if given, otherwise a type generated from the
/// introspection data of the remote object.
pub fn wait_for_interface(
    conn: &Rc<dyn Connection>,
    destination: &str,
    path: &str,
    interface: &str,
    timeout_ms: u64,
    proxy_type: Option<&Rc<ProxyType>>,
) -> Result<Rc<Proxy>, InterfaceWaitError> {
    let error = |error: WaitError| InterfaceWaitError {
        destination: destination.to_string(),
        path: path.to_string(),
        interface: interface.to_string(),
        error,
    };
    if let Some(ty) = proxy_type {
        if ty.interface_name() != interface {
            return Err(error(WaitError::ProxyTypeMismatch {
                expected: interface.to_string(),
                actual: ty.interface_name().to_string(),
            }));
        }
    }
    let discovery = Rc::new(Discovery {
        conn: conn.clone(),
        destination: destination.to_string(),
        path: path.to_string(),
        interface: interface.to_string(),
        proxy_type: proxy_type.cloned(),
        timeout_ms,
        state: Cell::new(WaitState::Idle),
        events: Default::default(),
        last_error: Default::default(),
    });
    let cx = WaitContext::new(Some(conn), timeout_ms);
    let eng = cx.engine().clone();
    let res = cx.run(discovery.clone().run(eng));
    match res {
        Ok(proxy) => {
            discovery.set_state(WaitState::Ready);
            Ok(proxy)
        }
        Err(e) if e.is_timeout() => {
            discovery.set_state(WaitState::TimedOut);
            let e = match discovery.last_error.borrow_mut().take() {
                Some(last) => e.with_context(last),
                None => e,
            };
            Err(error(e))
        }
        Err(e) => {
            discovery.set_state(WaitState::Failed);
            Err(error(e))
        }
    }
}

/// Waits until the cached value of property `name` equals `expected`. Every
/// change notification is compared when it arrives, so a value that is
/// replaced within the same dispatch still counts.
pub fn wait_for_property(
    proxy: &Rc<Proxy>,
    name: &str,
    expected: &Value,
    timeout_ms: u64,
) -> Result<(), WaitError> {
    let cx = WaitContext::new(Some(proxy.connection()), timeout_ms);
    let matched = Rc::new(AsyncEvent::default());
    let _listener = proxy.connect_notify(name, {
        let matched = matched.clone();
        let errors = cx.errors().clone();
        let expected = expected.clone();
        move |proxy, name| match proxy.property(name) {
            Ok(Some(v)) if v == expected => matched.trigger(),
            Ok(Some(v)) => log::debug!("{} of {} changed to {}", name, proxy, v),
            Ok(None) => log::debug!("{} of {} is unknown", name, proxy),
            Err(e) => errors.capture(e.into()),
        }
    })?;
    if proxy.property(name)?.as_ref() == Some(expected) {
        return Ok(());
    }
    log::debug!("Waiting for {} of {} to become {}", name, proxy, expected);
    cx.run(await_match(matched))
}

async fn await_match(matched: Rc<AsyncEvent>) -> Result<(), WaitError> {
    matched.triggered().await;
    Ok(())
}

/// Connects to `address`, retrying as long as the attempts fail with
/// transient errors.
pub fn wait_for_connection(
    connector: &Rc<dyn Connector>,
    address: &str,
    timeout_ms: u64,
) -> Result<Rc<dyn Connection>, WaitError> {
    let cx = WaitContext::new(None, timeout_ms);
    let eng = cx.engine().clone();
    cx.run(connect(eng, connector.clone(), address.to_string()))
}

async fn connect(
    eng: Rc<AsyncEngine>,
    connector: Rc<dyn Connector>,
    address: String,
) -> Result<Rc<dyn Connection>, WaitError> {
    loop {
        log::debug!("Trying to connect to {}", address);
        match connector.connect(&address).await {
            Ok(conn) => {
                log::info!("Connected to {}", address);
                return Ok(conn);
            }
            Err(e) if e.is_transient() => {
                log::debug!(
                    "Could not connect to {}, trying again: {}",
                    address,
                    ErrorFmt(&e)
                );
                eng.timeout(RETRY_INTERVAL_MS).await;
            }
            Err(e) => {
                log::error!("Could not connect to {}: {}", address, ErrorFmt(&e));
                return Err(e.into());
            }
        }
    }
}
