//! The session orchestrator.
//!
//! A [`Session`] owns the connection status, the active [`Connection`], the
//! listener registries and the per-attempt negotiation state. Elements read
//! off the stream come back through `ConnectionLink`; every read, write or
//! negotiation failure funnels through `notify_exception`, the only place
//! that moves a live connection to `Disconnected`.

mod listeners;
mod status;
#[cfg(test)]
mod tests;

pub use listeners::{invoke_isolated, ListenerId, ListenerRegistry, StanzaListener, StatusListener};
pub use status::{ConnectionStatus, StatusEvent, StatusMachine};

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, Credentials, SaslAuthenticator};
use crate::backoff::{BackoffStrategy, TruncatedBinaryExponentialBackoff};
use crate::config::{SecurityMode, SessionConfig};
use crate::correlator::{iq_response, StanzaCorrelator};
use crate::error::{Error, LoginError, Result};
use crate::extension::{ExtensionFactory, ExtensionRegistry};
use crate::jid::Jid;
use crate::negotiation::{
    FeatureNegotiator, NegotiationContext, NegotiationResult, NegotiatorKind, PendingNegotiation,
    StartTlsNegotiator, StreamFeatures,
};
use crate::ping::{PingManager, PING_EXTENSION};
use crate::reconnect::{Reconnectable, ReconnectionManager};
use crate::stanza::{next_id, Iq, IqType, Stanza, StreamError, StreamErrorCondition};
use crate::stream::{
    Connection, PipelineOptions, StreamControl, StreamHandler, StreamUpgrade, StreamWriter,
};
use crate::transport::{self, BoxedStream, Transport};
use crate::xml::{ns, Element, StreamHeader, StreamOpen};

/// Answers one kind of inbound IQ request (`get`/`set`) with a response.
pub type IqHandler = dyn Fn(&Element) -> Element + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Stream state of one connection attempt.
#[derive(Default)]
struct StreamState {
    generation: u64,
    pending: PendingNegotiation,
    features: Option<StreamFeatures>,
    stream_id: Option<String>,
    server_domain: Option<String>,
}

#[derive(Default)]
struct StanzaListeners {
    message: ListenerRegistry<StanzaListener>,
    presence: ListenerRegistry<StanzaListener>,
    iq: ListenerRegistry<StanzaListener>,
}

impl StanzaListeners {
    fn clear(&self) {
        self.message.clear();
        self.presence.clear();
        self.iq.clear();
    }
}

struct SessionInner {
    me: Weak<SessionInner>,
    config: SessionConfig,
    transports: Vec<Arc<dyn Transport>>,
    negotiators: Vec<Arc<dyn FeatureNegotiator>>,
    authenticator: Arc<dyn Authenticator>,
    status: StatusMachine,
    correlator: StanzaCorrelator,
    listeners: StanzaListeners,
    iq_handlers: Mutex<HashMap<(String, String), Arc<IqHandler>>>,
    extensions: ExtensionRegistry,
    reconnection: Arc<ReconnectionManager>,
    dispatcher: Handle,
    /// Serializes connect and close.
    connect_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Option<(u64, Connection)>>,
    stream: Mutex<StreamState>,
    next_generation: AtomicU64,
    /// Replayed by `reconnect`.
    identity: Mutex<Option<Credentials>>,
    bound_jid: Mutex<Option<Jid>>,
    last_error: Mutex<Option<Arc<Error>>>,
    closed: AtomicBool,
}

/// Client session over one of the configured transports.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning handle, for callbacks stored inside the session itself.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

pub struct SessionBuilder {
    config: SessionConfig,
    transports: Vec<Arc<dyn Transport>>,
    negotiators: Vec<Arc<dyn FeatureNegotiator>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    dispatcher: Option<Handle>,
    extensions: ExtensionRegistry,
}

impl SessionBuilder {
    /// Use `transport` as a candidate. Once any transport is added the
    /// transports listed in the config are ignored.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Add a feature negotiator. STARTTLS is built in unless security is disabled.
    pub fn negotiator(mut self, negotiator: Arc<dyn FeatureNegotiator>) -> Self {
        self.negotiators.push(negotiator);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Runtime for background tasks and listener callbacks. Defaults to the
    /// runtime `build` is called on.
    pub fn dispatcher(mut self, runtime: Handle) -> Self {
        self.dispatcher = Some(runtime);
        self
    }

    pub fn extension(mut self, key: &'static str, factory: ExtensionFactory) -> Self {
        self.extensions.register(key, factory);
        self
    }

    pub fn build(self) -> Result<Session> {
        let SessionBuilder {
            config,
            transports,
            negotiators: extra_negotiators,
            authenticator,
            backoff,
            dispatcher,
            mut extensions,
        } = self;

        let transports = if transports.is_empty() {
            config.validate()?;
            transport::from_config(&config)?
        } else {
            config.validate_session()?;
            transports
        };
        let runtime = match dispatcher {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                Error::Config("a session must be built inside a tokio runtime".to_string())
            })?,
        };

        let mut negotiators: Vec<Arc<dyn FeatureNegotiator>> = Vec::new();
        if config.security != SecurityMode::Disabled {
            negotiators.push(Arc::new(StartTlsNegotiator));
        }
        negotiators.extend(extra_negotiators);

        let authenticator: Arc<dyn Authenticator> = match authenticator {
            Some(authenticator) => authenticator,
            None => Arc::new(SaslAuthenticator {
                timeout: config.sasl_wait_timeout,
            }),
        };
        let backoff: Arc<dyn BackoffStrategy> = match backoff {
            Some(backoff) => backoff,
            None => Arc::new(TruncatedBinaryExponentialBackoff::new(
                config.reconnection.slot_time,
                config.reconnection.ceiling,
            )),
        };
        if !extensions.contains(PING_EXTENSION) {
            extensions.register(PING_EXTENSION, PingManager::factory());
        }

        let reconnect_enabled = config.reconnection.enabled;
        let inner = Arc::new_cyclic(|me: &Weak<SessionInner>| {
            let target: Weak<dyn Reconnectable> = me.clone();
            SessionInner {
                me: me.clone(),
                status: StatusMachine::new(&runtime),
                reconnection: ReconnectionManager::new(
                    target,
                    backoff,
                    reconnect_enabled,
                    runtime.clone(),
                ),
                config,
                transports,
                negotiators,
                authenticator,
                correlator: StanzaCorrelator::new(),
                listeners: StanzaListeners::default(),
                iq_handlers: Mutex::new(HashMap::new()),
                extensions,
                dispatcher: runtime,
                connect_lock: tokio::sync::Mutex::new(()),
                connection: Mutex::new(None),
                stream: Mutex::new(StreamState::default()),
                next_generation: AtomicU64::new(0),
                identity: Mutex::new(None),
                bound_jid: Mutex::new(None),
                last_error: Mutex::new(None),
                closed: AtomicBool::new(false),
            }
        });

        let manager = inner.reconnection.clone();
        inner
            .status
            .add_listener(Arc::new(move |event: &StatusEvent| manager.on_status(event)));

        let build = crate::build_info();
        info!(version = build.version, git_hash = build.git_hash,
            domain = %inner.config.domain, transports = inner.transports.len(), "Session created");
        let session = Session { inner };
        // Inbound pings are answered from the first connection on
        if session.ping_manager().is_none() {
            warn!("Ping extension is not a PingManager, pings will not be answered");
        }
        Ok(session)
    }
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            transports: Vec::new(),
            negotiators: Vec::new(),
            authenticator: None,
            backoff: None,
            dispatcher: None,
            extensions: ExtensionRegistry::new(),
        }
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.current()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// `id` of the server's current stream header.
    pub fn stream_id(&self) -> Option<String> {
        lock(&self.inner.stream).stream_id.clone()
    }

    /// Domain the server declared in its stream header.
    pub fn server_domain(&self) -> Option<String> {
        lock(&self.inner.stream).server_domain.clone()
    }

    pub fn features(&self) -> Option<StreamFeatures> {
        lock(&self.inner.stream).features.clone()
    }

    pub fn last_error(&self) -> Option<Arc<Error>> {
        lock(&self.inner.last_error).clone()
    }

    /// Full JID bound by the last successful login.
    pub fn connected_resource(&self) -> Option<Jid> {
        lock(&self.inner.bound_jid).clone()
    }

    pub fn next_reconnection_attempt(&self) -> Option<SystemTime> {
        self.inner.reconnection.next_attempt()
    }

    pub fn reconnection_manager(&self) -> &Arc<ReconnectionManager> {
        &self.inner.reconnection
    }

    /// Extension registered under `key`, constructed on first use.
    pub fn extension<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.inner.extensions.get::<T>(key, self)
    }

    pub fn ping_manager(&self) -> Option<Arc<PingManager>> {
        self.extension(PING_EXTENSION)
    }

    /// Open a connection over the first candidate transport that accepts.
    ///
    /// Returns once the byte stream is up; stream negotiation continues in
    /// the background and `login` waits for it.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::IllegalState("session was closed".to_string()));
        }
        match inner.status.current() {
            ConnectionStatus::Connected => {
                return Err(Error::IllegalState("already connected".to_string()))
            }
            ConnectionStatus::Closing => {
                return Err(Error::IllegalState("session is closing".to_string()))
            }
            _ => {}
        }

        // A dropped connection may still be tearing down
        inner.teardown(None).await;
        let generation = inner.begin_attempt();
        inner.status.update(ConnectionStatus::Connecting, None);

        let candidates = inner.transports.len();
        let mut last_error = None;
        for (index, transport) in inner.transports.iter().enumerate() {
            let started = Instant::now();
            info!(generation, transport = %transport.descriptor(), candidate = index + 1,
                candidates, "Connecting");
            match transport.connect().await {
                Ok(stream) => {
                    info!(generation, transport = %transport.descriptor(),
                        elapsed_ms = started.elapsed().as_millis() as u64, "Transport connected");
                    inner.activate(generation, transport.clone(), stream);
                    return Ok(());
                }
                Err(e) => {
                    warn!(generation, transport = %transport.descriptor(), error = %e,
                        elapsed_ms = started.elapsed().as_millis() as u64, "Transport failed");
                    last_error = Some(e);
                }
            }
        }

        inner.status.update(ConnectionStatus::Disconnected, None);
        Err(last_error.unwrap_or_else(|| Error::Config("no transport candidates".to_string())))
    }

    /// Authenticate, bind a resource and finish session setup.
    pub async fn login(&self, username: &str, password: &str) -> Result<Jid> {
        self.login_with(Credentials::new(username, password)).await
    }

    pub async fn login_with(&self, credentials: Credentials) -> Result<Jid> {
        let inner = &self.inner;
        if inner.status.current() != ConnectionStatus::Connected {
            return Err(Error::NotConnected);
        }
        let pending = inner.pending();

        pending
            .sasl
            .wait(inner.config.sasl_wait_timeout, "SASL offer")
            .await?;
        let features = self
            .features()
            .ok_or_else(|| LoginError::NotReady("no stream features received".to_string()))?;
        if let Err(e) = inner
            .authenticator
            .authenticate(self, &features, &credentials)
            .await
        {
            inner.record_login_failure(&e);
            return Err(e);
        }
        info!(user = %credentials.username, "Authenticated");
        *lock(&inner.identity) = Some(credentials.clone());

        pending
            .bind
            .wait(inner.config.bind_timeout, "resource binding offer")
            .await?;
        let jid = match self.bind_resource(credentials.resource.as_deref()).await {
            Ok(jid) => jid,
            Err(e) => {
                inner.record_login_failure(&e);
                return Err(e);
            }
        };
        if self.features().is_some_and(|f| f.session_required()) {
            self.establish_legacy_session().await?;
        }

        if let Some(resource) = jid.resource() {
            // Rebind the same resource on reconnect
            *lock(&inner.identity) = Some(credentials.with_resource(resource));
        }
        *lock(&inner.bound_jid) = Some(jid.clone());
        info!(jid = %jid, "Logged in");

        if inner.config.send_initial_presence {
            self.send(Element::builder("presence", ns::CLIENT).build())?;
        }
        if inner.config.request_roster {
            self.send(Iq::get(None, Element::builder("query", ns::ROSTER).build()))?;
        }
        Ok(jid)
    }

    async fn bind_resource(&self, resource: Option<&str>) -> Result<Jid> {
        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(resource) = resource {
            bind = bind.append(Element::builder("resource", ns::BIND).text(resource).build());
        }
        let response = self
            .query(Iq::set(None, bind.build()), Some(self.inner.config.bind_timeout))
            .await
            .map_err(|e| match e {
                Error::Stanza(err) => Error::Login(LoginError::Bind(err.to_string())),
                other => other,
            })?;

        let text = response
            .get_child("bind", ns::BIND)
            .and_then(|b| b.get_child("jid", ns::BIND))
            .map(|j| j.text())
            .ok_or_else(|| LoginError::Bind("response carries no JID".to_string()))?;
        let jid = text
            .trim()
            .parse::<Jid>()
            .map_err(|e| LoginError::Bind(format!("invalid JID '{}': {}", text.trim(), e)))?;
        debug!(jid = %jid, "Resource bound");
        Ok(jid)
    }

    async fn establish_legacy_session(&self) -> Result<()> {
        let iq = Iq::set(None, Element::builder("session", ns::SESSION).build());
        self.query(iq, None).await?;
        debug!("Legacy session established");
        Ok(())
    }

    /// Connect again and replay the last login.
    pub async fn reconnect(&self) -> Result<()> {
        let identity = lock(&self.inner.identity).clone();
        self.connect().await?;
        let Some(credentials) = identity else {
            return Ok(());
        };
        if let Err(e) = self.login_with(credentials).await {
            warn!(error = %e, "Login after reconnect failed");
            self.inner.abandon(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Close the stream and release everything. The session cannot be
    /// reconnected afterwards. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.reconnection.stop();
        let _guard = inner.connect_lock.lock().await;

        inner.status.update(ConnectionStatus::Closing, None);
        inner.listeners.clear();
        lock(&inner.iq_handlers).clear();
        inner.pending().fail(Arc::new(Error::ConnectionClosed));
        inner.correlator.clear();
        inner.teardown(None).await;
        inner.extensions.clear();
        inner.status.update(ConnectionStatus::Closed, None);
        info!("Session closed");
        Ok(())
    }

    /// Queue `element` for sending. Write failures surface through the
    /// status, not here.
    pub fn send(&self, element: Element) -> Result<()> {
        self.inner.send(element)
    }

    /// Send an IQ and wait for its `result` or `error`. An `id` is assigned
    /// when missing; `timeout` defaults to the configured query timeout.
    pub async fn query(&self, iq: Element, timeout: Option<Duration>) -> Result<Element> {
        let mut iq = iq;
        let id = match iq.attr("id") {
            Some(id) => id.to_string(),
            None => {
                let id = next_id();
                iq.set_attr("id", id.clone());
                id
            }
        };
        let timeout = timeout.unwrap_or(self.inner.config.query_timeout);
        let context = format!("iq {}", id);
        self.inner
            .correlator
            .await_response(|| self.inner.send(iq), iq_response(id), timeout, &context)
            .await
    }

    /// Send `element` and wait for the first inbound element matching
    /// `predicate`.
    pub async fn send_and_await<P>(
        &self,
        element: Element,
        predicate: P,
        timeout: Duration,
        context: &str,
    ) -> Result<Element>
    where
        P: Fn(&Element) -> bool + Send + Sync + 'static,
    {
        self.inner
            .correlator
            .await_response(|| self.inner.send(element), predicate, timeout, context)
            .await
    }

    pub fn add_message_listener(
        &self,
        listener: impl Fn(&Element) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.message.add(Arc::new(listener))
    }

    pub fn add_presence_listener(
        &self,
        listener: impl Fn(&Element) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.presence.add(Arc::new(listener))
    }

    /// Observe every inbound IQ. Requests are answered by IQ handlers, see
    /// [`set_iq_handler`](Self::set_iq_handler).
    pub fn add_iq_listener(&self, listener: impl Fn(&Element) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.iq.add(Arc::new(listener))
    }

    pub fn add_status_listener(
        &self,
        listener: impl Fn(&StatusEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.status.add_listener(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let listeners = &self.inner.listeners;
        listeners.message.remove(id)
            || listeners.presence.remove(id)
            || listeners.iq.remove(id)
            || self.inner.status.remove_listener(id)
    }

    /// Answer inbound `get`/`set` IQs whose payload is `<name xmlns=ns/>`.
    /// Requests without a handler get `service-unavailable`.
    pub fn set_iq_handler(&self, name: &str, ns: &str, handler: Arc<IqHandler>) {
        lock(&self.inner.iq_handlers).insert((name.to_string(), ns.to_string()), handler);
    }

    pub fn remove_iq_handler(&self, name: &str, ns: &str) -> bool {
        lock(&self.inner.iq_handlers)
            .remove(&(name.to_string(), ns.to_string()))
            .is_some()
    }
}

impl SessionInner {
    fn begin_attempt(&self) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.stream) = StreamState {
            generation,
            ..StreamState::default()
        };
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.stream).generation == generation
    }

    fn pending(&self) -> PendingNegotiation {
        lock(&self.stream).pending.clone()
    }

    fn activate(self: &Arc<Self>, generation: u64, transport: Arc<dyn Transport>, stream: BoxedStream) {
        // Held while the pipeline starts so a failure on the new connection
        // always finds it stored
        let mut slot = lock(&self.connection);
        self.status.update(ConnectionStatus::Connected, None);
        let link = Arc::new(ConnectionLink {
            session: self.me.clone(),
            generation,
            domain: self.config.domain.clone(),
        });
        let options = PipelineOptions {
            keepalive_interval: self.config.keepalive_interval,
            shutdown_grace: self.config.shutdown_grace,
        };
        let connection = Connection::start(transport, stream, link, self.status.subscribe(), options);
        *slot = Some((generation, connection));
    }

    /// Close the stored connection; with `Some(generation)`, only if it
    /// still is that connection.
    async fn teardown(&self, generation: Option<u64>) {
        let taken = {
            let mut slot = lock(&self.connection);
            match (slot.as_ref(), generation) {
                (Some((current, _)), Some(wanted)) if *current != wanted => None,
                _ => slot.take(),
            }
        };
        if let Some((generation, connection)) = taken {
            debug!(generation, "Tearing down connection");
            connection.close().await;
        }
    }

    /// Drop a connection whose login failed.
    async fn abandon(&self, reason: &Error) {
        let generation = lock(&self.stream).generation;
        let cause = Arc::new(Error::Negotiation(format!("login failed: {}", reason)));
        self.pending().fail(cause.clone());
        self.status.transition_from(
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            Some(cause),
        );
        self.teardown(Some(generation)).await;
    }

    /// Keep a failed authentication or bind as the last error. Connection
    /// failures are recorded by `notify_exception` instead.
    fn record_login_failure(&self, error: &Error) {
        let recorded = match error {
            Error::Login(e) => Error::Login(e.clone()),
            Error::NoResponse {
                context,
                timeout_ms,
            } => Error::NoResponse {
                context: context.clone(),
                timeout_ms: *timeout_ms,
            },
            _ => return,
        };
        *lock(&self.last_error) = Some(Arc::new(recorded));
    }

    fn writer(&self) -> Option<(StreamWriter, bool)> {
        lock(&self.connection)
            .as_ref()
            .map(|(_, c)| (c.writer().clone(), c.transport().is_secure()))
    }

    fn send(&self, element: Element) -> Result<()> {
        match self.writer() {
            Some((writer, _)) => writer.send(element),
            None => Err(Error::NotConnected),
        }
    }

    fn stream_open(&self) -> StreamOpen {
        let mut open = StreamOpen::new(self.config.domain.clone());
        open.lang = self.config.lang.clone();
        open.from = lock(&self.identity)
            .as_ref()
            .map(|c| Jid::new(Some(c.username.as_str()), &self.config.domain, None).to_string());
        open
    }

    fn stream_opened(&self, generation: u64, header: &StreamHeader) {
        let mut stream = lock(&self.stream);
        if stream.generation != generation {
            return;
        }
        stream.stream_id = header.id.clone();
        stream.server_domain = header.from.clone();
    }

    fn handle_element(&self, generation: u64, element: Element) -> Result<StreamControl> {
        if !self.is_current(generation) {
            debug!(generation, name = element.name(), "Element from a stale connection ignored");
            return Ok(StreamControl::Continue);
        }
        self.correlator.offer(&element);

        if element.is("features", ns::STREAM) {
            return self.handle_features(&element);
        }
        if element.is("error", ns::STREAM) {
            let stream_error = StreamError::from_element(&element).unwrap_or(StreamError {
                condition: StreamErrorCondition::Other("undefined-condition".to_string()),
                text: None,
            });
            error!(generation, condition = stream_error.condition.as_str(),
                text = ?stream_error.text, "Stream error from server");
            return Err(Error::Stream(stream_error));
        }
        if element.ns() == Some(ns::SASL) {
            if element.name() == "success" {
                debug!(generation, "SASL success, restarting stream");
                return Ok(StreamControl::Restart(StreamUpgrade::None));
            }
            // Challenges and failures reach the authenticator through the correlator
            return Ok(StreamControl::Continue);
        }

        match Stanza::from_element(element) {
            Ok(stanza) => {
                self.dispatch(stanza);
                Ok(StreamControl::Continue)
            }
            Err(element) => self.negotiate(&element),
        }
    }

    fn handle_features(&self, element: &Element) -> Result<StreamControl> {
        let features = StreamFeatures::parse(element);
        debug!(mechanisms = ?features.mechanisms, starttls = features.starttls,
            bind = features.bind, "Stream features received");
        lock(&self.stream).features = Some(features.clone());

        let secure = self.writer().is_some_and(|(_, secure)| secure);
        for negotiator in &self.negotiators {
            if negotiator.kind() == NegotiatorKind::Security
                && (secure || self.config.security == SecurityMode::Disabled)
            {
                continue;
            }
            if !negotiator.can_process(element) {
                continue;
            }
            match self.process(negotiator.as_ref(), element)? {
                // One negotiation at a time; the server sends new features afterwards
                NegotiationResult::Incomplete => return Ok(StreamControl::Continue),
                result => {
                    let control = negotiation_control(negotiator.as_ref(), result)?;
                    if matches!(control, StreamControl::Restart(_)) {
                        return Ok(control);
                    }
                }
            }
        }

        if self.config.security == SecurityMode::Required && !secure {
            return Err(Error::Negotiation(
                "server does not offer STARTTLS and security is required".to_string(),
            ));
        }
        let pending = self.pending();
        if !features.mechanisms.is_empty() {
            pending.sasl.signal();
        }
        if features.bind {
            pending.bind.signal();
        }
        Ok(StreamControl::Continue)
    }

    fn negotiate(&self, element: &Element) -> Result<StreamControl> {
        let Some(negotiator) = self.negotiators.iter().find(|n| n.can_process(element)) else {
            debug!(name = element.name(), ns = ?element.ns(), "Unhandled top-level element");
            return Ok(StreamControl::Continue);
        };
        let result = self.process(negotiator.as_ref(), element)?;
        negotiation_control(negotiator.as_ref(), result)
    }

    fn process(&self, negotiator: &dyn FeatureNegotiator, element: &Element) -> Result<NegotiationResult> {
        let (writer, secure) = self.writer().ok_or(Error::NotConnected)?;
        let send = move |el: Element| writer.send(el);
        let ctx = NegotiationContext::new(secure, self.config.security, &send);
        Ok(negotiator.process_negotiation(element, &ctx))
    }

    fn iq_handler_for(&self, iq: &Element) -> Option<Arc<IqHandler>> {
        let payload = iq.children().next()?;
        let key = (payload.name().to_string(), payload.ns().unwrap_or_default().to_string());
        lock(&self.iq_handlers).get(&key).cloned()
    }

    /// Hand a stanza to its listeners on the dispatcher's blocking pool.
    fn dispatch(&self, stanza: Stanza) {
        let (kind, listeners) = match &stanza {
            Stanza::Message(_) => ("message", self.listeners.message.snapshot()),
            Stanza::Presence(_) => ("presence", self.listeners.presence.snapshot()),
            Stanza::Iq(_) => ("iq", self.listeners.iq.snapshot()),
        };

        let mut handler = None;
        if let Stanza::Iq(iq) = &stanza {
            if matches!(IqType::of(iq), Some(IqType::Get) | Some(IqType::Set)) {
                handler = self.iq_handler_for(iq);
                if handler.is_none() {
                    debug!(id = ?iq.attr("id"), "No handler for IQ request");
                    if let Err(e) = self.send(Iq::service_unavailable(iq)) {
                        debug!(error = %e, "Could not answer IQ request");
                    }
                }
            }
        }
        if listeners.is_empty() && handler.is_none() {
            return;
        }

        let element = stanza.into_element();
        let session = self.me.clone();
        self.dispatcher.spawn_blocking(move || {
            if let Some(handler) = handler {
                let mut response = None;
                invoke_isolated("iq-handler", || response = Some(handler(&element)));
                if let (Some(response), Some(inner)) = (response, session.upgrade()) {
                    if let Err(e) = inner.send(response) {
                        debug!(error = %e, "Could not send IQ response");
                    }
                }
            }
            for listener in listeners {
                invoke_isolated(kind, || listener(&element));
            }
        });
    }

    /// The single failure funnel for the connection `generation`.
    fn notify_exception(&self, generation: u64, error: Error) {
        if !self.is_current(generation) {
            debug!(generation, error = %error, "Failure on a stale connection ignored");
            return;
        }
        let error = Arc::new(error);
        *lock(&self.last_error) = Some(error.clone());
        self.pending().fail(error.clone());

        if self.status.transition_from(
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            Some(error.clone()),
        ) {
            warn!(generation, error = %error, "Connection lost");
            self.correlator.clear();
            if let Some(inner) = self.me.upgrade() {
                self.dispatcher.spawn(async move {
                    inner.teardown(Some(generation)).await;
                });
            }
        } else {
            debug!(generation, status = %self.status.current(), error = %error,
                "Failure outside of a live connection");
        }
    }
}

fn negotiation_control(
    negotiator: &dyn FeatureNegotiator,
    result: NegotiationResult,
) -> Result<StreamControl> {
    match result {
        NegotiationResult::Incomplete => Ok(StreamControl::Continue),
        NegotiationResult::Failure(reason) => {
            warn!(kind = ?negotiator.kind(), reason = %reason, "Negotiation failed");
            Err(Error::Negotiation(reason))
        }
        NegotiationResult::Success => match negotiator.kind() {
            NegotiatorKind::Security => {
                info!("STARTTLS accepted, upgrading stream");
                Ok(StreamControl::Restart(StreamUpgrade::Secure))
            }
            NegotiatorKind::Compression => negotiator
                .stream_layer()
                .map(|layer| StreamControl::Restart(StreamUpgrade::Compress(layer)))
                .ok_or_else(|| {
                    Error::Negotiation("compression negotiated without a stream layer".to_string())
                }),
            NegotiatorKind::Authentication => Ok(StreamControl::Restart(StreamUpgrade::None)),
            NegotiatorKind::Other => Ok(StreamControl::Continue),
        },
    }
}

#[async_trait]
impl Reconnectable for SessionInner {
    async fn reconnect(&self) -> Result<()> {
        let inner = self
            .me
            .upgrade()
            .ok_or_else(|| Error::IllegalState("session dropped".to_string()))?;
        Session { inner }.reconnect().await
    }

    fn is_connected(&self) -> bool {
        self.status.current() == ConnectionStatus::Connected
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.reconnection.stop();
    }
}

/// The session as seen by one connection's reader and writer.
struct ConnectionLink {
    session: Weak<SessionInner>,
    generation: u64,
    domain: String,
}

impl StreamHandler for ConnectionLink {
    fn stream_opened(&self, header: &StreamHeader) {
        if let Some(inner) = self.session.upgrade() {
            inner.stream_opened(self.generation, header);
        }
    }

    fn handle_element(&self, element: Element) -> Result<StreamControl> {
        match self.session.upgrade() {
            Some(inner) => inner.handle_element(self.generation, element),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn notify_exception(&self, error: Error) {
        if let Some(inner) = self.session.upgrade() {
            inner.notify_exception(self.generation, error);
        }
    }

    fn stream_open(&self) -> StreamOpen {
        match self.session.upgrade() {
            Some(inner) => inner.stream_open(),
            None => StreamOpen::new(self.domain.clone()),
        }
    }
}
