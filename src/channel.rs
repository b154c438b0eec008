//! The reconnecting RPC channel.
//!
//! An [`RpcChannel`] is a cheap, cloneable handle. The connection itself, the pending calls
//! and the reconnect timer belong to a single driver task which reacts to handle commands,
//! transport events and timer expiry one at a time.
use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::BoxFuture, SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{sleep, Sleep},
};
use tracing::{debug, debug_span, error, trace, warn, Instrument};

use crate::{
    config::ChannelConfig,
    error::{Result, RpcError},
    message::{Inbound, Request},
    pending::{Dispatch, PendingCall, PendingCalls, Submit},
    transport::{Connector, Link},
};

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No transport and no retry scheduled.
    Disconnected,
    /// No transport; a retry is scheduled.
    Reconnecting,
    /// A connection attempt is in progress.
    Connecting,
    /// The transport is open and calls can be made.
    Open,
    /// The channel was shut down. Terminal.
    Closed,
}

/// Connectivity notifications, for callers that want to react to connection churn.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The transport opened. A good moment to (re)load initial data.
    Connected,
    /// The open transport closed. Pending calls have been rejected.
    Disconnected,
    /// A retry is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The reconnect policy ran out of attempts.
    GaveUp { attempts: u32 },
}

/// Internal message type for communication between handles and the driver.
#[derive(Debug)]
enum Command {
    Connect,
    Invoke {
        key: u64,
        request: Request,
        reply: oneshot::Sender<Result<Value>>,
    },
    /// The caller stopped waiting for this call.
    Abandon(u64),
    Shutdown(oneshot::Sender<()>),
}

/// A handle to a reconnecting request/response channel.
///
/// Clones share the same connection. The driver task shuts down when [`shutdown`] is called
/// or when the last handle is dropped.
///
/// [`shutdown`]: RpcChannel::shutdown
#[derive(Debug, Clone)]
pub struct RpcChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    next_key: Arc<AtomicU64>,
    call_timeout: Option<Duration>,
}

impl RpcChannel {
    /// Creates a channel in the `Disconnected` state and spawns its driver on the current
    /// tokio runtime. Nothing is opened until [`connect`](Self::connect).
    pub fn new<C: Connector>(connector: C, config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity);
        let call_timeout = config.call_timeout;
        let span = debug_span!("rpc_channel", endpoint = %connector.endpoint());

        let driver = Driver {
            connector: Arc::new(connector),
            commands: command_rx,
            state: state_tx,
            events: events.clone(),
            pending: PendingCalls::new(config.correlation),
            config,
            link: None,
            attempt: None,
            timer: None,
            owed_reply: None,
            failures: 0,
        };
        tokio::spawn(driver.run().instrument(span));

        Ok(Self {
            commands,
            state,
            events,
            next_key: Arc::new(AtomicU64::new(1)),
            call_timeout,
        })
    }

    /// Creates a channel and starts connecting right away.
    pub fn open<C: Connector>(connector: C, config: ChannelConfig) -> Result<Self> {
        let channel = Self::new(connector, config)?;
        channel.connect()?;
        Ok(channel)
    }

    /// Starts connecting. Does nothing while already connecting or open. A scheduled retry
    /// is brought forward.
    pub fn connect(&self) -> Result<()> {
        self.commands
            .send(Command::Connect)
            .map_err(|_| RpcError::NotConnected)
    }

    /// Calls a remote function and waits for its result, using the configured call timeout.
    pub async fn invoke(&self, function: &str, params: Vec<Value>) -> Result<Value> {
        self.invoke_with_timeout(function, params, self.call_timeout)
            .await
    }

    /// Calls a remote function with an explicit timeout (`None` waits indefinitely).
    ///
    /// Fails with [`RpcError::NotConnected`] without sending anything when the channel is not
    /// open. Dropping the returned future abandons the call; a response arriving later is
    /// discarded.
    pub async fn invoke_with_timeout(
        &self,
        function: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Invoke {
                key,
                request: Request::new(function, params),
                reply,
            })
            .map_err(|_| RpcError::NotConnected)?;

        let mut guard = AbandonOnDrop {
            key,
            commands: &self.commands,
            armed: true,
        };
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!("call {} ({}) timed out after {:?}", key, function, limit);
                    return Err(RpcError::Timeout(limit));
                }
            },
            None => response.await,
        };
        guard.armed = false;
        // The driver drops the reply sender only when it shuts down.
        outcome.map_err(|_| RpcError::ConnectionLost)?
    }

    /// Sends a typed call and deserializes the result.
    ///
    /// A value serializing to an array supplies the params list, `()` sends no params and
    /// anything else is sent as the single param.
    pub async fn call<P, R>(&self, function: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serialize_params(params)?;
        let value = self.invoke(function, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// The current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// True while the channel is `Open`.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// A receiver that always holds the latest state.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Subscribes to connectivity events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Waits until the channel is open. Fails if it is shut down first.
    pub async fn wait_open(&self) -> Result<()> {
        let mut state = self.state.clone();
        let open = state
            .wait_for(|s| matches!(s, ChannelState::Open | ChannelState::Closed))
            .await
            .map(|s| *s == ChannelState::Open)
            .unwrap_or(false);
        if open {
            Ok(())
        } else {
            Err(RpcError::NotConnected)
        }
    }

    /// Tears the channel down: cancels any scheduled retry, closes the transport and rejects
    /// every pending call. Other handles see the channel as `Closed`.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).is_ok() {
            // An error means the driver already exited.
            let _ = finished.await;
        }
    }
}

/// Sends `Abandon` for a call whose future is dropped before it settled.
struct AbandonOnDrop<'a> {
    key: u64,
    commands: &'a mpsc::UnboundedSender<Command>,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            // The driver may be gone already; nothing is left to clean up then.
            drop(self.commands.send(Command::Abandon(self.key)));
        }
    }
}

/// Serializes typed params into the params list.
fn serialize_params<P>(params: &P) -> Result<Vec<Value>>
where
    P: Serialize,
{
    match serde_json::to_value(params)? {
        Value::Array(values) => Ok(values),
        Value::Null => Ok(Vec::new()),
        value => Ok(vec![value]),
    }
}

/// What woke the driver up.
enum Step {
    Command(Option<Command>),
    Frame(Option<Result<String>>),
    Attempt(Result<Link>),
    Timer,
    OwedReplyExpired,
}

/// Owns the connection and all call bookkeeping for one channel.
struct Driver {
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    pending: PendingCalls,
    /// The open transport, if any.
    link: Option<Link>,
    /// The connection attempt in progress, if any.
    attempt: Option<BoxFuture<'static, Result<Link>>>,
    /// The scheduled retry, if any. Never more than one.
    timer: Option<Pin<Box<Sleep>>>,
    /// Deadline for the reply owed to an abandoned sequential call.
    owed_reply: Option<Pin<Box<Sleep>>>,
    /// Consecutive retries since the transport was last open.
    failures: u32,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                frame = next_frame(&mut self.link) => Step::Frame(frame),
                outcome = poll_slot(&mut self.attempt) => Step::Attempt(outcome),
                () = poll_slot(&mut self.timer) => Step::Timer,
                () = poll_slot(&mut self.owed_reply) => Step::OwedReplyExpired,
            };
            match step {
                Step::Command(Some(Command::Shutdown(done))) => {
                    self.teardown().await;
                    let _ = done.send(());
                    return;
                }
                Step::Command(Some(Command::Connect)) => self.handle_connect(),
                Step::Command(Some(Command::Invoke {
                    key,
                    request,
                    reply,
                })) => self.handle_invoke(key, request, reply).await,
                Step::Command(Some(Command::Abandon(key))) => self.handle_abandon(key).await,
                Step::Command(None) => {
                    trace!("all channel handles dropped");
                    self.teardown().await;
                    return;
                }
                Step::Frame(Some(Ok(text))) => self.handle_frame(text).await,
                Step::Frame(Some(Err(e))) => {
                    warn!("transport error on {}: {}", self.connector.endpoint(), e);
                }
                Step::Frame(None) => self.handle_close(),
                Step::Attempt(outcome) => {
                    self.attempt = None;
                    match outcome {
                        Ok(link) => self.handle_open(link),
                        Err(e) => self.handle_failed_attempt(e),
                    }
                }
                Step::Timer => {
                    self.timer = None;
                    self.start_attempt();
                }
                Step::OwedReplyExpired => {
                    self.owed_reply = None;
                    warn!(
                        "abandoned call's reply missing after {:?}; recycling connection",
                        self.config.owed_reply_timeout
                    );
                    self.handle_close();
                }
            }
        }
    }

    fn current(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ChannelState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("channel state {:?} -> {:?}", previous, next);
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine.
        drop(self.events.send(event));
    }

    fn handle_connect(&mut self) {
        match self.current() {
            ChannelState::Connecting | ChannelState::Open | ChannelState::Closed => {
                trace!("connect ignored in state {:?}", self.current());
            }
            ChannelState::Reconnecting => {
                self.timer = None;
                self.start_attempt();
            }
            ChannelState::Disconnected => {
                self.failures = 0;
                self.start_attempt();
            }
        }
    }

    async fn handle_invoke(
        &mut self,
        key: u64,
        request: Request,
        reply: oneshot::Sender<Result<Value>>,
    ) {
        if self.link.is_none() {
            drop(reply.send(Err(RpcError::NotConnected)));
            return;
        }
        let call = PendingCall::new(key, request.function.clone(), reply);
        match self.pending.submit(call, request) {
            Submit::Write(key, request) => self.write(Some((key, request))).await,
            Submit::Queued => trace!("call {} queued", key),
            Submit::Duplicate(call) => {
                warn!("correlation key {} is already in use", call.key);
                call.resolve(Err(RpcError::Protocol(format!(
                    "correlation key {} is already in use",
                    key
                ))));
            }
        }
    }

    async fn handle_abandon(&mut self, key: u64) {
        if self.pending.abandon(key) {
            debug!("call {} abandoned by its caller", key);
            self.track_owed_reply();
            let next = self.pending.next_queued();
            self.write(next).await;
        }
    }

    /// Arms the owed-reply deadline while queued calls are held back, and disarms it once the
    /// reply has been paid off.
    fn track_owed_reply(&mut self) {
        if !self.pending.owes_reply() {
            self.owed_reply = None;
        } else if self.owed_reply.is_none() {
            self.owed_reply = Some(Box::pin(sleep(self.config.owed_reply_timeout)));
        }
    }

    /// Writes a request, then any queued request that becomes eligible because a write
    /// failed.
    async fn write(&mut self, mut next: Option<(u64, Request)>) {
        while let Some((key, request)) = next.take() {
            if let Err(e) = self.send(&request).await {
                warn!("failed to send call {} ({}): {}", key, request.function, e);
                if let Some(call) = self.pending.remove(key) {
                    call.resolve(Err(e));
                }
                next = self.pending.next_queued();
            }
        }
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        let text = request.encode()?;
        let link = self.link.as_mut().ok_or(RpcError::NotConnected)?;
        trace!("sending frame: {}", text);
        link.sink.send(text).await
    }

    async fn handle_frame(&mut self, text: String) {
        trace!("received frame: {}", text);
        let inbound = Inbound::decode(&text);
        if let Err(e) = &inbound.response {
            warn!("inbound payload is not a valid response: {}", e);
        }
        match self.pending.dispatch(inbound) {
            Dispatch::Resolved(key) => trace!("call {} resolved", key),
            Dispatch::Late => debug!("discarding response to an abandoned call"),
            Dispatch::Unmatched(reason) => warn!("ignoring inbound message: {}", reason),
        }
        self.track_owed_reply();
        let next = self.pending.next_queued();
        self.write(next).await;
    }

    fn handle_open(&mut self, link: Link) {
        debug!("connected to {}", self.connector.endpoint());
        self.link = Some(link);
        self.timer = None;
        self.failures = 0;
        self.set_state(ChannelState::Open);
        self.emit(ChannelEvent::Connected);
    }

    fn handle_close(&mut self) {
        debug!("connection to {} closed", self.connector.endpoint());
        self.link = None;
        self.owed_reply = None;
        self.set_state(ChannelState::Disconnected);
        if !self.pending.is_empty() {
            debug!("rejecting {} pending calls", self.pending.len());
        }
        self.pending.fail_all(|| RpcError::ConnectionLost);
        self.emit(ChannelEvent::Disconnected);
        self.schedule_reconnect();
    }

    fn handle_failed_attempt(&mut self, error: RpcError) {
        warn!(
            "connection attempt to {} failed: {}",
            self.connector.endpoint(),
            error
        );
        self.set_state(ChannelState::Disconnected);
        self.schedule_reconnect();
    }

    fn start_attempt(&mut self) {
        if self.attempt.is_some() || self.link.is_some() {
            return;
        }
        self.set_state(ChannelState::Connecting);
        let connector = Arc::clone(&self.connector);
        let limit = self.config.connect_timeout;
        self.attempt = Some(Box::pin(async move {
            match tokio::time::timeout(limit, connector.connect()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::Connect {
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no connection after {:?}", limit),
                    ),
                }),
            }
        }));
    }

    fn schedule_reconnect(&mut self) {
        if self.timer.is_some() || self.attempt.is_some() {
            return;
        }
        if !self.config.reconnect.enabled {
            debug!("reconnect disabled; staying disconnected");
            return;
        }
        self.failures = self.failures.saturating_add(1);
        match self.config.reconnect.delay_for(self.failures) {
            Some(delay) => {
                debug!("reconnect attempt {} in {:?}", self.failures, delay);
                self.timer = Some(Box::pin(sleep(delay)));
                self.set_state(ChannelState::Reconnecting);
                self.emit(ChannelEvent::Reconnecting {
                    attempt: self.failures,
                    delay,
                });
            }
            None => {
                let attempts = self.failures - 1;
                error!(
                    "giving up on {} after {} reconnect attempts",
                    self.connector.endpoint(),
                    attempts
                );
                self.emit(ChannelEvent::GaveUp { attempts });
            }
        }
    }

    async fn teardown(&mut self) {
        self.timer = None;
        self.attempt = None;
        self.owed_reply = None;
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.sink.close().await {
                debug!("error closing transport: {}", e);
            }
            self.emit(ChannelEvent::Disconnected);
        }
        self.pending.fail_all(|| RpcError::ConnectionLost);
        self.set_state(ChannelState::Closed);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Invoke { reply, .. } => drop(reply.send(Err(RpcError::NotConnected))),
                Command::Shutdown(done) => {
                    let _ = done.send(());
                }
                Command::Connect | Command::Abandon(_) => {}
            }
        }
        debug!("channel to {} shut down", self.connector.endpoint());
    }
}

/// Next inbound item of the link, or never when there is no link.
async fn next_frame(link: &mut Option<Link>) -> Option<Result<String>> {
    match link {
        Some(link) => link.stream.next().await,
        None => std::future::pending().await,
    }
}

/// Completes with the slot's future, or never when the slot is empty.
async fn poll_slot<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}
