//! Event driven connection running on a [`Reactor`](crate::reactor::Reactor).
//!
//! Requests are pipelined on a single socket and replies are matched to requests purely by
//! arrival order: every accepted [`AsyncClient::send`] pushes its reply handler to a FIFO queue and
//! each reply read from the socket completes the oldest handler. Pushing the handler and queueing
//! the bytes happen under one lock, which keeps the handler queue in write order no matter how many
//! threads send concurrently.
//!
//! Channel messages (`["message", channel, payload]`) are not replies to a request. They go to the
//! handler registered for the channel instead and leave the queue untouched.
//!
//! The connection is supervised: whenever it closes, a new attempt is made after
//! `reconnect_interval`. Every new session authenticates, selects the database, asks for the role
//! and subscribes again to every registered channel before anything else is sent.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::ReplyCodec;
use crate::command::Command;
use crate::config::{Address, AsyncConfig, Uri};
use crate::connection::parse_role;
use crate::reactor::ReactorHandle;
use crate::reply::Reply;
use crate::{Error, Result};

pub type ReplyHandler = Box<dyn FnOnce(Result<Reply>) + Send>;
pub type MessageHandler = Arc<dyn Fn(&str, &Bytes) + Send + Sync>;

pub struct AsyncClient {
    inner: Arc<Inner>,
}

struct Inner {
    reactor: ReactorHandle,
    config: AsyncConfig,
    uri: Mutex<Uri>,
    session: Mutex<Session>,
    subscriptions: Mutex<HashMap<String, MessageHandler>>,
    // Callers of `connect` waiting for the next session to open.
    waiters: Mutex<Vec<oneshot::Sender<bool>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Session {
    id: Option<Uuid>,
    outbound: Option<mpsc::Sender<Bytes>>,
    pending: VecDeque<ReplyHandler>,
    reset: Option<CancellationToken>,
}

impl Session {
    /// Detaches the session, returning the handlers still waiting for a reply.
    fn clear(&mut self) -> VecDeque<ReplyHandler> {
        self.id = None;
        self.outbound = None;
        if let Some(reset) = self.reset.take() {
            reset.cancel();
        }
        std::mem::take(&mut self.pending)
    }
}

impl AsyncClient {
    pub fn new(reactor: &ReactorHandle, config: AsyncConfig) -> AsyncClient {
        let inner = Arc::new(Inner {
            reactor: reactor.clone(),
            uri: Mutex::new(config.uri.clone()),
            config,
            session: Mutex::new(Session::default()),
            subscriptions: Mutex::new(HashMap::new()),
            waiters: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        AsyncClient { inner }
    }

    /// Starts connecting in the background. The returned receiver resolves to `true` once a
    /// session is open, or `false` if the next attempt fails. Failed attempts are retried every
    /// `reconnect_interval` regardless.
    pub fn connect(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.inner.waiters.lock().unwrap();
            if self.is_connected() {
                let _ = tx.send(true);
            } else {
                waiters.push(tx);
            }
        }

        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.reactor.spawn(supervise(self.inner.clone()));
        }
        rx
    }

    /// [`connect`](Self::connect), blocking the calling thread for at most `connect_timeout`.
    /// Must not be called from a reactor thread.
    pub fn connect_and_wait(&self) -> Result<()> {
        let opened = self.connect();
        let wait = self.inner.config.connect_timeout;
        match self.inner.reactor.block_on_timeout(wait, opened) {
            Ok(Ok(true)) => Ok(()),
            Ok(_) => Err(Error::NotConnected),
            Err(err) => {
                warn!(uri = %self.uri(), error = %err, "connect timed out");
                Err(err)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().unwrap().outbound.is_some()
    }

    /// Queues `cmd`. `on_reply` runs on a reactor thread with the reply, or with an error when the
    /// session closes first. Fails with [`Error::Backpressure`] when `max_send_queue` requests are
    /// already waiting to be written.
    pub fn send<F>(&self, cmd: &Command, on_reply: F) -> Result<()>
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.inner.send(cmd, Box::new(on_reply))
    }

    /// Queues `cmd` and returns a receiver for its reply.
    pub fn request(&self, cmd: &Command) -> Result<oneshot::Receiver<Result<Reply>>> {
        let (tx, rx) = oneshot::channel();
        self.send(cmd, move |reply| {
            let _ = tx.send(reply);
        })?;
        Ok(rx)
    }

    /// Sends `cmd` and blocks the calling thread until the reply arrives or `wait` elapses. On
    /// timeout the request stays queued and its reply is discarded.
    pub fn execute_blocking(&self, cmd: &Command, wait: Duration) -> Result<Reply> {
        let reply = self.request(cmd)?;
        match self.inner.reactor.block_on_timeout(wait, reply)? {
            Ok(reply) => reply,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Registers `on_message` for `channel` and subscribes. The registration outlives the
    /// connection: when disconnected the subscription is only recorded, and every new session
    /// subscribes again to all registered channels.
    pub fn subscribe<M, R>(&self, channel: &str, on_message: M, on_reply: R) -> Result<()>
    where
        M: Fn(&str, &Bytes) + Send + Sync + 'static,
        R: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(channel.to_string(), Arc::new(on_message));

        let name = channel.to_string();
        let result = self.inner.send(
            &Command::subscribe(channel),
            Box::new(move |reply| {
                log_confirmation(&name, &reply);
                on_reply(reply)
            }),
        );
        deferred_when_disconnected(channel, result)
    }

    pub fn unsubscribe<R>(&self, channel: &str, on_reply: R) -> Result<()>
    where
        R: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.inner.subscriptions.lock().unwrap().remove(channel);

        let name = channel.to_string();
        let result = self.inner.send(
            &Command::unsubscribe(channel),
            Box::new(move |reply| {
                log_confirmation(&name, &reply);
                on_reply(reply)
            }),
        );
        deferred_when_disconnected(channel, result)
    }

    pub fn publish<R>(&self, channel: &str, message: impl AsRef<[u8]>, on_reply: R) -> Result<()>
    where
        R: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.send(&Command::publish(channel, message), on_reply)
    }

    /// Registered channels, sorted.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        channels.sort();
        channels
    }

    pub fn uri(&self) -> Uri {
        self.inner.uri.lock().unwrap().clone()
    }

    /// Points the client at `address` and drops the current session. The next session, after
    /// `reconnect_interval`, goes to the new address.
    pub fn reset_address(&self, address: Address) {
        {
            let mut uri = self.inner.uri.lock().unwrap();
            if uri.address == address {
                return;
            }
            info!(old = %uri.address, new = %address, "client address changed");
            uri.address = address;
        }
        self.session_reset();
    }

    /// Closes the current connection and fails every request waiting for a reply or still queued
    /// for writing.
    pub fn session_reset(&self) {
        self.inner.close_session(None);
    }

    /// Stops the client for good.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.close_session(None);
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deferred_when_disconnected(channel: &str, result: Result<()>) -> Result<()> {
    match result {
        Err(Error::NotConnected) => {
            debug!(channel, "not connected, will subscribe on connect");
            Ok(())
        }
        other => other,
    }
}

fn log_confirmation(channel: &str, reply: &Result<Reply>) {
    match reply {
        Ok(Reply::Array(items)) => {
            let kind = items.first().and_then(Reply::as_str).unwrap_or_default();
            info!(channel, kind, "subscription confirmed");
        }
        Ok(reply) => warn!(channel, %reply, "unexpected subscription reply"),
        Err(err) => debug!(channel, error = %err, "subscription reply lost"),
    }
}

fn log_reply(cmd: &str, reply: Result<Reply>) {
    match reply {
        Ok(Reply::Error(message)) => warn!(cmd, %message, "command failed"),
        Ok(reply) => debug!(cmd, %reply, "command succeeded"),
        Err(err) => debug!(cmd, error = %err, "no reply"),
    }
}

/// `["message", channel, payload]`.
fn channel_message(reply: &Reply) -> Option<(&str, &Bytes)> {
    let items = reply.as_array()?;
    if items.len() != 3 || items[0].as_bytes()?.as_ref() != b"message" {
        return None;
    }
    Some((items[1].as_str()?, items[2].as_bytes()?))
}

impl Inner {
    fn send(&self, cmd: &Command, on_reply: ReplyHandler) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        let Some(outbound) = session.outbound.as_ref() else {
            return Err(Error::NotConnected);
        };

        match outbound.try_send(cmd.encode()) {
            Ok(()) => {
                session.pending.push_back(on_reply);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(cmd = %cmd.name(), "send queue full");
                Err(Error::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::NotConnected),
        }
    }

    fn send_logged(&self, cmd: &Command) {
        let name = cmd.name();
        if let Err(err) = self.send(cmd, Box::new(move |reply| log_reply(&name, reply))) {
            warn!(cmd = %cmd.name(), error = %err, "failed to send");
        }
    }

    fn uri(&self) -> Uri {
        self.uri.lock().unwrap().clone()
    }

    fn open_session(&self, id: Uuid, outbound: mpsc::Sender<Bytes>, reset: CancellationToken) {
        let stale = {
            let mut session = self.session.lock().unwrap();
            let stale = session.clear();
            session.id = Some(id);
            session.outbound = Some(outbound);
            session.reset = Some(reset);
            stale
        };
        fail_all(stale);
    }

    /// Closes session `id`, or whatever session is open when `id` is `None`.
    fn close_session(&self, id: Option<Uuid>) {
        let failed = {
            let mut session = self.session.lock().unwrap();
            if id.is_some() && session.id != id {
                return;
            }
            session.clear()
        };
        fail_all(failed);
    }

    fn notify_waiters(&self, connected: bool) {
        for waiter in self.waiters.lock().unwrap().drain(..) {
            let _ = waiter.send(connected);
        }
    }

    fn run_startup(&self) {
        let uri = self.uri();
        if let Some(password) = uri.password.as_deref().filter(|p| !p.is_empty()) {
            self.send_logged(&Command::auth(password));
        }

        if uri.db != 0 && !self.config.cluster_mode {
            self.send_logged(&Command::select(uri.db));
        }

        let role = self.send(
            &Command::role(),
            Box::new(|reply| match reply.as_ref().map(parse_role) {
                Ok(Some(role)) => info!(%role, "server role"),
                _ => debug!("role not reported"),
            }),
        );
        if let Err(err) = role {
            warn!(error = %err, "failed to query role");
        }

        let channels: Vec<String> = self.subscriptions.lock().unwrap().keys().cloned().collect();
        for channel in channels {
            let name = channel.clone();
            if let Err(err) = self.send(
                &Command::subscribe(&channel),
                Box::new(move |reply| log_confirmation(&name, &reply)),
            ) {
                warn!(%channel, error = %err, "failed to resubscribe");
            }
        }
    }

    fn dispatch(&self, reply: Reply) {
        if let Some((channel, payload)) = channel_message(&reply) {
            let handler = self.subscriptions.lock().unwrap().get(channel).cloned();
            match handler {
                Some(handler) => handler(channel, payload),
                None => debug!(channel, "message for unregistered channel"),
            }
            return;
        }

        let handler = self.session.lock().unwrap().pending.pop_front();
        match handler {
            Some(handler) => handler(Ok(reply)),
            None => warn!(%reply, "reply without a pending request"),
        }
    }

    #[instrument(name = "session", skip_all, fields(address = %address, id = %id))]
    async fn run_session(&self, stream: TcpStream, address: Address, id: Uuid) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "failed to set TCP_NODELAY");
        }

        let (read, write) = stream.into_split();
        let mut frames = FramedRead::with_capacity(
            read,
            ReplyCodec::with_max_len(self.config.max_buffer_size),
            self.config.read_buffer_size,
        );
        let mut sink = FramedWrite::new(write, ReplyCodec::new());
        let (outbound, mut queued) = mpsc::channel::<Bytes>(self.config.max_send_queue.max(1));
        let reset = self.shutdown.child_token();

        self.open_session(id, outbound, reset.clone());
        info!("connected");
        self.run_startup();
        self.notify_waiters(true);

        let period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = reset.cancelled() => {
                    debug!("session reset");
                    break;
                }
                Some(bytes) = queued.recv() => {
                    if let Err(err) = sink.send(bytes).await {
                        warn!(error = %err, "write failed");
                        break;
                    }
                }
                frame = frames.next() => match frame {
                    Some(Ok(reply)) => self.dispatch(reply),
                    Some(Err(err)) => {
                        error!(error = %err, "read failed, closing connection");
                        break;
                    }
                    None => {
                        info!("connection closed by peer");
                        break;
                    }
                },
                _ = ping.tick() => self.send_logged(&Command::ping()),
            }
        }

        self.close_session(Some(id));
    }
}

fn fail_all(handlers: VecDeque<ReplyHandler>) {
    for handler in handlers {
        handler(Err(Error::ConnectionClosed));
    }
}

/// Connects, runs the session until it closes, waits `reconnect_interval` and starts over, until
/// the client shuts down.
async fn supervise(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let address = inner.uri().address;
        let attempt = timeout(
            inner.config.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await;

        match attempt {
            Ok(Ok(stream)) => inner.run_session(stream, address, Uuid::new_v4()).await,
            Ok(Err(err)) => {
                warn!(%address, error = %err, "connect failed");
                inner.notify_waiters(false);
            }
            Err(_) => {
                warn!(%address, "connect timed out");
                inner.notify_waiters(false);
            }
        }

        debug!(delay = ?inner.config.reconnect_interval, "reconnecting");
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = sleep(inner.config.reconnect_interval) => {}
        }
    }

    inner.close_session(None);
    inner.notify_waiters(false);
    debug!("client stopped");
}
