use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::async_client::AsyncClient;
use crate::command::Command;
use crate::config::{Address, AsyncConfig, ConnectionConfig, PoolConfig, Role, SentinelConfig, Uri};
use crate::executor::SyncClient;
use crate::pool::EndpointPool;
use crate::reactor::{Reactor, ReactorHandle};
use crate::reply::Reply;
use crate::{Error, Result};

/// Channel on which sentinels announce failovers.
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

const EVENT_CAPACITY: usize = 64;

/// A failover announced by a sentinel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterAddressChange {
    pub master_name: String,
    pub old: Address,
    pub new: Address,
}

impl MasterAddressChange {
    /// Parses `<master name> <old ip> <old port> <new ip> <new port>`.
    pub fn parse(message: &str) -> Option<MasterAddressChange> {
        let fields: Vec<&str> = message.split_whitespace().collect();
        let [name, old_ip, old_port, new_ip, new_port] = fields[..] else {
            return None;
        };

        Some(MasterAddressChange {
            master_name: name.to_string(),
            old: Address::new(old_ip, old_port.parse().ok()?),
            new: Address::new(new_ip, new_port.parse().ok()?),
        })
    }
}

/// Watches a set of sentinels.
///
/// Every sentinel gets two async clients: one subscribed to [`SWITCH_MASTER_CHANNEL`] and one for
/// address lookups. Failovers of a master this watcher has looked up are published to every
/// receiver returned by [`subscribe`](Self::subscribe).
pub struct SentinelWatcher {
    reactor: ReactorHandle,
    lookup_timeout: Duration,
    sentinels: Vec<Sentinel>,
    state: Arc<WatchState>,
    _reactor: Option<Reactor>,
}

struct Sentinel {
    address: Address,
    subscriber: AsyncClient,
    query: AsyncClient,
}

struct WatchState {
    masters: Mutex<HashMap<String, Address>>,
    events: broadcast::Sender<MasterAddressChange>,
}

impl WatchState {
    fn on_message(&self, channel: &str, payload: &Bytes) {
        let text = String::from_utf8_lossy(payload);
        match MasterAddressChange::parse(&text) {
            Some(change) => self.apply(change),
            None => warn!(channel, message = %text, "dropping malformed switch message"),
        }
    }

    fn apply(&self, change: MasterAddressChange) {
        {
            let mut masters = self.masters.lock().unwrap();
            let Some(current) = masters.get_mut(&change.master_name) else {
                debug!(master = %change.master_name, "switch of an untracked master");
                return;
            };
            if *current == change.new {
                debug!(master = %change.master_name, "switch already applied");
                return;
            }
            *current = change.new.clone();
        }

        info!(
            master = %change.master_name,
            old = %change.old,
            new = %change.new,
            "master switched"
        );
        // No receivers is fine, nobody follows this master.
        let _ = self.events.send(change);
    }

    fn track(&self, name: &str, address: &Address) {
        self.masters
            .lock()
            .unwrap()
            .insert(name.to_string(), address.clone());
    }
}

impl SentinelWatcher {
    /// A watcher with a dedicated reactor.
    pub fn connect(config: SentinelConfig) -> Result<SentinelWatcher> {
        let reactor = Reactor::new()?;
        let mut watcher = SentinelWatcher::new(&reactor.handle(), config);
        watcher._reactor = Some(reactor);
        watcher.start()?;
        Ok(watcher)
    }

    /// Creates the sentinel clients without connecting them, see [`start`](Self::start).
    pub fn new(reactor: &ReactorHandle, config: SentinelConfig) -> SentinelWatcher {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = Arc::new(WatchState {
            masters: Mutex::new(HashMap::new()),
            events,
        });

        let sentinels = config
            .sentinels
            .iter()
            .map(|address| {
                let client_config = AsyncConfig {
                    uri: Uri::new(address.clone()),
                    cluster_mode: false,
                    ..config.client.clone()
                };
                let subscriber = AsyncClient::new(reactor, client_config.clone());
                let query = AsyncClient::new(reactor, client_config);

                let state = state.clone();
                // Recorded while disconnected and subscribed by every session.
                let _ = subscriber.subscribe(
                    SWITCH_MASTER_CHANNEL,
                    move |channel, payload| state.on_message(channel, payload),
                    |_| {},
                );

                Sentinel {
                    address: address.clone(),
                    subscriber,
                    query,
                }
            })
            .collect();

        SentinelWatcher {
            reactor: reactor.clone(),
            lookup_timeout: config.lookup_timeout,
            sentinels,
            state,
            _reactor: None,
        }
    }

    /// Connects every sentinel client, waiting for each one up to its connect timeout. Clients
    /// that fail keep retrying in the background. Fails only when no query client is connected.
    pub fn start(&self) -> Result<()> {
        let mut connected = 0;
        for sentinel in &self.sentinels {
            let _ = sentinel.subscriber.connect();
            match sentinel.query.connect_and_wait() {
                Ok(()) => connected += 1,
                Err(err) => warn!(sentinel = %sentinel.address, error = %err, "sentinel unavailable"),
            }
        }

        if connected == 0 {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Asks the connected sentinels, in order, for the address of `master_name`. The first answer
    /// wins and starts tracking the master.
    pub fn master_address(&self, master_name: &str) -> Result<Address> {
        let cmd = Command::sentinel_master_addr(master_name);
        for sentinel in self.sentinels.iter().filter(|s| s.query.is_connected()) {
            match sentinel.query.execute_blocking(&cmd, self.lookup_timeout) {
                Ok(reply) => match parse_master_addr(&reply) {
                    Some(address) => {
                        info!(master = master_name, %address, sentinel = %sentinel.address, "master found");
                        self.state.track(master_name, &address);
                        return Ok(address);
                    }
                    None => debug!(master = master_name, sentinel = %sentinel.address, %reply, "master unknown"),
                },
                Err(err) => warn!(master = master_name, sentinel = %sentinel.address, error = %err, "lookup failed"),
            }
        }

        Err(Error::MasterNotFound(master_name.to_string()))
    }

    /// Last known address of a tracked master.
    pub fn known_address(&self, master_name: &str) -> Option<Address> {
        self.state.masters.lock().unwrap().get(master_name).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MasterAddressChange> {
        self.state.events.subscribe()
    }

    pub fn sentinels(&self) -> Vec<Address> {
        self.sentinels.iter().map(|s| s.address.clone()).collect()
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }
}

/// `SENTINEL get-master-addr-by-name` answers `[ip, port]`, or nil for unknown masters.
fn parse_master_addr(reply: &Reply) -> Option<Address> {
    let items = reply.as_array()?;
    let [host, port] = items else {
        return None;
    };
    Some(Address::new(host.as_str()?, port.as_str()?.parse().ok()?))
}

/// Runs `on_change` with the new address of `master_name` after every failover, until it returns
/// `false` or the watcher goes away.
fn follow_master<F>(
    reactor: &ReactorHandle,
    mut events: broadcast::Receiver<MasterAddressChange>,
    master_name: String,
    on_change: F,
) where
    F: Fn(Address) -> bool + Send + 'static,
{
    reactor.spawn(async move {
        loop {
            match events.recv().await {
                Ok(change) if change.master_name == master_name => {
                    if !on_change(change.new) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(master = %master_name, missed, "missed switch events")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(master = %master_name, "stopped following master");
    });
}

/// Sync pool bound to whatever node the sentinels report as master.
pub struct SentinelPool {
    master_name: String,
    pool: Arc<EndpointPool>,
}

impl SentinelPool {
    pub fn new(
        watcher: &SentinelWatcher,
        master_name: &str,
        connection: ConnectionConfig,
        config: PoolConfig,
    ) -> Result<SentinelPool> {
        let address = watcher.master_address(master_name)?;
        let config = PoolConfig {
            expected_role: Some(Role::Master),
            ..config
        };
        let pool = EndpointPool::new(watcher.reactor(), address, connection, config);
        pool.ensure_min_connections();

        let weak = Arc::downgrade(&pool);
        follow_master(
            watcher.reactor(),
            watcher.subscribe(),
            master_name.to_string(),
            move |address| match weak.upgrade() {
                Some(pool) => {
                    pool.reset_address(address);
                    true
                }
                None => false,
            },
        );

        Ok(SentinelPool {
            master_name: master_name.to_string(),
            pool,
        })
    }

    pub fn master_name(&self) -> &str {
        &self.master_name
    }

    pub fn address(&self) -> Address {
        self.pool.address()
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }
}

impl SyncClient for SentinelPool {
    fn execute_with_slot(&self, cmd: &Command, _slot: Option<u16>) -> Result<Reply> {
        self.pool.execute(cmd)
    }
}

/// Async client bound to whatever node the sentinels report as master. A failover resets the
/// session, failing every request in flight.
pub struct SentinelAsyncClient {
    master_name: String,
    client: Arc<AsyncClient>,
}

impl SentinelAsyncClient {
    pub fn new(
        watcher: &SentinelWatcher,
        master_name: &str,
        config: AsyncConfig,
    ) -> Result<SentinelAsyncClient> {
        let address = watcher.master_address(master_name)?;
        let mut uri = config.uri.clone();
        uri.address = address;
        let client = Arc::new(AsyncClient::new(
            watcher.reactor(),
            AsyncConfig { uri, ..config },
        ));

        let weak = Arc::downgrade(&client);
        follow_master(
            watcher.reactor(),
            watcher.subscribe(),
            master_name.to_string(),
            move |address| match weak.upgrade() {
                Some(client) => {
                    client.reset_address(address);
                    true
                }
                None => false,
            },
        );

        Ok(SentinelAsyncClient {
            master_name: master_name.to_string(),
            client,
        })
    }

    pub fn master_name(&self) -> &str {
        &self.master_name
    }
}

impl Deref for SentinelAsyncClient {
    type Target = AsyncClient;

    fn deref(&self) -> &AsyncClient {
        &self.client
    }
}
