use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use strum_macros::EnumString;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::command::Command;
use crate::config::{Address, ClusterConfig, ConnectionConfig};
use crate::executor::SyncClient;
use crate::pool::EndpointPool;
use crate::reactor::{Reactor, ReactorHandle};
use crate::reply::Reply;
use crate::topology::{SlotMap, TopologyCache};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
enum ErrorCode {
    Moved,
    Ask,
    ClusterDown,
}

/// What a cluster error reply asks the client to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Redirect {
    /// The slot lives on `address` from now on.
    Moved { slot: u16, address: Address },
    /// Retry once on `address`, preceded by `ASKING`.
    Ask { slot: u16, address: Address },
    ClusterDown,
}

impl Redirect {
    /// Parses `MOVED <slot> <host:port>`, `ASK <slot> <host:port>` and `CLUSTERDOWN ...` errors.
    /// Any other error, or a redirect without a valid address, yields `None`.
    pub fn parse(message: &str) -> Option<Redirect> {
        let mut parts = message.split_whitespace();
        let code: ErrorCode = parts.next()?.parse().ok()?;
        if code == ErrorCode::ClusterDown {
            return Some(Redirect::ClusterDown);
        }

        let slot = parts.next()?.parse().ok()?;
        let address = parts.next()?.parse().ok()?;
        match code {
            ErrorCode::Moved => Some(Redirect::Moved { slot, address }),
            _ => Some(Redirect::Ask { slot, address }),
        }
    }
}

/// Synchronous client for a sharded cluster.
///
/// Commands go to the pool of the master owning their slot, or to any pool when they carry no
/// key. `MOVED` and `ASK` replies are followed up to `max_redirects` hops, `CLUSTERDOWN` aborts.
/// The slot layout is refreshed in the background and the pools are rebuilt whenever it changes.
pub struct ClusterClient {
    inner: Arc<Inner>,
    // Dropped after the pools.
    _reactor: Option<Reactor>,
}

struct Inner {
    reactor: ReactorHandle,
    config: ClusterConfig,
    connection: ConnectionConfig,
    topology: TopologyCache,
    pools: Mutex<BTreeMap<Address, Arc<EndpointPool>>>,
    // Direction of the next keyless pool pick.
    reverse: AtomicBool,
}

impl ClusterClient {
    /// Connects with a dedicated reactor.
    pub fn connect(config: ClusterConfig) -> Result<ClusterClient> {
        let reactor = Reactor::new()?;
        let mut client = ClusterClient::with_reactor(&reactor.handle(), config)?;
        client._reactor = Some(reactor);
        Ok(client)
    }

    /// Loads the slot layout from the seeds and opens a pool per master. Fails when no seed
    /// answers.
    pub fn with_reactor(reactor: &ReactorHandle, config: ClusterConfig) -> Result<ClusterClient> {
        let connection = config.connection_config();
        let seeds = config.seeds.iter().map(|uri| uri.address.clone()).collect();
        let inner = Arc::new(Inner {
            reactor: reactor.clone(),
            topology: TopologyCache::new(seeds, connection.clone()),
            connection,
            config,
            pools: Mutex::new(BTreeMap::new()),
            reverse: AtomicBool::new(false),
        });

        inner.install(inner.topology.fetch()?);

        reactor.spawn(refresh_topology(
            Arc::downgrade(&inner),
            reactor.clone(),
            inner.config.refresh_interval,
        ));

        Ok(ClusterClient {
            inner,
            _reactor: None,
        })
    }

    /// Runs `cmd` on the node owning `slot`, or on any node when `slot` is `None`.
    pub fn execute(&self, cmd: &Command, slot: Option<u16>) -> Result<Reply> {
        self.inner.execute(cmd, slot)
    }

    /// Checks the slot layout now instead of waiting for the next refresh tick.
    pub fn refresh(&self) -> Result<bool> {
        self.inner.refresh()
    }

    pub fn pool_addresses(&self) -> Vec<Address> {
        self.inner.pools.lock().unwrap().keys().cloned().collect()
    }

    /// The pool currently serving `address`.
    pub fn pool(&self, address: &Address) -> Option<Arc<EndpointPool>> {
        self.inner.pools.lock().unwrap().get(address).cloned()
    }

    pub fn topology(&self) -> &TopologyCache {
        &self.inner.topology
    }
}

impl SyncClient for ClusterClient {
    fn execute_with_slot(&self, cmd: &Command, slot: Option<u16>) -> Result<Reply> {
        self.inner.execute(cmd, slot)
    }

    fn cluster_mode(&self) -> bool {
        true
    }
}

impl Inner {
    #[instrument(name = "cluster_execute", skip(self, cmd), fields(cmd = %cmd.name()))]
    fn execute(&self, cmd: &Command, slot: Option<u16>) -> Result<Reply> {
        let mut pool = match slot {
            Some(slot) => self.pool_for_slot(slot).ok_or(Error::SlotNotServed(slot))?,
            None => self.any_pool().ok_or(Error::NoPool)?,
        };
        let mut asking = false;

        for _ in 0..self.config.max_redirects {
            let mut conn = pool
                .get_client()
                .ok_or_else(|| Error::PoolExhausted(pool.address().to_string()))?;

            if asking {
                match conn.execute(&Command::asking()) {
                    Ok(reply) if reply.is_ok() => {}
                    Ok(reply) => {
                        warn!(address = %pool.address(), %reply, "ASKING rejected");
                        pool.reclaim(conn);
                        return Err(Error::AskingFailed(pool.address().to_string()));
                    }
                    Err(err) => {
                        pool.free_client(conn);
                        return Err(err);
                    }
                }
            }

            let reply = match conn.execute(cmd) {
                Ok(reply) => {
                    pool.reclaim(conn);
                    reply
                }
                Err(err) => {
                    pool.free_client(conn);
                    return Err(err);
                }
            };

            let Some(redirect) = reply.error_message().and_then(Redirect::parse) else {
                return Ok(reply);
            };

            match redirect {
                Redirect::Moved { slot, address } => {
                    debug!(slot, %address, "MOVED");
                    pool = self.pool_for_address(address);
                    asking = false;
                }
                Redirect::Ask { slot, address } => {
                    debug!(slot, %address, "ASK");
                    pool = self.pool_for_address(address);
                    asking = true;
                }
                Redirect::ClusterDown => {
                    let message = reply.error_message().unwrap_or_default().to_string();
                    warn!(%message, "cluster is down");
                    return Err(Error::ClusterDown(message));
                }
            }
        }

        warn!(hops = self.config.max_redirects, "too many redirects");
        Err(Error::TooManyRedirects(self.config.max_redirects))
    }

    fn pool_for_slot(&self, slot: u16) -> Option<Arc<EndpointPool>> {
        // Holding the pool map while reading the owner pairs both with the same layout.
        let pools = self.pools.lock().unwrap();
        let address = self.topology.owner(slot)?;
        pools.get(address.as_ref()).cloned()
    }

    /// Pool for `address`, created empty when the cluster sent us somewhere new.
    fn pool_for_address(&self, address: Address) -> Arc<EndpointPool> {
        if let Some(pool) = self.pools.lock().unwrap().get(&address) {
            return pool.clone();
        }

        let pool = self.new_pool(address.clone());
        self.pools
            .lock()
            .unwrap()
            .entry(address)
            .or_insert(pool)
            .clone()
    }

    /// Any pool holding connections, scanning forward and backward on alternate calls.
    fn any_pool(&self) -> Option<Arc<EndpointPool>> {
        let reverse = self.reverse.fetch_xor(true, Ordering::Relaxed);
        let pools = self.pools.lock().unwrap();

        let pick = |pool: &&Arc<EndpointPool>| !pool.is_empty();
        let found = if reverse {
            pools.values().rev().find(pick)
        } else {
            pools.values().find(pick)
        };
        // Fall back to a lazily filled pool when none is warm yet.
        found.or_else(|| pools.values().next()).cloned()
    }

    fn new_pool(&self, address: Address) -> Arc<EndpointPool> {
        EndpointPool::new(
            &self.reactor,
            address,
            self.connection.clone(),
            self.config.pool.clone(),
        )
    }

    /// Opens a pool per master of `map`, then installs the layout and the pools together. Pools
    /// still borrowed by in-flight commands are dropped once those finish.
    fn install(&self, map: SlotMap) {
        let masters = map.masters();
        let fresh: BTreeMap<Address, Arc<EndpointPool>> = masters
            .iter()
            .map(|address| {
                let pool = self.new_pool(address.clone());
                pool.ensure_min_connections();
                (address.clone(), pool)
            })
            .collect();

        let stale = {
            let mut pools = self.pools.lock().unwrap();
            self.topology.reset(map);
            std::mem::replace(&mut *pools, fresh)
        };
        info!(pools = masters.len(), replaced = stale.len(), "cluster pools rebuilt");
    }

    fn refresh(&self) -> Result<bool> {
        match self.topology.fetch_changed()? {
            Some(map) => {
                self.install(map);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn refresh_topology(inner: Weak<Inner>, reactor: ReactorHandle, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match reactor.spawn_blocking(move || inner.refresh()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "topology refresh failed"),
            Err(err) => warn!(error = %err, "topology refresh panicked"),
        }
    }
}
