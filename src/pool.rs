use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::config::{Address, ConnectionConfig, PoolConfig};
use crate::connection::Connection;
use crate::executor::SyncClient;
use crate::reactor::ReactorHandle;
use crate::reply::Reply;
use crate::{Error, Result};

/// Synchronous connections to a single endpoint.
///
/// Connections are opened lazily and handed out exclusively: [`get_client`](Self::get_client)
/// checks one out, [`reclaim`](Self::reclaim) gives it back and [`free_client`](Self::free_client)
/// discards it. The pool keeps track of every connection it opened by id, a connection it no
/// longer tracks is never accepted back.
///
/// A background task pings idle connections every `health_check_interval`, frees the ones that do
/// not answer and tops the pool back up to its minimum size. The task stops once the pool is
/// dropped.
#[derive(Debug)]
pub struct EndpointPool {
    config: PoolConfig,
    connection: ConnectionConfig,
    address: Mutex<Address>,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    free: VecDeque<Connection>,
    // Ids of every connection opened by the pool and not freed yet, checked out or idle.
    total: Vec<Uuid>,
    // Connections being opened outside of the lock.
    reserved: usize,
    max_size: usize,
}

impl EndpointPool {
    /// Creates an empty pool and starts its health check on `reactor`.
    pub fn new(
        reactor: &ReactorHandle,
        address: Address,
        connection: ConnectionConfig,
        config: PoolConfig,
    ) -> Arc<EndpointPool> {
        let pool = Arc::new(EndpointPool::detached(address, connection, config));
        reactor.spawn(health_check(
            Arc::downgrade(&pool),
            reactor.clone(),
            pool.config.health_check_interval,
        ));
        pool
    }

    /// A pool without a health check task.
    pub fn detached(address: Address, connection: ConnectionConfig, config: PoolConfig) -> Self {
        let state = State {
            free: VecDeque::new(),
            total: Vec::new(),
            reserved: 0,
            max_size: config.max_size,
        };

        EndpointPool {
            config,
            connection,
            address: Mutex::new(address),
            state: Mutex::new(state),
        }
    }

    pub fn address(&self) -> Address {
        self.address.lock().unwrap().clone()
    }

    pub fn get_client(&self) -> Option<Connection> {
        if let Some(conn) = self.pop_free() {
            return Some(conn);
        }
        self.allocate()
    }

    /// Returns a checked out connection. Broken connections, connections to a previous address and
    /// connections the pool does not know about are dropped instead.
    pub fn reclaim(&self, conn: Connection) {
        let address = self.address();
        let mut state = self.state.lock().unwrap();

        let Some(position) = state.total.iter().position(|id| *id == conn.id) else {
            drop(state);
            debug!(id = %conn.id, "dropping connection not owned by the pool");
            return;
        };

        if conn.is_broken() || conn.address() != &address {
            state.total.swap_remove(position);
            drop(state);
            debug!(id = %conn.id, "dropping stale connection");
            return;
        }

        state.free.push_back(conn);
        debug_assert!(state.free.len() <= state.total.len());
    }

    /// Permanently discards a connection.
    pub fn free_client(&self, conn: Connection) {
        let mut state = self.state.lock().unwrap();
        state.total.retain(|id| *id != conn.id);
        drop(state);
        debug!(id = %conn.id, "connection freed");
    }

    /// Runs `cmd` on a pooled connection. The connection goes back to the pool on success and is
    /// discarded when the command failed.
    pub fn execute(&self, cmd: &Command) -> Result<Reply> {
        let mut conn = self
            .get_client()
            .ok_or_else(|| Error::PoolExhausted(self.address().to_string()))?;

        match conn.execute(cmd) {
            Ok(reply) => {
                self.reclaim(conn);
                Ok(reply)
            }
            Err(err) => {
                self.free_client(conn);
                Err(err)
            }
        }
    }

    /// Opens connections until the pool holds its minimum size. Stops at the first failure.
    pub fn ensure_min_connections(&self) {
        let min_size = self.config.min_size();
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.total.len() + state.reserved >= min_size {
                    return;
                }
            }

            match self.allocate() {
                Some(conn) => self.reclaim(conn),
                None => return,
            }
        }
    }

    /// Pings every idle connection, frees those that fail, then tops the pool up.
    #[instrument(name = "health_check", skip(self), fields(address = %self.address()))]
    pub fn check_connections(&self) {
        let address = self.address();
        let idle = self.state.lock().unwrap().free.len();

        for _ in 0..idle {
            let Some(mut conn) = self.pop_free() else {
                break;
            };

            if self.is_healthy(&mut conn, &address) {
                self.reclaim(conn);
            } else {
                info!(id = %conn.id, "freeing unhealthy connection");
                self.free_client(conn);
            }
        }

        self.ensure_min_connections();
    }

    fn is_healthy(&self, conn: &mut Connection, address: &Address) -> bool {
        if conn.address() != address || !conn.ping() {
            return false;
        }
        match self.config.expected_role {
            Some(_) => conn.refresh_role().is_ok() && self.role_accepted(conn),
            None => true,
        }
    }

    /// Points the pool at a new address. Idle connections are closed right away, checked out ones
    /// are dropped when they come back.
    pub fn reset_address(&self, address: Address) {
        {
            let mut current = self.address.lock().unwrap();
            if *current == address {
                return;
            }
            info!(old = %current, new = %address, "pool address changed");
            *current = address;
        }

        let stale: Vec<Connection> = {
            let mut state = self.state.lock().unwrap();
            let stale: Vec<Connection> = state.free.drain(..).collect();
            state
                .total
                .retain(|id| !stale.iter().any(|conn| conn.id == *id));
            stale
        };
        debug!(closed = stale.len(), "closed idle connections");
    }

    pub fn total_count(&self) -> usize {
        self.state.lock().unwrap().total.len()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().unwrap().max_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    fn pop_free(&self) -> Option<Connection> {
        self.state.lock().unwrap().free.pop_front()
    }

    fn allocate(&self) -> Option<Connection> {
        let Some(extended) = self.try_reserve() else {
            warn!(address = %self.address(), "connection pool exhausted");
            return None;
        };

        let address = self.address();
        let result = Connection::open(&address, &self.connection);

        let accepted = matches!(&result, Ok(conn) if self.role_accepted(conn));
        let mut state = self.state.lock().unwrap();
        state.reserved -= 1;
        match result {
            Ok(conn) if accepted => {
                state.total.push(conn.id);
                return Some(conn);
            }
            // A failed open gives back the room it extended the pool by.
            _ if extended => state.max_size -= 1,
            _ => {}
        }
        drop(state);

        match result {
            Ok(conn) => {
                warn!(%address, role = ?conn.role(), expected = ?self.config.expected_role, "rejecting connection with unexpected role")
            }
            Err(err) => warn!(%address, error = %err, "failed to open connection"),
        }
        None
    }

    /// Reserves room for one more connection. `Some(true)` when the max size had to be raised
    /// for it.
    fn try_reserve(&self) -> Option<bool> {
        let mut state = self.state.lock().unwrap();
        let mut extended = false;
        if state.total.len() + state.reserved >= state.max_size {
            if !self.config.auto_extend || state.max_size >= self.config.max_size_ceiling {
                return None;
            }
            state.max_size += 1;
            extended = true;
            info!(max_size = state.max_size, "pool saturated, extending max size");
        }
        state.reserved += 1;
        Some(extended)
    }

    fn role_accepted(&self, conn: &Connection) -> bool {
        match self.config.expected_role {
            Some(expected) => conn.role() == Some(expected),
            None => true,
        }
    }
}

impl SyncClient for EndpointPool {
    fn execute_with_slot(&self, cmd: &Command, _slot: Option<u16>) -> Result<Reply> {
        self.execute(cmd)
    }

    fn cluster_mode(&self) -> bool {
        self.connection.cluster_mode
    }
}

async fn health_check(pool: Weak<EndpointPool>, reactor: ReactorHandle, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            break;
        };
        if let Err(err) = reactor
            .spawn_blocking(move || pool.check_connections())
            .await
        {
            warn!(error = %err, "pool health check panicked");
        }
    }
}
