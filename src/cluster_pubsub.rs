use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::async_client::{AsyncClient, MessageHandler};
use crate::config::{Address, AsyncConfig, ClusterConfig, Uri};
use crate::reactor::{Reactor, ReactorHandle};
use crate::reply::Reply;
use crate::slot::hash_slot;
use crate::topology::{SlotMap, TopologyCache};
use crate::{Error, Result};

/// Publish/subscribe over a cluster, one async client per master.
///
/// A channel is served by the master owning `hash_slot(channel)`. Channels are registered here as
/// well as on the client serving them, so when the slot layout changes every client is replaced
/// and each channel is subscribed again on its new owner.
pub struct ClusterPubSub {
    inner: Arc<Inner>,
    _reactor: Option<Reactor>,
}

struct Inner {
    reactor: ReactorHandle,
    client: AsyncConfig,
    topology: TopologyCache,
    clients: Mutex<BTreeMap<Address, Arc<AsyncClient>>>,
    subscriptions: Mutex<HashMap<String, MessageHandler>>,
}

impl ClusterPubSub {
    pub fn connect(config: ClusterConfig) -> Result<ClusterPubSub> {
        let reactor = Reactor::new()?;
        let mut pubsub = ClusterPubSub::with_reactor(&reactor.handle(), config)?;
        pubsub._reactor = Some(reactor);
        Ok(pubsub)
    }

    /// Loads the slot layout and starts a client per master. Must not be called from a reactor
    /// thread.
    pub fn with_reactor(reactor: &ReactorHandle, config: ClusterConfig) -> Result<ClusterPubSub> {
        let connection = config.connection_config();
        let client = AsyncConfig {
            uri: Uri {
                password: config.password(),
                ..Uri::default()
            },
            cluster_mode: true,
            connect_timeout: config.connect_timeout.unwrap_or(Duration::from_secs(1)),
            ..AsyncConfig::default()
        };

        let inner = Arc::new(Inner {
            reactor: reactor.clone(),
            client,
            topology: TopologyCache::new(
                config.seeds.iter().map(|uri| uri.address.clone()).collect(),
                connection,
            ),
            clients: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        });

        inner.rebuild(inner.topology.fetch()?);

        reactor.spawn(refresh_topology(
            Arc::downgrade(&inner),
            reactor.clone(),
            config.refresh_interval,
        ));

        Ok(ClusterPubSub {
            inner,
            _reactor: None,
        })
    }

    /// Registers `on_message` for `channel` and subscribes on the node serving it.
    pub fn subscribe<M, R>(&self, channel: &str, on_message: M, on_reply: R) -> Result<()>
    where
        M: Fn(&str, &Bytes) + Send + Sync + 'static,
        R: FnOnce(Result<Reply>) + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(on_message);
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(channel.to_string(), handler.clone());

        let client = self.inner.client_for(channel)?;
        client.subscribe(channel, move |c, p| handler(c, p), on_reply)
    }

    pub fn unsubscribe<R>(&self, channel: &str, on_reply: R) -> Result<()>
    where
        R: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.inner.subscriptions.lock().unwrap().remove(channel);
        self.inner.client_for(channel)?.unsubscribe(channel, on_reply)
    }

    pub fn publish<R>(&self, channel: &str, message: impl AsRef<[u8]>, on_reply: R) -> Result<()>
    where
        R: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.inner.client_for(channel)?.publish(channel, message, on_reply)
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

    /// Address of the node serving `channel`.
    pub fn node_for(&self, channel: &str) -> Option<Address> {
        self.inner
            .topology
            .owner(hash_slot(channel.as_bytes()))
            .map(|address| address.as_ref().clone())
    }

    pub fn client_addresses(&self) -> Vec<Address> {
        self.inner.clients.lock().unwrap().keys().cloned().collect()
    }

    /// Checks the slot layout now. Must not be called from a reactor thread.
    pub fn refresh(&self) -> Result<bool> {
        self.inner.refresh()
    }
}

impl Drop for ClusterPubSub {
    fn drop(&mut self) {
        for client in self.inner.clients.lock().unwrap().values() {
            client.shutdown();
        }
    }
}

impl Inner {
    fn client_for(&self, channel: &str) -> Result<Arc<AsyncClient>> {
        let slot = hash_slot(channel.as_bytes());
        let clients = self.clients.lock().unwrap();
        let owner = self.topology.owner(slot).ok_or(Error::SlotNotServed(slot))?;
        clients.get(owner.as_ref()).cloned().ok_or(Error::NoPool)
    }

    /// Replaces every client with fresh ones for the masters of `map` and spreads the registered
    /// channels over them. The layout is installed together with the new clients.
    fn rebuild(&self, map: SlotMap) {
        let fresh: BTreeMap<Address, Arc<AsyncClient>> = map
            .masters()
            .into_iter()
            .map(|address| {
                let config = AsyncConfig {
                    uri: Uri {
                        address: address.clone(),
                        ..self.client.uri.clone()
                    },
                    ..self.client.clone()
                };
                (address, Arc::new(AsyncClient::new(&self.reactor, config)))
            })
            .collect();

        let subscriptions: Vec<(String, MessageHandler)> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(channel, handler)| (channel.clone(), handler.clone()))
            .collect();

        for (channel, handler) in subscriptions {
            let owner = map.lookup(hash_slot(channel.as_bytes()));
            match owner.and_then(|node| fresh.get(&node.master)) {
                Some(client) => {
                    // Not connected yet, so this only registers the channel.
                    let _ = client.subscribe(&channel, move |c, p| handler(c, p), |_| {});
                }
                None => warn!(%channel, "no node serves channel"),
            }
        }

        for client in fresh.values() {
            let _ = client.connect();
        }

        let count = fresh.len();
        let stale = {
            let mut clients = self.clients.lock().unwrap();
            self.topology.reset(map);
            std::mem::replace(&mut *clients, fresh)
        };
        for client in stale.values() {
            client.shutdown();
        }
        info!(clients = count, replaced = stale.len(), "pubsub clients rebuilt");
    }

    fn refresh(&self) -> Result<bool> {
        match self.topology.fetch_changed()? {
            Some(map) => {
                self.rebuild(map);
                Ok(true)
            }
            None => {
                debug!("pubsub topology unchanged");
                Ok(false)
            }
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
            Ok(Err(err)) => warn!(error = %err, "pubsub topology refresh failed"),
            Err(err) => warn!(error = %err, "pubsub topology refresh panicked"),
        }
    }
}
