use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use tracing::{debug, info, instrument, warn};

use crate::command::Command;
use crate::config::{Address, ConnectionConfig};
use crate::connection::Connection;
use crate::reply::Reply;
use crate::slot::SLOT_COUNT;
use crate::{Error, Result};

/// Inclusive range of hash slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn contains(&self, slot: u16) -> bool {
        self.start <= slot && slot <= self.end
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub master: Address,
    pub replicas: Vec<Address>,
}

/// Slot ranges and the nodes serving them, as reported by `CLUSTER SLOTS`.
///
/// Ranges are trusted as reported, overlaps are not checked.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotMap {
    ranges: BTreeMap<SlotRange, NodeInfo>,
}

impl SlotMap {
    pub fn new() -> SlotMap {
        SlotMap::default()
    }

    /// Parses a `CLUSTER SLOTS` reply: an array of `[start, end, master, replica...]` entries where
    /// every node is `[ip, port, ...]`. Malformed entries are skipped.
    pub fn from_cluster_slots(reply: &Reply) -> Result<SlotMap> {
        let entries = reply
            .as_array()
            .ok_or_else(|| Error::UnexpectedReply(reply.to_string()))?;

        let mut map = SlotMap::new();
        for entry in entries {
            match parse_entry(entry) {
                Some((range, node)) => map.insert(range, node),
                None => warn!(%entry, "skipping invalid slot range"),
            }
        }
        Ok(map)
    }

    pub fn insert(&mut self, range: SlotRange, node: NodeInfo) {
        self.ranges.insert(range, node);
    }

    pub fn lookup(&self, slot: u16) -> Option<&NodeInfo> {
        self.ranges
            .range(..=SlotRange {
                start: slot,
                end: u16::MAX,
            })
            .rev()
            .find(|(range, _)| range.contains(slot))
            .map(|(_, node)| node)
    }

    pub fn ranges(&self) -> impl Iterator<Item = (&SlotRange, &NodeInfo)> {
        self.ranges.iter()
    }

    /// Distinct master addresses, sorted.
    pub fn masters(&self) -> Vec<Address> {
        self.ranges
            .values()
            .map(|node| node.master.clone())
            .sorted()
            .dedup()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True when the number of ranges differs or any range maps to a different master or replica
    /// list.
    pub fn has_changed(&self, other: &SlotMap) -> bool {
        self.ranges.len() != other.ranges.len()
            || self
                .ranges
                .iter()
                .zip(other.ranges.iter())
                .any(|(a, b)| a != b)
    }

    fn owners(&self) -> Box<[Option<Arc<Address>>]> {
        let mut owners = vec![None; SLOT_COUNT as usize].into_boxed_slice();
        for (range, node) in &self.ranges {
            let master = Arc::new(node.master.clone());
            for slot in range.start..=range.end {
                owners[slot as usize] = Some(master.clone());
            }
        }
        owners
    }
}

fn parse_entry(entry: &Reply) -> Option<(SlotRange, NodeInfo)> {
    let items = entry.as_array()?;
    if items.len() < 3 {
        return None;
    }

    let start = u16::try_from(items[0].as_integer()?).ok()?;
    let end = u16::try_from(items[1].as_integer()?).ok()?;
    if start > end || end >= SLOT_COUNT {
        return None;
    }

    let master = parse_node(&items[2])?;
    let replicas = items[3..].iter().filter_map(parse_node).collect();

    Some((SlotRange { start, end }, NodeInfo { master, replicas }))
}

fn parse_node(node: &Reply) -> Option<Address> {
    let items = node.as_array()?;
    let host = items.first()?.as_str()?;
    let port = u16::try_from(items.get(1)?.as_integer()?).ok()?;
    Some(Address::new(host, port))
}

/// The cluster layout currently in use, with a per slot owner table for routing.
///
/// Seed nodes are asked for `CLUSTER SLOTS` in turn until one answers. Once a layout is loaded the
/// seed list becomes the set of masters it names.
pub struct TopologyCache {
    connection: ConnectionConfig,
    seeds: Mutex<Vec<Address>>,
    state: Mutex<Topology>,
}

struct Topology {
    map: SlotMap,
    owners: Box<[Option<Arc<Address>>]>,
}

impl TopologyCache {
    pub fn new(seeds: Vec<Address>, connection: ConnectionConfig) -> TopologyCache {
        let map = SlotMap::new();
        let owners = map.owners();
        TopologyCache {
            connection,
            seeds: Mutex::new(seeds),
            state: Mutex::new(Topology { map, owners }),
        }
    }

    /// Reads the slot map from the first seed that answers.
    #[instrument(skip(self))]
    pub fn fetch(&self) -> Result<SlotMap> {
        let seeds = self.seeds();
        for seed in &seeds {
            let reply = Connection::open(seed, &self.connection)
                .and_then(|mut conn| conn.execute(&Command::cluster_slots()));

            match reply {
                Ok(Reply::Error(message)) => warn!(%seed, %message, "CLUSTER SLOTS failed"),
                Ok(reply) => match SlotMap::from_cluster_slots(&reply) {
                    Ok(map) if !map.is_empty() => return Ok(map),
                    Ok(_) => warn!(%seed, "seed reported no slots"),
                    Err(err) => warn!(%seed, error = %err, "invalid CLUSTER SLOTS reply"),
                },
                Err(err) => warn!(%seed, error = %err, "seed unreachable"),
            }
        }

        Err(Error::TopologyUnavailable(
            seeds.iter().map(Address::to_string).join(";"),
        ))
    }

    /// Fetches the slot map and returns it when it differs from the cached one. Nothing is
    /// installed: the caller builds its connections for the new layout first and then commits it
    /// with [`TopologyCache::reset`].
    pub fn fetch_changed(&self) -> Result<Option<SlotMap>> {
        let fresh = self.fetch()?;
        if !self.state.lock().unwrap().map.has_changed(&fresh) {
            debug!("cluster topology unchanged");
            return Ok(None);
        }

        info!(ranges = fresh.len(), "cluster topology changed");
        Ok(Some(fresh))
    }

    /// Replaces the cached layout wholesale and reseeds from its masters.
    pub fn reset(&self, map: SlotMap) {
        let masters = map.masters();
        let owners = map.owners();

        *self.state.lock().unwrap() = Topology { map, owners };
        if !masters.is_empty() {
            *self.seeds.lock().unwrap() = masters;
        }
    }

    pub fn owner(&self, slot: u16) -> Option<Arc<Address>> {
        self.state
            .lock()
            .unwrap()
            .owners
            .get(slot as usize)
            .cloned()
            .flatten()
    }

    pub fn slot_map(&self) -> SlotMap {
        self.state.lock().unwrap().map.clone()
    }

    pub fn seeds(&self) -> Vec<Address> {
        self.seeds.lock().unwrap().clone()
    }
}
