use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use strum_macros::{Display, EnumString};

use crate::buffer::Buffer;
use crate::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;

const URI_PREFIX: &str = "redis://";

/// A `host:port` pair. The host may be a name, it is resolved when connecting.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Address {
        Address {
            host: host.into(),
            port,
        }
    }

    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidUri(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Address::new(host, port))
    }
}

/// Connection target in the `redis://password@host:port/db` form. Every part after the scheme is
/// optional.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Uri {
    pub password: Option<String>,
    pub address: Address,
    pub db: i64,
}

impl Uri {
    pub fn new(address: Address) -> Uri {
        Uri {
            address,
            ..Uri::default()
        }
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidUri(s.to_string());
        let rest = s.trim().strip_prefix(URI_PREFIX).ok_or_else(invalid)?;

        let (password, rest) = match rest.rsplit_once('@') {
            Some((password, rest)) => (Some(password.to_string()), rest),
            None => (None, rest),
        };
        let (host_port, db) = match rest.split_once('/') {
            Some((host_port, "")) => (host_port, 0),
            Some((host_port, db)) => (host_port, db.parse().map_err(|_| invalid())?),
            None => (rest, 0),
        };
        let address = match host_port.rsplit_once(':') {
            Some((host, port)) => Address::new(
                if host.is_empty() { DEFAULT_HOST } else { host },
                port.parse().map_err(|_| invalid())?,
            ),
            None if host_port.is_empty() => Address::default(),
            None => Address::new(host_port, DEFAULT_PORT),
        };

        Ok(Uri {
            password: password.filter(|p| !p.is_empty()),
            address,
            db,
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}@{}/{}",
            URI_PREFIX,
            self.password.as_deref().unwrap_or(""),
            self.address,
            self.db
        )
    }
}

/// Splits a `;` separated list, skipping blank entries.
pub fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(';').map(str::trim).filter(|s| !s.is_empty())
}

pub fn parse_uri_list(list: &str) -> Result<Vec<Uri>, Error> {
    split_list(list).map(Uri::from_str).collect()
}

pub fn parse_address_list(list: &str) -> Result<Vec<Address>, Error> {
    split_list(list).map(Address::from_str).collect()
}

/// Role reported by the `ROLE` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    Master,
    #[strum(serialize = "slave", serialize = "replica")]
    Replica,
    Sentinel,
}

/// Settings shared by every synchronous connection to one endpoint.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub password: Option<String>,
    pub db: i64,
    /// Cluster nodes only have database 0, `SELECT` is skipped.
    pub cluster_mode: bool,
    pub connect_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
    pub max_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn from_uri(uri: &Uri) -> ConnectionConfig {
        ConnectionConfig {
            password: uri.password.clone(),
            db: uri.db,
            ..ConnectionConfig::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            password: None,
            db: 0,
            cluster_mode: false,
            connect_timeout: Some(Duration::from_secs(1)),
            io_timeout: None,
            max_buffer_size: Buffer::default_max_len(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Grow `max_size` by one when the pool is saturated, up to `max_size_ceiling`.
    pub auto_extend: bool,
    pub max_size_ceiling: usize,
    pub health_check_interval: Duration,
    /// When set, connections reporting another role are not kept.
    pub expected_role: Option<Role>,
}

impl PoolConfig {
    pub fn min_size(&self) -> usize {
        self.min_size.min(self.max_size)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 1,
            max_size: 10,
            auto_extend: true,
            max_size_ceiling: 25,
            health_check_interval: Duration::from_secs(5),
            expected_role: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub seeds: Vec<Uri>,
    pub pool: PoolConfig,
    pub connect_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
    pub max_redirects: usize,
    pub refresh_interval: Duration,
}

impl ClusterConfig {
    /// `seeds` is a `;` separated list of uris, the password of the first one is used for every
    /// node.
    pub fn from_seeds(seeds: &str) -> Result<ClusterConfig, Error> {
        let seeds = parse_uri_list(seeds)?;
        if seeds.is_empty() {
            return Err(Error::InvalidUri("empty seed list".to_string()));
        }
        Ok(ClusterConfig {
            seeds,
            ..ClusterConfig::default()
        })
    }

    pub fn password(&self) -> Option<String> {
        self.seeds.first().and_then(|uri| uri.password.clone())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            password: self.password(),
            db: 0,
            cluster_mode: true,
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            ..ConnectionConfig::default()
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            seeds: Vec::new(),
            pool: PoolConfig::default(),
            connect_timeout: Some(Duration::from_secs(1)),
            io_timeout: None,
            max_redirects: 15,
            refresh_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AsyncConfig {
    pub uri: Uri,
    pub cluster_mode: bool,
    /// Sends are rejected once this many requests are waiting to be written.
    pub max_send_queue: usize,
    pub ping_interval: Duration,
    pub reconnect_interval: Duration,
    /// How long [`connect_and_wait`](crate::async_client::AsyncClient::connect_and_wait) blocks.
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    pub max_buffer_size: usize,
}

impl AsyncConfig {
    pub fn new(uri: Uri) -> AsyncConfig {
        AsyncConfig {
            uri,
            ..AsyncConfig::default()
        }
    }
}

impl Default for AsyncConfig {
    fn default() -> Self {
        AsyncConfig {
            uri: Uri::default(),
            cluster_mode: false,
            max_send_queue: 0x1000,
            ping_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            read_buffer_size: 0xffff,
            max_buffer_size: Buffer::default_max_len(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SentinelConfig {
    pub sentinels: Vec<Address>,
    pub lookup_timeout: Duration,
    /// Template for the clients talking to every sentinel, the uri is replaced per sentinel.
    pub client: AsyncConfig,
}

impl SentinelConfig {
    /// `sentinels` is a `;` separated list of `host:port` pairs.
    pub fn from_list(sentinels: &str) -> Result<SentinelConfig, Error> {
        let sentinels = parse_address_list(sentinels)?;
        if sentinels.is_empty() {
            return Err(Error::InvalidUri("empty sentinel list".to_string()));
        }
        Ok(SentinelConfig {
            sentinels,
            ..SentinelConfig::default()
        })
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        SentinelConfig {
            sentinels: Vec::new(),
            lookup_timeout: Duration::from_secs(1),
            client: AsyncConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_uri() {
        let uri: Uri = "redis://foobared@localhost:6380/2".parse().unwrap();

        assert_eq!(uri.password.as_deref(), Some("foobared"));
        assert_eq!(uri.address, Address::new("localhost", 6380));
        assert_eq!(uri.db, 2);
        assert_eq!(uri.to_string(), "redis://foobared@localhost:6380/2");
    }

    #[test]
    fn parse_partial_uris() {
        let uri: Uri = "redis://10.0.0.1:7000".parse().unwrap();
        assert_eq!(uri.password, None);
        assert_eq!(uri.address, Address::new("10.0.0.1", 7000));
        assert_eq!(uri.db, 0);

        let uri: Uri = "redis://@host/3".parse().unwrap();
        assert_eq!(uri.password, None);
        assert_eq!(uri.address, Address::new("host", DEFAULT_PORT));
        assert_eq!(uri.db, 3);

        let uri: Uri = "redis://".parse().unwrap();
        assert_eq!(uri, Uri::default());
        assert_eq!(uri.to_string(), "redis://@127.0.0.1:6379/0");
    }

    #[test]
    fn reject_invalid_uris() {
        assert!(matches!("http://host".parse::<Uri>(), Err(Error::InvalidUri(_))));
        assert!(matches!("redis://host:port".parse::<Uri>(), Err(Error::InvalidUri(_))));
        assert!(matches!("redis://host:1/x".parse::<Uri>(), Err(Error::InvalidUri(_))));
    }

    #[test]
    fn parse_lists() {
        let seeds = parse_uri_list("redis://a@h1:1; redis://h2:2 ;;").unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[1].address, Address::new("h2", 2));

        let sentinels = parse_address_list("127.0.0.1:26379;127.0.0.1:26380").unwrap();
        assert_eq!(
            sentinels,
            vec![Address::new("127.0.0.1", 26379), Address::new("127.0.0.1", 26380)]
        );
        assert!(parse_address_list("nohost").is_err());
    }

    #[test]
    fn cluster_password_comes_from_first_seed() {
        let config = ClusterConfig::from_seeds("redis://secret@h1:1;redis://other@h2:2").unwrap();
        let conn = config.connection_config();

        assert_eq!(conn.password.as_deref(), Some("secret"));
        assert!(conn.cluster_mode);
        assert!(ClusterConfig::from_seeds(" ; ").is_err());
    }

    #[test]
    fn parse_roles() {
        assert_eq!("master".parse::<Role>().unwrap(), Role::Master);
        assert_eq!("slave".parse::<Role>().unwrap(), Role::Replica);
        assert_eq!("replica".parse::<Role>().unwrap(), Role::Replica);
        assert_eq!("SENTINEL".parse::<Role>().unwrap(), Role::Sentinel);
        assert_eq!(Role::Master.to_string(), "master");
    }

    #[test]
    fn pool_min_size_is_clamped() {
        let config = PoolConfig {
            min_size: 50,
            max_size: 4,
            ..PoolConfig::default()
        };
        assert_eq!(config.min_size(), 4);
    }
}
