mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serial_test::serial;

use rustdis_client::config::{
    Address, AsyncConfig, ConnectionConfig, PoolConfig, SentinelConfig,
};
use rustdis_client::executor::SyncClient;
use rustdis_client::sentinel::{
    MasterAddressChange, SentinelAsyncClient, SentinelPool, SentinelWatcher, SWITCH_MASTER_CHANNEL,
};
use rustdis_client::{Command, Error, Reply};

use support::{message, respond, standard, wait_until, FakeServer};

const WAIT: Duration = Duration::from_secs(5);
const MASTER: &str = "mymaster";

/// A sentinel reporting `master` for [`MASTER`] and nothing for any other name.
fn sentinel(master: Arc<Mutex<Address>>) -> FakeServer {
    FakeServer::start(move |cmd| match cmd[0].as_str() {
        "SENTINEL" if cmd.get(2).map(String::as_str) == Some(MASTER) => {
            let address = master.lock().unwrap().clone();
            respond(Reply::Array(vec![
                Reply::from(address.host.as_str()),
                Reply::from(address.port.to_string().as_str()),
            ]))
        }
        "SENTINEL" => respond(Reply::Nil),
        _ => standard(cmd),
    })
}

fn config(sentinels: &[Address]) -> SentinelConfig {
    SentinelConfig {
        sentinels: sentinels.to_vec(),
        client: AsyncConfig {
            reconnect_interval: Duration::from_millis(100),
            ..AsyncConfig::default()
        },
        ..SentinelConfig::default()
    }
}

fn switch(from: &Address, to: &Address) -> String {
    format!("{} {} {} {} {}", MASTER, from.host, from.port, to.host, to.port)
}

/// Waits for the watcher's subscriber to be subscribed on `sentinel`.
fn wait_subscribed(sentinel: &FakeServer) {
    assert!(wait_until(WAIT, || !sentinel
        .commands_named("SUBSCRIBE")
        .is_empty()));
    // The confirmation is written right after the command is recorded.
    std::thread::sleep(Duration::from_millis(50));
}

#[test]
fn lookup_asks_the_sentinels() {
    let master = FakeServer::bind();
    let sentinel = sentinel(Arc::new(Mutex::new(master.address())));
    let watcher = SentinelWatcher::connect(config(&[sentinel.address()])).unwrap();

    assert_eq!(watcher.master_address(MASTER).unwrap(), master.address());
    assert_eq!(watcher.known_address(MASTER), Some(master.address()));
    assert_eq!(
        sentinel.commands_named("SENTINEL")[0],
        vec!["SENTINEL", "get-master-addr-by-name", MASTER]
    );
    assert!(matches!(
        watcher.master_address("unknown"),
        Err(Error::MasterNotFound(_))
    ));
}

#[test]
fn unreachable_sentinels_are_skipped() {
    let master = FakeServer::bind();
    let sentinel = sentinel(Arc::new(Mutex::new(master.address())));
    let watcher =
        SentinelWatcher::connect(config(&[support::closed_address(), sentinel.address()])).unwrap();

    assert_eq!(watcher.master_address(MASTER).unwrap(), master.address());
}

#[test]
fn no_reachable_sentinel_fails() {
    let result = SentinelWatcher::connect(config(&[support::closed_address()]));

    assert!(result.is_err());
}

#[test]
#[serial]
fn switch_events_reach_subscribers() {
    let old = FakeServer::bind();
    let new = FakeServer::bind();
    let sentinel = sentinel(Arc::new(Mutex::new(old.address())));
    let watcher = SentinelWatcher::connect(config(&[sentinel.address()])).unwrap();
    let mut events = watcher.subscribe();
    watcher.master_address(MASTER).unwrap();
    wait_subscribed(&sentinel);

    sentinel.push(&message(SWITCH_MASTER_CHANNEL, "not a switch message"));
    sentinel.push(&message(
        SWITCH_MASTER_CHANNEL,
        &switch(&old.address(), &new.address()),
    ));

    assert!(wait_until(WAIT, || watcher.known_address(MASTER) == Some(new.address())));
    assert_eq!(
        events.try_recv().unwrap(),
        MasterAddressChange {
            master_name: MASTER.to_string(),
            old: old.address(),
            new: new.address(),
        }
    );
    assert!(events.try_recv().is_err());
    assert_eq!(watcher.known_address(MASTER), Some(new.address()));
}

#[test]
#[serial]
fn published_switch_repoints_pool() {
    let old = FakeServer::bind();
    let new = FakeServer::bind();
    let reported = Arc::new(Mutex::new(old.address()));
    let sentinel = sentinel(reported.clone());
    let watcher = SentinelWatcher::connect(config(&[sentinel.address()])).unwrap();
    let pool = SentinelPool::new(
        &watcher,
        MASTER,
        ConnectionConfig::default(),
        PoolConfig::default(),
    )
    .unwrap();
    pool.execute(&Command::new("SET").arg("k").arg("1")).unwrap();
    assert_eq!(old.commands_named("SET").len(), 1);

    wait_subscribed(&sentinel);
    *reported.lock().unwrap() = new.address();
    sentinel.push(&message(
        SWITCH_MASTER_CHANNEL,
        &switch(&old.address(), &new.address()),
    ));

    assert!(wait_until(WAIT, || pool.address() == new.address()));
    pool.execute(&Command::new("SET").arg("k").arg("2")).unwrap();
    assert_eq!(new.commands_named("SET").len(), 1);
    assert_eq!(old.commands_named("SET").len(), 1);
}

#[test]
#[serial]
fn malformed_switch_is_ignored() {
    let master = FakeServer::bind();
    let sentinel = sentinel(Arc::new(Mutex::new(master.address())));
    let watcher = SentinelWatcher::connect(config(&[sentinel.address()])).unwrap();
    let pool = SentinelPool::new(
        &watcher,
        MASTER,
        ConnectionConfig::default(),
        PoolConfig::default(),
    )
    .unwrap();
    let mut events = watcher.subscribe();

    wait_subscribed(&sentinel);
    sentinel.push(&message(SWITCH_MASTER_CHANNEL, "mymaster 127.0.0.1 1 127.0.0.1"));
    std::thread::sleep(Duration::from_millis(200));

    assert!(events.try_recv().is_err());
    assert_eq!(pool.address(), master.address());
}

#[test]
#[serial]
fn async_client_follows_switch() {
    let old = FakeServer::bind();
    let new = FakeServer::bind();
    let sentinel = sentinel(Arc::new(Mutex::new(old.address())));
    let watcher = SentinelWatcher::connect(config(&[sentinel.address()])).unwrap();
    let client = SentinelAsyncClient::new(
        &watcher,
        MASTER,
        AsyncConfig {
            reconnect_interval: Duration::from_millis(100),
            ..AsyncConfig::default()
        },
    )
    .unwrap();
    client.connect_and_wait().unwrap();
    assert_eq!(client.uri().address, old.address());

    wait_subscribed(&sentinel);
    sentinel.push(&message(
        SWITCH_MASTER_CHANNEL,
        &switch(&old.address(), &new.address()),
    ));

    assert!(wait_until(WAIT, || new.accepted() == 1 && client.is_connected()));
    assert_eq!(client.uri().address, new.address());
    assert_eq!(
        client.execute_blocking(&Command::ping(), WAIT).unwrap(),
        Reply::from("PONG")
    );
    assert_eq!(new.commands_named("PING").len(), 1);
}
