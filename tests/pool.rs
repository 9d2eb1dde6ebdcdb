mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use rustdis_client::config::{ConnectionConfig, PoolConfig, Role};
use rustdis_client::pool::EndpointPool;
use rustdis_client::reactor::Reactor;
use rustdis_client::{Command, Error, Reply};

use support::{respond, role_reply, standard, wait_until, FakeServer};

fn pool_config(min_size: usize) -> PoolConfig {
    PoolConfig {
        min_size,
        ..PoolConfig::default()
    }
}

#[test]
fn health_check_replaces_dead_connections() {
    let server = FakeServer::bind();
    let pool = EndpointPool::detached(server.address(), ConnectionConfig::default(), pool_config(2));
    pool.ensure_min_connections();
    assert_eq!(pool.total_count(), 2);
    assert_eq!(pool.free_count(), 2);

    server.drop_connections();
    pool.check_connections();

    assert_eq!(pool.total_count(), 2);
    assert_eq!(server.accepted(), 4);
    assert_eq!(
        pool.execute(&Command::ping()).unwrap(),
        Reply::from("PONG")
    );
}

#[test]
fn new_connections_with_unexpected_role_are_refused() {
    let server = FakeServer::start(|cmd| match cmd[0].as_str() {
        "ROLE" => respond(role_reply("slave")),
        _ => standard(cmd),
    });
    let config = PoolConfig {
        expected_role: Some(Role::Master),
        ..pool_config(1)
    };
    let pool = EndpointPool::detached(server.address(), ConnectionConfig::default(), config);

    assert!(pool.get_client().is_none());
    assert_eq!(pool.total_count(), 0);
    assert!(matches!(
        pool.execute(&Command::ping()),
        Err(Error::PoolExhausted(_))
    ));
}

#[test]
fn health_check_drops_demoted_connections() {
    let demoted = Arc::new(AtomicBool::new(false));
    let flag = demoted.clone();
    let server = FakeServer::start(move |cmd| match cmd[0].as_str() {
        "ROLE" if flag.load(Ordering::SeqCst) => respond(role_reply("slave")),
        _ => standard(cmd),
    });
    let config = PoolConfig {
        expected_role: Some(Role::Master),
        ..pool_config(2)
    };
    let pool = EndpointPool::detached(server.address(), ConnectionConfig::default(), config);
    pool.ensure_min_connections();
    assert_eq!(pool.total_count(), 2);

    demoted.store(true, Ordering::SeqCst);
    pool.check_connections();

    assert_eq!(pool.total_count(), 0);
    assert_eq!(pool.free_count(), 0);
}

#[test]
fn pool_without_role_expectation_accepts_replicas() {
    let server = FakeServer::start(|cmd| match cmd[0].as_str() {
        "ROLE" => respond(role_reply("slave")),
        _ => standard(cmd),
    });
    let pool = EndpointPool::detached(server.address(), ConnectionConfig::default(), pool_config(1));

    let conn = pool.get_client().unwrap();
    assert_eq!(conn.role(), Some(Role::Replica));
    pool.reclaim(conn);
    assert_eq!(pool.free_count(), 1);
}

#[test]
fn reset_address_moves_the_pool() {
    let old = FakeServer::bind();
    let new = FakeServer::bind();
    let pool = EndpointPool::detached(old.address(), ConnectionConfig::default(), pool_config(1));
    pool.ensure_min_connections();
    let checked_out = pool.get_client().unwrap();

    pool.reset_address(new.address());

    assert_eq!(pool.address(), new.address());
    assert_eq!(pool.free_count(), 0);

    // Came from the old address, dropped instead of reused.
    pool.reclaim(checked_out);
    assert_eq!(pool.free_count(), 0);
    assert_eq!(pool.total_count(), 0);

    pool.execute(&Command::new("SET").arg("k").arg("v")).unwrap();
    assert_eq!(new.commands_named("SET").len(), 1);
    assert!(old.commands_named("SET").is_empty());
}

#[test]
fn exhausted_pool_rejects_commands() {
    let server = FakeServer::bind();
    let config = PoolConfig {
        min_size: 0,
        max_size: 1,
        auto_extend: false,
        ..PoolConfig::default()
    };
    let pool = EndpointPool::detached(server.address(), ConnectionConfig::default(), config);

    let held = pool.get_client().unwrap();
    assert!(matches!(
        pool.execute(&Command::ping()),
        Err(Error::PoolExhausted(_))
    ));

    pool.reclaim(held);
    assert!(pool.execute(&Command::ping()).is_ok());
}

#[test]
#[serial]
fn background_health_check_refills_pool() {
    let reactor = Reactor::new().unwrap();
    let server = FakeServer::bind();
    let config = PoolConfig {
        health_check_interval: Duration::from_millis(50),
        ..pool_config(2)
    };
    let pool = EndpointPool::new(
        &reactor.handle(),
        server.address(),
        ConnectionConfig::default(),
        config,
    );
    pool.ensure_min_connections();
    assert_eq!(server.accepted(), 2);

    server.drop_connections();

    assert!(wait_until(Duration::from_secs(5), || server.accepted() >= 4
        && pool.free_count() == 2));
    assert_eq!(pool.total_count(), 2);
}
