use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::config::{Address, ConnectionConfig, Role};
use crate::parser::Parser;
use crate::reply::Reply;
use crate::{Error, Result};

const READ_CHUNK: usize = 4096;

/// A blocking connection to one server.
///
/// Commands are written in full and the calling thread blocks until the complete reply has been
/// parsed. Any I/O or protocol failure breaks the connection for good: the socket is shut down and
/// every later call fails with [`Error::ConnectionClosed`].
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    address: Address,
    stream: TcpStream,
    parser: Parser,
    // Outbound command bytes, reused between calls.
    write_buf: BytesMut,
    role: Option<Role>,
    broken: bool,
}

impl Connection {
    /// Connects to `address` and runs the startup sequence: `AUTH` when a password is set,
    /// `SELECT` for a non zero database outside of cluster mode, then `ROLE`.
    #[instrument(name = "connect", skip(address, config), fields(address = %address))]
    pub fn open(address: &Address, config: &ConnectionConfig) -> Result<Connection> {
        let stream = connect_stream(address, config.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(config.io_timeout)?;
        stream.set_write_timeout(config.io_timeout)?;

        let mut conn = Connection {
            id: Uuid::new_v4(),
            address: address.clone(),
            stream,
            parser: Parser::with_max_len(config.max_buffer_size),
            write_buf: BytesMut::with_capacity(1024),
            role: None,
            broken: false,
        };
        conn.startup(config)?;

        debug!(id = %conn.id, role = ?conn.role, "connection established");
        Ok(conn)
    }

    fn startup(&mut self, config: &ConnectionConfig) -> Result<()> {
        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            self.expect_ok("AUTH", &Command::auth(password))?;
        }

        if config.db != 0 && !config.cluster_mode {
            self.expect_ok("SELECT", &Command::select(config.db))?;
        }

        self.refresh_role()?;
        Ok(())
    }

    fn expect_ok(&mut self, step: &'static str, cmd: &Command) -> Result<()> {
        match self.execute(cmd)? {
            Reply::Error(message) => Err(Error::Startup { step, message }),
            _ => Ok(()),
        }
    }

    /// Asks the server for its role again. Servers without `ROLE` leave the role unknown.
    pub fn refresh_role(&mut self) -> Result<Option<Role>> {
        let reply = self.execute(&Command::role())?;
        self.role = parse_role(&reply);
        if self.role.is_none() {
            debug!(id = %self.id, %reply, "role not reported");
        }
        Ok(self.role)
    }

    pub fn execute(&mut self, cmd: &Command) -> Result<Reply> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }

        let result = self.round_trip(cmd);
        if let Err(err) = &result {
            warn!(id = %self.id, address = %self.address, cmd = %cmd.name(), error = %err, "connection failed");
            self.close();
        }
        result
    }

    fn round_trip(&mut self, cmd: &Command) -> Result<Reply> {
        self.write_buf.clear();
        cmd.encode_into(&mut self.write_buf);
        self.stream.write_all(&self.write_buf)?;

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(reply) = self.parser.parse()? {
                return Ok(reply);
            }

            let n = match self.stream.read(&mut chunk) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.parser.push(&chunk[..n])?;
        }
    }

    /// `PING`, true when the server answered with anything but an error.
    pub fn ping(&mut self) -> bool {
        matches!(self.execute(&Command::ping()), Ok(ref reply) if !reply.is_error())
    }

    pub fn close(&mut self) {
        self.broken = true;
        self.parser.reset();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

fn connect_stream(address: &Address, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let Some(timeout) = timeout else {
        return TcpStream::connect((address.host.as_str(), address.port));
    };

    let mut last_err = None;
    for addr in address.resolve()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", address),
        )
    }))
}

/// First element of a `ROLE` reply.
pub fn parse_role(reply: &Reply) -> Option<Role> {
    reply.as_array()?.first()?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_role_replies() {
        let master = Reply::Array(vec![Reply::from("master"), Reply::Integer(0), Reply::Array(vec![])]);
        let replica = Reply::Array(vec![
            Reply::from("slave"),
            Reply::from("127.0.0.1"),
            Reply::Integer(6379),
        ]);

        assert_eq!(parse_role(&master), Some(Role::Master));
        assert_eq!(parse_role(&replica), Some(Role::Replica));
        assert_eq!(parse_role(&Reply::Error("ERR unknown command".into())), None);
        assert_eq!(parse_role(&Reply::Array(vec![])), None);
    }
}
