use crate::command::Command;
use crate::reply::Reply;
use crate::slot;
use crate::Result;

/// Anything able to run a command synchronously: a standalone pool, a sentinel backed pool or a
/// cluster router. Command helpers are written against this trait.
pub trait SyncClient {
    /// Runs `cmd`. `slot` is the hash slot of the command's key, only used in cluster mode.
    fn execute_with_slot(&self, cmd: &Command, slot: Option<u16>) -> Result<Reply>;

    fn cluster_mode(&self) -> bool {
        false
    }

    fn execute(&self, cmd: &Command) -> Result<Reply> {
        self.execute_with_slot(cmd, None)
    }
}

/// Pairs a client with the slot hint of the next commands.
///
/// ```no_run
/// # use rustdis_client::{executor::{CommandExecutor, SyncClient}, Command, Result};
/// # fn get(client: &dyn SyncClient) -> Result<()> {
/// let mut executor = CommandExecutor::new(client);
/// executor.hash_slot(b"user:1");
/// let reply = executor.execute(&Command::new("GET").arg("user:1"))?;
/// # Ok(())
/// # }
/// ```
pub struct CommandExecutor<'a, C: ?Sized> {
    client: &'a C,
    slot: Option<u16>,
}

impl<'a, C: SyncClient + ?Sized> CommandExecutor<'a, C> {
    pub fn new(client: &'a C) -> Self {
        CommandExecutor { client, slot: None }
    }

    /// Routes the next commands by `key`. Ignored outside of cluster mode.
    pub fn hash_slot(&mut self, key: &[u8]) {
        if self.client.cluster_mode() {
            self.slot = Some(slot::hash_slot(key));
        }
    }

    pub fn reset_hash_slot(&mut self) {
        self.slot = None;
    }

    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    pub fn execute(&self, cmd: &Command) -> Result<Reply> {
        self.client.execute_with_slot(cmd, self.slot)
    }
}
