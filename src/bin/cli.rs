use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::debug;

use rustdis_client::cluster::ClusterClient;
use rustdis_client::config::{
    AsyncConfig, ClusterConfig, ConnectionConfig, PoolConfig, SentinelConfig, Uri,
};
use rustdis_client::executor::{CommandExecutor, SyncClient};
use rustdis_client::pool::EndpointPool;
use rustdis_client::sentinel::{SentinelPool, SentinelWatcher};
use rustdis_client::{logging, Command, Error};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Standalone,
    Cluster,
    Sentinel,
}

/// Runs a single command and prints its reply.
#[derive(Parser, Debug)]
struct Args {
    /// How to reach the server
    #[arg(short, long, value_enum, default_value_t = Mode::Standalone)]
    mode: Mode,

    /// Server uri in standalone mode, `;` separated seed uris in cluster mode
    #[arg(short, long, env = "RUSTDIS_URI", default_value = "redis://127.0.0.1:6379")]
    uri: String,

    /// `;` separated `host:port` sentinels
    #[arg(long, env = "RUSTDIS_SENTINELS", default_value = "127.0.0.1:26379")]
    sentinels: String,

    /// Name of the master watched by the sentinels
    #[arg(long, default_value = "mymaster")]
    master: String,

    /// Key used to route the command in cluster mode, defaults to the first argument
    #[arg(short, long)]
    key: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log: String,

    /// Command name followed by its arguments
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

impl Args {
    fn to_command(&self) -> Command {
        let mut args = self.command.iter();
        let mut cmd = Command::new(args.next().map(String::as_str).unwrap_or("PING"));
        for arg in args {
            cmd.push_arg(arg);
        }
        cmd
    }

    fn routing_key(&self) -> Option<&str> {
        self.key
            .as_deref()
            .or_else(|| self.command.get(1).map(String::as_str))
    }
}

fn run_with(client: &dyn SyncClient, args: &Args) -> Result<(), Error> {
    let mut executor = CommandExecutor::new(client);
    if let Some(key) = args.routing_key() {
        executor.hash_slot(key.as_bytes());
    }

    let reply = executor.execute(&args.to_command())?;
    println!("{reply}");
    Ok(())
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    let _ = logging::init(&args.log).map_err(|e| debug!("Failed to initialize tracing: {}", e));

    match args.mode {
        Mode::Standalone => {
            let uri: Uri = args.uri.parse()?;
            let pool = EndpointPool::detached(
                uri.address.clone(),
                ConnectionConfig::from_uri(&uri),
                PoolConfig::default(),
            );
            run_with(&pool, &args)
        }
        Mode::Cluster => {
            let client = ClusterClient::connect(ClusterConfig::from_seeds(&args.uri)?)?;
            run_with(&client, &args)
        }
        Mode::Sentinel => {
            let config = SentinelConfig {
                client: AsyncConfig {
                    connect_timeout: Duration::from_secs(2),
                    ..AsyncConfig::default()
                },
                ..SentinelConfig::from_list(&args.sentinels)?
            };
            let watcher = SentinelWatcher::connect(config)?;
            let pool = SentinelPool::new(
                &watcher,
                &args.master,
                ConnectionConfig::default(),
                PoolConfig::default(),
            )?;
            run_with(&pool, &args)
        }
    }
}
