#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use rustdis_client::config::Address;
use rustdis_client::parser::Parser;
use rustdis_client::Reply;

/// Answers one command, `None` leaves it unanswered.
pub type Handler = Arc<dyn Fn(&[String]) -> Option<Vec<u8>> + Send + Sync>;

/// In-process server speaking just enough RESP for the client: every command is recorded and
/// answered by a replaceable handler.
pub struct FakeServer {
    address: Address,
    shared: Arc<Shared>,
}

struct Shared {
    handler: RwLock<Handler>,
    commands: Mutex<Vec<Vec<String>>>,
    clients: Mutex<Vec<TcpStream>>,
    accepted: Mutex<usize>,
    // Replies are written in pieces of this size when set.
    chunk_size: Option<usize>,
}

impl FakeServer {
    /// A server answering with [`standard`].
    pub fn bind() -> FakeServer {
        FakeServer::spawn(None)
    }

    pub fn start<F>(handler: F) -> FakeServer
    where
        F: Fn(&[String]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let server = FakeServer::bind();
        server.set_handler(handler);
        server
    }

    pub fn start_chunked<F>(chunk_size: usize, handler: F) -> FakeServer
    where
        F: Fn(&[String]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let server = FakeServer::spawn(Some(chunk_size));
        server.set_handler(handler);
        server
    }

    fn spawn(chunk_size: Option<usize>) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            handler: RwLock::new(Arc::new(standard) as Handler),
            commands: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            accepted: Mutex::new(0),
            chunk_size,
        });

        let accept = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                *accept.accepted.lock().unwrap() += 1;
                accept
                    .clients
                    .lock()
                    .unwrap()
                    .push(stream.try_clone().unwrap());
                let shared = accept.clone();
                thread::spawn(move || serve(stream, shared));
            }
        });

        FakeServer {
            address: Address::new("127.0.0.1", port),
            shared,
        }
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&[String]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        *self.shared.handler.write().unwrap() = Arc::new(handler);
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    pub fn uri(&self) -> String {
        format!("redis://{}", self.address)
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.shared.commands.lock().unwrap().clone()
    }

    /// Recorded commands called `name`, arguments included.
    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|cmd| cmd[0] == name)
            .collect()
    }

    pub fn clear_commands(&self) {
        self.shared.commands.lock().unwrap().clear();
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        *self.shared.accepted.lock().unwrap()
    }

    /// Writes `reply` to every open connection.
    pub fn push(&self, reply: &Reply) {
        let bytes = reply.serialize();
        for client in self.shared.clients.lock().unwrap().iter_mut() {
            let _ = client.write_all(&bytes);
        }
    }

    /// Closes every open connection from the server side.
    pub fn drop_connections(&self) {
        for client in self.shared.clients.lock().unwrap().drain(..) {
            let _ = client.shutdown(Shutdown::Both);
        }
    }
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut parser = Parser::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if parser.push(&chunk[..n]).is_err() {
            return;
        }

        while let Ok(Some(request)) = parser.parse() {
            let args = command_args(&request);
            if args.is_empty() {
                return;
            }
            shared.commands.lock().unwrap().push(args.clone());

            let handler = shared.handler.read().unwrap().clone();
            let Some(response) = handler(&args) else {
                continue;
            };
            if write_response(&mut stream, &response, shared.chunk_size).is_err() {
                return;
            }
        }
    }
}

fn write_response(stream: &mut TcpStream, response: &[u8], chunk_size: Option<usize>) -> std::io::Result<()> {
    let Some(size) = chunk_size else {
        return stream.write_all(response);
    };
    for piece in response.chunks(size) {
        stream.write_all(piece)?;
        stream.flush()?;
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Command name upper cased, followed by the arguments as sent.
fn command_args(request: &Reply) -> Vec<String> {
    let Some(items) = request.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let bytes: &[u8] = item.as_bytes().map(|b| &b[..]).unwrap_or(b"");
            let text = String::from_utf8_lossy(bytes).to_string();
            if i == 0 {
                text.to_uppercase()
            } else {
                text
            }
        })
        .collect()
}

/// Answers like a healthy master: `PONG`, a master `ROLE`, pub/sub confirmations and `+OK` for
/// anything else.
pub fn standard(cmd: &[String]) -> Option<Vec<u8>> {
    let reply = match cmd[0].as_str() {
        "PING" => status("PONG"),
        "ROLE" => role_reply("master"),
        "SUBSCRIBE" => Reply::Array(vec![
            Reply::from("subscribe"),
            Reply::from(cmd[1].as_str()),
            Reply::Integer(1),
        ]),
        "UNSUBSCRIBE" => Reply::Array(vec![
            Reply::from("unsubscribe"),
            Reply::from(cmd[1].as_str()),
            Reply::Integer(0),
        ]),
        "PUBLISH" => Reply::Integer(1),
        _ => status("OK"),
    };
    Some(reply.serialize())
}

pub fn status(text: &str) -> Reply {
    Reply::from(text)
}

pub fn error(message: &str) -> Option<Vec<u8>> {
    Some(format!("-{}\r\n", message).into_bytes())
}

pub fn respond(reply: Reply) -> Option<Vec<u8>> {
    Some(reply.serialize())
}

pub fn role_reply(role: &str) -> Reply {
    Reply::Array(vec![Reply::from(role), Reply::Integer(0), Reply::Array(vec![])])
}

/// `["message", channel, payload]`.
pub fn message(channel: &str, payload: &str) -> Reply {
    Reply::Array(vec![
        Reply::from("message"),
        Reply::from(channel),
        Reply::from(payload),
    ])
}

/// `CLUSTER SLOTS` reply with a master and no replicas per range.
pub fn cluster_slots(ranges: &[(u16, u16, &Address)]) -> Reply {
    Reply::Array(
        ranges
            .iter()
            .map(|(start, end, address)| {
                Reply::Array(vec![
                    Reply::Integer(*start as i64),
                    Reply::Integer(*end as i64),
                    Reply::Array(vec![
                        Reply::from(address.host.as_str()),
                        Reply::Integer(address.port as i64),
                    ]),
                ])
            })
            .collect(),
    )
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A port nothing listens on.
pub fn closed_address() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Address::new("127.0.0.1", port)
}
