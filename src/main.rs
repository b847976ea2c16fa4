mod command;
mod connection;
mod db;
mod error;
mod handler;
mod rdb;
mod replica;
mod resp;
mod stream;
mod token;

pub use crate::error::{Error, Result};

use std::collections::HashMap;
use std::io::{Cursor, ErrorKind};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use binrw::BinRead;
use clap::Parser;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::connection::Connection;
use crate::db::{Db, Role, ServerInfo, ServerState};
use crate::handler::{handle_connection, handle_replica_event, resolve_pending, Outcome};
use crate::rdb::Rdb;
use crate::resp::RespValue;
use crate::token::{is_replica_token, MASTER, SERVER};

#[derive(Parser)]
#[command(version, about = "Wire-compatible in-memory key/value server", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 6379)]
    port: u16,
    /// "<host> <port>" of the master to replicate from
    #[arg(long)]
    replicaof: Option<String>,
    /// Directory holding the snapshot file
    #[arg(long, default_value_t = String::from("/tmp/redis-files"))]
    dir: String,
    #[arg(long, default_value_t = String::from("dump.rdb"))]
    dbfilename: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();

    let mut role = Role::Master;
    let mut state = ServerState::Ready;
    let mut master_stream = None;
    if let Some(replicaof) = &args.replicaof {
        role = Role::Slave;
        state = ServerState::BeforePing;

        let parts: Vec<&str> = replicaof.split_whitespace().collect();
        let [host, port] = parts.as_slice() else {
            return Err(Error::InvalidMasterAddr.into());
        };
        let addr = format!("{host}:{port}");
        let stream = std::net::TcpStream::connect(&addr)
            .with_context(|| format!("failed to reach master at {addr}"))?;
        stream.set_nonblocking(true)?;
        master_stream = Some(mio::net::TcpStream::from_std(stream));
    }

    let info = ServerInfo::build(role, args.port, &args.dir, &args.dbfilename);
    let mut db = Db::new(info, state);

    // Seed the store from the snapshot when one is present; a malformed
    // file aborts startup.
    let snapshot = Path::new(&args.dir).join(&args.dbfilename);
    if snapshot.exists() {
        let bytes = std::fs::read(&snapshot)
            .with_context(|| format!("failed to read snapshot {}", snapshot.display()))?;
        let rdb = Rdb::read(&mut Cursor::new(bytes))
            .map_err(Error::from)
            .with_context(|| format!("failed to parse snapshot {}", snapshot.display()))?;
        db.load_rdb(&rdb);
    }

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);

    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", args.port).parse()?;
    let mut listener = TcpListener::bind(addr)?;
    poll.registry()
        .register(&mut listener, SERVER, Interest::READABLE)?;
    info!(port = args.port, role = %db.info.role, "listening");

    let mut connections: HashMap<mio::Token, Connection> = HashMap::new();

    // A replica starts the handshake right away; replies arrive as
    // readiness events on the MASTER token.
    let mut master_conn = match master_stream {
        Some(mut stream) => {
            poll.registry()
                .register(&mut stream, MASTER, Interest::READABLE)?;
            let mut conn = Connection::new(stream);
            conn.write_value(&RespValue::command("PING"))?;
            Some(conn)
        }
        None => None,
    };

    loop {
        // Bounded poll so pending WAIT/XREAD deadlines fire between events.
        poll.poll(&mut events, Some(Duration::from_millis(50)))?;

        for event in events.iter() {
            match event.token() {
                SERVER => loop {
                    let (mut stream, peer) = match listener.accept() {
                        Ok(accepted) => accepted,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    };
                    let token = db.token_track.next_client_token();
                    poll.registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    info!(%peer, ?token, "accepted connection");
                    connections.insert(token, Connection::new(stream));
                },
                MASTER => {
                    let mut close_master = false;
                    if let Some(conn) = master_conn.as_mut() {
                        match handle_connection(conn, MASTER, &mut db, true) {
                            Ok(outcome) => close_master = outcome.closed,
                            Err(err) => warn!(%err, "error on master connection"),
                        }
                    }
                    if close_master {
                        if let Some(mut conn) = master_conn.take() {
                            poll.registry().deregister(&mut conn.stream)?;
                            warn!("master connection closed");
                        }
                    }
                }
                token if is_replica_token(token) => {
                    if let Err(err) = handle_replica_event(&mut db, token) {
                        warn!(?token, %err, "error on replica connection");
                        db.remove_replica(token);
                    }
                }
                token => {
                    let outcome = match connections.get_mut(&token) {
                        Some(conn) => handle_connection(conn, token, &mut db, false)
                            .unwrap_or_else(|err| {
                                warn!(?token, %err, "closing connection on error");
                                Outcome {
                                    closed: true,
                                    promote_to_replica: false,
                                }
                            }),
                        None => continue,
                    };

                    if outcome.promote_to_replica {
                        // The connection becomes a replica: move it out of
                        // the client map and into the fleet under a token
                        // from the replica band. Capacity was checked when
                        // the PSYNC was granted; a full band here only
                        // drops this connection.
                        if let Some(mut conn) = connections.remove(&token) {
                            poll.registry().deregister(&mut conn.stream)?;
                            match db.token_track.next_replica_token() {
                                Some(replica_token) => {
                                    poll.registry().register(
                                        &mut conn.stream,
                                        replica_token,
                                        Interest::READABLE,
                                    )?;
                                    db.register_replica(conn, replica_token);
                                }
                                None => {
                                    warn!(?token, "replica band exhausted, dropping connection");
                                }
                            }
                        }
                    } else if outcome.closed {
                        if let Some(mut conn) = connections.remove(&token) {
                            poll.registry().deregister(&mut conn.stream)?;
                            db.transactions.remove(&token);
                            info!(?token, "connection closed");
                        }
                    }
                }
            }
        }

        resolve_pending(&mut db, &mut connections);
    }
}
