use std::collections::HashMap;
use std::time::{Duration, Instant};

use mio::Token;
use tracing::{debug, info, warn};

use crate::command::{
    resolve_xread_ids, sync_xread, Command, ReplConfSub,
};
use crate::connection::Connection;
use crate::db::{Db, QueuedCommand, ServerState};
use crate::resp::{parse_command_frame, parse_rdb_payload, parse_value, RespValue};
use crate::{Error, Result};

/// The fixed empty snapshot sent to a replica right after `+FULLRESYNC`.
pub const EMPTY_RDB_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

/// What the event loop should do with a connection after one batch of
/// bytes has been processed.
#[derive(Debug, Default)]
pub struct Outcome {
    pub closed: bool,
    /// Set after a successful PSYNC: the connection leaves the client map
    /// and joins the replica fleet.
    pub promote_to_replica: bool,
}

fn is_handshaking(state: &ServerState) -> bool {
    matches!(
        state,
        ServerState::BeforePing
            | ServerState::BeforeReplConfPort
            | ServerState::BeforeReplConfCapa
            | ServerState::BeforePsync
            | ServerState::BeforeRdbFile
    )
}

/// Whether `token` owns the outstanding suspension. While it does, its
/// response queue is held: no further pipelined frame on that connection
/// may be answered ahead of the suspended reply.
fn suspended_for(state: &ServerState, token: Token) -> bool {
    matches!(
        state,
        ServerState::Waiting { client, .. } | ServerState::BlockingRead { client, .. }
            if *client == token
    )
}

/// Processes one readiness event worth of bytes on `conn`. `from_master`
/// marks the one connection a replica holds toward its master: replies on
/// it are suppressed and applied frames advance the replication offset.
pub fn handle_connection(
    conn: &mut Connection,
    token: Token,
    db: &mut Db,
    from_master: bool,
) -> Result<Outcome> {
    let appended = conn.receive()?;
    let mut outcome = Outcome::default();
    if appended == 0 && conn.closed {
        outcome.closed = true;
        return Ok(outcome);
    }

    if from_master {
        drive_handshake(conn, db)?;
        if is_handshaking(&db.state) {
            // mid-handshake with a partial reply buffered
            return Ok(outcome);
        }
    }

    // Multiple frames may have arrived coalesced; drain them all.
    while !conn.buffer.is_empty() {
        // A suspended WAIT or blocking XREAD holds this connection's
        // response queue; later frames stay buffered until it resolves.
        if suspended_for(&db.state, token) {
            break;
        }
        match parse_command_frame(&conn.buffer[..]) {
            Ok((rest, frame)) => {
                let consumed = conn.buffer.len() - rest.len();
                let raw = conn.buffer.split_to(consumed);
                dispatch(conn, token, db, &frame, &raw, from_master, &mut outcome)?;
                if outcome.promote_to_replica || outcome.closed {
                    break;
                }
            }
            Err(nom::Err::Incomplete(_)) => break,
            Err(err) => {
                if from_master {
                    warn!(?err, "discarding malformed bytes from master");
                    db.info.master_repl_offset += conn.buffer.len() as u64;
                    conn.buffer.clear();
                } else {
                    warn!(?token, ?err, "protocol error, dropping connection");
                    conn.write_value(&RespValue::SimpleError("ERR protocol error".to_string()))?;
                    conn.buffer.clear();
                    outcome.closed = true;
                }
                break;
            }
        }
    }

    if conn.closed {
        outcome.closed = true;
    }
    Ok(outcome)
}

/// Advances the replica-side handshake as far as the buffered replies
/// allow. Leaves streaming mode (`Ready`) once the snapshot transfer has
/// been consumed.
fn drive_handshake(conn: &mut Connection, db: &mut Db) -> Result<()> {
    loop {
        match db.state {
            ServerState::BeforePing
            | ServerState::BeforeReplConfPort
            | ServerState::BeforeReplConfCapa
            | ServerState::BeforePsync => match parse_value(&conn.buffer[..]) {
                Ok((rest, reply)) => {
                    let consumed = conn.buffer.len() - rest.len();
                    conn.buffer.split_to(consumed);
                    advance_handshake(conn, db, reply)?;
                }
                Err(nom::Err::Incomplete(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            },
            ServerState::BeforeRdbFile => match parse_rdb_payload(&conn.buffer[..]) {
                Ok((rest, blob)) => {
                    // The transferred snapshot seeds nothing here; offset
                    // accounting starts fresh after it.
                    debug!(len = blob.len(), "snapshot transfer consumed");
                    let consumed = conn.buffer.len() - rest.len();
                    conn.buffer.split_to(consumed);
                    db.info.master_repl_offset = 0;
                    db.state = ServerState::Ready;
                    info!("handshake complete, streaming from master");
                }
                Err(nom::Err::Incomplete(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            },
            _ => return Ok(()),
        }
    }
}

fn advance_handshake(conn: &mut Connection, db: &mut Db, reply: RespValue) -> Result<()> {
    match (&db.state, &reply) {
        (ServerState::BeforePing, RespValue::SimpleString(s)) if s == "PONG" => {
            let port = db.info.port;
            conn.write_value(&RespValue::command(&format!(
                "REPLCONF listening-port {port}"
            )))?;
            db.state = ServerState::BeforeReplConfPort;
        }
        (ServerState::BeforeReplConfPort, RespValue::SimpleString(s)) if s == "OK" => {
            conn.write_value(&RespValue::command("REPLCONF capa psync2"))?;
            db.state = ServerState::BeforeReplConfCapa;
        }
        (ServerState::BeforeReplConfCapa, RespValue::SimpleString(s)) if s == "OK" => {
            conn.write_value(&RespValue::command("PSYNC ? -1"))?;
            db.state = ServerState::BeforePsync;
        }
        (ServerState::BeforePsync, RespValue::SimpleString(s)) if s.starts_with("FULLRESYNC") => {
            debug!(reply = %s, "full resync granted");
            db.state = ServerState::BeforeRdbFile;
        }
        _ => return Err(Error::Handshake(format!("{reply:?}"))),
    }
    Ok(())
}

fn dispatch(
    conn: &mut Connection,
    token: Token,
    db: &mut Db,
    frame: &crate::resp::CommandFrame,
    raw: &[u8],
    from_master: bool,
    outcome: &mut Outcome,
) -> Result<()> {
    let command = match Command::parse(frame) {
        Ok(command) => command,
        Err(err) => {
            if from_master {
                warn!(name = %frame.name, %err, "unusable command from master");
                db.info.master_repl_offset += raw.len() as u64;
            } else {
                conn.write_value(&RespValue::SimpleError(err.to_string()))?;
            }
            return Ok(());
        }
    };

    if from_master {
        return apply_replicated(conn, db, &command, raw);
    }

    // A connection inside MULTI queues everything except EXEC/DISCARD.
    if db.transactions.contains_key(&token) {
        match command {
            Command::Exec => {
                if let Some(queued) = db.transactions.remove(&token) {
                    run_transaction(conn, db, queued)?;
                }
            }
            Command::Discard => {
                db.transactions.remove(&token);
                conn.write_value(&RespValue::SimpleString("OK".to_string()))?;
            }
            command => {
                if let Some(queue) = db.transactions.get_mut(&token) {
                    queue.push(QueuedCommand {
                        command,
                        raw: raw.to_vec(),
                    });
                }
                conn.write_value(&RespValue::SimpleString("QUEUED".to_string()))?;
            }
        }
        return Ok(());
    }

    match command {
        Command::Multi => {
            db.transactions.insert(token, Vec::new());
            conn.write_value(&RespValue::SimpleString("OK".to_string()))?;
        }
        Command::Exec => {
            conn.write_value(&RespValue::SimpleError(
                crate::error::CommandError::ExecWithoutMulti.to_string(),
            ))?;
        }
        Command::Discard => {
            conn.write_value(&RespValue::SimpleError(
                crate::error::CommandError::DiscardWithoutMulti.to_string(),
            ))?;
        }
        Command::Wait { goal, timeout_ms } => {
            handle_wait(conn, token, db, goal, timeout_ms)?;
        }
        Command::Xread {
            block: Some(block_ms),
            ref requests,
        } => {
            handle_blocking_xread(conn, token, db, block_ms, requests)?;
        }
        Command::Psync => {
            if !db.token_track.has_replica_capacity() {
                conn.write_value(&RespValue::SimpleError(
                    crate::error::CommandError::ReplicaLimit.to_string(),
                ))?;
                return Ok(());
            }
            let reply = format!(
                "FULLRESYNC {} {}",
                db.info.master_replid, db.info.master_repl_offset
            );
            conn.write_value(&RespValue::SimpleString(reply))?;
            let blob = hex::decode(EMPTY_RDB_HEX)?;
            conn.write_bytes(format!("${}\r\n", blob.len()).as_bytes())?;
            conn.write_bytes(&blob)?;
            outcome.promote_to_replica = true;
        }
        command => match command.execute(db) {
            Ok(Some(value)) => {
                conn.write_value(&value)?;
                if db.is_master() && command.is_write() {
                    db.propagate_write(raw);
                }
            }
            Ok(None) => {}
            Err(err) => {
                conn.write_value(&RespValue::SimpleError(err.to_string()))?;
            }
        },
    }
    Ok(())
}

/// Applies one frame received from the master. Replies are suppressed for
/// everything except `REPLCONF GETACK`, which answers with the offset as
/// it stood before this frame; the offset then advances by the frame's
/// length either way.
fn apply_replicated(
    conn: &mut Connection,
    db: &mut Db,
    command: &Command,
    raw: &[u8],
) -> Result<()> {
    match command {
        Command::ReplConf(ReplConfSub::GetAck) => {
            let offset = db.info.master_repl_offset;
            conn.write_value(&RespValue::command(&format!("REPLCONF ACK {offset}")))?;
        }
        command => {
            if let Err(err) = command.execute(db) {
                warn!(%err, "replicated command failed to apply");
            }
        }
    }
    db.info.master_repl_offset += raw.len() as u64;
    Ok(())
}

/// Runs a queued transaction. Suspending commands degrade to their
/// immediate forms inside EXEC; command errors become error frames inside
/// the reply array without aborting the rest of the queue.
fn run_transaction(conn: &mut Connection, db: &mut Db, queued: Vec<QueuedCommand>) -> Result<()> {
    let mut replies = Vec::with_capacity(queued.len());
    for QueuedCommand { command, raw } in queued {
        match command.execute(db) {
            Ok(Some(value)) => {
                if db.is_master() && command.is_write() {
                    db.propagate_write(&raw);
                }
                replies.push(value);
            }
            Ok(None) => {}
            Err(err) => replies.push(RespValue::SimpleError(err.to_string())),
        }
    }
    conn.write_value(&RespValue::Array(replies))
}

fn handle_wait(
    conn: &mut Connection,
    token: Token,
    db: &mut Db,
    goal: i64,
    timeout_ms: u64,
) -> Result<()> {
    if goal <= 0 {
        return conn.write_value(&RespValue::Integer(0));
    }
    if db.info.master_repl_offset == 0 {
        // nothing has been propagated, every replica is trivially caught up
        return conn.write_value(&RespValue::Integer(db.replicas.len() as i64));
    }

    db.broadcast_to_replicas(RespValue::command("REPLCONF GETACK *").to_string().as_bytes());
    db.state = ServerState::Waiting {
        since: Instant::now(),
        timeout: Duration::from_millis(timeout_ms),
        goal: goal as u64,
        acks: 0,
        client: token,
    };
    debug!(goal, timeout_ms, "WAIT armed");
    Ok(())
}

fn handle_blocking_xread(
    conn: &mut Connection,
    token: Token,
    db: &mut Db,
    block_ms: u64,
    requests: &[(String, String)],
) -> Result<()> {
    let watched = match resolve_xread_ids(db, requests) {
        Ok(watched) => watched,
        Err(err) => {
            return conn.write_value(&RespValue::SimpleError(err.to_string()));
        }
    };

    let has_data = watched
        .iter()
        .any(|(key, after)| !db.stream_entries_after(key, *after).is_empty());
    if has_data {
        let reply = sync_xread(db, &watched);
        return conn.write_value(&reply);
    }

    db.state = ServerState::BlockingRead {
        since: Instant::now(),
        timeout: (block_ms > 0).then(|| Duration::from_millis(block_ms)),
        watched,
        client: token,
    };
    debug!(block_ms, "blocking XREAD armed");
    Ok(())
}

/// Drains frames a replica sent back upstream. The only traffic expected
/// here is `REPLCONF ACK`, which feeds an outstanding WAIT; it is consumed
/// internally and never produces a reply toward anyone.
pub fn handle_replica_event(db: &mut Db, token: Token) -> Result<()> {
    let mut acks = 0u64;
    let mut closed = false;

    if let Some(replica) = db.replica_mut(token) {
        match replica.connection.receive() {
            Ok(_) => {}
            Err(err) => {
                warn!(?token, %err, "replica read failed");
                closed = true;
            }
        }
        while !closed && !replica.connection.buffer.is_empty() {
            match parse_command_frame(&replica.connection.buffer[..]) {
                Ok((rest, frame)) => {
                    let consumed = replica.connection.buffer.len() - rest.len();
                    replica.connection.buffer.split_to(consumed);
                    let is_ack = frame.name == "REPLCONF"
                        && frame
                            .args
                            .first()
                            .is_some_and(|sub| sub.eq_ignore_ascii_case("ack"));
                    if is_ack {
                        acks += 1;
                    } else {
                        debug!(name = %frame.name, "ignoring frame from replica");
                    }
                }
                Err(nom::Err::Incomplete(_)) => break,
                Err(err) => {
                    warn!(?token, ?err, "malformed frame from replica");
                    replica.connection.buffer.clear();
                    break;
                }
            }
        }
        if replica.connection.closed {
            closed = true;
        }
    }

    if acks > 0 {
        if let ServerState::Waiting { acks: got, .. } = &mut db.state {
            *got += acks;
        }
    }
    if closed {
        db.remove_replica(token);
    }
    Ok(())
}

/// One scheduler pass over the pending-completion singletons. Runs after
/// every poll round, so a WAIT or blocking XREAD resolves within one tick
/// of its goal, its wake-up or its deadline.
pub fn resolve_pending(db: &mut Db, connections: &mut HashMap<Token, Connection>) {
    match db.state.clone() {
        ServerState::Waiting {
            since,
            timeout,
            goal,
            acks,
            client,
        } => {
            if acks >= goal || since.elapsed() >= timeout {
                reply_and_clear(db, connections, client, &RespValue::Integer(acks as i64));
            }
        }
        ServerState::BlockingRead {
            since,
            timeout,
            watched,
            client,
        } => {
            let woken = watched
                .iter()
                .any(|(key, after)| !db.stream_entries_after(key, *after).is_empty());
            if woken {
                let reply = sync_xread(db, &watched);
                reply_and_clear(db, connections, client, &reply);
            } else if timeout.is_some_and(|t| since.elapsed() >= t) {
                reply_and_clear(db, connections, client, &RespValue::NullBulkString);
            }
        }
        _ => {}
    }
}

fn reply_and_clear(
    db: &mut Db,
    connections: &mut HashMap<Token, Connection>,
    client: Token,
    reply: &RespValue,
) {
    if let Some(conn) = connections.get_mut(&client) {
        if let Err(err) = conn.write_value(reply) {
            warn!(?client, %err, "failed to deliver pending reply");
        }
    }
    db.state = ServerState::Ready;

    // Frames pipelined behind the suspension were held back; answer them
    // now that the suspended reply has gone out first.
    if let Some(conn) = connections.get_mut(&client) {
        if !conn.buffer.is_empty() {
            if let Err(err) = handle_connection(conn, client, db, false) {
                warn!(?client, %err, "error draining held frames");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};

    use super::*;
    use crate::db::{Role, ServerInfo};
    use crate::stream::EntryId;
    use crate::token::MASTER;

    fn db_with_role(role: Role) -> Db {
        let info = ServerInfo::build(role, 6380, "/tmp/redis-files", "dump.rdb");
        Db::new(info, ServerState::Ready)
    }

    /// A loopback socket pair: the server side wrapped as a non-blocking
    /// [`Connection`], the client side a plain blocking stream with a
    /// short read timeout.
    fn pair() -> (Connection, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        (
            Connection::new(mio::net::TcpStream::from_std(server)),
            client,
        )
    }

    /// Writes `wire` from the client side, pumps the dispatcher until a
    /// response shows up (or half a second passes), and returns it.
    fn exchange(
        db: &mut Db,
        conn: &mut Connection,
        client: &mut StdStream,
        token: Token,
        wire: &[u8],
    ) -> Vec<u8> {
        client.write_all(wire).unwrap();
        let deadline = Instant::now() + Duration::from_millis(500);
        let mut response = Vec::new();
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            handle_connection(conn, token, db, false).unwrap();
            let mut buf = [0u8; 1024];
            if let Ok(n) = client.read(&mut buf) {
                if n > 0 {
                    response.extend_from_slice(&buf[..n]);
                    break;
                }
            }
        }
        response
    }

    /// Pumps the dispatcher without expecting any reply.
    fn pump(db: &mut Db, conn: &mut Connection, token: Token, from_master: bool) {
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(5));
            handle_connection(conn, token, db, from_master).unwrap();
        }
    }

    fn read_available(client: &mut StdStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(n) = client.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn ping_round_trips_over_a_socket() {
        let (mut conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        let reply = exchange(&mut db, &mut conn, &mut client, Token(100), b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(reply, b"+PONG\r\n");
    }

    #[test]
    fn transaction_queues_and_executes_in_order() {
        let (mut conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        let token = Token(100);

        let reply = exchange(&mut db, &mut conn, &mut client, token, b"*1\r\n$5\r\nMULTI\r\n");
        assert_eq!(reply, b"+OK\r\n");
        let reply = exchange(
            &mut db,
            &mut conn,
            &mut client,
            token,
            b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n",
        );
        assert_eq!(reply, b"+QUEUED\r\n");
        let reply = exchange(
            &mut db,
            &mut conn,
            &mut client,
            token,
            b"*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$1\r\n2\r\n",
        );
        assert_eq!(reply, b"+QUEUED\r\n");
        // nothing is applied while queued
        assert_eq!(db.get("a").unwrap(), None);

        let reply = exchange(&mut db, &mut conn, &mut client, token, b"*1\r\n$4\r\nEXEC\r\n");
        assert_eq!(reply, b"*2\r\n+OK\r\n+OK\r\n");
        assert_eq!(db.get("a").unwrap(), Some("1".to_string()));
        assert_eq!(db.get("b").unwrap(), Some("2".to_string()));
    }

    #[test]
    fn discard_drops_the_queue() {
        let (mut conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        let token = Token(100);

        exchange(&mut db, &mut conn, &mut client, token, b"*1\r\n$5\r\nMULTI\r\n");
        exchange(
            &mut db,
            &mut conn,
            &mut client,
            token,
            b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n",
        );
        let reply = exchange(&mut db, &mut conn, &mut client, token, b"*1\r\n$7\r\nDISCARD\r\n");
        assert_eq!(reply, b"+OK\r\n");
        assert_eq!(db.get("a").unwrap(), None);
        // the transaction is gone, EXEC now fails
        let reply = exchange(&mut db, &mut conn, &mut client, token, b"*1\r\n$4\r\nEXEC\r\n");
        assert_eq!(reply, b"-ERR EXEC without MULTI\r\n");
    }

    #[test]
    fn psync_promotes_the_connection_after_full_resync() {
        let (mut conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        let token = Token(100);

        client
            .write_all(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .unwrap();
        let mut promoted = false;
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline && !promoted {
            std::thread::sleep(Duration::from_millis(5));
            promoted = handle_connection(&mut conn, token, &mut db, false)
                .unwrap()
                .promote_to_replica;
        }
        assert!(promoted);

        let reply = read_available(&mut client);
        let header = format!(
            "+FULLRESYNC {} 0\r\n$88\r\n",
            crate::db::MASTER_REPLID
        );
        assert!(reply.starts_with(header.as_bytes()));
        assert_eq!(reply.len(), header.len() + 88);
    }

    #[test]
    fn blocking_xread_times_out_with_null_bulk() {
        let (conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        let token = Token(100);
        let mut connections = HashMap::new();
        connections.insert(token, conn);

        client
            .write_all(b"*6\r\n$5\r\nXREAD\r\n$5\r\nBLOCK\r\n$2\r\n10\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n$1\r\n$\r\n")
            .unwrap();
        {
            let conn = connections.get_mut(&token).unwrap();
            pump(&mut db, conn, token, false);
        }
        assert!(matches!(db.state, ServerState::BlockingRead { .. }));

        std::thread::sleep(Duration::from_millis(20));
        resolve_pending(&mut db, &mut connections);
        assert!(matches!(db.state, ServerState::Ready));
        assert_eq!(read_available(&mut client), b"$-1\r\n");
    }

    #[test]
    fn blocking_xread_wakes_on_append() {
        let (conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        let token = Token(100);
        let mut connections = HashMap::new();
        connections.insert(token, conn);

        client
            .write_all(b"*6\r\n$5\r\nXREAD\r\n$5\r\nBLOCK\r\n$1\r\n0\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n$1\r\n$\r\n")
            .unwrap();
        {
            let conn = connections.get_mut(&token).unwrap();
            pump(&mut db, conn, token, false);
        }
        assert!(matches!(db.state, ServerState::BlockingRead { .. }));

        // a timeout of 0 never fires
        resolve_pending(&mut db, &mut connections);
        assert!(matches!(db.state, ServerState::BlockingRead { .. }));

        db.xadd(
            "s",
            crate::stream::IdSpec::Explicit(EntryId::new(9, 1)),
            vec![("f".to_string(), "v".to_string())],
        )
        .unwrap();
        resolve_pending(&mut db, &mut connections);
        assert!(matches!(db.state, ServerState::Ready));
        assert_eq!(
            read_available(&mut client),
            b"*1\r\n*2\r\n$1\r\ns\r\n*1\r\n*2\r\n$3\r\n9-1\r\n*2\r\n$1\r\nf\r\n$1\r\nv\r\n"
        );
    }

    #[test]
    fn wait_counts_acks_from_replicas() {
        let (conn, mut client) = pair();
        let (replica_conn, mut replica_client) = pair();
        let mut db = db_with_role(Role::Master);
        let token = Token(100);
        let replica_token = Token(2);
        let mut connections = HashMap::new();
        connections.insert(token, conn);

        db.register_replica(replica_conn, replica_token);
        // one write has already been propagated
        db.propagate_write(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
        assert_eq!(read_available(&mut replica_client).len(), 31);

        client
            .write_all(b"*3\r\n$4\r\nWAIT\r\n$1\r\n1\r\n$3\r\n500\r\n")
            .unwrap();
        {
            let conn = connections.get_mut(&token).unwrap();
            pump(&mut db, conn, token, false);
        }
        assert!(matches!(db.state, ServerState::Waiting { .. }));

        // the replica sees the GETACK fan-out and answers
        let getack = read_available(&mut replica_client);
        assert_eq!(getack, b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n");
        replica_client
            .write_all(b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n31\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        handle_replica_event(&mut db, replica_token).unwrap();

        resolve_pending(&mut db, &mut connections);
        assert!(matches!(db.state, ServerState::Ready));
        assert_eq!(read_available(&mut client), b":1\r\n");
    }

    #[test]
    fn wait_with_nothing_propagated_reports_fleet_size() {
        let (mut conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        let reply = exchange(
            &mut db,
            &mut conn,
            &mut client,
            Token(100),
            b"*3\r\n$4\r\nWAIT\r\n$1\r\n1\r\n$3\r\n100\r\n",
        );
        assert_eq!(reply, b":0\r\n");
    }

    #[test]
    fn writes_propagate_verbatim_and_advance_offset() {
        let (mut conn, mut client) = pair();
        let (replica_conn, mut replica_client) = pair();
        let mut db = db_with_role(Role::Master);
        db.register_replica(replica_conn, Token(2));

        let wire = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let reply = exchange(&mut db, &mut conn, &mut client, Token(100), wire);
        assert_eq!(reply, b"+OK\r\n");
        assert_eq!(read_available(&mut replica_client), wire);
        assert_eq!(db.info.master_repl_offset, wire.len() as u64);
    }

    #[test]
    fn replica_applies_master_stream_silently_and_acks() {
        let (mut conn, mut master) = pair();
        let mut db = db_with_role(Role::Slave);

        let set = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let ping = b"*1\r\n$4\r\nPING\r\n";
        master.write_all(set).unwrap();
        master.write_all(ping).unwrap();
        pump(&mut db, &mut conn, MASTER, true);

        assert_eq!(db.get("foo").unwrap(), Some("bar".to_string()));
        assert_eq!(db.info.master_repl_offset, (set.len() + ping.len()) as u64);
        // no response frames leaked back to the master
        assert!(read_available(&mut master).is_empty());

        let getack = b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n";
        master.write_all(getack).unwrap();
        pump(&mut db, &mut conn, MASTER, true);
        // the ACK carries the offset as it stood before the GETACK frame
        assert_eq!(
            read_available(&mut master),
            b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n45\r\n"
        );
        assert_eq!(
            db.info.master_repl_offset,
            (set.len() + ping.len() + getack.len()) as u64
        );
    }

    #[test]
    fn suspended_wait_holds_pipelined_replies_until_resolution() {
        let (conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        let token = Token(100);
        let mut connections = HashMap::new();
        connections.insert(token, conn);

        // a propagated write makes WAIT suspend instead of answering at once
        db.propagate_write(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");

        client
            .write_all(b"*3\r\n$4\r\nWAIT\r\n$1\r\n1\r\n$2\r\n40\r\n*1\r\n$4\r\nPING\r\n")
            .unwrap();
        {
            let conn = connections.get_mut(&token).unwrap();
            pump(&mut db, conn, token, false);
        }
        assert!(matches!(db.state, ServerState::Waiting { .. }));
        // the PING reply is held behind the suspended WAIT
        assert!(read_available(&mut client).is_empty());

        std::thread::sleep(Duration::from_millis(40));
        resolve_pending(&mut db, &mut connections);
        assert!(matches!(db.state, ServerState::Ready));
        assert_eq!(read_available(&mut client), b":0\r\n+PONG\r\n");
    }

    #[test]
    fn psync_is_rejected_when_replica_band_is_full() {
        let (mut conn, mut client) = pair();
        let mut db = db_with_role(Role::Master);
        while db.token_track.has_replica_capacity() {
            let _ = db.token_track.next_replica_token();
        }
        let reply = exchange(
            &mut db,
            &mut conn,
            &mut client,
            Token(100),
            b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n",
        );
        assert_eq!(reply, b"-ERR maximum number of replicas reached\r\n");
        assert!(db.replicas.is_empty());
    }

    #[test]
    fn malformed_master_bytes_still_advance_the_offset() {
        let (mut conn, mut master) = pair();
        let mut db = db_with_role(Role::Slave);

        // an integer element is not a valid command frame
        let junk = b"*1\r\n:42\r\n";
        master.write_all(junk).unwrap();
        pump(&mut db, &mut conn, MASTER, true);
        assert_eq!(db.info.master_repl_offset, junk.len() as u64);
    }

    #[test]
    fn handshake_walks_the_state_machine_and_drains_coalesced_frames() {
        let (mut conn, mut master) = pair();
        let info = ServerInfo::build(Role::Slave, 6380, "/tmp/redis-files", "dump.rdb");
        let mut db = Db::new(info, ServerState::BeforePing);

        master.write_all(b"+PONG\r\n").unwrap();
        pump(&mut db, &mut conn, MASTER, true);
        assert_eq!(
            read_available(&mut master),
            b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n"
        );

        master.write_all(b"+OK\r\n").unwrap();
        pump(&mut db, &mut conn, MASTER, true);
        assert_eq!(
            read_available(&mut master),
            b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n"
        );

        master.write_all(b"+OK\r\n").unwrap();
        pump(&mut db, &mut conn, MASTER, true);
        assert_eq!(
            read_available(&mut master),
            b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n"
        );

        // FULLRESYNC, snapshot blob and a first write all in one delivery
        let blob = hex::decode(EMPTY_RDB_HEX).unwrap();
        let mut burst = Vec::new();
        burst.extend_from_slice(
            format!("+FULLRESYNC {} 0\r\n", crate::db::MASTER_REPLID).as_bytes(),
        );
        burst.extend_from_slice(format!("${}\r\n", blob.len()).as_bytes());
        burst.extend_from_slice(&blob);
        let set = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        burst.extend_from_slice(set);
        master.write_all(&burst).unwrap();
        pump(&mut db, &mut conn, MASTER, true);

        assert!(matches!(db.state, ServerState::Ready));
        assert_eq!(db.get("k").unwrap(), Some("v".to_string()));
        assert_eq!(db.info.master_repl_offset, set.len() as u64);
    }
}
