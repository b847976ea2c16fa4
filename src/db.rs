use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mio::Token;
use tracing::{info, warn};

use crate::command::Command;
use crate::connection::Connection;
use crate::error::CommandError;
use crate::rdb::Rdb;
use crate::replica::Replica;
use crate::stream::{EntryId, IdSpec, Stream, StreamEntry};
use crate::token::TokenTrack;

/// Fixed for the lifetime of a master process.
pub const MASTER_REPLID: &str = "8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub role: Role,
    pub port: u16,
    pub dir: String,
    pub dbfilename: String,
    pub master_replid: String,
    /// On a master: bytes of write frames propagated so far. On a replica:
    /// bytes of frames applied since the end of the snapshot transfer.
    pub master_repl_offset: u64,
}

impl ServerInfo {
    pub fn build(role: Role, port: u16, dir: &str, dbfilename: &str) -> Self {
        Self {
            role,
            port,
            dir: dir.to_string(),
            dbfilename: dbfilename.to_string(),
            master_replid: MASTER_REPLID.to_string(),
            master_repl_offset: 0,
        }
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "# Replication\r\n")?;
        write!(f, "role:{}\r\n", self.role)?;
        write!(f, "master_replid:{}\r\n", self.master_replid)?;
        write!(f, "master_repl_offset:{}\r\n", self.master_repl_offset)?;
        Ok(())
    }
}

/// A stored value. String and stream values share one key space; the tag
/// is what TYPE reports and what WRONGTYPE checks inspect.
#[derive(Debug, Clone)]
pub enum Value {
    String {
        data: String,
        expires_at: Option<SystemTime>,
    },
    Stream(Stream),
}

impl Value {
    fn is_expired(&self, now: SystemTime) -> bool {
        match self {
            Self::String {
                expires_at: Some(at),
                ..
            } => now >= *at,
            _ => false,
        }
    }
}

/// The one process-wide state slot. It carries the replica handshake
/// progression on a slave, and the single outstanding WAIT or blocking
/// XREAD on a master. Only one suspension can exist at a time.
#[derive(Debug, Clone)]
pub enum ServerState {
    Ready,
    // Replica handshake, driven by replies from the master connection
    BeforePing,
    BeforeReplConfPort,
    BeforeReplConfCapa,
    BeforePsync,
    BeforeRdbFile,
    /// A WAIT holding its caller's response until enough ACKs arrive
    Waiting {
        since: Instant,
        timeout: Duration,
        goal: u64,
        acks: u64,
        client: Token,
    },
    /// A blocking XREAD watching a set of streams
    BlockingRead {
        since: Instant,
        timeout: Option<Duration>,
        watched: Vec<(String, EntryId)>,
        client: Token,
    },
}

/// A command held back by MULTI, with the frame bytes it arrived in so a
/// write can be propagated verbatim when EXEC runs it.
pub struct QueuedCommand {
    pub command: Command,
    pub raw: Vec<u8>,
}

pub struct Db {
    pub info: ServerInfo,
    pub state: ServerState,
    store: HashMap<String, Value>,
    // KEYS reports insertion order, which a HashMap alone loses
    key_order: Vec<String>,
    pub transactions: HashMap<Token, Vec<QueuedCommand>>,
    pub replicas: Vec<Replica>,
    pub token_track: TokenTrack,
}

impl Db {
    pub fn new(info: ServerInfo, state: ServerState) -> Self {
        Self {
            info,
            state,
            store: HashMap::new(),
            key_order: Vec::new(),
            transactions: HashMap::new(),
            replicas: Vec::new(),
            token_track: TokenTrack::new(),
        }
    }

    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn is_master(&self) -> bool {
        self.info.role == Role::Master
    }

    fn insert(&mut self, key: &str, value: Value) {
        if !self.store.contains_key(key) {
            self.key_order.push(key.to_string());
        }
        self.store.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.store.remove(key);
        self.key_order.retain(|k| k != key);
    }

    /// Lazy expiry: an expired entry is dropped on first access and the
    /// caller sees it as absent. There is no background sweeper.
    fn live_value(&mut self, key: &str) -> Option<&Value> {
        let expired = matches!(
            self.store.get(key),
            Some(value) if value.is_expired(SystemTime::now())
        );
        if expired {
            self.remove(key);
            return None;
        }
        self.store.get(key)
    }

    pub fn set(&mut self, key: &str, value: String, px: Option<u64>) {
        let expires_at = px.map(|ms| SystemTime::now() + Duration::from_millis(ms));
        self.insert(
            key,
            Value::String {
                data: value,
                expires_at,
            },
        );
    }

    /// Seeds one entry from the startup snapshot. The expiry is an
    /// absolute wall-clock timestamp in milliseconds; entries already past
    /// it are stored anyway and expire lazily like everything else.
    pub fn set_from_snapshot(&mut self, key: &str, value: String, expire_at_ms: Option<u64>) {
        let expires_at = expire_at_ms.map(|ms| UNIX_EPOCH + Duration::from_millis(ms));
        self.insert(
            key,
            Value::String {
                data: value,
                expires_at,
            },
        );
    }

    pub fn load_rdb(&mut self, rdb: &Rdb) {
        for entry in &rdb.database.entries {
            self.set_from_snapshot(&entry.key, entry.value.clone(), entry.expire_at_ms);
        }
        info!(
            keys = rdb.database.entries.len(),
            header = %rdb.header,
            "loaded snapshot"
        );
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>, CommandError> {
        match self.live_value(key) {
            None => Ok(None),
            Some(Value::String { data, .. }) => Ok(Some(data.clone())),
            Some(Value::Stream(_)) => Err(CommandError::WrongType),
        }
    }

    pub fn incr(&mut self, key: &str) -> Result<i64, CommandError> {
        if self.live_value(key).is_none() {
            self.set(key, "1".to_string(), None);
            return Ok(1);
        }
        match self.store.get_mut(key) {
            Some(Value::String { data, .. }) => {
                let n: i64 = data.parse().map_err(|_| CommandError::NotAnInteger)?;
                let n = n.checked_add(1).ok_or(CommandError::NotAnInteger)?;
                *data = n.to_string();
                Ok(n)
            }
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn type_of(&mut self, key: &str) -> &'static str {
        match self.live_value(key) {
            None => "none",
            Some(Value::String { .. }) => "string",
            Some(Value::Stream(_)) => "stream",
        }
    }

    /// All live keys in insertion order.
    pub fn keys(&mut self) -> Vec<String> {
        let now = SystemTime::now();
        let expired: Vec<String> = self
            .store
            .iter()
            .filter(|(_, value)| value.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
        self.key_order.clone()
    }

    pub fn xadd(
        &mut self,
        key: &str,
        spec: IdSpec,
        fields: Vec<(String, String)>,
    ) -> Result<EntryId, CommandError> {
        let now_ms = Self::now_ms();
        if self.live_value(key).is_none() {
            self.insert(key, Value::Stream(Stream::default()));
        }
        match self.store.get_mut(key) {
            Some(Value::Stream(stream)) => stream.add(spec, fields, now_ms),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn xrange(
        &mut self,
        key: &str,
        start: EntryId,
        end: EntryId,
    ) -> Result<Vec<StreamEntry>, CommandError> {
        match self.live_value(key) {
            None => Ok(Vec::new()),
            Some(Value::Stream(stream)) => {
                Ok(stream.range(start, end).into_iter().cloned().collect())
            }
            Some(Value::String { .. }) => Err(CommandError::WrongType),
        }
    }

    /// Entries strictly newer than `after`; empty for missing keys and
    /// keys of the wrong type.
    pub fn stream_entries_after(&mut self, key: &str, after: EntryId) -> Vec<StreamEntry> {
        match self.live_value(key) {
            Some(Value::Stream(stream)) => {
                stream.entries_after(after).into_iter().cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// `last_id` of the stream at `key`, or `0-0` when there is none yet.
    /// This is what an XREAD id of `$` resolves against.
    pub fn last_stream_id(&mut self, key: &str) -> EntryId {
        match self.live_value(key) {
            Some(Value::Stream(stream)) => stream.last_id(),
            _ => EntryId::ZERO,
        }
    }

    // region: replication

    pub fn register_replica(&mut self, connection: Connection, token: Token) {
        info!(?token, replicas = self.replicas.len() + 1, "replica attached");
        self.replicas.push(Replica::new(connection, token));
    }

    pub fn replica_mut(&mut self, token: Token) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.token == token)
    }

    pub fn remove_replica(&mut self, token: Token) {
        if self.replicas.iter().any(|r| r.token == token) {
            warn!(?token, "replica detached");
            self.replicas.retain(|r| r.token != token);
        }
    }

    /// Writes `bytes` to every attached replica in attach order. A replica
    /// whose socket fails is dropped; an outstanding WAIT then races
    /// against the reduced fleet.
    pub fn broadcast_to_replicas(&mut self, bytes: &[u8]) {
        self.replicas.retain_mut(|replica| {
            match replica.connection.write_bytes(bytes) {
                Ok(()) => true,
                Err(err) => {
                    warn!(token = ?replica.token, %err, "dropping replica on write error");
                    false
                }
            }
        });
    }

    /// Forwards the exact inbound frame bytes of a write command, then
    /// advances the offset by the frame length. Forwarding the original
    /// bytes rather than a re-serialization keeps master and replica
    /// offsets byte-for-byte consistent.
    pub fn propagate_write(&mut self, raw: &[u8]) {
        self.broadcast_to_replicas(raw);
        self.info.master_repl_offset += raw.len() as u64;
    }

    // endregion: replication
}
