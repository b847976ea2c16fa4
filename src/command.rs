use crate::db::Db;
use crate::error::CommandError;
use crate::resp::{CommandFrame, RespValue};
use crate::stream::{self, EntryId, IdSpec, StreamEntry};

/// A validated command. Parsing enforces arity and argument syntax so that
/// execution only deals with semantics; both stages report failures as
/// [`CommandError`] frames while the connection keeps going.
#[derive(Debug, Clone)]
pub enum Command {
    Ping,
    Echo(String),
    Set {
        key: String,
        value: String,
        px: Option<u64>,
    },
    Get(String),
    ConfigGet(String),
    Keys(String),
    Info,
    Type(String),
    Xadd {
        key: String,
        id: IdSpec,
        fields: Vec<(String, String)>,
    },
    Xrange {
        key: String,
        start: EntryId,
        end: EntryId,
    },
    Xread {
        block: Option<u64>,
        /// Key paired with its raw id argument; `$` resolves against the
        /// stream's `last_id` at execution time.
        requests: Vec<(String, String)>,
    },
    Incr(String),
    Multi,
    Exec,
    Discard,
    ReplConf(ReplConfSub),
    Psync,
    Wait {
        goal: i64,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub enum ReplConfSub {
    GetAck,
    Ack(u64),
    Other,
}

fn arity(name: &str) -> CommandError {
    CommandError::WrongArity(name.to_lowercase())
}

impl Command {
    pub fn parse(frame: &CommandFrame) -> Result<Self, CommandError> {
        let args = &frame.args;
        match frame.name.as_str() {
            "PING" => Ok(Self::Ping),
            "ECHO" => match args.as_slice() {
                [value] => Ok(Self::Echo(value.clone())),
                _ => Err(arity("echo")),
            },
            "SET" => match args.as_slice() {
                [key, value] => Ok(Self::Set {
                    key: key.clone(),
                    value: value.clone(),
                    px: None,
                }),
                [key, value, opt, ms] => {
                    if !opt.eq_ignore_ascii_case("px") {
                        return Err(CommandError::Syntax);
                    }
                    let ms = ms.parse().map_err(|_| CommandError::Syntax)?;
                    Ok(Self::Set {
                        key: key.clone(),
                        value: value.clone(),
                        px: Some(ms),
                    })
                }
                _ => Err(arity("set")),
            },
            "GET" => match args.as_slice() {
                [key] => Ok(Self::Get(key.clone())),
                _ => Err(arity("get")),
            },
            "CONFIG" => match args.as_slice() {
                [sub, name] if sub.eq_ignore_ascii_case("get") => {
                    Ok(Self::ConfigGet(name.clone()))
                }
                [_, _] => Err(CommandError::Syntax),
                _ => Err(arity("config")),
            },
            "KEYS" => match args.as_slice() {
                [pattern] => Ok(Self::Keys(pattern.clone())),
                _ => Err(arity("keys")),
            },
            "INFO" => match args.len() {
                0 | 1 => Ok(Self::Info),
                _ => Err(arity("info")),
            },
            "TYPE" => match args.as_slice() {
                [key] => Ok(Self::Type(key.clone())),
                _ => Err(arity("type")),
            },
            "XADD" => {
                if args.len() < 4 || (args.len() - 2) % 2 != 0 {
                    return Err(arity("xadd"));
                }
                let id = IdSpec::parse(&args[1])?;
                let fields = args[2..]
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                Ok(Self::Xadd {
                    key: args[0].clone(),
                    id,
                    fields,
                })
            }
            "XRANGE" => match args.as_slice() {
                [key, start, end] => Ok(Self::Xrange {
                    key: key.clone(),
                    start: stream::parse_range_start(start)?,
                    end: stream::parse_range_end(end)?,
                }),
                _ => Err(arity("xrange")),
            },
            "XREAD" => Self::parse_xread(args),
            "INCR" => match args.as_slice() {
                [key] => Ok(Self::Incr(key.clone())),
                _ => Err(arity("incr")),
            },
            "MULTI" => Ok(Self::Multi),
            "EXEC" => Ok(Self::Exec),
            "DISCARD" => Ok(Self::Discard),
            "REPLCONF" => {
                let sub = args.first().ok_or_else(|| arity("replconf"))?;
                if sub.eq_ignore_ascii_case("getack") {
                    Ok(Self::ReplConf(ReplConfSub::GetAck))
                } else if sub.eq_ignore_ascii_case("ack") {
                    let offset = args
                        .get(1)
                        .and_then(|n| n.parse().ok())
                        .ok_or(CommandError::Syntax)?;
                    Ok(Self::ReplConf(ReplConfSub::Ack(offset)))
                } else {
                    Ok(Self::ReplConf(ReplConfSub::Other))
                }
            }
            "PSYNC" => Ok(Self::Psync),
            "WAIT" => match args.as_slice() {
                [goal, timeout] => Ok(Self::Wait {
                    goal: goal.parse().map_err(|_| CommandError::NotAnInteger)?,
                    timeout_ms: timeout.parse().map_err(|_| CommandError::NotAnInteger)?,
                }),
                _ => Err(arity("wait")),
            },
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }

    fn parse_xread(args: &[String]) -> Result<Self, CommandError> {
        let mut rest = args;
        let mut block = None;
        if let [first, ms, tail @ ..] = rest {
            if first.eq_ignore_ascii_case("block") {
                block = Some(ms.parse().map_err(|_| CommandError::Syntax)?);
                rest = tail;
            }
        }
        match rest {
            [streams, tail @ ..] if streams.eq_ignore_ascii_case("streams") => {
                if tail.is_empty() || tail.len() % 2 != 0 {
                    return Err(arity("xread"));
                }
                let (keys, ids) = tail.split_at(tail.len() / 2);
                let requests = keys
                    .iter()
                    .zip(ids)
                    .map(|(key, id)| (key.clone(), id.clone()))
                    .collect();
                Ok(Self::Xread { block, requests })
            }
            _ => Err(CommandError::Syntax),
        }
    }

    /// Whether a successful execution must be forwarded to the replicas.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Set { .. } | Self::Incr(_) | Self::Xadd { .. }
        )
    }

    /// Runs the synchronous path of a command. `Ok(None)` means "write no
    /// response frame" (a master absorbing a replica's ACK). MULTI/EXEC
    /// queueing, suspension and PSYNC promotion live in the dispatcher;
    /// their arms here cover execution from inside an EXEC queue.
    pub fn execute(&self, db: &mut Db) -> Result<Option<RespValue>, CommandError> {
        match self {
            Self::Ping => Ok(Some(RespValue::SimpleString("PONG".to_string()))),
            Self::Echo(value) => Ok(Some(RespValue::bulk(value.clone()))),
            Self::Set { key, value, px } => {
                db.set(key, value.clone(), *px);
                Ok(Some(RespValue::SimpleString("OK".to_string())))
            }
            Self::Get(key) => Ok(Some(match db.get(key)? {
                Some(value) => RespValue::bulk(value),
                None => RespValue::NullBulkString,
            })),
            Self::ConfigGet(name) => {
                let value = match name.as_str() {
                    "dir" => Some(db.info.dir.clone()),
                    "dbfilename" => Some(db.info.dbfilename.clone()),
                    _ => None,
                };
                Ok(Some(match value {
                    Some(value) => RespValue::Array(vec![
                        RespValue::bulk(name.clone()),
                        RespValue::bulk(value),
                    ]),
                    None => RespValue::Array(Vec::new()),
                }))
            }
            Self::Keys(pattern) => {
                if pattern == "*" {
                    Ok(Some(RespValue::Array(
                        db.keys().into_iter().map(RespValue::bulk).collect(),
                    )))
                } else {
                    // pattern matching is not implemented
                    Ok(Some(RespValue::bulk("")))
                }
            }
            Self::Info => Ok(Some(RespValue::bulk(db.info.to_string()))),
            Self::Type(key) => Ok(Some(RespValue::SimpleString(db.type_of(key).to_string()))),
            Self::Xadd { key, id, fields } => {
                let id = db.xadd(key, *id, fields.clone())?;
                Ok(Some(RespValue::bulk(id.to_string())))
            }
            Self::Xrange { key, start, end } => {
                let entries = db.xrange(key, *start, *end)?;
                Ok(Some(encode_entries(&entries)))
            }
            Self::Xread { requests, .. } => {
                let resolved = resolve_xread_ids(db, requests)?;
                Ok(Some(sync_xread(db, &resolved)))
            }
            Self::Incr(key) => Ok(Some(RespValue::Integer(db.incr(key)?))),
            // inside an EXEC queue these degrade to their immediate forms
            Self::Multi => Ok(Some(RespValue::SimpleString("OK".to_string()))),
            Self::Exec => Err(CommandError::ExecWithoutMulti),
            Self::Discard => Err(CommandError::DiscardWithoutMulti),
            Self::ReplConf(ReplConfSub::Ack(_)) => Ok(None),
            Self::ReplConf(_) => Ok(Some(RespValue::SimpleString("OK".to_string()))),
            Self::Psync => Ok(None),
            Self::Wait { goal, .. } => Ok(Some(RespValue::Integer(immediate_wait_count(
                db, *goal,
            )))),
        }
    }
}

/// The non-suspending WAIT answer: zero for a non-positive goal, the fleet
/// size when nothing has been propagated yet.
pub fn immediate_wait_count(db: &Db, goal: i64) -> i64 {
    if goal <= 0 {
        0
    } else {
        db.replicas.len() as i64
    }
}

/// Resolves each XREAD id argument, turning `$` into the watched stream's
/// current `last_id`.
pub fn resolve_xread_ids(
    db: &mut Db,
    requests: &[(String, String)],
) -> Result<Vec<(String, EntryId)>, CommandError> {
    requests
        .iter()
        .map(|(key, raw)| {
            let after = if raw == "$" {
                db.last_stream_id(key)
            } else {
                stream::parse_range_start(raw)?
            };
            Ok((key.clone(), after))
        })
        .collect()
}

/// One `[key, entries]` pair per requested stream.
pub fn sync_xread(db: &mut Db, requests: &[(String, EntryId)]) -> RespValue {
    RespValue::Array(
        requests
            .iter()
            .map(|(key, after)| {
                let entries = db.stream_entries_after(key, *after);
                RespValue::Array(vec![RespValue::bulk(key.clone()), encode_entries(&entries)])
            })
            .collect(),
    )
}

/// Encodes entries as `[[id, [field, value, ...]], ...]`.
pub fn encode_entries(entries: &[StreamEntry]) -> RespValue {
    RespValue::Array(
        entries
            .iter()
            .map(|entry| {
                let fields = entry
                    .fields
                    .iter()
                    .flat_map(|(field, value)| {
                        [RespValue::bulk(field.clone()), RespValue::bulk(value.clone())]
                    })
                    .collect();
                RespValue::Array(vec![
                    RespValue::bulk(entry.id.to_string()),
                    RespValue::Array(fields),
                ])
            })
            .collect(),
    )
}
