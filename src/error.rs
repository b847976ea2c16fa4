use thiserror::Error;

/// Fatal errors. Anything of this kind tears down the connection it
/// happened on (or aborts startup when raised while loading the RDB file).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    HexError(#[from] hex::FromHexError),

    #[error(transparent)]
    RdbError(#[from] binrw::Error),

    #[error("invalid --replicaof value, expected \"<host> <port>\"")]
    InvalidMasterAddr,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unexpected reply during replication handshake: {0}")]
    Handshake(String),
}

impl<E: std::fmt::Debug> From<nom::Err<E>> for Error {
    fn from(err: nom::Err<E>) -> Self {
        Self::Protocol(format!("{err:?}"))
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Command-level errors. These are written back to the client as a simple
/// error frame; the connection stays healthy and keeps processing commands.
/// The `Display` text is the exact wire payload after the `-` sigil.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    EntryIdZero,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    EntryIdNotGreater,

    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidEntryId,

    #[error("ERR maximum number of replicas reached")]
    ReplicaLimit,

    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,
}
