use mio::Token;

use crate::connection::Connection;

/// One downstream replica attached after a successful PSYNC. The master
/// forwards write frames in list order and reads `REPLCONF ACK` frames
/// back on the same connection while a WAIT is outstanding.
pub struct Replica {
    pub connection: Connection,
    pub token: Token,
}

impl Replica {
    pub fn new(connection: Connection, token: Token) -> Self {
        Self { connection, token }
    }
}
