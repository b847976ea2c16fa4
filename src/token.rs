use mio::Token;

// The listener itself
pub const SERVER: Token = Token(0);
// On a replica, the connection upstream to the master
pub const MASTER: Token = Token(1);
// Connections promoted by PSYNC take tokens from this band
pub const FIRST_REPLICA_TOKEN: Token = Token(2);
// Ordinary client connections start here
pub const FIRST_CLIENT_TOKEN: Token = Token(32);

/// Whether a token belongs to the replica band. Keeping replicas in their
/// own band lets the event loop route their ACK frames without a lookup.
pub fn is_replica_token(token: Token) -> bool {
    (FIRST_REPLICA_TOKEN.0..FIRST_CLIENT_TOKEN.0).contains(&token.0)
}

#[derive(Debug, Clone)]
pub struct TokenTrack {
    client_token: Token,
    replica_token: Token,
}

impl TokenTrack {
    pub fn new() -> Self {
        Self {
            client_token: FIRST_CLIENT_TOKEN,
            replica_token: FIRST_REPLICA_TOKEN,
        }
    }

    pub fn next_client_token(&mut self) -> Token {
        let token = self.client_token;
        self.client_token = Token(token.0 + 1);
        token
    }

    /// Whether the replica band still has a free token. Checked before a
    /// PSYNC is granted, so running out rejects the sync instead of
    /// affecting the server.
    pub fn has_replica_capacity(&self) -> bool {
        self.replica_token.0 < FIRST_CLIENT_TOKEN.0
    }

    pub fn next_replica_token(&mut self) -> Option<Token> {
        if !self.has_replica_capacity() {
            return None;
        }
        let token = self.replica_token;
        self.replica_token = Token(token.0 + 1);
        Some(token)
    }
}

impl Default for TokenTrack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bands_do_not_overlap() {
        let mut track = TokenTrack::new();
        let replica = track.next_replica_token().unwrap();
        let client = track.next_client_token();
        assert!(is_replica_token(replica));
        assert!(!is_replica_token(client));
        assert!(!is_replica_token(SERVER));
        assert!(!is_replica_token(MASTER));
    }

    #[test]
    fn replica_band_exhaustion_is_not_fatal() {
        let mut track = TokenTrack::new();
        while track.has_replica_capacity() {
            assert!(track.next_replica_token().is_some());
        }
        assert!(track.next_replica_token().is_none());
        // client tokens are unaffected
        assert!(!is_replica_token(track.next_client_token()));
    }
}
