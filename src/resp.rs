use nom::{
    bytes::streaming::{tag, take, take_until},
    character::streaming,
    error::{Error as NomError, ErrorKind},
    number::streaming::u8 as parse_u8,
    sequence::terminated,
    IResult,
};

/// One protocol value, either decoded from the wire or about to be encoded.
/// `Display` produces the exact wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(String),
    SimpleError(String),
    Integer(i64),
    BulkString(String),
    NullBulkString,
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Builds a bulk string reply. The empty string collapses to the null
    /// bulk, matching what clients of this server have always been sent.
    pub fn bulk(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.is_empty() {
            Self::NullBulkString
        } else {
            Self::BulkString(s)
        }
    }

    /// Encodes a whitespace-separated command as an array of bulk strings,
    /// e.g. `command("REPLCONF GETACK *")`.
    pub fn command(line: &str) -> Self {
        Self::Array(
            line.split_whitespace()
                .map(|w| Self::BulkString(w.to_string()))
                .collect(),
        )
    }
}

impl std::fmt::Display for RespValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SimpleString(x) => write!(f, "+{}\r\n", x),
            Self::SimpleError(x) => write!(f, "-{}\r\n", x),
            Self::Integer(x) => write!(f, ":{}\r\n", x),
            Self::BulkString(x) => write!(f, "${}\r\n{}\r\n", x.len(), x),
            Self::NullBulkString => write!(f, "$-1\r\n"),
            Self::Array(items) => {
                write!(f, "*{}\r\n", items.len())?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

/// One complete inbound command array: upper-cased name, argument words and
/// the number of bytes the frame occupied on the wire. The length is what
/// lets the replication engine advance its offset byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub name: String,
    pub args: Vec<String>,
    pub len: usize,
}

fn crlf(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag("\r\n")(input)
}

fn line(input: &[u8]) -> IResult<&[u8], String> {
    let (input, raw) = terminated(take_until("\r\n"), crlf)(input)?;
    Ok((input, String::from_utf8_lossy(raw).to_string()))
}

fn bulk_payload(input: &[u8], length: usize) -> IResult<&[u8], String> {
    let (input, raw) = terminated(take(length), crlf)(input)?;
    Ok((input, String::from_utf8_lossy(raw).to_string()))
}

/// Parses any protocol value. The dispatcher uses this for replies received
/// during the replication handshake; command arrays go through
/// [`parse_command_frame`] instead.
pub fn parse_value(input: &[u8]) -> IResult<&[u8], RespValue> {
    let (input, sigil) = parse_u8(input)?;
    match sigil {
        b'+' => {
            let (input, val) = line(input)?;
            Ok((input, RespValue::SimpleString(val)))
        }
        b'-' => {
            let (input, val) = line(input)?;
            Ok((input, RespValue::SimpleError(val)))
        }
        b':' => {
            let (input, val) = terminated(streaming::i64, crlf)(input)?;
            Ok((input, RespValue::Integer(val)))
        }
        b'$' => {
            let (input, length) = terminated(streaming::i64, crlf)(input)?;
            if length < 0 {
                return Ok((input, RespValue::NullBulkString));
            }
            let (input, word) = bulk_payload(input, length as usize)?;
            Ok((input, RespValue::BulkString(word)))
        }
        b'*' => {
            let (mut input, count) = terminated(streaming::u32, crlf)(input)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let item;
                (input, item) = parse_value(input)?;
                items.push(item);
            }
            Ok((input, RespValue::Array(items)))
        }
        _ => Err(nom::Err::Error(NomError::new(input, ErrorKind::Char))),
    }
}

/// A command array element: a bulk string or a simple string. Any other
/// sigil is a protocol violation.
fn command_element(input: &[u8]) -> IResult<&[u8], String> {
    let (input, sigil) = parse_u8(input)?;
    match sigil {
        b'$' => {
            let (input, length) = terminated(streaming::u64, crlf)(input)?;
            bulk_payload(input, length as usize)
        }
        b'+' => line(input),
        _ => Err(nom::Err::Error(NomError::new(input, ErrorKind::Char))),
    }
}

/// Consumes one complete command array from the front of `input`. Returns
/// `Err(Incomplete)` when the buffer holds only part of a frame; the caller
/// keeps the bytes and retries after the next read.
pub fn parse_command_frame(input: &[u8]) -> IResult<&[u8], CommandFrame> {
    let total = input.len();
    let (input, _) = tag("*")(input)?;
    let (mut input, count) = terminated(streaming::u32, crlf)(input)?;
    let mut words = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let word;
        (input, word) = command_element(input)?;
        words.push(word);
    }
    let mut words = words.into_iter();
    let name = match words.next() {
        Some(word) => word.to_uppercase(),
        None => return Err(nom::Err::Error(NomError::new(input, ErrorKind::Count))),
    };
    Ok((
        input,
        CommandFrame {
            name,
            args: words.collect(),
            len: total - input.len(),
        },
    ))
}

/// The length-prefixed snapshot blob sent after `+FULLRESYNC`:
/// `$<len>\r\n` followed by exactly `len` raw bytes and no trailing CRLF.
pub fn parse_rdb_payload(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, _) = tag("$")(input)?;
    let (input, length) = terminated(streaming::u64, crlf)(input)?;
    take(length as usize)(input)
}
