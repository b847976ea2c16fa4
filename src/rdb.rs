use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use binrw::{BinRead, BinResult};

const OP_AUX: u8 = 0xFA;
const OP_EXPIRE_MS: u8 = 0xFC;
const OP_EXPIRE_SEC: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

/// A parsed snapshot file: the 9-byte header taken verbatim, the auxiliary
/// metadata fields, and the first database's entries. The reader is
/// strict; any structural deviation fails the whole parse, which aborts
/// the startup load.
#[derive(Debug, BinRead)]
#[br(little)]
pub struct Rdb {
    #[br(parse_with = parse_header)]
    pub header: String,
    #[br(parse_with = parse_metadata)]
    pub metadata: HashMap<String, String>,
    #[br(parse_with = parse_database)]
    pub database: RdbDatabase,
}

#[derive(Debug)]
pub struct RdbDatabase {
    pub index: u64,
    /// Hash table size announced by the RESIZEDB opcode
    pub size: u64,
    pub expiry_size: u64,
    pub entries: Vec<RdbEntry>,
}

#[derive(Debug)]
pub struct RdbEntry {
    pub key: String,
    pub value: String,
    /// Absolute wall-clock expiry in milliseconds
    pub expire_at_ms: Option<u64>,
}

fn fail<R: Seek>(reader: &mut R, message: impl Into<String>) -> binrw::Error {
    binrw::Error::AssertFail {
        pos: reader.stream_position().unwrap_or_default(),
        message: message.into(),
    }
}

fn read_u8<R: Read + Seek>(reader: &mut R) -> BinResult<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn peek_u8<R: Read + Seek>(reader: &mut R) -> BinResult<u8> {
    let byte = read_u8(reader)?;
    reader.seek(SeekFrom::Current(-1))?;
    Ok(byte)
}

/// A size-encoded field: either an actual length, or (when the two high
/// bits are `11`) the format code of a specially encoded string.
enum Length {
    Plain(u64),
    Special(u8),
}

fn read_length<R: Read + Seek>(reader: &mut R) -> BinResult<Length> {
    let byte = read_u8(reader)?;
    match byte >> 6 {
        0b00 => Ok(Length::Plain((byte & 0x3F) as u64)),
        0b01 => {
            let low = read_u8(reader)?;
            Ok(Length::Plain(((byte & 0x3F) as u64) << 8 | low as u64))
        }
        0b10 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            Ok(Length::Plain(u32::from_be_bytes(buf) as u64))
        }
        _ => Ok(Length::Special(byte & 0x3F)),
    }
}

fn read_size<R: Read + Seek>(reader: &mut R) -> BinResult<u64> {
    match read_length(reader)? {
        Length::Plain(n) => Ok(n),
        Length::Special(_) => Err(fail(reader, "expected a length, found a string encoding")),
    }
}

/// A string-encoded field. Integer formats are rendered as ASCII decimal;
/// LZF compression is not supported and fails the parse.
fn read_string<R: Read + Seek>(reader: &mut R) -> BinResult<String> {
    match read_length(reader)? {
        Length::Plain(len) => {
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        }
        Length::Special(0) => Ok(read_u8(reader)?.to_string()),
        Length::Special(1) => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            Ok(u16::from_le_bytes(buf).to_string())
        }
        Length::Special(2) => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            Ok(u32::from_le_bytes(buf).to_string())
        }
        Length::Special(3) => Err(fail(reader, "LZF-compressed strings are not supported")),
        Length::Special(format) => Err(fail(reader, format!("unknown string format {format:#04x}"))),
    }
}

#[binrw::parser(reader)]
fn parse_header() -> BinResult<String> {
    let mut buf = [0u8; 9];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

#[binrw::parser(reader)]
fn parse_metadata() -> BinResult<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    while peek_u8(reader)? == OP_AUX {
        read_u8(reader)?;
        let name = read_string(reader)?;
        let value = read_string(reader)?;
        metadata.insert(name, value);
    }
    Ok(metadata)
}

#[binrw::parser(reader)]
fn parse_database() -> BinResult<RdbDatabase> {
    let op = read_u8(reader)?;
    if op != OP_SELECTDB {
        return Err(fail(reader, format!("expected SELECTDB, found {op:#04x}")));
    }
    let index = read_size(reader)?;
    // RESIZEDB marker; the byte value itself is not checked
    read_u8(reader)?;
    let size = read_size(reader)?;
    let expiry_size = read_size(reader)?;

    let mut entries = Vec::new();
    loop {
        let op = read_u8(reader)?;
        if op == OP_EOF {
            break;
        }
        let mut expire_at_ms = None;
        let value_type = match op {
            OP_EXPIRE_MS => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                expire_at_ms = Some(u64::from_le_bytes(buf));
                read_u8(reader)?
            }
            OP_EXPIRE_SEC => {
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf)?;
                expire_at_ms = Some(u32::from_le_bytes(buf) as u64 * 1000);
                read_u8(reader)?
            }
            other => other,
        };
        if value_type != 0 {
            return Err(fail(reader, format!("unsupported value type {value_type:#04x}")));
        }
        let key = read_string(reader)?;
        let value = read_string(reader)?;
        entries.push(RdbEntry {
            key,
            value,
            expire_at_ms,
        });
    }

    Ok(RdbDatabase {
        index,
        size,
        expiry_size,
        entries,
    })
}
