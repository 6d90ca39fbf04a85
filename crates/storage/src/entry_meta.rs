//! Binary encoding of per-entry metadata records.
//!
//! Version 1 layout:
//!
//! ```text
//! +---------+----------------------+------------------------+
//! | 0x01    | created (i64, LE)    | filename (UTF-8 bytes) |
//! | 1 byte  | 8 bytes, unix secs   | rest of the record     |
//! +---------+----------------------+------------------------+
//! ```
//!
//! Records written before versioning hold nothing but an RFC 3339
//! timestamp. They still decode; their filename is [`LEGACY_FILENAME`].

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Filename reported for records that predate versioning.
pub const LEGACY_FILENAME: &str = "data";

const VERSION_ONE: u8 = 1;
const VERSION_ONE_HEADER: usize = 9;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    #[error("empty entry metadata")]
    Empty,
    #[error("version 1 record truncated to {0} bytes")]
    Truncated(usize),
    #[error("timestamp {0} is out of range")]
    TimestampOutOfRange(i64),
    #[error("filename is not valid UTF-8")]
    InvalidFilename,
    #[error("could not make sense of old-style value {0:?}")]
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    filename: String,
    created: DateTime<Utc>,
}

impl EntryMeta {
    /// Build a record. The creation time is kept at second precision, the
    /// same precision the encoding preserves.
    pub fn new(filename: impl Into<String>, created: DateTime<Utc>) -> Self {
        let created = Utc
            .timestamp_opt(created.timestamp(), 0)
            .single()
            .unwrap_or(created);
        Self {
            filename: filename.into(),
            created,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(VERSION_ONE_HEADER + self.filename.len());
        data.push(VERSION_ONE);
        data.extend_from_slice(&self.created.timestamp().to_le_bytes());
        data.extend_from_slice(self.filename.as_bytes());
        data
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MetaError> {
        match data.first() {
            None => Err(MetaError::Empty),
            Some(&VERSION_ONE) => decode_version_one(data),
            Some(_) => decode_legacy(data),
        }
    }
}

fn decode_version_one(data: &[u8]) -> Result<EntryMeta, MetaError> {
    if data.len() < VERSION_ONE_HEADER {
        return Err(MetaError::Truncated(data.len()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[1..VERSION_ONE_HEADER]);
    let seconds = i64::from_le_bytes(raw);
    let created = Utc
        .timestamp_opt(seconds, 0)
        .single()
        .ok_or(MetaError::TimestampOutOfRange(seconds))?;
    let filename = std::str::from_utf8(&data[VERSION_ONE_HEADER..])
        .map_err(|_| MetaError::InvalidFilename)?;
    Ok(EntryMeta {
        filename: filename.to_string(),
        created,
    })
}

fn decode_legacy(data: &[u8]) -> Result<EntryMeta, MetaError> {
    let text = String::from_utf8_lossy(data);
    let created = DateTime::parse_from_rfc3339(&text)
        .map_err(|_| MetaError::Unrecognized(text.to_string()))?
        .with_timezone(&Utc);
    Ok(EntryMeta {
        filename: LEGACY_FILENAME.to_string(),
        created,
    })
}

/// RFC 3339 rendering used in listings and logs.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}
