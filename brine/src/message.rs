//! Typed views over inbound DCP frames. Parsing is done once, up front, so
//! nothing downstream ever touches raw extras layouts.

use crate::error::{WireError, WireFault, WireResult};
use crate::frame::Frame;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

/// End seqno requesting an unbounded stream ("follow forever").
pub const NO_END_SEQNO: u64 = 0xffff_ffff_ffff_ffff;

/// Feature codes negotiated via HELO.
pub mod feature {
    pub const DATATYPE: u16 = 0x01;
    pub const TCP_NODELAY: u16 = 0x03;
    pub const MUTATION_SEQNO: u16 = 0x04;
    pub const XATTR: u16 = 0x06;
    pub const XERROR: u16 = 0x07;
    pub const SELECT_BUCKET: u16 = 0x08;
    pub const SNAPPY: u16 = 0x0a;
    pub const COLLECTIONS: u16 = 0x12;
}

/// The resume point a stream is opened from. Produced by the partition
/// bookkeeping, consumed by the stream-request builder.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamRequest {
    pub partition: u16,
    pub vbucket_uuid: u64,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub snapshot_start_seqno: u64,
    pub snapshot_end_seqno: u64,
}

/// One `(vbucket uuid, seqno)` entry of a failover log, most recent first.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FailoverEntry {
    pub vbucket_uuid: u64,
    pub seqno: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SnapshotMarker {
    pub partition: u16,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl SnapshotMarker {
    pub fn parse(frame: &Frame) -> WireResult<SnapshotMarker> {
        let extras = frame.extras();

        if extras.len() < 20 {
            return Err(WireError::Fatal(WireFault::ShortBody));
        }

        let mut stream = Cursor::new(extras);

        Ok(SnapshotMarker {
            partition: frame.header.vbucket(),
            start_seqno: stream.read_u64::<BigEndian>()?,
            end_seqno: stream.read_u64::<BigEndian>()?,
            flags: stream.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Mutation {
    pub partition: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    pub expiry: u32,
    pub lock_time: u32,
    pub nru: u8,
    pub cas: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Deletions and expirations share one layout: no value payload, just the
/// tombstoned key and its seqnos.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Removal {
    pub partition: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub key: Vec<u8>,
}

/// A data message as delivered to the embedder.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DataMessage {
    Mutation(Mutation),
    Deletion(Removal),
    Expiration(Removal),
}

impl DataMessage {
    #[inline]
    pub fn partition(&self) -> u16 {
        match self {
            DataMessage::Mutation(m) => m.partition,
            DataMessage::Deletion(r) | DataMessage::Expiration(r) => r.partition,
        }
    }

    #[inline]
    pub fn by_seqno(&self) -> u64 {
        match self {
            DataMessage::Mutation(m) => m.by_seqno,
            DataMessage::Deletion(r) | DataMessage::Expiration(r) => r.by_seqno,
        }
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        match self {
            DataMessage::Mutation(m) => &m.key,
            DataMessage::Deletion(r) | DataMessage::Expiration(r) => &r.key,
        }
    }
}

pub fn parse_mutation(frame: &Frame) -> WireResult<Mutation> {
    let extras = frame.extras();

    if extras.len() < 31 {
        return Err(WireError::Fatal(WireFault::ShortBody));
    }

    let mut stream = Cursor::new(extras);

    let by_seqno = stream.read_u64::<BigEndian>()?;
    let rev_seqno = stream.read_u64::<BigEndian>()?;
    let flags = stream.read_u32::<BigEndian>()?;
    let expiry = stream.read_u32::<BigEndian>()?;
    let lock_time = stream.read_u32::<BigEndian>()?;
    let _metadata_size = stream.read_u16::<BigEndian>()?;
    let nru = stream.read_u8()?;

    Ok(Mutation {
        partition: frame.header.vbucket(),
        by_seqno,
        rev_seqno,
        flags,
        expiry,
        lock_time,
        nru,
        cas: frame.header.cas,
        key: frame.key().to_vec(),
        value: frame.value().to_vec(),
    })
}

pub fn parse_removal(frame: &Frame) -> WireResult<Removal> {
    let extras = frame.extras();

    if extras.len() < 18 {
        return Err(WireError::Fatal(WireFault::ShortBody));
    }

    let mut stream = Cursor::new(extras);

    let by_seqno = stream.read_u64::<BigEndian>()?;
    let rev_seqno = stream.read_u64::<BigEndian>()?;

    Ok(Removal {
        partition: frame.header.vbucket(),
        by_seqno,
        rev_seqno,
        cas: frame.header.cas,
        key: frame.key().to_vec(),
    })
}

/// Why the server ended a stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamEndReason {
    /// The stream reached its requested end seqno.
    Ok,
    /// The client asked for the stream to be closed.
    Closed,
    /// The vbucket is changing state; the consumer should reconnect.
    StateChanged,
    /// The producer side is going away.
    Disconnected,
    /// The consumer fell too far behind and was cut off.
    TooSlow,
    Unknown(u32),
}

impl StreamEndReason {
    #[inline]
    pub fn from_code(code: u32) -> StreamEndReason {
        match code {
            0 => StreamEndReason::Ok,
            1 => StreamEndReason::Closed,
            2 => StreamEndReason::StateChanged,
            3 => StreamEndReason::Disconnected,
            4 => StreamEndReason::TooSlow,
            other => StreamEndReason::Unknown(other),
        }
    }

    /// Final reasons require no repair; everything else warrants a restart.
    #[inline]
    pub fn is_final(self) -> bool {
        match self {
            StreamEndReason::Ok | StreamEndReason::Closed => true,
            _ => false,
        }
    }
}

pub fn parse_stream_end(frame: &Frame) -> WireResult<StreamEndReason> {
    let extras = frame.extras();

    if extras.len() < 4 {
        return Err(WireError::Fatal(WireFault::ShortBody));
    }

    let code = Cursor::new(extras).read_u32::<BigEndian>()?;
    Ok(StreamEndReason::from_code(code))
}

/// Parse a failover log body: 16-byte `(uuid, seqno)` pairs, newest first.
/// Used for both the stream-request success body and the explicit
/// failover-log response.
pub fn parse_failover_log(body: &[u8]) -> WireResult<Vec<FailoverEntry>> {
    if body.len() % 16 != 0 {
        return Err(WireError::Fatal(WireFault::BadFrame));
    }

    let mut stream = Cursor::new(body);
    let mut entries = Vec::with_capacity(body.len() / 16);

    for _ in 0..body.len() / 16 {
        entries.push(FailoverEntry {
            vbucket_uuid: stream.read_u64::<BigEndian>()?,
            seqno: stream.read_u64::<BigEndian>()?,
        });
    }

    Ok(entries)
}

/// Parse a `GET_ALL_VB_SEQNOS` response body: 10-byte `(vbucket, seqno)`
/// pairs.
pub fn parse_seqno_map(body: &[u8]) -> WireResult<Vec<(u16, u64)>> {
    if body.len() % 10 != 0 {
        return Err(WireError::Fatal(WireFault::BadFrame));
    }

    let mut stream = Cursor::new(body);
    let mut seqnos = Vec::with_capacity(body.len() / 10);

    for _ in 0..body.len() / 10 {
        let vbucket = stream.read_u16::<BigEndian>()?;
        let seqno = stream.read_u64::<BigEndian>()?;
        seqnos.push((vbucket, seqno));
    }

    Ok(seqnos)
}

/// Parse the 8-byte rollback seqno carried by a rollback response.
pub fn parse_rollback_point(body: &[u8]) -> WireResult<u64> {
    if body.len() < 8 {
        return Err(WireError::Fatal(WireFault::ShortBody));
    }

    Ok(Cursor::new(body).read_u64::<BigEndian>()?)
}

/// Parse the feature codes the server granted in its HELO response.
pub fn parse_helo_features(body: &[u8]) -> WireResult<Vec<u16>> {
    if body.len() % 2 != 0 {
        return Err(WireError::Fatal(WireFault::BadFrame));
    }

    let mut stream = Cursor::new(body);
    let mut features = Vec::with_capacity(body.len() / 2);

    for _ in 0..body.len() / 2 {
        features.push(stream.read_u16::<BigEndian>()?);
    }

    Ok(features)
}
