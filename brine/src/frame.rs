use crate::error::{WireError, WireFault, WireResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};

pub const HEADER_SIZE: usize = 24;

/// Largest frame body the client will accept. DCP document values top out at
/// 20MiB; anything past that plus key/extras headroom is a corrupt stream.
pub const MAX_BODY_SIZE: usize = 20 * 1024 * 1024 + 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    #[inline]
    pub fn from_u8(value: u8) -> WireResult<Magic> {
        match value {
            0x80 => Ok(Magic::Request),
            0x81 => Ok(Magic::Response),
            other => Err(WireError::Fatal(WireFault::BadMagic(other))),
        }
    }
}

impl From<Magic> for u8 {
    #[inline]
    fn from(magic: Magic) -> Self {
        match magic {
            Magic::Request => 0x80,
            Magic::Response => 0x81,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Opcode {
    Helo,
    SaslAuth,
    GetAllVbSeqnos,
    OpenConnection,
    AddStream,
    CloseStream,
    StreamRequest,
    GetFailoverLog,
    StreamEnd,
    SnapshotMarker,
    Mutation,
    Deletion,
    Expiration,
    Flush,
    SetVbucketState,
    Noop,
    BufferAck,
    Control,
    SelectBucket,
}

impl Opcode {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Opcode> {
        Some(match value {
            0x1f => Opcode::Helo,
            0x21 => Opcode::SaslAuth,
            0x48 => Opcode::GetAllVbSeqnos,
            0x50 => Opcode::OpenConnection,
            0x51 => Opcode::AddStream,
            0x52 => Opcode::CloseStream,
            0x53 => Opcode::StreamRequest,
            0x54 => Opcode::GetFailoverLog,
            0x55 => Opcode::StreamEnd,
            0x56 => Opcode::SnapshotMarker,
            0x57 => Opcode::Mutation,
            0x58 => Opcode::Deletion,
            0x59 => Opcode::Expiration,
            0x5a => Opcode::Flush,
            0x5b => Opcode::SetVbucketState,
            0x5c => Opcode::Noop,
            0x5d => Opcode::BufferAck,
            0x5e => Opcode::Control,
            0x89 => Opcode::SelectBucket,
            _ => return None,
        })
    }
}

impl From<Opcode> for u8 {
    #[inline]
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Helo => 0x1f,
            Opcode::SaslAuth => 0x21,
            Opcode::GetAllVbSeqnos => 0x48,
            Opcode::OpenConnection => 0x50,
            Opcode::AddStream => 0x51,
            Opcode::CloseStream => 0x52,
            Opcode::StreamRequest => 0x53,
            Opcode::GetFailoverLog => 0x54,
            Opcode::StreamEnd => 0x55,
            Opcode::SnapshotMarker => 0x56,
            Opcode::Mutation => 0x57,
            Opcode::Deletion => 0x58,
            Opcode::Expiration => 0x59,
            Opcode::Flush => 0x5a,
            Opcode::SetVbucketState => 0x5b,
            Opcode::Noop => 0x5c,
            Opcode::BufferAck => 0x5d,
            Opcode::Control => 0x5e,
            Opcode::SelectBucket => 0x89,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Success,
    KeyNotFound,
    NotMyVbucket,
    AuthError,
    AuthContinue,
    Rollback,
    UnknownCommand,
    NotSupported,
    Busy,
    TmpFail,
    Other(u16),
}

impl Status {
    #[inline]
    pub fn from_code(code: u16) -> Status {
        match code {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x07 => Status::NotMyVbucket,
            0x20 => Status::AuthError,
            0x21 => Status::AuthContinue,
            0x23 => Status::Rollback,
            0x81 => Status::UnknownCommand,
            0x83 => Status::NotSupported,
            0x85 => Status::Busy,
            0x86 => Status::TmpFail,
            other => Status::Other(other),
        }
    }

    #[inline]
    pub fn code(self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::NotMyVbucket => 0x07,
            Status::AuthError => 0x20,
            Status::AuthContinue => 0x21,
            Status::Rollback => 0x23,
            Status::UnknownCommand => 0x81,
            Status::NotSupported => 0x83,
            Status::Busy => 0x85,
            Status::TmpFail => 0x86,
            Status::Other(code) => code,
        }
    }

    /// Statuses the server hands out under momentary pressure. Requests that
    /// hit these are safe to re-issue.
    #[inline]
    pub fn is_transient(self) -> bool {
        match self {
            Status::Busy | Status::TmpFail => true,
            _ => false,
        }
    }
}

/// The fixed 24-byte memcached binary header. All multi-byte fields are
/// network order on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub magic: Magic,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    /// vbucket id on requests, status code on responses.
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Parse a header from the front of `data`. `Wait` until 24 bytes are
    /// buffered.
    pub fn read(data: &[u8]) -> WireResult<Header> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Wait);
        }

        let mut stream = Cursor::new(data);

        let magic = Magic::from_u8(stream.read_u8()?)?;
        let opcode = stream.read_u8()?;
        let key_len = stream.read_u16::<BigEndian>()?;
        let extras_len = stream.read_u8()?;
        let data_type = stream.read_u8()?;
        let vbucket_or_status = stream.read_u16::<BigEndian>()?;
        let body_len = stream.read_u32::<BigEndian>()?;
        let opaque = stream.read_u32::<BigEndian>()?;
        let cas = stream.read_u64::<BigEndian>()?;

        if (body_len as usize) < key_len as usize + extras_len as usize {
            return Err(WireError::Fatal(WireFault::BadFrame));
        }

        if body_len as usize > MAX_BODY_SIZE {
            return Err(WireError::Fatal(WireFault::FrameTooLarge(body_len as usize)));
        }

        Ok(Header {
            magic,
            opcode,
            key_len,
            extras_len,
            data_type,
            vbucket_or_status,
            body_len,
            opaque,
            cas,
        })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u8(self.magic.into())?;
        stream.write_u8(self.opcode)?;
        stream.write_u16::<BigEndian>(self.key_len)?;
        stream.write_u8(self.extras_len)?;
        stream.write_u8(self.data_type)?;
        stream.write_u16::<BigEndian>(self.vbucket_or_status)?;
        stream.write_u32::<BigEndian>(self.body_len)?;
        stream.write_u32::<BigEndian>(self.opaque)?;
        stream.write_u64::<BigEndian>(self.cas)
    }

    /// The decoded opcode, if this client knows it.
    #[inline]
    pub fn known_opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }

    #[inline]
    pub fn vbucket(&self) -> u16 {
        self.vbucket_or_status
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from_code(self.vbucket_or_status)
    }
}

/// One whole protocol frame: header plus the `extras ‖ key ‖ value` body.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Frame {
    /// Parse one whole frame from the front of `data`, returning the frame
    /// and the number of bytes consumed. `Wait` until a whole frame is
    /// buffered.
    pub fn parse(data: &[u8]) -> WireResult<(Frame, usize)> {
        let header = Header::read(data)?;
        let total = HEADER_SIZE + header.body_len as usize;

        if data.len() < total {
            return Err(WireError::Wait);
        }

        let body = data[HEADER_SIZE..total].to_vec();

        Ok((Frame { header, body }, total))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.body.len());
        self.header.write(&mut bytes).expect("write to Vec cannot fail");
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Total size of the frame as transmitted.
    #[inline]
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    #[inline]
    pub fn extras(&self) -> &[u8] {
        &self.body[..self.header.extras_len as usize]
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        let start = self.header.extras_len as usize;
        &self.body[start..start + self.header.key_len as usize]
    }

    #[inline]
    pub fn value(&self) -> &[u8] {
        &self.body[self.header.extras_len as usize + self.header.key_len as usize..]
    }
}

fn request(opcode: Opcode, vbucket: u16, opaque: u32, extras: &[u8], key: &[u8], value: &[u8]) -> Frame {
    let mut body = Vec::with_capacity(extras.len() + key.len() + value.len());
    body.extend_from_slice(extras);
    body.extend_from_slice(key);
    body.extend_from_slice(value);

    Frame {
        header: Header {
            magic: Magic::Request,
            opcode: opcode.into(),
            key_len: key.len() as u16,
            extras_len: extras.len() as u8,
            data_type: 0,
            vbucket_or_status: vbucket,
            body_len: body.len() as u32,
            opaque,
            cas: 0,
        },
        body,
    }
}

/// Builders for every request the client sends. Layouts follow the DCP
/// producer protocol; extras are written big-endian.
pub mod build {
    use super::*;

    const OPEN_FLAG_PRODUCER: u32 = 0x01;

    pub fn open_connection(name: &str) -> Frame {
        let mut extras = Vec::with_capacity(8);
        extras.write_u32::<BigEndian>(0).unwrap();
        extras.write_u32::<BigEndian>(OPEN_FLAG_PRODUCER).unwrap();
        request(Opcode::OpenConnection, 0, 0, &extras, name.as_bytes(), &[])
    }

    pub fn sasl_auth_plain(username: &str, password: &str) -> Frame {
        let mut value = Vec::with_capacity(username.len() + password.len() + 2);
        value.push(0);
        value.extend_from_slice(username.as_bytes());
        value.push(0);
        value.extend_from_slice(password.as_bytes());
        request(Opcode::SaslAuth, 0, 0, &[], b"PLAIN", &value)
    }

    pub fn select_bucket(bucket: &str) -> Frame {
        request(Opcode::SelectBucket, 0, 0, &[], bucket.as_bytes(), &[])
    }

    pub fn helo(name: &str, features: &[u16]) -> Frame {
        let mut value = Vec::with_capacity(features.len() * 2);
        for &feature in features {
            value.write_u16::<BigEndian>(feature).unwrap();
        }
        request(Opcode::Helo, 0, 0, &[], name.as_bytes(), &value)
    }

    pub fn control(key: &str, value: &str) -> Frame {
        request(Opcode::Control, 0, 0, &[], key.as_bytes(), value.as_bytes())
    }

    pub fn stream_request(
        partition: u16,
        opaque: u32,
        vbucket_uuid: u64,
        start_seqno: u64,
        end_seqno: u64,
        snapshot_start_seqno: u64,
        snapshot_end_seqno: u64,
    ) -> Frame {
        let mut extras = Vec::with_capacity(48);
        extras.write_u32::<BigEndian>(0).unwrap();
        extras.write_u32::<BigEndian>(0).unwrap();
        extras.write_u64::<BigEndian>(start_seqno).unwrap();
        extras.write_u64::<BigEndian>(end_seqno).unwrap();
        extras.write_u64::<BigEndian>(vbucket_uuid).unwrap();
        extras.write_u64::<BigEndian>(snapshot_start_seqno).unwrap();
        extras.write_u64::<BigEndian>(snapshot_end_seqno).unwrap();
        request(Opcode::StreamRequest, partition, opaque, &extras, &[], &[])
    }

    pub fn close_stream(partition: u16, opaque: u32) -> Frame {
        request(Opcode::CloseStream, partition, opaque, &[], &[], &[])
    }

    pub fn get_failover_log(partition: u16, opaque: u32) -> Frame {
        request(Opcode::GetFailoverLog, partition, opaque, &[], &[], &[])
    }

    pub fn get_all_vb_seqnos(opaque: u32) -> Frame {
        request(Opcode::GetAllVbSeqnos, 0, opaque, &[], &[], &[])
    }

    pub fn buffer_ack(bytes: u32) -> Frame {
        let mut extras = Vec::with_capacity(4);
        extras.write_u32::<BigEndian>(bytes).unwrap();
        request(Opcode::BufferAck, 0, 0, &extras, &[], &[])
    }

    /// Reply to a server-initiated NOOP, echoing its opaque.
    pub fn noop_reply(opaque: u32) -> Frame {
        Frame {
            header: Header {
                magic: Magic::Response,
                opcode: Opcode::Noop.into(),
                key_len: 0,
                extras_len: 0,
                data_type: 0,
                vbucket_or_status: Status::Success.code(),
                body_len: 0,
                opaque,
                cas: 0,
            },
            body: Vec::new(),
        }
    }
}
