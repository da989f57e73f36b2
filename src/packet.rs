//! Packet framing (§4.E): a small header plus an ordered list of records,
//! written and read over any `std::io::{Write, Read}` stream.

use std::io::{self, Read, Write};
use std::{error, fmt};

use crate::data::{Data, DataError};
use crate::record::{Context, Record};
use crate::types::{Type, TypeParseError};

/// Errors raised while writing or reading a packet.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// A record's type tag failed to parse.
    Tag(TypeParseError),
    /// A record's payload failed to unflatten against its own tag.
    Payload(DataError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::Tag(err) => err.fmt(f),
            Self::Payload(err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<TypeParseError> for Error {
    fn from(err: TypeParseError) -> Self {
        Self::Tag(err)
    }
}

impl From<DataError> for Error {
    fn from(err: DataError) -> Self {
        Self::Payload(err)
    }
}

/// `(context, target, request, records)`: the unit of communication
/// between LabRAD peers (§3.3).
#[derive(Debug, PartialEq)]
pub struct Packet {
    pub context: Context,
    pub target: u32,
    pub request: i32,
    pub records: Vec<Record>,
}

impl Packet {
    #[must_use]
    pub fn new(context: Context, target: u32, request: i32, records: Vec<Record>) -> Self {
        Self {
            context,
            target,
            request,
            records,
        }
    }

    /// Serialize and write this packet, flushing afterward so latency is
    /// bounded by the caller's own buffering rather than ours.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        let mut body = Vec::new();
        for record in &self.records {
            let tag = record.data.data_type().tag();
            let tag_bytes = tag.as_bytes();
            let payload = record.data.flatten();

            body.extend_from_slice(&record.id.to_be_bytes());
            body.extend_from_slice(&(tag_bytes.len() as u32).to_be_bytes());
            body.extend_from_slice(tag_bytes);
            body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            body.extend_from_slice(&payload);
        }

        w.write_all(&self.context.high.to_be_bytes())?;
        w.write_all(&self.context.low.to_be_bytes())?;
        w.write_all(&self.request.to_be_bytes())?;
        w.write_all(&self.target.to_be_bytes())?;
        w.write_all(&(body.len() as u32).to_be_bytes())?;
        w.write_all(&body)?;
        w.flush()?;
        Ok(())
    }

    /// Read exactly one packet from `r`, consuming exactly the header
    /// plus `records_length` bytes it declares.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Packet, Error> {
        let high = read_u32(r)?;
        let low = read_u32(r)?;
        let request = read_i32(r)?;
        let target = read_u32(r)?;
        let records_length = read_u32(r)? as usize;

        let mut body = vec![0u8; records_length];
        r.read_exact(&mut body)?;

        let mut records = Vec::new();
        let mut cursor = &body[..];
        while !cursor.is_empty() {
            let id = read_u32(&mut cursor)?;
            let tag_length = read_u32(&mut cursor)? as usize;
            let mut tag_bytes = vec![0u8; tag_length];
            cursor.read_exact(&mut tag_bytes)?;
            let tag: String = tag_bytes.iter().map(|&b| b as char).collect();
            let ty = Type::parse(&tag)?;

            let payload_length = read_u32(&mut cursor)? as usize;
            let mut payload = vec![0u8; payload_length];
            cursor.read_exact(&mut payload)?;

            let data = Data::unflatten(&payload, ty)?;
            records.push(Record::new(id, data));
        }

        Ok(Packet::new(Context::new(high, low), target, request, records))
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, io::Error> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32, io::Error> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_record_matches_spec_example() {
        let mut data = Data::new(Type::parse("i").unwrap());
        data.set_int(42, &[]).unwrap();
        let packet = Packet::new(Context::new(1, 2), 3, 5, vec![Record::new(7, data)]);

        let mut buf = Vec::new();
        packet.write_to(&mut buf).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 1]); // context.high
        expected.extend_from_slice(&[0, 0, 0, 2]); // context.low
        expected.extend_from_slice(&[0, 0, 0, 5]); // request
        expected.extend_from_slice(&[0, 0, 0, 3]); // target
        expected.extend_from_slice(&[0, 0, 0, 13]); // records_length: 4+4+1+4+4
        expected.extend_from_slice(&[0, 0, 0, 7]); // record.id
        expected.extend_from_slice(&[0, 0, 0, 1]); // tag_length
        expected.push(b'i');
        expected.extend_from_slice(&[0, 0, 0, 4]); // payload_length
        expected.extend_from_slice(&[0, 0, 0, 0x2A]); // payload

        assert_eq!(buf, expected);
    }

    #[test]
    fn round_trip_through_stream() {
        let mut data = Data::new(Type::parse("(i*s)").unwrap());
        data.set_int(5, &[0]).unwrap();
        data.set_array_size(2, &[1]).unwrap();
        data.set_string("a", &[1, 0]).unwrap();
        data.set_string("bcd", &[1, 1]).unwrap();
        let packet = Packet::new(Context::new(9, 10), 1, -3, vec![Record::new(2, data)]);

        let mut buf = Vec::new();
        packet.write_to(&mut buf).unwrap();

        let mut cursor: &[u8] = &buf;
        let decoded = Packet::read_from(&mut cursor).unwrap();

        assert_eq!(decoded.context, Context::new(9, 10));
        assert_eq!(decoded.target, 1);
        assert_eq!(decoded.request, -3);
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.records[0].id, 2);
        assert_eq!(decoded.records[0].data.get_int(&[0]).unwrap(), 5);
        assert_eq!(decoded.records[0].data.get_string(&[1, 0]).unwrap(), "a");
        assert_eq!(decoded.records[0].data.get_string(&[1, 1]).unwrap(), "bcd");
    }

    #[test]
    fn zero_records_round_trips() {
        let packet = Packet::new(Context::new(0, 0), 0, 0, vec![]);
        let mut buf = Vec::new();
        packet.write_to(&mut buf).unwrap();
        let mut cursor: &[u8] = &buf;
        let decoded = Packet::read_from(&mut cursor).unwrap();
        assert!(decoded.records.is_empty());
    }

    #[test]
    fn malformed_tag_surfaces_as_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0, 0, 0, 0]); // context.high
        buf.extend_from_slice(&[0, 0, 0, 0]); // context.low
        buf.extend_from_slice(&[0, 0, 0, 0]); // request
        buf.extend_from_slice(&[0, 0, 0, 0]); // target
        let mut body = Vec::new();
        body.extend_from_slice(&[0, 0, 0, 1]); // record.id
        body.extend_from_slice(&[0, 0, 0, 2]); // tag_length
        body.extend_from_slice(b"()"); // empty cluster: invalid
        body.extend_from_slice(&[0, 0, 0, 0]); // payload_length
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        let mut cursor: &[u8] = &buf;
        let err = Packet::read_from(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::Tag(_)));
    }
}
