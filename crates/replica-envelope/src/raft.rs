//! Replication envelopes
//!
//! Nested descriptors and batch payloads belong to the replication layer and
//! are carried here as opaque encoded bytes.

use crate::codec::skip_field;
use quick_protobuf::sizeofs::*;
use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Result, Writer, WriterBackend};

/// A command proposed to a range's replication group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RaftCommand {
    pub range_id: i64,
    /// Encoded replica descriptor of the proposer
    pub origin_replica: Vec<u8>,
    /// Encoded batch request
    pub cmd: Vec<u8>,
}

impl<'a> MessageRead<'a> for RaftCommand {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.range_id = r.read_int64(bytes)?,
                // Singular nested messages merge, so repeats concatenate
                Ok(18) => msg.origin_replica.extend_from_slice(r.read_bytes(bytes)?),
                Ok(26) => msg.cmd.extend_from_slice(r.read_bytes(bytes)?),
                Ok(t) => skip_field(r, bytes, t, &[1, 2, 3])?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for RaftCommand {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.range_id as u64)
            + 1
            + sizeof_len(self.origin_replica.len())
            + 1
            + sizeof_len(self.cmd.len())
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_int64(self.range_id))?;
        w.write_with_tag(18, |w| w.write_bytes(&self.origin_replica))?;
        w.write_with_tag(26, |w| w.write_bytes(&self.cmd))?;
        Ok(())
    }
}

/// Hybrid logical clock timestamp
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub wall_time: i64,
    pub logical: i32,
}

impl<'a> MessageRead<'a> for Timestamp {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.wall_time = r.read_int64(bytes)?,
                Ok(16) => msg.logical = r.read_int32(bytes)?,
                Ok(t) => skip_field(r, bytes, t, &[1, 2])?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Timestamp {
    fn get_size(&self) -> usize {
        // Negative values sign-extend to ten bytes
        1 + sizeof_varint(self.wall_time as u64) + 1 + sizeof_varint(self.logical as u64)
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_int64(self.wall_time))?;
        w.write_with_tag(16, |w| w.write_int32(self.logical))?;
        Ok(())
    }
}

/// Metadata about the truncated prefix of a replication log
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RaftTruncatedState {
    /// Highest index removed from the log
    pub index: u64,
    /// Term of that entry
    pub term: u64,
}

impl<'a> MessageRead<'a> for RaftTruncatedState {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.index = r.read_uint64(bytes)?,
                Ok(16) => msg.term = r.read_uint64(bytes)?,
                Ok(t) => skip_field(r, bytes, t, &[1, 2])?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for RaftTruncatedState {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.index) + 1 + sizeof_varint(self.term)
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_uint64(self.index))?;
        w.write_with_tag(16, |w| w.write_uint64(self.term))?;
        Ok(())
    }
}

/// Left behind when a replica is removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RaftTombstone {
    pub next_replica_id: i32,
}

impl<'a> MessageRead<'a> for RaftTombstone {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.next_replica_id = r.read_int32(bytes)?,
                Ok(t) => skip_field(r, bytes, t, &[1])?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for RaftTombstone {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.next_replica_id as u64)
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(8, |w| w.write_int32(self.next_replica_id))?;
        Ok(())
    }
}

/// One key/value pair of a snapshot. Absent and empty keys are distinct.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Timestamp,
}

impl<'a> MessageRead<'a> for KeyValue {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.key = Some(r.read_bytes(bytes)?.to_owned()),
                Ok(18) => msg.value = Some(r.read_bytes(bytes)?.to_owned()),
                Ok(26) => msg.timestamp = r.read_message::<Timestamp>(bytes)?,
                Ok(t) => skip_field(r, bytes, t, &[1, 2, 3])?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for KeyValue {
    fn get_size(&self) -> usize {
        self.key.as_ref().map_or(0, |m| 1 + sizeof_len(m.len()))
            + self.value.as_ref().map_or(0, |m| 1 + sizeof_len(m.len()))
            + 1
            + sizeof_len(self.timestamp.get_size())
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        if let Some(ref s) = self.key {
            w.write_with_tag(10, |w| w.write_bytes(s))?;
        }
        if let Some(ref s) = self.value {
            w.write_with_tag(18, |w| w.write_bytes(s))?;
        }
        w.write_with_tag(26, |w| w.write_message(&self.timestamp))?;
        Ok(())
    }
}

/// Payload of a replication snapshot: a raw copy of the range's data
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RaftSnapshotData {
    /// Encoded range descriptor
    pub range_descriptor: Vec<u8>,
    pub kv: Vec<KeyValue>,
    /// Encoded log entries
    pub log_entries: Vec<Vec<u8>>,
}

impl<'a> MessageRead<'a> for RaftSnapshotData {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.range_descriptor.extend_from_slice(r.read_bytes(bytes)?),
                Ok(18) => msg.kv.push(r.read_message::<KeyValue>(bytes)?),
                Ok(26) => msg.log_entries.push(r.read_bytes(bytes)?.to_owned()),
                Ok(t) => skip_field(r, bytes, t, &[1, 2, 3])?,
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for RaftSnapshotData {
    fn get_size(&self) -> usize {
        1 + sizeof_len(self.range_descriptor.len())
            + self
                .kv
                .iter()
                .map(|s| 1 + sizeof_len(s.get_size()))
                .sum::<usize>()
            + self
                .log_entries
                .iter()
                .map(|s| 1 + sizeof_len(s.len()))
                .sum::<usize>()
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(10, |w| w.write_bytes(&self.range_descriptor))?;
        for s in &self.kv {
            w.write_with_tag(18, |w| w.write_message(s))?;
        }
        for s in &self.log_entries {
            w.write_with_tag(26, |w| w.write_bytes(s))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Envelope;

    fn sample_command() -> RaftCommand {
        RaftCommand {
            range_id: 1,
            origin_replica: vec![0x08, 0x01],
            cmd: Vec::new(),
        }
    }

    #[test]
    fn test_command_layout() {
        let command = sample_command();
        let encoded = command.encode_to_vec().unwrap();
        assert_eq!(hex::encode(&encoded), "0801120208011a00");
        assert_eq!(command.get_size(), encoded.len());
        assert_eq!(RaftCommand::decode(&encoded).unwrap(), command);
    }

    #[test]
    fn test_empty_command_emits_every_field() {
        let encoded = RaftCommand::default().encode_to_vec().unwrap();
        assert_eq!(hex::encode(encoded), "080012001a00");
    }

    #[test]
    fn test_negative_range_id_is_ten_byte_varint() {
        let command = RaftCommand {
            range_id: -1,
            ..Default::default()
        };
        let encoded = command.encode_to_vec().unwrap();
        assert_eq!(hex::encode(&encoded), "08ffffffffffffffffff0112001a00");
        assert_eq!(command.get_size(), 15);
        assert_eq!(RaftCommand::decode(&encoded).unwrap().range_id, -1);
    }

    #[test]
    fn test_snapshot_layout() {
        let snapshot = RaftSnapshotData {
            range_descriptor: Vec::new(),
            kv: vec![KeyValue {
                key: Some(b"a".to_vec()),
                value: None,
                timestamp: Timestamp {
                    wall_time: 5,
                    logical: 0,
                },
            }],
            log_entries: vec![vec![0x01]],
        };
        let encoded = snapshot.encode_to_vec().unwrap();
        assert_eq!(hex::encode(&encoded), "0a0012090a01611a04080510001a0101");
        assert_eq!(snapshot.get_size(), encoded.len());
        assert_eq!(RaftSnapshotData::decode(&encoded).unwrap(), snapshot);
    }

    #[test]
    fn test_empty_key_differs_from_absent_key() {
        let empty = KeyValue {
            key: Some(Vec::new()),
            ..Default::default()
        };
        let encoded = empty.encode_to_vec().unwrap();
        assert_eq!(hex::encode(&encoded), "0a001a0408001000");
        assert_eq!(KeyValue::decode(&encoded).unwrap().key, Some(Vec::new()));

        let absent = KeyValue::default().encode_to_vec().unwrap();
        assert_eq!(hex::encode(&absent), "1a0408001000");
        assert_eq!(KeyValue::decode(&absent).unwrap().key, None);
    }

    #[test]
    fn test_small_records() {
        let truncated = RaftTruncatedState { index: 10, term: 5 };
        assert_eq!(hex::encode(truncated.encode_to_vec().unwrap()), "080a1005");

        let tombstone = RaftTombstone { next_replica_id: 3 };
        assert_eq!(hex::encode(tombstone.encode_to_vec().unwrap()), "0803");

        let ts = Timestamp {
            wall_time: 1,
            logical: -1,
        };
        let encoded = ts.encode_to_vec().unwrap();
        assert_eq!(encoded.len(), 2 + 1 + 10);
        assert_eq!(ts.get_size(), encoded.len());
        assert_eq!(Timestamp::decode(&encoded).unwrap(), ts);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut data = hex::decode("0801").unwrap();
        data.extend_from_slice(&[0x48, 0x05]); // field 9 varint
        data.extend_from_slice(&[0x51, 1, 2, 3, 4, 5, 6, 7, 8]); // field 10 fixed64
        data.extend_from_slice(&[0x5a, 0x02, 0xaa, 0xbb]); // field 11 bytes
        data.extend_from_slice(&[0x63, 0x08, 0x01, 0x64]); // field 12 group
        data.extend_from_slice(&[0x6d, 1, 2, 3, 4]); // field 13 fixed32
        data.extend_from_slice(&hex::decode("120208011a00").unwrap());

        assert_eq!(RaftCommand::decode(&data).unwrap(), sample_command());
    }

    #[test]
    fn test_last_scalar_wins() {
        let decoded = RaftCommand::decode(&[0x08, 0x01, 0x08, 0x02]).unwrap();
        assert_eq!(decoded.range_id, 2);
    }

    #[test]
    fn test_repeated_nested_message_fields_merge() {
        let decoded = RaftCommand::decode(&hex::decode("1201aa1201bb").unwrap()).unwrap();
        assert_eq!(decoded.origin_replica, vec![0xaa, 0xbb]);
    }

    #[test]
    fn test_decode_errors() {
        // Known field with the wrong wire type
        assert!(RaftCommand::decode(&[0x0a, 0x00]).is_err());
        // Truncated length-delimited field
        assert!(RaftCommand::decode(&[0x12, 0x05, 0x01]).is_err());
        // Varint longer than ten bytes
        assert!(RaftTombstone::decode(&[
            0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01
        ])
        .is_err());
        // Field number zero
        assert!(RaftSnapshotData::decode(&[0x00]).is_err());
        // End group without a start
        assert!(RaftSnapshotData::decode(&[0x0c]).is_err());
        // Unterminated group
        assert!(RaftSnapshotData::decode(&[0x63, 0x08, 0x01]).is_err());
        // A corrupt nested pair fails the whole snapshot
        assert!(RaftSnapshotData::decode(&[0x12, 0x02, 0x0a, 0x05]).is_err());
    }
}
