//! Top-level encode/decode and unknown-field skipping

use quick_protobuf::errors::Error;
use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Result, Writer};

const WIRE_START_GROUP: u32 = 3;
const WIRE_END_GROUP: u32 = 4;
const MAX_GROUP_DEPTH: usize = 64;

/// Unprefixed encoding of a whole envelope
pub trait Envelope: for<'a> MessageRead<'a> + MessageWrite {
    fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.get_size());
        let mut writer = Writer::new(&mut buf);
        self.write_message(&mut writer)?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized,
    {
        let mut reader = BytesReader::from_bytes(bytes);
        Self::from_reader(&mut reader, bytes)
    }
}

impl<T> Envelope for T where T: for<'a> MessageRead<'a> + MessageWrite {}

/// Skip a field the reader did not match.
///
/// `known` lists the message's field numbers: a known field arriving with
/// another wire type is an error rather than an unknown field.
pub(crate) fn skip_field(
    r: &mut BytesReader,
    bytes: &[u8],
    tag: u32,
    known: &[u32],
) -> Result<()> {
    let field = tag >> 3;
    if known.contains(&field) {
        return Err(Error::Message(format!(
            "field {} has unexpected wire type {}",
            field,
            tag & 7
        )));
    }
    skip_nested(r, bytes, tag, 0)
}

fn skip_nested(r: &mut BytesReader, bytes: &[u8], tag: u32, depth: usize) -> Result<()> {
    if tag >> 3 == 0 {
        return Err(Error::Message(format!("illegal tag {}", tag)));
    }
    match tag & 7 {
        WIRE_START_GROUP => {
            if depth >= MAX_GROUP_DEPTH {
                return Err(Error::Message("groups nested too deeply".to_string()));
            }
            let end = (tag & !7) | WIRE_END_GROUP;
            loop {
                if r.is_eof() {
                    return Err(Error::UnexpectedEndOfBuffer);
                }
                let next = r.next_tag(bytes)?;
                if next == end {
                    return Ok(());
                }
                skip_nested(r, bytes, next, depth + 1)?;
            }
        }
        WIRE_END_GROUP => Err(Error::Message(format!(
            "unexpected end group for field {}",
            tag >> 3
        ))),
        _ => r.read_unknown(bytes, tag),
    }
}
