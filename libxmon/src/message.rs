use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::error::TransportError;
use super::frame::ProcessedFrame;

const KIND_RESULT: u8 = 1;
const KIND_END: u8 = 2;
const KIND_TERMINATE: u8 = 3;
const KIND_TERMINATED: u8 = 4;
const KIND_HELLO: u8 = 5;

/// Everything ranks say to each other
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// worker -> collector: one processed event
    Result(Box<ProcessedFrame>),
    /// worker -> collector: this worker's input is exhausted
    End,
    /// collector -> worker: stop fetching and shut down
    Terminate,
    /// worker -> collector: acknowledgement of Terminate
    Terminated,
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Self::Result(_) => KIND_RESULT,
            Self::End => KIND_END,
            Self::Terminate => KIND_TERMINATE,
            Self::Terminated => KIND_TERMINATED,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Result(_) => "Result",
            Self::End => "End",
            Self::Terminate => "Terminate",
            Self::Terminated => "Terminated",
        }
    }

    /// True for the two messages which retire a worker
    pub fn is_retirement(&self) -> bool {
        matches!(self, Self::End | Self::Terminated)
    }
}

/// A received message tagged with the rank that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: usize,
    pub message: Message,
}

impl Envelope {
    pub fn new(source: usize, message: Message) -> Self {
        Self { source, message }
    }
}

/// What can arrive on a socket. Hello is only used while connecting.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Hello(usize),
    Message(Envelope),
}

/// Write one frame: kind (u8), source rank (u32 BE), payload length (u32 BE), payload
pub fn write_frame<W: Write>(
    writer: &mut W,
    source: usize,
    message: &Message,
) -> Result<(), TransportError> {
    let payload = match message {
        Message::Result(frame) => serde_json::to_vec(frame.as_ref())?,
        _ => Vec::new(),
    };
    write_raw(writer, message.kind(), source, &payload)
}

pub fn write_hello<W: Write>(writer: &mut W, rank: usize) -> Result<(), TransportError> {
    write_raw(writer, KIND_HELLO, rank, &[])
}

fn write_raw<W: Write>(
    writer: &mut W,
    kind: u8,
    source: usize,
    payload: &[u8],
) -> Result<(), TransportError> {
    writer.write_u8(kind)?;
    writer.write_u32::<BigEndian>(source as u32)?;
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read exactly one frame. The kind is checked before the payload is touched.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<WireFrame, TransportError> {
    let kind = reader.read_u8()?;
    let source = reader.read_u32::<BigEndian>()? as usize;
    let length = reader.read_u32::<BigEndian>()? as usize;
    let mut payload = vec![0; length];
    reader.read_exact(&mut payload)?;

    let message = match kind {
        KIND_RESULT => Message::Result(Box::new(serde_json::from_slice(&payload)?)),
        KIND_END => Message::End,
        KIND_TERMINATE => Message::Terminate,
        KIND_TERMINATED => Message::Terminated,
        KIND_HELLO => return Ok(WireFrame::Hello(source)),
        _ => return Err(TransportError::UnknownKind(kind)),
    };
    Ok(WireFrame::Message(Envelope::new(source, message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PeakList;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, 3, &Message::End).unwrap();
        assert_eq!(buffer, vec![2, 0, 0, 0, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn test_result_frame_decodes() {
        let frame = ProcessedFrame {
            event_id: String::from("a//1"),
            timestamp: 10.0,
            peak_list: PeakList::default(),
            hit: false,
            saturated: false,
            beam_energy: None,
            detector_distance: None,
            metrics: BTreeMap::new(),
            detector_image: None,
        };
        let mut buffer = Vec::new();
        write_hello(&mut buffer, 2).unwrap();
        write_frame(&mut buffer, 2, &Message::Result(Box::new(frame.clone()))).unwrap();
        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor).unwrap(), WireFrame::Hello(2));
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            WireFrame::Message(Envelope::new(2, Message::Result(Box::new(frame))))
        );
    }

    #[test]
    fn test_unknown_kind() {
        let mut cursor = Cursor::new(vec![9, 0, 0, 0, 1, 0, 0, 0, 0]);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(TransportError::UnknownKind(9))
        ));
    }
}
