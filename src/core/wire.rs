// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Framing of the messages exchanged with a worker process over its pipes.
//!
//! Each frame starts with a one-byte tag. Frames carrying a payload follow with
//! a big-endian `u32` length and the payload bytes. A failure frame carries a
//! presence byte and a big-endian `u64` position before its message.
//!
//! Payloads are encoded with `bincode`, which reproduces every value exactly,
//! including non-finite floats and nested options.

use crate::error::Error;
use crate::executor::ChunkFailure;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, ErrorKind, Read, Write};

const TAG_PROGRESS: u8 = 1;
const TAG_OUTPUT: u8 = 2;
const TAG_FAILURE: u8 = 3;
const TAG_INPUT: u8 = 4;
const TAG_END: u8 = 5;
const TAG_FINISHED: u8 = 6;

/// A message on a worker pipe.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Worker to controller: one task completed.
    Progress,
    /// Worker to controller: an encoded output.
    Output(Vec<u8>),
    /// Worker to controller: the worker failed and is exiting.
    Failure {
        /// Worker-local position of the failing task, `None` for a setup
        /// failure.
        position: Option<u64>,
        /// Rendered failure.
        message: String,
    },
    /// Controller to worker: an encoded argument tuple.
    Input(Vec<u8>),
    /// Controller to worker: no more input.
    End,
    /// Worker to controller: all inputs processed, the worker is exiting.
    Finished,
}

impl Frame {
    /// Encodes a value into an [`Output`](Self::Output) frame.
    pub(crate) fn output<T: Serialize>(value: &T) -> bincode::Result<Self> {
        bincode::serialize(value).map(Frame::Output)
    }

    /// Encodes a value into an [`Input`](Self::Input) frame.
    pub(crate) fn input<T: Serialize>(value: &T) -> bincode::Result<Self> {
        bincode::serialize(value).map(Frame::Input)
    }

    /// Decodes the payload of an [`Output`](Self::Output) or
    /// [`Input`](Self::Input) frame.
    pub(crate) fn decode<T: DeserializeOwned>(payload: &[u8]) -> bincode::Result<T> {
        bincode::deserialize(payload)
    }

    /// Serializes this frame.
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        match self {
            Frame::Progress => bytes.push(TAG_PROGRESS),
            Frame::Output(payload) => {
                bytes.push(TAG_OUTPUT);
                push_bytes(&mut bytes, payload)?;
            }
            Frame::Failure { position, message } => {
                bytes.push(TAG_FAILURE);
                bytes.push(u8::from(position.is_some()));
                bytes.extend_from_slice(&position.unwrap_or(0).to_be_bytes());
                push_bytes(&mut bytes, message.as_bytes())?;
            }
            Frame::Input(payload) => {
                bytes.push(TAG_INPUT);
                push_bytes(&mut bytes, payload)?;
            }
            Frame::End => bytes.push(TAG_END),
            Frame::Finished => bytes.push(TAG_FINISHED),
        }
        Ok(bytes)
    }

    /// Writes this frame with a single `write_all()` call.
    pub(crate) fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.encode()?)
    }

    /// Reads the next frame.
    ///
    /// Returns `None` if the stream ended cleanly between two frames. A stream
    /// that ends in the middle of a frame is an [`ErrorKind::UnexpectedEof`]
    /// error.
    pub(crate) fn read_from(reader: &mut impl Read) -> io::Result<Option<Frame>> {
        let mut tag = [0u8; 1];
        loop {
            match reader.read(&mut tag) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let frame = match tag[0] {
            TAG_PROGRESS => Frame::Progress,
            TAG_OUTPUT => Frame::Output(read_bytes(reader)?),
            TAG_FAILURE => {
                let has_position = read_array::<1>(reader)?[0] != 0;
                let position = u64::from_be_bytes(read_array(reader)?);
                let message = String::from_utf8_lossy(&read_bytes(reader)?).into_owned();
                Frame::Failure {
                    position: has_position.then_some(position),
                    message,
                }
            }
            TAG_INPUT => Frame::Input(read_bytes(reader)?),
            TAG_END => Frame::End,
            TAG_FINISHED => Frame::Finished,
            tag => {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown frame tag {tag:#04x}"),
                ))
            }
        };
        Ok(Some(frame))
    }
}

impl From<ChunkFailure> for Frame {
    fn from(failure: ChunkFailure) -> Self {
        Frame::Failure {
            position: failure.position.map(|p| p as u64),
            message: failure.message,
        }
    }
}

/// Reads the next frame sent by the given worker. A worker that closes its
/// pipe before sending a terminal frame, or whose call was aborted in the
/// meantime, is reported as lost.
pub(crate) fn expect_frame(worker: usize, reader: &mut impl Read) -> Result<Frame, Error> {
    match Frame::read_from(reader) {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(Error::WorkerLost { worker }),
        Err(e) if matches!(e.kind(), ErrorKind::UnexpectedEof | ErrorKind::ConnectionAborted) => {
            Err(Error::WorkerLost { worker })
        }
        Err(e) => Err(e.into()),
    }
}

/// Error for a frame that the worker isn't supposed to send at this point.
pub(crate) fn unexpected_frame(worker: usize, frame: &Frame) -> Error {
    Error::Io(io::Error::new(
        ErrorKind::InvalidData,
        format!("unexpected frame from worker #{worker}: {frame:?}"),
    ))
}

/// Converts a position received on the wire back to an index.
pub(crate) fn to_index(position: u64) -> usize {
    usize::try_from(position).unwrap_or(usize::MAX)
}

fn push_bytes(bytes: &mut Vec<u8>, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("frame payload of {} bytes is too large", payload.len()),
        )
    })?;
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(payload);
    Ok(())
}

fn read_array<const N: usize>(reader: &mut impl Read) -> io::Result<[u8; N]> {
    let mut out = [0u8; N];
    reader.read_exact(&mut out)?;
    Ok(out)
}

fn read_bytes(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = u32::from_be_bytes(read_array(reader)?);
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn read_all(bytes: &[u8]) -> io::Result<Vec<Frame>> {
        let mut reader = Cursor::new(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = Frame::read_from(&mut reader)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn test_frame_layout() {
        let mut bytes = Vec::new();
        Frame::Progress.write_to(&mut bytes).unwrap();
        Frame::Output(b"[1,2]".to_vec())
            .write_to(&mut bytes)
            .unwrap();
        assert_eq!(bytes, b"\x01\x02\x00\x00\x00\x05[1,2]");

        let mut bytes = Vec::new();
        Frame::Failure {
            position: Some(3),
            message: "no".to_owned(),
        }
        .write_to(&mut bytes)
        .unwrap();
        assert_eq!(
            bytes,
            b"\x03\x01\x00\x00\x00\x00\x00\x00\x00\x03\x00\x00\x00\x02no"
        );
    }

    #[test]
    fn test_conversation() {
        let frames = vec![
            Frame::input(&(4u32, "four")).unwrap(),
            Frame::Progress,
            Frame::output(&16u64).unwrap(),
            Frame::Failure {
                position: None,
                message: "setup".to_owned(),
            },
            Frame::End,
            Frame::Finished,
        ];
        let mut bytes = Vec::new();
        for frame in &frames {
            frame.write_to(&mut bytes).unwrap();
        }
        assert_eq!(read_all(&bytes).unwrap(), frames);

        let Frame::Input(payload) = &frames[0] else {
            unreachable!()
        };
        let args: (u32, String) = Frame::decode(payload).unwrap();
        assert_eq!(args, (4, "four".to_owned()));
    }

    #[test]
    fn test_payloads_are_exact() {
        for value in [f64::INFINITY, f64::NAN, -0.0, 2.6759270306654914e-47] {
            let Frame::Output(payload) = Frame::output(&value).unwrap() else {
                unreachable!()
            };
            let decoded: f64 = Frame::decode(&payload).unwrap();
            assert_eq!(decoded.to_bits(), value.to_bits());
        }

        let Frame::Input(payload) = Frame::input(&(Some(None::<u8>),)).unwrap() else {
            unreachable!()
        };
        let decoded: (Option<Option<u8>>,) = Frame::decode(&payload).unwrap();
        assert_eq!(decoded, (Some(None),));
    }

    #[test]
    fn test_truncated_frame() {
        let mut bytes = Vec::new();
        Frame::Output(b"[1,2,3]".to_vec())
            .write_to(&mut bytes)
            .unwrap();
        bytes.truncate(bytes.len() - 2);
        let err = read_all(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_expect_frame_detects_lost_worker() {
        let mut reader = Cursor::new(b"\x01".to_vec());
        assert_eq!(expect_frame(2, &mut reader).unwrap(), Frame::Progress);
        assert!(matches!(
            expect_frame(2, &mut reader),
            Err(Error::WorkerLost { worker: 2 })
        ));

        // Killed in the middle of writing an output.
        let mut reader = Cursor::new(b"\x02\x00\x00\x01\x00[1,".to_vec());
        assert!(matches!(
            expect_frame(5, &mut reader),
            Err(Error::WorkerLost { worker: 5 })
        ));

        // Aborted while waiting for the rest of a frame.
        let aborted = io::Error::new(ErrorKind::ConnectionAborted, "aborted");
        let mut reader = Cursor::new(b"\x02\x00".to_vec())
            .chain(FailingReader(Some(aborted)));
        assert!(matches!(
            expect_frame(3, &mut reader),
            Err(Error::WorkerLost { worker: 3 })
        ));

        // Other errors are reported as is.
        let broken = io::Error::other("broken");
        let mut reader = FailingReader(Some(broken));
        assert!(matches!(expect_frame(3, &mut reader), Err(Error::Io(_))));
    }

    struct FailingReader(Option<io::Error>);

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            match self.0.take() {
                Some(e) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_failure_frame_from_chunk_failure() {
        let frame = Frame::from(ChunkFailure {
            position: Some(4),
            message: "bad".to_owned(),
        });
        assert_eq!(
            frame,
            Frame::Failure {
                position: Some(4),
                message: "bad".to_owned(),
            }
        );
    }

    #[test]
    fn test_unknown_tag() {
        let err = read_all(b"\x01\x7f").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
