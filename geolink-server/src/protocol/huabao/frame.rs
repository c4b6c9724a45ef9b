//! Delimiter framing with byte stuffing
//!
//! A message starts and ends with the delimiter byte. Standard framing uses
//! `0x7E` with `0x7D` as the escape introducer; the alternative framing
//! (first byte `0xE7`) uses a two-introducer table. Devices may also send
//! parenthesized ASCII sentences on the same port; those are passed through
//! unmodified.
//!
//! Escape tables:
//!
//! ```text
//! standard:     7E -> 7D 02    7D -> 7D 01
//! alternative:  E7 -> E6 02    E6 -> E6 01    3D -> 3E 02    3E -> 3E 01
//! ```

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};

use crate::protocol::{
    FrameDecoder,
    FrameEncoder,
    FrameError,
};

pub const DELIMITER_STANDARD: u8 = 0x7e;
pub const DELIMITER_ALTERNATIVE: u8 = 0xe7;

/// A full message never comes close to this; anything longer without a
/// closing delimiter is a broken peer.
const MAX_FRAME_LENGTH: usize = 8192;

#[derive(Debug, Default)]
pub struct HuabaoFrameDecoder;

impl FrameDecoder for HuabaoFrameDecoder {
    fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if buffer.len() < 2 {
            return Ok(None);
        }

        // parenthesized text sentence
        if buffer[0] == b'(' {
            return match buffer.iter().skip(1).position(|byte| *byte == b')') {
                Some(index) => Ok(Some(buffer.split_to(index + 2).freeze())),
                None if buffer.len() > MAX_FRAME_LENGTH => {
                    Err(FrameError::FrameTooLong {
                        length: buffer.len(),
                    })
                }
                None => Ok(None),
            };
        }

        let delimiter = buffer[0];
        let alternative = delimiter == DELIMITER_ALTERNATIVE;

        let Some(index) = buffer
            .iter()
            .skip(1)
            .position(|byte| *byte == delimiter)
            .map(|position| position + 1)
        else {
            if buffer.len() > MAX_FRAME_LENGTH {
                return Err(FrameError::FrameTooLong {
                    length: buffer.len(),
                });
            }
            return Ok(None);
        };

        let raw = buffer.split_to(index + 1);
        let mut result = BytesMut::with_capacity(raw.len());
        let mut cursor = 0;

        while cursor <= index {
            let byte = raw[cursor];
            cursor += 1;

            if alternative && (byte == 0xe6 || byte == 0x3e) {
                let ext = raw[cursor];
                cursor += 1;
                match (byte, ext) {
                    (0xe6, 0x01) => result.put_u8(0xe6),
                    (0xe6, 0x02) => result.put_u8(0xe7),
                    (0x3e, 0x01) => result.put_u8(0x3e),
                    (0x3e, 0x02) => result.put_u8(0x3d),
                    // malformed escape pair, skipped
                    _ => {}
                }
            }
            else if !alternative && byte == 0x7d {
                let ext = raw[cursor];
                cursor += 1;
                match ext {
                    0x01 => result.put_u8(0x7d),
                    0x02 => result.put_u8(0x7e),
                    // malformed escape pair, skipped
                    _ => {}
                }
            }
            else {
                result.put_u8(byte);
            }
        }

        Ok(Some(result.freeze()))
    }
}

#[derive(Debug, Default)]
pub struct HuabaoFrameEncoder;

impl FrameEncoder for HuabaoFrameEncoder {
    fn encode(&self, frame: &[u8], out: &mut BytesMut) {
        let alternative = frame.first() == Some(&DELIMITER_ALTERNATIVE);

        for (index, &byte) in frame.iter().enumerate() {
            let boundary = index == 0 || index == frame.len() - 1;

            if alternative && (byte == 0xe6 || byte == 0x3d || byte == 0x3e) {
                out.put_u8(if byte == 0xe6 { 0xe6 } else { 0x3e });
                out.put_u8(if byte == 0x3d { 0x02 } else { 0x01 });
            }
            else if alternative && byte == 0xe7 && !boundary {
                out.put_u8(0xe6);
                out.put_u8(0x02);
            }
            else if !alternative && byte == 0x7d {
                out.put_u8(0x7d);
                out.put_u8(0x01);
            }
            else if !alternative && byte == 0x7e && !boundary {
                out.put_u8(0x7d);
                out.put_u8(0x02);
            }
            else {
                out.put_u8(byte);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(input: &[u8]) -> Option<Bytes> {
        let mut buffer = BytesMut::from(input);
        HuabaoFrameDecoder.decode(&mut buffer).unwrap()
    }

    #[test]
    fn it_needs_more_data() {
        assert_eq!(decode_one(&[0x7e]), None);
        assert_eq!(decode_one(&[0x7e, 0x02, 0x00, 0x01]), None);
    }

    #[test]
    fn it_unescapes_a_standard_frame() {
        let frame = decode_one(&[
            0x7e, 0x02, 0x00, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05, 0x7d, 0x01, 0x06, 0x7d,
            0x02, 0x07, 0x7e,
        ])
        .unwrap();

        assert_eq!(
            &frame[..],
            &[
                0x7e, 0x02, 0x00, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05, 0x7d, 0x06, 0x7e,
                0x07, 0x7e,
            ],
        );
    }

    #[test]
    fn it_unescapes_an_alternative_frame() {
        let frame = decode_one(&[
            0xe7, 0x01, 0xe6, 0x01, 0xe6, 0x02, 0x3e, 0x01, 0x3e, 0x02, 0x02, 0xe7,
        ])
        .unwrap();

        assert_eq!(&frame[..], &[0xe7, 0x01, 0xe6, 0xe7, 0x3e, 0x3d, 0x02, 0xe7]);
    }

    #[test]
    fn it_passes_text_sentences_through() {
        let frame = decode_one(b"(013612345678,BASE,2,TIME)").unwrap();
        assert_eq!(&frame[..], &b"(013612345678,BASE,2,TIME)"[..]);

        let mut buffer = BytesMut::from(&b"(incomplete"[..]);
        assert_eq!(HuabaoFrameDecoder.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn it_round_trips_through_the_encoder() {
        let decoded = decode_one(&[
            0x7e, 0x02, 0x00, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05, 0x7d, 0x01, 0x06, 0x7d,
            0x02, 0x07, 0x7e,
        ])
        .unwrap();

        let mut encoded = BytesMut::new();
        HuabaoFrameEncoder.encode(&decoded, &mut encoded);
        assert_eq!(
            &encoded[..],
            &[
                0x7e, 0x02, 0x00, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05, 0x7d, 0x01, 0x06,
                0x7d, 0x02, 0x07, 0x7e,
            ],
        );
    }

    #[test]
    fn it_decodes_two_back_to_back_frames() {
        let mut buffer = BytesMut::from(
            &[
                0x7e, 0x01, 0x02, 0x7e, 0x7e, 0x03, 0x04, 0x7e,
            ][..],
        );

        let first = HuabaoFrameDecoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&first[..], &[0x7e, 0x01, 0x02, 0x7e]);
        let second = HuabaoFrameDecoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&second[..], &[0x7e, 0x03, 0x04, 0x7e]);
    }
}
