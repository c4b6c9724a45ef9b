//! JT/T 808-style "Huabao" binary protocol
//!
//! The workhorse protocol of the gateway: delimiter-framed, escape-stuffed
//! binary messages with a TLV-rich location report. Message envelope after
//! unescaping:
//!
//! ```text
//! delimiter(1) | type(2 BE) | attribute(2 BE) | id(6 or 7) | index(1 or 2)
//! | body | xor checksum(1) | delimiter(1)
//! ```
//!
//! The id is 7 bytes when the alternative (0xE7) framing is in use, 6
//! otherwise. The index is a single byte only for the v2 location report
//! types.

pub mod frame;

mod decoder;
mod encoder;

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};

pub use self::{
    decoder::HuabaoDecoder,
    encoder::HuabaoCommandEncoder,
    frame::{
        HuabaoFrameDecoder,
        HuabaoFrameEncoder,
    },
};
use crate::{
    protocol::{
        CommandEncoder,
        FrameDecoder,
        FrameEncoder,
        MessageDecoder,
        Protocol,
    },
    util::xor_checksum,
};

pub const PROTOCOL_NAME: &str = "huabao";

pub const MSG_TERMINAL_GENERAL_RESPONSE: u16 = 0x0001;
pub const MSG_GENERAL_RESPONSE: u16 = 0x8001;
pub const MSG_GENERAL_RESPONSE_2: u16 = 0x4401;
pub const MSG_HEARTBEAT: u16 = 0x0002;
pub const MSG_HEARTBEAT_2: u16 = 0x0506;
pub const MSG_TERMINAL_REGISTER: u16 = 0x0100;
pub const MSG_TERMINAL_REGISTER_RESPONSE: u16 = 0x8100;
pub const MSG_TERMINAL_CONTROL: u16 = 0x8105;
pub const MSG_TERMINAL_AUTH: u16 = 0x0102;
pub const MSG_LOCATION_REPORT: u16 = 0x0200;
pub const MSG_LOCATION_BATCH_2: u16 = 0x0210;
pub const MSG_ACCELERATION: u16 = 0x2070;
pub const MSG_LOCATION_REPORT_2: u16 = 0x5501;
pub const MSG_LOCATION_REPORT_BLIND: u16 = 0x5502;
pub const MSG_LOCATION_BATCH: u16 = 0x0704;
pub const MSG_OIL_CONTROL: u16 = 0xa006;
pub const MSG_TIME_SYNC_REQUEST: u16 = 0x0109;
pub const MSG_TIME_SYNC_RESPONSE: u16 = 0x8109;
pub const MSG_PHOTO: u16 = 0x8888;
pub const MSG_TRANSPARENT: u16 = 0x0900;
pub const MSG_PARAMETER_SETTING: u16 = 0x0310;
pub const MSG_SEND_TEXT_MESSAGE: u16 = 0x8300;
pub const MSG_REPORT_TEXT_MESSAGE: u16 = 0x6006;
pub const MSG_CONFIGURATION_PARAMETERS: u16 = 0x8103;
pub const MSG_COMMAND_RESPONSE: u16 = 0x0701;

pub const RESULT_SUCCESS: u8 = 0;

/// Builds a complete (unescaped) message: envelope, body, checksum and
/// delimiters. The checksum covers everything after the leading delimiter
/// up to the last body byte.
pub fn format_message(delimiter: u8, msg_type: u16, id: &[u8], short_index: bool, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + id.len() + 8);
    buf.put_u8(delimiter);
    buf.put_u16(msg_type);
    buf.put_u16(body.len() as u16);
    buf.put_slice(id);
    if short_index {
        buf.put_u8(1);
    }
    else {
        buf.put_u16(0);
    }
    buf.put_slice(body);
    let checksum = xor_checksum(&buf[1..]);
    buf.put_u8(checksum);
    buf.put_u8(delimiter);
    buf.freeze()
}

#[derive(Debug, Default)]
pub struct HuabaoProtocol;

impl Protocol for HuabaoProtocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn create_frame_decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(HuabaoFrameDecoder::default())
    }

    fn create_frame_encoder(&self) -> Box<dyn FrameEncoder> {
        Box::new(HuabaoFrameEncoder)
    }

    fn create_decoder(&self) -> Box<dyn MessageDecoder> {
        Box::new(HuabaoDecoder::new())
    }

    fn create_command_encoder(&self) -> Option<Box<dyn CommandEncoder>> {
        Some(Box::new(HuabaoCommandEncoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_formats_the_envelope() {
        let id = [0x01, 0x23, 0x45, 0x67, 0x89, 0x01];
        let message = format_message(0x7e, MSG_TERMINAL_CONTROL, &id, false, &[0xf0]);

        assert_eq!(
            &message[..],
            &[
                0x7e, 0x81, 0x05, 0x00, 0x01, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x00, 0x00,
                0xf0, 0xfd, 0x7e,
            ],
        );
    }

    #[test]
    fn it_uses_the_short_index_marker() {
        let id = [0x01, 0x23, 0x45, 0x67, 0x89, 0x01];
        let message = format_message(0x7e, MSG_GENERAL_RESPONSE_2, &id, true, &[0x55, 0x01, 0x00]);

        // type, length, id, then the single 0x01 index byte
        assert_eq!(message[11], 0x01);
        assert_eq!(&message[12..15], &[0x55, 0x01, 0x00]);
    }
}
