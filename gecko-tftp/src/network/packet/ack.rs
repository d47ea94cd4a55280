use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// 确认的块编号，0 表示确认写请求
    pub block: u16,
}

impl Ack {
    pub fn new(block: u16) -> Self {
        Self { block }
    }

    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let block = packet::read_u16(&mut stream)?;
        if !stream.is_empty() {
            return Err(Error::TrailingBytes(stream.len()));
        }

        Ok(Self { block })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.put_u16(Opcode::Ack as u16);
        stream.put_u16(self.block);
    }
}
