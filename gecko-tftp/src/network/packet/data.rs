use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, Opcode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    /// 块编号，从 1 开始，65535 之后回绕到 0
    pub block: u16,
    /// 块内容，长度小于块大小时表示传输结束
    pub payload: Bytes,
}

impl Data {
    pub fn new(block: u16, payload: Bytes) -> Self {
        Self { block, payload }
    }

    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let block = packet::read_u16(&mut stream)?;

        Ok(Self {
            block,
            payload: stream,
        })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.reserve(packet::DATA_HEADER_LEN + self.payload.len());
        stream.put_u16(Opcode::Data as u16);
        stream.put_u16(self.block);
        stream.extend_from_slice(&self.payload);
    }
}
