//! TFTP 报文编解码（RFC 1350）
//! 本模块只做字节与报文之间的转换，不涉及任何 I/O

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use ack::Ack;
pub use data::Data;
pub use error_packet::{ErrorCode, ErrorPacket};
pub use request::{Mode, Request};

pub mod ack;
pub mod data;
pub mod error_packet;
pub mod request;

/// 默认块大小，也是协议规定的固定块大小
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// DATA 报文头长度：opcode + block
pub const DATA_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(u16),
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("String field is not NUL terminated")]
    MissingTerminator,
    #[error("Empty {0} field")]
    EmptyField(&'static str),
    #[error("Malformed UTF-8 string")]
    MalformedString,
    #[error("Invalid transfer mode: {0}")]
    InvalidMode(String),
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// 报文类型，2 字节
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// 读请求 (RRQ)
    ReadRequest = 1,
    /// 写请求 (WRQ)
    WriteRequest,
    /// 数据 (DATA)
    Data,
    /// 确认 (ACK)
    Ack,
    /// 错误 (ERROR)
    Error,
}

impl TryFrom<u16> for Opcode {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Error> {
        match value {
            1 => Ok(Opcode::ReadRequest),
            2 => Ok(Opcode::WriteRequest),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            op => Err(Error::InvalidOpcode(op)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(Request),
    WriteRequest(Request),
    Data(Data),
    Ack(Ack),
    Error(ErrorPacket),
}

impl Packet {
    /// 从一个完整的数据报中解析报文
    pub fn read(mut stream: Bytes) -> Result<Self, Error> {
        let opcode = Opcode::try_from(read_u16(&mut stream)?)?;

        let packet = match opcode {
            Opcode::ReadRequest => Packet::ReadRequest(Request::read(stream)?),
            Opcode::WriteRequest => Packet::WriteRequest(Request::read(stream)?),
            Opcode::Data => Packet::Data(Data::read(stream)?),
            Opcode::Ack => Packet::Ack(Ack::read(stream)?),
            Opcode::Error => Packet::Error(ErrorPacket::read(stream)?),
        };

        Ok(packet)
    }

    pub fn write(&self, stream: &mut BytesMut) {
        match self {
            Packet::ReadRequest(request) => request.write(Opcode::ReadRequest, stream),
            Packet::WriteRequest(request) => request.write(Opcode::WriteRequest, stream),
            Packet::Data(data) => data.write(stream),
            Packet::Ack(ack) => ack.write(stream),
            Packet::Error(error) => error.write(stream),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut stream = BytesMut::new();
        self.write(&mut stream);
        stream.freeze()
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::ReadRequest(_) => Opcode::ReadRequest,
            Packet::WriteRequest(_) => Opcode::WriteRequest,
            Packet::Data(_) => Opcode::Data,
            Packet::Ack(_) => Opcode::Ack,
            Packet::Error(_) => Opcode::Error,
        }
    }
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::InsufficientBytes(2 - stream.len()));
    }

    Ok(stream.get_u16())
}

/// 读取以 NUL 结尾的字符串，返回值不含 NUL
fn read_string(stream: &mut Bytes) -> Result<String, Error> {
    let end = stream
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::MissingTerminator)?;
    let s = stream.split_to(end);
    stream.advance(1);

    String::from_utf8(s.to_vec()).map_err(|_| Error::MalformedString)
}

/// NUL 是字段分隔符，字符串内的 NUL 不写出
fn write_string(stream: &mut BytesMut, s: &str) {
    stream.extend(s.bytes().filter(|&b| b != 0));
    stream.put_u8(0);
}

/// 去掉字符串内的 NUL，保证编码后能原样读回
pub(crate) fn strip_nul(s: String) -> String {
    if s.contains('\0') {
        s.replace('\0', "")
    } else {
        s
    }
}
