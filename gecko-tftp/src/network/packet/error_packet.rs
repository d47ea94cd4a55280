use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, Opcode};

/// ERROR 报文错误码
/// 按线上的数值比较，`Other(1)` 与 `FileNotFound` 相等
#[derive(Debug, Clone, Copy)]
pub enum ErrorCode {
    /// 未定义，见错误信息
    NotDefined,
    FileNotFound,
    AccessViolation,
    /// 磁盘已满或超出分配
    DiskFull,
    IllegalOperation,
    /// 未知的传输 ID（端口）
    UnknownTransferId,
    FileAlreadyExists,
    NoSuchUser,
    /// 协议之外的错误码，原样保留
    Other(u16),
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            0 => ErrorCode::NotDefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            code => ErrorCode::Other(code),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Other(code) => code,
        }
    }
}

impl PartialEq for ErrorCode {
    fn eq(&self, other: &Self) -> bool {
        u16::from(*self) == u16::from(*other)
    }
}

impl Eq for ErrorCode {}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, u16::from(*self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: ErrorCode,
    /// 给人看的错误信息，可以为空
    pub message: String,
}

impl ErrorPacket {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: packet::strip_nul(message.into()),
        }
    }

    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let code = packet::read_u16(&mut stream)?.into();
        let message = packet::read_string(&mut stream)?;

        Ok(Self { code, message })
    }

    pub(crate) fn write(&self, stream: &mut BytesMut) {
        stream.put_u16(Opcode::Error as u16);
        stream.put_u16(self.code.into());
        packet::write_string(stream, &self.message);
    }
}
