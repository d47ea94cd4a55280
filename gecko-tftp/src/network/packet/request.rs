use std::{fmt, str::FromStr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::network::packet::{self, Error, Opcode};

/// 传输模式
/// 只影响传输长度语义，内容转换由 handler 负责
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 文本模式
    NetAscii,
    /// 二进制模式
    Octet,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::NetAscii => "netascii",
            Mode::Octet => "octet",
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("netascii") {
            Ok(Mode::NetAscii)
        } else if s.eq_ignore_ascii_case("octet") {
            Ok(Mode::Octet)
        } else {
            Err(Error::InvalidMode(s.into()))
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RRQ / WRQ 共用的请求体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// 请求的资源名
    pub filename: String,
    /// 传输模式
    pub mode: Mode,
}

impl Request {
    pub fn new(filename: impl Into<String>, mode: Mode) -> Self {
        Self {
            filename: packet::strip_nul(filename.into()),
            mode,
        }
    }

    pub(crate) fn read(mut stream: Bytes) -> Result<Self, Error> {
        let filename = packet::read_string(&mut stream)?;
        if filename.is_empty() {
            return Err(Error::EmptyField("filename"));
        }

        let mode = packet::read_string(&mut stream)?;
        if mode.is_empty() {
            return Err(Error::EmptyField("mode"));
        }
        let mode = mode.parse()?;

        // 剩余的 RFC 2347 选项不做协商，直接忽略
        Ok(Self { filename, mode })
    }

    pub(crate) fn write(&self, opcode: Opcode, stream: &mut BytesMut) {
        stream.put_u16(opcode as u16);
        packet::write_string(stream, &self.filename);
        packet::write_string(stream, self.mode.as_str());
    }
}
