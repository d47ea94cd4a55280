//! 网络层
//! 本层只关心报文编解码与 udp 读写，不包含任何传输状态逻辑

pub(crate) use conn::Connection;

pub(crate) mod conn;
pub mod packet;
