//! 一个 tftp 服务端库（RFC 1350），用户实现 [`Handler`] 提供/接收文件内容即可构建自己的 tftp server

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

pub use bridge::{BridgeReader, BridgeWriter};
pub use config::Config;
pub use error::Error;
pub use network::conn::Error as ConnectionError;
pub use network::packet::{self, ErrorCode, Mode};
pub use protocol::Error as TransferError;
pub use server::{ListenHandle, Server};

pub mod bridge;
pub mod config;
pub mod error;
pub mod netascii;
mod network;
mod protocol;
mod server;

/// 文件内容的提供方与接收方，由用户实现
///
/// 每个请求都在独立的任务中调用，handler 与传输会话只通过 bridge 交换数据。
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// 读请求：把文件内容写入 writer，结束后调用 `close`，
    /// 出错时调用 `close_with_error`，错误码和信息会发给客户端
    async fn handle_read(&self, filename: String, mode: Mode, writer: BridgeWriter);
    /// 写请求：从 reader 读取客户端上传的内容，直到读到结束或出错
    async fn handle_write(&self, filename: String, mode: Mode, reader: BridgeReader);
}

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// 客户端下载
    Read,
    /// 客户端上传
    Write,
}

/// 一次传输的基本信息
#[derive(Debug, Clone)]
pub struct TransferInfo {
    /// 客户端地址
    pub peer: SocketAddr,
    /// 本次传输专用的本地地址
    pub local: SocketAddr,
    pub filename: String,
    pub mode: Mode,
    pub operation: Operation,
}

/// 传输事件发生时的回调，由用户实现
/// 不影响协议行为
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// 接受了一个请求
    async fn accepted(&self, transfer: &TransferInfo);
    /// 传输完成
    async fn completed(&self, transfer: &TransferInfo, bytes: u64);
    /// 传输失败
    async fn failed(&self, transfer: &TransferInfo, error: &TransferError);
    /// 丢弃了一个格式错误的数据报
    async fn dropped(&self, peer: SocketAddr, error: &packet::Error);
}

pub struct HookNoop;

#[async_trait]
impl Hook for HookNoop {
    async fn accepted(&self, _transfer: &TransferInfo) {}

    async fn completed(&self, _transfer: &TransferInfo, _bytes: u64) {}

    async fn failed(&self, _transfer: &TransferInfo, _error: &TransferError) {}

    async fn dropped(&self, _peer: SocketAddr, _error: &packet::Error) {}
}

/// 在独立任务中回调 `Hook::dropped`，不阻塞收包
pub(crate) fn report_dropped(hook: &Arc<dyn Hook>, peer: SocketAddr, error: packet::Error) {
    let hook = hook.clone();
    tokio::spawn(async move { hook.dropped(peer, &error).await });
}
