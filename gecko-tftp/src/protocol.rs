//! 协议层
//! 单个传输的块确认状态机，依赖网络层收发报文，通过 bridge 与 handler 交换数据

use std::{future::Future, sync::Arc, time::Duration};

use log::{debug, warn};
use tokio::time::{self, Instant};

use crate::{
    bridge, config,
    network::{
        conn,
        packet::{ErrorCode, ErrorPacket, Packet},
        Connection,
    },
    report_dropped, Hook,
};

pub(crate) use receiver::Receiver;
pub(crate) use sender::Sender;

mod receiver;
mod sender;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] conn::Error),
    #[error("No response after {0} retransmissions")]
    RetryExhausted(u32),
    #[error("Handler error: {0}")]
    Handler(#[from] bridge::Error),
    #[error("Handler timed out")]
    HandlerTimeout,
    #[error("Peer error {code}: {message}")]
    Peer { code: ErrorCode, message: String },
}

impl Error {
    /// 描述本次失败的 ERROR 报文，发给对端，同时用于关闭 bridge
    pub(crate) fn to_packet(&self) -> ErrorPacket {
        match self {
            Error::Connection(e) => ErrorPacket::new(ErrorCode::NotDefined, e.to_string()),
            Error::RetryExhausted(_) => {
                ErrorPacket::new(ErrorCode::NotDefined, "transfer timed out")
            }
            Error::Handler(e) => e.to_packet(),
            Error::HandlerTimeout => ErrorPacket::new(ErrorCode::NotDefined, "handler timed out"),
            Error::Peer { code, message } => ErrorPacket::new(*code, message.clone()),
        }
    }
}

impl From<ErrorPacket> for Error {
    fn from(packet: ErrorPacket) -> Self {
        Error::Peer {
            code: packet.code,
            message: packet.message,
        }
    }
}

/// 会话与对端之间的一问一答
/// 保存最后发出的报文，超时后重传，重传次数用完即放弃
pub(crate) struct Exchange {
    conn: Connection,
    cfg: config::Transfer,
    hook: Arc<dyn Hook>,
    /// 最后发出的报文
    last: Option<Packet>,
    /// 剩余重传次数
    retries: u32,
    /// 等待回复的截止时间
    deadline: Instant,
}

impl Exchange {
    pub(crate) fn new(conn: Connection, cfg: config::Transfer, hook: Arc<dyn Hook>) -> Self {
        let retries = cfg.retries;
        Self {
            conn,
            cfg,
            hook,
            last: None,
            retries,
            deadline: Instant::now(),
        }
    }

    pub(crate) fn block_size(&self) -> usize {
        self.cfg.block_size
    }

    /// 发送一个新报文，传输有了进展，重传次数复位
    pub(crate) async fn send(&mut self, packet: Packet) -> Result<(), Error> {
        self.conn.write_packet(&packet).await?;
        self.last = Some(packet);
        self.retries = self.cfg.retries;
        self.deadline = Instant::now() + self.cfg.timeout();
        Ok(())
    }

    /// 重发最后一个报文，不改变截止时间
    pub(crate) async fn resend(&mut self) -> Result<(), Error> {
        if let Some(packet) = &self.last {
            self.conn.write_packet(packet).await?;
        }
        Ok(())
    }

    /// 等待对端的下一个有效报文
    /// 来源不对或格式错误的数据报直接丢弃，超时则重传
    pub(crate) async fn recv(&mut self) -> Result<Packet, Error> {
        loop {
            match self.conn.read_packet(self.deadline).await {
                Ok(packet) => return Ok(packet),
                Err(conn::Error::Timeout(_)) => {
                    if self.retries == 0 {
                        return Err(Error::RetryExhausted(self.cfg.retries));
                    }
                    self.retries -= 1;
                    debug!(
                        "timeout waiting for {}, retransmit ({} left)",
                        self.conn.peer_addr(),
                        self.retries
                    );
                    self.resend().await?;
                    self.deadline = Instant::now() + self.cfg.timeout();
                }
                Err(conn::Error::ForeignPeer(addr)) => {
                    debug!("ignore datagram from foreign peer {}", addr)
                }
                Err(conn::Error::Packet(e)) => {
                    debug!("ignore malformed packet from {}: {}", self.conn.peer_addr(), e);
                    report_dropped(&self.hook, self.conn.peer_addr(), e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 通知对端传输失败，ERROR 报文不重传也不需要确认
    pub(crate) async fn send_error(&mut self, packet: ErrorPacket) {
        debug!(
            "send ERROR (code={}) to {}: {}",
            packet.code,
            self.conn.peer_addr(),
            packet.message
        );
        if let Err(e) = self.conn.write_packet(&Packet::Error(packet)).await {
            warn!("send error packet to {} failed: {}", self.conn.peer_addr(), e);
        }
    }

    /// 限时执行一次 bridge 读写，handler 卡住时不会让会话永远挂起
    pub(crate) async fn bridge<T, F>(&self, io: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, bridge::Error>>,
    {
        Ok(time::timeout(self.handler_timeout(), io)
            .await
            .map_err(|_| Error::HandlerTimeout)??)
    }

    fn handler_timeout(&self) -> Duration {
        self.cfg.handler_timeout()
    }
}
