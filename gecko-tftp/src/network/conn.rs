use std::net::{IpAddr, SocketAddr};

use bytes::BytesMut;
use tokio::{
    io,
    net::UdpSocket,
    time::{self, Instant},
};

use super::packet::{self, Packet, DATA_HEADER_LEN, DEFAULT_BLOCK_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bind transfer endpoint error: {0}")]
    Bind(#[source] io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Datagram from foreign peer {0}")]
    ForeignPeer(SocketAddr),
    #[error("Receive timeout")]
    Timeout(#[from] time::error::Elapsed),
}

/// 一次传输专用的 udp 端点
/// 只与一个对端通信，以报文为单位读写
pub(crate) struct Connection {
    socket: UdpSocket,
    /// 对端地址，其他来源的数据报一律丢弃
    peer: SocketAddr,
    /// 读缓冲区
    read: BytesMut,
    /// 写缓冲区
    write: BytesMut,
    /// 单个数据报的最大长度
    capacity: usize,
}

impl Connection {
    /// 在 ip 上绑定一个临时端口
    pub(crate) async fn bind(ip: IpAddr, peer: SocketAddr, block_size: usize) -> Result<Self, Error> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0))
            .await
            .map_err(Error::Bind)?;

        Ok(Self::new(socket, peer, block_size))
    }

    pub(crate) fn new(socket: UdpSocket, peer: SocketAddr, block_size: usize) -> Self {
        // 多留一个字节，超长的 DATA 报文才能被识别出来
        let capacity = block_size.max(DEFAULT_BLOCK_SIZE) + DATA_HEADER_LEN + 1;
        Self {
            socket,
            peer,
            read: BytesMut::with_capacity(capacity),
            write: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        packet.write(&mut self.write);
        let sent = self.socket.send_to(&self.write, self.peer).await;
        self.write.clear();
        sent?;

        Ok(())
    }

    /// 在 deadline 之前读取一个报文
    /// 来源不是对端的数据报返回 ForeignPeer，由调用方决定是否继续等待
    pub(crate) async fn read_packet(&mut self, deadline: Instant) -> Result<Packet, Error> {
        self.read.clear();
        self.read.resize(self.capacity, 0);

        let (n, addr) = time::timeout_at(deadline, self.socket.recv_from(&mut self.read)).await??;
        if addr != self.peer {
            return Err(Error::ForeignPeer(addr));
        }

        self.read.truncate(n);
        Ok(Packet::read(self.read.split().freeze())?)
    }
}
