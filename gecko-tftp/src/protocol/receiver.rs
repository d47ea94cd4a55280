use bytes::Bytes;
use log::debug;

use crate::{
    bridge::BridgeWriter,
    network::packet::{Ack, Data, Packet},
};

use super::{Error, Exchange};

/// 处理写请求（WRQ）：接收对端上传的数据块，写入 bridge 交给 handler
pub(crate) struct Receiver {
    exchange: Exchange,
    writer: BridgeWriter,
    /// 期望收到的下一个块编号
    expected: u16,
    /// 已写入 bridge 的字节数
    received: u64,
}

impl Receiver {
    pub(crate) fn new(exchange: Exchange, writer: BridgeWriter) -> Self {
        Self::starting_at(exchange, writer, 1)
    }

    /// 从指定块编号开始接收，写请求由 block - 1 确认
    pub(crate) fn starting_at(exchange: Exchange, writer: BridgeWriter, block: u16) -> Self {
        Self {
            exchange,
            writer,
            expected: block,
            received: 0,
        }
    }

    /// 运行到传输结束，返回接收的字节数
    /// 无论成功失败，bridge 写入端都会被关闭
    pub(crate) async fn start(mut self) -> Result<u64, Error> {
        match self.run().await {
            Ok(()) => {
                self.writer.close();
                Ok(self.received)
            }
            Err(e) => {
                let packet = e.to_packet();
                if !matches!(e, Error::Peer { .. } | Error::Connection(_)) {
                    self.exchange.send_error(packet.clone()).await;
                }
                self.writer.close_with(packet.into());
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<(), Error> {
        // 先探测 handler，启动失败时在任何数据交换之前告知对端
        self.exchange.bridge(self.writer.write(Bytes::new())).await?;

        let ack = Ack::new(self.expected.wrapping_sub(1));
        self.exchange.send(Packet::Ack(ack)).await?;

        loop {
            match self.exchange.recv().await? {
                Packet::Data(data) if data.block == self.expected => {
                    if self.accept(data).await? {
                        return Ok(());
                    }
                }
                Packet::Data(data) if data.block == self.expected.wrapping_sub(1) => {
                    // 上一个确认丢了，重发，不再写入 bridge
                    debug!("duplicate block {}, resend ack", data.block);
                    self.exchange.resend().await?;
                }
                Packet::Error(error) => return Err(error.into()),
                packet => debug!("ignore unexpected {:?} packet", packet.opcode()),
            }
        }
    }

    /// 写入一个期望的数据块并确认，返回是否为最后一块
    async fn accept(&mut self, data: Data) -> Result<bool, Error> {
        let block_size = self.exchange.block_size();
        let len = data.payload.len();
        if len > block_size {
            debug!("ignore block {} larger than {} bytes", data.block, block_size);
            return Ok(false);
        }

        self.exchange.bridge(self.writer.write(data.payload)).await?;
        self.received += len as u64;
        self.exchange.send(Packet::Ack(Ack::new(data.block))).await?;

        self.expected = self.expected.wrapping_add(1);
        Ok(len < block_size)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::{
        bridge::{self, BridgeReader},
        network::packet::{ErrorCode, ErrorPacket},
        protocol::tests::{exchange, impatient_cfg, transfer_cfg, Peer},
    };

    fn collect(mut reader: BridgeReader) -> JoinHandle<Result<Vec<u8>, bridge::Error>> {
        tokio::spawn(async move {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.map(|_| out)
        })
    }

    fn data(block: u16, payload: &[u8]) -> Packet {
        Packet::Data(Data::new(block, Bytes::copy_from_slice(payload)))
    }

    #[tokio::test]
    async fn upload_works() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = collect(reader);
        let session = tokio::spawn(Receiver::new(exchange(&peer, transfer_cfg(3)).await, writer).start());

        let content: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(0)));
        peer.send(data(1, &content[..512])).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(1)));
        peer.send(data(2, &content[512..])).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(2)));

        assert_eq!(session.await.unwrap().unwrap(), 1000);
        assert_eq!(handler.await.unwrap().unwrap(), content);
    }

    #[tokio::test]
    async fn duplicate_block_is_acked_once_more() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = collect(reader);
        let session = tokio::spawn(Receiver::new(exchange(&peer, transfer_cfg(3)).await, writer).start());

        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(0)));
        peer.send(data(1, &[7u8; 512])).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(1)));
        peer.send(data(1, &[7u8; 512])).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(1)));
        // 乱序的块直接忽略
        peer.send(data(5, b"stray")).await;
        peer.send(data(2, b"end")).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(2)));

        assert_eq!(session.await.unwrap().unwrap(), 515);
        let mut expected = vec![7u8; 512];
        expected.extend_from_slice(b"end");
        assert_eq!(handler.await.unwrap().unwrap(), expected);
    }

    #[tokio::test]
    async fn block_number_wraps_around() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = collect(reader);
        let exchange = exchange(&peer, transfer_cfg(3)).await;
        let session = tokio::spawn(Receiver::starting_at(exchange, writer, 65535).start());

        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(65534)));
        peer.send(data(65535, &[1u8; 512])).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(65535)));
        peer.send(data(0, &[2u8; 512])).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(0)));
        peer.send(data(1, b"")).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(1)));

        assert_eq!(session.await.unwrap().unwrap(), 1024);
        assert_eq!(handler.await.unwrap().unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn timeout_retransmits_then_fails() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = collect(reader);
        let session = tokio::spawn(Receiver::new(exchange(&peer, impatient_cfg(3)).await, writer).start());

        // 首次确认加三次重传
        for _ in 0..4 {
            assert_eq!(peer.recv().await, Packet::Ack(Ack::new(0)));
        }
        assert_eq!(
            peer.recv().await,
            Packet::Error(ErrorPacket::new(ErrorCode::NotDefined, "transfer timed out"))
        );
        assert!(peer.try_recv(Duration::from_millis(200)).await.is_none());

        assert!(matches!(session.await.unwrap(), Err(Error::RetryExhausted(3))));
        assert!(handler.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn peer_error_aborts_without_reply() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = collect(reader);
        let session = tokio::spawn(Receiver::new(exchange(&peer, transfer_cfg(3)).await, writer).start());

        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(0)));
        peer.send(Packet::Error(ErrorPacket::new(ErrorCode::DiskFull, "client gave up")))
            .await;

        assert!(matches!(session.await.unwrap(), Err(Error::Peer { .. })));
        assert_eq!(
            handler.await.unwrap(),
            Err(bridge::Error::new(ErrorCode::DiskFull, "client gave up"))
        );
        assert!(peer.try_recv(Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn foreign_peer_is_ignored() {
        let mut peer = Peer::new().await;
        let intruder = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = collect(reader);
        let session = tokio::spawn(Receiver::new(exchange(&peer, transfer_cfg(3)).await, writer).start());

        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(0)));
        let server = peer.server.unwrap();
        intruder.send_to(data(1, b"evil"), server).await;
        intruder.socket.send_to(b"\x00\x09junk", server).await.unwrap();
        peer.send(data(1, b"good")).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(1)));

        assert_eq!(session.await.unwrap().unwrap(), 4);
        assert_eq!(handler.await.unwrap().unwrap(), b"good");
    }

    #[tokio::test]
    async fn rejected_probe_sends_error_before_ack() {
        let mut peer = Peer::new().await;
        let (writer, mut reader) = bridge::pipe();
        reader.close_with_error(ErrorCode::FileAlreadyExists, "exists.bin exists");
        let session = tokio::spawn(Receiver::new(exchange(&peer, transfer_cfg(3)).await, writer).start());

        assert_eq!(
            peer.recv().await,
            Packet::Error(ErrorPacket::new(ErrorCode::FileAlreadyExists, "exists.bin exists"))
        );
        assert!(matches!(session.await.unwrap(), Err(Error::Handler(_))));
    }

    #[tokio::test]
    async fn handler_failure_mid_upload_notifies_peer() {
        let mut peer = Peer::new().await;
        let (writer, mut reader) = bridge::pipe();
        let handler = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            reader.read_full(&mut buf).await.unwrap();
            reader.close_with_error(ErrorCode::DiskFull, "disk full");
        });
        let session = tokio::spawn(Receiver::new(exchange(&peer, transfer_cfg(3)).await, writer).start());

        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(0)));
        peer.send(data(1, &[0u8; 512])).await;
        assert_eq!(peer.recv().await, Packet::Ack(Ack::new(1)));
        handler.await.unwrap();
        peer.send(data(2, &[0u8; 512])).await;
        assert_eq!(
            peer.recv().await,
            Packet::Error(ErrorPacket::new(ErrorCode::DiskFull, "disk full"))
        );
        assert!(matches!(session.await.unwrap(), Err(Error::Handler(_))));
    }
}
