use bytes::Bytes;
use log::debug;

use crate::{
    bridge::BridgeReader,
    network::packet::{Data, Packet},
};

use super::{Error, Exchange};

/// 处理读请求（RRQ）：从 bridge 读取 handler 提供的内容，逐块发给对端
pub(crate) struct Sender {
    exchange: Exchange,
    reader: BridgeReader,
    /// 当前等待确认的块编号
    block: u16,
    /// 已发出的字节数
    sent: u64,
    buf: Vec<u8>,
}

impl Sender {
    pub(crate) fn new(exchange: Exchange, reader: BridgeReader) -> Self {
        Self::starting_at(exchange, reader, 1)
    }

    pub(crate) fn starting_at(exchange: Exchange, reader: BridgeReader, block: u16) -> Self {
        let buf = vec![0; exchange.block_size()];
        Self {
            exchange,
            reader,
            block,
            sent: 0,
            buf,
        }
    }

    /// 运行到传输结束，返回发送的字节数
    /// 对端一直没有回应时无法通知对端，只关闭 bridge
    pub(crate) async fn start(mut self) -> Result<u64, Error> {
        match self.run().await {
            Ok(()) => {
                self.reader.close();
                Ok(self.sent)
            }
            Err(e) => {
                let packet = e.to_packet();
                if !matches!(
                    e,
                    Error::Peer { .. } | Error::Connection(_) | Error::RetryExhausted(_)
                ) {
                    self.exchange.send_error(packet.clone()).await;
                }
                self.reader.close_with(packet.into());
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<(), Error> {
        let mut last = self.send_block().await?;

        loop {
            match self.exchange.recv().await? {
                Packet::Ack(ack) if ack.block == self.block => {
                    if last {
                        return Ok(());
                    }
                    self.block = self.block.wrapping_add(1);
                    last = self.send_block().await?;
                }
                Packet::Ack(ack) => debug!("ignore stale ack {}", ack.block),
                Packet::Error(error) => return Err(error.into()),
                packet => debug!("ignore unexpected {:?} packet", packet.opcode()),
            }
        }
    }

    /// 从 bridge 读满一块并发送，返回是否为最后一块
    async fn send_block(&mut self) -> Result<bool, Error> {
        let n = self.exchange.bridge(self.reader.read_full(&mut self.buf)).await?;
        self.sent += n as u64;

        let payload = Bytes::copy_from_slice(&self.buf[..n]);
        self.exchange
            .send(Packet::Data(Data::new(self.block, payload)))
            .await?;

        Ok(n < self.buf.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinHandle;

    use super::*;
    use crate::{
        bridge::{self, BridgeWriter},
        network::packet::{Ack, ErrorCode, ErrorPacket},
        protocol::tests::{exchange, impatient_cfg, transfer_cfg, Peer},
    };

    fn supply(mut writer: BridgeWriter, content: Vec<u8>) -> JoinHandle<Result<(), bridge::Error>> {
        tokio::spawn(async move {
            writer.write(content).await?;
            writer.close();
            Ok(())
        })
    }

    fn data(block: u16, payload: &[u8]) -> Packet {
        Packet::Data(Data::new(block, Bytes::copy_from_slice(payload)))
    }

    #[tokio::test]
    async fn empty_download_is_one_exchange() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = supply(writer, Vec::new());
        let session = tokio::spawn(Sender::new(exchange(&peer, transfer_cfg(3)).await, reader).start());

        assert_eq!(peer.recv().await, data(1, b""));
        peer.send(Packet::Ack(Ack::new(1))).await;

        assert_eq!(session.await.unwrap().unwrap(), 0);
        handler.await.unwrap().unwrap();
        assert!(peer.try_recv(Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn download_works() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let content: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let handler = supply(writer, content.clone());
        let session = tokio::spawn(Sender::new(exchange(&peer, transfer_cfg(3)).await, reader).start());

        assert_eq!(peer.recv().await, data(1, &content[..512]));
        // 旧的确认被忽略
        peer.send(Packet::Ack(Ack::new(0))).await;
        peer.send(Packet::Ack(Ack::new(1))).await;
        assert_eq!(peer.recv().await, data(2, &content[512..]));
        peer.send(Packet::Ack(Ack::new(2))).await;
        // 长度正好是块大小的整数倍，以空块结束
        assert_eq!(peer.recv().await, data(3, b""));
        peer.send(Packet::Ack(Ack::new(3))).await;

        assert_eq!(session.await.unwrap().unwrap(), 1024);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn block_number_wraps_around() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = supply(writer, vec![9u8; 600]);
        let exchange = exchange(&peer, transfer_cfg(3)).await;
        let session = tokio::spawn(Sender::starting_at(exchange, reader, 65535).start());

        assert_eq!(peer.recv().await, data(65535, &[9u8; 512]));
        peer.send(Packet::Ack(Ack::new(65535))).await;
        assert_eq!(peer.recv().await, data(0, &[9u8; 88]));
        peer.send(Packet::Ack(Ack::new(0))).await;

        assert_eq!(session.await.unwrap().unwrap(), 600);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_failure_sends_single_error() {
        let mut peer = Peer::new().await;
        let (mut writer, reader) = bridge::pipe();
        let handler = tokio::spawn(async move {
            writer.write(vec![1u8; 512]).await.unwrap();
            writer.close_with_error(ErrorCode::AccessViolation, "read failed");
        });
        let session = tokio::spawn(Sender::new(exchange(&peer, transfer_cfg(3)).await, reader).start());

        assert_eq!(peer.recv().await, data(1, &[1u8; 512]));
        handler.await.unwrap();
        peer.send(Packet::Ack(Ack::new(1))).await;
        assert_eq!(
            peer.recv().await,
            Packet::Error(ErrorPacket::new(ErrorCode::AccessViolation, "read failed"))
        );

        assert!(matches!(session.await.unwrap(), Err(Error::Handler(_))));
        assert!(peer.try_recv(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn missing_file_fails_before_first_block() {
        let mut peer = Peer::new().await;
        let (mut writer, reader) = bridge::pipe();
        writer.close_with_error(ErrorCode::FileNotFound, "missing.bin");
        let session = tokio::spawn(Sender::new(exchange(&peer, transfer_cfg(3)).await, reader).start());

        assert_eq!(
            peer.recv().await,
            Packet::Error(ErrorPacket::new(ErrorCode::FileNotFound, "missing.bin"))
        );
        assert!(matches!(session.await.unwrap(), Err(Error::Handler(_))));
    }

    #[tokio::test]
    async fn timeout_retransmits_exactly_retries_times() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = supply(writer, b"hello".to_vec());
        let session = tokio::spawn(Sender::new(exchange(&peer, impatient_cfg(4)).await, reader).start());

        for _ in 0..5 {
            assert_eq!(peer.recv().await, data(1, b"hello"));
        }
        // 对端不可达，不再发送 ERROR
        assert!(peer.try_recv(Duration::from_millis(200)).await.is_none());

        assert!(matches!(session.await.unwrap(), Err(Error::RetryExhausted(4))));
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_error_closes_bridge() {
        let mut peer = Peer::new().await;
        let (writer, reader) = bridge::pipe();
        let handler = supply(writer, vec![3u8; 2048]);
        let session = tokio::spawn(Sender::new(exchange(&peer, transfer_cfg(3)).await, reader).start());

        assert_eq!(peer.recv().await, data(1, &[3u8; 512]));
        peer.send(Packet::Error(ErrorPacket::new(ErrorCode::NotDefined, "cancelled")))
            .await;

        assert!(matches!(session.await.unwrap(), Err(Error::Peer { .. })));
        assert_eq!(
            handler.await.unwrap(),
            Err(bridge::Error::new(ErrorCode::NotDefined, "cancelled"))
        );
    }
}
