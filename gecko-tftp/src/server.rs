use std::{future::Future, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use log::{debug, error, info};
use tokio::{net::UdpSocket, select, sync::oneshot, task::JoinHandle};

use crate::{
    bridge,
    config::{self, Config},
    error::Error,
    network::{
        packet::{Packet, Request},
        Connection,
    },
    protocol::{Exchange, Receiver, Sender},
    report_dropped, Handler, Hook, HookNoop, Operation, TransferError, TransferInfo,
};

/// 众所周知端口上单个请求数据报的最大长度
const MAX_REQUEST_SIZE: usize = 65_535;

/// 代表一个 tftp 服务端
pub struct Server {
    cfg: Config,
    handler: Arc<dyn Handler>,
    hook: Arc<dyn Hook>,
}

impl Server {
    pub fn new<H: Handler>(cfg: Config, handler: H) -> Self {
        Self {
            cfg,
            handler: Arc::new(handler),
            hook: Arc::new(HookNoop),
        }
    }

    pub fn with_hook<K: Hook>(mut self, hook: K) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// 绑定监听地址，在后台任务中接收请求，立即返回
    pub async fn listen(&self) -> Result<(ListenHandle, SocketAddr), Error> {
        let dispatcher = self.bind().await?;
        Ok(Self::spawn(dispatcher))
    }

    /// 在已经绑定好的 socket 上接收请求，忽略配置中的监听地址
    pub fn listen_on(&self, socket: UdpSocket) -> Result<(ListenHandle, SocketAddr), Error> {
        let dispatcher = self.dispatcher(socket)?;
        Ok(Self::spawn(dispatcher))
    }

    fn spawn(dispatcher: Dispatcher) -> (ListenHandle, SocketAddr) {
        let local_addr = dispatcher.local_addr;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(dispatcher.run(shutdown_rx));
        let handle = ListenHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            task,
        };
        (handle, local_addr)
    }

    /// 绑定监听地址，在当前任务中接收请求
    /// 只有监听端口不可用时才会返回
    pub async fn serve(&self) -> Result<(), Error> {
        let dispatcher = self.bind().await?;
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        dispatcher.run(shutdown_rx).await
    }

    async fn bind(&self) -> Result<Dispatcher, Error> {
        self.cfg.transfer.validate()?;
        let socket = UdpSocket::bind(self.cfg.server.bind_addr)
            .await
            .map_err(Error::Bind)?;
        self.dispatcher(socket)
    }

    fn dispatcher(&self, socket: UdpSocket) -> Result<Dispatcher, Error> {
        self.cfg.transfer.validate()?;
        let local_addr = socket.local_addr()?;
        info!("tftp server listening on {}", local_addr);

        Ok(Dispatcher {
            socket,
            local_addr,
            cfg: self.cfg.transfer.clone(),
            handler: self.handler.clone(),
            hook: self.hook.clone(),
        })
    }
}

/// 后台监听任务的句柄
///
/// 直接丢弃句柄不会停止监听。
pub struct ListenHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), Error>>,
}

impl ListenHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止接收新请求并释放监听端口，进行中的传输不受影响
    pub async fn close(mut self) -> Result<(), Error> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await?
    }

    /// 等待监听任务结束，返回导致其退出的错误
    pub async fn wait(self) -> Result<(), Error> {
        self.task.await?
    }
}

/// 众所周知端口上的请求分发
/// 每个请求分配独立的端口和 bridge，启动 handler 与传输会话两个任务，自身从不等待传输
struct Dispatcher {
    socket: UdpSocket,
    local_addr: SocketAddr,
    cfg: config::Transfer,
    handler: Arc<dyn Handler>,
    hook: Arc<dyn Hook>,
}

impl Dispatcher {
    async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<(), Error> {
        let mut buf = vec![0u8; MAX_REQUEST_SIZE];
        // 句柄被丢弃后不再关心关闭信号
        let mut detached = false;

        loop {
            let (n, peer) = select! {
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok(recv) => recv,
                    Err(e) => {
                        error!("failed to read from listener {}: {}", self.local_addr, e);
                        return Err(Error::Listener(e));
                    }
                },
                closed = &mut shutdown, if !detached => match closed {
                    Ok(()) => {
                        info!("tftp server on {} closed", self.local_addr);
                        return Ok(());
                    }
                    Err(_) => {
                        detached = true;
                        continue;
                    }
                },
            };

            self.dispatch(Bytes::copy_from_slice(&buf[..n]), peer).await;
        }
    }

    async fn dispatch(&self, datagram: Bytes, peer: SocketAddr) {
        // 不回应无法识别的数据报，避免被用作反射放大
        let (operation, request) = match Packet::read(datagram) {
            Ok(Packet::ReadRequest(request)) => (Operation::Read, request),
            Ok(Packet::WriteRequest(request)) => (Operation::Write, request),
            Ok(packet) => {
                debug!("drop {:?} packet from {} on listener", packet.opcode(), peer);
                return;
            }
            Err(e) => {
                debug!("drop malformed packet from {}: {}", peer, e);
                report_dropped(&self.hook, peer, e);
                return;
            }
        };
        info!(
            "got {:?} request from {} (filename={}, mode={})",
            operation, peer, request.filename, request.mode
        );

        // 每个传输独占一个临时端口
        let conn = match Connection::bind(self.local_addr.ip(), peer, self.cfg.block_size).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("could not start transfer for {}: {}", peer, e);
                return;
            }
        };
        let local = match conn.local_addr() {
            Ok(local) => local,
            Err(e) => {
                error!("could not start transfer for {}: {}", peer, e);
                return;
            }
        };

        let Request { filename, mode } = request;
        let transfer = TransferInfo {
            peer,
            local,
            filename: filename.clone(),
            mode,
            operation,
        };

        let (writer, reader) = bridge::pipe();
        let exchange = Exchange::new(conn, self.cfg.clone(), self.hook.clone());
        let handler = self.handler.clone();
        match operation {
            Operation::Read => {
                tokio::spawn(async move { handler.handle_read(filename, mode, writer).await });
                self.spawn_session(transfer, Sender::new(exchange, reader).start());
            }
            Operation::Write => {
                tokio::spawn(async move { handler.handle_write(filename, mode, reader).await });
                self.spawn_session(transfer, Receiver::new(exchange, writer).start());
            }
        }
    }

    /// 会话独立运行，hook 在另一个任务中回调，慢的 hook 不会拖住传输和请求分发
    fn spawn_session<F>(&self, transfer: TransferInfo, session: F)
    where
        F: Future<Output = Result<u64, TransferError>> + Send + 'static,
    {
        let hook = self.hook.clone();
        let session = tokio::spawn(session);
        tokio::spawn(async move {
            hook.accepted(&transfer).await;
            let result = match session.await {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        "{:?} {} with {} aborted: {}",
                        transfer.operation, transfer.filename, transfer.peer, e
                    );
                    return;
                }
            };
            match result {
                Ok(bytes) => {
                    info!(
                        "{:?} {} with {} completed ({} bytes)",
                        transfer.operation, transfer.filename, transfer.peer, bytes
                    );
                    hook.completed(&transfer, bytes).await;
                }
                Err(e) => {
                    error!(
                        "{:?} {} with {} failed: {}",
                        transfer.operation, transfer.filename, transfer.peer, e
                    );
                    hook.failed(&transfer, &e).await;
                }
            }
        });
    }
}
