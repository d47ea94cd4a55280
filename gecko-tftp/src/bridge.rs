//! 传输会话与 handler 之间的同步字节通道
//!
//! 通道没有缓冲区：写入方一直阻塞到读取方取走全部数据为止，
//! 所以 handler 生产/消费数据的速度由网络确认的节奏决定。
//! 任意一端都可以正常关闭或带错误关闭，另一端的下一次操作立即返回。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes};
use tokio::sync::Notify;

use crate::network::packet::{ErrorCode, ErrorPacket};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Bridge closed")]
    Closed,
    #[error("Handler error {code}: {message}")]
    Handler { code: ErrorCode, message: String },
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Handler {
            code,
            message: message.into(),
        }
    }

    /// 发送给对端的 ERROR 报文
    pub(crate) fn to_packet(&self) -> ErrorPacket {
        match self {
            Error::Closed => ErrorPacket::new(ErrorCode::NotDefined, "transfer aborted"),
            Error::Handler { code, message } => ErrorPacket::new(*code, message.clone()),
        }
    }
}

impl From<ErrorPacket> for Error {
    fn from(packet: ErrorPacket) -> Self {
        Error::new(packet.code, packet.message)
    }
}

/// 一端的状态
#[derive(Debug, Default)]
enum End {
    #[default]
    Open,
    Closed,
    Failed(Error),
}

#[derive(Debug, Default)]
struct State {
    /// 写入方提供、读取方还没取完的数据
    chunk: Option<Bytes>,
    writer: End,
    reader: End,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    /// 唤醒读取方
    to_reader: Notify,
    /// 唤醒写入方
    to_writer: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 创建一对相连的写入端与读取端
pub fn pipe() -> (BridgeWriter, BridgeReader) {
    let shared = Arc::new(Shared::default());
    (
        BridgeWriter {
            shared: shared.clone(),
        },
        BridgeReader { shared },
    )
}

/// 通道写入端
///
/// 未关闭就被丢弃时，读取端会收到 [`Error::Closed`]，
/// 不会被当作正常的数据结束。
#[derive(Debug)]
pub struct BridgeWriter {
    shared: Arc<Shared>,
}

impl BridgeWriter {
    /// 写入数据，直到读取端全部取走后才返回
    /// 长度为 0 的写入同样要等读取端来取，可以用来探测读取端是否已经出错
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        {
            let mut state = self.shared.lock();
            if !matches!(state.writer, End::Open) {
                return Err(Error::Closed);
            }
            reader_status(&state)?;
            state.chunk = Some(data.into());
        }
        self.shared.to_reader.notify_one();

        loop {
            {
                let mut state = self.shared.lock();
                if state.chunk.is_none() {
                    return Ok(());
                }
                if let Err(e) = reader_status(&state) {
                    state.chunk = None;
                    return Err(e);
                }
            }
            self.shared.to_writer.notified().await;
        }
    }

    /// 正常结束，读取端读完后得到 EOF
    pub fn close(&mut self) {
        self.finish(End::Closed)
    }

    /// 带错误结束，读取端的下一次读取返回该错误
    pub fn close_with_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.close_with(Error::new(code, message))
    }

    pub fn close_with(&mut self, error: Error) {
        self.finish(End::Failed(error))
    }

    fn finish(&mut self, end: End) {
        {
            let mut state = self.shared.lock();
            if matches!(state.writer, End::Open) {
                state.writer = end;
            }
        }
        self.shared.to_reader.notify_one();
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        self.finish(End::Failed(Error::Closed))
    }
}

/// 通道读取端
#[derive(Debug)]
pub struct BridgeReader {
    shared: Arc<Shared>,
}

impl BridgeReader {
    /// 读取数据到 buf，返回 0 表示写入端已正常结束
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            {
                let mut state = self.shared.lock();
                if !matches!(state.reader, End::Open) {
                    return Err(Error::Closed);
                }

                if let Some(chunk) = state.chunk.as_mut() {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.advance(n);
                    let consumed = chunk.is_empty();
                    if consumed {
                        state.chunk = None;
                    }
                    drop(state);

                    if consumed {
                        self.shared.to_writer.notify_one();
                    }
                    // 空的探测写入不算数据结束，继续等
                    if n > 0 {
                        return Ok(n);
                    }
                    continue;
                }

                match &state.writer {
                    End::Open => {}
                    End::Closed => return Ok(0),
                    End::Failed(e) => return Err(e.clone()),
                }
            }
            self.shared.to_reader.notified().await;
        }
    }

    /// 尽量填满 buf，只有遇到数据结束时才会返回比 buf 短的长度
    pub async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    /// 读取全部数据直到写入端正常结束
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, Error> {
        let mut buf = [0u8; 4096];
        let mut total = 0;
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(total),
                n => {
                    out.extend_from_slice(&buf[..n]);
                    total += n;
                }
            }
        }
    }

    /// 不再读取，写入端的下一次写入返回 [`Error::Closed`]
    pub fn close(&mut self) {
        self.finish(End::Closed)
    }

    pub fn close_with_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.close_with(Error::new(code, message))
    }

    pub fn close_with(&mut self, error: Error) {
        self.finish(End::Failed(error))
    }

    fn finish(&mut self, end: End) {
        {
            let mut state = self.shared.lock();
            if matches!(state.reader, End::Open) {
                state.reader = end;
            }
        }
        self.shared.to_writer.notify_one();
    }
}

impl Drop for BridgeReader {
    fn drop(&mut self) {
        self.finish(End::Closed)
    }
}

fn reader_status(state: &State) -> Result<(), Error> {
    match &state.reader {
        End::Open => Ok(()),
        End::Closed => Err(Error::Closed),
        End::Failed(e) => Err(e.clone()),
    }
}
