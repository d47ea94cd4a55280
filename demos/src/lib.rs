use std::{
    io,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use gecko_tftp::{bridge, netascii, BridgeReader, BridgeWriter, Config, ErrorCode, Handler, Mode};
use log::{info, warn};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "GECKO_TFTP_";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] gecko_tftp::Error),
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),
}

/// 从环境变量读取的配置覆盖，例如 `GECKO_TFTP_BIND_ADDR=0.0.0.0:6969`
#[derive(Debug, Default, serde::Deserialize)]
pub struct Overrides {
    pub bind_addr: Option<SocketAddr>,
    pub root: Option<PathBuf>,
    pub read_only: Option<bool>,
    pub block_size: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
}

impl Overrides {
    pub fn from_env() -> Result<Self, Error> {
        Ok(envy::prefixed(ENV_PREFIX).from_env::<Overrides>()?)
    }

    pub fn apply(&self, cfg: &mut Config) {
        if let Some(addr) = self.bind_addr {
            cfg.server.bind_addr = addr;
        }
        if let Some(block_size) = self.block_size {
            cfg.transfer.block_size = block_size;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            cfg.transfer.timeout_ms = timeout_ms;
        }
        if let Some(retries) = self.retries {
            cfg.transfer.retries = retries;
        }
    }
}

/// 读取配置文件，没有指定时使用默认配置，再叠加环境变量
pub async fn load_config(path: Option<&str>) -> Result<(Config, Overrides), Error> {
    let mut cfg = match path {
        Some(path) => Config::from_path(path).await?,
        None => Config::default(),
    };
    let overrides = Overrides::from_env()?;
    apply_overrides(&mut cfg, &overrides)?;
    Ok((cfg, overrides))
}

/// 叠加覆盖项后重新校验
pub fn apply_overrides(cfg: &mut Config, overrides: &Overrides) -> Result<(), Error> {
    overrides.apply(cfg);
    cfg.transfer.validate()?;
    Ok(())
}

/// 以一个目录为根提供文件下载和上传
pub struct FsHandler {
    root: PathBuf,
    read_only: bool,
    chunk_size: usize,
}

impl FsHandler {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            read_only: false,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// 请求的文件名解析为根目录下的路径，不允许跳出根目录
    fn resolve(&self, filename: &str) -> Result<PathBuf, bridge::Error> {
        let mut path = self.root.clone();
        let mut depth = 0;
        for component in Path::new(filename).components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                // 客户端常以 / 开头表示根目录
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(bridge::Error::new(
                        ErrorCode::AccessViolation,
                        format!("{}: outside of root", filename),
                    ));
                }
            }
        }
        if depth == 0 {
            return Err(bridge::Error::new(
                ErrorCode::AccessViolation,
                format!("{}: not a file", filename),
            ));
        }
        Ok(path)
    }

    async fn send_file(
        &self,
        filename: &str,
        mode: Mode,
        writer: &mut BridgeWriter,
    ) -> Result<u64, bridge::Error> {
        let path = self.resolve(filename)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| io_error(filename, e))?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0;
        loop {
            let n = file.read(&mut buf).await.map_err(|e| io_error(filename, e))?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
            match mode {
                Mode::Octet => writer.write(buf[..n].to_vec()).await?,
                Mode::NetAscii => writer.write(netascii::encode(&buf[..n])).await?,
            }
        }
    }

    async fn receive_file(
        &self,
        mut file: fs::File,
        filename: &str,
        mode: Mode,
        reader: &mut BridgeReader,
    ) -> Result<u64, bridge::Error> {
        let mut decoder = netascii::Decoder::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut decoded = Vec::new();
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            let chunk = match mode {
                Mode::Octet => &buf[..n],
                Mode::NetAscii => {
                    decoded.clear();
                    decoder.decode(&buf[..n], &mut decoded);
                    &decoded[..]
                }
            };
            file.write_all(chunk).await.map_err(|e| io_error(filename, e))?;
        }

        decoded.clear();
        decoder.finish(&mut decoded);
        file.write_all(&decoded)
            .await
            .map_err(|e| io_error(filename, e))?;
        file.flush().await.map_err(|e| io_error(filename, e))?;
        Ok(total)
    }
}

#[async_trait]
impl Handler for FsHandler {
    async fn handle_read(&self, filename: String, mode: Mode, mut writer: BridgeWriter) {
        match self.send_file(&filename, mode, &mut writer).await {
            Ok(bytes) => {
                info!("served {} ({} bytes)", filename, bytes);
                writer.close();
            }
            Err(e) => {
                warn!("read {} failed: {}", filename, e);
                writer.close_with(e);
            }
        }
    }

    async fn handle_write(&self, filename: String, mode: Mode, mut reader: BridgeReader) {
        if self.read_only {
            reader.close_with_error(ErrorCode::AccessViolation, "server is read-only");
            return;
        }
        let path = match self.resolve(&filename) {
            Ok(path) => path,
            Err(e) => {
                warn!("write {} rejected: {}", filename, e);
                reader.close_with(e);
                return;
            }
        };
        let file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                let e = io_error(&filename, e);
                warn!("write {} rejected: {}", filename, e);
                reader.close_with(e);
                return;
            }
        };

        match self.receive_file(file, &filename, mode, &mut reader).await {
            Ok(bytes) => info!("stored {} ({} bytes)", filename, bytes),
            Err(e) => {
                warn!("write {} failed: {}", filename, e);
                // 不保留不完整的文件
                if let Err(e) = fs::remove_file(&path).await {
                    warn!("remove partial file {} failed: {}", path.display(), e);
                }
                reader.close_with(e);
            }
        }
    }
}

fn io_error(filename: &str, e: io::Error) -> bridge::Error {
    let code = match e.kind() {
        io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
        _ => ErrorCode::NotDefined,
    };
    bridge::Error::new(code, format!("{}: {}", filename, e))
}
