use std::{net::SocketAddr, time::Duration};

use tokio::{fs, io::AsyncReadExt};

use crate::{error::Error, network::packet::DEFAULT_BLOCK_SIZE};

/// 协议默认端口
pub const DEFAULT_PORT: u16 = 69;

/// 块大小上限，DATA 报文不能超过一个 udp 数据报（RFC 2348）
pub const MAX_BLOCK_SIZE: usize = 65_464;

/// 单次等待的超时上限
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// 重传次数上限
pub const MAX_RETRIES: u32 = 100;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub transfer: Transfer,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Server {
    /// 众所周知端口的监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// 每个传输会话的参数
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Transfer {
    /// 块大小，最后一个数据块短于它表示传输结束
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// 等待对端回复的超时时间
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 超时重传次数
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Transfer {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// 单次 bridge 读写的最长等待时间，超过视为 handler 卡死
    pub fn handler_timeout(&self) -> Duration {
        self.timeout().saturating_mul(self.retries.saturating_add(1))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig("block_size must be in 1..=65464"));
        }
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(Error::InvalidConfig("timeout_ms must be in 1..=600000"));
        }
        if self.retries > MAX_RETRIES {
            return Err(Error::InvalidConfig("retries must not exceed 100"));
        }
        Ok(())
    }
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_retries() -> u32 {
    5
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let mut file = fs::File::open(path).await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;

        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let cfg = toml::from_str::<Config>(s)?;
        cfg.transfer.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parsing_works() {
        let cfg = Config::from_toml(
            r#"
            [server]
            bind_addr = "127.0.0.1:6969"

            [transfer]
            timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server.bind_addr, "127.0.0.1:6969".parse().unwrap());
        assert_eq!(cfg.transfer.block_size, 512);
        assert_eq!(cfg.transfer.timeout(), Duration::from_millis(500));
        assert_eq!(cfg.transfer.retries, 5);
        assert_eq!(cfg.transfer.handler_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.server.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(cfg.transfer.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for toml in [
            "[transfer]\nblock_size = 0\n",
            "[transfer]\nblock_size = 65465\n",
            "[transfer]\ntimeout_ms = 0\n",
            "[transfer]\ntimeout_ms = 600001\n",
            "[transfer]\nretries = 4294967295\n",
        ] {
            let result = Config::from_toml(toml);
            assert!(matches!(result, Err(Error::InvalidConfig(_))), "{}", toml);
        }

        let cfg = Config::from_toml("[transfer]\nblock_size = 65464\nretries = 100\n").unwrap();
        assert_eq!(cfg.transfer.block_size, MAX_BLOCK_SIZE);
    }

    #[test]
    fn handler_timeout_saturates() {
        let transfer = Transfer {
            block_size: 512,
            timeout_ms: u64::MAX,
            retries: u32::MAX,
        };
        assert_eq!(transfer.handler_timeout(), Duration::MAX);
    }
}
