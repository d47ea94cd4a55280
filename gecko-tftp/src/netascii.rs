//! netascii 模式下的换行转换
//! 线上的换行是 CR LF，单独的 CR 写作 CR NUL

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = b'\0';

/// 本地内容转为 netascii
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 16);
    for &b in input {
        match b {
            LF => out.extend_from_slice(&[CR, LF]),
            CR => out.extend_from_slice(&[CR, NUL]),
            b => out.push(b),
        }
    }
    out
}

/// netascii 转回本地内容
///
/// 数据按块到达，CR 可能是上一块的最后一个字节，需要跨块保存。
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if self.pending_cr {
                self.pending_cr = false;
                match b {
                    LF => out.push(LF),
                    NUL => out.push(CR),
                    CR => {
                        out.push(CR);
                        self.pending_cr = true;
                    }
                    b => out.extend_from_slice(&[CR, b]),
                }
            } else if b == CR {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
    }

    /// 输入结束，末尾落单的 CR 原样保留
    pub fn finish(self, out: &mut Vec<u8>) {
        if self.pending_cr {
            out.push(CR);
        }
    }
}
