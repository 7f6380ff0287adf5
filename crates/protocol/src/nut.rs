//! Nut 令牌编解码
//!
//! Nut 是嵌入在 SQRL URL / 二维码中的一次性挑战。明文为固定 16 字节（大端）：
//!
//! | 偏移 | 长度 | 内容 |
//! |------|------|------|
//! | 0    | 4    | 客户端 IP 哈希 |
//! | 4    | 4    | 进程内单调计数器 |
//! | 8    | 4    | 签发时间（Unix 秒） |
//! | 12   | 4    | 随机数 |
//!
//! 明文经 AES-128 单块加密后做无填充 base64url 编码，固定 22 个字符。

use crate::crypto::{BLOCK_SIZE, NutCipher};
use crate::encoding::{base64url_decode, base64url_encode};
use crate::error::{SqrlError, SqrlResult};
use crate::unix_timestamp;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

/// 编码后的 Nut 长度
pub const ENCODED_NUT_LEN: usize = 22;

/// 计算客户端 IP 哈希
///
/// IPv4（包括 IPv4 映射的 IPv6 地址）直接取 32 位值，其他 IPv6 取 SHA-256 前 4 字节
pub fn ip_hash(ip: &IpAddr) -> u32 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => u32::from(v4),
            None => {
                let digest = Sha256::digest(v6.octets());
                u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
            }
        },
    }
}

/// 解密后的 Nut 内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NutToken {
    pub client_ip_hash: u32,
    pub counter: u32,
    /// 签发时间，秒
    pub issued_at: u64,
    pub random: u32,
}

impl NutToken {
    pub fn new(client_ip: &IpAddr, counter: u32, issued_at: u64, random: u32) -> Self {
        Self {
            client_ip_hash: ip_hash(client_ip),
            counter,
            // 布局中只有 32 位时间戳
            issued_at: issued_at & u64::from(u32::MAX),
            random,
        }
    }

    fn to_block(self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&self.client_ip_hash.to_be_bytes());
        block[4..8].copy_from_slice(&self.counter.to_be_bytes());
        block[8..12].copy_from_slice(&(self.issued_at as u32).to_be_bytes());
        block[12..16].copy_from_slice(&self.random.to_be_bytes());
        block
    }

    fn from_block(block: &[u8; BLOCK_SIZE]) -> Self {
        let word = |i: usize| u32::from_be_bytes([block[i], block[i + 1], block[i + 2], block[i + 3]]);
        Self {
            client_ip_hash: word(0),
            counter: word(4),
            issued_at: u64::from(word(8)),
            random: word(12),
        }
    }

    /// 加密并编码
    pub fn encode(&self, cipher: &NutCipher) -> String {
        base64url_encode(cipher.encrypt_block(&self.to_block()))
    }

    /// 解码并解密
    pub fn parse(encoded: &str, cipher: &NutCipher) -> SqrlResult<Self> {
        if encoded.len() != ENCODED_NUT_LEN {
            return Err(SqrlError::invalid_request(format!(
                "Invalid nut length: {}",
                encoded.len()
            )));
        }
        let bytes = base64url_decode(encoded)
            .map_err(|_| SqrlError::invalid_request("Nut is not base64url"))?;
        let block: [u8; BLOCK_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SqrlError::invalid_request("Nut does not decode to a single block"))?;

        Ok(Self::from_block(&cipher.decrypt_block(&block)))
    }

    /// 是否已超过有效期
    ///
    /// 签发时间在未来的 Nut 同样视为无效
    pub fn is_expired(&self, now: u64, validity_secs: u64) -> bool {
        self.issued_at > now || now - self.issued_at > validity_secs
    }

    /// 请求方 IP 是否与签发时一致
    pub fn ip_matches(&self, client_ip: &IpAddr) -> bool {
        self.client_ip_hash == ip_hash(client_ip)
    }
}

/// Nut 签发上下文
///
/// 持有 AES 密钥和进程内计数器；多个独立实例（例如测试中）互不干扰
#[derive(Debug)]
pub struct NutContext {
    cipher: NutCipher,
    counter: AtomicU32,
}

impl NutContext {
    pub fn new(cipher: NutCipher) -> Self {
        Self {
            cipher,
            counter: AtomicU32::new(0),
        }
    }

    pub fn cipher(&self) -> &NutCipher {
        &self.cipher
    }

    /// 获取下一个计数值
    ///
    /// `fetch_add` 保证并发签发不会得到相同的值
    fn next_counter(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// 为指定客户端签发新的 Nut
    pub fn mint(&self, client_ip: &IpAddr) -> (NutToken, String) {
        self.mint_at(client_ip, unix_timestamp())
    }

    pub fn mint_at(&self, client_ip: &IpAddr, issued_at: u64) -> (NutToken, String) {
        let token = NutToken::new(client_ip, self.next_counter(), issued_at, OsRng.next_u32());
        let encoded = token.encode(&self.cipher);
        (token, encoded)
    }

    pub fn parse(&self, encoded: &str) -> SqrlResult<NutToken> {
        NutToken::parse(encoded, &self.cipher)
    }
}
