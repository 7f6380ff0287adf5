//! SQRL 密码学工具
//!
//! - Nut 令牌使用 AES-128 单块加密（16 字节明文 -> 16 字节密文）
//! - 客户端签名（ids / pids / urs）使用 Ed25519 校验

use crate::encoding::base64url_decode;
use crate::error::{SqrlError, SqrlResult};
use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use base64::prelude::*;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info};

/// AES 分组长度，也是 Nut 明文长度
pub const BLOCK_SIZE: usize = 16;

/// Nut 密钥来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NutKeySource {
    /// 直接从配置文件读取
    Direct(String),
    /// 从环境变量读取
    Environment(String),
    /// 从文件路径读取
    File(String),
}

/// Nut 加解密器
///
/// 密钥只保存在服务端进程内，任何持有 Nut 的一方都无法读取其内容
#[derive(Clone)]
pub struct NutCipher {
    cipher: Aes128,
}

impl std::fmt::Debug for NutCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NutCipher").finish_non_exhaustive()
    }
}

impl NutCipher {
    /// 从密钥来源创建
    pub fn from_key_source(source: &NutKeySource) -> SqrlResult<Self> {
        let key = match source {
            NutKeySource::Direct(key) => {
                debug!("Loading nut key from direct configuration");
                key.clone()
            }
            NutKeySource::Environment(env_var) => {
                debug!("Loading nut key from environment variable: {}", env_var);
                std::env::var(env_var).map_err(|e| {
                    SqrlError::illegal_state(format!(
                        "Failed to read nut key from environment variable {env_var}: {e}"
                    ))
                })?
            }
            NutKeySource::File(path) => {
                debug!("Loading nut key from file: {}", path);
                std::fs::read_to_string(path).map_err(|e| {
                    SqrlError::illegal_state(format!("Failed to read nut key from file {path}: {e}"))
                })?
            }
        };

        Self::from_key(&key)
    }

    /// 从密钥字符串创建
    ///
    /// 密钥可以是:
    /// - 32 字符的十六进制字符串 (16 字节)
    /// - 24 字符的 Base64 字符串 (16 字节)
    pub fn from_key(key: &str) -> SqrlResult<Self> {
        let key = key.trim();

        let key_bytes = if key.len() == 32 {
            hex::decode(key)
                .map_err(|e| SqrlError::illegal_state(format!("Invalid nut key hex format: {e}")))?
        } else if key.len() == 24 || key.len() == 22 {
            BASE64_STANDARD_NO_PAD
                .decode(key.trim_end_matches('='))
                .map_err(|e| {
                    SqrlError::illegal_state(format!("Invalid nut key base64 format: {e}"))
                })?
        } else {
            return Err(SqrlError::illegal_state(format!(
                "Invalid nut key length: expected 32 hex chars or 24 base64 chars, got {}",
                key.len()
            )));
        };

        Self::from_bytes(&key_bytes)
    }

    /// 从原始密钥字节创建
    pub fn from_bytes(key_bytes: &[u8]) -> SqrlResult<Self> {
        if key_bytes.len() != BLOCK_SIZE {
            return Err(SqrlError::illegal_state(format!(
                "Invalid nut key size: expected {BLOCK_SIZE} bytes, got {}",
                key_bytes.len()
            )));
        }

        let cipher = Aes128::new_from_slice(key_bytes)
            .map_err(|e| SqrlError::illegal_state(format!("Failed to create cipher: {e}")))?;

        info!("Nut key loaded successfully");
        Ok(Self { cipher })
    }

    /// 加密一个分组
    pub fn encrypt_block(&self, plain: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = GenericArray::from(*plain);
        self.cipher.encrypt_block(&mut block);
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(block.as_slice());
        out
    }

    /// 解密一个分组
    pub fn decrypt_block(&self, encrypted: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = GenericArray::from(*encrypted);
        self.cipher.decrypt_block(&mut block);
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(block.as_slice());
        out
    }

    /// 生成新的 Nut 密钥（用于初始化）
    ///
    /// 返回十六进制格式的 16 字节随机密钥
    pub fn generate_key() -> String {
        let mut key = [0u8; BLOCK_SIZE];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }
}

/// 使用 base64url 编码的 Ed25519 公钥校验 base64url 编码的签名
///
/// 公钥或签名格式错误与签名不匹配一样返回 `InvalidRequest`
pub fn verify_signature(public_key: &str, message: &[u8], signature: &str) -> SqrlResult<()> {
    let key_bytes = base64url_decode(public_key)
        .map_err(|_| SqrlError::invalid_request("Public key is not base64url"))?;
    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SqrlError::invalid_request("Public key must be 32 bytes"))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| SqrlError::invalid_request(format!("Invalid public key: {e}")))?;

    let sig_bytes = base64url_decode(signature)
        .map_err(|_| SqrlError::invalid_request("Signature is not base64url"))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| SqrlError::invalid_request(format!("Invalid signature encoding: {e}")))?;

    verifying_key
        .verify(message, &signature)
        .map_err(|_| SqrlError::invalid_request("Signature verification failed"))
}
