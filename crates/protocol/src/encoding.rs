//! base64url 编解码与入站参数清洗

use crate::error::{SqrlError, SqrlResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// 单个参数的最大长度
pub const MAX_TOKEN_SIZE: usize = 30_000;

/// 无填充 base64url 编码
pub fn base64url_encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// 无填充 base64url 解码
///
/// 兼容客户端误带的 `=` 填充
pub fn base64url_decode(encoded: &str) -> SqrlResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| SqrlError::invalid_data(format!("Invalid base64url: {e}")))
}

/// 解码为 UTF-8 文本
pub fn base64url_decode_string(encoded: &str) -> SqrlResult<String> {
    let bytes = base64url_decode(encoded)?;
    String::from_utf8(bytes).map_err(|e| SqrlError::invalid_data(format!("Invalid UTF-8: {e}")))
}

/// 是否为 base64url 字符集（允许尾部填充）
pub fn is_base64url(value: &str) -> bool {
    value
        .trim_end_matches('=')
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// 校验参数长度与字符集
///
/// 任何超长或包含非 base64url 字符的参数都会被拒绝，防止注入内容被回显到 HTML 或日志中
pub fn validate_token(name: &str, value: &str) -> SqrlResult<()> {
    if value.len() > MAX_TOKEN_SIZE {
        return Err(SqrlError::invalid_data(format!(
            "Parameter {name} exceeds {MAX_TOKEN_SIZE} characters"
        )));
    }
    if !is_base64url(value) {
        // 不回显参数内容
        return Err(SqrlError::invalid_data(format!(
            "Parameter {name} is not base64url"
        )));
    }
    Ok(())
}
