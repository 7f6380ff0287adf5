//! SQRL 身份相关类型

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// 需要持久化的客户端数据键
pub const PERSISTED_KEYS: [&str; 2] = ["suk", "vuk"];

/// 服务器解锁密钥
pub const SUK: &str = "suk";
/// 校验解锁密钥
pub const VUK: &str = "vuk";

/// 身份标志
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityFlag {
    /// 是否允许使用 SQRL 登录
    SqrlAuthEnabled,
    /// 仅允许 SQRL 登录（禁用其他登录方式）
    SqrlOnly,
    /// 禁止通过其他渠道修改身份关联
    Hardlock,
}
