//! TIF (Transaction Information Flags) 构建器
//!
//! 每个应答都携带一个 TIF 位掩码，描述本次请求的处理结果。

use std::fmt;
use strum::{EnumIter, IntoEnumIterator};

/// TIF 标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum TifFlag {
    /// 当前 idk 已注册
    IdMatch,
    /// pidk 已注册（已执行密钥轮换）
    PreviousIdMatch,
    /// 请求方 IP 与 Nut 签发时的 IP 一致
    IpsMatched,
    /// 该身份的 SQRL 登录已被禁用
    SqrlDisabled,
    FunctionNotSupported,
    TransientError,
    CommandFailed,
    ClientFailure,
    BadIdAssociation,
}

impl TifFlag {
    pub const fn bits(self) -> u32 {
        match self {
            TifFlag::IdMatch => 0x01,
            TifFlag::PreviousIdMatch => 0x02,
            TifFlag::IpsMatched => 0x04,
            TifFlag::SqrlDisabled => 0x08,
            TifFlag::FunctionNotSupported => 0x10,
            TifFlag::TransientError => 0x20,
            TifFlag::CommandFailed => 0x40,
            TifFlag::ClientFailure => 0x80,
            TifFlag::BadIdAssociation => 0x100,
        }
    }
}

/// 最终的 TIF 值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tif(u32);

impl Tif {
    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, flag: TifFlag) -> bool {
        self.0 & flag.bits() != 0
    }

    /// 已置位的标志列表
    pub fn flags(&self) -> Vec<TifFlag> {
        TifFlag::iter().filter(|f| self.contains(*f)).collect()
    }
}

impl fmt::Display for Tif {
    /// 大写十六进制，无前导零
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// TIF 累加器，标志只增不减
#[derive(Debug, Clone)]
pub struct TifBuilder {
    bits: u32,
}

impl TifBuilder {
    /// 创建构建器，IP 匹配位在构造时确定
    pub fn new(ips_matched: bool) -> Self {
        let bits = if ips_matched {
            TifFlag::IpsMatched.bits()
        } else {
            0
        };
        Self { bits }
    }

    pub fn add_flag(&mut self, flag: TifFlag) -> &mut Self {
        self.bits |= flag.bits();
        self
    }

    /// 合并原始位（来自错误类型的失败位）
    pub fn add_bits(&mut self, bits: u32) -> &mut Self {
        self.bits |= bits;
        self
    }

    pub fn has(&self, flag: TifFlag) -> bool {
        self.bits & flag.bits() != 0
    }

    pub fn create_response(&self) -> Tif {
        Tif(self.bits)
    }
}
