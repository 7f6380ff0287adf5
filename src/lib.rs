//! # sqrl-server
//!
//! SQRL 协议认证服务器：登录页面 Nut 签发、客户端回调处理、浏览器状态轮询和 CPS 令牌兑换

pub mod metrics;
pub mod service;

// Re-export commonly used types
pub use service::{SqrlHttpState, create_router, serve};
pub use sqrl_common::SqrlServerConfig;
