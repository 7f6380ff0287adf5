//! HTTP 服务
//!
//! - [`http`]：SQRL 路由与服务器启动
//! - [`cleanup`]：过期数据的后台清理
//! - [`trace`]：请求级 tracing span

pub mod cleanup;
pub mod http;
pub mod trace;

pub use cleanup::{run_cleanup_once, spawn_cleanup_task};
pub use http::{ApiError, SqrlHttpState, create_router, serve};
