//! Probe module: one-shot HTTP availability checks.

mod http;

pub use http::*;

use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("请求超时或被取消")]
    Timeout,
    #[error("网络错误: {0}")]
    Network(String),
}
