//! 请求提取器
//!
//! 会话令牌与客户端信息

pub mod session;

pub use session::{ClientInfo, SessionCookie};
