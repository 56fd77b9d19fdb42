//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod applier;
pub mod builder;
pub mod deploy;
pub mod manifest;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;
