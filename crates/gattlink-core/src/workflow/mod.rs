//! 工作流模块
//!
//! 提供高层 API 封装 "连接 + 发现" 的完整流程

pub mod ready;

pub use ready::{ReadyOptions, ReadyWorkflow, connect_and_discover};
