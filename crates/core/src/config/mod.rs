//! 配置管理
//!
//! 配置按以下顺序叠加：内置默认值、TOML配置文件、`COURIER_` 前缀的环境变量。

pub mod models;

pub use models::*;
