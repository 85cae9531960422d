/// 数据模型模块
///
/// 包含枚举类型与核心数据结构

pub mod enums;
pub mod structs;

pub use enums::*;
pub use structs::*;
