//! 事件引擎过程宏（eventide-macros）
//!
use proc_macro::TokenStream;

mod event;
mod utils;

/// 事件宏
/// - 合并/追加派生：Debug, Clone, Serialize, Deserialize
/// - 自动实现 `::eventide_core::Event`，`NAME` 取自参数
/// - 参数：`#[event(name = "order.created")]`，缺省为类型名
/// - 支持结构体（具名、tuple、unit）与枚举
#[proc_macro_attribute]
pub fn event(attr: TokenStream, item: TokenStream) -> TokenStream {
    event::expand(attr, item)
}
