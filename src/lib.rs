pub mod core;
pub mod cta;
pub mod exchanges;
pub mod execution;
pub mod strategies;
pub mod utils;

// 选择性导出，避免命名冲突
pub use self::core::{config::*, error::*, exchange::*, types::*};
pub use cta::*;
pub use exchanges::*;
pub use execution::*;
pub use strategies::*;
pub use utils::*;
