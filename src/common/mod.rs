//! 公共模块
//!
//! 提供引擎内跨模块使用的通用组件

mod adaptive_sizer;
mod progress;
mod retry;

pub use adaptive_sizer::AdaptiveSizer;
pub use progress::{ProgressCallback, ProgressEvent, ProgressReporter, ProgressSample};
pub use retry::calculate_backoff_delay;
