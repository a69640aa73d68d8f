//! 进度持久化模块
//!
//! 每个频道一份 JSON 进度记录，用于断点恢复：
//!
//! ```text
//! progress/
//! ├── channel_-100123456789.json
//! └── channel_987654.json
//! ```
//!
//! ## 设计原则
//!
//! 1. **原子写入**: 先写临时文件再重命名
//! 2. **容错性**: 读写失败只记日志，返回空记录
//! 3. **频道级互斥**: 使用 parking_lot::Mutex，锁不跨越 await

pub mod ledger;
pub mod types;

pub use ledger::ProgressLedger;
pub use types::{ChannelProgress, FileStatus, InFlightEntry, LedgerStats, Outcome, PendingEntry};
