// 下载队列与工作者池

pub mod archive;
pub mod queue;
pub mod registry;
pub mod task;
pub mod worker;

pub use archive::{Archiver, RcloneArchiver};
pub use queue::WorkQueue;
pub use registry::{ActiveDownloadInfo, ActiveDownloadRegistry};
pub use task::{DownloadKey, DownloadTask};
pub use worker::{process_task, TaskEnd, WorkerPool};
