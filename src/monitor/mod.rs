// 健康检查与进度报告

pub mod health;
pub mod report;

pub use health::{HealthMonitor, HealthReport};
pub use report::{weighted_percent, Decision, Observation, ReportState, ReportThrottler};
