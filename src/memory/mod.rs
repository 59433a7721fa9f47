//! 记忆层：运行历史与导出

pub mod history;
pub mod persistence;

pub use history::History;
pub use persistence::HistoryExporter;
