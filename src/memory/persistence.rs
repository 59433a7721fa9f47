//! 历史导出
//!
//! 将运行历史写入 `history_<YYYYmmdd_HHMMSS>.json`（格式化 JSON），只保留最新的 keep 个文件。

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::core::HistoryEntry;

const PREFIX: &str = "history_";
const SUFFIX: &str = ".json";

/// 历史导出目录；文件名按时间戳排序即为新旧顺序
#[derive(Debug, Clone)]
pub struct HistoryExporter {
    dir: PathBuf,
    keep: usize,
}

impl HistoryExporter {
    pub fn new(dir: impl AsRef<Path>, keep: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            keep: keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 写入一次导出并轮转旧文件；目录不存在时自动创建，返回新文件路径
    pub fn save(&self, entries: &[HistoryEntry]) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let path = self.next_path(&stamp)?;

        std::fs::write(&path, serde_json::to_string_pretty(entries)?)?;
        tracing::info!(path = %path.display(), entries = entries.len(), "history exported");

        self.prune()?;
        Ok(path)
    }

    /// 读取最新一次导出；目录不存在或为空时返回空 Vec
    pub fn load_latest(&self) -> anyhow::Result<Vec<HistoryEntry>> {
        let Some(latest) = self.exports()?.pop() else {
            return Ok(Vec::new());
        };
        let data = std::fs::read_to_string(&latest)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// 按从旧到新排列的导出文件
    pub fn exports(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(PREFIX) && n.ends_with(SUFFIX))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// 同一秒内多次导出时追加递增序号；序号总大于已有文件，保证新文件排在最后
    fn next_path(&self, stamp: &str) -> anyhow::Result<PathBuf> {
        let base = format!("{PREFIX}{stamp}");
        let mut latest: Option<u32> = None;
        for path in self.exports()? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(rest) = name
                .strip_prefix(base.as_str())
                .and_then(|r| r.strip_suffix(SUFFIX))
            else {
                continue;
            };
            let seq = match rest.strip_prefix('_') {
                Some(n) => n.parse().ok(),
                None if rest.is_empty() => Some(0),
                None => None,
            };
            latest = latest.max(seq);
        }

        let name = match latest {
            None => format!("{base}{SUFFIX}"),
            Some(n) => format!("{base}_{:03}{SUFFIX}", n + 1),
        };
        Ok(self.dir.join(name))
    }

    fn prune(&self) -> anyhow::Result<()> {
        let files = self.exports()?;
        if files.len() <= self.keep {
            return Ok(());
        }
        let excess = files.len() - self.keep;
        for old in &files[..excess] {
            std::fs::remove_file(old)?;
            tracing::debug!(path = %old.display(), "removed old history export");
        }
        Ok(())
    }
}
