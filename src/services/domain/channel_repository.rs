/// 通道仓储
///
/// 按导入顺序保存全部通道。对外只提供读取快照；修改只在 crate 内部进行，
/// 且调用方必须通过 ChannelStateManager 的转换函数修改状态。

use crate::models::{Channel, OverallStatus, TestProgress};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone, Default)]
pub struct ChannelRepository {
    channels: Arc<RwLock<Vec<Channel>>>,
}

impl ChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Channel>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Channel>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, channel_id: &str) -> Option<Channel> {
        self.read().iter().find(|c| c.id() == channel_id).cloned()
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.read().iter().any(|c| c.id() == channel_id)
    }

    /// 全部通道（导入顺序）
    pub fn list(&self) -> Vec<Channel> {
        self.read().clone()
    }

    pub fn list_by_batch(&self, batch_name: &str) -> Vec<Channel> {
        self.read()
            .iter()
            .filter(|c| c.state.batch_name.as_deref() == Some(batch_name))
            .cloned()
            .collect()
    }

    /// 当前存在的批次名称（按首次出现顺序）
    pub fn batch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for channel in self.read().iter() {
            if let Some(name) = &channel.state.batch_name {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 进度统计
    pub fn progress(&self) -> TestProgress {
        let channels = self.read();
        let mut progress = TestProgress { total: channels.len(), ..TestProgress::default() };
        for channel in channels.iter() {
            match channel.state.overall {
                OverallStatus::Passed => progress.passed += 1,
                OverallStatus::Failed => progress.failed += 1,
                OverallStatus::Skipped => progress.skipped += 1,
                OverallStatus::NotTested => progress.pending += 1,
            }
        }
        progress
    }

    pub(crate) fn replace_all(&self, channels: Vec<Channel>) {
        *self.write() = channels;
    }

    /// 修改单个通道，返回闭包结果；通道不存在时返回 None
    pub(crate) fn update<R>(&self, channel_id: &str, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let mut channels = self.write();
        channels.iter_mut().find(|c| c.id() == channel_id).map(f)
    }

    /// 在写锁内修改全部通道
    pub(crate) fn update_all<R>(&self, f: impl FnOnce(&mut [Channel]) -> R) -> R {
        let mut channels = self.write();
        f(channels.as_mut_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImportedChannelRecord;
    use crate::services::domain::{ChannelStateManager, IChannelStateManager};
    use chrono::Utc;

    fn repository() -> ChannelRepository {
        let manager = ChannelStateManager::new();
        let channels = ["AI", "DI", "DO"]
            .iter()
            .enumerate()
            .map(|(i, module_type)| {
                let record = ImportedChannelRecord {
                    id: format!("CH_{}", i),
                    tag: format!("TAG{}", i),
                    module_type: module_type.to_string(),
                    comm_address: "40001".to_string(),
                    ..ImportedChannelRecord::default()
                };
                let mut channel = manager.initialize_from_import(&record).unwrap();
                let batch = if i < 2 { "批次1" } else { "批次2" };
                manager.apply_allocation(&mut channel, batch, "X1_1", "00001");
                channel
            })
            .collect();
        let repository = ChannelRepository::new();
        repository.replace_all(channels);
        repository
    }

    #[test]
    fn test_reads_are_snapshots() {
        let repository = repository();
        let snapshot = repository.get("CH_0").unwrap();

        let manager = ChannelStateManager::new();
        repository.update("CH_0", |c| manager.mark_skipped(c, "跳过", Utc::now()));

        assert_eq!(snapshot.state.overall, OverallStatus::NotTested);
        assert_eq!(repository.get("CH_0").unwrap().state.overall, OverallStatus::Skipped);
        assert!(repository.update("missing", |_| ()).is_none());
    }

    #[test]
    fn test_batches_and_progress() {
        let repository = repository();
        assert_eq!(repository.batch_names(), vec!["批次1".to_string(), "批次2".to_string()]);
        assert_eq!(repository.list_by_batch("批次1").len(), 2);
        assert_eq!(repository.list().len(), 3);

        let manager = ChannelStateManager::new();
        repository.update("CH_2", |c| manager.mark_skipped(c, "跳过", Utc::now()));
        let progress = repository.progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.pending, 2);
    }
}
