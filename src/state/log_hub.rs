//! 日志通道管理
//!
//! 每个部署任务一个广播通道，附带有界回放缓冲，
//! 部署开始后才订阅的 SSE 客户端也能拿到之前的输出

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};

use crate::domain::deploy::LogLine;

/// 日志通道容量
const LOG_CHANNEL_CAPACITY: usize = 256;

/// 每个任务保留的回放行数
const LOG_BACKLOG_LINES: usize = 2000;

/// 单个任务的日志出口
///
/// 写入时先追加回放缓冲再广播，两步在同一把锁内完成，
/// 所以 `subscribe_with_backlog` 不会丢行也不会重复
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    sender: broadcast::Sender<LogLine>,
    backlog: Mutex<VecDeque<LogLine>>,
    max_backlog: usize,
}

impl LogSink {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CHANNEL_CAPACITY, LOG_BACKLOG_LINES)
    }

    pub fn with_capacity(channel_capacity: usize, max_backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        Self {
            inner: Arc::new(SinkInner {
                sender,
                backlog: Mutex::new(VecDeque::new()),
                max_backlog,
            }),
        }
    }

    /// 写入一行日志
    pub fn send(&self, line: LogLine) {
        if let Ok(mut backlog) = self.inner.backlog.lock() {
            backlog.push_back(line.clone());
            while backlog.len() > self.inner.max_backlog {
                backlog.pop_front();
            }
            // 没有订阅者时 send 返回 Err，忽略即可
            let _ = self.inner.sender.send(line);
        }
    }

    /// 订阅实时日志
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.inner.sender.subscribe()
    }

    /// 获取已有日志并订阅后续日志
    pub fn subscribe_with_backlog(&self) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        match self.inner.backlog.lock() {
            Ok(backlog) => {
                let receiver = self.inner.sender.subscribe();
                (backlog.iter().cloned().collect(), receiver)
            }
            Err(_) => (Vec::new(), self.inner.sender.subscribe()),
        }
    }

    /// 活跃订阅者数量
    pub fn receiver_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

/// 日志通道信息
struct LogChannel {
    sink: LogSink,
    /// 创建时间
    created_at: DateTime<Utc>,
    /// 是否已完成
    finished: bool,
}

/// 日志中心
///
/// 管理任务日志通道，任务结束后按策略清理
pub struct LogHub {
    /// 通道映射 (task_id -> LogChannel)
    channels: RwLock<HashMap<String, LogChannel>>,
}

impl LogHub {
    /// 创建新的日志中心
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 创建新的日志通道
    ///
    /// 如果通道已存在，返回现有的出口
    pub async fn create(&self, task_id: &str) -> LogSink {
        let mut channels = self.channels.write().await;

        if let Some(channel) = channels.get(task_id) {
            return channel.sink.clone();
        }

        let sink = LogSink::new();
        channels.insert(
            task_id.to_string(),
            LogChannel {
                sink: sink.clone(),
                created_at: Utc::now(),
                finished: false,
            },
        );

        sink
    }

    /// 获取日志出口
    pub async fn get(&self, task_id: &str) -> Option<LogSink> {
        let channels = self.channels.read().await;
        channels.get(task_id).map(|c| c.sink.clone())
    }

    /// 标记通道完成
    ///
    /// 通道完成后，SSE 客户端回放完缓冲即收到完成事件
    pub async fn finish(&self, task_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(task_id) {
            channel.finished = true;
        }
    }

    /// 检查通道是否已完成（不存在视为已完成）
    pub async fn is_finished(&self, task_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.get(task_id).map_or(true, |c| c.finished)
    }

    /// 检查通道是否存在
    pub async fn exists(&self, task_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.contains_key(task_id)
    }

    /// 清理已完成的通道
    ///
    /// 移除已完成且没有活跃订阅者、并且创建超过 `min_age_minutes` 的通道
    pub async fn cleanup(&self, min_age_minutes: i64) {
        let now = Utc::now();
        let mut channels = self.channels.write().await;
        channels.retain(|_, channel| {
            // 保留未完成的通道
            if !channel.finished {
                return true;
            }
            // 保留有活跃订阅者的通道
            if channel.sink.receiver_count() > 0 {
                return true;
            }
            (now - channel.created_at).num_minutes() < min_age_minutes
        });
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}
