//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 取消同一个 CancellationToken，HTTP 服务与实时网关随之停止接收新连接。
//! 之后依次执行收尾步骤：先让已派发的考官回复写回，再关闭 SQLite 连接池。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::task_scheduler::ReplyWorkerPool;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 某个服务异常退出
    ServiceExited(String),
}

/// 关闭信号：首次触发的原因会被保留
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                tracing::info!(?reason, "shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = self.clone();
            tokio::spawn(async move {
                if let Ok(mut term) = signal(SignalKind::terminate()) {
                    term.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 一个收尾步骤
#[async_trait]
pub trait ShutdownStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// 按注册顺序执行收尾步骤；失败或超时只记日志，不影响后续步骤
pub struct ShutdownCoordinator {
    steps: Vec<Box<dyn ShutdownStep>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            step_timeout,
        }
    }

    pub fn register(&mut self, step: impl ShutdownStep + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(&self) {
        for step in &self.steps {
            let name = step.name();
            match tokio::time::timeout(self.step_timeout, step.run()).await {
                Ok(Ok(())) => tracing::info!(step = name, "shutdown step done"),
                Ok(Err(e)) => tracing::warn!(step = name, error = %e, "shutdown step failed"),
                Err(_) => tracing::warn!(
                    step = name,
                    secs = self.step_timeout.as_secs(),
                    "shutdown step timed out"
                ),
            }
        }
    }
}

/// 等待进行中的考官回复写回，然后拒绝新的回复
pub struct DrainLiveReplies(pub ReplyWorkerPool);

#[async_trait]
impl ShutdownStep for DrainLiveReplies {
    fn name(&self) -> &'static str {
        "live-replies"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.drain().await;
        Ok(())
    }
}

/// 关闭连接池
pub struct CloseStore(pub Store);

#[async_trait]
impl ShutdownStep for CloseStore {
    fn name(&self) -> &'static str {
        "sqlite-pool"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    struct Failing;

    #[async_trait]
    impl ShutdownStep for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run(&self) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn test_failed_step_does_not_stop_later_steps() {
        let store = Store::in_memory().await.unwrap();
        let pool = ReplyWorkerPool::new(2);

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator
            .register(Failing)
            .register(DrainLiveReplies(pool.clone()))
            .register(CloseStore(store.clone()));
        coordinator.run().await;

        assert!(pool.acquire().await.is_none());
        assert!(store.pool().is_closed());
    }
}
