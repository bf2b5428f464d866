//! 考官回复线程池
//!
//! 实时连接的读循环不直接等待生成调用：回复生成被派发到这里，由 Semaphore 限制同时进行的数量，
//! 慢调用不会阻塞本连接的读循环或其他连接。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ReplyWorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl ReplyWorkerPool {
    pub fn new(workers: usize) -> Self {
        let size = workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前空闲的槽位
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 获取执行许可；池关闭时返回 None
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// 在后台执行 `job`，先排队等待许可；池关闭时返回 None
    pub fn spawn<F>(&self, job: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move {
            let _permit = pool.acquire().await?;
            Some(job.await)
        })
    }

    /// 拒绝新的任务（已排队的任务得到 None）
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// 等已排队和进行中的回复全部写回后关闭
    pub async fn drain(&self) {
        if let Ok(all) = self.semaphore.acquire_many(self.size as u32).await {
            drop(all);
        }
        self.close();
    }
}

impl Default for ReplyWorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = ReplyWorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            assert!(h.await.unwrap().is_some());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_jobs() {
        let pool = ReplyWorkerPool::new(1);
        pool.close();
        assert!(pool.spawn(async { 1 }).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_waits_for_running_jobs() {
        let pool = ReplyWorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        // 让三个任务都先排上队
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(pool.acquire().await.is_none());
    }
}
