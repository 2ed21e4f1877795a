//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发后按注册顺序执行关闭钩子，每个钩子有独立期限。
//! 调度器钩子会停止派发并把当前任务降级为 waiting，下次启动由对账逻辑接着跑。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::scheduler::JobScheduler;

/// 关闭原因（只记录第一次触发）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 程序内部请求
    Requested(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::Terminate => f.write_str("terminate"),
            ShutdownReason::Requested(why) => write!(f, "requested: {}", why),
        }
    }
}

/// 进程级关闭信号（克隆共享）
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// 后台监听 Ctrl+C 与（unix 下）SIGTERM
    pub fn listen_for_signals(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl+C received, shutting down");
                signal.trigger(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let shutdown = self.clone();
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                        tracing::info!("SIGTERM received, shutting down");
                        shutdown.trigger(ShutdownReason::Terminate);
                    }
                    Err(e) => tracing::warn!("Cannot listen for SIGTERM: {}", e),
                }
            });
        }
    }
}

/// 关闭钩子
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// 按注册顺序执行的关闭钩子序列
pub struct ShutdownSequence {
    hooks: Vec<Box<dyn ShutdownHook>>,
    deadline: Duration,
}

impl ShutdownSequence {
    pub fn new(deadline: Duration) -> Self {
        Self {
            hooks: Vec::new(),
            deadline,
        }
    }

    pub fn with_hook(mut self, hook: impl ShutdownHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// 执行全部钩子；失败或超时只记日志，不影响后续钩子。返回成功的个数
    pub async fn run(&self) -> usize {
        let mut ok = 0;
        for hook in &self.hooks {
            match tokio::time::timeout(self.deadline, hook.run()).await {
                Ok(Ok(())) => {
                    tracing::info!("Shutdown hook '{}' done", hook.name());
                    ok += 1;
                }
                Ok(Err(e)) => tracing::warn!("Shutdown hook '{}' failed: {:#}", hook.name(), e),
                Err(_) => tracing::warn!(
                    "Shutdown hook '{}' exceeded {}s",
                    hook.name(),
                    self.deadline.as_secs()
                ),
            }
        }
        ok
    }
}

/// 停止调度器并记录剩余队列
pub struct StopScheduler(pub JobScheduler);

#[async_trait]
impl ShutdownHook for StopScheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.stop().await;
        let snapshot = self.0.get_state().await?;
        tracing::info!(
            "Scheduler stopped: {} waiting, pending retry {:?}",
            snapshot.waiting,
            snapshot.pending_retry
        );
        Ok(())
    }
}

/// 运行 app 直到其结束或收到关闭信号，然后执行关闭序列；返回关闭原因（app 自行结束时为 None）
pub async fn serve_until_shutdown<F>(
    signal: ShutdownSignal,
    app: F,
    sequence: ShutdownSequence,
) -> Option<ShutdownReason>
where
    F: Future<Output = ()>,
{
    signal.listen_for_signals();

    tokio::select! {
        _ = app => tracing::info!("Application loop ended"),
        _ = signal.wait() => {}
    }

    let done = sequence.run().await;
    tracing::info!("Shutdown complete ({} hook(s) succeeded)", done);
    signal.reason()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        hits: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ShutdownHook for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl ShutdownHook for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn run(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn first_reason_wins() {
        let signal = ShutdownSignal::new();
        let token = signal.token();
        signal.trigger(ShutdownReason::Terminate);
        signal.trigger(ShutdownReason::Interrupt);
        assert!(token.is_cancelled());
        assert_eq!(signal.reason(), Some(ShutdownReason::Terminate));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_stuck_hooks_do_not_block_the_rest() {
        let hits = Arc::new(AtomicUsize::new(0));
        let sequence = ShutdownSequence::new(Duration::from_secs(2))
            .with_hook(Counting {
                hits: hits.clone(),
                fail: true,
            })
            .with_hook(Stuck)
            .with_hook(Counting {
                hits: hits.clone(),
                fail: false,
            });

        assert_eq!(sequence.run().await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn requested_shutdown_runs_the_sequence() {
        let signal = ShutdownSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let sequence = ShutdownSequence::new(Duration::from_secs(1)).with_hook(Counting {
            hits: hits.clone(),
            fail: false,
        });

        let trigger = signal.clone();
        let app = async move {
            trigger.trigger(ShutdownReason::Requested("test".into()));
            std::future::pending::<()>().await;
        };
        let reason = serve_until_shutdown(signal, app, sequence).await;

        assert_eq!(reason, Some(ShutdownReason::Requested("test".into())));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
