use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

impl Context {
    /// Cooperative cancellation probe; long passes call this at chunk
    /// boundaries and abort cleanly when it fires.
    pub fn stop_requested(&mut self) -> bool {
        !matches!(
            self.shutdown.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Optional wake signal: when notified, the task runs immediately
    /// instead of waiting for the next interval tick.
    fn signal(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.write().unwrap().push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let signal = task.signal();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // A fallback wakeup that never fires by itself.
            let idle = Arc::new(Notify::new());
            let signal = signal.unwrap_or(idle);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = signal.notified() => {}
                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }

                run_id += 1;
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                    shutdown: shutdown_rx.resubscribe(),
                };

                if let Err(e) = task.execute(ctx).await {
                    tracing::error!(
                        task = task.name(),
                        error = %e,
                        "Task execution failed"
                    );
                }
            }
        })
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        // Wait for all tasks to complete
        let tasks: Vec<JoinHandle<()>> = self.tasks.write().unwrap().drain(..).collect();
        for task in tasks {
            task.await
                .map_err(|e| crate::Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        name: &'static str,
        interval: Duration,
        counter: Arc<AtomicUsize>,
        signal: Option<Arc<Notify>>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn signal(&self) -> Option<Arc<Notify>> {
            self.signal.clone()
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduler_basic() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            counter: counter.clone(),
            signal: None,
        });

        scheduler.register(task);

        // Let it run for a bit
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Should have executed multiple times
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_signal_wakes_task() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let signal = Arc::new(Notify::new());

        let task = Arc::new(TestTask {
            name: "signal-task",
            interval: Duration::from_secs(3600),
            counter: counter.clone(),
            signal: Some(signal.clone()),
        });

        scheduler.register(task);

        // The first interval tick fires immediately; wait for it to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let baseline = counter.load(Ordering::SeqCst);

        signal.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(counter.load(Ordering::SeqCst) > baseline);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_graceful_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            counter: counter.clone(),
            signal: None,
        });

        scheduler.register(task);

        // Let it run briefly
        tokio::time::sleep(Duration::from_millis(25)).await;

        let count_before_shutdown = counter.load(Ordering::SeqCst);

        // Shutdown should be fast
        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        let shutdown_time = start.elapsed();

        // Should shutdown quickly
        assert!(shutdown_time < Duration::from_millis(100));

        // Give a moment to ensure no more tasks run
        tokio::time::sleep(Duration::from_millis(25)).await;
        let count_after_shutdown = counter.load(Ordering::SeqCst);

        // Should not have increased after shutdown
        assert_eq!(count_before_shutdown, count_after_shutdown);

        Ok(())
    }
}
