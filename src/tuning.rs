//! Runtime sizing and memory trimming for a long-lived, mostly idle process.

use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::shimenv;

/// Worker threads used unless TOKIO_WORKER_THREADS is set.
pub const DEFAULT_WORKER_THREADS: usize = 2;
pub const MEMORY_TRIM_INTERVAL: Duration = Duration::from_secs(30);
const THREAD_STACK_SIZE: usize = 512 * 1024;

/// Worker count from an operator override; anything but a positive integer
/// falls back to [`DEFAULT_WORKER_THREADS`].
pub fn worker_threads(value: Option<&str>) -> usize {
    let Some(value) = value else {
        return DEFAULT_WORKER_THREADS;
    };
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
            warn!(
                value = %value,
                "Invalid TOKIO_WORKER_THREADS, using {} workers",
                DEFAULT_WORKER_THREADS
            );
            DEFAULT_WORKER_THREADS
        }
    }
}

/// Builds the multi-thread runtime the shim runs on.
pub fn build_runtime() -> std::io::Result<Runtime> {
    let workers = worker_threads(shimenv::worker_threads_override().as_deref());
    Builder::new_multi_thread()
        .enable_all()
        .worker_threads(workers)
        .thread_name("shim-worker")
        .thread_stack_size(THREAD_STACK_SIZE)
        .build()
}

/// Makes the allocator hand memory back to the OS sooner.
pub fn tune_allocator() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: mallopt only adjusts allocator parameters.
        unsafe {
            libc::mallopt(libc::M_ARENA_MAX, 2);
            libc::mallopt(libc::M_TRIM_THRESHOLD, 128 * 1024);
        }
        debug!("Allocator tuned");
    }
}

/// Returns free heap pages to the OS. True if anything was released.
pub fn trim_memory() -> bool {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim has no preconditions.
        unsafe { libc::malloc_trim(0) == 1 }
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        false
    }
}

/// Trims memory every `interval` until `shutdown` fires.
pub async fn run_memory_trim(interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let released = trim_memory();
                trace!(released, "Periodic memory trim");
            }
            _ = shutdown.cancelled() => {
                debug!("Memory trim task stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trim_task_stops_on_shutdown() {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_memory_trim(Duration::from_millis(5), token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_worker_threads_override() {
        assert_eq!(worker_threads(None), DEFAULT_WORKER_THREADS);
        assert_eq!(worker_threads(Some("4")), 4);
        assert_eq!(worker_threads(Some(" 8 ")), 8);
    }

    #[test]
    fn test_invalid_worker_threads_fall_back() {
        assert_eq!(worker_threads(Some("abc")), DEFAULT_WORKER_THREADS);
        assert_eq!(worker_threads(Some("0")), DEFAULT_WORKER_THREADS);
        assert_eq!(worker_threads(Some("-3")), DEFAULT_WORKER_THREADS);
    }

    #[test]
    fn test_build_runtime() {
        let runtime = build_runtime().unwrap();
        let value = runtime.block_on(async { 40 + 2 });
        assert_eq!(value, 42);
    }
}
