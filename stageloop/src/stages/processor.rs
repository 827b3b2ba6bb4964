//! The processing callback contract and its closure adapters.

use crate::core::{Payload, WorkItem};
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// Processes one work item on behalf of a stage.
///
/// The returned item carries the attempt's outcome. On success it is also
/// what the pipeline hands to the next stage. Returning `None` is a contract
/// violation: the stage logs it and stops advancing.
#[async_trait]
pub trait Processor<T: Payload>: Send + Sync {
    /// Processes `item` for the stage at `stage`.
    async fn process(&self, stage: usize, item: &WorkItem<T>) -> Option<WorkItem<T>>;
}

/// Adapts a blocking closure.
///
/// The closure runs on tokio's blocking pool so it may sleep or do I/O for
/// as long as it needs without starving other stage workers. A panic inside
/// the closure is treated like a missing result.
pub struct FnProcessor<F> {
    func: Arc<F>,
}

impl<F> FnProcessor<F> {
    /// Creates a new closure-based processor.
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F> Processor<T> for FnProcessor<F>
where
    T: Payload,
    F: Fn(usize, &WorkItem<T>) -> Option<WorkItem<T>> + Send + Sync + 'static,
{
    async fn process(&self, stage: usize, item: &WorkItem<T>) -> Option<WorkItem<T>> {
        let func = Arc::clone(&self.func);
        let item = item.clone();
        match tokio::task::spawn_blocking(move || func(stage, &item)).await {
            Ok(result) => result,
            Err(join_error) => {
                error!(stage, error = %join_error, "Processor closure panicked");
                None
            }
        }
    }
}

/// Adapts an async closure taking the item by value.
pub struct AsyncFnProcessor<F, Fut> {
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnProcessor<F, Fut> {
    /// Creates a new async closure-based processor.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> fmt::Debug for AsyncFnProcessor<F, Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFnProcessor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for AsyncFnProcessor<F, Fut>
where
    T: Payload,
    F: Fn(usize, WorkItem<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Option<WorkItem<T>>> + Send,
{
    async fn process(&self, stage: usize, item: &WorkItem<T>) -> Option<WorkItem<T>> {
        let fut = (self.func)(stage, item.clone());
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(stage, "Processor future panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_processor() {
        let processor = FnProcessor::new(|stage: usize, item: &WorkItem<String>| {
            Some(WorkItem::success(format!("{}_P{stage}", item.payload())))
        });

        let result = processor.process(1, &WorkItem::new("a".to_string())).await.unwrap();
        assert_eq!(result.payload(), "a_P1");
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_fn_processor_panic_is_absent_result() {
        let processor = FnProcessor::new(|_stage: usize, _item: &WorkItem<u32>| -> Option<WorkItem<u32>> {
            panic!("boom");
        });
        assert!(processor.process(0, &WorkItem::new(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_async_fn_processor() {
        let processor = AsyncFnProcessor::new(|_stage: usize, item: WorkItem<u32>| async move {
            tokio::task::yield_now().await;
            Some(WorkItem::failure(*item.payload() * 2))
        });

        let result = processor.process(0, &WorkItem::new(21)).await.unwrap();
        assert_eq!(*result.payload(), 42);
        assert!(result.outcome().is_failure());
    }

    #[tokio::test]
    async fn test_async_fn_processor_panic_is_absent_result() {
        let processor = AsyncFnProcessor::new(|_stage: usize, _item: WorkItem<u32>| async move {
            if true {
                panic!("boom");
            }
            None::<WorkItem<u32>>
        });
        assert!(processor.process(0, &WorkItem::new(1)).await.is_none());
    }
}
