//! Function handlers and the registry mapping function names to them.
//!
//! # Example
//!
//! ```ignore
//! use gearman_async::codec::JsonCodec;
//! use gearman_async::{FnHandler, TypedHandler};
//!
//! let reverse = FnHandler::new(|job| async move {
//!     let mut text = job.workload().to_vec();
//!     text.reverse();
//!     job.complete(text)
//! });
//!
//! let sum = TypedHandler::<JsonCodec, _, _, _>::new(|numbers: Vec<u64>, job| async move {
//!     job.complete(numbers.iter().sum::<u64>().to_string())
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::Job;
use crate::codec::Codec;
use crate::error::Result;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs the jobs of one function.
///
/// The handler reports through the [`Job`]. Returning `Err` while the job
/// is still running fails it with the error text as exception.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, job: Job) -> BoxFuture<'static, Result<()>>;
}

/// Handler from an async closure taking the job.
pub struct FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, job: Job) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.handler)(job))
    }
}

/// Wrapper that decodes the workload with codec `C` before calling the
/// handler.
pub struct TypedHandler<C, F, T, Fut>
where
    C: Codec,
    F: Fn(T, Job) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(C, T) -> Fut>,
}

impl<C, F, T, Fut> TypedHandler<C, F, T, Fut>
where
    C: Codec,
    F: Fn(T, Job) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<C, F, T, Fut> Handler for TypedHandler<C, F, T, Fut>
where
    C: Codec + 'static,
    F: Fn(T, Job) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, job: Job) -> BoxFuture<'static, Result<()>> {
        let parsed: T = match C::decode(job.workload()) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(parsed, job))
    }
}

/// Registered functions by name.
#[derive(Default)]
pub(crate) struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Handler>>,
}

impl FunctionRegistry {
    pub(crate) fn insert(&mut self, function: String, handler: Arc<dyn Handler>) {
        self.functions.insert(function, handler);
    }

    pub(crate) fn remove(&mut self, function: &str) -> bool {
        self.functions.remove(function).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.functions.clear();
    }

    pub(crate) fn get(&self, function: &str) -> Option<Arc<dyn Handler>> {
        self.functions.get(function).cloned()
    }

    pub(crate) fn contains(&self, function: &str) -> bool {
        self.functions.contains_key(function)
    }

    /// Registered names, sorted.
    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::error::GearmanError;
    use crate::worker::job::tests::detached_job;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = FunctionRegistry::default();
        registry.insert(
            "reverse".to_string(),
            Arc::new(FnHandler::new(|_job| async { Ok(()) })),
        );
        registry.insert(
            "count".to_string(),
            Arc::new(FnHandler::new(|_job| async { Ok(()) })),
        );

        assert!(registry.contains("reverse"));
        assert!(registry.get("reverse").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["count", "reverse"]);

        assert!(registry.remove("reverse"));
        assert!(!registry.remove("reverse"));

        registry.clear();
        assert!(registry.names().is_empty());
    }

    #[tokio::test]
    async fn test_fn_handler_receives_job() {
        let handler = FnHandler::new(|job: Job| async move {
            assert_eq!(job.function(), "reverse");
            Ok(())
        });

        handler.call(detached_job("reverse", "abc")).await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_workload() {
        let handler = TypedHandler::<JsonCodec, _, _, _>::new(|numbers: Vec<u32>, _job| async move {
            assert_eq!(numbers, vec![1, 2, 3]);
            Ok(())
        });

        handler.call(detached_job("sum", "[1,2,3]")).await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_handler_decode_error() {
        let handler = TypedHandler::<JsonCodec, _, _, _>::new(|_: Vec<u32>, _job| async { Ok(()) });

        let result = handler.call(detached_job("sum", "not json")).await;
        assert!(matches!(result, Err(GearmanError::Json(_))));
    }
}
