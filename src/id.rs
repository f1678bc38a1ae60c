//! Unique id generation for submissions and ping nonces.

use uuid::Uuid;

/// Source of unique ids.
pub trait IdGenerator: Send + Sync + 'static {
    /// Produce a fresh id.
    fn generate(&self) -> String;
}

/// Random (v4) UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync + 'static,
{
    fn generate(&self) -> String {
        self()
    }
}
