use std::{sync::Arc, time::Duration};

use keel_dispatch_core::{DispatchExecutor, DispatchOptions, InMemoryStore};

pub fn create_executor(store: &InMemoryStore, options: DispatchOptions) -> DispatchExecutor {
    let store = Arc::new(store.clone());
    DispatchExecutor::new(store.clone(), store, options).expect("create executor")
}

pub fn default_options() -> DispatchOptions {
    DispatchOptions::default().with_flush_interval(default_flush_interval())
}

pub fn default_flush_interval() -> Duration {
    Duration::from_millis(20)
}

/// Bounds a test that would otherwise hang if an operation never completes.
pub fn test_timeout() -> Duration {
    Duration::from_secs(60)
}
