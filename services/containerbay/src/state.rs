//! Application state shared across request handlers.

use std::sync::Arc;

use crate::admission::Admission;
use crate::resolve::Resolver;
use crate::scheduler::FetchScheduler;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    resolver: Resolver,
    admission: Admission,
    scheduler: FetchScheduler,
}

impl AppState {
    /// Create a new application state.
    pub fn new(resolver: Resolver, admission: Admission, scheduler: FetchScheduler) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                resolver,
                admission,
                scheduler,
            }),
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    pub fn admission(&self) -> &Admission {
        &self.inner.admission
    }

    pub fn scheduler(&self) -> &FetchScheduler {
        &self.inner.scheduler
    }
}
