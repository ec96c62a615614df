//! Runtime context configuration.

use std::sync::Arc;

use crate::gc::StrengthChange;

/// Default pacing threshold: collect once this many external bytes have been
/// charged since the previous collection.
pub const DEFAULT_GC_EXTERNAL_THRESHOLD: i64 = 32 * 1024 * 1024;

/// Hook invoked on the owning thread for every handle strength mutation.
pub type StrengthObserver = Arc<dyn Fn(&StrengthChange) + Send + Sync>;

/// Configuration for a runtime context.
#[derive(Clone)]
pub struct ContextConfig {
    /// Name of the context (also used for the thread name)
    pub name: String,
    /// External bytes charged since the last collection that trigger a
    /// collection at the end of the tick (0 = never collect on pacing)
    pub gc_external_threshold: i64,
    /// Strength mutation hook (None = no hook)
    pub strength_observer: Option<StrengthObserver>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: "runtime".to_string(),
            gc_external_threshold: DEFAULT_GC_EXTERNAL_THRESHOLD,
            strength_observer: None,
        }
    }
}

impl ContextConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_gc_external_threshold(mut self, threshold: i64) -> Self {
        self.gc_external_threshold = threshold;
        self
    }

    /// Install a hook called for every strength change.
    ///
    /// # Example
    /// ```ignore
    /// let config = ContextConfig::new("main").with_strength_observer(|change| {
    ///     assert_eq!(change.thread, std::thread::current().id());
    /// });
    /// ```
    pub fn with_strength_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&StrengthChange) + Send + Sync + 'static,
    {
        self.strength_observer = Some(Arc::new(observer));
        self
    }
}

impl std::fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextConfig")
            .field("name", &self.name)
            .field("gc_external_threshold", &self.gc_external_threshold)
            .field("strength_observer", &self.strength_observer.is_some())
            .finish()
    }
}
