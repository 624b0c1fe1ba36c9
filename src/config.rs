//! Store Configuration
//!
//! Everything a store needs besides its items: where to persist, how to tell
//! time, how to defer work and how to find the active session.
//!
//! ```
//! use slsm::{MemoryBackend, StoreConfig, SyncPolicy};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = StoreConfig::builder()
//!     .persistent(MemoryBackend::with_quota(5 * 1024 * 1024))
//!     .session_provider(|| Some("user123".to_string()))
//!     .sync_default(SyncPolicy::debounce(Duration::from_millis(200)))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.namespace(), "slsm");
//! # }
//! ```

use crate::codec::key::DEFAULT_NAMESPACE;
use crate::error::{StoreError, StoreResult};
use crate::runtime::{Clock, Scheduler, SystemClock, TokioScheduler};
use crate::storage::backend::{Backend, MemoryBackend};
use crate::storage::sync::SyncPolicy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Reports the active session id, or `None` when no session is valid.
pub type SessionProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Default upper bound before startup housekeeping runs even without idle time.
pub const DEFAULT_HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(2);

/// Store-wide configuration.
#[derive(Clone)]
pub struct StoreConfig {
    pub(crate) namespace: String,
    pub(crate) persistent: Arc<dyn Backend>,
    pub(crate) tab: Arc<dyn Backend>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) session: Option<SessionProvider>,
    pub(crate) default_sync: Option<SyncPolicy>,
    pub(crate) housekeeping: bool,
    pub(crate) housekeeping_timeout: Duration,
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("namespace", &self.namespace)
            .field("session", &self.session.is_some())
            .field("default_sync", &self.default_sync)
            .field("housekeeping", &self.housekeeping)
            .field("housekeeping_timeout", &self.housekeeping_timeout)
            .finish()
    }
}

/// Builder for [`StoreConfig`].
pub struct StoreConfigBuilder {
    namespace: String,
    persistent: Option<Arc<dyn Backend>>,
    tab: Option<Arc<dyn Backend>>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    session: Option<SessionProvider>,
    default_sync: Option<SyncPolicy>,
    housekeeping: bool,
    housekeeping_timeout: Duration,
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            persistent: None,
            tab: None,
            clock: None,
            scheduler: None,
            session: None,
            default_sync: None,
            housekeeping: true,
            housekeeping_timeout: DEFAULT_HOUSEKEEPING_TIMEOUT,
        }
    }
}

impl StoreConfigBuilder {
    /// Prefix of every physical key (default `"slsm"`).
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Substrate for persistent items (default: a fresh [`MemoryBackend`]).
    pub fn persistent(mut self, backend: impl Backend + 'static) -> Self {
        self.persistent = Some(Arc::new(backend));
        self
    }

    /// Substrate for tab-scoped items (default: a fresh [`MemoryBackend`]).
    pub fn tab_scoped(mut self, backend: impl Backend + 'static) -> Self {
        self.tab = Some(Arc::new(backend));
        self
    }

    /// Time source (default: [`SystemClock`]).
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Deferred task runner (default: [`TokioScheduler`] on the current runtime).
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Scopes items to the session id this returns.
    pub fn session_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.session = Some(Arc::new(provider));
        self
    }

    /// Sync policy for items that do not set their own.
    pub fn sync_default(mut self, policy: SyncPolicy) -> Self {
        self.default_sync = Some(policy);
        self
    }

    /// Whether to remove orphaned keys and sweep expired ones at startup.
    pub fn housekeeping(mut self, enabled: bool) -> Self {
        self.housekeeping = enabled;
        self
    }

    /// Latest time after startup at which housekeeping runs.
    pub fn housekeeping_timeout(mut self, timeout: Duration) -> Self {
        self.housekeeping_timeout = timeout;
        self
    }

    /// Fails when no scheduler was given and there is no Tokio runtime to default to.
    pub fn build(self) -> StoreResult<StoreConfig> {
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::try_current().ok_or_else(|| {
                StoreError::Config(
                    "no scheduler configured and no Tokio runtime is running".to_string(),
                )
            })?),
        };

        Ok(StoreConfig {
            namespace: self.namespace,
            persistent: self
                .persistent
                .unwrap_or_else(|| Arc::new(MemoryBackend::new())),
            tab: self.tab.unwrap_or_else(|| Arc::new(MemoryBackend::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            scheduler,
            session: self.session,
            default_sync: self.default_sync,
            housekeeping: self.housekeeping,
            housekeeping_timeout: self.housekeeping_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ManualClock, ManualScheduler};

    #[test]
    fn test_build_without_runtime_needs_scheduler() {
        let err = StoreConfig::builder().build().unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));

        let clock = ManualClock::new(0);
        let config = StoreConfig::builder()
            .clock(clock.clone())
            .scheduler(Arc::new(ManualScheduler::new(clock)))
            .build()
            .unwrap();
        assert_eq!(config.namespace(), DEFAULT_NAMESPACE);
        assert!(config.housekeeping);
        assert!(config.default_sync.is_none());
    }

    #[tokio::test]
    async fn test_build_defaults_to_tokio() {
        let config = StoreConfig::builder()
            .namespace("app")
            .housekeeping(false)
            .build()
            .unwrap();
        assert_eq!(config.namespace(), "app");
        assert!(!config.housekeeping);
    }
}
