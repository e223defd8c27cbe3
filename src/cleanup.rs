use std::{fmt::Debug, sync::Arc};

use testenv_core::TestHandle;
use tracing::{debug, info_span, warn};

/// How the environment is torn down once the test ends.
#[derive(Default)]
pub enum CleanupMode {
    /// No choice made yet; building fails.
    #[default]
    Unset,

    /// Leave everything running.
    Disabled,

    /// Stop everything the environment started.
    Standard,

    /// Run the given callback instead of the standard teardown.
    Custom(Box<dyn FnOnce() + Send>),
}

impl CleanupMode {
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl Debug for CleanupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "Unset"),
            Self::Disabled => write!(f, "Disabled"),
            Self::Standard => write!(f, "Standard"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Queues teardown steps on the running test, which unwinds them in reverse
/// registration order. Anything that must observe the others' shutdown has to
/// be registered first.
pub(crate) struct CleanupRegistrar {
    test: Option<Arc<dyn TestHandle>>,
}

impl CleanupRegistrar {
    pub fn new(test: Option<Arc<dyn TestHandle>>) -> Self {
        Self { test }
    }

    /// Returns false when there is no test to register with.
    pub fn register<F>(&self, label: &'static str, f: F) -> bool
    where
        F: FnOnce(&dyn TestHandle) + Send + 'static,
    {
        let Some(test) = &self.test else {
            warn!(cleanup = label, "no test instance set, cleanup won't be registered");
            return false;
        };

        test.cleanup(Box::new(move |test: &dyn TestHandle| {
            let span = info_span!("test_env", test = test.name(), cleanup = label);
            let _guard = span.enter();

            f(test);
        }));

        debug!(cleanup = label, "cleanup registered");

        true
    }
}
