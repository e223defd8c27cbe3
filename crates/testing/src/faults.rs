use testenv_core::{LogStreamError, PlatformError};

/// Collaborator call that [`crate::FakePlatform`] should fail on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TestFault {
    #[default]
    None,
    NetworkCreate,
    LogStreamStart,
    MockAdapterStart,
    ChainStart,
    ClusterStart,
    CsaKeys,
    LogStreamFlush,
    ContainerLogs,
}

impl TestFault {
    pub(crate) fn check(self, target: TestFault, component: &'static str) -> Result<(), PlatformError> {
        if self == target {
            return Err(PlatformError::startup(
                component,
                format!("fault injection: {component}"),
            ));
        }

        Ok(())
    }

    pub(crate) fn check_stream(self, target: TestFault) -> Result<(), LogStreamError> {
        if self == target {
            return Err(LogStreamError::internal(format!(
                "fault injection: {target:?}"
            )));
        }

        Ok(())
    }
}
