use crate::RetryPolicy;
use derive_builder::Builder;
use std::path::PathBuf;

/// One logical port a service needs, with the fixed value used in contained
/// mode (local runs get ephemeral ports instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequest {
    pub name: &'static str,
    pub contained: u16,
}

/// Where a service's artifacts come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// Download and unpack an archive; `marker` is the file whose presence
    /// identifies the payload directory inside the versioned archive root.
    Archive { url: String, marker: String },
    /// Artifacts already sit at a fixed path (container images bake them in);
    /// installation is skipped when the marker is present.
    Preinstalled { path: PathBuf },
}

/// Static description of one managed service. Runtime facts (ports, process
/// handle, state) live with the orchestrator, not here.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into))]
pub struct ServiceSpec {
    pub name: String,
    pub install: InstallSource,
    pub ports: Vec<PortRequest>,
    /// Budget for this service's readiness detection.
    #[builder(default)]
    pub readiness: RetryPolicy,
}

impl ServiceSpec {
    pub fn builder() -> ServiceSpecBuilder {
        ServiceSpecBuilder::default()
    }
}

/// Lifecycle of a managed service within one run.
///
/// Transitions are monotonic along
/// `Uninstalled -> Installed -> Starting -> Ready -> Stopped`; `Failed` is
/// reachable from any state before `Ready`, and `Stopped` from anywhere
/// (stop is always a safe request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninstalled,
    Installed,
    Starting,
    Ready,
    Stopped,
    Failed,
}

impl ServiceState {
    fn rank(self) -> u8 {
        match self {
            ServiceState::Uninstalled => 0,
            ServiceState::Installed => 1,
            ServiceState::Starting => 2,
            ServiceState::Ready => 3,
            ServiceState::Stopped => 4,
            ServiceState::Failed => 5,
        }
    }

    pub fn may_become(self, next: ServiceState) -> bool {
        match next {
            ServiceState::Stopped => true,
            ServiceState::Failed => self.rank() < ServiceState::Ready.rank(),
            _ => next.rank() == self.rank() + 1,
        }
    }
}
