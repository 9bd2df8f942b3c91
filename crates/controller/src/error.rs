use {
    crate::handler::{self, Phase, UnknownRoleError},
    cirrus_core::{cluster::LookupError, compute, ClusterSpec},
    derive_more::Display,
    std::fmt,
};

/// Operation of the [`ClusterController`](crate::ClusterController).
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Operation {
    #[display("launch")]
    Launch,

    #[display("{_0}")]
    Phase(Phase),

    #[display("destroy instance")]
    DestroyInstance,

    #[display("list instances")]
    ListInstances,

    #[display("run script")]
    RunScript,
}

impl From<Phase> for Operation {
    fn from(phase: Phase) -> Self {
        Self::Phase(phase)
    }
}

/// Error of a [`ClusterController`](crate::ClusterController) operation.
#[derive(Debug, thiserror::Error)]
#[error("Failed to {action} cluster `{cluster}`")]
pub struct Error {
    /// Which operation failed.
    pub action: Operation,

    /// Name of the cluster the operation has been performed on.
    pub cluster: String,

    #[source]
    pub kind: Kind,
}

impl Error {
    pub(crate) fn new(action: impl Into<Operation>, spec: &ClusterSpec, kind: Kind) -> Self {
        Self {
            action: action.into(),
            cluster: spec.cluster_name.clone(),
            kind,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.kind, Kind::Interrupted)
    }
}

/// Kind of an [`Error`].
#[derive(Debug, thiserror::Error)]
pub enum Kind {
    #[error("State store: {0}")]
    Storage(#[from] cirrus_state::Error),

    #[error("Provider: {0}")]
    Provider(#[from] compute::Error),

    #[error(transparent)]
    Handler(#[from] handler::Error),

    #[error("Instance lookup: {0}")]
    Lookup(#[from] LookupError),

    #[error("Interrupted")]
    Interrupted,

    #[error("Configuration: {0}")]
    Config(#[from] UnknownRoleError),

    #[error("Only {created} of the required {required} nodes were created for `{template}`")]
    InsufficientNodes {
        template: String,
        created: usize,
        required: usize,
    },

    #[error("Script failed on instance `{instance}` with exit status {status}: {stderr}")]
    ScriptFailed {
        instance: String,
        status: i32,
        stderr: String,
    },
}

/// Error of [`ClusterController::launch_cluster`](crate::ClusterController::launch_cluster).
#[derive(Debug, thiserror::Error)]
#[error("Failed to launch cluster, {rollback}")]
pub struct LaunchError {
    /// Original failure.
    pub source: Error,

    /// Outcome of the rollback performed in reaction to the failure.
    pub rollback: Rollback,
}

/// Outcome of the rollback of a failed launch.
#[derive(Debug)]
pub enum Rollback {
    /// All of the nodes of the cluster have been destroyed.
    Completed,

    /// Destroying the nodes failed, some of them may be orphaned.
    Failed(Error),

    /// Rollback is disabled or the launch has been interrupted. The cluster
    /// may be partially provisioned.
    Skipped,
}

impl fmt::Display for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("all nodes have been terminated"),
            Self::Failed(err) => write!(
                f,
                "failed to terminate the nodes, there might be orphaned nodes ({err}: {})",
                err.kind
            ),
            Self::Skipped => f.write_str(
                "nodes have not been terminated, the cluster might be in an inconsistent state",
            ),
        }
    }
}
