//! Contract of the compute providers clusters are provisioned on.

use {
    crate::{
        predicate::Predicate,
        spec::{ClusterSpec, Credentials},
    },
    derive_more::Display,
    futures::future::try_join_all,
    indexmap::IndexSet,
    serde::{Deserialize, Serialize},
    std::{future::Future, sync::Arc},
};

#[cfg(any(test, feature = "testing"))]
pub mod fake;

/// State of a provider node.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Pending,
    Running,
    Suspended,
    Terminated,
    Error,
    Unrecognized,
}

/// Provider record of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Provider-assigned ID.
    pub id: String,

    /// Group the node belongs to. Clusters use their name as the group.
    pub group: Option<String>,

    pub state: NodeState,
    pub hostname: Option<String>,
    pub public_addresses: Vec<String>,
    pub private_addresses: Vec<String>,
}

impl NodeMetadata {
    pub fn public_address(&self) -> Option<&str> {
        self.public_addresses.first().map(String::as_str)
    }

    pub fn private_address(&self) -> Option<&str> {
        self.private_addresses.first().map(String::as_str)
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.group.as_deref() == Some(group)
    }
}

/// Named shell fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub name: String,
    pub body: String,
}

impl Statement {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// Ordered list of [`Statement`]s executed as a single shell script.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Script {
    statements: Vec<Statement>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Renders this [`Script`] as a `bash` script aborting on the first
    /// failing command.
    pub fn render(&self) -> String {
        let mut out = String::from("#!/bin/bash\nset -e\n");

        for statement in &self.statements {
            out.push_str("# ");
            out.push_str(&statement.name);
            out.push('\n');
            out.push_str(statement.body.trim_end());
            out.push('\n');
        }

        out
    }
}

impl FromIterator<Statement> for Script {
    fn from_iter<T: IntoIterator<Item = Statement>>(iter: T) -> Self {
        Self {
            statements: iter.into_iter().collect(),
        }
    }
}

/// Hints used by a provider to create nodes.
#[derive(Clone, Debug, Default)]
pub struct NodeTemplate {
    pub roles: IndexSet<String>,
    pub hardware: Option<String>,
    pub image: Option<String>,
    pub location: Option<String>,
    pub firewall_rules: Vec<String>,

    /// [`Script`] to run on each node once it's created.
    pub init_script: Script,

    pub credentials: Option<Arc<Credentials>>,
}

/// Options of script execution.
#[derive(Clone, Debug, Default)]
pub struct RunScriptOptions {
    /// Credentials to use instead of the provider defaults.
    pub credentials: Option<Arc<Credentials>>,

    pub run_as_root: bool,

    /// Whether the script should be run in the background as an init script.
    pub wrap_in_init_script: bool,

    /// Name identifying the script in the node logs.
    pub task_name: Option<String>,
}

impl RunScriptOptions {
    pub fn with_credentials(mut self, credentials: Arc<Credentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn run_as_root(mut self, value: bool) -> Self {
        self.run_as_root = value;
        self
    }

    pub fn wrap_in_init_script(mut self, value: bool) -> Self {
        self.wrap_in_init_script = value;
        self
    }

    pub fn task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }
}

/// Outcome of running a [`Script`] on a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecResponse {
    pub exit_status: i32,
    pub output: String,
    pub error: String,
}

impl ExecResponse {
    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Provider error.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("Failed to connect to provider `{provider}`: {reason}")]
    Connection { provider: String, reason: String },

    #[error("Failed to create nodes in group `{group}`: {reason}")]
    Creation { group: String, reason: String },

    #[error("Failed to list nodes: {0}")]
    Listing(String),

    #[error("Failed to destroy node `{id}`: {reason}")]
    Destruction { id: String, reason: String },

    #[error("Failed to run script on node `{id}`: {reason}")]
    Script { id: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Compute API of a provider.
pub trait Compute: Send + Sync {
    /// Creates up to `count` nodes in the specified group.
    ///
    /// A provider MAY return fewer nodes than requested if some of them
    /// failed to start.
    fn create_nodes(
        &self,
        group: &str,
        count: usize,
        template: &NodeTemplate,
    ) -> impl Future<Output = Result<Vec<NodeMetadata>>> + Send;

    /// Lists the nodes matching the provided [`Predicate`].
    fn list_nodes(
        &self,
        predicate: &dyn Predicate<NodeMetadata>,
    ) -> impl Future<Output = Result<Vec<NodeMetadata>>> + Send;

    /// Destroys the node with the provided ID.
    ///
    /// Destroying an absent node is not an error.
    fn destroy_node(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Runs a [`Script`] on the node with the provided ID.
    fn run_script(
        &self,
        id: &str,
        script: &Script,
        options: &RunScriptOptions,
    ) -> impl Future<Output = Result<ExecResponse>> + Send;

    /// Runs a [`Script`] on every node matching the provided [`Predicate`]
    /// concurrently.
    fn run_script_on_nodes_matching(
        &self,
        predicate: &dyn Predicate<NodeMetadata>,
        script: &Script,
        options: &RunScriptOptions,
    ) -> impl Future<Output = Result<Vec<(NodeMetadata, ExecResponse)>>> + Send {
        async move {
            let nodes = self.list_nodes(predicate).await?;

            try_join_all(nodes.into_iter().map(|node| async move {
                let response = self.run_script(&node.id, script, options).await?;
                Ok((node, response))
            }))
            .await
        }
    }
}

/// Connector to a provider [`Compute`] API.
pub trait Connector: Send + Sync {
    type Compute: Compute;

    /// Connects to the provider described by the [`ClusterSpec`].
    fn connect(&self, spec: &ClusterSpec) -> impl Future<Output = Result<Self::Compute>> + Send;
}

/// Matches nodes of a group in the [`NodeState::Running`] state.
#[derive(Clone, Debug)]
pub struct RunningInGroup {
    pub group: String,
}

impl RunningInGroup {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }
}

impl Predicate<NodeMetadata> for RunningInGroup {
    fn test(&self, node: &NodeMetadata) -> bool {
        node.is_in_group(&self.group) && node.state == NodeState::Running
    }
}

/// Matches nodes of a group that are not yet terminated.
#[derive(Clone, Debug)]
pub struct InGroup {
    pub group: String,
}

impl InGroup {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }
}

impl Predicate<NodeMetadata> for InGroup {
    fn test(&self, node: &NodeMetadata) -> bool {
        node.is_in_group(&self.group) && node.state != NodeState::Terminated
    }
}

/// Matches nodes by ID.
#[derive(Clone, Debug)]
pub struct NodeIds(IndexSet<String>);

impl NodeIds {
    pub fn new<S: Into<String>>(ids: impl IntoIterator<Item = S>) -> Self {
        Self(ids.into_iter().map(Into::into).collect())
    }
}

impl Predicate<NodeMetadata> for NodeIds {
    fn test(&self, node: &NodeMetadata) -> bool {
        self.0.contains(&node.id)
    }
}
