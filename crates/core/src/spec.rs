//! Declarative description of a cluster.

use {
    derive_where::derive_where,
    indexmap::IndexSet,
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, HashMap},
        fmt,
        path::PathBuf,
        str::FromStr,
        sync::Arc,
    },
};

/// Login user and private key material used to reach the nodes of a cluster.
///
/// Shared by every [`Instance`](crate::Instance) of a cluster.
#[derive(Clone, PartialEq, Eq)]
#[derive_where(Debug)]
pub struct Credentials {
    pub user: String,

    #[derive_where(skip)]
    pub private_key: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            private_key: private_key.into(),
        }
    }
}

/// Identity of the compute provider a cluster runs on.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive_where(Debug)]
pub struct ProviderSpec {
    /// Provider name, e.g. `byon`.
    pub name: String,

    pub identity: Option<String>,

    #[derive_where(skip)]
    pub credential: Option<String>,
}

/// Backend persisting the state of a cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateStoreKind {
    /// One file per cluster on the local filesystem.
    #[default]
    Local,

    /// Shared in-process map.
    Memory,

    /// State is never persisted.
    None,
}

/// Group of identical nodes sharing the same set of roles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceTemplate {
    roles: IndexSet<String>,
    count: usize,
    min_count: usize,

    /// Hardware profile hint passed to the provider.
    pub hardware: Option<String>,

    /// Image hint passed to the provider.
    pub image: Option<String>,

    /// Location hint passed to the provider.
    pub location: Option<String>,
}

impl InstanceTemplate {
    /// Creates a new [`InstanceTemplate`] requiring all of the `count` nodes
    /// to be created.
    pub fn new<R>(count: usize, roles: impl IntoIterator<Item = R>) -> Self
    where
        R: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            count,
            min_count: count,
            hardware: None,
            image: None,
            location: None,
        }
    }

    /// Lowers the number of nodes that have to be successfully created for the
    /// bootstrap of this template to succeed.
    pub fn with_min_count(mut self, min_count: usize) -> Self {
        self.min_count = min_count.min(self.count);
        self
    }

    pub fn roles(&self) -> &IndexSet<String> {
        &self.roles
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn min_count(&self) -> usize {
        self.min_count
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Parses a comma separated list of templates, e.g.
    /// `"1 namenode+jobtracker, 3 datanode+tasktracker"`.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, ParseTemplateError> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect()
    }

    /// Applies minimum node counts in the same `"<count> <role>+<role>"`
    /// format as [`InstanceTemplate::parse_list`]. Entries are matched by
    /// their role set.
    pub fn apply_minimums(templates: &mut [Self], s: &str) -> Result<(), ParseTemplateError> {
        for minimum in Self::parse_list(s)? {
            let template = templates
                .iter_mut()
                .find(|t| t.roles == minimum.roles)
                .ok_or_else(|| ParseTemplateError::UnknownTemplate(minimum.to_string()))?;

            template.min_count = minimum.count.min(template.count);
        }

        Ok(())
    }
}

impl FromStr for InstanceTemplate {
    type Err = ParseTemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseTemplateError::Invalid(s.to_string());

        let (count, roles) = s.trim().split_once(' ').ok_or_else(invalid)?;
        let count = count.parse().map_err(|_| invalid())?;

        let roles: IndexSet<_> = roles
            .trim()
            .split('+')
            .map(str::trim)
            .filter(|role| !role.is_empty())
            .collect();

        if roles.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(count, roles))
    }
}

impl fmt::Display for InstanceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.count)?;

        for (idx, role) in self.roles.iter().enumerate() {
            if idx > 0 {
                f.write_str("+")?;
            }
            f.write_str(role)?;
        }

        Ok(())
    }
}

/// Error of parsing an [`InstanceTemplate`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseTemplateError {
    #[error("Invalid instance template `{0}`, expected `<count> <role>+<role>`")]
    Invalid(String),

    #[error("Minimum count specified for an unknown instance template `{0}`")]
    UnknownTemplate(String),
}

/// Read-only description of a cluster, passed into every lifecycle action.
#[derive(Clone, Debug)]
pub struct ClusterSpec {
    /// Name of the cluster. Also the provider group its nodes belong to and
    /// the identity of its persisted state.
    pub cluster_name: String,

    pub instance_templates: Vec<InstanceTemplate>,

    pub provider: ProviderSpec,

    /// Credentials shared by all the instances of the cluster.
    pub credentials: Arc<Credentials>,

    /// Firewall rules, passed through to the role handlers as is.
    pub firewall_rules: Vec<String>,

    /// Whether all of the nodes should be destroyed if the cluster fails to
    /// launch.
    pub terminate_all_on_launch_failure: bool,

    pub state_store: StateStoreKind,

    /// Directory of the [`StateStoreKind::Local`] state store.
    pub state_store_dir: Option<PathBuf>,

    /// Per-role parameter overrides.
    pub role_parameters: HashMap<String, BTreeMap<String, String>>,
}

impl ClusterSpec {
    /// Creates a new [`ClusterSpec`] without instance templates.
    pub fn new(cluster_name: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            instance_templates: Vec::new(),
            provider: ProviderSpec::default(),
            credentials: Arc::new(credentials),
            firewall_rules: Vec::new(),
            terminate_all_on_launch_failure: true,
            state_store: StateStoreKind::default(),
            state_store_dir: None,
            role_parameters: HashMap::new(),
        }
    }

    pub fn with_templates(mut self, templates: impl IntoIterator<Item = InstanceTemplate>) -> Self {
        self.instance_templates.extend(templates);
        self
    }

    pub fn cluster_user(&self) -> &str {
        &self.credentials.user
    }

    pub fn private_key(&self) -> &str {
        &self.credentials.private_key
    }

    /// Returns all of the roles configured across the instance templates.
    pub fn roles(&self) -> IndexSet<&str> {
        self.instance_templates
            .iter()
            .flat_map(|t| t.roles.iter().map(String::as_str))
            .collect()
    }

    /// Returns parameter overrides of the specified role.
    pub fn role_parameters(&self, role: &str) -> Option<&BTreeMap<String, String>> {
        self.role_parameters.get(role)
    }
}
