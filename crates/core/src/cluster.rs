use {
    crate::{compute::NodeMetadata, predicate::Predicate, spec::Credentials},
    indexmap::{IndexMap, IndexSet},
    std::sync::Arc,
};

/// Provisioned node of a [`Cluster`] together with the roles assigned to it.
///
/// [`Instance`]s are immutable. Changing roles or addresses produces a new
/// [`Instance`].
#[derive(Clone, Debug)]
pub struct Instance {
    id: String,
    roles: IndexSet<String>,
    public_address: Option<String>,
    private_address: Option<String>,
    credentials: Arc<Credentials>,
    node: Option<Arc<NodeMetadata>>,
}

impl Instance {
    /// Creates a new [`Instance`] without addresses and without a live
    /// provider record.
    pub fn new<R>(
        id: impl Into<String>,
        roles: impl IntoIterator<Item = R>,
        credentials: Arc<Credentials>,
    ) -> Self
    where
        R: Into<String>,
    {
        Self {
            id: id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
            public_address: None,
            private_address: None,
            credentials,
            node: None,
        }
    }

    /// Creates a new [`Instance`] out of a live provider node.
    pub fn from_node<R>(
        node: NodeMetadata,
        roles: impl IntoIterator<Item = R>,
        credentials: Arc<Credentials>,
    ) -> Self
    where
        R: Into<String>,
    {
        Self::new(node.id.clone(), roles, credentials)
            .with_addresses(
                node.public_address().map(ToOwned::to_owned),
                node.private_address().map(ToOwned::to_owned),
            )
            .with_node(Arc::new(node))
    }

    pub fn with_addresses(mut self, public: Option<String>, private: Option<String>) -> Self {
        self.public_address = public;
        self.private_address = private;
        self
    }

    pub fn with_node(mut self, node: Arc<NodeMetadata>) -> Self {
        self.node = Some(node);
        self
    }

    /// Opaque provider-assigned ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn roles(&self) -> &IndexSet<String> {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn public_address(&self) -> Option<&str> {
        self.public_address.as_deref()
    }

    pub fn private_address(&self) -> Option<&str> {
        self.private_address.as_deref()
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// Live provider record of this [`Instance`].
    ///
    /// `None` if the [`Instance`] has been reconstructed from persisted
    /// state.
    pub fn node(&self) -> Option<&NodeMetadata> {
        self.node.as_deref()
    }
}

/// Identity, roles and addresses. Credentials and the provider record are not
/// part of the identity of an [`Instance`].
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.roles == other.roles
            && self.public_address == other.public_address
            && self.private_address == other.private_address
    }
}

impl Eq for Instance {}

/// Set of [`Instance`]s of one deployment, unique by ID.
///
/// Insertion order is preserved. Adding an [`Instance`] with an ID already
/// present replaces the existing one in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cluster {
    instances: IndexMap<String, Instance>,
}

impl Cluster {
    /// Creates a new [`Cluster`] out of the provided [`Instance`]s.
    pub fn new(instances: impl IntoIterator<Item = Instance>) -> Self {
        Self::empty().with_instances(instances)
    }

    /// [`Cluster`] without any known running nodes.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn instances(&self) -> impl ExactSizeIterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Returns all of the [`Instance`]s matching the provided [`Predicate`].
    pub fn instances_matching<'a, P>(&'a self, predicate: &'a P) -> impl Iterator<Item = &'a Instance>
    where
        P: Predicate<Instance> + ?Sized,
    {
        self.instances.values().filter(move |i| predicate.test(i))
    }

    /// Looks up the single [`Instance`] matching the provided [`Predicate`].
    pub fn instance_matching<P>(&self, predicate: &P) -> Lookup<'_>
    where
        P: Predicate<Instance> + ?Sized,
    {
        let mut matching = self.instances.values().filter(|i| predicate.test(i));

        match (matching.next(), matching.count()) {
            (None, _) => Lookup::NotFound,
            (Some(instance), 0) => Lookup::Found(instance),
            (Some(_), rest) => Lookup::Ambiguous(rest + 1),
        }
    }

    /// Returns all of the roles assigned to the [`Instance`]s of this
    /// [`Cluster`].
    pub fn roles(&self) -> IndexSet<&str> {
        self.instances
            .values()
            .flat_map(|i| i.roles.iter().map(String::as_str))
            .collect()
    }

    pub fn with_instance(self, instance: Instance) -> Self {
        self.with_instances([instance])
    }

    /// Adds the provided [`Instance`]s, replacing the ones with the same IDs.
    pub fn with_instances(mut self, instances: impl IntoIterator<Item = Instance>) -> Self {
        for instance in instances {
            let _ = self.instances.insert(instance.id.clone(), instance);
        }
        self
    }

    /// Removes all of the [`Instance`]s matching the provided [`Predicate`].
    pub fn without_instances_matching<P>(mut self, predicate: &P) -> Self
    where
        P: Predicate<Instance> + ?Sized,
    {
        self.instances.retain(|_, i| !predicate.test(i));
        self
    }
}

impl FromIterator<Instance> for Cluster {
    fn from_iter<T: IntoIterator<Item = Instance>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Result of [`Cluster::instance_matching`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup<'a> {
    Found(&'a Instance),
    NotFound,

    /// More than one [`Instance`] matched, with the number of matches.
    Ambiguous(usize),
}

impl<'a> Lookup<'a> {
    pub fn found(self) -> Option<&'a Instance> {
        match self {
            Self::Found(instance) => Some(instance),
            Self::NotFound | Self::Ambiguous(_) => None,
        }
    }

    /// Converts this [`Lookup`] into a [`Result`], failing unless exactly one
    /// [`Instance`] matched.
    pub fn require(self) -> Result<&'a Instance, LookupError> {
        match self {
            Self::Found(instance) => Ok(instance),
            Self::NotFound => Err(LookupError::NotFound),
            Self::Ambiguous(count) => Err(LookupError::Ambiguous(count)),
        }
    }
}

/// Error of [`Lookup::require`].
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("No instance matches the predicate")]
    NotFound,

    #[error("{0} instances match the predicate, expected exactly one")]
    Ambiguous(usize),
}

/// Matches [`Instance`]s by ID.
#[derive(Clone, Debug)]
pub struct WithIds(IndexSet<String>);

impl WithIds {
    pub fn new<S: Into<String>>(ids: impl IntoIterator<Item = S>) -> Self {
        Self(ids.into_iter().map(Into::into).collect())
    }

    pub fn one(id: impl Into<String>) -> Self {
        Self::new([id])
    }
}

impl Predicate<Instance> for WithIds {
    fn test(&self, instance: &Instance) -> bool {
        self.0.contains(&instance.id)
    }
}

/// Matches [`Instance`]s having a role.
#[derive(Clone, Debug)]
pub struct WithRole(pub String);

impl Predicate<Instance> for WithRole {
    fn test(&self, instance: &Instance) -> bool {
        instance.has_role(&self.0)
    }
}

/// Matches [`Instance`]s having every one of a set of roles.
#[derive(Clone, Debug)]
pub struct WithAllRoles(IndexSet<String>);

impl WithAllRoles {
    pub fn new<S: Into<String>>(roles: impl IntoIterator<Item = S>) -> Self {
        Self(roles.into_iter().map(Into::into).collect())
    }
}

impl Predicate<Instance> for WithAllRoles {
    fn test(&self, instance: &Instance) -> bool {
        !self.0.is_empty() && self.0.iter().all(|role| instance.has_role(role))
    }
}
