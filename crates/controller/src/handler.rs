//! Lifecycle hooks of the roles.

use {
    async_trait::async_trait,
    cirrus_core::{
        compute::{Script, Statement},
        Cluster,
        ClusterSpec,
        InstanceTemplate,
    },
    derive_more::Display,
    std::{collections::HashMap, fmt, sync::Arc},
};

/// Phase of the cluster lifecycle.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Phase {
    #[display("bootstrap")]
    Bootstrap,

    #[display("configure")]
    Configure,

    #[display("start")]
    Start,

    #[display("stop")]
    Stop,

    #[display("cleanup")]
    Cleanup,

    #[display("destroy")]
    Destroy,
}

/// Position of a hook relative to the main work of a [`Phase`].
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Stage {
    #[display("before")]
    Before,

    #[display("after")]
    After,
}

/// Context a [`Handler`] hook is invoked with.
///
/// Every role of an [`InstanceTemplate`] sees the same [`Event`], so
/// statements added by one role handler are visible to the next one.
#[derive(Debug)]
pub struct Event<'a> {
    pub phase: Phase,
    pub spec: &'a ClusterSpec,

    /// Whole [`Cluster`], so that handlers can make cross-role decisions.
    ///
    /// For [`Stage::After`] hooks this is the [`Cluster`] produced by the
    /// main work of the phase.
    pub cluster: &'a Cluster,

    /// [`InstanceTemplate`] the hook is being invoked for.
    pub template: &'a InstanceTemplate,

    script: Script,
}

impl<'a> Event<'a> {
    pub fn new(
        phase: Phase,
        spec: &'a ClusterSpec,
        cluster: &'a Cluster,
        template: &'a InstanceTemplate,
    ) -> Self {
        Self {
            phase,
            spec,
            cluster,
            template,
            script: Script::new(),
        }
    }

    /// Adds a [`Statement`] to the script of the phase.
    ///
    /// During [`Phase::Bootstrap`] the script becomes the init script of the
    /// created nodes. Otherwise it is executed on every instance having all
    /// of the roles of the [`InstanceTemplate`].
    pub fn add_statement(&mut self, statement: Statement) {
        self.script.push(statement);
    }

    /// Script collected so far.
    pub fn script(&self) -> &Script {
        &self.script
    }

    pub(crate) fn into_script(self) -> Script {
        self.script
    }
}

/// Behavior of a role.
///
/// Both hooks are invoked for every [`Phase`], a handler interested in only
/// some of them is expected to match on [`Event::phase`]. All of the
/// [`Stage::Before`] hooks of a phase complete before any of its
/// [`Stage::After`] hooks begin.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Invoked before the main work of a [`Phase`].
    async fn before(&self, _event: &mut Event<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked after the main work of a [`Phase`].
    async fn after(&self, _event: &Event<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// [`Handler`]s keyed by role name.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    tolerate_unregistered: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a [`Handler`], replacing the one previously registered for
    /// the same role.
    pub fn register(mut self, role: impl Into<String>, handler: impl Handler) -> Self {
        let _ = self.handlers.insert(role.into(), Arc::new(handler));
        self
    }

    /// Whether roles without a registered [`Handler`] are silently skipped
    /// instead of being a configuration error.
    pub fn tolerate_unregistered(mut self, value: bool) -> Self {
        self.tolerate_unregistered = value;
        self
    }

    pub fn contains(&self, role: &str) -> bool {
        self.handlers.contains_key(role)
    }

    /// Looks up the [`Handler`]s of the roles of an [`InstanceTemplate`] in
    /// the order the roles are declared.
    pub(crate) fn resolve<'a>(
        &'a self,
        template: &'a InstanceTemplate,
    ) -> Result<Vec<(&'a str, &'a Arc<dyn Handler>)>, UnknownRoleError> {
        let mut resolved = Vec::with_capacity(template.roles().len());

        for role in template.roles() {
            match self.handlers.get(role) {
                Some(handler) => resolved.push((role.as_str(), handler)),
                None if self.tolerate_unregistered => {
                    tracing::debug!(role, "No handler registered, skipping");
                }
                None => return Err(UnknownRoleError(role.clone())),
            }
        }

        Ok(resolved)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut roles: Vec<_> = self.handlers.keys().collect();
        roles.sort();

        f.debug_struct("Registry")
            .field("roles", &roles)
            .field("tolerate_unregistered", &self.tolerate_unregistered)
            .finish()
    }
}

/// A role without a registered [`Handler`].
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("No handler registered for role `{0}`")]
pub struct UnknownRoleError(pub String);

/// Failure of a [`Handler`] hook.
#[derive(Debug, thiserror::Error)]
#[error("`{role}` handler failed {stage} {phase}")]
pub struct Error {
    pub role: String,
    pub phase: Phase,
    pub stage: Stage,

    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    pub(crate) fn new(role: &str, phase: Phase, stage: Stage, source: anyhow::Error) -> Self {
        Self {
            role: role.to_string(),
            phase,
            stage,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, cirrus_core::Credentials};

    struct Noop;

    impl Handler for Noop {}

    #[test]
    fn resolve_in_declaration_order() {
        let registry = Registry::new()
            .register("datanode", Noop)
            .register("namenode", Noop);

        let template = InstanceTemplate::new(1, ["namenode", "datanode"]);
        let roles: Vec<_> = registry
            .resolve(&template)
            .unwrap()
            .into_iter()
            .map(|(role, _)| role)
            .collect();

        assert_eq!(roles, ["namenode", "datanode"]);
    }

    #[test]
    fn unregistered_roles() {
        let registry = Registry::new().register("namenode", Noop);
        let template = InstanceTemplate::new(1, ["namenode", "ganglia"]);

        assert_eq!(
            registry.resolve(&template).err(),
            Some(UnknownRoleError("ganglia".into()))
        );

        let registry = registry.tolerate_unregistered(true);
        assert_eq!(registry.resolve(&template).unwrap().len(), 1);
    }

    #[test]
    fn statements_accumulate() {
        let spec = ClusterSpec::new("hadoop", Credentials::new("cirrus", "key"));
        let cluster = Cluster::empty();
        let template = InstanceTemplate::new(1, ["namenode"]);

        let mut event = Event::new(Phase::Configure, &spec, &cluster, &template);
        event.add_statement(Statement::new("a", "echo a"));
        event.add_statement(Statement::new("b", "echo b"));

        assert_eq!(event.script().statements().len(), 2);
        assert_eq!(event.into_script().statements()[1].name, "b");
    }

    #[test]
    fn display() {
        assert_eq!(Phase::Cleanup.to_string(), "cleanup");

        let err = Error::new(
            "namenode",
            Phase::Start,
            Stage::Before,
            anyhow::anyhow!("boom"),
        );
        assert_eq!(err.to_string(), "`namenode` handler failed before start");
    }
}
