use {
    crate::handler::ScriptHandler,
    cirrus_byon::Host,
    cirrus_controller::{Phase, Registry},
    cirrus_core::{
        spec::{ParseTemplateError, ProviderSpec, StateStoreKind},
        ClusterSpec,
        Credentials,
        InstanceTemplate,
    },
    serde::Deserialize,
    std::{
        collections::{BTreeMap, HashMap},
        io,
        path::{Path, PathBuf},
    },
};

/// Environment variables overriding the configuration keys.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("CIRRUS_CLUSTER_NAME", "cluster-name"),
    ("CIRRUS_CLUSTER_USER", "cluster-user"),
    ("CIRRUS_PRIVATE_KEY_FILE", "private-key-file"),
    ("CIRRUS_INSTANCE_TEMPLATES", "instance-templates"),
    (
        "CIRRUS_INSTANCE_TEMPLATES_MINIMUM_NUMBER_OF_INSTANCES",
        "instance-templates-minimum-number-of-instances",
    ),
    ("CIRRUS_PROVIDER", "provider.name"),
    ("CIRRUS_IDENTITY", "provider.identity"),
    ("CIRRUS_CREDENTIAL", "provider.credential"),
    (
        "CIRRUS_TERMINATE_ALL_ON_LAUNCH_FAILURE",
        "terminate-all-on-launch-failure",
    ),
    ("CIRRUS_STATE_STORE", "state-store"),
    ("CIRRUS_STATE_STORE_DIR", "state-store-dir"),
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("`cluster-name` is not configured")]
    MissingClusterName,

    #[error("`instance-templates` is not configured")]
    MissingTemplates,

    #[error("Failed to read private key file `{path}`: {source}")]
    PrivateKey { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Templates(#[from] ParseTemplateError),
}

/// Cluster configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub cluster_name: String,
    pub cluster_user: String,
    pub private_key_file: PathBuf,

    /// E.g. `"1 namenode+jobtracker, 3 datanode+tasktracker"`.
    pub instance_templates: String,

    /// Minimum number of nodes per template, in the same format as
    /// `instance-templates`.
    pub instance_templates_minimum_number_of_instances: Option<String>,

    /// Provider hints keyed by the roles of a template, e.g.
    /// `[templates."datanode+tasktracker"]`.
    #[serde(default)]
    pub templates: HashMap<String, TemplateHints>,

    pub provider: ProviderSpec,
    pub firewall_rules: Vec<String>,
    pub terminate_all_on_launch_failure: bool,
    pub state_store: StateStoreKind,
    pub state_store_dir: Option<PathBuf>,
    pub tolerate_unregistered_roles: bool,

    #[serde(default)]
    pub roles: HashMap<String, RoleConfig>,

    /// Host pool of the `byon` provider.
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// Provider hints of an instance template.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TemplateHints {
    pub hardware: Option<String>,
    pub image: Option<String>,
    pub location: Option<String>,
}

/// Parameters and per-phase scripts of a role.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RoleConfig {
    /// Exported into the environment of the role scripts.
    pub parameters: BTreeMap<String, String>,

    pub bootstrap: Option<String>,
    pub configure: Option<String>,
    pub start: Option<String>,
    pub stop: Option<String>,
    pub cleanup: Option<String>,
    pub destroy: Option<String>,
}

impl RoleConfig {
    pub fn script(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::Bootstrap => self.bootstrap.as_deref(),
            Phase::Configure => self.configure.as_deref(),
            Phase::Start => self.start.as_deref(),
            Phase::Stop => self.stop.as_deref(),
            Phase::Cleanup => self.cleanup.as_deref(),
            Phase::Destroy => self.destroy.as_deref(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, Error> {
        Self::load(path, |var| std::env::var(var).ok())
    }

    /// Loads the TOML file layered over the defaults, then applies the
    /// overrides found by `env`.
    pub fn load(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::File::from_str(
                include_str!("../default_config.toml"),
                ::config::FileFormat::Toml,
            ))
            .add_source(
                ::config::File::from(path.to_path_buf())
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );

        for &(var, key) in ENV_OVERRIDES {
            builder = builder.set_override_option(key, env(var))?;
        }

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Builds the [`ClusterSpec`], reading the private key file.
    pub fn spec(&self) -> Result<ClusterSpec, Error> {
        if self.cluster_name.is_empty() {
            return Err(Error::MissingClusterName);
        }

        let mut templates = InstanceTemplate::parse_list(&self.instance_templates)?;
        if templates.is_empty() {
            return Err(Error::MissingTemplates);
        }

        if let Some(minimums) = &self.instance_templates_minimum_number_of_instances {
            InstanceTemplate::apply_minimums(&mut templates, minimums)?;
        }

        for (key, hints) in &self.templates {
            let roles: Vec<_> = key.split('+').map(str::trim).collect();
            let template = templates
                .iter_mut()
                .find(|t| t.roles().len() == roles.len() && roles.iter().all(|r| t.has_role(r)))
                .ok_or_else(|| ParseTemplateError::UnknownTemplate(key.clone()))?;

            template.hardware.clone_from(&hints.hardware);
            template.image.clone_from(&hints.image);
            template.location.clone_from(&hints.location);
        }

        let path = expand_home(&self.private_key_file);
        let private_key = std::fs::read_to_string(&path)
            .map_err(|source| Error::PrivateKey { path, source })?;

        let mut spec = ClusterSpec::new(
            &self.cluster_name,
            Credentials::new(&self.cluster_user, private_key),
        )
        .with_templates(templates);

        spec.provider = self.provider.clone();
        spec.firewall_rules = self.firewall_rules.clone();
        spec.terminate_all_on_launch_failure = self.terminate_all_on_launch_failure;
        spec.state_store = self.state_store;
        spec.state_store_dir = self.state_store_dir.as_deref().map(expand_home);
        spec.role_parameters = self
            .roles
            .iter()
            .map(|(role, cfg)| (role.clone(), cfg.parameters.clone()))
            .collect();

        Ok(spec)
    }

    /// Builds the [`Registry`] of the configured roles.
    pub fn registry(&self) -> Registry {
        self.roles.iter().fold(
            Registry::new().tolerate_unregistered(self.tolerate_unregistered_roles),
            |registry, (role, cfg)| registry.register(role, ScriptHandler::new(role, cfg.clone())),
        )
    }
}

/// Expands a leading `~` into the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
