//! "Bring your own nodes" provider.
//!
//! Nodes are a static pool of already running hosts, each dedicated to a
//! group. Creating nodes hands out the free hosts of the group, destroying a
//! node only returns it to the pool. Scripts are executed over `ssh`.

use {
    cirrus_core::{
        compute::{
            self,
            Error,
            ExecResponse,
            NodeMetadata,
            NodeState,
            NodeTemplate,
            Result,
            RunScriptOptions,
            Script,
        },
        ClusterSpec,
        Credentials,
        Predicate,
    },
    indexmap::IndexSet,
    serde::{Deserialize, Serialize},
    std::sync::{Arc, Mutex, MutexGuard, PoisonError},
};

mod ssh;

pub const PROVIDER_NAME: &str = "byon";

/// Host of the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Host {
    pub id: String,

    /// Group (cluster name) this host is dedicated to.
    pub group: String,

    pub hostname: Option<String>,
    pub public_address: Option<String>,
    pub private_address: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Labels matched against the hints of a [`NodeTemplate`]. A host
    /// without a label satisfies no hint for it.
    pub hardware: Option<String>,
    pub image: Option<String>,
    pub location: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Host {
    fn to_node(&self) -> NodeMetadata {
        NodeMetadata {
            id: self.id.clone(),
            group: Some(self.group.clone()),
            state: NodeState::Running,
            hostname: self.hostname.clone(),
            public_addresses: self.public_address.iter().cloned().collect(),
            private_addresses: self.private_address.iter().cloned().collect(),
        }
    }

    fn satisfies(&self, template: &NodeTemplate) -> bool {
        let matches = |hint: &Option<String>, label: &Option<String>| {
            hint.is_none() || hint.as_deref() == label.as_deref()
        };

        matches(&template.hardware, &self.hardware)
            && matches(&template.image, &self.image)
            && matches(&template.location, &self.location)
    }

    /// Address `ssh` connects to.
    fn ssh_address(&self) -> Option<&str> {
        self.public_address
            .as_deref()
            .or(self.private_address.as_deref())
            .or(self.hostname.as_deref())
    }
}

/// [`compute::Connector`] to a pool of hosts.
///
/// All of the [`Compute`]s created by the same [`Connector`] share the
/// allocations.
#[derive(Clone, Debug)]
pub struct Connector {
    hosts: Arc<[Host]>,
    allocated: Arc<Mutex<IndexSet<String>>>,
}

impl Connector {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self {
            hosts: hosts.into(),
            allocated: Arc::default(),
        }
    }
}

impl compute::Connector for Connector {
    type Compute = Compute;

    async fn connect(&self, spec: &ClusterSpec) -> Result<Compute> {
        if !spec.provider.name.is_empty() && spec.provider.name != PROVIDER_NAME {
            return Err(Error::Connection {
                provider: spec.provider.name.clone(),
                reason: format!("only `{PROVIDER_NAME}` is supported"),
            });
        }

        Ok(Compute {
            hosts: self.hosts.clone(),
            allocated: self.allocated.clone(),
            credentials: spec.credentials.clone(),
        })
    }
}

/// [`compute::Compute`] over a pool of hosts.
#[derive(Clone, Debug)]
pub struct Compute {
    hosts: Arc<[Host]>,
    allocated: Arc<Mutex<IndexSet<String>>>,
    credentials: Arc<Credentials>,
}

impl Compute {
    fn allocated(&self) -> MutexGuard<'_, IndexSet<String>> {
        self.allocated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host(&self, id: &str) -> Option<&Host> {
        self.hosts.iter().find(|host| host.id == id)
    }

    fn allocate(&self, group: &str, count: usize, template: &NodeTemplate) -> Vec<Host> {
        let mut allocated = self.allocated();

        let hosts: Vec<_> = self
            .hosts
            .iter()
            .filter(|host| host.group == group && !allocated.contains(&host.id))
            .filter(|host| host.satisfies(template))
            .take(count)
            .cloned()
            .collect();

        for host in &hosts {
            let _ = allocated.insert(host.id.clone());
        }

        hosts
    }

    fn release(&self, id: &str) -> bool {
        self.allocated().shift_remove(id)
    }
}

impl compute::Compute for Compute {
    async fn create_nodes(
        &self,
        group: &str,
        count: usize,
        template: &NodeTemplate,
    ) -> Result<Vec<NodeMetadata>> {
        let hosts = self.allocate(group, count, template);

        if hosts.is_empty() && count > 0 {
            return Err(Error::Creation {
                group: group.to_string(),
                reason: "no free hosts left in the pool".to_string(),
            });
        }

        if hosts.len() < count {
            tracing::warn!(
                group,
                requested = count,
                available = hosts.len(),
                "Not enough free hosts in the pool"
            );
        }

        let mut nodes = Vec::with_capacity(hosts.len());

        for host in hosts {
            if !template.init_script.is_empty() {
                let options = RunScriptOptions {
                    credentials: template.credentials.clone(),
                    wrap_in_init_script: true,
                    task_name: Some("bootstrap".to_string()),
                    ..Default::default()
                };

                match self.exec(&host, &template.init_script, &options).await {
                    Ok(resp) if resp.is_success() => {}
                    Ok(resp) => {
                        tracing::warn!(
                            host = %host.id,
                            status = resp.exit_status,
                            stderr = %resp.error,
                            "Init script failed"
                        );
                        let _ = self.release(&host.id);
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(host = %host.id, %err, "Init script failed");
                        let _ = self.release(&host.id);
                        continue;
                    }
                }
            }

            nodes.push(host.to_node());
        }

        Ok(nodes)
    }

    async fn list_nodes(
        &self,
        predicate: &dyn Predicate<NodeMetadata>,
    ) -> Result<Vec<NodeMetadata>> {
        Ok(self
            .hosts
            .iter()
            .map(Host::to_node)
            .filter(|node| predicate.test(node))
            .collect())
    }

    async fn destroy_node(&self, id: &str) -> Result<()> {
        if self.release(id) {
            tracing::info!(id, "Host returned to the pool, it keeps running");
        }

        Ok(())
    }

    async fn run_script(
        &self,
        id: &str,
        script: &Script,
        options: &RunScriptOptions,
    ) -> Result<ExecResponse> {
        let host = self.host(id).ok_or_else(|| Error::Script {
            id: id.to_string(),
            reason: "unknown host".to_string(),
        })?;

        self.exec(host, script, options).await
    }
}

impl Compute {
    async fn exec(
        &self,
        host: &Host,
        script: &Script,
        options: &RunScriptOptions,
    ) -> Result<ExecResponse> {
        let script_error = |reason: String| Error::Script {
            id: host.id.clone(),
            reason,
        };

        let address = host
            .ssh_address()
            .ok_or_else(|| script_error("host has no address".to_string()))?;

        let credentials = options.credentials.as_ref().unwrap_or(&self.credentials);

        let target = ssh::Target {
            address,
            port: host.ssh_port,
            credentials,
        };

        ssh::exec(&target, script, options)
            .await
            .map_err(|err| script_error(err.to_string()))
    }
}
