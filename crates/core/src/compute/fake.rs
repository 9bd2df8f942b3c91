//! In-memory [`Compute`] provider for tests.

use {
    super::{
        Compute,
        Connector,
        Error,
        ExecResponse,
        NodeMetadata,
        NodeState,
        NodeTemplate,
        Result,
        RunScriptOptions,
        Script,
    },
    crate::{predicate::Predicate, spec::ClusterSpec},
    indexmap::IndexMap,
    std::sync::{Arc, Mutex, MutexGuard},
};

/// Script execution recorded by the fake [`Provider`].
#[derive(Clone, Debug)]
pub struct Execution {
    pub node_id: String,
    pub script: Script,
    pub options: RunScriptOptions,
}

/// Fake provider keeping its nodes in memory.
///
/// Clones share the same state, so a test may keep a handle for inspection
/// while the code under test owns another one.
#[derive(Clone, Default)]
pub struct Provider {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    next_node_id: u32,
    nodes: IndexMap<String, NodeMetadata>,
    executions: Vec<Execution>,
    node_templates: Vec<NodeTemplate>,
    destroyed: Vec<String>,

    creation_limit: Option<usize>,
    fail_creation: bool,
    fail_destruction: bool,
    fail_scripts_containing: Option<String>,
}

impl Provider {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Adds an already existing node.
    pub fn add_node(&self, node: NodeMetadata) {
        let _ = self.inner().nodes.insert(node.id.clone(), node);
    }

    /// Changes the state of a node.
    pub fn set_node_state(&self, id: &str, state: NodeState) {
        if let Some(node) = self.inner().nodes.get_mut(id) {
            node.state = state;
        }
    }

    /// Returns all of the nodes that haven't been destroyed.
    pub fn nodes(&self) -> Vec<NodeMetadata> {
        self.inner().nodes.values().cloned().collect()
    }

    /// Returns IDs of the destroyed nodes in the order of destruction.
    pub fn destroyed(&self) -> Vec<String> {
        self.inner().destroyed.clone()
    }

    /// Returns all of the recorded script executions, including the init
    /// scripts of the created nodes.
    pub fn executions(&self) -> Vec<Execution> {
        self.inner().executions.clone()
    }

    /// Returns the templates of all of the [`Compute::create_nodes`] calls.
    pub fn node_templates(&self) -> Vec<NodeTemplate> {
        self.inner().node_templates.clone()
    }

    /// Makes every subsequent [`Compute::create_nodes`] call create at most
    /// `limit` nodes.
    pub fn limit_creation(&self, limit: usize) {
        self.inner().creation_limit = Some(limit);
    }

    /// Makes every subsequent [`Compute::create_nodes`] call fail.
    pub fn fail_creation(&self) {
        self.inner().fail_creation = true;
    }

    /// Makes every subsequent [`Compute::destroy_node`] call fail.
    pub fn fail_destruction(&self) {
        self.inner().fail_destruction = true;
    }

    /// Makes scripts containing the provided pattern exit with a non-zero
    /// status.
    pub fn fail_scripts_containing(&self, pattern: impl Into<String>) {
        self.inner().fail_scripts_containing = Some(pattern.into());
    }
}

impl Compute for Provider {
    async fn create_nodes(
        &self,
        group: &str,
        count: usize,
        template: &NodeTemplate,
    ) -> Result<Vec<NodeMetadata>> {
        let mut this = self.inner();

        if this.fail_creation {
            return Err(Error::Creation {
                group: group.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        this.node_templates.push(template.clone());

        let count = this.creation_limit.map_or(count, |limit| count.min(limit));

        let nodes: Vec<_> = (0..count)
            .map(|_| {
                this.next_node_id += 1;
                let n = this.next_node_id;

                NodeMetadata {
                    id: format!("node-{n}"),
                    group: Some(group.to_string()),
                    state: NodeState::Running,
                    hostname: Some(format!("{group}-{n}")),
                    public_addresses: vec![format!("203.0.113.{n}")],
                    private_addresses: vec![format!("10.0.0.{n}")],
                }
            })
            .collect();

        for node in &nodes {
            let _ = this.nodes.insert(node.id.clone(), node.clone());

            if !template.init_script.is_empty() {
                this.executions.push(Execution {
                    node_id: node.id.clone(),
                    script: template.init_script.clone(),
                    options: RunScriptOptions::default().wrap_in_init_script(true),
                });
            }
        }

        Ok(nodes)
    }

    async fn list_nodes(
        &self,
        predicate: &dyn Predicate<NodeMetadata>,
    ) -> Result<Vec<NodeMetadata>> {
        Ok(self
            .inner()
            .nodes
            .values()
            .filter(|node| predicate.test(node))
            .cloned()
            .collect())
    }

    async fn destroy_node(&self, id: &str) -> Result<()> {
        let mut this = self.inner();

        if this.fail_destruction {
            return Err(Error::Destruction {
                id: id.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        if this.nodes.shift_remove(id).is_some() {
            this.destroyed.push(id.to_string());
        }

        Ok(())
    }

    async fn run_script(
        &self,
        id: &str,
        script: &Script,
        options: &RunScriptOptions,
    ) -> Result<ExecResponse> {
        let mut this = self.inner();

        if !this.nodes.contains_key(id) {
            return Err(Error::Script {
                id: id.to_string(),
                reason: "unknown node".to_string(),
            });
        }

        this.executions.push(Execution {
            node_id: id.to_string(),
            script: script.clone(),
            options: options.clone(),
        });

        let rendered = script.render();
        let failed = this
            .fail_scripts_containing
            .as_deref()
            .is_some_and(|pattern| rendered.contains(pattern));

        Ok(if failed {
            ExecResponse {
                exit_status: 1,
                output: String::new(),
                error: "injected failure".to_string(),
            }
        } else {
            ExecResponse {
                exit_status: 0,
                output: rendered,
                error: String::new(),
            }
        })
    }
}

impl Connector for Provider {
    type Compute = Provider;

    async fn connect(&self, _spec: &ClusterSpec) -> Result<Self::Compute> {
        Ok(self.clone())
    }
}
