use {
    crate::config::RoleConfig,
    async_trait::async_trait,
    cirrus_controller::{Event, Handler},
    cirrus_core::compute::Statement,
    std::fmt::Write as _,
};

/// [`Handler`] of a role configured via the `[roles.<name>]` tables.
///
/// Contributes the configured script of a phase, prefixed with the exports
/// describing the cluster, to every node having the role.
#[derive(Clone, Debug)]
pub struct ScriptHandler {
    role: String,
    scripts: RoleConfig,
}

impl ScriptHandler {
    pub fn new(role: impl Into<String>, scripts: RoleConfig) -> Self {
        Self {
            role: role.into(),
            scripts,
        }
    }

    fn render(&self, event: &Event<'_>, script: &str) -> String {
        let mut body = String::new();

        export(&mut body, "CIRRUS_CLUSTER_NAME", &event.spec.cluster_name);
        export(&mut body, "CIRRUS_ROLE", &self.role);

        for role in event.cluster.roles() {
            let addresses: Vec<_> = event
                .cluster
                .instances()
                .filter(|instance| instance.has_role(role))
                .filter_map(|instance| instance.private_address().or(instance.public_address()))
                .collect();

            let var = format!("CIRRUS_ROLE_{}_ADDRESSES", env_name(role));
            export(&mut body, &var, &addresses.join(","));
        }

        if let Some(params) = event.spec.role_parameters(&self.role) {
            for (name, value) in params {
                export(&mut body, &env_name(name), value);
            }
        }

        body.push_str(script);
        body
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn before(&self, event: &mut Event<'_>) -> anyhow::Result<()> {
        let Some(script) = self.scripts.script(event.phase) else {
            return Ok(());
        };

        let statement = Statement::new(
            format!("{}-{}", self.role, event.phase),
            self.render(event, script),
        );

        tracing::debug!(role = %self.role, phase = %event.phase, "Adding script");

        event.add_statement(statement);
        Ok(())
    }
}

fn export(body: &mut String, name: &str, value: &str) {
    let _ = writeln!(body, "export {name}='{}'", value.replace('\'', r"'\''"));
}

/// Upper-cases the name, replacing everything but ASCII alphanumerics with
/// `_`.
fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c.to_ascii_uppercase(),
            _ => '_',
        })
        .collect()
}
