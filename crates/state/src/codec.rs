//! Line-oriented text format of the persisted cluster state.
//!
//! One line per [`Instance`]: `id`, comma-joined roles, public address and
//! private address, separated by tabs. Missing addresses are written as
//! `null`, any other field value (including an empty one) is an address.
//! Role names and IDs are not escaped, so they must not contain tabs,
//! commas or newlines.

use {
    cirrus_core::{Cluster, Credentials, Instance},
    std::sync::Arc,
};

const FIELD_SEPARATOR: char = '\t';
const ROLE_SEPARATOR: &str = ",";
const NO_ADDRESS: &str = "null";

/// Serializes the [`Cluster`] state.
pub fn serialize(cluster: &Cluster) -> String {
    let mut out = String::new();

    for instance in cluster.instances() {
        let roles: Vec<_> = instance.roles().iter().map(String::as_str).collect();

        out.push_str(instance.id());
        out.push(FIELD_SEPARATOR);
        out.push_str(&roles.join(ROLE_SEPARATOR));
        out.push(FIELD_SEPARATOR);
        out.push_str(instance.public_address().unwrap_or(NO_ADDRESS));
        out.push(FIELD_SEPARATOR);
        out.push_str(instance.private_address().unwrap_or(NO_ADDRESS));
        out.push('\n');
    }

    out
}

/// Rebuilds a [`Cluster`] out of its serialized state.
///
/// Every [`Instance`] shares the provided [`Credentials`] and has no live
/// provider record. Blank lines are skipped.
pub fn deserialize(credentials: &Arc<Credentials>, content: &str) -> Result<Cluster, CorruptError> {
    content
        .split('\n')
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            parse_line(credentials, line).map_err(|reason| CorruptError {
                line: idx + 1,
                reason,
            })
        })
        .collect()
}

fn parse_line(credentials: &Arc<Credentials>, line: &str) -> Result<Instance, &'static str> {
    let mut fields = line.split(FIELD_SEPARATOR);
    let mut next = |name| fields.next().ok_or(name);

    let id = next("missing id field").and_then(|id| {
        if id.is_empty() {
            Err("empty instance id")
        } else {
            Ok(id)
        }
    })?;
    let roles = next("missing roles field")?;
    let public_address = next("missing public address field")?;
    let private_address = next("missing private address field")?;

    let roles = roles.split(ROLE_SEPARATOR).filter(|role| !role.is_empty());

    Ok(Instance::new(id, roles, credentials.clone())
        .with_addresses(address(public_address), address(private_address)))
}

fn address(field: &str) -> Option<String> {
    (field != NO_ADDRESS).then(|| field.to_string())
}

/// Serialized state is malformed.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("Corrupt cluster state at line {line}: {reason}")]
pub struct CorruptError {
    pub line: usize,
    pub reason: &'static str,
}
