//! Finding Pulumi stacks and the security groups they manage.
//!
//! Stacks deployed with the InfraUtilX blueprints export their security group id as
//! `security_group_id`; older stacks used other names, so any string output that looks like a
//! security group id under an sg-ish key is accepted as a fallback.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

/// One stack as reported by `pulumi stack ls --all --json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackSummary {
    /// `<project>/<stack>`, unless Pulumi already reported a qualified name.
    pub name: String,
    /// The stack's own name, without the project.
    #[serde(skip)]
    pub stack: String,
    pub project: String,
    pub last_update: Option<String>,
    pub resources: Option<u64>,
    /// The stack's outputs, when they have been fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedStack {
    name: Option<String>,
    project_name: Option<String>,
    last_update: Option<String>,
    resource_count: Option<u64>,
}

/// Parse `pulumi stack ls --all --json`, keeping stacks whose project starts with `project`.
///
/// Entries missing a name or project are skipped.
pub fn parse_stack_list(
    json: &[u8],
    project: Option<&str>,
) -> Result<Vec<StackSummary>, serde_json::Error> {
    let listed: Vec<ListedStack> = serde_json::from_slice(json)?;
    Ok(listed
        .into_iter()
        .filter_map(|s| {
            let (stack, project_name) = match (s.name, s.project_name) {
                (Some(n), Some(p)) if !n.is_empty() && !p.is_empty() => (n, p),
                _ => return None,
            };
            if let Some(prefix) = project {
                if !project_name.starts_with(prefix) {
                    return None;
                }
            }
            let name = if stack.contains('/') {
                stack.clone()
            } else {
                format!("{}/{}", project_name, stack)
            };
            Some(StackSummary {
                name,
                stack,
                project: project_name,
                last_update: s.last_update,
                resources: s.resource_count,
                outputs: None,
            })
        })
        .collect())
}

async fn pulumi(args: &[&str]) -> Result<Vec<u8>, String> {
    tracing::trace!(?args, "running pulumi");
    let out = tokio::process::Command::new("pulumi")
        .args(args)
        .env("PULUMI_SKIP_UPDATE_CHECK", "true")
        .output()
        .await
        .map_err(|e| format!("could not run pulumi: {}", e))?;

    if !out.status.success() {
        return Err(format!(
            "pulumi {} failed: {}",
            args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(out.stdout)
}

/// Every stack the Pulumi backend knows of, optionally only those of projects starting with
/// `project`.
#[instrument(level = "debug")]
pub async fn list_stacks(project: Option<&str>) -> Result<Vec<StackSummary>, Error> {
    let fail = |message: String| Error::Stack {
        stack: String::from("*"),
        message,
    };
    let out = pulumi(&["stack", "ls", "--all", "--json"]).await.map_err(fail)?;
    let stacks = parse_stack_list(&out, project)
        .map_err(|e| fail(format!("could not parse pulumi stack list: {}", e)))?;
    tracing::debug!(n = stacks.len(), "listed stacks");
    Ok(stacks)
}

/// The outputs of `stack`, as `pulumi stack output --json` prints them.
#[instrument(level = "debug")]
pub async fn stack_outputs(stack: &str) -> Result<Value, Error> {
    let fail = |message: String| Error::Stack {
        stack: stack.to_string(),
        message,
    };
    let out = pulumi(&["stack", "output", "--json", "--stack", stack])
        .await
        .map_err(fail)?;
    serde_json::from_slice(&out).map_err(|e| fail(format!("could not parse pulumi output: {}", e)))
}

impl StackSummary {
    /// Fetch this stack's outputs.
    ///
    /// Outside the project's directory Pulumi may only accept one of the short and the qualified
    /// name, so the short name is tried first and the qualified one second.
    pub async fn fetch_outputs(&self) -> Result<Value, Error> {
        match stack_outputs(&self.stack).await {
            Ok(v) => Ok(v),
            Err(e) if self.name != self.stack => {
                tracing::debug!(stack = %self.stack, "retrying with qualified name: {}", e);
                stack_outputs(&self.name).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Every listed stack that exports a security group, paired with that group's id.
///
/// Stacks whose outputs cannot be read are skipped with a warning.
#[instrument(level = "debug")]
pub async fn stacks_with_security_groups(
    project: Option<&str>,
) -> Result<Vec<(StackSummary, String)>, Error> {
    let mut found = Vec::new();
    for mut stack in list_stacks(project).await? {
        let outputs = match stack.fetch_outputs().await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(stack = %stack.name, "skipping stack: {}", e);
                continue;
            }
        };
        if let Some(sg) = security_group_from_outputs(&outputs) {
            stack.outputs = Some(outputs);
            found.push((stack, sg));
        } else {
            tracing::debug!(stack = %stack.name, "stack exports no security group");
        }
    }
    Ok(found)
}

/// Pick the security group id out of `pulumi stack output --json`.
pub fn security_group_from_outputs(outputs: &Value) -> Option<String> {
    let outputs = outputs.as_object()?;
    if let Some(Value::String(id)) = outputs.get("security_group_id") {
        return Some(id.clone());
    }

    // serde_json's map is sorted by key, so the fallback is deterministic
    outputs.iter().find_map(|(key, value)| {
        let key = key.to_lowercase();
        match value {
            Value::String(id)
                if (key.contains("sg") || key.contains("security")) && id.starts_with("sg-") =>
            {
                Some(id.clone())
            }
            _ => None,
        }
    })
}

/// Ask the Pulumi CLI for `stack`'s outputs and return its security group id.
#[instrument(level = "debug")]
pub async fn resolve_security_group(stack: &str) -> Result<String, Error> {
    let outputs = stack_outputs(stack).await?;
    match security_group_from_outputs(&outputs) {
        Some(id) => {
            tracing::debug!(%id, "found security group in stack outputs");
            Ok(id)
        }
        None => {
            let keys = outputs
                .as_object()
                .map(|o| o.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            Err(Error::Stack {
                stack: stack.to_string(),
                message: format!("no security group id among stack outputs [{}]", keys),
            })
        }
    }
}
