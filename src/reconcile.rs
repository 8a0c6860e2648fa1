//! Bringing a security group's ingress for one port in line with a desired source CIDR.

use crate::error::{Error, Operation};
use crate::providers::{Change, SecurityGroups};
use crate::rule::{IngressRule, Mode, Target};
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time;
use tracing::instrument;

/// Whether the provider needs to be consulted at all.
///
/// This is only a shortcut. Reconciliation is correct whether or not it is taken.
pub fn needs_update(current: Ipv4Addr, cached: Option<Ipv4Addr>) -> bool {
    cached != Some(current)
}

/// The mutations needed to move from an observed rule set to the desired one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    /// Rules to remove, in order. Always empty in [`Mode::Additive`].
    pub revoke: Vec<IngressRule>,
    /// The rule to add, if it is not already present.
    pub authorize: Option<IngressRule>,
}

impl Plan {
    /// Diff `existing` against `desired`.
    ///
    /// `existing` should already be restricted to the desired rule's port and protocol.
    pub fn new(existing: &BTreeSet<IngressRule>, desired: &IngressRule, mode: Mode) -> Self {
        let revoke = match mode {
            Mode::Strict => existing
                .iter()
                .filter(|r| r.cidr != desired.cidr)
                .cloned()
                .collect(),
            Mode::Additive => Vec::new(),
        };
        let present = existing.iter().any(|r| r.cidr == desired.cidr);
        Plan {
            revoke,
            authorize: if present { None } else { Some(desired.clone()) },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.revoke.is_empty() && self.authorize.is_none()
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Summary {
    pub revoked: Vec<IngressRule>,
    pub authorized: Option<IngressRule>,
    /// Mutations the provider reported as already done.
    pub already_in_desired_state: usize,
}

impl Summary {
    pub fn changed(&self) -> bool {
        !self.revoked.is_empty() || self.authorized.is_some()
    }
}

/// Run `fut` under `timeout`, reporting an overrun as a network failure of `op`.
pub(crate) async fn timed<T, F>(timeout: time::Duration, op: Operation, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(Error::network(
            op,
            format!("timed out after {:?}", timeout),
        )),
    }
}

/// Bring `group_id`'s ingress for `desired`'s port and protocol into the state `mode` asks for.
///
/// The provider's current rules are always read first; nothing local is trusted. Revocations
/// are issued before the authorization. Each provider call is bounded by `timeout`.
#[instrument(level = "debug", skip(groups, desired, timeout), fields(rule = %desired))]
pub async fn reconcile<G>(
    groups: &G,
    group_id: &str,
    desired: &IngressRule,
    mode: Mode,
    timeout: time::Duration,
) -> Result<Summary, Error>
where
    G: SecurityGroups + ?Sized,
{
    let existing = timed(
        timeout,
        Operation::ListRules,
        groups.list_rules(group_id, desired.from_port, desired.protocol),
    )
    .await?;
    tracing::debug!(
        existing = %existing.iter().map(|r| &r.cidr).join(", "),
        "current ingress"
    );

    let plan = Plan::new(&existing, desired, mode);
    let mut summary = Summary::default();
    if plan.is_empty() {
        tracing::info!("security group already admits only what it should");
        return Ok(summary);
    }

    for rule in plan.revoke {
        tracing::info!(cidr = %rule.cidr, "revoking ingress");
        match timed(
            timeout,
            Operation::Revoke(rule.clone()),
            groups.revoke(group_id, &rule),
        )
        .await?
        {
            Change::Applied => summary.revoked.push(rule),
            Change::AlreadyInDesiredState => {
                tracing::debug!(cidr = %rule.cidr, "rule was already gone");
                summary.already_in_desired_state += 1;
            }
        }
    }

    if let Some(rule) = plan.authorize {
        tracing::info!(cidr = %rule.cidr, "authorizing ingress");
        match timed(
            timeout,
            Operation::Authorize(rule.clone()),
            groups.authorize(group_id, &rule),
        )
        .await?
        {
            Change::Applied => summary.authorized = Some(rule),
            Change::AlreadyInDesiredState => {
                tracing::debug!(cidr = %rule.cidr, "rule was already present");
                summary.already_in_desired_state += 1;
            }
        }
    }

    Ok(summary)
}

/// Whether a given address may reach a target, and who else may.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessReport {
    /// The Pulumi stack the group was found through, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub security_group_id: String,
    pub port: u16,
    pub protocol: crate::Protocol,
    pub current_cidr: String,
    pub has_access: bool,
    pub authorized_cidrs: Vec<String>,
}

/// Read-only: report which sources `target` admits and whether `ip` is one of them.
#[instrument(level = "debug", skip(groups, timeout))]
pub async fn check_access<G>(
    groups: &G,
    target: &Target,
    ip: Ipv4Addr,
    timeout: time::Duration,
) -> Result<AccessReport, Error>
where
    G: SecurityGroups + ?Sized,
{
    let rules = timed(
        timeout,
        Operation::ListRules,
        groups.list_rules(&target.group_id, target.port, target.protocol),
    )
    .await?;

    let current_cidr = crate::ip::host_cidr(ip);
    let authorized_cidrs: Vec<String> = rules.into_iter().map(|r| r.cidr).collect();
    Ok(AccessReport {
        stack: None,
        security_group_id: target.group_id.clone(),
        port: target.port,
        protocol: target.protocol,
        has_access: authorized_cidrs.contains(&current_cidr),
        current_cidr,
        authorized_cidrs,
    })
}
