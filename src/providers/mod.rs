//! Cloud providers that own security groups.
//!
//! The reconciler only ever needs three calls from a provider: list the rules on a port, add a
//! rule, and remove a rule. Implement [`SecurityGroups`] to plug in a new one.

use crate::error::Error;
use crate::rule::{IngressRule, Protocol};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

/// What a mutating call did to the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// The provider changed the rule set.
    Applied,
    /// The provider reported the rule was already there (authorize) or already gone (revoke).
    AlreadyInDesiredState,
}

/// Narrow access to a provider's security groups.
pub trait SecurityGroups {
    /// The ingress rules on `group_id` that cover exactly `port` over `protocol`.
    fn list_rules<'l>(
        &'l self,
        group_id: &'l str,
        port: u16,
        protocol: Protocol,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<IngressRule>, Error>> + Send + 'l>>;

    /// Admit `rule` on `group_id`.
    ///
    /// Implementations report a duplicate rule as `Ok(Change::AlreadyInDesiredState)`.
    fn authorize<'l>(
        &'l self,
        group_id: &'l str,
        rule: &'l IngressRule,
    ) -> Pin<Box<dyn Future<Output = Result<Change, Error>> + Send + 'l>>;

    /// Remove `rule` from `group_id`.
    ///
    /// Implementations report a missing rule as `Ok(Change::AlreadyInDesiredState)`.
    fn revoke<'l>(
        &'l self,
        group_id: &'l str,
        rule: &'l IngressRule,
    ) -> Pin<Box<dyn Future<Output = Result<Change, Error>> + Send + 'l>>;
}

#[cfg(feature = "aws")]
pub mod aws;

#[cfg(test)]
pub(crate) mod fake;
