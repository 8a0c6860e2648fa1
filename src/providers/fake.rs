//! In-memory provider for exercising the reconciler without cloud credentials.

use super::{Change, SecurityGroups};
use crate::error::{Error, Operation};
use crate::rule::{IngressRule, Protocol};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    List(String),
    Authorize(String, IngressRule),
    Revoke(String, IngressRule),
}

impl Call {
    pub(crate) fn is_mutation(&self) -> bool {
        !matches!(self, Call::List(_))
    }
}

#[derive(Debug, Default)]
struct Inner {
    groups: HashMap<String, BTreeSet<IngressRule>>,
    calls: Vec<Call>,
    // when set, list_rules answers with this instead of the real rules
    stale_listing: Option<BTreeSet<IngressRule>>,
    fail_authorize: bool,
    fail_revoke: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FakeGroups {
    inner: Mutex<Inner>,
}

impl FakeGroups {
    pub(crate) fn with_rules<I>(group_id: &str, cidrs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let f = FakeGroups::default();
        f.insert(group_id, cidrs);
        f
    }

    pub(crate) fn insert<I>(&self, group_id: &str, cidrs: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut inner = self.inner.lock().unwrap();
        let rules = inner.groups.entry(group_id.to_string()).or_default();
        rules.extend(
            cidrs
                .into_iter()
                .map(|c| IngressRule::new(Protocol::Tcp, 22, c)),
        );
    }

    pub(crate) fn add_rule(&self, group_id: &str, rule: IngressRule) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .groups
            .entry(group_id.to_string())
            .or_default()
            .insert(rule);
    }

    pub(crate) fn rules(&self, group_id: &str) -> BTreeSet<IngressRule> {
        let inner = self.inner.lock().unwrap();
        inner.groups.get(group_id).cloned().unwrap_or_default()
    }

    pub(crate) fn cidrs(&self, group_id: &str, port: u16, protocol: Protocol) -> Vec<String> {
        self.rules(group_id)
            .into_iter()
            .filter(|r| r.matches(port, protocol))
            .map(|r| r.cidr)
            .collect()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub(crate) fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub(crate) fn stale_listing<I>(&self, cidrs: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.inner.lock().unwrap().stale_listing = Some(
            cidrs
                .into_iter()
                .map(|c| IngressRule::new(Protocol::Tcp, 22, c))
                .collect(),
        );
    }

    pub(crate) fn fail_authorize(&self) {
        self.inner.lock().unwrap().fail_authorize = true;
    }

    pub(crate) fn fail_revoke(&self) {
        self.inner.lock().unwrap().fail_revoke = true;
    }
}

impl SecurityGroups for FakeGroups {
    fn list_rules<'l>(
        &'l self,
        group_id: &'l str,
        port: u16,
        protocol: Protocol,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<IngressRule>, Error>> + Send + 'l>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::List(group_id.to_string()));
            let rules = match inner.stale_listing {
                Some(ref stale) => stale.clone(),
                None => match inner.groups.get(group_id) {
                    Some(rules) => rules.clone(),
                    None => {
                        return Err(Error::provider(
                            Operation::ListRules,
                            group_id,
                            "InvalidGroup.NotFound",
                        ))
                    }
                },
            };
            Ok(rules
                .into_iter()
                .filter(|r| r.matches(port, protocol))
                .collect())
        })
    }

    fn authorize<'l>(
        &'l self,
        group_id: &'l str,
        rule: &'l IngressRule,
    ) -> Pin<Box<dyn Future<Output = Result<Change, Error>> + Send + 'l>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner
                .calls
                .push(Call::Authorize(group_id.to_string(), rule.clone()));
            if inner.fail_authorize {
                return Err(Error::provider(
                    Operation::Authorize(rule.clone()),
                    group_id,
                    "UnauthorizedOperation",
                ));
            }
            let rules = inner.groups.entry(group_id.to_string()).or_default();
            if rules.insert(rule.clone()) {
                Ok(Change::Applied)
            } else {
                Ok(Change::AlreadyInDesiredState)
            }
        })
    }

    fn revoke<'l>(
        &'l self,
        group_id: &'l str,
        rule: &'l IngressRule,
    ) -> Pin<Box<dyn Future<Output = Result<Change, Error>> + Send + 'l>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner
                .calls
                .push(Call::Revoke(group_id.to_string(), rule.clone()));
            if inner.fail_revoke {
                return Err(Error::provider(
                    Operation::Revoke(rule.clone()),
                    group_id,
                    "UnauthorizedOperation",
                ));
            }
            let rules = inner.groups.entry(group_id.to_string()).or_default();
            if rules.remove(rule) {
                Ok(Change::Applied)
            } else {
                Ok(Change::AlreadyInDesiredState)
            }
        })
    }
}
