//! `ipgate` keeps a cloud security group's ingress pointed at the public IP you are currently
//! connecting from.
//!
//! Most interaction with this library happens through [`Reconciler`], which strings together the
//! pieces of one invocation:
//!
//! 1. resolve the caller's public IP ([`ip::IpSource`]),
//! 2. skip everything if it matches the last IP we reconciled for, in a mode at least as strict
//!    as this one ([`cache::IpCache`]),
//! 3. otherwise read the group's current rules from the provider
//!    ([`providers::SecurityGroups`]), diff them against the desired `<ip>/32`, and issue the
//!    revocations and authorization that close the gap ([`reconcile()`]),
//! 4. remember the IP.
//!
//! The provider is the only source of truth for what the group admits. The cache only decides
//! whether it is worth asking.
//!
//! # Example
//!
//! ```rust,no_run
//! use ipgate::cache::FileCache;
//! use ipgate::ip::EchoService;
//! use ipgate::providers::aws::AwsGroups;
//! use ipgate::{Mode, Reconciler, Target};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), color_eyre::Report> {
//!     let ec2 = AwsGroups::default().connect()?;
//!     let target = Target::ssh("sg-0123456789abcdef0");
//!     let cache = FileCache::new("/tmp/ipgate-last-ip");
//!
//!     let mut r = Reconciler::new(ec2, EchoService::default(), cache).mode(Mode::Strict);
//!     println!("{}", r.run(&target).await?);
//!     Ok(())
//! }
//! ```

use std::net::Ipv4Addr;
use std::time;
use tracing::instrument;

pub mod cache;
mod error;
pub mod ip;
pub mod providers;
mod reconcile;
mod rule;
pub mod stack;

pub use error::{Error, Operation};
pub use reconcile::{check_access, needs_update, reconcile, AccessReport, Plan, Summary};
pub use rule::{IngressRule, Mode, Protocol, Target};

use cache::{IpCache, Synced};
use ip::IpSource;
use providers::SecurityGroups;

/// Default bound on each network call.
pub const DEFAULT_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// What one [`Reconciler::run`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The IP matched the cache, so the provider was not consulted.
    Unchanged { ip: Ipv4Addr },
    /// The provider was consulted and now admits `ip`.
    Reconciled { ip: Ipv4Addr, summary: Summary },
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Unchanged { ip } => write!(f, "{} unchanged since last sync", ip),
            Outcome::Reconciled { ip, summary } if !summary.changed() => {
                write!(f, "{} already has access, no changes made", ip)
            }
            Outcome::Reconciled { ip, summary } => {
                write!(f, "{} now has access", ip)?;
                if !summary.revoked.is_empty() {
                    write!(f, " (revoked {} other rule", summary.revoked.len())?;
                    if summary.revoked.len() != 1 {
                        write!(f, "s")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

/// Drives one reconciliation of a [`Target`] against the caller's current IP.
///
/// Configure with the builder methods, then call [`run`](Reconciler::run).
pub struct Reconciler<G, S, C> {
    groups: G,
    ip_source: S,
    cache: C,
    mode: Mode,
    timeout: time::Duration,
    force: bool,
}

impl<G, S, C> Reconciler<G, S, C>
where
    G: SecurityGroups,
    S: IpSource,
    C: IpCache,
{
    pub fn new(groups: G, ip_source: S, cache: C) -> Self {
        Reconciler {
            groups,
            ip_source,
            cache,
            mode: Mode::default(),
            timeout: DEFAULT_TIMEOUT,
            force: false,
        }
    }

    /// Whether to revoke other sources. Defaults to [`Mode::Strict`].
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Bound each provider call by `t`. Defaults to [`DEFAULT_TIMEOUT`].
    pub fn timeout(mut self, t: time::Duration) -> Self {
        self.timeout = t;
        self
    }

    /// Consult the provider even if the IP has not changed since the last run.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn groups(&self) -> &G {
        &self.groups
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Resolve the current IP and bring `target` in line with it.
    ///
    /// The cache is only written once every mutation has succeeded. If this returns an error,
    /// the rule set may be partially updated; running again is always safe.
    #[instrument(level = "debug", skip(self), fields(mode = %self.mode))]
    pub async fn run(&mut self, target: &Target) -> Result<Outcome, Error> {
        let ip = self.ip_source.resolve().await?;
        tracing::info!(%ip, "resolved public ip");

        let cached = self.cache.get();
        let cached_ip = cached.and_then(|c| c.ip_for(self.mode));
        if !self.force && !needs_update(ip, cached_ip) {
            tracing::info!(%ip, "ip unchanged since last sync, skipping");
            return Ok(Outcome::Unchanged { ip });
        }
        match cached {
            Some(old) if cached_ip.is_none() => {
                tracing::debug!(%old, mode = %self.mode, "cached sync was in a weaker mode")
            }
            Some(old) if old.ip != ip => tracing::debug!(%old, new = %ip, "cached ip differs"),
            _ => {}
        }

        let desired = target.desired_rule(ip);
        let summary = reconcile(
            &self.groups,
            &target.group_id,
            &desired,
            self.mode,
            self.timeout,
        )
        .await?;

        self.cache.set(Synced {
            ip,
            mode: self.mode,
        })?;
        Ok(Outcome::Reconciled { ip, summary })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::FileCache;
    use crate::providers::fake::{Call, FakeGroups};
    use std::future::Future;
    use std::pin::Pin;

    const SG: &str = "sg-0123456789abcdef0";

    struct FixedIp(Option<Ipv4Addr>);

    impl IpSource for FixedIp {
        fn resolve<'l>(
            &'l self,
        ) -> Pin<Box<dyn Future<Output = Result<Ipv4Addr, Error>> + Send + 'l>> {
            Box::pin(async move {
                self.0
                    .ok_or_else(|| Error::network(Operation::ResolveIp, "unreachable"))
            })
        }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn strict_sync_from_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_ip");
        let groups = FakeGroups::with_rules(SG, vec!["10.0.0.5/32"]);

        let mut r = Reconciler::new(groups, FixedIp(Some(ip("203.0.113.9"))), FileCache::new(&path))
            .mode(Mode::Strict);
        let out = r.run(&Target::ssh(SG)).await.unwrap();

        assert_eq!(
            r.groups().mutations(),
            vec![
                Call::Revoke(SG.into(), IngressRule::new(Protocol::Tcp, 22, "10.0.0.5/32")),
                Call::Authorize(SG.into(), IngressRule::new(Protocol::Tcp, 22, "203.0.113.9/32")),
            ]
        );
        assert_eq!(r.groups().cidrs(SG, 22, Protocol::Tcp), vec!["203.0.113.9/32"]);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().trim(),
            "203.0.113.9 strict"
        );
        assert_eq!(out.to_string(), "203.0.113.9 now has access (revoked 1 other rule)");
    }

    #[tokio::test]
    async fn cache_hit_makes_no_provider_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_ip");
        std::fs::write(&path, "203.0.113.9 strict\n").unwrap();
        let groups = FakeGroups::with_rules(SG, vec!["10.0.0.5/32"]);

        let mut r = Reconciler::new(groups, FixedIp(Some(ip("203.0.113.9"))), FileCache::new(&path));
        let out = r.run(&Target::ssh(SG)).await.unwrap();

        assert_eq!(out, Outcome::Unchanged { ip: ip("203.0.113.9") });
        assert!(r.groups().calls().is_empty());
    }

    #[tokio::test]
    async fn force_ignores_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_ip");
        std::fs::write(&path, "203.0.113.9 strict\n").unwrap();
        // someone removed our rule behind our back
        let groups = FakeGroups::with_rules(SG, vec!["10.0.0.5/32"]);

        let mut r = Reconciler::new(groups, FixedIp(Some(ip("203.0.113.9"))), FileCache::new(&path))
            .force(true);
        let out = r.run(&Target::ssh(SG)).await.unwrap();
        assert!(matches!(out, Outcome::Reconciled { ref summary, .. } if summary.changed()));
        assert_eq!(r.groups().cidrs(SG, 22, Protocol::Tcp), vec!["203.0.113.9/32"]);
    }

    #[tokio::test]
    async fn cache_miss_still_lists_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        // the group already admits us; absence of a cache must not be taken to mean otherwise
        let groups = FakeGroups::with_rules(SG, vec!["203.0.113.9/32"]);

        let mut r = Reconciler::new(groups, FixedIp(Some(ip("203.0.113.9"))), FileCache::new(&path))
            .mode(Mode::Additive);
        let out = r.run(&Target::ssh(SG)).await.unwrap();

        assert_eq!(r.groups().calls(), vec![Call::List(SG.into())]);
        assert_eq!(out.to_string(), "203.0.113.9 already has access, no changes made");
        assert_eq!(
            r.cache().get(),
            Some(Synced {
                ip: ip("203.0.113.9"),
                mode: Mode::Additive
            })
        );
    }

    #[tokio::test]
    async fn additive_sync_keeps_old_sources() {
        let dir = tempfile::tempdir().unwrap();
        let groups = FakeGroups::with_rules(SG, vec!["10.0.0.5/32"]);
        let mut r = Reconciler::new(
            groups,
            FixedIp(Some(ip("203.0.113.9"))),
            FileCache::new(dir.path().join("last_ip")),
        )
        .mode(Mode::Additive);
        r.run(&Target::ssh(SG)).await.unwrap();

        assert_eq!(
            r.groups().mutations(),
            vec![Call::Authorize(SG.into(), IngressRule::new(Protocol::Tcp, 22, "203.0.113.9/32"))]
        );
        assert_eq!(
            r.groups().cidrs(SG, 22, Protocol::Tcp),
            vec!["10.0.0.5/32", "203.0.113.9/32"]
        );
    }

    #[tokio::test]
    async fn additive_sync_does_not_satisfy_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_ip");
        let groups = FakeGroups::with_rules(SG, vec!["10.0.0.5/32"]);

        let mut r = Reconciler::new(groups, FixedIp(Some(ip("203.0.113.9"))), FileCache::new(&path))
            .mode(Mode::Additive);
        r.run(&Target::ssh(SG)).await.unwrap();
        assert_eq!(
            r.groups().cidrs(SG, 22, Protocol::Tcp),
            vec!["10.0.0.5/32", "203.0.113.9/32"]
        );

        // same ip, same cache file, but now other sources must go
        let mut r = Reconciler::new(
            FakeGroups::default(),
            FixedIp(Some(ip("203.0.113.9"))),
            FileCache::new(&path),
        );
        r.groups().insert(SG, vec!["10.0.0.5/32", "203.0.113.9/32"]);
        let out = r.run(&Target::ssh(SG)).await.unwrap();
        assert!(matches!(out, Outcome::Reconciled { ref summary, .. } if summary.changed()));
        assert_eq!(r.groups().cidrs(SG, 22, Protocol::Tcp), vec!["203.0.113.9/32"]);

        // and once strict has run, additive is satisfied by the cache
        let mut r = Reconciler::new(
            FakeGroups::default(),
            FixedIp(Some(ip("203.0.113.9"))),
            FileCache::new(&path),
        )
        .mode(Mode::Additive);
        let out = r.run(&Target::ssh(SG)).await.unwrap();
        assert_eq!(out, Outcome::Unchanged { ip: ip("203.0.113.9") });
        assert!(r.groups().calls().is_empty());
    }

    #[tokio::test]
    async fn failures_leave_cache_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_ip");
        std::fs::write(&path, "10.0.0.5\n").unwrap();

        let groups = FakeGroups::with_rules(SG, vec!["10.0.0.5/32"]);
        groups.fail_authorize();
        let mut r = Reconciler::new(groups, FixedIp(Some(ip("203.0.113.9"))), FileCache::new(&path));
        let err = r.run(&Target::ssh(SG)).await.unwrap_err();
        assert!(matches!(err, Error::Provider { op: Operation::Authorize(_), .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.0.0.5\n");

        // no ip means no provider calls at all
        let groups = FakeGroups::with_rules(SG, vec!["10.0.0.5/32"]);
        let mut r = Reconciler::new(groups, FixedIp(None), FileCache::new(&path));
        let err = r.run(&Target::ssh(SG)).await.unwrap_err();
        assert!(matches!(err, Error::Network { op: Operation::ResolveIp, .. }));
        assert!(r.groups().calls().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.0.0.5\n");
    }

    #[tokio::test]
    async fn rerun_after_change_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_ip");
        let groups = FakeGroups::with_rules(SG, vec!["10.0.0.5/32"]);
        let mut r = Reconciler::new(groups, FixedIp(Some(ip("203.0.113.9"))), FileCache::new(&path))
            .force(true);

        r.run(&Target::ssh(SG)).await.unwrap();
        r.groups().clear_calls();
        let out = r.run(&Target::ssh(SG)).await.unwrap();
        assert!(matches!(out, Outcome::Reconciled { ref summary, .. } if !summary.changed()));
        assert!(r.groups().mutations().is_empty());
    }
}
