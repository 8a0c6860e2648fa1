//! AWS EC2 backend for ipgate.
//!
//! [`AwsGroups`] talks to one region's EC2 control plane through
//! [rusoto](https://crates.io/crates/rusoto_core).
//!
//! # Examples
//! ```rust,no_run
//! use ipgate::providers::aws::{AwsGroups, Region};
//! use ipgate::providers::SecurityGroups;
//! use ipgate::Protocol;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), color_eyre::Report> {
//!     let ec2 = AwsGroups::default().region(Region::UsWest2).connect()?;
//!     for rule in ec2.list_rules("sg-0123456789abcdef0", 22, Protocol::Tcp).await? {
//!         println!("{}", rule);
//!     }
//!     Ok(())
//! }
//! ```

use super::{Change, SecurityGroups};
use crate::error::{Error, Operation};
use crate::rule::{IngressRule, Protocol};
use color_eyre::Report;
use educe::Educe;
use eyre::WrapErr;
use rusoto_core::credential::{DefaultCredentialsProvider, ProfileProvider, ProvideAwsCredentials};
use rusoto_core::request::HttpClient;
pub use rusoto_core::Region;
use rusoto_core::RusotoError;
use rusoto_ec2::Ec2;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use tracing::instrument;
use tracing_futures::Instrument;

/// Configuration for connecting to EC2.
///
/// The default uses rusoto's default region (`AWS_DEFAULT_REGION` / `AWS_REGION`, falling back
/// to us-east-1) and its default credential chain.
#[derive(Educe)]
#[educe(Debug)]
pub struct AwsGroups<P = DefaultCredentialsProvider> {
    region: Region,
    #[educe(Debug(ignore))]
    credential_provider: Box<dyn Fn() -> Result<P, Report> + Send + Sync>,
}

impl Default for AwsGroups {
    fn default() -> Self {
        AwsGroups {
            region: Region::default(),
            credential_provider: Box::new(|| Ok(DefaultCredentialsProvider::new()?)),
        }
    }
}

impl<P> AwsGroups<P> {
    /// Talk to EC2 in `region`.
    pub fn region(self, region: Region) -> Self {
        Self { region, ..self }
    }

    /// Set the credential provider used to authenticate to EC2.
    pub fn with_credentials<P2>(
        self,
        f: impl Fn() -> Result<P2, Report> + Send + Sync + 'static,
    ) -> AwsGroups<P2> {
        AwsGroups {
            region: self.region,
            credential_provider: Box::new(f),
        }
    }

    /// Authenticate with a named profile from the shared credentials file.
    pub fn with_profile(self, profile: impl ToString) -> AwsGroups<ProfileProvider> {
        let profile = profile.to_string();
        self.with_credentials(move || {
            let mut p = ProfileProvider::new().wrap_err("failed to read aws credentials file")?;
            p.set_profile(profile.clone());
            Ok(p)
        })
    }
}

impl<P> AwsGroups<P>
where
    P: ProvideAwsCredentials + Send + Sync + 'static,
{
    /// Construct the EC2 client.
    #[instrument(level = "debug", skip(self), fields(region = %self.region.name()))]
    pub fn connect(self) -> Result<RegionGroups, Report> {
        tracing::debug!("connecting to ec2");
        let provider = (*self.credential_provider)()?;
        let client = rusoto_ec2::Ec2Client::new_with(
            HttpClient::new().wrap_err("failed to construct new http client")?,
            provider,
            self.region.clone(),
        );
        Ok(RegionGroups {
            region: self.region,
            client,
        })
    }
}

/// Security groups in one connected EC2 region.
#[derive(Educe)]
#[educe(Debug)]
pub struct RegionGroups {
    /// The region this client is connected to.
    pub region: Region,
    #[educe(Debug(ignore))]
    client: rusoto_ec2::Ec2Client,
}

/// Pull the text of `<tag>...</tag>` out of an EC2 XML error body.
fn xml_tag<'b>(body: &'b str, tag: &str) -> Option<&'b str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let len = body[start..].find(&close)?;
    Some(&body[start..start + len])
}

/// How an EC2 call failed, as far as reconciliation cares.
#[derive(Debug, PartialEq, Eq)]
enum Failure {
    /// The response carried this EC2 error code (and message).
    Code(String, String),
    /// We never got an answer.
    Unreachable(String),
    Other(String),
}

impl Failure {
    fn classify<E>(e: RusotoError<E>) -> Self
    where
        E: std::error::Error + 'static,
    {
        match e {
            RusotoError::HttpDispatch(e) => Failure::Unreachable(e.to_string()),
            RusotoError::Unknown(ref r) => {
                let body = r.body_as_str();
                match xml_tag(body, "Code") {
                    Some(code) => Failure::Code(
                        code.to_string(),
                        xml_tag(body, "Message").unwrap_or_default().to_string(),
                    ),
                    None => Failure::Other(format!("http status {}: {}", r.status, body)),
                }
            }
            e => Failure::Other(e.to_string()),
        }
    }

    fn is_code(&self, c: &str) -> bool {
        matches!(self, Failure::Code(code, _) if code == c)
    }

    fn into_error(self, op: Operation, group_id: &str) -> Error {
        match self {
            Failure::Unreachable(msg) => Error::network(op, msg),
            Failure::Code(code, msg) if msg.is_empty() => Error::provider(op, group_id, code),
            Failure::Code(code, msg) => {
                Error::provider(op, group_id, format!("{}: {}", code, msg))
            }
            Failure::Other(msg) => Error::provider(op, group_id, msg),
        }
    }
}

fn ip_permission(rule: &IngressRule, describe: bool) -> rusoto_ec2::IpPermission {
    let mut range = rusoto_ec2::IpRange::default();
    range.cidr_ip = Some(rule.cidr.clone());
    if describe {
        range.description = Some(rule.description());
    }

    let mut perm = rusoto_ec2::IpPermission::default();
    perm.ip_protocol = Some(rule.protocol.as_str().to_string());
    perm.from_port = Some(i64::from(rule.from_port));
    perm.to_port = Some(i64::from(rule.to_port));
    perm.ip_ranges = Some(vec![range]);
    perm
}

/// What a successful revoke did.
///
/// EC2 answers a revoke of a rule it does not have with success, echoing the rule back in
/// `UnknownIpPermissions`. That is the rule already being gone.
fn revoke_change(unknown: Option<Vec<rusoto_ec2::IpPermission>>) -> Change {
    match unknown {
        Some(ref perms) if !perms.is_empty() => Change::AlreadyInDesiredState,
        _ => Change::Applied,
    }
}

/// Flatten EC2's permission list into the single-port ipv4 rules on `port` over `protocol`.
fn matching_rules(
    permissions: Vec<rusoto_ec2::IpPermission>,
    port: u16,
    protocol: Protocol,
) -> BTreeSet<IngressRule> {
    let mut rules = BTreeSet::new();
    for perm in permissions {
        // "-1" (all traffic) and icmp are not rules we manage
        let proto = match perm.ip_protocol.as_deref().map(str::parse::<Protocol>) {
            Some(Ok(p)) => p,
            _ => continue,
        };
        let (from, to) = match (perm.from_port, perm.to_port) {
            (Some(f), Some(t)) => (f, t),
            _ => continue,
        };
        if proto != protocol || from != i64::from(port) || to != i64::from(port) {
            continue;
        }
        for range in perm.ip_ranges.unwrap_or_default() {
            if let Some(cidr) = range.cidr_ip {
                rules.insert(IngressRule::new(proto, port, cidr));
            }
        }
    }
    rules
}

impl SecurityGroups for RegionGroups {
    #[instrument(level = "debug", skip(self))]
    fn list_rules<'l>(
        &'l self,
        group_id: &'l str,
        port: u16,
        protocol: Protocol,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<IngressRule>, Error>> + Send + 'l>> {
        Box::pin(
            async move {
                tracing::trace!("describing security group");
                let mut req = rusoto_ec2::DescribeSecurityGroupsRequest::default();
                req.group_ids = Some(vec![group_id.to_string()]);
                let res = self
                    .client
                    .describe_security_groups(req)
                    .await
                    .map_err(|e| Failure::classify(e).into_error(Operation::ListRules, group_id))?;

                let group = res
                    .security_groups
                    .unwrap_or_default()
                    .into_iter()
                    .find(|g| g.group_id.as_deref() == Some(group_id))
                    .ok_or_else(|| {
                        Error::provider(
                            Operation::ListRules,
                            group_id,
                            "security group missing from describe response",
                        )
                    })?;

                let rules =
                    matching_rules(group.ip_permissions.unwrap_or_default(), port, protocol);
                tracing::trace!(n = rules.len(), "found matching rules");
                Ok(rules)
            }
            .in_current_span(),
        )
    }

    #[instrument(level = "debug", skip(self, rule), fields(rule = %rule))]
    fn authorize<'l>(
        &'l self,
        group_id: &'l str,
        rule: &'l IngressRule,
    ) -> Pin<Box<dyn Future<Output = Result<Change, Error>> + Send + 'l>> {
        Box::pin(
            async move {
                let mut req = rusoto_ec2::AuthorizeSecurityGroupIngressRequest::default();
                req.group_id = Some(group_id.to_string());
                req.ip_permissions = Some(vec![ip_permission(rule, true)]);

                match self.client.authorize_security_group_ingress(req).await {
                    Ok(_) => {
                        tracing::trace!("rule authorized");
                        Ok(Change::Applied)
                    }
                    Err(e) => {
                        let f = Failure::classify(e);
                        if f.is_code("InvalidPermission.Duplicate") {
                            tracing::trace!("rule already exists");
                            Ok(Change::AlreadyInDesiredState)
                        } else {
                            Err(f.into_error(Operation::Authorize(rule.clone()), group_id))
                        }
                    }
                }
            }
            .in_current_span(),
        )
    }

    #[instrument(level = "debug", skip(self, rule), fields(rule = %rule))]
    fn revoke<'l>(
        &'l self,
        group_id: &'l str,
        rule: &'l IngressRule,
    ) -> Pin<Box<dyn Future<Output = Result<Change, Error>> + Send + 'l>> {
        Box::pin(
            async move {
                let mut req = rusoto_ec2::RevokeSecurityGroupIngressRequest::default();
                req.group_id = Some(group_id.to_string());
                // descriptions are not part of a rule's identity, leave them off
                req.ip_permissions = Some(vec![ip_permission(rule, false)]);

                match self.client.revoke_security_group_ingress(req).await {
                    Ok(res) => {
                        let change = revoke_change(res.unknown_ip_permissions);
                        if change == Change::Applied {
                            tracing::trace!("rule revoked");
                        } else {
                            tracing::trace!("ec2 did not know the rule");
                        }
                        Ok(change)
                    }
                    Err(e) => {
                        let f = Failure::classify(e);
                        if f.is_code("InvalidPermission.NotFound") {
                            tracing::trace!("rule already gone");
                            Ok(Change::AlreadyInDesiredState)
                        } else {
                            Err(f.into_error(Operation::Revoke(rule.clone()), group_id))
                        }
                    }
                }
            }
            .in_current_span(),
        )
    }
}
