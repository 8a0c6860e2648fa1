use crate::rule::IngressRule;
use std::path::PathBuf;

/// The step of a reconciliation that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ResolveIp,
    ListRules,
    Authorize(IngressRule),
    Revoke(IngressRule),
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::ResolveIp => write!(f, "resolve public ip"),
            Operation::ListRules => write!(f, "describe-security-group-rules"),
            Operation::Authorize(r) => write!(f, "authorize-ingress {}", r),
            Operation::Revoke(r) => write!(f, "revoke-ingress {}", r),
        }
    }
}

/// Everything that can abort an `ipgate` invocation.
///
/// Duplicate-rule and rule-not-found answers from the provider are not errors; see
/// [`Change::AlreadyInDesiredState`](crate::providers::Change::AlreadyInDesiredState).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The IP-echo service or the provider could not be reached, or did not answer in time.
    #[error("network failure during {op}: {message}")]
    Network { op: Operation, message: String },

    /// The provider answered, but refused the call.
    #[error("{op} on security group {group_id} was rejected: {message}")]
    Provider {
        op: Operation,
        group_id: String,
        message: String,
    },

    #[error("could not write cached ip to {}", path.display())]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A security group id that cannot be used as given.
    #[error("invalid security group id {0:?}")]
    InvalidGroupId(String),

    /// The security group could not be looked up from a Pulumi stack.
    #[error("could not resolve security group from stack {stack}: {message}")]
    Stack { stack: String, message: String },
}

impl Error {
    pub(crate) fn network(op: Operation, message: impl ToString) -> Self {
        Error::Network {
            op,
            message: message.to_string(),
        }
    }

    pub(crate) fn provider(op: Operation, group_id: &str, message: impl ToString) -> Self {
        Error::Provider {
            op,
            group_id: group_id.to_string(),
            message: message.to_string(),
        }
    }

    /// The operation that failed, if the failure happened while talking to a remote service.
    pub fn operation(&self) -> Option<&Operation> {
        match self {
            Error::Network { op, .. } | Error::Provider { op, .. } => Some(op),
            _ => None,
        }
    }
}
