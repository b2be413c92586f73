//! Envelope address validation
//!
//! Runs synchronously inside the MAIL FROM / RCPT TO transitions. A
//! rejection fails the command, never the connection.

use crate::observer::AddressPolicy;
use mailhook_common::types::{EmailAddress, Envelope};
use std::sync::Arc;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Which side of the envelope is being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Sender,
    Recipient,
}

impl AddressKind {
    fn noun(self) -> &'static str {
        match self {
            AddressKind::Sender => "Sender",
            AddressKind::Recipient => "Recipient",
        }
    }
}

/// Validation outcome, carrying the SMTP reply on rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject { code: u16, message: String },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Accept/reject decision point for envelope addresses
pub struct AddressValidator {
    resolver: Option<TokioAsyncResolver>,
    policy: Option<Arc<dyn AddressPolicy>>,
}

impl AddressValidator {
    /// Create a validator; `dns_validation` enables the MX lookup step
    pub fn new(dns_validation: bool, policy: Option<Arc<dyn AddressPolicy>>) -> Self {
        let resolver = dns_validation.then(|| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver, policy }
    }

    /// Create a validator with a custom resolver
    pub fn with_resolver(resolver: TokioAsyncResolver, policy: Option<Arc<dyn AddressPolicy>>) -> Self {
        Self {
            resolver: Some(resolver),
            policy,
        }
    }

    /// Validate one envelope address
    pub async fn validate(
        &self,
        kind: AddressKind,
        address: Option<&EmailAddress>,
        envelope: &Envelope,
    ) -> Verdict {
        // Empty or missing addresses never reach DNS
        let address = match address {
            Some(address) => address,
            None => {
                return Verdict::Reject {
                    code: 550,
                    message: format!("5.1.7 Bad {} address syntax", kind.noun().to_lowercase()),
                };
            }
        };

        if let Some(resolver) = &self.resolver {
            match resolver.mx_lookup(address.domain.as_str()).await {
                Ok(lookup) if lookup.iter().next().is_some() => {
                    debug!(domain = %address.domain, "MX records found");
                }
                Ok(_) => {
                    return Verdict::Reject {
                        code: 450,
                        message: format!(
                            "4.1.8 {} address rejected: Domain not found",
                            kind.noun()
                        ),
                    };
                }
                Err(e) => {
                    warn!(domain = %address.domain, error = %e, "MX lookup failed");
                    return Verdict::Reject {
                        code: 450,
                        message: format!(
                            "4.1.8 {} address rejected: Domain not found",
                            kind.noun()
                        ),
                    };
                }
            }
        }

        if let Some(policy) = &self.policy {
            let accepted = match kind {
                AddressKind::Sender => policy.accept_sender(envelope, address).await,
                AddressKind::Recipient => policy.accept_recipient(envelope, address).await,
            };
            if !accepted {
                return Verdict::Reject {
                    code: 550,
                    message: format!("5.1.1 {} address rejected: User unknown", kind.noun()),
                };
            }
        }

        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use trust_dns_resolver::config::NameServerConfigGroup;

    struct DenyAll;

    #[async_trait]
    impl AddressPolicy for DenyAll {
        async fn accept_sender(&self, _envelope: &Envelope, _address: &EmailAddress) -> bool {
            false
        }

        async fn accept_recipient(&self, _envelope: &Envelope, _address: &EmailAddress) -> bool {
            false
        }
    }

    /// Resolver pointed at a black-hole name server so every lookup errors
    fn broken_resolver() -> TokioAsyncResolver {
        let nameservers = NameServerConfigGroup::from_ips_clear(
            &["127.0.0.1".parse().unwrap()],
            1, // nothing listens here
            true,
        );
        let mut opts = ResolverOpts::default();
        opts.timeout = std::time::Duration::from_millis(200);
        opts.attempts = 1;
        TokioAsyncResolver::tokio(
            ResolverConfig::from_parts(None, Vec::new(), nameservers),
            opts,
        )
    }

    #[tokio::test]
    async fn test_missing_address_rejected_without_dns() {
        let validator = AddressValidator::with_resolver(broken_resolver(), None);
        let verdict = validator
            .validate(AddressKind::Sender, None, &Envelope::default())
            .await;
        match verdict {
            Verdict::Reject { code, .. } => assert_eq!(code, 550),
            Verdict::Accept => panic!("empty address must be rejected"),
        }
    }

    #[tokio::test]
    async fn test_dns_failure_is_transient_rejection() {
        let validator = AddressValidator::with_resolver(broken_resolver(), None);
        let address = EmailAddress::parse("someone@foo.fifoo").unwrap();
        let verdict = validator
            .validate(AddressKind::Recipient, Some(&address), &Envelope::default())
            .await;
        match verdict {
            Verdict::Reject { code, message } => {
                assert_eq!(code, 450);
                assert!(message.contains("Domain not found"));
            }
            Verdict::Accept => panic!("unresolvable domain must be rejected"),
        }
    }

    #[tokio::test]
    async fn test_policy_denial_is_permanent_rejection() {
        let validator = AddressValidator::new(false, Some(Arc::new(DenyAll)));
        let address = EmailAddress::parse("nobody@example.com").unwrap();
        let verdict = validator
            .validate(AddressKind::Recipient, Some(&address), &Envelope::default())
            .await;
        match verdict {
            Verdict::Reject { code, message } => {
                assert_eq!(code, 550);
                assert!(message.contains("User unknown"));
            }
            Verdict::Accept => panic!("denied address must be rejected"),
        }
    }

    #[tokio::test]
    async fn test_accept_without_dns_or_policy() {
        let validator = AddressValidator::new(false, None);
        let address = EmailAddress::parse("anyone@anywhere.example").unwrap();
        let verdict = validator
            .validate(AddressKind::Sender, Some(&address), &Envelope::default())
            .await;
        assert!(verdict.is_accept());
    }
}
