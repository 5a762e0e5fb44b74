use std::net::{IpAddr, Ipv6Addr};

use sha2::{Digest, Sha256};

use crate::errors::{LimiterError, Result};
use crate::limits::Name;

/// Identity of a single bucket: a limit name plus a canonical subject id,
/// rendered as the `"<name>:<id>"` key under which state is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    name: Name,
    key: String,
}

impl Bucket {
    fn new(name: Name, id: String) -> Self {
        Self {
            key: format!("{}:{}", name.as_str(), id),
            name,
        }
    }

    /// Bucket for registrations from a single IP address. IPv4 renders
    /// dotted-quad, IPv6 renders RFC 5952 lowercase.
    pub fn new_registrations_per_ip_address(ip: IpAddr) -> Self {
        Self::new(Name::NewRegistrationsPerIpAddress, ip.to_string())
    }

    /// Bucket for registrations from a /48 IPv6 range. IPv4 has no range
    /// variant: a /32 is the address itself, covered by the per-address
    /// limit.
    pub fn new_registrations_per_ipv6_range(ip: Ipv6Addr) -> Self {
        let seg = ip.segments();
        let prefix = Ipv6Addr::new(seg[0], seg[1], seg[2], 0, 0, 0, 0, 0);
        Self::new(
            Name::NewRegistrationsPerIpv6Range,
            format!("{prefix}/48"),
        )
    }

    /// Bucket for new orders made by a single account.
    pub fn new_orders_per_account(account_id: i64) -> Result<Self> {
        Ok(Self::new(
            Name::NewOrdersPerAccount,
            valid_account_id(account_id)?,
        ))
    }

    /// Bucket for failed authorization attempts by a single account.
    pub fn failed_authorizations_per_account(account_id: i64) -> Result<Self> {
        Ok(Self::new(
            Name::FailedAuthorizationsPerAccount,
            valid_account_id(account_id)?,
        ))
    }

    /// Bucket for certificates covering a set of FQDNs. The id is the hex
    /// SHA-256 of the sorted, lowercased names, so any ordering or casing of
    /// the same set produces the same bucket.
    pub fn certificates_per_fqdn_set(domains: &[String]) -> Result<Self> {
        if domains.is_empty() {
            return Err(LimiterError::InvalidBucketKey(
                "FQDN set must contain at least one name".to_string(),
            ));
        }

        let mut names: Vec<String> = Vec::with_capacity(domains.len());
        for domain in domains {
            let name = domain.trim().to_ascii_lowercase();
            if name.is_empty() {
                return Err(LimiterError::InvalidBucketKey(
                    "FQDN set contains an empty name".to_string(),
                ));
            }
            names.push(name);
        }
        names.sort();
        names.dedup();

        let digest = Sha256::digest(names.join(",").as_bytes());
        Ok(Self::new(Name::CertificatesPerFqdnSet, hex::encode(digest)))
    }

    pub fn name(&self) -> Name {
        self.name
    }

    /// The `"<name>:<id>"` key identifying this bucket in the source.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attach the cost of the request being gated.
    pub fn with_cost(self, cost: i64) -> BucketWithCost {
        BucketWithCost { bucket: self, cost }
    }
}

fn valid_account_id(account_id: i64) -> Result<String> {
    if account_id <= 0 {
        return Err(LimiterError::InvalidBucketKey(format!(
            "account id must be positive (got {account_id})"
        )));
    }
    Ok(account_id.to_string())
}

/// A bucket plus the cost to spend against or refund to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketWithCost {
    bucket: Bucket,
    cost: i64,
}

impl BucketWithCost {
    pub fn name(&self) -> Name {
        self.bucket.name
    }

    pub fn key(&self) -> &str {
        &self.bucket.key
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }
}
