use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::errors::{LimiterError, Result};

/// Enumerated limit classes. The snake_case form of each name is the first
/// segment of every bucket key, the key into the defaults file, and the
/// `limit` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Name {
    /// New account registrations, per client IP address.
    NewRegistrationsPerIpAddress,

    /// New account registrations, per /48 IPv6 range.
    NewRegistrationsPerIpv6Range,

    /// New orders, per account.
    NewOrdersPerAccount,

    /// Failed authorization attempts, per account.
    FailedAuthorizationsPerAccount,

    /// Certificates issued, per unique set of fully qualified domain names.
    CertificatesPerFqdnSet,
}

impl Name {
    pub const ALL: [Name; 5] = [
        Name::NewRegistrationsPerIpAddress,
        Name::NewRegistrationsPerIpv6Range,
        Name::NewOrdersPerAccount,
        Name::FailedAuthorizationsPerAccount,
        Name::CertificatesPerFqdnSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Name::NewRegistrationsPerIpAddress => "new_registrations_per_ip_address",
            Name::NewRegistrationsPerIpv6Range => "new_registrations_per_ipv6_range",
            Name::NewOrdersPerAccount => "new_orders_per_account",
            Name::FailedAuthorizationsPerAccount => "failed_authorizations_per_account",
            Name::CertificatesPerFqdnSet => "certificates_per_fqdn_set",
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Name {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        Name::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| LimiterError::InvalidLimitName(s.to_string()))
    }
}

/// Static configuration of a single bucket class.
///
/// The derived emission interval (`period / count`, the time to refill one
/// unit of capacity) and burst offset (`burst * emission_interval`, the
/// furthest a TAT may sit in the future) are precomputed at construction so
/// the decision kernel works in plain nanosecond integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    burst: i64,
    count: i64,
    period: Duration,
    emission_interval: i64,
    burst_offset: i64,
    is_override: bool,
}

impl Limit {
    pub fn new(burst: i64, count: i64, period: Duration) -> Result<Self> {
        if burst <= 0 {
            return Err(LimiterError::Configuration(format!(
                "burst must be > 0 (got {burst})"
            )));
        }
        if count <= 0 {
            return Err(LimiterError::Configuration(format!(
                "count must be > 0 (got {count})"
            )));
        }
        if period.is_zero() {
            return Err(LimiterError::Configuration(
                "period must be > 0".to_string(),
            ));
        }
        let period_nanos = i64::try_from(period.as_nanos()).map_err(|_| {
            LimiterError::Configuration(format!("period {period:?} is out of range"))
        })?;
        let emission_interval = period_nanos / count;
        if emission_interval == 0 {
            return Err(LimiterError::Configuration(format!(
                "count {count} over period {period:?} yields a zero emission interval"
            )));
        }

        Ok(Self {
            burst,
            count,
            period,
            emission_interval,
            burst_offset: burst.saturating_mul(emission_interval),
            is_override: false,
        })
    }

    /// Maximum instantaneous capacity.
    pub fn burst(&self) -> i64 {
        self.burst
    }

    /// Requests permitted per `period`.
    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// True when this limit came from the overrides file rather than the
    /// defaults; such limits additionally report a utilization gauge.
    pub fn is_override(&self) -> bool {
        self.is_override
    }

    /// Nanoseconds of TAT advance per unit of cost.
    pub(crate) fn emission_interval(&self) -> i64 {
        self.emission_interval
    }

    /// Maximum distance, in nanoseconds, a TAT may sit past now.
    pub(crate) fn burst_offset(&self) -> i64 {
        self.burst_offset
    }

    pub(crate) fn into_override(mut self) -> Self {
        self.is_override = true;
        self
    }
}

/// Limits keyed either by limit name (defaults) or by bucket key (overrides).
pub type Limits = HashMap<String, Limit>;

/// One entry of a defaults or overrides file.
#[derive(Debug, Deserialize)]
struct LimitEntry {
    burst: i64,
    count: i64,
    period_secs: u64,
}

impl LimitEntry {
    fn build(&self, key: &str) -> Result<Limit> {
        Limit::new(self.burst, self.count, Duration::from_secs(self.period_secs)).map_err(|err| {
            LimiterError::Configuration(format!("limit entry {key:?}: {err}"))
        })
    }
}

/// Parse default limits from a JSON object keyed by limit name.
pub fn parse_default_limits(contents: &str) -> Result<Limits> {
    let entries: HashMap<String, LimitEntry> = serde_json::from_str(contents)?;

    let mut limits = Limits::with_capacity(entries.len());
    for (key, entry) in entries {
        let name: Name = key.parse()?;
        limits.insert(name.as_str().to_string(), entry.build(&key)?);
    }
    Ok(limits)
}

/// Parse override limits from a JSON object keyed by bucket key
/// (`"<name>:<id>"`). The name segment must be a recognized limit name.
pub fn parse_override_limits(contents: &str) -> Result<Limits> {
    let entries: HashMap<String, LimitEntry> = serde_json::from_str(contents)?;

    let mut limits = Limits::with_capacity(entries.len());
    for (key, entry) in entries {
        let Some((name, id)) = key.split_once(':') else {
            return Err(LimiterError::Configuration(format!(
                "override key {key:?} is not of the form \"name:id\""
            )));
        };
        name.parse::<Name>()?;
        if id.is_empty() {
            return Err(LimiterError::Configuration(format!(
                "override key {key:?} has an empty id"
            )));
        }
        limits.insert(key.clone(), entry.build(&key)?.into_override());
    }
    Ok(limits)
}

/// Load and parse the default limits file.
pub async fn load_default_limits<P: AsRef<Path>>(path: P) -> Result<Limits> {
    let path = path.as_ref();
    info!("Loading default limits from: {}", path.display());

    let contents = tokio::fs::read_to_string(path).await?;
    let limits = parse_default_limits(&contents)?;

    debug!("Loaded {} default limits", limits.len());
    Ok(limits)
}

/// Load and parse the override limits file. Overrides are optional; callers
/// with no overrides file should pass an empty `Limits` to the limiter.
pub async fn load_override_limits<P: AsRef<Path>>(path: P) -> Result<Limits> {
    let path = path.as_ref();
    info!("Loading override limits from: {}", path.display());

    let contents = tokio::fs::read_to_string(path).await?;
    let limits = parse_override_limits(&contents)?;

    debug!("Loaded {} override limits", limits.len());
    Ok(limits)
}
