//! Per-query interception decisions

use hickory_proto::rr::{RData, RecordType};
use std::net::{Ipv4Addr, Ipv6Addr};

use super::upstream::UpstreamResolver;

/// The question of an incoming DNS request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    /// Queried name without the trailing root dot
    pub name: String,
    pub record_type: RecordType,
}

impl DnsQuery {
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            name: name.into(),
            record_type,
        }
    }
}

/// Payload of a single answer, shaped per record type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerData {
    A(Ipv4Addr),
    /// Canonical text form, see [`canonical_ipv6`]
    Aaaa(String),
    /// `(priority, exchange)`
    Mx(u16, String),
    Other(RData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub record_type: RecordType,
    pub data: AnswerData,
}

/// Forges A answers for intercepted names and resolves honest names
/// upstream.
///
/// A name is honest when it ends with `"." + suffix` for a configured
/// suffix. The bare suffix itself is not honest.
pub struct DnsPolicy<U> {
    honest: Vec<String>,
    bind: Ipv4Addr,
    verbose: bool,
    upstream: U,
}

impl<U: UpstreamResolver> DnsPolicy<U> {
    pub fn new(honest: Vec<String>, bind: Ipv4Addr, verbose: bool, upstream: U) -> Self {
        Self {
            honest,
            bind,
            verbose,
            upstream,
        }
    }

    pub fn is_honest(&self, name: &str) -> bool {
        self.honest.iter().any(|suffix| {
            name.len() > suffix.len()
                && name.ends_with(suffix.as_str())
                && name[..name.len() - suffix.len()].ends_with('.')
        })
    }

    /// Answers for `query`. Never fails: an upstream error yields an empty
    /// answer set.
    pub async fn resolve(&self, query: &DnsQuery) -> Vec<DnsAnswer> {
        if self.verbose {
            tracing::info!(name = %query.name, record_type = %query.record_type, "DNS query");
        } else {
            tracing::debug!(name = %query.name, record_type = %query.record_type, "DNS query");
        }

        if !self.is_honest(&query.name) {
            return match query.record_type {
                RecordType::A => vec![DnsAnswer {
                    name: query.name.clone(),
                    record_type: RecordType::A,
                    data: AnswerData::A(self.bind),
                }],
                _ => Vec::new(),
            };
        }

        let records = match self.upstream.resolve(&query.name, query.record_type).await {
            Ok(records) => records,
            Err(e) => {
                tracing::debug!(name = %query.name, error = %e, "Upstream lookup failed");
                return Vec::new();
            }
        };

        records
            .into_iter()
            .map(|record| DnsAnswer {
                name: query.name.clone(),
                record_type: query.record_type,
                data: shape(query.record_type, record),
            })
            .collect()
    }
}

/// Reshape an upstream record according to the queried type
fn shape(record_type: RecordType, record: RData) -> AnswerData {
    match (record_type, record) {
        (RecordType::A, RData::A(a)) => AnswerData::A(a.0),
        (RecordType::AAAA, RData::AAAA(aaaa)) => AnswerData::Aaaa(canonical_ipv6(&aaaa.0)),
        (RecordType::MX, RData::MX(mx)) => AnswerData::Mx(
            mx.preference(),
            mx.exchange().to_string().trim_end_matches('.').to_string(),
        ),
        (_, other) => AnswerData::Other(other),
    }
}

/// Eight colon-separated groups of four lowercase hex digits,
/// e.g. `2001:0db8:0000:0000:0000:0000:0000:0001`
pub fn canonical_ipv6(addr: &Ipv6Addr) -> String {
    addr.segments()
        .iter()
        .map(|group| format!("{:04x}", group))
        .collect::<Vec<_>>()
        .join(":")
}
