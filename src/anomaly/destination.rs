//! Destination scorer: does the endpoint look wrong for this app?

use super::{FactorMean, ScorerOutput};
use crate::packet::{PROTO_TCP, PROTO_UDP};
use crate::profile::{AppProfile, FlowObservation, Maturity};
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Ports common enough that absence from the profile's top-20 means nothing.
static WELL_KNOWN_PORTS: Lazy<HashSet<u16>> =
    Lazy::new(|| [80, 443, 8080, 8443, 53, 853, 123].into_iter().collect());

/// Ports where a ClientHello is expected traffic.
static TLS_PORTS: Lazy<HashSet<u16>> = Lazy::new(|| [443, 8443, 853].into_iter().collect());

const DGA_MIN_SUBDOMAIN_LEN: usize = 5;
const DGA_MIN_ENTROPY: f64 = 3.5;
const DGA_MIN_SNI_LEN: usize = 20;

pub(super) fn score(profile: &AppProfile, obs: &FlowObservation) -> ScorerOutput {
    let confidence = profile.maturity.confidence();
    let mut factors = FactorMean::new();
    let mut reasons = Vec::new();

    if !profile.destinations.might_contain(&obs.destination) {
        let factor = if profile.maturity == Maturity::Mature {
            0.6
        } else {
            0.3
        };
        factors.add(factor);
        reasons.push(format!("New destination {}", obs.destination));
    }

    if !profile.knows_port(obs.dst_port) && !WELL_KNOWN_PORTS.contains(&obs.dst_port) {
        factors.add(0.5);
        reasons.push(format!("Unusual port {}", obs.dst_port));
    }

    let unusual_protocol = match obs.protocol {
        PROTO_TCP => !profile.uses_tcp && profile.uses_udp,
        PROTO_UDP => !profile.uses_udp && profile.uses_tcp,
        _ => false,
    };
    if unusual_protocol {
        factors.add(0.4);
        reasons.push("Protocol this app has never used".to_string());
    }

    if let Some(sni) = obs.sni.as_deref() {
        if looks_generated(sni) {
            factors.add(0.7);
            reasons.push(format!("Random-looking domain (possible DGA): {sni}"));
        }
        if profile.maturity == Maturity::Mature && !profile.domains.might_contain(sni) {
            factors.add(0.3);
            reasons.push(format!("New domain {sni}"));
        }
        if !TLS_PORTS.contains(&obs.dst_port) {
            factors.add(0.4);
            reasons.push(format!("TLS handshake on non-standard port {}", obs.dst_port));
        }
    }

    ScorerOutput {
        score: factors.mean(),
        confidence,
        reasons,
    }
}

fn looks_generated(sni: &str) -> bool {
    let subdomain = sni.split('.').next().unwrap_or("");
    subdomain.len() >= DGA_MIN_SUBDOMAIN_LEN
        && sni.len() > DGA_MIN_SNI_LEN
        && shannon_entropy(subdomain) > DGA_MIN_ENTROPY
}

/// Shannon entropy in bits over character frequencies.
fn shannon_entropy(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    for c in text.chars() {
        *counts.entry(c).or_insert(0u32) += 1;
    }
    let len = text.chars().count() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}
