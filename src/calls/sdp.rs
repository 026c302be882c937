//! Candidate aggregation over a trickled SDP offer.
//!
//! The downstream media server cannot consume trickled candidates, so the
//! bridge holds an offer back until enough candidates have arrived to fold
//! them all into one self-contained offer. The readiness rules here are a
//! pragmatic heuristic for "trickling is done", not an ICE-compliance check.

use crate::events::IceCandidate;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv6Addr;

const LOG: &str = "Calls/Sdp";

/// Hold signaling quirk: the media server special-cases an all-zeros
/// connection address per the obsolete RFC 2543 hold convention, which turns
/// the answer into `a=sendonly`. Clobber it with an unroutable address.
const HOLD_ADDRESS: &str = "0.0.0.0";
const HOLD_ADDRESS_REPLACEMENT: &str = "10.10.10.10";

/// Media sections of an offer, in order, with the `a=mid:` mapping needed to
/// place candidates that only carry a symbolic section identifier.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SectionMap {
    pub section_count: usize,
    pub index_by_mid: HashMap<String, usize>,
}

/// Enumerates `m=` sections and maps each section's `a=mid:` value to its
/// numeric index.
pub fn media_section_map(offer: &str) -> SectionMap {
    let mut map = SectionMap::default();
    for line in offer.split("\r\n") {
        if line.starts_with("m=") {
            map.section_count += 1;
        } else if let Some(mid) = line.strip_prefix("a=mid:") {
            if map.section_count == 0 {
                warn!(target: LOG, "a=mid:{mid} before any m= line; ignoring");
                continue;
            }
            map.index_by_mid
                .insert(mid.to_string(), map.section_count - 1);
        }
    }
    map
}

#[derive(Debug, Default)]
struct SectionStats {
    has_host: bool,
    has_srflx: bool,
    has_relay: bool,
    /// Component ids seen per candidate foundation, combined with bitwise OR:
    /// duplicate candidates may legitimately repeat a (foundation, component)
    /// pair, so addition would overcount.
    component_ids_by_foundation: HashMap<String, u32>,
}

/// Resolves which media section a candidate belongs to. The explicit numeric
/// index wins over the symbolic identifier.
fn resolve_section(candidate: &IceCandidate, map: &SectionMap) -> Option<usize> {
    let index = match candidate.sdp_m_line_index {
        Some(index) => index as usize,
        None => *candidate
            .sdp_mid
            .as_ref()
            .and_then(|mid| map.index_by_mid.get(mid))?,
    };
    if index >= map.section_count {
        return None;
    }
    Some(index)
}

/// Splits `candidate:<foundation> <component-id> ...` into its foundation
/// and component id.
fn foundation_and_component(candidate: &str) -> Option<(&str, u32)> {
    let body = candidate.strip_prefix("candidate:")?;
    let mut fields = body.split_whitespace();
    let foundation = fields.next()?;
    let component = fields.next()?.parse().ok()?;
    Some((foundation, component))
}

fn gather_stats(candidates: &[IceCandidate], map: &SectionMap) -> Vec<SectionStats> {
    let mut stats: Vec<SectionStats> = (0..map.section_count).map(|_| Default::default()).collect();

    for candidate in candidates {
        if candidate.candidate.is_empty() {
            continue;
        }
        let Some(index) = resolve_section(candidate, map) else {
            warn!(
                target: LOG,
                "Can't find a m= line for candidate; ignoring: {}", candidate.candidate
            );
            continue;
        };
        let stat = &mut stats[index];
        if candidate.candidate.contains("typ host") {
            stat.has_host = true;
        }
        if candidate.candidate.contains("typ srflx") {
            stat.has_srflx = true;
        }
        if candidate.candidate.contains("typ relay") {
            stat.has_relay = true;
        }
        match foundation_and_component(&candidate.candidate) {
            Some((foundation, component)) => {
                *stat
                    .component_ids_by_foundation
                    .entry(foundation.to_string())
                    .or_insert(0) |= component;
            }
            None => {
                warn!(target: LOG, "Can't parse candidate: {}", candidate.candidate);
            }
        }
    }
    stats
}

/// Decides whether enough candidates have arrived to de-trickle the offer.
///
/// Every media section must have at least one parsed candidate, a host
/// candidate, a server-reflexive or relay candidate, and no gap in the
/// component-id sequence of any foundation (accumulated ids of 1 or 3, i.e.
/// RTP alone or RTP+RTCP). A reflexive or relay candidate is proof the
/// client can reach past its NAT, and the media server itself is not NATted;
/// a missing host candidate means candidate events were probably lost. The
/// media server has been known to crash on component gaps, so those always
/// hold the offer back.
///
/// An offer with no media sections is never ready and relies on the caller's
/// force timeout.
pub fn enough_candidates(offer: &str, candidates: &[IceCandidate]) -> bool {
    let map = media_section_map(offer);
    if map.section_count == 0 {
        debug!(target: LOG, "Offer has no m= lines; can never become ready");
        return false;
    }
    let stats = gather_stats(candidates, &map);

    let mut enough = true;
    for (index, stat) in stats.iter().enumerate() {
        if stat.component_ids_by_foundation.is_empty() {
            enough = false;
            info!(target: LOG, "m= line {index} has no candidates at all yet; waiting...");
            continue;
        }
        if !stat.has_host {
            enough = false;
            info!(target: LOG, "m= line {index} has no host candidates yet; waiting...");
            continue;
        }
        if !stat.has_srflx && !stat.has_relay {
            enough = false;
            info!(target: LOG, "m= line {index} has no srflx or relay candidates yet; waiting...");
            continue;
        }
        for (foundation, sum) in &stat.component_ids_by_foundation {
            if *sum != 1 && *sum != 3 {
                enough = false;
                info!(
                    target: LOG,
                    "m= line {index} has missing components for foundation {foundation}, sum={sum}; waiting..."
                );
            }
        }
    }
    enough
}

/// Extracts the transport address field of an `a=candidate:` line, if the
/// line is one.
fn candidate_line_address(line: &str) -> Option<&str> {
    let body = line.strip_prefix("a=candidate:")?;
    // foundation, component, transport, priority, then the address.
    let mut fields = body.split_whitespace();
    fields.nth(4)
}

/// Folds the accumulated candidates into the offer and applies the media
/// server compatibility fixups, returning the rewritten offer.
///
/// Candidate lines are inserted ahead of the first attribute line of their
/// media section (once per section), preserving candidate insertion order.
/// Connection lines carrying the hold address are rewritten, and candidate
/// lines with IPv6 transport addresses are stripped: the media server has
/// produced crashes when offered them and does not sit on an IPv6 network.
pub fn detrickle(offer: &str, candidates: &[IceCandidate]) -> String {
    let map = media_section_map(offer);
    let mut section: isize = -1;
    let mut inserted_up_to: isize = -1;
    let mut lines: Vec<String> = Vec::new();

    for line in offer.split("\r\n") {
        if line.starts_with("m=") {
            section += 1;
            debug!(target: LOG, "index={section} - {line}");
        }
        let line = if line.starts_with("c=") {
            line.replace(HOLD_ADDRESS, HOLD_ADDRESS_REPLACEMENT)
        } else {
            line.to_string()
        };

        // Session-level lines, non-attribute lines, and sections already
        // populated pass through untouched.
        if section >= 0 && line.starts_with("a=") && inserted_up_to != section {
            for candidate in candidates {
                if resolve_section(candidate, &map) == Some(section as usize) {
                    debug!(
                        target: LOG,
                        "Inserted candidate {} at m= index {section}", candidate.candidate
                    );
                    lines.push(format!("a={}", candidate.candidate));
                }
            }
            inserted_up_to = section;
        }
        lines.push(line);
    }

    lines.retain(|line| match candidate_line_address(line) {
        Some(address) if address.parse::<Ipv6Addr>().is_ok() => {
            debug!(target: LOG, "Stripped IPv6 candidate line: {line}");
            false
        }
        _ => true,
    });
    lines.join("\r\n")
}
