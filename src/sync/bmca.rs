//! Best-Master-Auswahl: Telco-Vergleich plus lokale Prioritäten
//!
//! Der Vergleich folgt der Telco-Kaskade (Clock-Class, Accuracy, Varianz,
//! Priority2), erweitert um einen vom Betreiber vergebenen lokalen Rang.
//! Nach einem Masterwechsel wird die Rangliste ring-verschoben, damit der
//! alte Master ans Ende rückt und die Auswahl nicht flattert.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

use crate::ptp::Announce;

/// Ergebnis eines Paarvergleichs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ComparisonResult {
    ABetterTopo = -2,
    ABetter = -1,
    Unknown = 0,
    BBetter = 1,
    BBetterTopo = 2,
}

/// Schwellen, oberhalb derer ein Gewinner verworfen wird
#[derive(Debug, Clone, Copy)]
pub struct BmcaConfig {
    pub max_clock_class: u8,
    pub max_clock_accuracy: u8,
}

impl Default for BmcaConfig {
    fn default() -> Self {
        // class 6 = GNSS-gekoppelt, accuracy 0x21 = besser als 100ns
        Self {
            max_clock_class: 6,
            max_clock_accuracy: 0x21,
        }
    }
}

/// Telco-Vergleich zweier Announce-Kandidaten mit lokalen Prioritäten.
/// Eine fehlende Seite verliert sofort.
pub fn telco_dscmp(
    a: Option<&Announce>,
    b: Option<&Announce>,
    local_prio_a: u8,
    local_prio_b: u8,
) -> ComparisonResult {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        (Some(_), None) => return ComparisonResult::ABetter,
        (None, Some(_)) => return ComparisonResult::BBetter,
        (None, None) => return ComparisonResult::Unknown,
    };

    let qa = a.body.grandmaster_clock_quality;
    let qb = b.body.grandmaster_clock_quality;

    if qa.clock_class != qb.clock_class {
        return if qa.clock_class < qb.clock_class {
            ComparisonResult::ABetter
        } else {
            ComparisonResult::BBetter
        };
    }
    if qa.clock_accuracy != qb.clock_accuracy {
        return if qa.clock_accuracy < qb.clock_accuracy {
            ComparisonResult::ABetter
        } else {
            ComparisonResult::BBetter
        };
    }
    if qa.offset_scaled_log_variance != qb.offset_scaled_log_variance {
        return if qa.offset_scaled_log_variance < qb.offset_scaled_log_variance {
            ComparisonResult::ABetter
        } else {
            ComparisonResult::BBetter
        };
    }
    if a.body.grandmaster_priority2 != b.body.grandmaster_priority2 {
        return if a.body.grandmaster_priority2 < b.body.grandmaster_priority2 {
            ComparisonResult::ABetter
        } else {
            ComparisonResult::BBetter
        };
    }
    if local_prio_a != local_prio_b {
        return if local_prio_a < local_prio_b {
            ComparisonResult::ABetter
        } else {
            ComparisonResult::BBetter
        };
    }

    if qa.clock_class <= 127 {
        // topology tie-break
        if a.body.steps_removed + 1 < b.body.steps_removed {
            return ComparisonResult::ABetter;
        }
        if b.body.steps_removed + 1 < a.body.steps_removed {
            return ComparisonResult::BBetter;
        }
        let pa = a.header.source_port_identity;
        let pb = b.header.source_port_identity;
        return match pa.cmp(&pb) {
            std::cmp::Ordering::Less => ComparisonResult::ABetterTopo,
            std::cmp::Ordering::Greater => ComparisonResult::BBetterTopo,
            std::cmp::Ordering::Equal => ComparisonResult::Unknown,
        };
    }

    match a
        .body
        .grandmaster_identity
        .cmp(&b.body.grandmaster_identity)
    {
        std::cmp::Ordering::Less => ComparisonResult::ABetter,
        std::cmp::Ordering::Greater => ComparisonResult::BBetter,
        std::cmp::Ordering::Equal => ComparisonResult::Unknown,
    }
}

/// Fold über alle Kandidaten; Gewinner wird anschließend gegen die
/// konfigurierten Qualitätsschwellen geprüft.
pub fn select_best(
    candidates: &HashMap<IpAddr, Announce>,
    priorities: &HashMap<IpAddr, u8>,
    config: &BmcaConfig,
) -> Option<(IpAddr, Announce)> {
    let mut best: Option<(IpAddr, &Announce)> = None;
    let mut addrs: Vec<&IpAddr> = candidates.keys().collect();
    addrs.sort();
    for addr in addrs {
        let announce = &candidates[addr];
        match best {
            None => best = Some((*addr, announce)),
            Some((best_addr, best_announce)) => {
                let prio_a = priorities.get(&best_addr).copied().unwrap_or(u8::MAX);
                let prio_b = priorities.get(addr).copied().unwrap_or(u8::MAX);
                match telco_dscmp(Some(best_announce), Some(announce), prio_a, prio_b) {
                    ComparisonResult::BBetter | ComparisonResult::BBetterTopo => {
                        best = Some((*addr, announce));
                    }
                    _ => {}
                }
            }
        }
    }

    let (addr, announce) = best?;
    let quality = announce.body.grandmaster_clock_quality;
    if quality.clock_class > config.max_clock_class {
        debug!(
            "best GM {} rejected: clock class {} above limit {}",
            addr, quality.clock_class, config.max_clock_class
        );
        return None;
    }
    if quality.clock_accuracy > config.max_clock_accuracy {
        debug!(
            "best GM {} rejected: clock accuracy 0x{:x} above limit 0x{:x}",
            addr, quality.clock_accuracy, config.max_clock_accuracy
        );
        return None;
    }
    Some((addr, *announce))
}

/// Ringverschiebung der Rangliste: der neue Beste bekommt Rang 1, alle
/// anderen rücken entsprechend, wer unter 1 fiele, landet am Ende.
pub fn reprioritize(best: IpAddr, priorities: &mut HashMap<IpAddr, u8>) {
    let count = priorities.len() as i32;
    let best_prio = match priorities.get(&best) {
        Some(p) => *p as i32,
        None => return,
    };
    let shift = best_prio - 1;
    for rank in priorities.values_mut() {
        let mut new_rank = *rank as i32 - shift;
        if new_rank < 1 {
            new_rank += count;
        }
        *rank = new_rank as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::{
        AnnounceBody, ClockIdentity, ClockQuality, PortIdentity, TimeSource,
    };

    fn announce(clock_class: u8, accuracy: u8, identity: u8) -> Announce {
        let body = AnnounceBody {
            grandmaster_priority1: 128,
            grandmaster_priority2: 128,
            grandmaster_clock_quality: ClockQuality {
                clock_class,
                clock_accuracy: accuracy,
                offset_scaled_log_variance: 0x4E5D,
            },
            grandmaster_identity: ClockIdentity([identity; 8]),
            steps_removed: 1,
            time_source: TimeSource::Gps,
            ..AnnounceBody::default()
        };
        Announce::unicast(
            PortIdentity {
                clock_identity: ClockIdentity([identity; 8]),
                port_number: 1,
            },
            0,
            1,
            body,
        )
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn test_dscmp_is_reflexive() {
        let a = announce(6, 0x21, 1);
        assert_eq!(telco_dscmp(Some(&a), Some(&a), 1, 1), ComparisonResult::Unknown);
    }

    #[test]
    fn test_missing_side_loses() {
        let a = announce(6, 0x21, 1);
        assert_eq!(telco_dscmp(Some(&a), None, 1, 1), ComparisonResult::ABetter);
        assert_eq!(telco_dscmp(None, Some(&a), 1, 1), ComparisonResult::BBetter);
        assert_eq!(telco_dscmp(None, None, 1, 1), ComparisonResult::Unknown);
    }

    #[test]
    fn test_lower_clock_class_wins_over_priority() {
        // GM A: class 7, GM B: class 13; local priorities favor B
        let a = announce(7, 0x21, 1);
        let b = announce(13, 0x21, 2);
        assert_eq!(telco_dscmp(Some(&a), Some(&b), 2, 1), ComparisonResult::ABetter);
    }

    #[test]
    fn test_local_priority_breaks_quality_tie() {
        let a = announce(6, 0x21, 1);
        let b = announce(6, 0x21, 2);
        assert_eq!(telco_dscmp(Some(&a), Some(&b), 2, 1), ComparisonResult::BBetter);
    }

    #[test]
    fn test_identity_tie_break_on_equal_priorities() {
        let a = announce(6, 0x21, 1);
        let b = announce(6, 0x21, 2);
        // class 6 <= 127: topology tie-break on port identity
        assert_eq!(
            telco_dscmp(Some(&a), Some(&b), 1, 1),
            ComparisonResult::ABetterTopo
        );
    }

    #[test]
    fn test_steps_removed_tie_break() {
        let mut a = announce(6, 0x21, 1);
        let b = announce(6, 0x21, 2);
        a.body.steps_removed = 3;
        // b is two steps closer to the grandmaster
        assert_eq!(telco_dscmp(Some(&a), Some(&b), 1, 1), ComparisonResult::BBetter);
    }

    #[test]
    fn test_select_best_prefers_lower_class() {
        let mut candidates = HashMap::new();
        candidates.insert(addr(1), announce(7, 0x21, 1));
        candidates.insert(addr(2), announce(13, 0x21, 2));
        let mut priorities = HashMap::new();
        priorities.insert(addr(1), 2);
        priorities.insert(addr(2), 1);
        let config = BmcaConfig {
            max_clock_class: 52,
            max_clock_accuracy: 0xFE,
        };
        let (best, _) = select_best(&candidates, &priorities, &config).unwrap();
        assert_eq!(best, addr(1));
    }

    #[test]
    fn test_select_best_gated_by_clock_class() {
        let mut candidates = HashMap::new();
        candidates.insert(addr(1), announce(52, 0x21, 1));
        let mut priorities = HashMap::new();
        priorities.insert(addr(1), 1);
        let config = BmcaConfig {
            max_clock_class: 7,
            max_clock_accuracy: 0xFE,
        };
        assert!(select_best(&candidates, &priorities, &config).is_none());
    }

    #[test]
    fn test_reprioritize_ring_shift() {
        // {O:1, L:2, E:3, G:4}
        let o = addr(1);
        let l = addr(2);
        let e = addr(3);
        let g = addr(4);
        let mut priorities = HashMap::from([(o, 1), (l, 2), (e, 3), (g, 4)]);

        reprioritize(l, &mut priorities);
        assert_eq!(priorities, HashMap::from([(l, 1), (e, 2), (g, 3), (o, 4)]));

        reprioritize(o, &mut priorities);
        assert_eq!(priorities, HashMap::from([(o, 1), (l, 2), (e, 3), (g, 4)]));
    }

    #[test]
    fn test_reprioritize_keeps_permutation() {
        let mut priorities: HashMap<IpAddr, u8> =
            (1..=5).map(|i| (addr(i), i)).collect();
        reprioritize(addr(3), &mut priorities);
        let mut ranks: Vec<u8> = priorities.values().copied().collect();
        ranks.sort();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        assert_eq!(priorities[&addr(3)], 1);
    }
}
