//! GTID set arithmetic.
//!
//! A `gtid_executed` value is a comma separated list of UUID sets, each a
//! server UUID followed by one or more `:first[-last]` intervals, e.g.
//! `3E11FA47-71CA-11E1-9E33-C80AA9429562:1-5:11-18`. The reconciler needs
//! two operations on these: counting transactions (to pick a reboot seed)
//! and set containment (to detect errant transactions on a join candidate).

use std::{collections::BTreeMap, fmt, str::FromStr};

/// A parsed GTID set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GtidSet {
    /// Merged, ordered intervals per (lowercased) source UUID.
    intervals: BTreeMap<String, Vec<(u64, u64)>>,
}

/// Error for a malformed GTID set string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidGtidSet(pub String);

impl fmt::Display for InvalidGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid GTID set: '{}'", self.0)
    }
}

impl std::error::Error for InvalidGtidSet {}

impl FromStr for GtidSet {
    type Err = InvalidGtidSet;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::default();
        for uuid_set in source.split(',') {
            let uuid_set = uuid_set.trim();
            if uuid_set.is_empty() {
                continue;
            }
            let mut parts = uuid_set.split(':');
            let uuid = match parts.next() {
                Some(uuid) if !uuid.is_empty() => uuid.to_ascii_lowercase(),
                _ => return Err(InvalidGtidSet(source.to_string())),
            };
            let mut intervals = vec![];
            for range in parts {
                let (first, last) = match range.find('-') {
                    Some(dash) => (&range[.. dash], &range[dash + 1 ..]),
                    None => (range, range),
                };
                let first = first
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| InvalidGtidSet(source.to_string()))?;
                let last = last
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| InvalidGtidSet(source.to_string()))?;
                if last < first {
                    return Err(InvalidGtidSet(source.to_string()));
                }
                intervals.push((first, last));
            }
            if intervals.is_empty() {
                return Err(InvalidGtidSet(source.to_string()));
            }
            let merged = set.intervals.entry(uuid).or_insert_with(Vec::new);
            merged.extend(intervals);
            *merged = merge_intervals(merged);
        }
        Ok(set)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.intervals {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", uuid)?;
            for (lo, hi) in intervals {
                if lo == hi {
                    write!(f, ":{}", lo)?;
                } else {
                    write!(f, ":{}-{}", lo, hi)?;
                }
            }
        }
        Ok(())
    }
}

fn merge_intervals(intervals: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut sorted = intervals.to_vec();
    sorted.sort_unstable();
    let mut merged: Vec<(u64, u64)> = vec![];
    for (lo, hi) in sorted {
        match merged.last_mut() {
            Some(last) if lo <= last.1 + 1 => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

impl GtidSet {
    /// Total number of transactions in the set.
    pub fn count(&self) -> u64 {
        self.intervals
            .values()
            .flatten()
            .map(|(lo, hi)| hi - lo + 1)
            .sum()
    }

    /// Check if the set contains no transactions.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Check if every transaction of `self` is also in `other`. Transactions
    /// present here but not in `other` are errant from `other`'s viewpoint.
    pub fn is_subset(&self, other: &GtidSet) -> bool {
        self.intervals.iter().all(|(uuid, intervals)| {
            let theirs = match other.intervals.get(uuid) {
                Some(theirs) => theirs,
                None => return false,
            };
            intervals.iter().all(|(lo, hi)| {
                theirs
                    .iter()
                    .any(|(their_lo, their_hi)| their_lo <= lo && hi <= their_hi)
            })
        })
    }
}

/// Transaction count of a raw `gtid_executed` string; malformed or empty
/// sets count as zero.
pub fn count_gtids(gtids: &str) -> u64 {
    gtids.parse::<GtidSet>().map(|set| set.count()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_count() {
        let set: GtidSet = "A:1-5,b:3".parse().unwrap();
        assert_eq!(set.count(), 6);
        assert_eq!(count_gtids("a:1-5:11-18"), 13);
        assert_eq!(count_gtids(""), 0);
        assert_eq!(count_gtids("not a gtid set"), 0);
    }

    #[test]
    fn adjacent_and_overlapping_intervals_merge() {
        let set: GtidSet = "a:1-3:4-6:5-10".parse().unwrap();
        assert_eq!(set.to_string(), "a:1-10");
        assert_eq!(set.count(), 10);
    }

    #[test]
    fn subset_detects_errant_transactions() {
        let cluster: GtidSet = "a:1-100,b:1-10".parse().unwrap();
        let clean: GtidSet = "a:1-50".parse().unwrap();
        let errant: GtidSet = "a:1-50,c:1".parse().unwrap();
        let ahead: GtidSet = "a:1-101".parse().unwrap();

        assert!(clean.is_subset(&cluster));
        assert!(!errant.is_subset(&cluster));
        assert!(!ahead.is_subset(&cluster));
        assert!(GtidSet::default().is_subset(&cluster));
    }

    #[test]
    fn uuids_compare_case_insensitively() {
        let a: GtidSet = "ABC:1-5".parse().unwrap();
        let b: GtidSet = "abc:1-10".parse().unwrap();
        assert!(a.is_subset(&b));
    }

    #[test]
    fn malformed_sets_are_rejected() {
        assert!("a".parse::<GtidSet>().is_err());
        assert!("a:5-1".parse::<GtidSet>().is_err());
        assert!(":1-5".parse::<GtidSet>().is_err());
    }
}
