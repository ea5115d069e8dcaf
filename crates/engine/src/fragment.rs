use std::collections::BTreeMap;

use codec::segment::{ReceptionClaim, ReportSegment};

/// An ordered set of disjoint closed integer intervals.
///
/// Intervals that touch or overlap are coalesced on insert, so the stored
/// fragments are always sorted, non-overlapping and non-adjacent. The
/// receiver keeps one of these over received red bytes, the sender over
/// bytes acknowledged by the receiver.
///
/// # Test
///
/// ```
/// use ltp_server_engine::fragment::FragmentSet;
///
/// let mut set = FragmentSet::default();
/// set.insert(0, 9);
/// set.insert(20, 29);
/// set.insert(10, 19);
///
/// assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 29)]);
/// assert!(set.contains(5, 25));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentSet {
    fragments: BTreeMap<u64, u64>,
}

impl FragmentSet {
    /// Insert the closed interval `[begin, end]`, coalescing with any
    /// overlapping or adjacent stored fragments.
    pub fn insert(&mut self, begin: u64, end: u64) {
        debug_assert!(begin <= end);

        let mut new_begin = begin;
        let mut new_end = end;

        // Walk left from the last fragment starting at or before end + 1;
        // every fragment seen until one ends before begin - 1 gets absorbed.
        let mut absorbed = Vec::new();
        for (&b, &e) in self.fragments.range(..=end.saturating_add(1)).rev() {
            if e.saturating_add(1) < begin {
                break;
            }

            absorbed.push(b);
            new_begin = new_begin.min(b);
            new_end = new_end.max(e);
        }

        for b in absorbed {
            self.fragments.remove(&b);
        }

        self.fragments.insert(new_begin, new_end);
    }

    /// True if a single stored fragment covers all of `[begin, end]`.
    pub fn contains(&self, begin: u64, end: u64) -> bool {
        self.fragments
            .range(..=begin)
            .next_back()
            .is_some_and(|(_, &e)| e >= end)
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.fragments.iter().map(|(&b, &e)| (b, e))
    }

    /// Build the reception report covering `[lower_bound, upper_bound)` from
    /// the stored fragments, with claim offsets relative to the lower bound.
    ///
    /// Returns `None` when no stored byte falls inside the scope; serial
    /// numbers are left zero for the caller to assign.
    pub fn populate_report_segment(
        &self,
        lower_bound: u64,
        upper_bound: u64,
    ) -> Option<ReportSegment> {
        debug_assert!(lower_bound < upper_bound);

        // start from the last fragment at or before the lower bound, if any
        let start = self
            .fragments
            .range(..=lower_bound)
            .next_back()
            .map_or(lower_bound, |(&b, _)| b);

        let mut claims = Vec::new();
        for (&b, &e) in self.fragments.range(start..upper_bound) {
            let begin = b.max(lower_bound);
            let end = e.min(upper_bound - 1);
            if begin > end {
                continue;
            }

            claims.push(ReceptionClaim {
                offset: begin - lower_bound,
                length: end - begin + 1,
            });
        }

        if claims.is_empty() {
            return None;
        }

        Some(ReportSegment {
            report_serial_number: 0,
            checkpoint_serial_number: 0,
            upper_bound,
            lower_bound,
            claims,
        })
    }

    /// Union the report's reception claims into the set.
    pub fn add_report_claims(&mut self, report: &ReportSegment) {
        for claim in &report.claims {
            debug_assert!(claim.length >= 1);
            let begin = report.lower_bound + claim.offset;
            self.insert(begin, begin + claim.length - 1);
        }
    }
}

/// The complement of a report's claims within its scope, as absolute closed
/// intervals: the bytes the receiver did not get, which the sender must
/// retransmit.
pub fn report_segment_gaps(report: &ReportSegment) -> Vec<(u64, u64)> {
    let mut gaps = Vec::new();
    let mut cursor = report.lower_bound;
    for claim in &report.claims {
        let begin = report.lower_bound + claim.offset;
        if begin > cursor {
            gaps.push((cursor, begin - 1));
        }

        cursor = cursor.max(begin + claim.length);
    }

    if cursor < report.upper_bound {
        gaps.push((cursor, report.upper_bound - 1));
    }

    gaps
}

/// Split an oversize report into reports of at most `max_claims` claims each.
///
/// The pieces' claim lists concatenate to the original list and their
/// `[lower_bound, upper_bound)` scopes tile the original scope, so every
/// piece stands on its own. Report serial numbers are left zero for the
/// caller to assign; the checkpoint serial number is copied to every piece.
pub fn split_report_segment(report: &ReportSegment, max_claims: u64) -> Vec<ReportSegment> {
    debug_assert!(max_claims >= 1);

    let chunks: Vec<&[ReceptionClaim]> = report.claims.chunks(max_claims as usize).collect();
    let mut pieces = Vec::with_capacity(chunks.len());
    let mut lower_bound = report.lower_bound;

    for (i, chunk) in chunks.iter().enumerate() {
        let upper_bound = if i + 1 == chunks.len() {
            report.upper_bound
        } else {
            // last claim of this piece, in absolute offsets
            let last = chunk[chunk.len() - 1];
            report.lower_bound + last.offset + last.length
        };

        pieces.push(ReportSegment {
            report_serial_number: 0,
            checkpoint_serial_number: report.checkpoint_serial_number,
            upper_bound,
            lower_bound,
            claims: chunk
                .iter()
                .map(|claim| ReceptionClaim {
                    offset: report.lower_bound + claim.offset - lower_bound,
                    length: claim.length,
                })
                .collect(),
        });

        lower_bound = upper_bound;
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(ranges: &[(u64, u64)]) -> FragmentSet {
        let mut set = FragmentSet::default();
        for &(b, e) in ranges {
            set.insert(b, e);
        }
        set
    }

    #[test]
    fn inserts_stay_sorted_disjoint_and_non_adjacent() {
        let mut set = FragmentSet::default();
        set.insert(10, 20);
        set.insert(40, 50);
        set.insert(0, 5);

        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 5), (10, 20), (40, 50)]);

        // overlap on the left, adjacency on the right
        set.insert(3, 9);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 20), (40, 50)]);

        // bridge everything
        set.insert(21, 39);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 50)]);

        // duplicates and contained ranges change nothing
        set.insert(0, 50);
        set.insert(7, 7);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 50)]);
    }

    #[test]
    fn union_matches_inserted_ranges_regardless_of_order() {
        // any insertion order must yield the same canonical set
        let ranges = [(8u64, 9u64), (0, 3), (5, 5), (4, 4), (20, 30), (10, 19)];
        let mut orders = vec![ranges.to_vec()];
        orders.push(ranges.iter().rev().copied().collect());
        orders.push({
            let mut v = ranges.to_vec();
            v.swap(0, 3);
            v.swap(1, 4);
            v
        });

        for order in orders {
            let set = set_of(&order);
            assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 9), (10, 30)]);
        }
    }

    #[test]
    fn contains_requires_full_coverage() {
        let set = set_of(&[(0, 9), (11, 43)]);

        assert!(set.contains(0, 9));
        assert!(set.contains(11, 43));
        assert!(set.contains(20, 30));
        assert!(!set.contains(0, 10));
        assert!(!set.contains(9, 11));
        assert!(!set.contains(44, 44));
    }

    #[test]
    fn populated_report_clamps_to_the_scope() {
        let set = set_of(&[(0, 9), (11, 12), (14, 43)]);

        let report = set.populate_report_segment(5, 20).unwrap();
        assert_eq!(report.lower_bound, 5);
        assert_eq!(report.upper_bound, 20);
        assert_eq!(
            report.claims,
            vec![
                ReceptionClaim { offset: 0, length: 5 },
                ReceptionClaim { offset: 6, length: 2 },
                ReceptionClaim { offset: 9, length: 6 },
            ]
        );

        assert!(set.populate_report_segment(44, 60).is_none());
    }

    #[test]
    fn claims_round_trip_through_a_fragment_set() {
        let set = set_of(&[(0, 9), (11, 12), (14, 43)]);
        let report = set.populate_report_segment(0, 44).unwrap();

        let mut acked = FragmentSet::default();
        acked.add_report_claims(&report);

        assert_eq!(acked, set);
    }

    #[test]
    fn gaps_complement_the_claims() {
        let set = set_of(&[(0, 9), (11, 12), (14, 43)]);
        let report = set.populate_report_segment(0, 44).unwrap();

        assert_eq!(report_segment_gaps(&report), vec![(10, 10), (13, 13)]);

        // a scope that starts and ends inside gaps
        let report = set.populate_report_segment(10, 13).unwrap();
        assert_eq!(report.claims, vec![ReceptionClaim { offset: 1, length: 2 }]);
        assert_eq!(report_segment_gaps(&report), vec![(10, 10)]);

        // full coverage has no gaps
        let full = set_of(&[(0, 43)]);
        let report = full.populate_report_segment(0, 44).unwrap();
        assert_eq!(report_segment_gaps(&report), Vec::<(u64, u64)>::new());
    }

    #[test]
    fn split_report_pieces_tile_and_concatenate() {
        let claims: Vec<ReceptionClaim> = (0..7)
            .map(|i| ReceptionClaim {
                offset: i * 10,
                length: 5,
            })
            .collect();
        let report = ReportSegment {
            report_serial_number: 99,
            checkpoint_serial_number: 42,
            lower_bound: 1000,
            upper_bound: 1100,
            claims: claims.clone(),
        };

        for max_claims in 1..=8u64 {
            let pieces = split_report_segment(&report, max_claims);

            // scopes tile the original scope
            assert_eq!(pieces[0].lower_bound, report.lower_bound);
            assert_eq!(pieces[pieces.len() - 1].upper_bound, report.upper_bound);
            for pair in pieces.windows(2) {
                assert_eq!(pair[0].upper_bound, pair[1].lower_bound);
            }

            // claim lists concatenate to the original, in absolute offsets
            let rebased: Vec<ReceptionClaim> = pieces
                .iter()
                .flat_map(|piece| {
                    piece.claims.iter().map(|claim| ReceptionClaim {
                        offset: piece.lower_bound + claim.offset - report.lower_bound,
                        length: claim.length,
                    })
                })
                .collect();
            assert_eq!(rebased, claims);

            for piece in &pieces {
                assert!(piece.claims.len() as u64 <= max_claims);
                assert!(piece.lower_bound < piece.upper_bound);
                assert_eq!(piece.checkpoint_serial_number, 42);
            }
        }
    }
}
