//! Default chunk selection policy.
//!
//! Grounded on `examples/original_source/src/interfaces/chunkselectorinterface.h`
//! for the contract shape (select/select_range/data_checked/reincluded/
//! reinsert) and on the availability-rarity ordering implied by the same
//! package's `ChunkManager`. The streaming override lives in `stream.rs`.

use std::collections::HashMap;

use crate::{chunk_store::ChunkStatus, piece_downloader::PieceDownloader, ChunkIndex};

/// Priority band a chunk can carry, ordered from most to least eager.
/// `Excluded` chunks are never selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Preview,
    First,
    Normal,
    Last,
    OnlySeed,
    Excluded,
}

/// Tracks per-chunk availability across the swarm and priority bands, and
/// answers "which chunk should this downloader fetch next".
pub(crate) struct ChunkSelector {
    chunk_count: usize,
    priorities: Vec<Priority>,
    /// How many known peers advertise each chunk; used for rarest-first
    /// ordering. Maintained by the caller via `note_availability`.
    availability: Vec<u32>,
}

impl ChunkSelector {
    pub fn new(chunk_count: usize) -> Self {
        Self {
            chunk_count,
            priorities: vec![Priority::Normal; chunk_count],
            availability: vec![0; chunk_count],
        }
    }

    pub fn set_priority(&mut self, index: ChunkIndex, priority: Priority) {
        if index < self.chunk_count {
            self.priorities[index] = priority;
        }
    }

    pub fn note_availability(&mut self, index: ChunkIndex, delta: i32) {
        if index >= self.chunk_count {
            return;
        }
        if delta < 0 {
            self.availability[index] =
                self.availability[index].saturating_sub((-delta) as u32);
        } else {
            self.availability[index] += delta as u32;
        }
    }

    fn candidate_order(&self) -> Vec<ChunkIndex> {
        let mut order: Vec<ChunkIndex> = (0..self.chunk_count)
            .filter(|&i| self.priorities[i] != Priority::Excluded)
            .collect();
        order.sort_by_key(|&i| (self.priorities[i], self.availability[i]));
        order
    }

    /// Picks a chunk for `pd`, preferring a chunk no other downloader is
    /// currently assigned to, falling back to one already in progress only
    /// when no unique candidate exists.
    pub fn select(
        &self,
        pd: &dyn PieceDownloader,
        statuses: &HashMap<ChunkIndex, ChunkStatus>,
        assignee_counts: &HashMap<ChunkIndex, usize>,
    ) -> Option<ChunkIndex> {
        let is_selectable = |i: ChunkIndex| -> bool {
            let status = statuses.get(&i).copied().unwrap_or(ChunkStatus::NotOnDisk);
            status != ChunkStatus::OnDisk && pd.has_chunk(i)
        };

        let mut fallback = None;
        for i in self.candidate_order() {
            if !is_selectable(i) {
                continue;
            }
            let assignees = assignee_counts.get(&i).copied().unwrap_or(0);
            if assignees == 0 {
                return Some(i);
            }
            if fallback.is_none() {
                fallback = Some(i);
            }
        }
        fallback
    }

    /// Picks the longest contiguous not-on-disk, not-excluded run starting
    /// at the rarest available index, capped at `max_len`.
    pub fn select_range(
        &self,
        statuses: &HashMap<ChunkIndex, ChunkStatus>,
        max_len: usize,
    ) -> Option<(ChunkIndex, ChunkIndex)> {
        let eligible = |i: ChunkIndex| -> bool {
            self.priorities[i] != Priority::Excluded
                && statuses.get(&i).copied().unwrap_or(ChunkStatus::NotOnDisk)
                    != ChunkStatus::OnDisk
        };

        let mut best: Option<(ChunkIndex, ChunkIndex)> = None;
        let mut run_start = None;
        for i in 0..self.chunk_count {
            if eligible(i) {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                let start = run_start.unwrap();
                let len = i - start + 1;
                if len > max_len.max(1) {
                    run_start = Some(i);
                    continue;
                }
                let current_len = best.map(|(s, e)| e - s + 1).unwrap_or(0);
                if len > current_len {
                    best = Some((start, i));
                }
            } else {
                run_start = None;
            }
        }
        best
    }

    pub fn reinsert(&mut self, _index: ChunkIndex) {
        // availability/priority state is untouched; the caller (Downloader)
        // is responsible for clearing the on-disk status before the chunk
        // becomes selectable again.
    }

    pub fn reincluded(&mut self, from: ChunkIndex, to: ChunkIndex) {
        for i in from..=to.min(self.chunk_count.saturating_sub(1)) {
            if self.priorities[i] == Priority::Excluded {
                self.priorities[i] = Priority::Normal;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece_downloader::PeerDownloader;

    fn pd_with_all(chunk_count: usize) -> PeerDownloader {
        let mut pd = PeerDownloader::new(1, chunk_count, 50);
        for i in 0..chunk_count {
            pd.set_has_chunk(i, true);
        }
        pd
    }

    #[test]
    fn test_select_skips_on_disk_and_excluded() {
        let mut sel = ChunkSelector::new(4);
        sel.set_priority(0, Priority::Excluded);
        let mut statuses = HashMap::new();
        statuses.insert(1, ChunkStatus::OnDisk);
        let pd = pd_with_all(4);
        let chosen = sel.select(&pd, &statuses, &HashMap::new());
        assert_eq!(chosen, Some(2));
    }

    #[test]
    fn test_select_prefers_unassigned_over_in_progress() {
        let sel = ChunkSelector::new(2);
        let pd = pd_with_all(2);
        let mut assignees = HashMap::new();
        assignees.insert(0, 1);
        let chosen = sel.select(&pd, &HashMap::new(), &assignees);
        assert_eq!(chosen, Some(1));
    }

    #[test]
    fn test_select_falls_back_when_all_in_progress() {
        let sel = ChunkSelector::new(2);
        let pd = pd_with_all(2);
        let mut assignees = HashMap::new();
        assignees.insert(0, 1);
        assignees.insert(1, 2);
        let chosen = sel.select(&pd, &HashMap::new(), &assignees);
        assert!(chosen.is_some());
    }

    #[test]
    fn test_select_range_respects_max_len() {
        let sel = ChunkSelector::new(10);
        let range = sel.select_range(&HashMap::new(), 3).unwrap();
        assert!(range.1 - range.0 + 1 <= 3);
    }

    #[test]
    fn test_reincluded_clears_excluded() {
        let mut sel = ChunkSelector::new(4);
        sel.set_priority(1, Priority::Excluded);
        sel.reincluded(0, 3);
        assert_eq!(sel.priorities[1], Priority::Normal);
    }
}
