//! CFQ service rings.
//!
//! Queues with pending work sit on exactly one ring:
//!
//! ```text
//!   levels[0..8]  best-effort round-robin, one ring per level
//!   current       being served this round (levels are spliced in here)
//!   busy          expired with requests still in flight
//!   idle          idle class, served after a grace period
//! ```

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::queue::QueueId;
use crate::request::IOPRIO_LEVELS;

/// Which ring a queue sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    /// Best-effort ring for one level
    Level(u8),
    /// Current round
    Current,
    /// Expired with requests in flight
    Busy,
    /// Idle class
    Idle,
}

/// The set of rings plus the level round-robin cursor
#[derive(Debug, Default)]
pub struct ServiceRings {
    levels: [VecDeque<QueueId>; IOPRIO_LEVELS],
    current: VecDeque<QueueId>,
    busy: VecDeque<QueueId>,
    idle: VecDeque<QueueId>,
    cur_prio: usize,
    cur_end_prio: usize,
}

impl ServiceRings {
    /// Create empty rings
    pub fn new() -> Self {
        Self::default()
    }

    fn ring(&self, ring: Ring) -> &VecDeque<QueueId> {
        match ring {
            Ring::Level(level) => &self.levels[level as usize],
            Ring::Current => &self.current,
            Ring::Busy => &self.busy,
            Ring::Idle => &self.idle,
        }
    }

    fn ring_mut(&mut self, ring: Ring) -> &mut VecDeque<QueueId> {
        match ring {
            Ring::Level(level) => &mut self.levels[level as usize],
            Ring::Current => &mut self.current,
            Ring::Busy => &mut self.busy,
            Ring::Idle => &mut self.idle,
        }
    }

    /// First queue on `ring`
    #[inline]
    pub fn head(&self, ring: Ring) -> Option<QueueId> {
        self.ring(ring).front().copied()
    }

    /// Whether `ring` is empty
    #[inline]
    pub fn is_empty(&self, ring: Ring) -> bool {
        self.ring(ring).is_empty()
    }

    /// Unlink `id` from `ring`
    pub fn remove(&mut self, ring: Ring, id: QueueId) -> bool {
        let list = self.ring_mut(ring);
        match list.iter().position(|&q| q == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Put `id` at the head of `ring`
    pub fn push_front(&mut self, ring: Ring, id: QueueId) {
        self.ring_mut(ring).push_front(id);
    }

    /// Put `id` at the tail of `ring`
    pub fn push_back(&mut self, ring: Ring, id: QueueId) {
        self.ring_mut(ring).push_back(id);
    }

    /// Insert `id` at `pos` (clamped to the ring length)
    pub fn insert_at(&mut self, ring: Ring, pos: usize, id: QueueId) {
        let list = self.ring_mut(ring);
        let pos = pos.min(list.len());
        list.insert(pos, id);
    }

    /// Queues on `ring`, head first
    pub fn iter(&self, ring: Ring) -> impl Iterator<Item = QueueId> + '_ {
        self.ring(ring).iter().copied()
    }

    /// Move the next non-empty best-effort level into the current round.
    ///
    /// Levels are visited in a widening window: each pass covers
    /// `cur_prio..=cur_end_prio`, and the window grows by one level every
    /// time it comes up empty, so higher levels are served more often
    /// without starving the lower ones. Returns the level and the queues
    /// moved.
    pub fn next_prio_level(&mut self) -> Option<(usize, Vec<QueueId>)> {
        let mut wrapped = false;
        let prio = loop {
            if let Some(p) = (self.cur_prio..=self.cur_end_prio).find(|&p| !self.levels[p].is_empty()) {
                break p;
            }
            self.cur_prio = 0;
            self.cur_end_prio += 1;
            if self.cur_end_prio == IOPRIO_LEVELS {
                self.cur_end_prio = 0;
                if wrapped {
                    return None;
                }
                wrapped = true;
            }
        };

        let moved: Vec<QueueId> = self.levels[prio].drain(..).collect();
        self.current.extend(moved.iter().copied());

        self.cur_prio = prio + 1;
        if self.cur_prio > self.cur_end_prio {
            self.cur_end_prio = self.cur_prio;
            self.cur_prio = 0;
        }
        if self.cur_end_prio == IOPRIO_LEVELS {
            self.cur_prio = 0;
            self.cur_end_prio = 0;
        }
        Some((prio, moved))
    }

    /// Total queues across all rings
    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum::<usize>()
            + self.current.len()
            + self.busy.len()
            + self.idle.len()
    }

    /// Every ring with its members, for draining and checks
    pub fn all(&self) -> Vec<(Ring, QueueId)> {
        let mut out = Vec::with_capacity(self.len());
        for (level, list) in self.levels.iter().enumerate() {
            out.extend(list.iter().map(|&id| (Ring::Level(level as u8), id)));
        }
        out.extend(self.busy.iter().map(|&id| (Ring::Busy, id)));
        out.extend(self.current.iter().map(|&id| (Ring::Current, id)));
        out.extend(self.idle.iter().map(|&id| (Ring::Idle, id)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_level_splices_into_current() {
        let mut rings = ServiceRings::new();
        rings.push_back(Ring::Level(4), 1);
        rings.push_back(Ring::Level(4), 2);

        let (level, moved) = rings.next_prio_level().unwrap();
        assert_eq!(level, 4);
        assert_eq!(moved, [1, 2]);
        assert!(rings.is_empty(Ring::Level(4)));
        assert_eq!(rings.iter(Ring::Current).collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn test_higher_levels_served_more_often() {
        let mut rings = ServiceRings::new();
        let mut order = Vec::new();
        for _ in 0..6 {
            rings.push_back(Ring::Level(0), 10);
            rings.push_back(Ring::Level(2), 12);
            let (level, _) = rings.next_prio_level().unwrap();
            order.push(level);
            for (ring, id) in rings.all() {
                rings.remove(ring, id);
            }
        }
        assert_eq!(order, [0, 0, 0, 2, 0, 2]);
    }

    #[test]
    fn test_empty_levels() {
        let mut rings = ServiceRings::new();
        assert!(rings.next_prio_level().is_none());
        rings.push_back(Ring::Idle, 3);
        assert!(rings.next_prio_level().is_none());
        assert_eq!(rings.len(), 1);
    }

    #[test]
    fn test_remove_and_insert_at() {
        let mut rings = ServiceRings::new();
        for id in [1, 2, 3] {
            rings.push_back(Ring::Busy, id);
        }
        assert!(rings.remove(Ring::Busy, 2));
        assert!(!rings.remove(Ring::Busy, 2));
        rings.insert_at(Ring::Busy, 1, 9);
        rings.insert_at(Ring::Busy, 99, 8);
        assert_eq!(rings.iter(Ring::Busy).collect::<Vec<_>>(), [1, 9, 3, 8]);
        assert_eq!(rings.head(Ring::Busy), Some(1));
    }
}
