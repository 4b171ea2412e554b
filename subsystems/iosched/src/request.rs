//! # I/O Descriptors
//!
//! The request descriptor handed between the request-queue layer, the
//! elevator and the driver, plus the I/O unit (`Bio`) that is either merged
//! into an existing descriptor or becomes a new one.
//!
//! A descriptor carries three index positions owned by the elevator: its key
//! in a sector-ordered index, its slot in a FIFO and its key in the merge
//! hash. The positions live on the descriptor so every index can be left in
//! one step when the descriptor is retired.

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::history::IoContext;

// =============================================================================
// BASIC TYPES
// =============================================================================

/// 512-byte sector number
pub type Sector = u64;

/// Scheduler time in ticks (1 tick = 1 ms)
pub type Tick = u64;

/// Submitter identity (process id). `0` names the shared async class.
pub type SubmitterId = u32;

/// Block device identity
pub type DeviceId = u32;

/// Submitter key of the async class
pub const ASYNC_SUBMITTER: SubmitterId = 0;

/// Data direction
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Device to memory
    Read  = 0,
    /// Memory to device
    Write = 1,
}

impl Direction {
    /// Index for per-direction arrays
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

// =============================================================================
// I/O PRIORITY
// =============================================================================

/// Number of priority levels inside a class
pub const IOPRIO_LEVELS: usize = 8;

/// Default best-effort level (nice 0)
pub const IOPRIO_NORM: u8 = 4;

/// Scheduling class
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IoClass {
    /// Served before everything else
    RealTime   = 1,
    /// Round-robin at eight levels
    BestEffort = 2,
    /// Served only when the disk is otherwise idle
    Idle       = 3,
}

/// Class plus level (0 = highest, 7 = lowest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoPriority {
    /// Scheduling class
    pub class: IoClass,
    /// Level within the class
    pub level: u8,
}

impl IoPriority {
    /// Best-effort at the normal level
    pub const NORMAL: Self = Self::new(IoClass::BestEffort, IOPRIO_NORM);

    /// Create a priority, clamping the level to the valid range
    pub const fn new(class: IoClass, level: u8) -> Self {
        let level = if level as usize >= IOPRIO_LEVELS {
            (IOPRIO_LEVELS - 1) as u8
        } else {
            level
        };
        Self { class, level }
    }

    /// Best-effort at `level`
    pub const fn best_effort(level: u8) -> Self {
        Self::new(IoClass::BestEffort, level)
    }

    /// Real-time at `level`
    pub const fn realtime(level: u8) -> Self {
        Self::new(IoClass::RealTime, level)
    }

    /// Idle class
    pub const fn idle() -> Self {
        Self::new(IoClass::Idle, (IOPRIO_LEVELS - 1) as u8)
    }

    /// Compact encoding used as a lookup key
    pub const fn code(self) -> u16 {
        ((self.class as u16) << 8) | self.level as u16
    }
}

impl Default for IoPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

// =============================================================================
// FLAGS
// =============================================================================

bitflags! {
    /// Descriptor state and attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u32 {
        /// Submitter waits for this I/O
        const SYNC        = 1 << 0;
        /// Never merge anything into this descriptor
        const NOMERGE     = 1 << 1;
        /// Ordering barrier, must not be reordered across
        const BARRIER     = 1 << 2;
        /// Do not let later descriptors pass this one on the dispatch list
        const SOFTBARRIER = 1 << 3;
        /// Handed to the driver at least once
        const STARTED     = 1 << 4;
        /// Went through the elevator's sorted insertion path
        const SORTED      = 1 << 5;
        /// Elevator holds per-descriptor state for this request
        const ELVPRIV     = 1 << 6;
        /// Currently linked on the dispatch list
        const QUEUED      = 1 << 7;
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Stable handle to a descriptor in the request arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle {
    index: u32,
    generation: u32,
}

impl RequestHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

// =============================================================================
// BIO
// =============================================================================

/// One I/O unit as submitted by the upper layers
#[derive(Debug, Clone)]
pub struct Bio {
    /// Target device
    pub device: DeviceId,
    /// Data direction
    pub dir: Direction,
    /// First sector
    pub sector: Sector,
    /// Length in sectors
    pub nr_sectors: u32,
    /// Scatter/gather segments
    pub nr_segments: u16,
    /// Submitting process
    pub submitter: SubmitterId,
    /// Explicit priority, else taken from the submitter context
    pub prio: Option<IoPriority>,
    /// SYNC / BARRIER / NOMERGE attributes
    pub flags: RequestFlags,
    /// Submitter context, shared across devices
    pub ioc: Option<Arc<IoContext>>,
}

impl Bio {
    /// Create a bio with one segment
    pub fn new(device: DeviceId, dir: Direction, sector: Sector, nr_sectors: u32) -> Self {
        Self {
            device,
            dir,
            sector,
            nr_sectors,
            nr_segments: 1,
            submitter: ASYNC_SUBMITTER,
            prio: None,
            flags: if dir == Direction::Read {
                RequestFlags::SYNC
            } else {
                RequestFlags::empty()
            },
            ioc: None,
        }
    }

    /// Read of `nr_sectors` at `sector`
    pub fn read(device: DeviceId, sector: Sector, nr_sectors: u32) -> Self {
        Self::new(device, Direction::Read, sector, nr_sectors)
    }

    /// Write of `nr_sectors` at `sector`
    pub fn write(device: DeviceId, sector: Sector, nr_sectors: u32) -> Self {
        Self::new(device, Direction::Write, sector, nr_sectors)
    }

    /// Attribute to a submitter
    pub fn with_submitter(mut self, submitter: SubmitterId) -> Self {
        self.submitter = submitter;
        self
    }

    /// Attach the submitter context (also sets the submitter id)
    pub fn with_context(mut self, ioc: Arc<IoContext>) -> Self {
        self.submitter = ioc.id();
        self.ioc = Some(ioc);
        self
    }

    /// Explicit priority
    pub fn with_priority(mut self, prio: IoPriority) -> Self {
        self.prio = Some(prio);
        self
    }

    /// Mark synchronous
    pub fn sync(mut self) -> Self {
        self.flags.insert(RequestFlags::SYNC);
        self
    }

    /// Mark as an ordering barrier
    pub fn barrier(mut self) -> Self {
        self.flags.insert(RequestFlags::BARRIER);
        self
    }

    /// Set segment count
    pub fn with_segments(mut self, nr_segments: u16) -> Self {
        self.nr_segments = nr_segments;
        self
    }

    /// End sector (exclusive)
    #[inline]
    pub fn end_sector(&self) -> Sector {
        self.sector + self.nr_sectors as Sector
    }

    /// Whether the submitter waits for completion
    #[inline]
    pub fn is_sync(&self) -> bool {
        self.flags.contains(RequestFlags::SYNC)
    }

    /// Explicit priority, else the submitter context's, else the default
    pub fn effective_priority(&self) -> IoPriority {
        self.prio
            .or_else(|| self.ioc.as_ref().map(|ioc| ioc.priority()))
            .unwrap_or_default()
    }
}

// =============================================================================
// REQUEST
// =============================================================================

/// A pending or in-flight block I/O descriptor
#[derive(Debug, Clone)]
pub struct Request {
    /// Target device
    pub device: DeviceId,
    /// Data direction
    pub dir: Direction,
    /// First sector
    pub sector: Sector,
    /// Length in sectors
    pub nr_sectors: u32,
    /// Scatter/gather segments
    pub nr_segments: u16,
    /// Submitting process
    pub submitter: SubmitterId,
    /// Effective priority
    pub prio: IoPriority,
    /// Arrival time
    pub arrival: Tick,
    /// State and attribute flags
    pub flags: RequestFlags,
    /// Submitter context
    pub ioc: Option<Arc<IoContext>>,

    /// FIFO expiry time, set by the policy on admission
    pub(crate) fifo_time: Tick,
    /// Policy-private stream tag (CFQ queue id)
    pub(crate) stream: Option<u32>,
    /// Key in a sector-ordered index
    pub(crate) sort_key: Option<Sector>,
    /// Position in a FIFO list
    pub(crate) fifo_seq: Option<u64>,
    /// Key in the merge hash
    pub(crate) hash_key: Option<Sector>,
}

impl Request {
    /// Build a descriptor from a bio arriving at `now`
    pub fn from_bio(bio: &Bio, now: Tick) -> Self {
        let prio = bio.effective_priority();
        Self {
            device: bio.device,
            dir: bio.dir,
            sector: bio.sector,
            nr_sectors: bio.nr_sectors,
            nr_segments: bio.nr_segments,
            submitter: bio.submitter,
            prio,
            arrival: now,
            flags: bio.flags & (RequestFlags::SYNC | RequestFlags::BARRIER | RequestFlags::NOMERGE),
            ioc: bio.ioc.clone(),
            fifo_time: now,
            stream: None,
            sort_key: None,
            fifo_seq: None,
            hash_key: None,
        }
    }

    /// End sector (exclusive)
    #[inline]
    pub fn end_sector(&self) -> Sector {
        self.sector + self.nr_sectors as Sector
    }

    /// Whether the submitter waits for completion
    #[inline]
    pub fn is_sync(&self) -> bool {
        self.flags.contains(RequestFlags::SYNC)
    }

    /// Whether the driver has seen this descriptor
    #[inline]
    pub fn is_started(&self) -> bool {
        self.flags.contains(RequestFlags::STARTED)
    }

    /// Whether anything may still be merged into this descriptor
    #[inline]
    pub fn is_mergeable(&self) -> bool {
        !self.flags.intersects(
            RequestFlags::NOMERGE
                | RequestFlags::STARTED
                | RequestFlags::BARRIER
                | RequestFlags::SOFTBARRIER,
        )
    }

    /// FIFO expiry time assigned by the policy
    #[inline]
    pub fn fifo_time(&self) -> Tick {
        self.fifo_time
    }

    /// Sector-index key, if indexed
    #[inline]
    pub fn sort_key(&self) -> Option<Sector> {
        self.sort_key
    }

    /// Merge-hash key, if hashed
    #[inline]
    pub fn hash_key(&self) -> Option<Sector> {
        self.hash_key
    }

    /// Whether the descriptor sits on any elevator index
    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.sort_key.is_some() || self.fifo_seq.is_some() || self.hash_key.is_some()
    }

    /// Extend at the end with `bio`
    pub(crate) fn back_merge(&mut self, bio: &Bio) {
        self.nr_sectors += bio.nr_sectors;
        self.nr_segments = self.nr_segments.saturating_add(bio.nr_segments);
        self.flags |= bio.flags & RequestFlags::SYNC;
    }

    /// Extend at the start with `bio`
    pub(crate) fn front_merge(&mut self, bio: &Bio) {
        self.sector = bio.sector;
        self.nr_sectors += bio.nr_sectors;
        self.nr_segments = self.nr_segments.saturating_add(bio.nr_segments);
        self.flags |= bio.flags & RequestFlags::SYNC;
    }

    /// Absorb the contiguous descriptor `next` that follows this one
    pub(crate) fn absorb(&mut self, next: &Request) {
        self.nr_sectors += next.nr_sectors;
        self.nr_segments = self.nr_segments.saturating_add(next.nr_segments);
        if next.arrival < self.arrival {
            self.arrival = next.arrival;
        }
        self.flags |= next.flags & RequestFlags::SYNC;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_clamps_level() {
        let prio = IoPriority::best_effort(12);
        assert_eq!(prio.level, 7);
        assert_eq!(IoPriority::default(), IoPriority::NORMAL);
    }

    #[test]
    fn test_bio_defaults() {
        let read = Bio::read(1, 100, 8);
        assert!(read.is_sync());
        assert_eq!(read.end_sector(), 108);

        let write = Bio::write(1, 0, 8);
        assert!(!write.is_sync());
        assert!(write.clone().sync().is_sync());
    }

    #[test]
    fn test_request_merge_geometry() {
        let mut rq = Request::from_bio(&Bio::write(1, 8, 8), 10);
        rq.back_merge(&Bio::write(1, 16, 8));
        assert_eq!((rq.sector, rq.end_sector()), (8, 24));
        rq.front_merge(&Bio::write(1, 0, 8));
        assert_eq!((rq.sector, rq.end_sector()), (0, 24));
        assert_eq!(rq.nr_segments, 3);
    }

    #[test]
    fn test_mergeable_flags() {
        let mut rq = Request::from_bio(&Bio::write(1, 0, 8), 0);
        assert!(rq.is_mergeable());
        rq.flags.insert(RequestFlags::STARTED);
        assert!(!rq.is_mergeable());

        let barrier = Request::from_bio(&Bio::write(1, 0, 8).barrier(), 0);
        assert!(!barrier.is_mergeable());
    }
}
