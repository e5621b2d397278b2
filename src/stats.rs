/// Heap occupancy statistics, for diagnosing leaks and the like.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats
{
    /// Number of slabs carved out of the system allocator so far.
    pub slabs: usize,

    /// Total object slots across all slabs.
    pub capacity: usize,

    /// Objects currently allocated.
    pub live_objects: usize,

    /// Freed slots waiting to be handed out again.
    pub free_slots: usize,

    /// Slots whose generation counter ran out. These are never reused.
    pub retired_slots: usize,
}

impl Stats
{
    /// Slots that have never been handed out.
    pub fn untouched_slots(&self) -> usize
    {
        self.capacity
            .saturating_sub(self.live_objects + self.free_slots + self.retired_slots)
    }

    /// Fraction of the carved capacity holding live objects.
    pub fn occupancy(&self) -> f64
    {
        if self.capacity == 0 {
            0.0
        } else {
            self.live_objects as f64 / self.capacity as f64
        }
    }
}
