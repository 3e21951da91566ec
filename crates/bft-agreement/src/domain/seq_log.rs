//! Bounded window of per-sequence-number slots.

use shared_types::Seqno;

/// A value that can be reset in place when its slot is reused.
pub trait LogSlot {
    fn clear(&mut self);
}

/// Circular log covering sequence numbers in `(head, head + capacity]`.
///
/// Slots are reused as the head advances; a slot is cleared lazily the first
/// time it is fetched for a sequence number it did not hold before.
#[derive(Debug, Clone)]
pub struct SequenceLog<T: LogSlot> {
    head: Seqno,
    capacity: u64,
    mask: u64,
    slots: Vec<(Seqno, T)>,
}

impl<T: LogSlot> SequenceLog<T> {
    /// Log of `capacity` slots starting just above `head`.
    ///
    /// `make` builds the initial value of each slot.
    pub fn new(capacity: u64, head: Seqno, mut make: impl FnMut() -> T) -> Self {
        assert!(capacity > 0, "sequence log capacity must be positive");
        let size = capacity.next_power_of_two();
        let slots = (0..size).map(|_| (Seqno::MAX, make())).collect();
        Self {
            head,
            capacity,
            mask: size - 1,
            slots,
        }
    }

    /// Lowest sequence number not covered (the window is exclusive of it).
    pub fn head(&self) -> Seqno {
        self.head
    }

    /// Maximum number of sequence numbers covered.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// True if `n` falls inside `(head, head + capacity]`.
    pub fn within_range(&self, n: Seqno) -> bool {
        n > self.head && n <= self.head.saturating_add(self.capacity)
    }

    fn index(&self, n: Seqno) -> usize {
        (n & self.mask) as usize
    }

    /// Slot for `n`. Panics if `n` is outside the window.
    pub fn fetch(&mut self, n: Seqno) -> &mut T {
        assert!(
            self.within_range(n),
            "sequence number {} outside log window ({}, {}]",
            n,
            self.head,
            self.head.saturating_add(self.capacity)
        );
        let index = self.index(n);
        let slot = &mut self.slots[index];
        if slot.0 != n {
            slot.1.clear();
            slot.0 = n;
        }
        &mut slot.1
    }

    /// Slot for `n` if it is in the window and has been fetched.
    pub fn get(&self, n: Seqno) -> Option<&T> {
        if !self.within_range(n) {
            return None;
        }
        let slot = &self.slots[self.index(n)];
        (slot.0 == n).then_some(&slot.1)
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut(&mut self, n: Seqno) -> Option<&mut T> {
        if !self.within_range(n) {
            return None;
        }
        let index = self.index(n);
        let slot = &mut self.slots[index];
        (slot.0 == n).then_some(&mut slot.1)
    }

    /// Advance the head to `new_head`, discarding slots at or below it.
    ///
    /// Truncating to a head at or below the current one does nothing.
    pub fn truncate(&mut self, new_head: Seqno) {
        if new_head <= self.head {
            return;
        }
        let old_head = self.head;
        let upto = new_head.min(old_head.saturating_add(self.capacity));
        for n in (old_head + 1)..=upto {
            let index = self.index(n);
            let slot = &mut self.slots[index];
            if slot.0 == n {
                slot.1.clear();
                slot.0 = Seqno::MAX;
            }
        }
        self.head = new_head;
    }

    /// Clear every slot and move the head to `head`.
    pub fn reset(&mut self, head: Seqno) {
        for slot in &mut self.slots {
            slot.1.clear();
            slot.0 = Seqno::MAX;
        }
        self.head = head;
    }

    /// Fetched slots in the window, ascending by sequence number.
    pub fn iter(&self) -> impl Iterator<Item = (Seqno, &T)> {
        let head = self.head;
        let end = head.saturating_add(self.capacity);
        (head + 1..=end).filter_map(move |n| {
            let slot = &self.slots[(n & self.mask) as usize];
            (slot.0 == n).then_some((n, &slot.1))
        })
    }
}
