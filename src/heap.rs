// The semispace heap.
//
// The heap simulates a word-addressed memory: every address is a word
// index into one of two spaces, and each space owns a disjoint range
// of addresses so a stale pointer can never silently alias a live one.
// Allocation bumps a pointer in to-space; when a request doesn't fit
// the allocator reports HeapExhausted and the runtime decides whether
// to collect. From-space only exists during a collection.
//
// Object trackers anchor values against collection on behalf of code
// that lives outside the heap. They form a slab with a free list; safe
// values wrap either a tracker handle or an immediate that needs no
// tracking.

use std::thread;
use enumflags2::BitFlags;

use crate::util::PseudoRandom;
use crate::value::{Condition, Result, Value};


// One contiguous block of word-addressed storage.
pub struct Space {
    base: u64,
    words: Vec<u64>,
    next: u64,
    limit: u64,
}

impl Space {
    pub fn new(base: u64, capacity: u64) -> Space {
        Space {
            base,
            words: vec![0; capacity as usize],
            next: base,
            limit: base + capacity,
        }
    }

    pub fn start(&self) -> u64 {
        self.base
    }

    pub fn next_free(&self) -> u64 {
        self.next
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.next
    }

    pub fn try_alloc(&mut self, size: u64) -> Option<u64> {
        let addr = self.next;
        if addr + size <= self.limit {
            self.next = addr + size;
            Some(addr)
        } else {
            None
        }
    }

    pub fn word(&self, addr: u64) -> u64 {
        self.words[(addr - self.base) as usize]
    }

    pub fn set_word(&mut self, addr: u64, word: u64) {
        self.words[(addr - self.base) as usize] = word;
    }
}


// Flags that modify how a tracker behaves across collections.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum TrackerFlag {
    // The value is not kept alive by the tracker; the reference is
    // cleared when the value becomes garbage.
    Weak = 0b0001,
    // Dispose the tracker itself when the value dies.
    SelfDestruct = 0b0010,
    // Run the family finalizer when the value dies.
    Finalize = 0b0100,
    // Consult the weakness predicate at the start of each collection.
    MaybeWeak = 0b1000,
}

pub type TrackerFlags = BitFlags<TrackerFlag>;

// Decides, per collection, whether a maybe-weak tracker acts weak.
pub type WeaknessPredicate = fn(&Heap, Value) -> bool;

pub struct ObjectTracker {
    pub value: Value,
    pub flags: TrackerFlags,
    pub is_garbage: bool,
    // Resolved weakness for the collection in progress.
    pub acts_weak: bool,
    pub predicate: Option<WeaknessPredicate>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrackerHandle(usize);

// A value protected against garbage collection. Immediates are stored
// inline since they never move; everything else goes through the
// tracker slab.
#[derive(Copy, Clone, Debug)]
pub enum SafeValue {
    Immediate(Value),
    Tracked(TrackerHandle),
}


// The next-failure schedule of the allocation fuzzer: a minimum gap
// plus a uniform spread, which gives the requested mean without ever
// failing more often than the minimum.
pub struct GcFuzzer {
    random: PseudoRandom,
    min_freq: u64,
    spread: u64,
    remaining: u64,
    is_enabled: bool,
}

impl GcFuzzer {
    pub fn new(min_freq: u64, mean_freq: u64, seed: u64) -> GcFuzzer {
        let mean = if mean_freq <= min_freq { min_freq + 1 } else { mean_freq };
        let mut fuzzer = GcFuzzer {
            random: PseudoRandom::new(seed),
            min_freq,
            spread: (mean - min_freq) * 2,
            remaining: 0,
            is_enabled: true,
        };
        fuzzer.tick();
        fuzzer
    }

    // Returns true when this allocation should be made to fail.
    pub fn tick(&mut self) -> bool {
        if !self.is_enabled {
            return false;
        }
        if self.remaining == 0 {
            self.remaining = self.random.next_below(self.spread) + self.min_freq;
            true
        } else {
            self.remaining -= 1;
            false
        }
    }

    pub fn set_enabled(&mut self, enable: bool) {
        debug_assert!(self.is_enabled != enable);
        self.is_enabled = enable;
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }
}


pub struct Heap {
    to_space: Space,
    from_space: Option<Space>,
    semispace_size: u64,
    // Where the next space's address range begins. Monotonic so ranges
    // never recycle within a runtime's lifetime.
    next_base: u64,
    trackers: Vec<Option<ObjectTracker>>,
    tracker_free: Vec<usize>,
    tracker_count: usize,
    pub fuzzer: Option<GcFuzzer>,
    creator: thread::ThreadId,
}

// Word address ranges start above zero so address zero never denotes
// an object.
const FIRST_SPACE_BASE: u64 = 8;

impl Heap {
    pub fn new(semispace_size: u64) -> Heap {
        let mut next_base = FIRST_SPACE_BASE;
        let to_space = Space::new(next_base, semispace_size);
        next_base += semispace_size + 1;
        Heap {
            to_space,
            from_space: None,
            semispace_size,
            next_base,
            trackers: Vec::new(),
            tracker_free: Vec::new(),
            tracker_count: 0,
            fuzzer: None,
            creator: thread::current().id(),
        }
    }

    pub fn check_thread(&self) {
        debug_assert!(
            self.creator == thread::current().id(),
            "heap accessed from a thread that didn't create it"
        );
    }

    // --- Raw storage ---

    pub fn word(&self, addr: u64) -> u64 {
        if self.to_space.contains(addr) {
            self.to_space.word(addr)
        } else {
            match &self.from_space {
                Some(space) => space.word(addr),
                None => panic!("read of unmapped address {}", addr),
            }
        }
    }

    pub fn set_word(&mut self, addr: u64, word: u64) {
        if self.to_space.contains(addr) {
            self.to_space.set_word(addr, word);
        } else {
            match &mut self.from_space {
                Some(space) => space.set_word(addr, word),
                None => panic!("write of unmapped address {}", addr),
            }
        }
    }

    pub fn value_at(&self, addr: u64) -> Value {
        Value::from_raw(self.word(addr))
    }

    pub fn set_value_at(&mut self, addr: u64, value: Value) {
        self.set_word(addr, value.raw());
    }

    // --- Allocation ---

    pub fn try_alloc(&mut self, size: u64) -> Result<u64> {
        self.check_thread();
        match self.to_space.try_alloc(size) {
            Some(addr) => Ok(addr),
            None => Err(Condition::heap_exhausted(size)),
        }
    }

    // Lets the fuzzer veto an allocation before it is attempted.
    pub fn fuzz_tick(&mut self) -> bool {
        match &mut self.fuzzer {
            Some(fuzzer) => fuzzer.tick(),
            None => false,
        }
    }

    pub fn toggle_fuzzing(&mut self, enable: bool) {
        if let Some(fuzzer) = &mut self.fuzzer {
            fuzzer.set_enabled(enable);
        }
    }

    // --- Space management for the collector ---

    pub fn to_space(&self) -> &Space {
        &self.to_space
    }

    pub fn in_to_space(&self, addr: u64) -> bool {
        self.to_space.contains(addr)
    }

    pub fn in_from_space(&self, addr: u64) -> bool {
        match &self.from_space {
            Some(space) => space.contains(addr),
            None => false,
        }
    }

    pub fn has_from_space(&self) -> bool {
        self.from_space.is_some()
    }

    // Rotates to-space into from-space and mints a fresh to-space with
    // its own address range.
    pub fn prepare_garbage_collection(&mut self) {
        debug_assert!(self.from_space.is_none(), "collection already in progress");
        let fresh = Space::new(self.next_base, self.semispace_size);
        self.next_base += self.semispace_size + 1;
        self.from_space = Some(std::mem::replace(&mut self.to_space, fresh));
    }

    pub fn complete_garbage_collection(&mut self) {
        debug_assert!(self.from_space.is_some(), "no collection in progress");
        self.from_space = None;
    }

    // Allocates room in to-space during a collection. The caller has
    // ensured to-space is as large as from-space, so this cannot fail.
    pub fn migration_alloc(&mut self, size: u64) -> u64 {
        self.to_space
            .try_alloc(size)
            .expect("migration allocation failed")
    }

    pub fn copy_words(&mut self, source: u64, target: u64, count: u64) {
        for i in 0..count {
            let word = self.word(source + i);
            self.set_word(target + i, word);
        }
    }

    // --- Trackers ---

    pub fn new_tracker(
        &mut self,
        value: Value,
        flags: TrackerFlags,
        predicate: Option<WeaknessPredicate>,
    ) -> TrackerHandle {
        debug_assert!(!value.is_immediate(), "tracker for immediate");
        let tracker = ObjectTracker {
            value,
            flags,
            is_garbage: false,
            acts_weak: flags.contains(TrackerFlag::Weak),
            predicate,
        };
        self.tracker_count += 1;
        match self.tracker_free.pop() {
            Some(index) => {
                self.trackers[index] = Some(tracker);
                TrackerHandle(index)
            }
            None => {
                self.trackers.push(Some(tracker));
                TrackerHandle(self.trackers.len() - 1)
            }
        }
    }

    pub fn dispose_tracker(&mut self, handle: TrackerHandle) {
        debug_assert!(self.trackers[handle.0].is_some(), "tracker disposed twice");
        self.trackers[handle.0] = None;
        self.tracker_free.push(handle.0);
        self.tracker_count -= 1;
    }

    pub fn tracker(&self, handle: TrackerHandle) -> &ObjectTracker {
        self.trackers[handle.0].as_ref().expect("dead tracker")
    }

    pub fn tracker_mut(&mut self, handle: TrackerHandle) -> &mut ObjectTracker {
        self.trackers[handle.0].as_mut().expect("dead tracker")
    }

    pub fn tracker_count(&self) -> usize {
        self.tracker_count
    }

    pub fn tracker_handles(&self) -> Vec<TrackerHandle> {
        (0..self.trackers.len())
            .filter(|&i| self.trackers[i].is_some())
            .map(TrackerHandle)
            .collect()
    }

    // --- Safe values ---

    pub fn protect(&mut self, value: Value) -> SafeValue {
        self.protect_with_flags(value, BitFlags::empty(), None)
    }

    pub fn protect_with_flags(
        &mut self,
        value: Value,
        flags: TrackerFlags,
        predicate: Option<WeaknessPredicate>,
    ) -> SafeValue {
        if value.is_immediate() {
            SafeValue::Immediate(value)
        } else {
            SafeValue::Tracked(self.new_tracker(value, flags, predicate))
        }
    }

    pub fn deref(&self, safe: SafeValue) -> Value {
        match safe {
            SafeValue::Immediate(value) => value,
            SafeValue::Tracked(handle) => self.tracker(handle).value,
        }
    }

    pub fn dispose_safe_value(&mut self, safe: SafeValue) {
        if let SafeValue::Tracked(handle) = safe {
            self.dispose_tracker(handle);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_bump_allocation() {
        let mut space = Space::new(8, 16);
        let a = space.try_alloc(4).unwrap();
        let b = space.try_alloc(4).unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 12);
        assert!(space.try_alloc(9).is_none());
        assert!(space.try_alloc(8).is_some());
        assert!(space.try_alloc(1).is_none());
    }

    #[test]
    fn test_space_addressing() {
        let mut space = Space::new(100, 8);
        let addr = space.try_alloc(2).unwrap();
        space.set_word(addr, 17);
        space.set_word(addr + 1, 18);
        assert_eq!(space.word(addr), 17);
        assert_eq!(space.word(addr + 1), 18);
        assert!(space.contains(addr));
        assert!(!space.contains(addr + 2));
    }

    #[test]
    fn test_heap_exhaustion() {
        let mut heap = Heap::new(8);
        assert!(heap.try_alloc(8).is_ok());
        let err = heap.try_alloc(1).unwrap_err();
        assert_eq!(err.cause(), crate::value::Cause::HeapExhausted);
    }

    #[test]
    fn test_space_rotation_changes_ranges() {
        let mut heap = Heap::new(8);
        let a = heap.try_alloc(4).unwrap();
        heap.prepare_garbage_collection();
        assert!(heap.in_from_space(a));
        assert!(!heap.in_to_space(a));
        let b = heap.migration_alloc(4);
        assert!(heap.in_to_space(b));
        assert_ne!(a, b);
        heap.complete_garbage_collection();
        assert!(!heap.has_from_space());
    }

    #[test]
    fn test_tracker_slab() {
        let mut heap = Heap::new(8);
        let obj = Value::new_heap_object(heap.try_alloc(2).unwrap());
        let t1 = heap.new_tracker(obj, BitFlags::empty(), None);
        let t2 = heap.new_tracker(obj, TrackerFlag::Weak.into(), None);
        assert_eq!(heap.tracker_count(), 2);
        assert!(heap.tracker(t2).acts_weak);
        assert!(!heap.tracker(t1).acts_weak);
        heap.dispose_tracker(t1);
        assert_eq!(heap.tracker_count(), 1);
        // The freed slot is recycled.
        let t3 = heap.new_tracker(obj, BitFlags::empty(), None);
        assert_eq!(t1, t3);
    }

    #[test]
    fn test_safe_values() {
        let mut heap = Heap::new(8);
        let imm = heap.protect(Value::new_integer(42));
        assert!(heap.deref(imm).is_same(Value::new_integer(42)));
        // Immediates don't occupy tracker slots.
        assert_eq!(heap.tracker_count(), 0);

        let obj = Value::new_heap_object(heap.try_alloc(2).unwrap());
        let safe = heap.protect(obj);
        assert!(heap.deref(safe).is_same(obj));
        assert_eq!(heap.tracker_count(), 1);
        heap.dispose_safe_value(safe);
        assert_eq!(heap.tracker_count(), 0);
    }

    #[test]
    fn test_fuzzer_respects_min_frequency() {
        let mut fuzzer = GcFuzzer::new(4, 16, 0xC0FFEE);
        let mut last_failure: i64 = -1;
        let mut failures = 0;
        for i in 0..10_000i64 {
            if fuzzer.tick() {
                if last_failure >= 0 {
                    assert!(i - last_failure >= 4, "fuzzer failed too often");
                }
                last_failure = i;
                failures += 1;
            }
        }
        // Mean gap should be in the general vicinity of the requested
        // mean; the exact count depends on the seed.
        assert!(failures > 300 && failures < 1500, "got {}", failures);
    }

    #[test]
    fn test_fuzzer_toggle() {
        let mut fuzzer = GcFuzzer::new(1, 2, 99);
        fuzzer.set_enabled(false);
        for _ in 0..100 {
            assert!(!fuzzer.tick());
        }
        fuzzer.set_enabled(true);
        let mut any = false;
        for _ in 0..100 {
            any |= fuzzer.tick();
        }
        assert!(any);
    }

    #[test]
    fn test_maybe_weak_carries_predicate() {
        fn always_weak(_heap: &Heap, _value: Value) -> bool {
            true
        }
        let mut heap = Heap::new(8);
        let obj = Value::new_heap_object(heap.try_alloc(2).unwrap());
        let t = heap.new_tracker(obj, TrackerFlag::MaybeWeak.into(), Some(always_weak));
        let tracker = heap.tracker(t);
        assert!(tracker.flags.contains(TrackerFlag::MaybeWeak));
        assert!(tracker.predicate.is_some());
    }
}
