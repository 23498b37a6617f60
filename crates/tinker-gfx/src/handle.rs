//! Generation-counted handle pools.
//!
//! Every pooled object is addressed by an index plus the generation of the
//! slot at allocation time. Freeing a slot bumps its generation, so a handle
//! kept past its object's destruction no longer resolves and is rejected
//! instead of aliasing whatever is allocated into the slot next. Handles
//! also carry the pool's epoch, so handles issued before a context rebuild
//! never resolve in the rebuilt pools.

use crate::error::fatal;
use std::fmt;
use std::marker::PhantomData;

/// Slot index plus generation and pool epoch.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolIndex {
    index: u32,
    generation: u32,
    epoch: u32,
}

impl PoolIndex {
    /// Never handed out by a pool; generation 0 is never live.
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
        epoch: 0,
    };

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub const fn epoch(self) -> u32 {
        self.epoch
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.generation != 0
    }
}

impl fmt::Debug for PoolIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_valid(), self.epoch) {
            (false, _) => f.write_str("invalid"),
            (true, 0) => write!(f, "{}v{}", self.index, self.generation),
            (true, epoch) => write!(f, "{}v{}e{epoch}", self.index, self.generation),
        }
    }
}

/// A typed handle into a [`HandlePool`].
pub trait PoolHandle: Copy + Eq + fmt::Debug {
    /// Name used in diagnostics.
    const KIND: &'static str;

    fn from_pool_index(index: PoolIndex) -> Self;
    fn pool_index(self) -> PoolIndex;
}

macro_rules! pool_handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(PoolIndex);

        impl $name {
            /// The unbound/invalid handle.
            pub const INVALID: Self = Self(PoolIndex::INVALID);

            #[inline]
            pub const fn is_valid(self) -> bool {
                self.0.is_valid()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl PoolHandle for $name {
            const KIND: &'static str = $kind;

            #[inline]
            fn from_pool_index(index: PoolIndex) -> Self {
                Self(index)
            }

            #[inline]
            fn pool_index(self) -> PoolIndex {
                self.0
            }
        }
    };
}

pool_handle!(
    /// A buffer or image owned by the resource registry.
    ResourceHandle,
    "resource"
);
pool_handle!(
    /// A descriptor set (one physical set per frame in flight).
    DescriptorHandle,
    "descriptor"
);
pool_handle!(
    /// A registered set of render attachments.
    FramebufferHandle,
    "framebuffer"
);
pool_handle!(
    /// A window's swap chain.
    SwapChainHandle,
    "swap chain"
);

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity slot allocator.
///
/// Exhaustion is fatal unless the pool was created growable.
pub struct HandlePool<H, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: u32,
    growable: bool,
    live: u32,
    epoch: u32,
    _handle: PhantomData<H>,
}

impl<H: PoolHandle, T> HandlePool<H, T> {
    /// Create a pool that aborts once `capacity` slots are live.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            growable: false,
            live: 0,
            epoch: 0,
            _handle: PhantomData,
        }
    }

    /// Create a pool that doubles its capacity instead of aborting.
    pub fn growable(initial_capacity: u32) -> Self {
        Self {
            growable: true,
            ..Self::with_capacity(initial_capacity.max(1))
        }
    }

    /// Tag every handle issued from now on with `epoch`. Handles of other
    /// epochs never resolve. The pool must be empty.
    pub fn start_epoch(&mut self, epoch: u32) {
        if self.live != 0 {
            fatal(format!(
                "{} pool changed epoch with {} slots live",
                H::KIND,
                self.live
            ));
        }
        self.epoch = epoch;
    }

    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Store `value` and return a handle to it.
    pub fn alloc(&mut self, value: T) -> H {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            self.live += 1;
            return H::from_pool_index(PoolIndex {
                index,
                generation: slot.generation,
                epoch: self.epoch,
            });
        }

        if self.slots.len() as u32 >= self.capacity {
            if !self.growable {
                fatal(format!(
                    "{} pool exhausted ({} slots live)",
                    H::KIND,
                    self.capacity
                ));
            }
            self.capacity = self.capacity.saturating_mul(2);
            tracing::debug!("{} pool grown to {}", H::KIND, self.capacity);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        self.live += 1;
        H::from_pool_index(PoolIndex {
            index,
            generation: 1,
            epoch: self.epoch,
        })
    }

    /// Release the slot and hand back its value. Stale or invalid handles
    /// (including a second dealloc of the same handle) are fatal.
    pub fn dealloc(&mut self, handle: H) -> T {
        let index = handle.pool_index();
        let Some(slot) = self.live_slot_mut(index) else {
            fatal(format!("dealloc of stale {} handle {handle:?}", H::KIND));
        };
        let Some(value) = slot.value.take() else {
            fatal(format!("dealloc of stale {} handle {handle:?}", H::KIND));
        };
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        self.free.push(index.index);
        self.live -= 1;
        value
    }

    /// Look up a live handle.
    pub fn get(&self, handle: H) -> Option<&T> {
        let index = handle.pool_index();
        if !index.is_valid() || index.epoch != self.epoch {
            return None;
        }
        self.slots
            .get(index.index as usize)
            .filter(|slot| slot.generation == index.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Look up a live handle mutably.
    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        self.live_slot_mut(handle.pool_index())
            .and_then(|slot| slot.value.as_mut())
    }

    /// Look up a handle that must be live.
    #[track_caller]
    pub fn lookup(&self, handle: H) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => fatal(format!("stale or invalid {} handle {handle:?}", H::KIND)),
        }
    }

    /// Look up a handle that must be live, mutably.
    #[track_caller]
    pub fn lookup_mut(&mut self, handle: H) -> &mut T {
        if self.get(handle).is_none() {
            fatal(format!("stale or invalid {} handle {handle:?}", H::KIND));
        }
        self.get_mut(handle)
            .unwrap_or_else(|| unreachable!("slot checked live above"))
    }

    #[inline]
    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.live as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Handles of every live slot, in slot order.
    pub fn handles(&self) -> Vec<H> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Iterate live entries.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        let epoch = self.epoch;
        self.slots.iter().enumerate().filter_map(move |(i, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    H::from_pool_index(PoolIndex {
                        index: i as u32,
                        generation: slot.generation,
                        epoch,
                    }),
                    value,
                )
            })
        })
    }

    fn live_slot_mut(&mut self, index: PoolIndex) -> Option<&mut Slot<T>> {
        if !index.is_valid() || index.epoch != self.epoch {
            return None;
        }
        self.slots
            .get_mut(index.index as usize)
            .filter(|slot| slot.generation == index.generation && slot.value.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn live_handles_are_distinct() {
        let mut pool: HandlePool<ResourceHandle, u32> = HandlePool::with_capacity(64);
        let handles: Vec<_> = (0..64).map(|i| pool.alloc(i)).collect();
        let unique: HashSet<_> = handles.iter().copied().collect();
        assert_eq!(unique.len(), 64);
        assert_eq!(pool.len(), 64);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(*pool.lookup(*handle), i as u32);
        }
    }

    #[test]
    fn freed_slot_is_reused_with_new_generation() {
        let mut pool: HandlePool<DescriptorHandle, &str> = HandlePool::with_capacity(4);
        let first = pool.alloc("a");
        assert_eq!(pool.dealloc(first), "a");
        let second = pool.alloc("b");

        assert_eq!(first.pool_index().index(), second.pool_index().index());
        assert_ne!(first, second);
        assert!(pool.get(first).is_none());
        assert_eq!(pool.get(second), Some(&"b"));
    }

    #[test]
    fn invalid_handle_never_resolves() {
        let mut pool: HandlePool<ResourceHandle, u8> = HandlePool::with_capacity(2);
        pool.alloc(7);
        assert!(!ResourceHandle::INVALID.is_valid());
        assert!(pool.get(ResourceHandle::INVALID).is_none());
        assert_eq!(ResourceHandle::default(), ResourceHandle::INVALID);
    }

    #[test]
    #[should_panic(expected = "resource pool exhausted")]
    fn exhaustion_is_fatal() {
        let mut pool: HandlePool<ResourceHandle, ()> = HandlePool::with_capacity(2);
        pool.alloc(());
        pool.alloc(());
        pool.alloc(());
    }

    #[test]
    #[should_panic(expected = "dealloc of stale descriptor handle")]
    fn double_dealloc_is_fatal() {
        let mut pool: HandlePool<DescriptorHandle, ()> = HandlePool::with_capacity(2);
        let handle = pool.alloc(());
        pool.dealloc(handle);
        pool.dealloc(handle);
    }

    #[test]
    #[should_panic(expected = "stale or invalid resource handle")]
    fn stale_lookup_is_fatal() {
        let mut pool: HandlePool<ResourceHandle, ()> = HandlePool::with_capacity(2);
        let handle = pool.alloc(());
        pool.dealloc(handle);
        pool.alloc(());
        pool.lookup(handle);
    }

    #[test]
    fn handles_of_an_earlier_epoch_never_resolve() {
        let mut old: HandlePool<ResourceHandle, u32> = HandlePool::with_capacity(4);
        let stale = old.alloc(1);

        let mut rebuilt: HandlePool<ResourceHandle, u32> = HandlePool::with_capacity(4);
        rebuilt.start_epoch(1);
        let fresh = rebuilt.alloc(2);

        assert_eq!(stale.pool_index().index(), fresh.pool_index().index());
        assert_eq!(stale.pool_index().generation(), fresh.pool_index().generation());
        assert_ne!(stale, fresh);
        assert!(rebuilt.get(stale).is_none());
        assert_eq!(rebuilt.handles(), vec![fresh]);
        assert_eq!(format!("{fresh:?}"), "ResourceHandle(0v1e1)");
    }

    #[test]
    #[should_panic(expected = "changed epoch with 1 slots live")]
    fn epoch_change_on_live_pool_is_fatal() {
        let mut pool: HandlePool<DescriptorHandle, ()> = HandlePool::with_capacity(2);
        pool.alloc(());
        pool.start_epoch(3);
    }

    #[test]
    fn growable_pool_expands() {
        let mut pool: HandlePool<SwapChainHandle, u32> = HandlePool::growable(2);
        for i in 0..5 {
            pool.alloc(i);
        }
        assert_eq!(pool.len(), 5);
        assert!(pool.capacity() >= 5);
    }

    #[test]
    fn iteration_skips_freed_slots() {
        let mut pool: HandlePool<FramebufferHandle, u32> = HandlePool::with_capacity(4);
        let a = pool.alloc(1);
        let b = pool.alloc(2);
        let c = pool.alloc(3);
        pool.dealloc(b);
        assert_eq!(pool.handles(), vec![a, c]);
        let values: Vec<_> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1, 3]);
    }
}
