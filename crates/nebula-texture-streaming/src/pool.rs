//! GPU texture pool contract and an in-memory reference pool.
//!
//! The streamer never talks to a GPU heap directly. It reserves [`PoolItem`]s
//! sized for a mip chain through [`PoolAllocator`], hands them to loads, and
//! gives them back when textures shrink. [`StreamingPool`] implements the
//! contract with plain bookkeeping: released items are cached by layout for
//! reuse and only dropped by garbage collection or under capacity pressure.

use std::collections::VecDeque;

use crate::texture::{TextureDesc, TextureFormat};

/// Shape of the storage behind a pool item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolLayout {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub mip_count: u8,
}

impl PoolLayout {
    /// Layout holding `desc`'s chain from `first_mip` down.
    #[must_use]
    pub fn for_chain(desc: &TextureDesc, first_mip: u8) -> Self {
        let shift = u32::from(first_mip.min(desc.mip_count.saturating_sub(1)));
        Self {
            format: desc.format,
            width: (desc.width >> shift).max(1),
            height: (desc.height >> shift).max(1),
            mip_count: desc.mip_count.saturating_sub(first_mip),
        }
    }
}

/// A region of the texture pool. Owned by exactly one texture or load.
#[derive(Debug, PartialEq, Eq)]
pub struct PoolItem {
    id: u64,
    layout: PoolLayout,
    size: u64,
}

impl PoolItem {
    /// Construct an item; pools use this to mint their regions.
    #[must_use]
    pub fn new(id: u64, layout: PoolLayout, size: u64) -> Self {
        Self { id, layout, size }
    }

    /// Pool-unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Storage layout.
    #[must_use]
    pub fn layout(&self) -> PoolLayout {
        self.layout
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// The external texture pool, called from the render thread only.
pub trait PoolAllocator {
    /// Reserve storage for `desc`'s chain starting at `first_mip`.
    ///
    /// With `allow_new == false` only cached items may be reused.
    fn try_reserve(
        &mut self,
        desc: &TextureDesc,
        first_mip: u8,
        allow_new: bool,
    ) -> Option<PoolItem>;

    /// Return an item to the pool.
    fn release(&mut self, item: PoolItem);

    /// Free up to `max_items` cached items while `*current_size > target_limit`.
    ///
    /// `current_size` is decreased by the bytes freed. Returns the number of
    /// items freed.
    fn garbage_collect(
        &mut self,
        current_size: &mut u64,
        target_limit: u64,
        max_items: usize,
    ) -> usize;

    /// Bytes owned by textures and loads.
    fn reserved_size(&self) -> u64;

    /// Reserved bytes plus cached free items.
    fn allocated_size(&self) -> u64;

    /// Physical capacity in bytes.
    fn capacity(&self) -> u64;
}

/// Budgeted in-memory pool with a reuse cache.
#[derive(Debug)]
pub struct StreamingPool {
    capacity: u64,
    reserved: u64,
    cached: u64,
    next_id: u64,
    /// Released items, oldest first.
    free_items: VecDeque<PoolItem>,
}

impl StreamingPool {
    /// Create a pool with the given capacity in bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            reserved: 0,
            cached: 0,
            next_id: 1,
            free_items: VecDeque::new(),
        }
    }

    /// Number of cached free items.
    #[must_use]
    pub fn cached_items(&self) -> usize {
        self.free_items.len()
    }

    /// Bytes held by cached free items.
    #[must_use]
    pub fn cached_size(&self) -> u64 {
        self.cached
    }

    fn drop_oldest_cached(&mut self) -> Option<u64> {
        let item = self.free_items.pop_front()?;
        self.cached -= item.size;
        Some(item.size)
    }
}

impl PoolAllocator for StreamingPool {
    fn try_reserve(
        &mut self,
        desc: &TextureDesc,
        first_mip: u8,
        allow_new: bool,
    ) -> Option<PoolItem> {
        let layout = PoolLayout::for_chain(desc, first_mip);
        if let Some(pos) = self.free_items.iter().position(|item| item.layout == layout) {
            let item = self.free_items.remove(pos)?;
            self.cached -= item.size;
            self.reserved += item.size;
            return Some(item);
        }
        if !allow_new {
            return None;
        }

        let size = desc.size_from_mip(first_mip);
        if self.reserved + size > self.capacity {
            return None;
        }
        while self.reserved + self.cached + size > self.capacity {
            if self.drop_oldest_cached().is_none() {
                break;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.reserved += size;
        Some(PoolItem::new(id, layout, size))
    }

    fn release(&mut self, item: PoolItem) {
        self.reserved = self.reserved.saturating_sub(item.size);
        self.cached += item.size;
        self.free_items.push_back(item);
    }

    fn garbage_collect(
        &mut self,
        current_size: &mut u64,
        target_limit: u64,
        max_items: usize,
    ) -> usize {
        let mut freed = 0;
        while freed < max_items && *current_size > target_limit {
            let Some(size) = self.drop_oldest_cached() else {
                break;
            };
            *current_size = current_size.saturating_sub(size);
            freed += 1;
        }
        freed
    }

    fn reserved_size(&self) -> u64 {
        self.reserved
    }

    fn allocated_size(&self) -> u64 {
        self.reserved + self.cached
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> TextureDesc {
        TextureDesc::new(64, 64, TextureFormat::Rgba8, 2).unwrap()
    }

    #[test]
    fn test_reserve_and_release_tracks_sizes() {
        let mut pool = StreamingPool::new(1 << 20);
        let item = pool.try_reserve(&desc(), 0, true).unwrap();
        assert_eq!(item.size(), desc().size_from_mip(0));
        assert_eq!(pool.reserved_size(), item.size());

        let size = item.size();
        pool.release(item);
        assert_eq!(pool.reserved_size(), 0);
        assert_eq!(pool.cached_size(), size);
        assert_eq!(pool.allocated_size(), size);
    }

    #[test]
    fn test_released_items_are_reused_by_layout() {
        let mut pool = StreamingPool::new(1 << 20);
        let item = pool.try_reserve(&desc(), 2, true).unwrap();
        let id = item.id();
        pool.release(item);

        assert!(pool.try_reserve(&desc(), 1, false).is_none());
        let reused = pool.try_reserve(&desc(), 2, false).unwrap();
        assert_eq!(reused.id(), id);
        assert_eq!(pool.cached_items(), 0);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let full = desc().size_from_mip(0);
        let mut pool = StreamingPool::new(full);
        let item = pool.try_reserve(&desc(), 0, true).unwrap();
        assert!(pool.try_reserve(&desc(), 5, true).is_none());
        pool.release(item);
        // Cached bytes are evicted to make room for a different layout.
        assert!(pool.try_reserve(&desc(), 1, true).is_some());
        assert_eq!(pool.cached_items(), 0);
    }

    #[test]
    fn test_garbage_collect_respects_item_cap_and_limit() {
        let mut pool = StreamingPool::new(1 << 20);
        for mip in 0..4 {
            let item = pool.try_reserve(&desc(), mip, true).unwrap();
            pool.release(item);
        }
        let mut current = pool.allocated_size();
        assert_eq!(pool.garbage_collect(&mut current, 0, 2), 2);
        assert_eq!(pool.cached_items(), 2);
        assert_eq!(current, pool.allocated_size());

        let mut current = pool.allocated_size();
        let target = current;
        assert_eq!(pool.garbage_collect(&mut current, target, 1000), 0);
        let mut current = pool.allocated_size();
        assert_eq!(pool.garbage_collect(&mut current, 0, 1000), 2);
    }
}
