//! Space implementations: paged spaces, the semispace pair backing the
//! young generation, and the large-object space.
//!
//! Paged spaces carve one aligned reservation into fixed-size pages.
//! Each page keeps its bookkeeping in an in-page header, so any address
//! inside a page reaches its metadata by aligning down — the forwarding
//! machinery depends on this for `mc_first_forwarded` and the
//! remembered-set bitmaps.

use std::ptr::NonNull;

use object::{HeapObject, WORD_SIZE};

use crate::collector::GcTracer;
use crate::system;

/// Size of one page, header included.
pub const PAGE_SIZE: usize = 8 * 1024;
/// Byte offset of the first allocatable word in a page. Everything
/// below is the page header. Also the lower bound for any in-page map
/// offset, which keeps forwarding encodings clear of the two reserved
/// free-region constants.
pub const OBJECT_AREA_START: usize = 192;
/// Allocatable bytes per page.
pub const OBJECT_AREA_SIZE: usize = PAGE_SIZE - OBJECT_AREA_START;
/// Upper bound on pages per space, from the 10-bit page index in the
/// forwarding encoding.
pub const MAX_PAGES_PER_SPACE: usize = 1 << 10;

/// `mc_first_forwarded` value for a page with no live objects.
pub const FIRST_FORWARDED_SENTINEL: usize = usize::MAX;

const _: () = assert!(OBJECT_AREA_SIZE / WORD_SIZE <= 1 << 11);
const _: () = assert!(PAGE_SIZE.is_power_of_two());

// ── Page ──────────────────────────────────────────────────────────────

/// In-page header. Lives at the start of every page; the object area
/// follows at [`OBJECT_AREA_START`].
#[repr(C)]
pub struct Page {
    /// Remembered set: one bit per object-area word, set when the word
    /// holds a pointer into new space.
    rset: [u64; Page::RSET_WORDS],
    /// Allocation top as a byte offset from the page start.
    top: u32,
    /// Relocation high-water mark (byte offset) written during the
    /// forwarding-encode phase.
    pub mc_relocation_top: u32,
    /// Destination address of the first live object on this page, or
    /// [`FIRST_FORWARDED_SENTINEL`].
    pub mc_first_forwarded: usize,
    /// Index of this page within its space.
    pub mc_page_index: u32,
    _pad: u32,
}

const RSET_WORDS: usize = OBJECT_AREA_SIZE / WORD_SIZE / 64 + 1;

impl Page {
    pub const RSET_WORDS: usize = RSET_WORDS;

    /// Page containing `addr`.
    #[inline(always)]
    pub fn from_address(addr: usize) -> *mut Page {
        (addr & !(PAGE_SIZE - 1)) as *mut Page
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self as *const Page as usize
    }

    #[inline(always)]
    pub fn object_area_start(&self) -> usize {
        self.start() + OBJECT_AREA_START
    }

    #[inline(always)]
    pub fn object_area_end(&self) -> usize {
        self.start() + PAGE_SIZE
    }

    #[inline(always)]
    pub fn allocation_top(&self) -> usize {
        self.start() + self.top as usize
    }

    #[inline(always)]
    pub fn set_allocation_top(&mut self, addr: usize) {
        self.top = self.offset_of(addr) as u32;
    }

    /// Byte offset of `addr` from the page start.
    #[inline(always)]
    pub fn offset_of(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.start() && addr <= self.object_area_end());
        addr - self.start()
    }

    #[inline(always)]
    pub fn address_at(&self, offset: usize) -> usize {
        debug_assert!(offset <= PAGE_SIZE);
        self.start() + offset
    }

    pub fn reset(&mut self, index: usize) {
        self.rset = [0; Self::RSET_WORDS];
        self.top = OBJECT_AREA_START as u32;
        self.mc_relocation_top = OBJECT_AREA_START as u32;
        self.mc_first_forwarded = FIRST_FORWARDED_SENTINEL;
        self.mc_page_index = index as u32;
    }

    // ── Remembered set ─────────────────────────────────────────────

    #[inline(always)]
    fn rset_position(&self, slot_addr: usize) -> (usize, u64) {
        let offset = self.offset_of(slot_addr);
        debug_assert!(offset >= OBJECT_AREA_START);
        debug_assert!(slot_addr % WORD_SIZE == 0);
        let bit = (offset - OBJECT_AREA_START) / WORD_SIZE;
        (bit / 64, 1u64 << (bit % 64))
    }

    #[inline(always)]
    pub fn set_rset_bit(&mut self, slot_addr: usize) {
        let (word, mask) = self.rset_position(slot_addr);
        self.rset[word] |= mask;
    }

    #[inline(always)]
    pub fn is_rset_bit_set(&self, slot_addr: usize) -> bool {
        let (word, mask) = self.rset_position(slot_addr);
        self.rset[word] & mask != 0
    }

    /// Clear the remembered-set bits covering `[start, start + size)`.
    pub fn clear_rset_range(&mut self, start: usize, size: usize) {
        debug_assert!(size % WORD_SIZE == 0);
        let mut slot = start;
        while slot < start + size {
            let (word, mask) = self.rset_position(slot);
            self.rset[word] &= !mask;
            slot += WORD_SIZE;
        }
    }

    pub fn clear_rset(&mut self) {
        self.rset = [0; Self::RSET_WORDS];
    }
}

const _: () = assert!(size_of::<Page>() <= OBJECT_AREA_START);

// ── Free list ─────────────────────────────────────────────────────────

/// Out-of-band free list over byte regions of a paged space. The heap
/// keeps a walkable filler object over every listed region.
#[derive(Debug, Default)]
struct FreeList {
    entries: Vec<(usize, usize)>,
    available: usize,
}

impl FreeList {
    fn reset(&mut self) {
        self.entries.clear();
        self.available = 0;
    }

    fn free(&mut self, addr: usize, size: usize) {
        debug_assert!(size >= WORD_SIZE && size % WORD_SIZE == 0);
        self.entries.push((addr, size));
        self.available += size;
    }

    /// First-fit allocation. Returns the block address and, when the fit
    /// was not exact, the leftover region the caller must re-cover with
    /// a filler.
    fn allocate(&mut self, size: usize) -> Option<(usize, Option<(usize, usize)>)> {
        let index = self
            .entries
            .iter()
            .position(|&(_, entry_size)| entry_size >= size)?;
        let (addr, entry_size) = self.entries.swap_remove(index);
        self.available -= size;
        if entry_size == size {
            Some((addr, None))
        } else {
            let remainder = (addr + size, entry_size - size);
            self.entries.push(remainder);
            Some((addr, Some(remainder)))
        }
    }
}

// ── Paged space ───────────────────────────────────────────────────────

/// Result of a mutator allocation. `filler` names a region the caller
/// must cover with a filler object to keep the space linearly walkable
/// (a free-list remainder or a skipped page tail).
#[derive(Debug, Clone, Copy)]
pub struct RawAllocation {
    pub addr: usize,
    pub filler: Option<(usize, usize)>,
}

/// Relocation cursor state for a compacting collection.
#[derive(Debug, Default, Clone, Copy)]
struct RelocationInfo {
    page: usize,
    /// Next destination address.
    top: usize,
    /// Bytes promised to this space during forwarding encoding.
    live_bytes: usize,
}

/// A page-structured space (old, code, or map).
pub struct PagedSpace {
    name: &'static str,
    start: usize,
    total_pages: usize,
    pages_in_use: usize,
    /// Mutator bump cursor.
    alloc_page: usize,
    alloc_top: usize,
    free_list: FreeList,
    /// Map-space mode: reclaimed regions are split into fixed chunks.
    chunk_size: Option<usize>,
    mc: RelocationInfo,
    size: usize,
    waste: usize,
}

impl PagedSpace {
    pub fn new(
        name: &'static str,
        total_pages: usize,
        chunk_size: Option<usize>,
    ) -> Option<PagedSpace> {
        debug_assert!(total_pages >= 1 && total_pages <= MAX_PAGES_PER_SPACE);
        let reservation =
            system::map_memory_aligned(total_pages * PAGE_SIZE, PAGE_SIZE)?;
        let start = reservation.as_ptr() as usize;

        let mut space = PagedSpace {
            name,
            start,
            total_pages,
            pages_in_use: 1,
            alloc_page: 0,
            alloc_top: start + OBJECT_AREA_START,
            free_list: FreeList::default(),
            chunk_size,
            mc: RelocationInfo::default(),
            size: 0,
            waste: 0,
        };
        for index in 0..total_pages {
            // SAFETY: every page lies inside the fresh reservation
            unsafe { (*space.page(index)).reset(index) };
        }
        space.mc_reset_relocation_info();
        Some(space)
    }

    #[inline(always)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline(always)]
    pub fn page(&self, index: usize) -> *mut Page {
        debug_assert!(index < self.total_pages);
        (self.start + index * PAGE_SIZE) as *mut Page
    }

    #[inline(always)]
    pub fn page_index_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.start) / PAGE_SIZE
    }

    #[inline(always)]
    pub fn pages_in_use(&self) -> usize {
        self.pages_in_use
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.start + self.pages_in_use * PAGE_SIZE
    }

    // ── Accounting ─────────────────────────────────────────────────

    /// Bytes handed out to live allocations.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes lost to page-tail slop.
    #[inline(always)]
    pub fn waste(&self) -> usize {
        self.waste
    }

    /// Bytes sitting on the free list.
    #[inline(always)]
    pub fn available_free(&self) -> usize {
        self.free_list.available
    }

    // ── Mutator allocation ─────────────────────────────────────────

    /// Bump- or free-list-allocate `size` bytes. Returns `None` when the
    /// space is exhausted.
    pub fn allocate_raw(&mut self, size: usize) -> Option<RawAllocation> {
        debug_assert!(size % WORD_SIZE == 0);
        debug_assert!(size <= OBJECT_AREA_SIZE);

        if let Some((addr, remainder)) = self.free_list.allocate(size) {
            self.size += size;
            return Some(RawAllocation { addr, filler: remainder });
        }

        // SAFETY: alloc_page is always an in-use page
        let page = unsafe { &mut *self.page(self.alloc_page) };
        if self.alloc_top + size <= page.object_area_end() {
            let addr = self.alloc_top;
            self.alloc_top += size;
            page.set_allocation_top(self.alloc_top);
            self.size += size;
            return Some(RawAllocation { addr, filler: None });
        }

        // Object does not fit on the current page; waste the tail and
        // move on.
        if self.alloc_page + 1 >= self.total_pages {
            return None;
        }
        let tail = page.object_area_end() - self.alloc_top;
        let filler = (tail > 0).then_some((self.alloc_top, tail));
        self.waste += tail;
        page.set_allocation_top(page.object_area_end());

        self.alloc_page += 1;
        self.pages_in_use = self.pages_in_use.max(self.alloc_page + 1);
        // SAFETY: bounds checked above
        let page = unsafe { &mut *self.page(self.alloc_page) };
        let addr = page.object_area_start();
        self.alloc_top = addr + size;
        page.set_allocation_top(self.alloc_top);
        self.size += size;
        Some(RawAllocation { addr, filler })
    }

    /// Return `[addr, addr + size)` to the free list.
    pub fn free_region(&mut self, addr: usize, size: usize) {
        debug_assert!(self.chunk_size.is_none());
        debug_assert!(self.contains(addr));
        self.free_list.free(addr, size);
        self.size -= size;
    }

    /// Return one fixed-size chunk (map space).
    pub fn free_chunk(&mut self, addr: usize) {
        let chunk = self.chunk_size.expect("not a chunked space");
        debug_assert!(self.contains(addr));
        self.free_list.free(addr, chunk);
        self.size -= chunk;
    }

    // ── Mark-compact support ───────────────────────────────────────

    pub fn prepare_for_mark_compact(&mut self, compacting: bool) {
        if compacting {
            for index in 0..self.pages_in_use {
                // SAFETY: in-use pages are mapped
                let page = unsafe { &mut *self.page(index) };
                page.mc_page_index = index as u32;
                page.mc_first_forwarded = FIRST_FORWARDED_SENTINEL;
                page.mc_relocation_top = OBJECT_AREA_START as u32;
            }
            self.mc_reset_relocation_info();
        }
    }

    pub fn mc_reset_relocation_info(&mut self) {
        self.mc = RelocationInfo {
            page: 0,
            top: self.start + OBJECT_AREA_START,
            live_bytes: 0,
        };
    }

    /// Hand out the next destination address during forwarding encoding.
    /// Fails only when the space itself is full, which cannot happen for
    /// objects the space already held.
    pub fn mc_allocate_raw(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % WORD_SIZE == 0);
        debug_assert!(size <= OBJECT_AREA_SIZE);

        // SAFETY: the mc cursor only moves over mapped pages
        let page = unsafe { &mut *self.page(self.mc.page) };
        if self.mc.top + size <= page.object_area_end() {
            let addr = self.mc.top;
            self.mc.top += size;
            self.mc.live_bytes += size;
            return Some(addr);
        }

        if self.mc.page + 1 >= self.total_pages {
            return None;
        }
        // Seal the departing page's relocation top.
        page.mc_relocation_top = page.offset_of(self.mc.top) as u32;

        self.mc.page += 1;
        // SAFETY: bounds checked above
        let page = unsafe { &mut *self.page(self.mc.page) };
        let addr = page.object_area_start();
        self.mc.top = addr + size;
        self.mc.live_bytes += size;
        Some(addr)
    }

    /// Seal the final relocation page. Called once all spaces have been
    /// encoded, so promoted new-space objects are already included.
    pub fn mc_write_relocation_info_to_page(&mut self) {
        // SAFETY: the mc cursor only moves over mapped pages
        let page = unsafe { &mut *self.page(self.mc.page) };
        page.mc_relocation_top = page.offset_of(self.mc.top) as u32;
    }

    /// Number of pages the relocation cursor has touched.
    #[inline(always)]
    pub fn mc_pages_used(&self) -> usize {
        self.mc.page + 1
    }

    /// Record that `[addr, addr + size)` now holds a relocated object.
    /// The destination must fall below the page's encoded high-water
    /// mark; the commit step publishes the marks as allocation tops.
    pub fn mc_adjust_relocation_end(&mut self, addr: usize, size: usize) {
        debug_assert!(self.contains(addr));
        // SAFETY: addr is inside this space
        let page = unsafe { &*Page::from_address(addr) };
        debug_assert!(
            page.offset_of(addr + size) <= page.mc_relocation_top as usize,
            "relocation outside the encoded high-water mark"
        );
        let _ = (page, size);
    }

    /// Linear position of `addr` in the space's relocation order. Used
    /// to check that compaction only moves objects downward.
    pub fn mc_space_offset_for_address(&self, addr: usize) -> usize {
        let index = self.page_index_of(addr);
        // SAFETY: addr is inside this space
        let page = unsafe { &*Page::from_address(addr) };
        index * OBJECT_AREA_SIZE + (page.offset_of(addr) - OBJECT_AREA_START)
    }

    /// Publish the relocation results: the mc cursor becomes the
    /// allocation cursor and the pre-compaction free list and waste are
    /// gone.
    pub fn mc_commit_relocation_info(&mut self) {
        self.pages_in_use = self.mc.page + 1;
        self.alloc_page = self.mc.page;
        self.alloc_top = self.mc.top;
        for index in 0..self.pages_in_use {
            // SAFETY: in-use pages are mapped
            let page = unsafe { &mut *self.page(index) };
            let top = page.address_at(page.mc_relocation_top as usize);
            page.set_allocation_top(top);
        }
        // Pages past the cursor are empty again.
        for index in self.pages_in_use..self.total_pages {
            // SAFETY: all pages are mapped
            let page = unsafe { &mut *self.page(index) };
            page.set_allocation_top(page.object_area_start());
        }
        self.size = self.mc.live_bytes;
        self.waste = 0;
        self.free_list.reset();
    }
}

impl Drop for PagedSpace {
    fn drop(&mut self) {
        if let Some(ptr) = NonNull::new(self.start as *mut u8) {
            system::unmap_memory(ptr, self.total_pages * PAGE_SIZE);
        }
    }
}

// ── Page and object iterators ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageIteratorMode {
    /// Pages the mutator has allocated into.
    PagesInUse,
    /// Pages the relocation cursor has touched.
    PagesUsedByMc,
}

pub struct PageIterator<'a> {
    space: &'a PagedSpace,
    index: usize,
    limit: usize,
}

impl<'a> PageIterator<'a> {
    pub fn new(space: &'a PagedSpace, mode: PageIteratorMode) -> Self {
        let limit = match mode {
            PageIteratorMode::PagesInUse => space.pages_in_use,
            PageIteratorMode::PagesUsedByMc => space.mc_pages_used(),
        };
        PageIterator { space, index: 0, limit }
    }
}

impl Iterator for PageIterator<'_> {
    type Item = *mut Page;

    fn next(&mut self) -> Option<*mut Page> {
        if self.index >= self.limit {
            return None;
        }
        let page = self.space.page(self.index);
        self.index += 1;
        Some(page)
    }
}

/// Per-object size override, used during the overflow rescan where map
/// words carry mark and overflow bits.
pub type SizeFunc = fn(HeapObject) -> usize;

/// Walks every object in a paged space in address order. Only valid
/// while the space is linearly walkable (map words hold map pointers,
/// possibly marked when `size_func` compensates).
pub struct HeapObjectIterator<'a> {
    space: &'a PagedSpace,
    page: usize,
    cur: usize,
    size_func: Option<SizeFunc>,
}

impl<'a> HeapObjectIterator<'a> {
    pub fn new(space: &'a PagedSpace, size_func: Option<SizeFunc>) -> Self {
        // SAFETY: page 0 is always mapped
        let cur = unsafe { (*space.page(0)).object_area_start() };
        HeapObjectIterator { space, page: 0, cur, size_func }
    }
}

impl Iterator for HeapObjectIterator<'_> {
    type Item = HeapObject;

    fn next(&mut self) -> Option<HeapObject> {
        loop {
            if self.page >= self.space.pages_in_use {
                return None;
            }
            // SAFETY: in-use pages are mapped
            let page = unsafe { &*self.space.page(self.page) };
            if self.cur >= page.allocation_top() {
                self.page += 1;
                if self.page < self.space.pages_in_use {
                    // SAFETY: bounds checked
                    self.cur =
                        unsafe { (*self.space.page(self.page)).object_area_start() };
                }
                continue;
            }
            let obj = HeapObject::from_address(self.cur);
            let size = match self.size_func {
                Some(f) => f(obj),
                // SAFETY: the space is linearly walkable by contract
                None => unsafe { obj.size() },
            };
            self.cur += size;
            return Some(obj);
        }
    }
}

// ── New space ─────────────────────────────────────────────────────────

/// The young generation: two semispaces that swap roles each collection.
/// Mutator allocation bumps through the active (`to`) half; the inactive
/// (`from`) half backs the marking stack during a collection and
/// receives relocated survivors that could not be promoted.
pub struct NewSpace {
    start: usize,
    semispace_size: usize,
    to_low: usize,
    from_low: usize,
    top: usize,
    age_mark: usize,
    mc_top: usize,
}

impl NewSpace {
    pub fn new(semispace_size: usize) -> Option<NewSpace> {
        debug_assert!(semispace_size % system::OS_PAGE_SIZE == 0);
        let reservation =
            system::map_memory_aligned(2 * semispace_size, system::OS_PAGE_SIZE)?;
        let start = reservation.as_ptr() as usize;
        Some(NewSpace {
            start,
            semispace_size,
            to_low: start,
            from_low: start + semispace_size,
            top: start,
            age_mark: start,
            mc_top: 0,
        })
    }

    #[inline(always)]
    pub fn bottom(&self) -> usize {
        self.to_low
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.semispace_size
    }

    #[inline(always)]
    pub fn age_mark(&self) -> usize {
        self.age_mark
    }

    #[inline(always)]
    pub fn set_age_mark(&mut self, mark: usize) {
        self.age_mark = mark;
    }

    #[inline(always)]
    pub fn from_space_low(&self) -> usize {
        self.from_low
    }

    #[inline(always)]
    pub fn from_space_high(&self) -> usize {
        self.from_low + self.semispace_size
    }

    /// True for addresses in the active semispace.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.to_low && addr < self.to_low + self.semispace_size
    }

    #[inline(always)]
    pub fn from_space_contains(&self, addr: usize) -> bool {
        addr >= self.from_low && addr < self.from_space_high()
    }

    /// True for addresses anywhere in the reservation, either semispace.
    #[inline(always)]
    pub fn in_reservation(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.start + 2 * self.semispace_size
    }

    #[inline(always)]
    pub fn to_space_offset_for_address(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr) || addr == self.to_low + self.semispace_size);
        addr - self.to_low
    }

    #[inline(always)]
    pub fn from_space_offset_for_address(&self, addr: usize) -> usize {
        debug_assert!(self.from_space_contains(addr));
        addr - self.from_low
    }

    pub fn allocate_raw(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % WORD_SIZE == 0);
        if self.top + size > self.to_low + self.semispace_size {
            return None;
        }
        let addr = self.top;
        self.top += size;
        Some(addr)
    }

    pub fn mc_reset_relocation_info(&mut self) {
        self.mc_top = self.from_low;
    }

    /// Destination allocation in the inactive semispace, for survivors
    /// whose promotion failed. Cannot overflow: the live set fits the
    /// semispace by definition.
    pub fn mc_allocate_raw(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % WORD_SIZE == 0);
        if self.mc_top + size > self.from_space_high() {
            return None;
        }
        let addr = self.mc_top;
        self.mc_top += size;
        Some(addr)
    }

    /// Swap the roles of the semispaces.
    pub fn flip(&mut self) {
        core::mem::swap(&mut self.to_low, &mut self.from_low);
    }

    /// Publish the relocation cursor as the allocation top. Called after
    /// the flip, when the cursor points into the new active semispace.
    pub fn mc_commit_relocation_info(&mut self) {
        debug_assert!(
            self.mc_top >= self.to_low
                && self.mc_top <= self.to_low + self.semispace_size
        );
        self.top = self.mc_top;
    }
}

impl Drop for NewSpace {
    fn drop(&mut self) {
        if let Some(ptr) = NonNull::new(self.start as *mut u8) {
            system::unmap_memory(ptr, 2 * self.semispace_size);
        }
    }
}

/// Walks the live objects of the active semispace in address order.
pub struct SemiSpaceIterator {
    cur: usize,
    end: usize,
    size_func: Option<SizeFunc>,
}

impl SemiSpaceIterator {
    pub fn new(space: &NewSpace, size_func: Option<SizeFunc>) -> Self {
        SemiSpaceIterator { cur: space.bottom(), end: space.top(), size_func }
    }
}

impl Iterator for SemiSpaceIterator {
    type Item = HeapObject;

    fn next(&mut self) -> Option<HeapObject> {
        if self.cur >= self.end {
            return None;
        }
        let obj = HeapObject::from_address(self.cur);
        let size = match self.size_func {
            Some(f) => f(obj),
            // SAFETY: the semispace is linearly walkable by contract
            None => unsafe { obj.size() },
        };
        self.cur += size;
        Some(obj)
    }
}

// ── Large-object space ────────────────────────────────────────────────

struct LargeChunk {
    base: NonNull<u8>,
    chunk_size: usize,
}

/// Home of objects above the large-object threshold. Each object gets
/// its own mapping; nothing here ever moves.
pub struct LargeObjectSpace {
    chunks: Vec<LargeChunk>,
    size: usize,
}

impl LargeObjectSpace {
    pub fn new() -> LargeObjectSpace {
        LargeObjectSpace { chunks: Vec::new(), size: 0 }
    }

    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let chunk_size = size.next_multiple_of(system::OS_PAGE_SIZE);
        let base = system::map_memory(chunk_size)?;
        self.chunks.push(LargeChunk { base, chunk_size });
        self.size += chunk_size;
        Some(base.as_ptr() as usize)
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.chunks.iter().any(|chunk| {
            let base = chunk.base.as_ptr() as usize;
            addr >= base && addr < base + chunk.chunk_size
        })
    }

    pub fn objects(&self) -> impl Iterator<Item = HeapObject> + '_ {
        self.chunks
            .iter()
            .map(|chunk| HeapObject::from_address(chunk.base.as_ptr() as usize))
    }

    /// Deallocate unmarked objects; clear the mark on survivors.
    pub fn free_unmarked_objects(&mut self, tracer: &mut GcTracer) {
        let mut freed = 0usize;
        self.chunks.retain(|chunk| {
            let obj = HeapObject::from_address(chunk.base.as_ptr() as usize);
            // SAFETY: chunk holds a valid object
            unsafe {
                if obj.is_marked() {
                    obj.clear_mark();
                    tracer.decrement_marked_count();
                    true
                } else {
                    freed += chunk.chunk_size;
                    system::unmap_memory(chunk.base, chunk.chunk_size);
                    false
                }
            }
        });
        self.size -= freed;
    }
}

impl Default for LargeObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeObjectSpace {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            system::unmap_memory(chunk.base, chunk.chunk_size);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_from_address_aligns_down() {
        let space = PagedSpace::new("test", 2, None).unwrap();
        let page0 = space.page(0) as usize;
        let inside = page0 + OBJECT_AREA_START + 104;
        assert_eq!(Page::from_address(inside) as usize, page0);
        assert_eq!(Page::from_address(page0 + PAGE_SIZE) as usize, page0 + PAGE_SIZE);
    }

    #[test]
    fn rset_bits_round_trip() {
        let space = PagedSpace::new("test", 1, None).unwrap();
        // SAFETY: page 0 is mapped
        let page = unsafe { &mut *space.page(0) };
        let slot = page.object_area_start() + 5 * WORD_SIZE;

        assert!(!page.is_rset_bit_set(slot));
        page.set_rset_bit(slot);
        assert!(page.is_rset_bit_set(slot));
        assert!(!page.is_rset_bit_set(slot + WORD_SIZE));

        page.clear_rset_range(page.object_area_start(), 8 * WORD_SIZE);
        assert!(!page.is_rset_bit_set(slot));
    }

    #[test]
    fn bump_allocation_crosses_pages() {
        let mut space = PagedSpace::new("test", 2, None).unwrap();
        let first = space.allocate_raw(OBJECT_AREA_SIZE - 64).unwrap();
        assert!(first.filler.is_none());
        assert_eq!(space.pages_in_use(), 1);

        // 128 bytes cannot fit the 64-byte tail; expect a tail filler and
        // an address on page 1.
        let second = space.allocate_raw(128).unwrap();
        let (tail_addr, tail_size) = second.filler.unwrap();
        assert_eq!(tail_size, 64);
        assert_eq!(tail_addr, first.addr + OBJECT_AREA_SIZE - 64);
        assert_eq!(space.page_index_of(second.addr), 1);
        assert_eq!(space.waste(), 64);
        assert_eq!(space.pages_in_use(), 2);
    }

    #[test]
    fn free_list_reuse_and_split() {
        let mut space = PagedSpace::new("test", 1, None).unwrap();
        let a = space.allocate_raw(128).unwrap().addr;
        let _b = space.allocate_raw(64).unwrap().addr;

        space.free_region(a, 128);
        assert_eq!(space.available_free(), 128);

        let again = space.allocate_raw(64).unwrap();
        assert_eq!(again.addr, a);
        let (rem_addr, rem_size) = again.filler.unwrap();
        assert_eq!(rem_addr, a + 64);
        assert_eq!(rem_size, 64);
        assert_eq!(space.available_free(), 64);
    }

    #[test]
    fn mc_allocation_seals_page_tops() {
        let mut space = PagedSpace::new("test", 2, None).unwrap();
        space.prepare_for_mark_compact(true);

        let chunk = OBJECT_AREA_SIZE - 32;
        let first = space.mc_allocate_raw(chunk).unwrap();
        let second = space.mc_allocate_raw(128).unwrap();
        space.mc_write_relocation_info_to_page();

        // SAFETY: pages are mapped
        unsafe {
            let page0 = &*space.page(0);
            assert_eq!(
                page0.mc_relocation_top as usize,
                OBJECT_AREA_START + chunk
            );
            let page1 = &*space.page(1);
            assert_eq!(page1.mc_relocation_top as usize, OBJECT_AREA_START + 128);
        }
        // SAFETY: page 0 is mapped
        assert_eq!(first, unsafe { (*space.page(0)).object_area_start() });
        assert_eq!(space.page_index_of(second), 1);
        assert_eq!(space.mc_pages_used(), 2);
    }

    #[test]
    fn mc_space_offset_is_monotonic_across_pages() {
        let space = PagedSpace::new("test", 2, None).unwrap();
        // SAFETY: pages are mapped
        let (p0, p1) = unsafe { (&*space.page(0), &*space.page(1)) };
        let end_of_p0 = p0.object_area_end() - WORD_SIZE;
        let start_of_p1 = p1.object_area_start();
        assert!(
            space.mc_space_offset_for_address(end_of_p0)
                < space.mc_space_offset_for_address(start_of_p1)
        );
    }

    #[test]
    fn new_space_flip_swaps_roles() {
        let mut space = NewSpace::new(64 * 1024).unwrap();
        let a = space.allocate_raw(64).unwrap();
        assert!(space.contains(a));
        assert!(!space.from_space_contains(a));

        let old_from = space.from_space_low();
        space.flip();
        assert_eq!(space.bottom(), old_from);
        assert!(space.from_space_contains(a));
        assert!(space.in_reservation(a));
    }

    #[test]
    fn new_space_mc_cursor_lands_in_from_space() {
        let mut space = NewSpace::new(64 * 1024).unwrap();
        space.mc_reset_relocation_info();
        let dest = space.mc_allocate_raw(128).unwrap();
        assert!(space.from_space_contains(dest));

        space.flip();
        space.mc_commit_relocation_info();
        assert_eq!(space.top(), space.bottom() + 128);
    }

    #[test]
    fn large_object_space_contains() {
        let mut lo = LargeObjectSpace::new();
        let addr = lo.allocate(100_000).unwrap();
        assert!(lo.contains(addr));
        assert!(lo.contains(addr + 99_999));
        assert!(!lo.contains(addr.wrapping_sub(1)));
        assert_eq!(lo.objects().count(), 1);
    }
}
