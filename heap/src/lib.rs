//! A generational managed heap with a stop-the-world mark–compact
//! collector.
//!
//! The heap is partitioned into five spaces: a semispace pair for young
//! allocations, paged old/code/map spaces, and a large-object space.
//! [`collect_garbage`] runs a full collection: tri-color marking over
//! an overflow-tolerant work stack, then either in-place sweeping or a
//! sliding compaction that encodes forwarding addresses into object map
//! words, rewrites every pointer, moves the survivors, and rebuilds the
//! remembered sets.

mod collector;
mod handles;
mod heap;
mod spaces;
mod system;

pub use collector::{collect_garbage, GcFlags, GcTracer, MarkingStack};
pub use handles::{GlobalHandle, GlobalHandles, ObjectGroup, WeakCallback};
pub use heap::{
    AllocationSpace, Heap, HeapConfig, HeapError, Roots, StubCache,
};
pub use spaces::{
    HeapObjectIterator, LargeObjectSpace, NewSpace, Page, PagedSpace,
    PageIterator, PageIteratorMode, SemiSpaceIterator,
    FIRST_FORWARDED_SENTINEL, MAX_PAGES_PER_SPACE, OBJECT_AREA_SIZE,
    OBJECT_AREA_START, PAGE_SIZE,
};
pub use system::{map_memory, map_memory_aligned, unmap_memory, OS_PAGE_SIZE};
