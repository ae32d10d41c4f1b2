//! Stop-the-world mark–compact collection.
//!
//! A collection runs five phases in a fixed order: mark live objects,
//! sweep the large-object space, then — when compacting — encode
//! forwarding addresses into map words, rewrite every pointer, move the
//! objects, and rebuild the remembered sets. Non-compacting collections
//! replace the last four steps with an in-place sweep.
//!
//! Marking is a mostly depth-first traversal driven by an explicit
//! stack of gray objects laid over the inactive new-space semispace.
//! The stack can overflow; overflowed objects are tagged in their map
//! words and recovered by rescanning the spaces until no tagged object
//! remains.

use object::{
    code_from_derived_pointer, Code, ConsString, HeapObject, InstanceType,
    Map, MapWord, ObjectVisitor, RelocEntry, SymbolTable, Value,
    MULTI_FREE_ENCODING, SINGLE_FREE_ENCODING, WORD_SIZE,
};

use crate::handles::GlobalHandle;
use crate::heap::{AllocationSpace, Heap};
use crate::spaces::{
    Page, PagedSpace, PageIterator, PageIteratorMode, SemiSpaceIterator,
    FIRST_FORWARDED_SENTINEL, OBJECT_AREA_SIZE, OBJECT_AREA_START, PAGE_SIZE,
};

/// Pattern written over free-region interiors in debug builds.
#[cfg(debug_assertions)]
const ZAP_VALUE: usize = 0xdead_beed;

/// Call-stack budget for the inline marking recursion.
const MARKING_RECURSION_HEADROOM: usize = 256 * 1024;

/// Slot-count threshold above which marking tries direct recursion
/// instead of going through the marking stack.
const MIN_RANGE_FOR_MARKING_RECURSION: usize = 64;

const FRAGMENTATION_LIMIT_PERCENT: usize = 50;

// ── Flags ─────────────────────────────────────────────────────────────

/// Collection tunables.
#[derive(Debug, Clone)]
pub struct GcFlags {
    /// Compact on every full collection.
    pub always_compact: bool,
    /// Never compact. Overrides everything; testing only.
    pub never_compact: bool,
    /// Flush inline caches while marking.
    pub cleanup_ics_at_gc: bool,
    /// Clear code caches in maps while marking.
    pub cleanup_caches_in_maps_at_gc: bool,
    /// Trace every forward/update/relocate action.
    pub gc_verbose: bool,
    /// Run heap-wide invariant checks between phases.
    pub verify_global_gc: bool,
}

impl Default for GcFlags {
    fn default() -> Self {
        GcFlags {
            always_compact: false,
            never_compact: false,
            cleanup_ics_at_gc: true,
            cleanup_caches_in_maps_at_gc: true,
            gc_verbose: false,
            verify_global_gc: false,
        }
    }
}

// ── Tracer ────────────────────────────────────────────────────────────

/// Per-collection bookkeeping handed in by the caller.
#[derive(Debug, Default)]
pub struct GcTracer {
    marked_count: usize,
    /// Marked-object count left over by the previous collection.
    pub previous_marked_count: usize,
    compacting: bool,
}

impl GcTracer {
    pub fn new() -> GcTracer {
        GcTracer::default()
    }

    #[inline(always)]
    pub fn increment_marked_count(&mut self) {
        self.marked_count += 1;
    }

    #[inline(always)]
    pub fn decrement_marked_count(&mut self) {
        debug_assert!(self.marked_count > 0);
        self.marked_count -= 1;
    }

    #[inline(always)]
    pub fn marked_count(&self) -> usize {
        self.marked_count
    }

    pub fn set_is_compacting(&mut self) {
        self.compacting = true;
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting
    }
}

// ── Marking stack ─────────────────────────────────────────────────────

/// Bounded LIFO of gray objects over a caller-supplied address range.
/// A push past capacity latches the overflow flag and is dropped; the
/// rescan protocol recovers the dropped objects from their map words.
#[derive(Debug, Default)]
pub struct MarkingStack {
    low: usize,
    top: usize,
    high: usize,
    overflowed: bool,
}

impl MarkingStack {
    pub fn initialize(&mut self, low: usize, high: usize) {
        debug_assert!(low <= high);
        debug_assert!(low % WORD_SIZE == 0 && high % WORD_SIZE == 0);
        self.low = low;
        self.top = low;
        self.high = high;
        self.overflowed = false;
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.top == self.low
    }

    #[inline(always)]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    #[inline(always)]
    pub fn clear_overflowed(&mut self) {
        self.overflowed = false;
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        (self.high - self.low) / WORD_SIZE
    }

    /// # Safety
    ///
    /// The backing range must be writable.
    #[inline(always)]
    pub unsafe fn push(&mut self, obj: HeapObject) {
        if self.top == self.high {
            self.overflowed = true;
            return;
        }
        // SAFETY: top < high, inside the backing range
        unsafe { *(self.top as *mut usize) = obj.address() };
        self.top += WORD_SIZE;
    }

    /// # Safety
    ///
    /// The stack must not be empty.
    #[inline(always)]
    pub unsafe fn pop(&mut self) -> HeapObject {
        debug_assert!(!self.is_empty());
        self.top -= WORD_SIZE;
        // SAFETY: top is within the written range
        HeapObject::from_address(unsafe { *(self.top as *const usize) })
    }
}

// ── Stack limit check ─────────────────────────────────────────────────

#[inline(never)]
fn current_stack_address() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

/// Cheap recursion guard: compares the current stack position against a
/// limit derived from the stack position at collection start.
struct StackLimitCheck {
    limit: usize,
}

impl StackLimitCheck {
    fn new(limit: usize) -> StackLimitCheck {
        StackLimitCheck { limit }
    }

    #[inline(always)]
    fn has_overflowed(&self) -> bool {
        current_stack_address() < self.limit
    }
}

// ── Collector ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectorState {
    Idle,
    Prepare,
    MarkLiveObjects,
    SweepSpaces,
    EncodeForwardingAddresses,
    UpdatePointers,
    RelocateObjects,
    RebuildRSets,
}

#[derive(Clone, Copy)]
enum PagedSpaceId {
    Old,
    Code,
    Map,
}

/// Destination policy during forwarding encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
enum EncodeSpace {
    Old,
    Code,
    Map,
    New,
}

type LiveObjectCallback =
    unsafe fn(&mut MarkCompactCollector, HeapObject) -> usize;

/// One collection in progress. Holds the phase tag, the marking stack,
/// the compacting decision, and the live counters; built fresh for each
/// `collect_garbage` call and passed down the call tree.
pub struct MarkCompactCollector {
    heap: *mut Heap,
    tracer: *mut GcTracer,
    compacting: bool,
    state: CollectorState,
    marking_stack: MarkingStack,
    stack_limit: usize,
    live_bytes: usize,
    live_young_objects: usize,
    live_old_objects: usize,
    live_code_objects: usize,
    live_map_objects: usize,
    live_lo_objects: usize,
}

/// Run a full collection over `heap`.
pub fn collect_garbage(heap: &mut Heap, tracer: &mut GcTracer) {
    let mut collector = MarkCompactCollector {
        heap,
        tracer,
        compacting: false,
        state: CollectorState::Idle,
        marking_stack: MarkingStack::default(),
        stack_limit: current_stack_address()
            .saturating_sub(MARKING_RECURSION_HEADROOM),
        live_bytes: 0,
        live_young_objects: 0,
        live_old_objects: 0,
        live_code_objects: 0,
        live_map_objects: 0,
        live_lo_objects: 0,
    };

    collector.prepare();
    if collector.compacting {
        tracer.set_is_compacting();
    }

    // SAFETY: the collector owns the heap for the duration of the call;
    // the mutator is stopped.
    unsafe {
        collector.mark_live_objects();
        collector.sweep_large_object_space();

        if collector.compacting {
            collector.encode_forwarding_addresses();
            collector.update_pointers();
            collector.relocate_objects();
            collector.rebuild_rsets();
        } else {
            collector.sweep_spaces();
        }
    }

    collector.finish();

    tracer.previous_marked_count = tracer.marked_count();
    debug_assert!(tracer.previous_marked_count == 0);
}

impl MarkCompactCollector {
    #[inline(always)]
    fn flags(&self) -> GcFlags {
        // SAFETY: heap outlives the collector
        unsafe { (*self.heap).flags.clone() }
    }

    fn transition(&mut self, from: CollectorState, to: CollectorState) {
        debug_assert!(self.state == from);
        self.state = to;
        let _ = from;
    }

    // ── Prepare / finish ───────────────────────────────────────────

    fn prepare(&mut self) {
        self.transition(CollectorState::Idle, CollectorState::Prepare);
        let flags = self.flags();
        assert!(
            !(flags.always_compact && flags.never_compact),
            "always_compact and never_compact are mutually exclusive"
        );

        // SAFETY: exclusive heap access for the whole collection
        let heap = unsafe { &mut *self.heap };

        self.compacting = flags.always_compact;

        // Compact when the old generation gets fragmented enough that
        // reclaiming the waste and free-list blocks pays off.
        if !self.compacting {
            let recoverable = heap.old_space.waste()
                + heap.old_space.available_free()
                + heap.code_space.waste()
                + heap.code_space.available_free();
            let used =
                recoverable + heap.old_space.size() + heap.code_space.size();
            if used > 0
                && recoverable * 100 / used > FRAGMENTATION_LIMIT_PERCENT
            {
                self.compacting = true;
            }
        }

        if flags.never_compact {
            self.compacting = false;
        }

        heap.map_space.prepare_for_mark_compact(self.compacting);
        heap.old_space.prepare_for_mark_compact(self.compacting);
        heap.code_space.prepare_for_mark_compact(self.compacting);

        self.live_bytes = 0;
        self.live_young_objects = 0;
        self.live_old_objects = 0;
        self.live_code_objects = 0;
        self.live_map_objects = 0;
        self.live_lo_objects = 0;
    }

    fn finish(&mut self) {
        debug_assert!(matches!(
            self.state,
            CollectorState::SweepSpaces | CollectorState::RebuildRSets
        ));
        self.state = CollectorState::Idle;
        // The stub cache is not traversed during collection; its entries
        // reference objects by address and are stale after a move. Drop
        // everything and let it refill lazily.
        // SAFETY: exclusive heap access
        unsafe { (*self.heap).stub_cache.clear() };
    }

    // ── Phase 1: marking ───────────────────────────────────────────

    unsafe fn mark_live_objects(&mut self) {
        self.transition(
            CollectorState::Prepare,
            CollectorState::MarkLiveObjects,
        );

        // SAFETY: exclusive heap access
        let heap = unsafe { &mut *self.heap };

        // The to space holds the live young objects; the from space is
        // free to serve as the marking-stack backing store.
        let low = heap.new_space.from_space_low();
        let high = match heap.config.marking_stack_capacity {
            Some(capacity) => low + capacity * WORD_SIZE,
            None => heap.new_space.from_space_high(),
        };
        self.marking_stack.initialize(low, high);
        debug_assert!(!self.marking_stack.overflowed());

        let mut visitor = MarkingVisitor { mc: self as *mut Self };
        // SAFETY: single-threaded; the visitor's raw pointer is valid
        // for the whole phase
        unsafe {
            self.mark_strong_roots(&mut visitor);
            self.process_marking_stack(&mut visitor);

            // Objects reachable from roots are black now. Pull in object
            // groups with at least one marked member until nothing new
            // turns up.
            self.process_object_groups(&mut visitor);

            // Handle weak references: clear the dying ones, then treat
            // the survivors as strong and close over them.
            (*self.heap)
                .global_handles
                .mark_weak_roots(|value| must_be_marked(value));
            (*self.heap).global_handles.iterate_weak_roots(&mut visitor);
            self.process_marking_stack(&mut visitor);

            // Weak roots may have revived groups.
            self.process_object_groups(&mut visitor);

            self.prune_symbol_table();
        }

        if self.flags().verify_global_gc {
            // SAFETY: marking is complete; the heap is walkable
            unsafe { self.verify_heap_after_marking() };
        }

        // SAFETY: exclusive heap access
        unsafe { (*self.heap).global_handles.remove_object_groups() };
    }

    unsafe fn mark_strong_roots(&mut self, visitor: &mut MarkingVisitor) {
        // SAFETY: exclusive heap access; visitor only uses raw pointers
        unsafe {
            (*self.heap).iterate_strong_roots(visitor);

            // The symbol table is weak in its elements: mark its prefix
            // gray through the visitor, then mark the table itself black
            // without ever pushing it, so its element slots are never
            // traced.
            let table_obj =
                HeapObject::from_value((*self.heap).symbol_table);
            let table = &*SymbolTable::assume_marked(table_obj);
            table.iterate_prefix(visitor);
            self.update_live_object_count(table_obj);
            table_obj.set_mark();
            (*self.tracer).increment_marked_count();
        }
    }

    /// Mark `obj` if it is still white.
    ///
    /// # Safety
    ///
    /// `obj` must be a valid heap object.
    unsafe fn mark_object(&mut self, obj: HeapObject) {
        // SAFETY: per contract
        unsafe {
            if !obj.is_marked() {
                self.mark_unmarked_object(obj);
            }
        }
    }

    unsafe fn mark_unmarked_object(&mut self, obj: HeapObject) {
        // SAFETY: obj is a valid, unmarked heap object
        unsafe {
            debug_assert!(!obj.is_marked());
            self.update_live_object_count(obj);

            if self.flags().cleanup_caches_in_maps_at_gc
                && (*obj.map()).instance_type() == InstanceType::Map
            {
                (*(obj.address() as *mut Map)).clear_code_cache();
            }

            obj.set_mark();
            (*self.tracer).increment_marked_count();

            if !self.marking_stack.overflowed() {
                debug_assert!((*self.heap).contains(obj.address()));
                self.marking_stack.push(obj);
            } else {
                // Tag for the rescan pass.
                obj.set_overflow();
            }
        }
    }

    /// Mark as black everything reachable from gray objects. Gray is
    /// either on the stack, or marked-overflowed somewhere in the heap.
    unsafe fn process_marking_stack(&mut self, visitor: &mut MarkingVisitor) {
        loop {
            while !self.marking_stack.is_empty() {
                // SAFETY: stack entries are valid marked objects
                unsafe {
                    let obj = self.marking_stack.pop();
                    debug_assert!((*self.heap).contains(obj.address()));
                    // Leaving the stack turns a gray object black.
                    debug_assert!(obj.is_marked() && !obj.is_overflowed());

                    // The object is marked, so recover the plain map
                    // pointer before using it to walk the body.
                    let map_word = obj.map_word().clear_mark();
                    let map_addr = map_word.to_map_address();
                    let map = &*(map_addr as *const Map);
                    self.mark_object(HeapObject::from_address(map_addr));
                    obj.iterate_body(
                        map.instance_type(),
                        obj.size_from_map(map),
                        visitor,
                    );
                }
            }

            // The only remaining gray objects are marked overflowed in
            // the heap. Refill the stack from them and keep going, with
            // early stops if it overflows again mid-scan.
            if !self.marking_stack.overflowed() {
                return;
            }
            self.marking_stack.clear_overflowed();

            // SAFETY: spaces are linearly walkable during marking
            unsafe {
                let heap = &*self.heap;
                self.scan_overflowed_objects(SemiSpaceIterator::new(
                    &heap.new_space,
                    Some(overflow_object_size),
                ));
                if self.marking_stack.overflowed() {
                    continue;
                }
                self.scan_overflowed_objects(
                    crate::spaces::HeapObjectIterator::new(
                        &heap.old_space,
                        Some(overflow_object_size),
                    ),
                );
                if self.marking_stack.overflowed() {
                    continue;
                }
                self.scan_overflowed_objects(
                    crate::spaces::HeapObjectIterator::new(
                        &heap.code_space,
                        Some(overflow_object_size),
                    ),
                );
                if self.marking_stack.overflowed() {
                    continue;
                }
                self.scan_overflowed_objects(
                    crate::spaces::HeapObjectIterator::new(
                        &heap.map_space,
                        Some(overflow_object_size),
                    ),
                );
                if self.marking_stack.overflowed() {
                    continue;
                }
                self.scan_overflowed_objects(heap.lo_space.objects());
            }
        }
    }

    unsafe fn scan_overflowed_objects(
        &mut self,
        objects: impl Iterator<Item = HeapObject>,
    ) {
        for obj in objects {
            // SAFETY: iterated objects are valid
            unsafe {
                if !obj.is_overflowed() {
                    continue;
                }
                debug_assert!(obj.is_marked());
                if self.marking_stack.overflowed() {
                    return;
                }
                obj.clear_overflow();
                self.marking_stack.push(obj);
            }
        }
    }

    /// Process groups until no member marking adds anything new.
    unsafe fn process_object_groups(&mut self, visitor: &mut MarkingVisitor) {
        debug_assert!(self.marking_stack.is_empty());
        loop {
            // SAFETY: per-phase heap access
            unsafe { self.mark_object_groups() };
            if self.marking_stack.is_empty() {
                return;
            }
            // SAFETY: stack holds valid gray objects
            unsafe { self.process_marking_stack(visitor) };
        }
    }

    /// A group is live as soon as one member is marked: mark the rest
    /// gray and drop the group record.
    unsafe fn mark_object_groups(&mut self) {
        // SAFETY: exclusive heap access
        let heap = unsafe { &mut *self.heap };
        let group_count = heap.global_handles.object_groups().len();

        for index in 0..group_count {
            let handles: Vec<GlobalHandle> = {
                let groups = heap.global_handles.object_groups();
                let Some(group) = &groups[index] else { continue };
                group.objects.clone()
            };
            let members: Vec<Value> = handles
                .iter()
                .map(|&handle| heap.global_handles.handle_value(handle))
                .collect();

            // SAFETY: member values are valid heap references
            let group_marked = unsafe {
                members.iter().any(|value| {
                    value.is_heap_object()
                        && HeapObject::from_value(*value).is_marked()
                })
            };
            if !group_marked {
                continue;
            }

            for value in members {
                if value.is_heap_object() {
                    // SAFETY: valid heap reference
                    unsafe {
                        self.mark_object(HeapObject::from_value(value));
                    }
                }
            }
            heap.global_handles.object_groups()[index] = None;
        }
    }

    /// Drop symbols only the symbol table still points at.
    unsafe fn prune_symbol_table(&mut self) {
        // SAFETY: exclusive heap access; the table is marked, hence the
        // assume-marked accessor
        unsafe {
            let heap = &mut *self.heap;
            let table = &mut *SymbolTable::assume_marked(
                HeapObject::from_value(heap.symbol_table),
            );
            let mut cleaner = SymbolTableCleaner {
                null_value: heap.roots.null_value,
                pointers_removed: 0,
            };
            table.iterate_elements(&mut cleaner);
            table.elements_removed(cleaner.pointers_removed);
        }
    }

    fn update_live_object_count(&mut self, obj: HeapObject) {
        // SAFETY: obj is valid; counters are pure bookkeeping
        unsafe {
            let heap = &*self.heap;
            self.live_bytes += obj.size();
            let addr = obj.address();
            if heap.new_space.contains(addr) {
                self.live_young_objects += 1;
            } else if heap.map_space.contains(addr) {
                debug_assert!(
                    (*obj.map()).instance_type() == InstanceType::Map
                );
                self.live_map_objects += 1;
            } else if heap.old_space.contains(addr) {
                self.live_old_objects += 1;
            } else if heap.code_space.contains(addr) {
                self.live_code_objects += 1;
            } else if heap.lo_space.contains(addr) {
                self.live_lo_objects += 1;
            } else {
                unreachable!("marked object outside every space");
            }
        }
    }

    /// Retarget a cleared inline-cache site to the megamorphic stub.
    /// The stub is a root, so the site stays valid without marking the
    /// old target.
    unsafe fn ic_clear(&mut self, holder: &Code, entry: &mut RelocEntry) {
        // SAFETY: the megamorphic stub is a live code object
        unsafe {
            let stub = (*self.heap).roots.megamorphic_code;
            let stub_entry = (*(stub.address() as *const Code)).entry();
            holder.set_target_address(entry, stub_entry);
        }
    }

    // ── Phase 1.5: sweep large objects ─────────────────────────────

    unsafe fn sweep_large_object_space(&mut self) {
        let next = if self.compacting {
            CollectorState::EncodeForwardingAddresses
        } else {
            CollectorState::SweepSpaces
        };
        self.transition(CollectorState::MarkLiveObjects, next);

        // SAFETY: exclusive heap access
        unsafe {
            let heap = &mut *self.heap;
            heap.lo_space.free_unmarked_objects(&mut *self.tracer);
        }
    }

    // ── Phase 2: encode forwarding addresses ───────────────────────

    unsafe fn encode_forwarding_addresses(&mut self) {
        debug_assert!(
            self.state == CollectorState::EncodeForwardingAddresses
        );

        // SAFETY: exclusive heap access
        unsafe {
            // Young survivors that fail promotion relocate into the
            // inactive semispace.
            (*self.heap).new_space.mc_reset_relocation_info();

            self.encode_forwarding_addresses_in_paged_space(
                PagedSpaceId::Old,
                EncodeSpace::Old,
            );
            self.encode_forwarding_addresses_in_paged_space(
                PagedSpaceId::Code,
                EncodeSpace::Code,
            );

            // New space next to last: its objects promote into the just
            // compacted old and code spaces.
            self.encode_forwarding_addresses_in_new_space();

            // Map space last. Encoding a map overwrites its map word,
            // and every other space needs intact maps to size its dead
            // objects.
            self.encode_forwarding_addresses_in_paged_space(
                PagedSpaceId::Map,
                EncodeSpace::Map,
            );

            // Seal the relocation tops now that promotions are in.
            (*self.heap).old_space.mc_write_relocation_info_to_page();
            (*self.heap).code_space.mc_write_relocation_info_to_page();
            (*self.heap).map_space.mc_write_relocation_info_to_page();
        }

        if self.flags().verify_global_gc {
            // SAFETY: free regions are encoded; live walk is possible
            unsafe { self.verify_heap_after_encoding() };
        }
    }

    unsafe fn paged_space(&self, id: PagedSpaceId) -> *mut PagedSpace {
        // SAFETY: heap outlives the collector
        unsafe {
            match id {
                PagedSpaceId::Old => &mut (*self.heap).old_space,
                PagedSpaceId::Code => &mut (*self.heap).code_space,
                PagedSpaceId::Map => &mut (*self.heap).map_space,
            }
        }
    }

    unsafe fn encode_forwarding_addresses_in_paged_space(
        &mut self,
        id: PagedSpaceId,
        alloc: EncodeSpace,
    ) {
        // SAFETY: page bounds are stable during this phase
        unsafe {
            let space = self.paged_space(id);
            for index in 0..(*space).pages_in_use() {
                let page = &*(*space).page(index);
                // Offsets restart on every page: they are measured from
                // the page's first live object.
                let mut offset = 0usize;
                self.encode_forwarding_addresses_in_range(
                    page.object_area_start(),
                    page.allocation_top(),
                    &mut offset,
                    alloc,
                );
            }
        }
    }

    unsafe fn encode_forwarding_addresses_in_new_space(&mut self) {
        // SAFETY: new-space bounds are stable during this phase
        unsafe {
            let bottom = (*self.heap).new_space.bottom();
            let top = (*self.heap).new_space.top();
            let mut ignored = 0usize;
            self.encode_forwarding_addresses_in_range(
                bottom,
                top,
                &mut ignored,
                EncodeSpace::New,
            );
        }
    }

    /// Walk `[start, end)` clearing mark bits, assigning destinations to
    /// the live objects, and stamping maximal dead runs with free-region
    /// markers so later walks can skip them.
    unsafe fn encode_forwarding_addresses_in_range(
        &mut self,
        start: usize,
        end: usize,
        offset: &mut usize,
        alloc: EncodeSpace,
    ) {
        let gc_verbose = self.flags().gc_verbose;
        let mut free_start = 0usize;
        // True initially so free_start is set before first use.
        let mut is_prev_alive = true;

        let mut current = start;
        while current < end {
            let obj = HeapObject::from_address(current);
            // SAFETY: current always lands on an object boundary
            let object_size = unsafe {
                if obj.is_marked() {
                    obj.clear_mark();
                    (*self.tracer).decrement_marked_count();
                    let object_size = obj.size();

                    // Allocation cannot fail: the space is receiving
                    // only objects it already held.
                    let new_addr = self.mc_allocate(alloc, obj, object_size);
                    self.encode_one(alloc, obj, object_size, new_addr, offset);

                    if gc_verbose {
                        tracing::trace!(
                            from = obj.address(),
                            to = new_addr,
                            "forward"
                        );
                    }

                    if !is_prev_alive {
                        encode_free_region(free_start, current - free_start);
                        is_prev_alive = true;
                    }
                    object_size
                } else {
                    let object_size = obj.size();
                    self.process_non_live(alloc, obj);
                    if is_prev_alive {
                        free_start = current;
                        is_prev_alive = false;
                    }
                    object_size
                }
            };
            current += object_size;
        }

        if !is_prev_alive {
            encode_free_region(free_start, end - free_start);
        }
    }

    unsafe fn mc_allocate(
        &mut self,
        alloc: EncodeSpace,
        obj: HeapObject,
        size: usize,
    ) -> usize {
        // SAFETY: exclusive heap access
        unsafe {
            let heap = &mut *self.heap;
            match alloc {
                EncodeSpace::Old => heap
                    .old_space
                    .mc_allocate_raw(size)
                    .expect("old-space compaction allocation failed"),
                EncodeSpace::Code => heap
                    .code_space
                    .mc_allocate_raw(size)
                    .expect("code-space compaction allocation failed"),
                EncodeSpace::Map => heap
                    .map_space
                    .mc_allocate_raw(size)
                    .expect("map-space compaction allocation failed"),
                EncodeSpace::New => {
                    // Promote young survivors by type; fall back to the
                    // inactive semispace when the target is full, which
                    // always has room for the current live set.
                    let promoted = match heap.target_space(obj) {
                        AllocationSpace::Old => {
                            heap.old_space.mc_allocate_raw(size)
                        }
                        AllocationSpace::Code => {
                            heap.code_space.mc_allocate_raw(size)
                        }
                        _ => unreachable!("promotion targets old or code"),
                    };
                    match promoted {
                        Some(addr) => addr,
                        None => heap
                            .new_space
                            .mc_allocate_raw(size)
                            .expect("live set exceeds semispace"),
                    }
                }
            }
        }
    }

    unsafe fn encode_one(
        &mut self,
        alloc: EncodeSpace,
        obj: HeapObject,
        object_size: usize,
        new_addr: usize,
        offset: &mut usize,
    ) {
        // SAFETY: exclusive heap access
        unsafe {
            let heap = &mut *self.heap;
            if alloc == EncodeSpace::New {
                // The forwarding address lives at the mirrored offset in
                // the from space.
                let to_offset = heap
                    .new_space
                    .to_space_offset_for_address(obj.address());
                let slot = heap.new_space.from_space_low() + to_offset;
                *(slot as *mut usize) = new_addr;
                return;
            }

            // First live object on the page anchors the page's
            // forwarding computation.
            if *offset == 0 {
                (*Page::from_address(obj.address())).mc_first_forwarded =
                    new_addr;
            }

            let map_addr = obj.map() as usize;
            debug_assert!(heap.map_space.contains(map_addr));
            let map_page_index = heap.map_space.page_index_of(map_addr);
            let map_page = &*Page::from_address(map_addr);
            let map_page_offset = map_page.offset_of(map_addr) / WORD_SIZE;

            obj.set_map_word(MapWord::encode_forwarding(
                map_page_index as u32,
                map_page_offset as u32,
                (*offset / WORD_SIZE) as u32,
            ));
            *offset += object_size;
            debug_assert!(*offset <= OBJECT_AREA_SIZE);
        }
    }

    unsafe fn process_non_live(&mut self, alloc: EncodeSpace, obj: HeapObject) {
        if alloc != EncodeSpace::Code {
            return;
        }
        // SAFETY: dead code objects still have readable maps
        unsafe {
            if (*obj.map()).instance_type() == InstanceType::Code {
                tracing::debug!(address = obj.address(), "code delete");
            }
        }
    }

    // ── Phase 3: update pointers ───────────────────────────────────

    unsafe fn update_pointers(&mut self) {
        self.transition(
            CollectorState::EncodeForwardingAddresses,
            CollectorState::UpdatePointers,
        );

        let mut visitor = UpdatingVisitor { mc: self as *mut Self };
        // SAFETY: exclusive heap access; free regions are encoded
        unsafe {
            (*self.heap).iterate_roots(&mut visitor);
            (*self.heap).global_handles.iterate_weak_roots(&mut visitor);

            let live_maps = self.iterate_live_objects_in_paged_space(
                PagedSpaceId::Map,
                Self::update_pointers_in_old_object,
            );
            let live_olds = self.iterate_live_objects_in_paged_space(
                PagedSpaceId::Old,
                Self::update_pointers_in_old_object,
            );
            let live_codes = self.iterate_live_objects_in_paged_space(
                PagedSpaceId::Code,
                Self::update_pointers_in_old_object,
            );
            let live_news = self.iterate_live_objects_in_range(
                (*self.heap).new_space.bottom(),
                (*self.heap).new_space.top(),
                Self::update_pointers_in_new_object,
            );

            // Large objects stay put, but their maps moved.
            let lo_objects: Vec<HeapObject> =
                (*self.heap).lo_space.objects().collect();
            for obj in lo_objects {
                Self::update_pointers_in_new_object(self, obj);
            }

            debug_assert!(live_maps == self.live_map_objects);
            debug_assert!(live_olds == self.live_old_objects);
            debug_assert!(live_codes == self.live_code_objects);
            debug_assert!(live_news == self.live_young_objects);
            let _ = (live_maps, live_olds, live_codes, live_news);
        }

        if self.flags().verify_global_gc {
            // SAFETY: pointers are rewritten; structure is intact
            unsafe { self.verify_page_headers_all() };
        }
    }

    /// Walk the live objects in `[start, end)`, skipping the free-region
    /// encodings, applying `callback` to each. Returns the live count.
    unsafe fn iterate_live_objects_in_range(
        &mut self,
        start: usize,
        end: usize,
        callback: LiveObjectCallback,
    ) -> usize {
        let mut live = 0usize;
        let mut current = start;
        while current < end {
            // SAFETY: current is an object boundary or free marker
            unsafe {
                let word = *(current as *const u64);
                if word == SINGLE_FREE_ENCODING {
                    current += WORD_SIZE;
                } else if word == MULTI_FREE_ENCODING {
                    current += *((current + WORD_SIZE) as *const usize);
                } else {
                    live += 1;
                    current +=
                        callback(self, HeapObject::from_address(current));
                }
            }
        }
        live
    }

    unsafe fn iterate_live_objects_in_paged_space(
        &mut self,
        id: PagedSpaceId,
        callback: LiveObjectCallback,
    ) -> usize {
        let mut live = 0usize;
        // SAFETY: page bounds are stable during phases 3 and 4
        unsafe {
            let space = self.paged_space(id);
            for index in 0..(*space).pages_in_use() {
                let page = &*(*space).page(index);
                live += self.iterate_live_objects_in_range(
                    page.object_area_start(),
                    page.allocation_top(),
                    callback,
                );
            }
        }
        live
    }

    /// Map-space address encoded in a forwarded map word.
    unsafe fn decode_map_address(&self, encoding: MapWord) -> usize {
        // SAFETY: the encoding indexes a mapped map-space page
        unsafe {
            let map_space = &(*self.heap).map_space;
            let page =
                &*map_space.page(encoding.decode_map_page_index() as usize);
            page.address_at(
                encoding.decode_map_page_offset() as usize * WORD_SIZE,
            )
        }
    }

    /// Resolve a paged-space object's destination from its forwarding
    /// encoding: start at the page's first forwarded address, advance by
    /// the live-byte offset, and wrap into the next page when the sum
    /// crosses that page's relocation top.
    unsafe fn get_forwarding_address_in_old_space(
        &self,
        obj: HeapObject,
    ) -> usize {
        // SAFETY: obj sits in a paged space with encoded forwarding
        unsafe {
            let encoding = obj.map_word();
            let offset = encoding.decode_offset() as usize * WORD_SIZE;

            let page = &*Page::from_address(obj.address());
            let first_forwarded = page.mc_first_forwarded;
            debug_assert!(first_forwarded != FIRST_FORWARDED_SENTINEL);

            let forwarded_page = &*Page::from_address(first_forwarded);
            let forwarded_offset = forwarded_page.offset_of(first_forwarded);
            let mc_top_offset = forwarded_page.mc_relocation_top as usize;

            if forwarded_offset + offset < mc_top_offset {
                return first_forwarded + offset;
            }

            // Spills into the next page of the same space.
            let next_page =
                &*((forwarded_page.start() + PAGE_SIZE) as *const Page);
            let wrapped =
                offset - (mc_top_offset - forwarded_offset) + OBJECT_AREA_START;
            debug_assert!(wrapped >= OBJECT_AREA_START && wrapped < PAGE_SIZE);
            debug_assert!(wrapped < next_page.mc_relocation_top as usize);
            next_page.address_at(wrapped)
        }
    }

    /// Rewrite `*slot` to its referent's post-compaction address.
    unsafe fn update_pointer(&mut self, slot: *mut Value) {
        // SAFETY: slot is a live Value location
        unsafe {
            let value = *slot;
            if !value.is_heap_object() {
                return;
            }

            let heap = &*self.heap;
            let obj = HeapObject::from_value(value);
            let old_addr = obj.address();
            debug_assert!(!heap.new_space.from_space_contains(old_addr));

            let new_addr = if heap.new_space.contains(old_addr) {
                let mirror = heap.new_space.from_space_low()
                    + heap.new_space.to_space_offset_for_address(old_addr);
                let new_addr = *(mirror as *const usize);
                debug_assert!(
                    heap.old_space.contains(new_addr)
                        || heap.code_space.contains(new_addr)
                        || heap.new_space.from_space_contains(new_addr)
                );
                if heap.new_space.from_space_contains(new_addr) {
                    debug_assert!(
                        heap.new_space.from_space_offset_for_address(new_addr)
                            <= heap
                                .new_space
                                .to_space_offset_for_address(old_addr)
                    );
                }
                new_addr
            } else if heap.lo_space.contains(old_addr) {
                // Large objects never move.
                old_addr
            } else {
                let new_addr = self.get_forwarding_address_in_old_space(obj);
                debug_assert!(
                    heap.old_space.contains(new_addr)
                        || heap.code_space.contains(new_addr)
                        || heap.map_space.contains(new_addr)
                );
                // Compaction only moves objects downward.
                for space in
                    [&heap.old_space, &heap.code_space, &heap.map_space]
                {
                    if space.contains(old_addr) {
                        debug_assert!(
                            space.mc_space_offset_for_address(new_addr)
                                <= space.mc_space_offset_for_address(old_addr)
                        );
                    }
                }
                new_addr
            };

            *slot = Value::from_address(new_addr);

            if self.flags().gc_verbose {
                tracing::trace!(
                    slot = slot as usize,
                    from = old_addr,
                    to = new_addr,
                    "update"
                );
            }
        }
    }

    /// Update one object whose map word holds a forwarding encoding
    /// (old, code, and map spaces). Re-encodes the map word against the
    /// map's own destination, then rewrites the body fields.
    unsafe fn update_pointers_in_old_object(
        mc: &mut MarkCompactCollector,
        obj: HeapObject,
    ) -> usize {
        // SAFETY: obj has an encoded map word; maps are not moved yet
        unsafe {
            let encoding = obj.map_word();
            let map_addr = mc.decode_map_address(encoding);
            debug_assert!((*mc.heap).map_space.contains(map_addr));

            // The first word at map_addr is itself encoded; only the map
            // body may be read.
            let map = &*(map_addr as *const Map);
            let object_size = obj.size_from_map(map);
            let instance_type = map.instance_type();

            let new_map_addr = mc.get_forwarding_address_in_old_space(
                HeapObject::from_address(map_addr),
            );
            let new_map_page = &*Page::from_address(new_map_addr);
            obj.set_map_word(MapWord::encode_forwarding(
                (*mc.heap).map_space.page_index_of(new_map_addr) as u32,
                (new_map_page.offset_of(new_map_addr) / WORD_SIZE) as u32,
                encoding.decode_offset(),
            ));

            if mc.flags().gc_verbose {
                tracing::trace!(
                    object = obj.address(),
                    map_from = map_addr,
                    map_to = new_map_addr,
                    "update map"
                );
            }

            let mut visitor = UpdatingVisitor { mc: mc as *mut Self };
            obj.iterate_body(instance_type, object_size, &mut visitor);
            object_size
        }
    }

    /// Update one object whose map word is still a plain map pointer
    /// (new space and the large-object space).
    unsafe fn update_pointers_in_new_object(
        mc: &mut MarkCompactCollector,
        obj: HeapObject,
    ) -> usize {
        // SAFETY: obj keeps its plain map word; the old map body is
        // intact until relocation
        unsafe {
            let old_map_addr = obj.map() as usize;
            debug_assert!((*mc.heap).map_space.contains(old_map_addr));

            let forwarded = mc.get_forwarding_address_in_old_space(
                HeapObject::from_address(old_map_addr),
            );
            debug_assert!((*mc.heap).map_space.contains(forwarded));
            obj.set_map(forwarded);

            // Size must come from the old map: map objects have not been
            // relocated yet.
            let old_map = &*(old_map_addr as *const Map);
            let object_size = obj.size_from_map(old_map);

            let mut visitor = UpdatingVisitor { mc: mc as *mut Self };
            obj.iterate_body(old_map.instance_type(), object_size, &mut visitor);
            object_size
        }
    }

    // ── Phase 4: relocate objects ──────────────────────────────────

    unsafe fn relocate_objects(&mut self) {
        self.transition(
            CollectorState::UpdatePointers,
            CollectorState::RelocateObjects,
        );

        // SAFETY: exclusive heap access; pointers already updated
        unsafe {
            // Maps first: every other move computes sizes through them.
            let live_maps = self.iterate_live_objects_in_paged_space(
                PagedSpaceId::Map,
                Self::relocate_map_object,
            );
            let live_olds = self.iterate_live_objects_in_paged_space(
                PagedSpaceId::Old,
                Self::relocate_old_object,
            );
            let live_codes = self.iterate_live_objects_in_paged_space(
                PagedSpaceId::Code,
                Self::relocate_code_object,
            );
            let live_news = self.iterate_live_objects_in_range(
                (*self.heap).new_space.bottom(),
                (*self.heap).new_space.top(),
                Self::relocate_new_object,
            );

            debug_assert!(live_maps == self.live_map_objects);
            debug_assert!(live_olds == self.live_old_objects);
            debug_assert!(live_codes == self.live_code_objects);
            debug_assert!(live_news == self.live_young_objects);
            let _ = (live_maps, live_olds, live_codes, live_news);

            // Large code objects did not move, but their call targets
            // are still in object form.
            let lo_objects: Vec<HeapObject> =
                (*self.heap).lo_space.objects().collect();
            for obj in lo_objects {
                if (*obj.map()).instance_type() == InstanceType::Code {
                    (*(obj.address() as *mut Code))
                        .convert_ic_targets_to_addresses();
                }
            }

            let heap = &mut *self.heap;
            heap.new_space.flip();
            // Everything that survived this collection has aged.
            let mark = heap.new_space.bottom();
            heap.new_space.set_age_mark(mark);

            heap.new_space.mc_commit_relocation_info();
            heap.map_space.mc_commit_relocation_info();
            heap.old_space.mc_commit_relocation_info();
            heap.code_space.mc_commit_relocation_info();
        }

        if self.flags().verify_global_gc {
            // SAFETY: relocation is complete
            unsafe { self.verify_heap_after_relocation() };
        }
    }

    unsafe fn relocate_map_object(
        mc: &mut MarkCompactCollector,
        obj: HeapObject,
    ) -> usize {
        // SAFETY: map words hold forwarding encodings until restored
        unsafe {
            let encoding = obj.map_word();
            let meta_map_addr = mc.decode_map_address(encoding);
            debug_assert!((*mc.heap).map_space.contains(meta_map_addr));

            // Destination must be read before the map word is restored.
            let new_addr = mc.get_forwarding_address_in_old_space(obj);
            obj.set_map(meta_map_addr);

            let old_addr = obj.address();
            if new_addr != old_addr {
                core::ptr::copy(
                    old_addr as *const u8,
                    new_addr as *mut u8,
                    Map::SIZE,
                );
            }

            if mc.flags().gc_verbose {
                tracing::trace!(from = old_addr, to = new_addr, "relocate");
            }
            Map::SIZE
        }
    }

    unsafe fn relocate_old_object(
        mc: &mut MarkCompactCollector,
        obj: HeapObject,
    ) -> usize {
        // SAFETY: maps are already relocated; forwarding data is intact
        unsafe {
            let encoding = obj.map_word();
            let map_addr = mc.decode_map_address(encoding);
            debug_assert!((*mc.heap).map_space.contains(map_addr));

            let new_addr = mc.get_forwarding_address_in_old_space(obj);
            obj.set_map(map_addr);

            // Maps moved first, so the restored map gives a valid size.
            let object_size = obj.size();
            let old_addr = obj.address();

            let heap = &mut *mc.heap;
            debug_assert!(
                heap.old_space.mc_space_offset_for_address(new_addr)
                    <= heap.old_space.mc_space_offset_for_address(old_addr)
            );
            heap.old_space.mc_adjust_relocation_end(new_addr, object_size);

            if new_addr != old_addr {
                core::ptr::copy(
                    old_addr as *const u8,
                    new_addr as *mut u8,
                    object_size,
                );
            }

            let copied = HeapObject::from_address(new_addr);
            if (*copied.map()).instance_type() == InstanceType::Code {
                // Embedded call targets are position-relative.
                (*(new_addr as *mut Code))
                    .relocate(new_addr as isize - old_addr as isize);
                tracing::debug!(from = old_addr, to = new_addr, "code move");
            }

            if mc.flags().gc_verbose {
                tracing::trace!(from = old_addr, to = new_addr, "relocate");
            }
            object_size
        }
    }

    unsafe fn relocate_code_object(
        mc: &mut MarkCompactCollector,
        obj: HeapObject,
    ) -> usize {
        // SAFETY: maps are already relocated; forwarding data is intact
        unsafe {
            let encoding = obj.map_word();
            let map_addr = mc.decode_map_address(encoding);
            debug_assert!((*mc.heap).map_space.contains(map_addr));

            let new_addr = mc.get_forwarding_address_in_old_space(obj);
            obj.set_map(map_addr);

            let object_size = obj.size();
            let old_addr = obj.address();

            let heap = &mut *mc.heap;
            debug_assert!(
                heap.code_space.mc_space_offset_for_address(new_addr)
                    <= heap.code_space.mc_space_offset_for_address(old_addr)
            );
            heap.code_space.mc_adjust_relocation_end(new_addr, object_size);

            if (*obj.map()).instance_type() == InstanceType::Code {
                // Call sites resolve relative to the object they are
                // encoded in, so convert them back against the old
                // address before the move.
                (*(old_addr as *mut Code)).convert_ic_targets_to_addresses();
            }

            if new_addr != old_addr {
                core::ptr::copy(
                    old_addr as *const u8,
                    new_addr as *mut u8,
                    object_size,
                );
            }

            let copied = HeapObject::from_address(new_addr);
            if (*copied.map()).instance_type() == InstanceType::Code {
                (*(new_addr as *mut Code))
                    .relocate(new_addr as isize - old_addr as isize);
                tracing::debug!(from = old_addr, to = new_addr, "code move");
            }

            if mc.flags().gc_verbose {
                tracing::trace!(from = old_addr, to = new_addr, "relocate");
            }
            object_size
        }
    }

    unsafe fn relocate_new_object(
        mc: &mut MarkCompactCollector,
        obj: HeapObject,
    ) -> usize {
        // SAFETY: the map word already names the relocated map
        unsafe {
            let object_size = obj.size();
            let old_addr = obj.address();

            let heap = &mut *mc.heap;
            let offset = heap.new_space.to_space_offset_for_address(old_addr);
            let new_addr =
                *((heap.new_space.from_space_low() + offset) as *const usize);

            if heap.new_space.from_space_contains(new_addr) {
                // Failed promotion: stays young. Correct after the flip.
                debug_assert!(
                    heap.new_space.from_space_offset_for_address(new_addr)
                        <= heap.new_space.to_space_offset_for_address(old_addr)
                );
            } else {
                match heap.target_space(obj) {
                    AllocationSpace::Old => heap
                        .old_space
                        .mc_adjust_relocation_end(new_addr, object_size),
                    AllocationSpace::Code => heap
                        .code_space
                        .mc_adjust_relocation_end(new_addr, object_size),
                    _ => unreachable!("promotion targets old or code"),
                }
            }

            // Semispaces do not overlap and promotion leaves new space,
            // so a plain copy is enough.
            core::ptr::copy_nonoverlapping(
                old_addr as *const u8,
                new_addr as *mut u8,
                object_size,
            );

            if mc.flags().gc_verbose {
                tracing::trace!(from = old_addr, to = new_addr, "relocate");
            }
            object_size
        }
    }

    // ── Phase 5: rebuild remembered sets ───────────────────────────

    unsafe fn rebuild_rsets(&mut self) {
        self.transition(
            CollectorState::RelocateObjects,
            CollectorState::RebuildRSets,
        );
        // SAFETY: the heap is fully relocated and walkable
        unsafe { (*self.heap).rebuild_rsets() };
    }

    // ── Non-compacting sweep ───────────────────────────────────────

    unsafe fn sweep_spaces(&mut self) {
        debug_assert!(self.state == CollectorState::SweepSpaces);
        debug_assert!(!self.compacting);

        // Clear mark bits and reclaim dead regions. Map space goes last:
        // freeing a map destroys it, and the other spaces size their
        // dead objects through possibly dead maps.
        // SAFETY: exclusive heap access
        unsafe {
            self.sweep_paged_space(PagedSpaceId::Old, Self::deallocate_old_block);
            self.sweep_paged_space(
                PagedSpaceId::Code,
                Self::deallocate_code_block,
            );
            self.sweep_new_space();
            self.sweep_paged_space(PagedSpaceId::Map, Self::deallocate_map_block);
        }
    }

    unsafe fn deallocate_old_block(
        mc: &mut MarkCompactCollector,
        start: usize,
        size: usize,
    ) {
        // SAFETY: the region is dead
        unsafe {
            let heap = &mut *mc.heap;
            heap.clear_rset_range(start, size);
            heap.write_filler(start, size);
            heap.old_space.free_region(start, size);
        }
    }

    unsafe fn deallocate_code_block(
        mc: &mut MarkCompactCollector,
        start: usize,
        size: usize,
    ) {
        // SAFETY: the region is dead
        unsafe {
            let heap = &mut *mc.heap;
            heap.write_filler(start, size);
            heap.code_space.free_region(start, size);
        }
    }

    unsafe fn deallocate_map_block(
        mc: &mut MarkCompactCollector,
        start: usize,
        size: usize,
    ) {
        // Map-space consumers assume a reclaimed unit is exactly one
        // map, so the block is split into map-sized chunks.
        debug_assert!(size % Map::SIZE == 0);
        // SAFETY: the region is dead
        unsafe {
            let heap = &mut *mc.heap;
            heap.clear_rset_range(start, size);
            let mut chunk = start;
            while chunk < start + size {
                heap.write_filler(chunk, Map::SIZE);
                heap.map_space.free_chunk(chunk);
                chunk += Map::SIZE;
            }
        }
    }

    unsafe fn sweep_paged_space(
        &mut self,
        id: PagedSpaceId,
        dealloc: unsafe fn(&mut MarkCompactCollector, usize, usize),
    ) {
        // SAFETY: page bounds are stable; dead regions are rewritten
        // behind the walk cursor only
        unsafe {
            let space = self.paged_space(id);
            for index in 0..(*space).pages_in_use() {
                let page = &*(*space).page(index);
                let top = page.allocation_top();

                let mut is_prev_alive = true;
                let mut free_start = 0usize;
                let mut current = page.object_area_start();

                while current < top {
                    let obj = HeapObject::from_address(current);
                    let object_size;
                    if obj.is_marked() {
                        obj.clear_mark();
                        (*self.tracer).decrement_marked_count();
                        object_size = obj.size();
                        if self.compacting
                            && (*obj.map()).instance_type()
                                == InstanceType::Code
                        {
                            // Unreachable on this path, but symmetric
                            // with the compacting sweep of code pages.
                            (*(current as *mut Code))
                                .convert_ic_targets_to_addresses();
                        }
                        if !is_prev_alive {
                            dealloc(self, free_start, current - free_start);
                            is_prev_alive = true;
                        }
                    } else {
                        object_size = obj.size();
                        if (*obj.map()).instance_type() == InstanceType::Code {
                            tracing::debug!(
                                address = obj.address(),
                                "code delete"
                            );
                        }
                        if is_prev_alive {
                            free_start = current;
                            is_prev_alive = false;
                        }
                    }
                    current += object_size;
                }

                if !is_prev_alive {
                    let free_size = top - free_start;
                    if free_size > 0 {
                        dealloc(self, free_start, free_size);
                    }
                }
            }
        }
    }

    unsafe fn sweep_new_space(&mut self) {
        // SAFETY: new-space bounds are stable; dead objects get filler
        // maps that preserve their size
        unsafe {
            let heap = &mut *self.heap;
            let bottom = heap.new_space.bottom();
            let top = heap.new_space.top();

            let mut current = bottom;
            while current < top {
                let obj = HeapObject::from_address(current);
                let object_size = if obj.is_marked() {
                    obj.clear_mark();
                    (*self.tracer).decrement_marked_count();
                    obj.size()
                } else {
                    // Replace dead objects with fillers so linear walks
                    // can still compute sizes; the old map may die with
                    // this collection.
                    let object_size = obj.size();
                    heap.write_filler(current, object_size);
                    object_size
                };
                current += object_size;
            }
        }
    }

    // ── Verification ───────────────────────────────────────────────

    unsafe fn verify_heap_after_marking(&self) {
        // SAFETY: marking is complete, spaces are walkable with the
        // marked-size callback
        unsafe {
            let heap = &*self.heap;

            let count = |objects: &mut dyn Iterator<Item = HeapObject>| {
                let mut marked = 0usize;
                for obj in objects {
                    // SAFETY: iterated objects are valid
                    if unsafe { obj.is_marked() } {
                        marked += 1;
                    }
                }
                marked
            };

            assert_eq!(
                count(&mut SemiSpaceIterator::new(
                    &heap.new_space,
                    Some(marked_object_size),
                )),
                self.live_young_objects,
                "young live recount mismatch"
            );
            assert_eq!(
                count(&mut crate::spaces::HeapObjectIterator::new(
                    &heap.old_space,
                    Some(marked_object_size),
                )),
                self.live_old_objects,
                "old live recount mismatch"
            );
            assert_eq!(
                count(&mut crate::spaces::HeapObjectIterator::new(
                    &heap.code_space,
                    Some(marked_object_size),
                )),
                self.live_code_objects,
                "code live recount mismatch"
            );
            assert_eq!(
                count(&mut crate::spaces::HeapObjectIterator::new(
                    &heap.map_space,
                    Some(marked_object_size),
                )),
                self.live_map_objects,
                "map live recount mismatch"
            );
            assert_eq!(
                count(&mut heap.lo_space.objects()),
                self.live_lo_objects,
                "large-object live recount mismatch"
            );
        }
    }

    unsafe fn verify_heap_after_encoding(&mut self) {
        // Live maps must still be countable through the free-region
        // markers, and every page header must be coherent.
        // SAFETY: free regions are encoded
        unsafe {
            let live_maps = self.iterate_live_objects_in_paged_space(
                PagedSpaceId::Map,
                verify_map_object,
            );
            assert_eq!(
                live_maps, self.live_map_objects,
                "map count diverged during encoding"
            );
            self.verify_page_headers_all();
        }
    }

    unsafe fn verify_page_headers_all(&self) {
        // SAFETY: spaces are mapped
        unsafe {
            let heap = &*self.heap;
            for space in
                [&heap.old_space, &heap.code_space, &heap.map_space]
            {
                self.verify_page_headers(space);
            }
        }
    }

    unsafe fn verify_page_headers(&self, space: &PagedSpace) {
        // SAFETY: pages are mapped
        unsafe {
            let mc_pages =
                PageIterator::new(space, PageIteratorMode::PagesUsedByMc);
            for page in mc_pages {
                let top = (*page).mc_relocation_top as usize;
                assert!(
                    (OBJECT_AREA_START..=PAGE_SIZE).contains(&top),
                    "relocation top outside the object area"
                );
            }

            let pages = PageIterator::new(space, PageIteratorMode::PagesInUse);
            for (index, page) in pages.enumerate() {
                assert_eq!((*page).mc_page_index as usize, index);
                // A page with no live objects keeps the sentinel.
                assert!(
                    (*page).mc_first_forwarded == FIRST_FORWARDED_SENTINEL
                        || space.contains((*page).mc_first_forwarded),
                    "first forwarded address outside the space"
                );
            }
        }
    }

    unsafe fn verify_heap_after_relocation(&self) {
        // SAFETY: relocation and commits are complete
        unsafe {
            let heap = &*self.heap;
            for space in
                [&heap.old_space, &heap.code_space, &heap.map_space]
            {
                for index in 0..space.pages_in_use() {
                    let page = &*space.page(index);
                    let top = page.allocation_top();
                    assert!(
                        top >= page.object_area_start()
                            && top <= page.object_area_end()
                    );
                }
            }
            // No live pointer may lead into the (now inactive) from
            // space.
            let to_low = heap.new_space.bottom();
            let to_top = heap.new_space.top();
            let mut current = to_low;
            while current < to_top {
                let obj = HeapObject::from_address(current);
                assert!(!obj.is_marked());
                current += obj.size();
            }
        }
    }
}

// ── Free regions ──────────────────────────────────────────────────────

/// Stamp a dead region with its skip encoding: the one-word marker for
/// single-word regions, otherwise the multi-word marker plus the byte
/// size in the second word.
unsafe fn encode_free_region(free_start: usize, free_size: usize) {
    debug_assert!(free_size >= WORD_SIZE);
    // SAFETY: the region is dead and writable
    unsafe {
        if free_size == WORD_SIZE {
            *(free_start as *mut u64) = SINGLE_FREE_ENCODING;
        } else {
            debug_assert!(free_size >= 2 * WORD_SIZE);
            *(free_start as *mut u64) = MULTI_FREE_ENCODING;
            *((free_start + WORD_SIZE) as *mut usize) = free_size;
        }

        #[cfg(debug_assertions)]
        {
            let mut offset = 2 * WORD_SIZE;
            while offset < free_size {
                *((free_start + offset) as *mut usize) = ZAP_VALUE;
                offset += WORD_SIZE;
            }
        }
    }
}

// ── Size callbacks ────────────────────────────────────────────────────

/// Size of an object whose map word may carry mark and overflow bits.
fn overflow_object_size(obj: HeapObject) -> usize {
    // SAFETY: callers only use this over walkable spaces
    unsafe {
        let map_word = obj.map_word().clear_mark().clear_overflow();
        obj.size_from_map(&*(map_word.to_map_address() as *const Map))
    }
}

/// Size of an object whose map word may carry the mark bit.
fn marked_object_size(obj: HeapObject) -> usize {
    // SAFETY: callers only use this over walkable spaces
    unsafe {
        let map_word = obj.map_word().clear_mark();
        obj.size_from_map(&*(map_word.to_map_address() as *const Map))
    }
}

/// Encoded map objects keep their body fields; check the type tag and
/// step by the fixed map size.
unsafe fn verify_map_object(
    _mc: &mut MarkCompactCollector,
    obj: HeapObject,
) -> usize {
    // SAFETY: map bodies survive the forwarding encoding
    let map = unsafe { &*(obj.address() as *const Map) };
    let _ = map.instance_type();
    Map::SIZE
}

/// Weak-handle predicate: the referent dies unless already marked.
fn must_be_marked(value: Value) -> bool {
    if !value.is_heap_object() {
        return false;
    }
    // SAFETY: handle values are valid heap references
    unsafe { !HeapObject::from_value(value).is_marked() }
}

// ── Marking visitor ───────────────────────────────────────────────────

/// Body-walking callback for the marking phase.
struct MarkingVisitor {
    mc: *mut MarkCompactCollector,
}

impl MarkingVisitor {
    /// Mark the object `slot` points at, short-circuiting through cons
    /// strings whose right half is the canonical empty string.
    unsafe fn mark_object_by_pointer(&mut self, slot: *mut Value) {
        // SAFETY: slot is a live Value location
        unsafe {
            let mc = &mut *self.mc;
            let value = *slot;
            if !value.is_heap_object() {
                return;
            }

            let mut obj = HeapObject::from_value(value);

            // The map may already be marked; mask that off before the
            // type check.
            let map_word = obj.map_word().clear_mark();
            let map = &*(map_word.to_map_address() as *const Map);
            if map.instance_type() == InstanceType::ConsString {
                let heap = &*mc.heap;
                let cons = &*(obj.address() as *const ConsString);
                if cons.second() == heap.roots.empty_string {
                    // Without the object start of the holder we cannot
                    // update the remembered set, so only rewrite slots
                    // that cannot introduce an old-to-new reference.
                    let first = cons.first();
                    if heap.in_new_space(obj.address())
                        || !heap.in_new_space_value(first)
                    {
                        *slot = first;
                        if !first.is_heap_object() {
                            return;
                        }
                        obj = HeapObject::from_value(first);
                    }
                }
            }

            mc.mark_object(obj);
        }
    }

    /// Depth-first marking of the unmarked objects in `[start, end)`.
    /// Bails out when the call stack is running low.
    unsafe fn visit_unmarked_objects(
        &mut self,
        start: *mut Value,
        end: *mut Value,
    ) -> bool {
        // SAFETY: slots and referents are valid per the visitor contract
        unsafe {
            let check = StackLimitCheck::new((*self.mc).stack_limit);
            if check.has_overflowed() {
                return false;
            }

            let mut p = start;
            while p < end {
                let value = *p;
                p = p.add(1);
                if !value.is_heap_object() {
                    continue;
                }
                let obj = HeapObject::from_value(value);
                if obj.is_marked() {
                    continue;
                }
                self.visit_unmarked_object(obj);
            }
            true
        }
    }

    unsafe fn visit_unmarked_object(&mut self, obj: HeapObject) {
        // SAFETY: obj is a valid, unmarked object
        unsafe {
            let mc = &mut *self.mc;
            debug_assert!((*mc.heap).contains(obj.address()));
            mc.update_live_object_count(obj);

            let map = &*obj.map();
            obj.set_mark();
            (*mc.tracer).increment_marked_count();

            // Mark the map and recurse into the body directly.
            mc.mark_object(HeapObject::from_address(map as *const Map as usize));
            obj.iterate_body(
                map.instance_type(),
                obj.size_from_map(map),
                self,
            );
        }
    }
}

impl ObjectVisitor for MarkingVisitor {
    unsafe fn visit_pointer(&mut self, slot: *mut Value) {
        // SAFETY: per the visitor contract
        unsafe { self.mark_object_by_pointer(slot) };
    }

    unsafe fn visit_pointers(&mut self, start: *mut Value, end: *mut Value) {
        // SAFETY: per the visitor contract
        unsafe {
            if end.offset_from(start) as usize
                >= MIN_RANGE_FOR_MARKING_RECURSION
                && self.visit_unmarked_objects(start, end)
            {
                return;
            }
            // Close to the call-stack limit: mark through the stack.
            let mut p = start;
            while p < end {
                self.mark_object_by_pointer(p);
                p = p.add(1);
            }
        }
    }

    unsafe fn visit_code_target(
        &mut self,
        code: HeapObject,
        entry: *mut RelocEntry,
    ) {
        // SAFETY: entry is an address-form call site of `code`
        unsafe {
            let mc = &mut *self.mc;
            let holder = &*(code.address() as *const Code);

            let target = code_from_derived_pointer(
                holder.target_address(&*entry),
            );
            let target_code = &*(target.address() as *const Code);
            if mc.flags().cleanup_ics_at_gc
                && target_code.is_inline_cache_stub()
            {
                mc.ic_clear(holder, &mut *entry);
                // Cleared targets need no marking: the megamorphic
                // stub is a root.
            } else {
                mc.mark_object(target);
            }

            if mc.compacting {
                // Turn the derived pointer into an object pointer so
                // the update phase can move it like any other slot.
                let target = code_from_derived_pointer(
                    holder.target_address(&*entry),
                );
                Code::set_target_object(&mut *entry, target.to_value());
            }
        }
    }

    unsafe fn visit_debug_target(
        &mut self,
        code: HeapObject,
        entry: *mut RelocEntry,
    ) {
        // SAFETY: entry is an address-form call site of `code`
        unsafe {
            let mc = &mut *self.mc;
            let holder = &*(code.address() as *const Code);
            let target =
                code_from_derived_pointer(holder.target_address(&*entry));
            mc.mark_object(target);
            if mc.compacting {
                Code::set_target_object(&mut *entry, target.to_value());
            }
        }
    }

    fn begin_code_iteration(&mut self, code: HeapObject) {
        // While marking, call-site targets are derived addresses.
        // SAFETY: code is a valid code object
        unsafe {
            debug_assert!(
                !(*(code.address() as *const Code)).ic_target_is_object()
            );
            let _ = code;
        }
    }

    fn end_code_iteration(&mut self, code: HeapObject) {
        // SAFETY: code is a valid code object
        unsafe {
            let mc = &*self.mc;
            if mc.compacting {
                (*(code.address() as *mut Code)).set_ic_target_is_object(true);
            }
        }
    }
}

// ── Symbol-table cleaner ──────────────────────────────────────────────

/// Overwrites dead symbol slots with the canonical null value.
struct SymbolTableCleaner {
    null_value: Value,
    pointers_removed: usize,
}

impl ObjectVisitor for SymbolTableCleaner {
    unsafe fn visit_pointer(&mut self, slot: *mut Value) {
        // SAFETY: slot is a table element
        unsafe {
            let value = *slot;
            if value.is_heap_object()
                && !HeapObject::from_value(value).is_marked()
            {
                *slot = self.null_value;
                self.pointers_removed += 1;
            }
        }
    }
}

// ── Updating visitor ──────────────────────────────────────────────────

/// Body-walking callback for the pointer-update phase. Call-site
/// targets were converted to object form during marking, so every field
/// that can move arrives through `visit_pointer`.
struct UpdatingVisitor {
    mc: *mut MarkCompactCollector,
}

impl ObjectVisitor for UpdatingVisitor {
    unsafe fn visit_pointer(&mut self, slot: *mut Value) {
        // SAFETY: per the visitor contract
        unsafe { (*self.mc).update_pointer(slot) };
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{AllocationSpace, Heap, HeapConfig, HeapError};
    use object::{CodeFlags, FixedArray, RelocMode, SeqString};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn compacting_flags() -> GcFlags {
        GcFlags {
            always_compact: true,
            verify_global_gc: true,
            ..GcFlags::default()
        }
    }

    fn test_heap(flags: GcFlags) -> Heap {
        Heap::with_flags(HeapConfig::default(), flags).expect("heap")
    }

    fn collect(heap: &mut Heap) -> GcTracer {
        let mut tracer = GcTracer::new();
        collect_garbage(heap, &mut tracer);
        tracer
    }

    fn alloc_array(heap: &mut Heap, len: usize, space: AllocationSpace) -> Value {
        heap.allocate_fixed_array(len, space).expect("array allocation")
    }

    unsafe fn array_set(array: Value, index: usize, value: Value) {
        // SAFETY: array is a live fixed array and index is in bounds
        unsafe { (*(array.address() as *mut FixedArray)).set(index, value) };
    }

    unsafe fn array_get(array: Value, index: usize) -> Value {
        // SAFETY: array is a live fixed array and index is in bounds
        unsafe { (*(array.address() as *const FixedArray)).get(index) }
    }

    unsafe fn instance_type_of(value: Value) -> InstanceType {
        // SAFETY: value refers to a live object
        unsafe { (*HeapObject::from_value(value).map()).instance_type() }
    }

    unsafe fn string_bytes(value: Value) -> Vec<u8> {
        // SAFETY: value refers to a live flat string
        unsafe {
            (*(value.address() as *const SeqString)).bytes().to_vec()
        }
    }

    // ── Configuration ──────────────────────────────────────────────

    #[test]
    fn config_validation_rejects_bad_geometry() {
        let config =
            HeapConfig { semispace_size: 12_345, ..HeapConfig::default() };
        assert!(matches!(
            Heap::new(config),
            Err(HeapError::InvalidConfig(_))
        ));

        let config = HeapConfig {
            marking_stack_capacity: Some(0),
            ..HeapConfig::default()
        };
        assert!(matches!(
            Heap::new(config),
            Err(HeapError::InvalidConfig(_))
        ));
    }

    // ── Marking stack ──────────────────────────────────────────────

    #[test]
    fn marking_stack_overflow_latches_only_past_capacity() {
        let mut backing = [0usize; 2];
        let low = backing.as_mut_ptr() as usize;
        let mut stack = MarkingStack::default();
        stack.initialize(low, low + 2 * WORD_SIZE);
        assert_eq!(stack.capacity(), 2);

        unsafe {
            stack.push(HeapObject::from_address(0x1000));
            stack.push(HeapObject::from_address(0x2000));
            // Filled exactly to capacity: overflow must not latch yet.
            assert!(!stack.overflowed());

            stack.push(HeapObject::from_address(0x3000));
            assert!(stack.overflowed());

            // The overflowed push was dropped.
            assert_eq!(stack.pop().address(), 0x2000);
            assert_eq!(stack.pop().address(), 0x1000);
            assert!(stack.is_empty());
        }

        stack.clear_overflowed();
        assert!(!stack.overflowed());
    }

    // ── Free regions ───────────────────────────────────────────────

    #[test]
    fn free_region_encoding_round_trips() {
        let mut buffer = [0u64; 16];
        let base = buffer.as_mut_ptr() as usize;

        unsafe {
            encode_free_region(base, WORD_SIZE);
            assert_eq!(*(base as *const u64), SINGLE_FREE_ENCODING);

            let multi = base + 2 * WORD_SIZE;
            encode_free_region(multi, 6 * WORD_SIZE);
            assert_eq!(*(multi as *const u64), MULTI_FREE_ENCODING);
            assert_eq!(
                *((multi + WORD_SIZE) as *const usize),
                6 * WORD_SIZE
            );
        }
    }

    // ── Scenario: singleton ────────────────────────────────────────

    #[test]
    fn singleton_survives_compaction() {
        let mut heap = test_heap(compacting_flags());

        let garbage = alloc_array(&mut heap, 73, AllocationSpace::Old);
        let live = alloc_array(&mut heap, 2, AllocationSpace::Old);
        unsafe {
            array_set(live, 0, Value::from_i64(7));
            array_set(live, 1, Value::from_i64(8));
        }
        let old_addr = live.address();
        let _ = garbage;
        heap.handles.push(live);

        collect(&mut heap);

        let live = heap.handles[0];
        unsafe {
            assert_eq!(instance_type_of(live), InstanceType::FixedArray);
            assert_eq!(array_get(live, 0), Value::from_i64(7));
            assert_eq!(array_get(live, 1), Value::from_i64(8));
        }
        // The dead array in front of it was squeezed out.
        assert!(live.address() < old_addr);
        assert_eq!(heap.old_space.waste(), 0);
        assert_eq!(heap.old_space.available_free(), 0);
    }

    // ── Scenario: everything dead ──────────────────────────────────

    #[test]
    fn all_dead_resets_allocation_top() {
        let mut heap = test_heap(compacting_flags());
        let baseline = heap.old_space.size();

        for _ in 0..10 {
            alloc_array(&mut heap, 10, AllocationSpace::Old);
        }
        assert!(heap.old_space.size() > baseline);

        collect(&mut heap);
        assert_eq!(heap.old_space.size(), baseline);

        // Allocation resumes right after the survivors.
        let fresh = alloc_array(&mut heap, 2, AllocationSpace::Old);
        unsafe {
            array_set(fresh, 0, Value::from_i64(1));
            assert_eq!(array_get(fresh, 0), Value::from_i64(1));
        }
    }

    // ── Scenario: cons-string elision ──────────────────────────────

    #[test]
    fn cons_string_with_empty_second_collapses() {
        let mut heap = test_heap(compacting_flags());

        let flat = heap
            .allocate_seq_string(b"payload", AllocationSpace::Old)
            .unwrap();
        let empty = heap.roots.empty_string;
        let cons = heap
            .allocate_cons_string(flat, empty, AllocationSpace::Old)
            .unwrap();
        heap.handles.push(cons);

        collect(&mut heap);

        let root = heap.handles[0];
        unsafe {
            assert_eq!(instance_type_of(root), InstanceType::SeqString);
            assert_eq!(string_bytes(root), b"payload");
        }
    }

    // ── Scenario: marking-stack overflow ───────────────────────────

    #[test]
    fn overflow_rescan_marks_long_chain() {
        let config = HeapConfig {
            marking_stack_capacity: Some(2),
            ..HeapConfig::default()
        };
        let mut heap =
            Heap::with_flags(config, compacting_flags()).expect("heap");

        const CHAIN: usize = 1000;
        let mut head = heap.roots.null_value;
        let mut prev = heap.roots.null_value;
        for id in 0..CHAIN {
            let node = alloc_array(&mut heap, 2, AllocationSpace::Old);
            unsafe {
                array_set(node, 0, Value::from_i64(id as i64));
                if id == 0 {
                    head = node;
                } else {
                    array_set(prev, 1, node);
                }
            }
            prev = node;
        }
        heap.handles.push(head);

        collect(&mut heap);

        let mut cursor = heap.handles[0];
        for id in 0..CHAIN {
            unsafe {
                assert_eq!(instance_type_of(cursor), InstanceType::FixedArray);
                assert_eq!(array_get(cursor, 0), Value::from_i64(id as i64));
                let next = array_get(cursor, 1);
                if id + 1 < CHAIN {
                    cursor = next;
                } else {
                    assert_eq!(next, heap.roots.null_value);
                }
            }
        }
    }

    // ── Scenario: promotion ────────────────────────────────────────

    #[test]
    fn young_objects_promote_by_type() {
        let mut heap = test_heap(compacting_flags());

        let string = heap
            .allocate_seq_string(b"young string", AllocationSpace::New)
            .unwrap();
        let array = alloc_array(&mut heap, 3, AllocationSpace::New);
        unsafe { array_set(array, 0, Value::from_i64(11)) };
        heap.handles.push(string);
        heap.handles.push(array);

        collect(&mut heap);

        let string = heap.handles[0];
        let array = heap.handles[1];
        assert!(heap.code_space.contains(string.address()));
        assert!(heap.old_space.contains(array.address()));
        unsafe {
            assert_eq!(string_bytes(string), b"young string");
            assert_eq!(array_get(array, 0), Value::from_i64(11));
        }

        // Nothing stayed young, and the age mark covers the survivors.
        assert_eq!(heap.new_space.top(), heap.new_space.bottom());
        assert_eq!(heap.new_space.age_mark(), heap.new_space.bottom());
    }

    // ── Scenario: cross-page forwarding ────────────────────────────

    #[test]
    fn forwarding_wraps_into_next_page() {
        let mut heap = test_heap(compacting_flags());

        // Page 0: 600 bytes of bootstrap objects, then 4000 bytes of
        // garbage, then a 3000-byte survivor. Page 1: two 3000-byte
        // survivors around 1500 bytes of garbage and a 496-byte tail
        // survivor. Compaction pulls the first page-1 survivor into
        // page 0 and must wrap the rest back into page 1.
        let garbage0 = heap
            .allocate_byte_array(3984, AllocationSpace::Old)
            .unwrap();
        let live0 = alloc_array(&mut heap, 373, AllocationSpace::Old);
        let live1 = alloc_array(&mut heap, 373, AllocationSpace::Old);
        let live2 = alloc_array(&mut heap, 373, AllocationSpace::Old);
        let garbage1 = heap
            .allocate_byte_array(1484, AllocationSpace::Old)
            .unwrap();
        let live3 = alloc_array(&mut heap, 60, AllocationSpace::Old);
        let _ = (garbage0, garbage1);

        assert_eq!(heap.old_space.page_index_of(live1.address()), 1);
        assert_eq!(heap.old_space.page_index_of(live3.address()), 1);

        for (id, live) in [live0, live1, live2, live3].iter().enumerate() {
            unsafe { array_set(*live, 0, Value::from_i64(id as i64)) };
            heap.handles.push(*live);
        }

        collect(&mut heap);

        let live2 = heap.handles[2];
        let live3 = heap.handles[3];
        // The wrapped destinations start at page 1's object area.
        assert_eq!(heap.old_space.page_index_of(live2.address()), 1);
        // SAFETY: page 1 is mapped
        let page1_area =
            unsafe { (*heap.old_space.page(1)).object_area_start() };
        assert_eq!(live2.address(), page1_area);
        assert_eq!(live3.address(), page1_area + 3000);

        for (id, root) in heap.handles.clone().iter().enumerate() {
            unsafe {
                assert_eq!(array_get(*root, 0), Value::from_i64(id as i64));
            }
        }
    }

    // ── Fragmentation heuristic ────────────────────────────────────

    #[test]
    fn fragmentation_triggers_compaction() {
        let mut heap = test_heap(GcFlags::default());

        let live = alloc_array(&mut heap, 2, AllocationSpace::Old);
        heap.handles.push(live);
        for _ in 0..5 {
            alloc_array(&mut heap, 48, AllocationSpace::Old);
        }

        // Nothing reclaimable yet, so the first collection sweeps.
        let tracer = collect(&mut heap);
        assert!(!tracer.is_compacting());
        assert!(heap.old_space.available_free() >= 5 * 400);

        // Now over half the old generation is recoverable.
        let tracer = collect(&mut heap);
        assert!(tracer.is_compacting());
        assert_eq!(heap.old_space.available_free(), 0);
    }

    #[test]
    fn never_compact_sweeps_in_place() {
        let flags = GcFlags { never_compact: true, ..GcFlags::default() };
        let mut heap = test_heap(flags);

        let live_old = alloc_array(&mut heap, 4, AllocationSpace::Old);
        alloc_array(&mut heap, 16, AllocationSpace::Old);
        let live_new = alloc_array(&mut heap, 4, AllocationSpace::New);
        alloc_array(&mut heap, 16, AllocationSpace::New);
        unsafe {
            array_set(live_old, 0, Value::from_i64(3));
            array_set(live_new, 0, Value::from_i64(4));
        }
        heap.handles.push(live_old);
        heap.handles.push(live_new);

        let old_addr = live_old.address();
        let new_addr = live_new.address();
        let new_top = heap.new_space.top();

        let tracer = collect(&mut heap);
        assert!(!tracer.is_compacting());

        // Nothing moved; the dead regions went to the free list or
        // became fillers.
        assert_eq!(heap.handles[0].address(), old_addr);
        assert_eq!(heap.handles[1].address(), new_addr);
        assert!(heap.old_space.available_free() > 0);
        assert_eq!(heap.new_space.top(), new_top);

        // The young half stays linearly walkable over the fillers.
        let mut walked = heap.new_space.bottom();
        for obj in SemiSpaceIterator::new(&heap.new_space, None) {
            // SAFETY: swept new space is walkable
            walked = obj.address() + unsafe { obj.size() };
        }
        assert_eq!(walked, new_top);
    }

    // ── Weak handles ───────────────────────────────────────────────

    static WEAK_DEATHS: AtomicUsize = AtomicUsize::new(0);

    fn count_death(_dying: Value) {
        WEAK_DEATHS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn weak_handle_death_runs_callback() {
        let mut heap = test_heap(compacting_flags());

        let doomed = alloc_array(&mut heap, 2, AllocationSpace::Old);
        let handle = heap.global_handles.create(doomed);
        heap.global_handles.make_weak(handle, Some(count_death));

        let before = WEAK_DEATHS.load(Ordering::Relaxed);
        collect(&mut heap);

        assert_eq!(WEAK_DEATHS.load(Ordering::Relaxed), before + 1);
        assert_eq!(heap.global_handles.get(handle), None);
    }

    #[test]
    fn weak_handle_survivor_tracks_the_move() {
        let mut heap = test_heap(compacting_flags());

        alloc_array(&mut heap, 32, AllocationSpace::Old);
        let survivor = alloc_array(&mut heap, 2, AllocationSpace::Old);
        heap.handles.push(survivor);
        let handle = heap.global_handles.create(survivor);
        heap.global_handles.make_weak(handle, Some(count_death));

        collect(&mut heap);

        let updated = heap.global_handles.get(handle).expect("survived");
        assert_eq!(updated, heap.handles[0]);
    }

    // ── Object groups ──────────────────────────────────────────────

    #[test]
    fn object_group_revives_unmarked_members() {
        let mut heap = test_heap(compacting_flags());

        let anchor = alloc_array(&mut heap, 2, AllocationSpace::Old);
        let dependent = alloc_array(&mut heap, 2, AllocationSpace::Old);
        unsafe { array_set(dependent, 0, Value::from_i64(21)) };
        heap.handles.push(anchor);

        let anchor_handle = heap.global_handles.create(anchor);
        let dependent_handle = heap.global_handles.create(dependent);
        heap.global_handles.make_weak(anchor_handle, None);
        heap.global_handles.make_weak(dependent_handle, None);
        heap.global_handles
            .add_object_group(vec![anchor_handle, dependent_handle]);

        collect(&mut heap);

        // The anchor is rooted, so the whole group stayed alive.
        let dependent = heap.global_handles.get(dependent_handle).unwrap();
        unsafe {
            assert_eq!(array_get(dependent, 0), Value::from_i64(21));
        }
        // Group records do not survive the collection.
        assert!(heap.global_handles.object_groups().is_empty());
    }

    #[test]
    fn object_group_with_no_marked_member_dies() {
        let mut heap = test_heap(compacting_flags());

        let a = alloc_array(&mut heap, 2, AllocationSpace::Old);
        let b = alloc_array(&mut heap, 2, AllocationSpace::Old);
        let ha = heap.global_handles.create(a);
        let hb = heap.global_handles.create(b);
        heap.global_handles.make_weak(ha, None);
        heap.global_handles.make_weak(hb, None);
        heap.global_handles.add_object_group(vec![ha, hb]);

        collect(&mut heap);

        assert_eq!(heap.global_handles.get(ha), None);
        assert_eq!(heap.global_handles.get(hb), None);
    }

    // ── Symbol table ───────────────────────────────────────────────

    #[test]
    fn symbol_table_prunes_dead_symbols() {
        let mut heap = test_heap(compacting_flags());

        let kept = heap
            .allocate_seq_string(b"alpha", AllocationSpace::Old)
            .unwrap();
        let dropped = heap
            .allocate_seq_string(b"beta", AllocationSpace::Old)
            .unwrap();
        assert!(heap.add_symbol(kept));
        assert!(heap.add_symbol(dropped));
        heap.handles.push(kept);

        collect(&mut heap);

        // SAFETY: the symbol table is live
        unsafe {
            let table = &*SymbolTable::assume_marked(HeapObject::from_value(
                heap.symbol_table,
            ));
            assert_eq!(table.element_count(), 1);

            let null = heap.roots.null_value;
            let mut survivors = Vec::new();
            for index in 0..table.capacity() {
                let value = *table.slot(index);
                if value != null {
                    survivors.push(value);
                }
            }
            assert_eq!(survivors, vec![heap.handles[0]]);
        }
    }

    // ── Inline caches ──────────────────────────────────────────────

    unsafe fn patch_code_target(code: Value, index: usize, target: Value) {
        // SAFETY: code is a live code object with enough reloc entries
        unsafe {
            let code = code.address() as *mut Code;
            let target_entry = (*(target.address() as *const Code)).entry();
            let entry = &mut (*code).reloc_entries()[index];
            entry.mode = RelocMode::CodeTarget as u32;
            entry.pc_offset = 0;
            (*code).set_target_address(entry, target_entry);
        }
    }

    unsafe fn read_code_target(code: Value, index: usize) -> usize {
        // SAFETY: code is a live code object with enough reloc entries
        unsafe {
            let code = code.address() as *mut Code;
            let entry = &(*code).reloc_entries()[index];
            (*code).target_address(entry)
        }
    }

    #[test]
    fn ic_sites_are_cleared_to_the_megamorphic_stub() {
        let mut heap = test_heap(compacting_flags());

        let stub = heap
            .allocate_code(8, 0, CodeFlags::INLINE_CACHE_STUB)
            .unwrap();
        let holder = heap.allocate_code(16, 1, CodeFlags::empty()).unwrap();
        unsafe { patch_code_target(holder, 0, stub) };
        heap.handles.push(holder);

        collect(&mut heap);

        let holder = heap.handles[0];
        // SAFETY: holder and the megamorphic stub are live code
        unsafe {
            let mega = heap.roots.megamorphic_code;
            let mega_entry = (*(mega.address() as *const Code)).entry();
            assert_eq!(read_code_target(holder, 0), mega_entry);
            assert!(!(*(holder.address() as *const Code)).ic_target_is_object());
        }
    }

    #[test]
    fn code_targets_follow_the_target_across_compaction() {
        let flags = GcFlags {
            always_compact: true,
            cleanup_ics_at_gc: false,
            verify_global_gc: true,
            ..GcFlags::default()
        };
        let mut heap = test_heap(flags);

        // Garbage in front so both code objects move.
        heap.allocate_code(512, 0, CodeFlags::empty()).unwrap();
        let callee = heap
            .allocate_code(8, 0, CodeFlags::INLINE_CACHE_STUB)
            .unwrap();
        let holder = heap.allocate_code(16, 1, CodeFlags::empty()).unwrap();
        unsafe { patch_code_target(holder, 0, callee) };
        heap.handles.push(holder);
        heap.handles.push(callee);

        collect(&mut heap);

        let holder = heap.handles[0];
        let callee = heap.handles[1];
        // SAFETY: both stayed live
        unsafe {
            let callee_entry = (*(callee.address() as *const Code)).entry();
            assert_eq!(read_code_target(holder, 0), callee_entry);
        }
    }

    // ── Large objects ──────────────────────────────────────────────

    #[test]
    fn large_objects_are_swept_in_place() {
        let mut heap = test_heap(compacting_flags());

        let kept = heap
            .allocate_byte_array(10_000, AllocationSpace::Old)
            .unwrap();
        let dropped = heap
            .allocate_byte_array(10_000, AllocationSpace::Old)
            .unwrap();
        assert!(heap.lo_space.contains(kept.address()));
        assert!(heap.lo_space.contains(dropped.address()));
        heap.handles.push(kept);

        let kept_addr = kept.address();
        collect(&mut heap);

        // Survivors never move; the dead chunk was returned to the OS.
        assert_eq!(heap.handles[0].address(), kept_addr);
        assert_eq!(heap.lo_space.objects().count(), 1);
        unsafe {
            assert_eq!(
                instance_type_of(heap.handles[0]),
                InstanceType::ByteArray
            );
        }
    }

    // ── Remembered sets ────────────────────────────────────────────

    #[test]
    fn rset_is_rebuilt_for_survivors_of_failed_promotion() {
        let config =
            HeapConfig { old_space_pages: 1, ..HeapConfig::default() };
        let mut heap =
            Heap::with_flags(config, compacting_flags()).expect("heap");

        let holder = alloc_array(&mut heap, 1, AllocationSpace::Old);
        heap.handles.push(holder);

        // Brim-fill the single old page so promotion has nowhere to go.
        loop {
            match heap.allocate_fixed_array(48, AllocationSpace::Old) {
                Some(filler) => heap.handles.push(filler),
                None => break,
            }
        }
        loop {
            match heap.allocate_fixed_array(1, AllocationSpace::Old) {
                Some(filler) => heap.handles.push(filler),
                None => break,
            }
        }

        let young = alloc_array(&mut heap, 1, AllocationSpace::New);
        unsafe {
            array_set(young, 0, Value::from_i64(9));
            array_set(heap.handles[0], 0, young);
        }

        collect(&mut heap);

        let holder = heap.handles[0];
        // SAFETY: holder is a live array
        let young = unsafe { array_get(holder, 0) };
        assert!(heap.new_space.contains(young.address()));
        unsafe { assert_eq!(array_get(young, 0), Value::from_i64(9)) };

        // The old-to-new slot is back in the remembered set.
        let slot_addr = holder.address() + FixedArray::HEADER_SIZE;
        // SAFETY: the slot lies in a mapped old-space page
        unsafe {
            assert!((*Page::from_address(slot_addr))
                .is_rset_bit_set(slot_addr));
        }
    }

    // ── Ambient state ──────────────────────────────────────────────

    #[test]
    fn stub_cache_is_dropped_by_the_collection() {
        let mut heap = test_heap(compacting_flags());
        let stub = heap.allocate_code(8, 0, CodeFlags::empty()).unwrap();
        heap.stub_cache.insert(5, stub);

        collect(&mut heap);

        assert_eq!(heap.stub_cache.lookup(5), Value::from_i64(0));
    }

    #[test]
    fn repeated_collection_is_stable() {
        let mut heap = test_heap(compacting_flags());

        let outer = alloc_array(&mut heap, 80, AllocationSpace::Old);
        for index in 0..80 {
            let inner = alloc_array(&mut heap, 1, AllocationSpace::Old);
            unsafe {
                array_set(inner, 0, Value::from_i64(index as i64));
                array_set(outer, index, inner);
            }
        }
        heap.handles.push(outer);

        collect(&mut heap);
        let settled = heap.handles[0].address();

        collect(&mut heap);

        // An already compact heap does not move.
        assert_eq!(heap.handles[0].address(), settled);
        let outer = heap.handles[0];
        for index in 0..80 {
            unsafe {
                let inner = array_get(outer, index);
                assert_eq!(array_get(inner, 0), Value::from_i64(index as i64));
            }
        }
    }

    // ── Randomized stress ──────────────────────────────────────────

    #[test]
    fn random_graphs_survive_collection() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::HashSet;

        const NODES: usize = 200;
        let mut rng = StdRng::seed_from_u64(0x6d61726b);
        let mut heap = test_heap(compacting_flags());

        let mut nodes = Vec::with_capacity(NODES);
        for id in 0..NODES {
            let space = if rng.random_bool(0.5) {
                AllocationSpace::New
            } else {
                AllocationSpace::Old
            };
            let node = alloc_array(&mut heap, 3, space);
            unsafe { array_set(node, 0, Value::from_i64(id as i64)) };
            nodes.push(node);
        }

        // Random edges, including cycles and self-references.
        let mut model = vec![[None::<usize>; 2]; NODES];
        for id in 0..NODES {
            for slot in 0..2 {
                if rng.random_bool(0.7) {
                    let target = rng.random_range(0..NODES);
                    model[id][slot] = Some(target);
                    unsafe {
                        array_set(nodes[id], slot + 1, nodes[target]);
                    }
                }
            }
        }

        let roots: Vec<usize> = (0..NODES).step_by(10).collect();
        for &root in &roots {
            heap.handles.push(nodes[root]);
        }

        collect(&mut heap);
        collect(&mut heap);

        // Re-walk the graph and compare against the model.
        unsafe fn check(
            heap: &Heap,
            model: &[[Option<usize>; 2]],
            value: Value,
            expected: usize,
            seen: &mut HashSet<usize>,
        ) {
            // SAFETY: reachable nodes are live arrays
            unsafe {
                assert_eq!(
                    array_get(value, 0),
                    Value::from_i64(expected as i64)
                );
                if !seen.insert(expected) {
                    return;
                }
                for slot in 0..2 {
                    let link = array_get(value, slot + 1);
                    match model[expected][slot] {
                        Some(target) => {
                            check(heap, model, link, target, seen)
                        }
                        None => assert_eq!(link, heap.roots.null_value),
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        for (handle, &root) in heap.handles.clone().iter().zip(&roots) {
            unsafe { check(&heap, &model, *handle, root, &mut seen) };
        }
    }

    // ── Deep recursion marking ─────────────────────────────────────

    #[test]
    fn wide_arrays_mark_through_inline_recursion() {
        let mut heap = test_heap(compacting_flags());

        // 100 slots crosses the recursion threshold for visit_pointers.
        let wide = alloc_array(&mut heap, 100, AllocationSpace::Old);
        for index in 0..100 {
            let leaf = alloc_array(&mut heap, 1, AllocationSpace::Old);
            unsafe {
                array_set(leaf, 0, Value::from_i64(index as i64));
                array_set(wide, index, leaf);
            }
        }
        heap.handles.push(wide);

        collect(&mut heap);

        let wide = heap.handles[0];
        for index in 0..100 {
            unsafe {
                let leaf = array_get(wide, index);
                assert_eq!(array_get(leaf, 0), Value::from_i64(index as i64));
            }
        }
    }
}
