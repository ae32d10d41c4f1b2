//! The heap aggregate: five spaces, the canonical root set, allocation
//! entry points, and the remembered-set machinery.

use thiserror::Error;

use object::{
    init_map, ByteArray, Code, CodeFlags, ConsString, FixedArray, HeapNumber,
    HeapObject, InstanceType, Map, ObjectVisitor, Oddball, OddballKind,
    SeqString, SymbolTable, Value, VARIABLE_SIZE,
};

use crate::collector::GcFlags;
use crate::handles::GlobalHandles;
use crate::spaces::{
    HeapObjectIterator, LargeObjectSpace, NewSpace, Page, PagedSpace,
    MAX_PAGES_PER_SPACE, OBJECT_AREA_SIZE,
};
use crate::system::OS_PAGE_SIZE;

// ── Configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Bytes per semispace of the young generation.
    pub semispace_size: usize,
    pub old_space_pages: usize,
    pub code_space_pages: usize,
    pub map_space_pages: usize,
    /// Allocations above this many bytes go to the large-object space.
    pub large_object_threshold: usize,
    /// Cap the marking stack at this many entries instead of using the
    /// whole inactive semispace. For exercising the overflow protocol.
    pub marking_stack_capacity: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            semispace_size: 128 * 1024,
            old_space_pages: 16,
            code_space_pages: 8,
            map_space_pages: 4,
            large_object_threshold: 4 * 1024,
            marking_stack_capacity: None,
        }
    }
}

impl HeapConfig {
    pub fn validate(&self) -> Result<(), HeapError> {
        if self.semispace_size == 0
            || !self.semispace_size.is_multiple_of(OS_PAGE_SIZE)
        {
            return Err(HeapError::InvalidConfig(
                "semispace size must be a nonzero multiple of the OS page size",
            ));
        }
        for &pages in &[
            self.old_space_pages,
            self.code_space_pages,
            self.map_space_pages,
        ] {
            if pages == 0 || pages > MAX_PAGES_PER_SPACE {
                return Err(HeapError::InvalidConfig(
                    "paged spaces need between 1 and 1024 pages",
                ));
            }
        }
        if self.large_object_threshold > OBJECT_AREA_SIZE {
            return Err(HeapError::InvalidConfig(
                "large-object threshold exceeds the page object area",
            ));
        }
        if self.marking_stack_capacity == Some(0) {
            return Err(HeapError::InvalidConfig(
                "marking stack capacity must be nonzero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("address-space reservation failed")]
    ReservationFailed,
}

/// Which space an allocation lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationSpace {
    New,
    Old,
    Code,
    Map,
    Large,
}

// ── Roots ─────────────────────────────────────────────────────────────

/// The canonical objects every collection cycle keeps alive. All fields
/// are root slots: the collector marks through them and rewrites them
/// when their referents move. `repr(C)` so the fields form one
/// contiguous slot range.
#[repr(C)]
pub struct Roots {
    pub meta_map: Value,
    pub seq_string_map: Value,
    pub cons_string_map: Value,
    pub heap_number_map: Value,
    pub oddball_map: Value,
    pub fixed_array_map: Value,
    pub symbol_table_map: Value,
    pub byte_array_map: Value,
    pub code_map: Value,
    pub one_word_filler_map: Value,
    pub null_value: Value,
    pub true_value: Value,
    pub false_value: Value,
    pub empty_string: Value,
    /// The generic dispatch stub cleared call sites are retargeted to.
    /// Being a root, it outlives every inline cache built from it.
    pub megamorphic_code: Value,
}

impl Roots {
    fn iterate<V: ObjectVisitor>(&mut self, visitor: &mut V) {
        // SAFETY: every field is a live Value slot
        unsafe {
            let first = &mut self.meta_map as *mut Value;
            let last = (&mut self.megamorphic_code as *mut Value).add(1);
            visitor.visit_pointers(first, last);
        }
    }
}

// ── Stub cache ────────────────────────────────────────────────────────

/// Dispatch cache keyed by (map, selector) hashes. Not traversed during
/// GC — its entries reference objects by address, so the whole table is
/// dropped at the end of a collection and refills lazily.
pub struct StubCache {
    entries: Vec<Value>,
}

impl StubCache {
    const CAPACITY: usize = 128;

    fn new() -> StubCache {
        StubCache { entries: vec![Value::from_i64(0); Self::CAPACITY] }
    }

    pub fn insert(&mut self, hash: usize, stub: Value) {
        self.entries[hash % Self::CAPACITY] = stub;
    }

    pub fn lookup(&self, hash: usize) -> Value {
        self.entries[hash % Self::CAPACITY]
    }

    pub fn clear(&mut self) {
        self.entries.fill(Value::from_i64(0));
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

pub struct Heap {
    pub config: HeapConfig,
    pub flags: GcFlags,
    pub new_space: NewSpace,
    pub old_space: PagedSpace,
    pub code_space: PagedSpace,
    pub map_space: PagedSpace,
    pub lo_space: LargeObjectSpace,
    pub roots: Roots,
    /// The canonical symbol table. A root, but weak in its elements:
    /// marking treats it specially and prunes dead symbols.
    pub symbol_table: Value,
    pub global_handles: GlobalHandles,
    pub stub_cache: StubCache,
    /// Embedder-visible strong root slots (stack and thread state).
    pub handles: Vec<Value>,
}

const SYMBOL_TABLE_CAPACITY: usize = 64;

impl Heap {
    pub fn new(config: HeapConfig) -> Result<Heap, HeapError> {
        Self::with_flags(config, GcFlags::default())
    }

    pub fn with_flags(
        config: HeapConfig,
        flags: GcFlags,
    ) -> Result<Heap, HeapError> {
        config.validate()?;

        let new_space = NewSpace::new(config.semispace_size)
            .ok_or(HeapError::ReservationFailed)?;
        let old_space = PagedSpace::new("old", config.old_space_pages, None)
            .ok_or(HeapError::ReservationFailed)?;
        let code_space = PagedSpace::new("code", config.code_space_pages, None)
            .ok_or(HeapError::ReservationFailed)?;
        let map_space =
            PagedSpace::new("map", config.map_space_pages, Some(Map::SIZE))
                .ok_or(HeapError::ReservationFailed)?;

        let mut heap = Heap {
            config,
            flags,
            new_space,
            old_space,
            code_space,
            map_space,
            lo_space: LargeObjectSpace::new(),
            roots: Roots {
                meta_map: Value::from_i64(0),
                seq_string_map: Value::from_i64(0),
                cons_string_map: Value::from_i64(0),
                heap_number_map: Value::from_i64(0),
                oddball_map: Value::from_i64(0),
                fixed_array_map: Value::from_i64(0),
                symbol_table_map: Value::from_i64(0),
                byte_array_map: Value::from_i64(0),
                code_map: Value::from_i64(0),
                one_word_filler_map: Value::from_i64(0),
                null_value: Value::from_i64(0),
                true_value: Value::from_i64(0),
                false_value: Value::from_i64(0),
                empty_string: Value::from_i64(0),
                megamorphic_code: Value::from_i64(0),
            },
            symbol_table: Value::from_i64(0),
            global_handles: GlobalHandles::new(),
            stub_cache: StubCache::new(),
            handles: Vec::new(),
        };
        heap.bootstrap()?;

        tracing::debug!(
            semispace = heap.config.semispace_size,
            old_pages = heap.config.old_space_pages,
            code_pages = heap.config.code_space_pages,
            map_pages = heap.config.map_space_pages,
            "heap created"
        );
        Ok(heap)
    }

    /// Create the maps and singletons everything else depends on. Order
    /// matters only for the meta map, which describes itself.
    fn bootstrap(&mut self) -> Result<(), HeapError> {
        let meta_addr = self
            .map_space
            .allocate_raw(Map::SIZE)
            .ok_or(HeapError::ReservationFailed)?
            .addr;
        // SAFETY: fresh map-space allocation of Map::SIZE bytes
        unsafe {
            init_map(meta_addr as *mut Map, meta_addr, InstanceType::Map, Map::SIZE as u32);
        }
        self.roots.meta_map = Value::from_address(meta_addr);

        self.roots.seq_string_map =
            self.allocate_map(InstanceType::SeqString, VARIABLE_SIZE)?;
        self.roots.cons_string_map =
            self.allocate_map(InstanceType::ConsString, ConsString::SIZE as u32)?;
        self.roots.heap_number_map =
            self.allocate_map(InstanceType::HeapNumber, HeapNumber::SIZE as u32)?;
        self.roots.oddball_map =
            self.allocate_map(InstanceType::Oddball, Oddball::SIZE as u32)?;
        self.roots.fixed_array_map =
            self.allocate_map(InstanceType::FixedArray, VARIABLE_SIZE)?;
        self.roots.symbol_table_map =
            self.allocate_map(InstanceType::SymbolTable, VARIABLE_SIZE)?;
        self.roots.byte_array_map =
            self.allocate_map(InstanceType::ByteArray, VARIABLE_SIZE)?;
        self.roots.code_map =
            self.allocate_map(InstanceType::Code, VARIABLE_SIZE)?;
        self.roots.one_word_filler_map = self.allocate_map(
            InstanceType::OneWordFiller,
            size_of::<usize>() as u32,
        )?;

        self.roots.null_value = self.allocate_oddball(OddballKind::Null)?;
        self.roots.true_value = self.allocate_oddball(OddballKind::True)?;
        self.roots.false_value = self.allocate_oddball(OddballKind::False)?;

        self.roots.empty_string = self
            .allocate_seq_string(b"", AllocationSpace::Old)
            .ok_or(HeapError::ReservationFailed)?;

        let table = self
            .allocate_fixed_array(
                SymbolTable::PREFIX_ENTRIES + SYMBOL_TABLE_CAPACITY,
                AllocationSpace::Old,
            )
            .ok_or(HeapError::ReservationFailed)?;
        // SAFETY: freshly allocated fixed array of table shape
        unsafe {
            let obj = HeapObject::from_value(table);
            obj.set_map(self.roots.symbol_table_map.address());
            (*SymbolTable::assume_marked(obj)).set_element_count(0);
        }
        self.symbol_table = table;

        self.roots.megamorphic_code = self
            .allocate_code(16, 0, CodeFlags::empty())
            .ok_or(HeapError::ReservationFailed)?;

        Ok(())
    }

    fn allocate_oddball(&mut self, kind: OddballKind) -> Result<Value, HeapError> {
        let addr = self
            .allocate_raw(Oddball::SIZE, AllocationSpace::Old)
            .ok_or(HeapError::ReservationFailed)?;
        // SAFETY: fresh old-space allocation of Oddball::SIZE bytes
        unsafe {
            Oddball::init(
                addr as *mut Oddball,
                self.roots.oddball_map.address(),
                kind,
            );
        }
        Ok(Value::from_address(addr))
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Raw allocation in a chosen space. Writes fillers over any region
    /// the space had to skip, so the spaces stay linearly walkable.
    pub fn allocate_raw(
        &mut self,
        size: usize,
        space: AllocationSpace,
    ) -> Option<usize> {
        let space = if size > self.config.large_object_threshold
            && !matches!(space, AllocationSpace::Map)
        {
            AllocationSpace::Large
        } else {
            space
        };
        match space {
            AllocationSpace::New => self.new_space.allocate_raw(size),
            AllocationSpace::Large => self.lo_space.allocate(size),
            AllocationSpace::Old
            | AllocationSpace::Code
            | AllocationSpace::Map => {
                let paged = match space {
                    AllocationSpace::Old => &mut self.old_space,
                    AllocationSpace::Code => &mut self.code_space,
                    _ => &mut self.map_space,
                };
                let allocation = paged.allocate_raw(size)?;
                if let Some((addr, filler_size)) = allocation.filler {
                    // SAFETY: the space just surrendered this region
                    unsafe { self.write_filler(addr, filler_size) };
                }
                Some(allocation.addr)
            }
        }
    }

    /// Lay a filler object over `[addr, addr + size)`.
    ///
    /// # Safety
    ///
    /// The region must be dead and writable.
    pub unsafe fn write_filler(&self, addr: usize, size: usize) {
        debug_assert!(size % size_of::<usize>() == 0 && size > 0);
        // SAFETY: region is dead and writable per contract
        unsafe {
            if size >= ByteArray::HEADER_SIZE {
                ByteArray::init(
                    addr as *mut ByteArray,
                    self.roots.byte_array_map.address(),
                    ByteArray::length_for(size),
                );
            } else {
                HeapObject::from_address(addr)
                    .set_map(self.roots.one_word_filler_map.address());
            }
        }
    }

    pub fn allocate_map(
        &mut self,
        instance_type: InstanceType,
        instance_size: u32,
    ) -> Result<Value, HeapError> {
        let addr = self
            .allocate_raw(Map::SIZE, AllocationSpace::Map)
            .ok_or(HeapError::ReservationFailed)?;
        // SAFETY: fresh map-space allocation
        unsafe {
            init_map(
                addr as *mut Map,
                self.roots.meta_map.address(),
                instance_type,
                instance_size,
            );
        }
        Ok(Value::from_address(addr))
    }

    pub fn allocate_fixed_array(
        &mut self,
        length: usize,
        space: AllocationSpace,
    ) -> Option<Value> {
        let addr = self.allocate_raw(FixedArray::size_for(length), space)?;
        // SAFETY: fresh allocation of the computed size
        unsafe {
            FixedArray::init(
                addr as *mut FixedArray,
                self.roots.fixed_array_map.address(),
                length,
                self.roots.null_value,
            );
        }
        Some(Value::from_address(addr))
    }

    pub fn allocate_byte_array(
        &mut self,
        length: usize,
        space: AllocationSpace,
    ) -> Option<Value> {
        let addr = self.allocate_raw(ByteArray::size_for(length), space)?;
        // SAFETY: fresh allocation of the computed size
        unsafe {
            ByteArray::init(
                addr as *mut ByteArray,
                self.roots.byte_array_map.address(),
                length,
            );
        }
        Some(Value::from_address(addr))
    }

    pub fn allocate_seq_string(
        &mut self,
        data: &[u8],
        space: AllocationSpace,
    ) -> Option<Value> {
        let addr = self.allocate_raw(SeqString::size_for(data.len()), space)?;
        // SAFETY: fresh allocation of the computed size
        unsafe {
            SeqString::init(
                addr as *mut SeqString,
                self.roots.seq_string_map.address(),
                data,
            );
        }
        Some(Value::from_address(addr))
    }

    pub fn allocate_cons_string(
        &mut self,
        first: Value,
        second: Value,
        space: AllocationSpace,
    ) -> Option<Value> {
        // SAFETY: both halves are string objects
        let length = unsafe {
            HeapObject::from_value(first).length_field()
                + HeapObject::from_value(second).length_field()
        };
        let addr = self.allocate_raw(ConsString::SIZE, space)?;
        // SAFETY: fresh allocation of ConsString::SIZE bytes
        unsafe {
            ConsString::init(
                addr as *mut ConsString,
                self.roots.cons_string_map.address(),
                length,
                first,
                second,
            );
        }
        Some(Value::from_address(addr))
    }

    pub fn allocate_heap_number(
        &mut self,
        value: f64,
        space: AllocationSpace,
    ) -> Option<Value> {
        let addr = self.allocate_raw(HeapNumber::SIZE, space)?;
        // SAFETY: fresh allocation of HeapNumber::SIZE bytes
        unsafe {
            HeapNumber::init(
                addr as *mut HeapNumber,
                self.roots.heap_number_map.address(),
                value,
            );
        }
        Some(Value::from_address(addr))
    }

    /// Allocate a code object. Lands in the code space, or in the
    /// large-object space above the size threshold.
    pub fn allocate_code(
        &mut self,
        instruction_size: usize,
        reloc_count: usize,
        flags: CodeFlags,
    ) -> Option<Value> {
        let size = Code::size_for(instruction_size, reloc_count);
        let addr = self.allocate_raw(size, AllocationSpace::Code)?;
        // SAFETY: fresh allocation of the computed size
        unsafe {
            Code::init(
                addr as *mut Code,
                self.roots.code_map.address(),
                flags,
                instruction_size,
                reloc_count,
            );
        }
        Some(Value::from_address(addr))
    }

    // ── Symbol table ───────────────────────────────────────────────

    /// Intern a string object into the symbol table. Returns `false`
    /// when the table is full.
    pub fn add_symbol(&mut self, symbol: Value) -> bool {
        let null = self.roots.null_value;
        // SAFETY: the symbol table is a valid table object
        unsafe {
            let table =
                &mut *SymbolTable::assume_marked(HeapObject::from_value(
                    self.symbol_table,
                ));
            for index in 0..table.capacity() {
                let slot = table.slot(index);
                if (*slot) == null {
                    *slot = symbol;
                    let count = table.element_count();
                    table.set_element_count(count + 1);
                    return true;
                }
            }
        }
        false
    }

    // ── Membership ─────────────────────────────────────────────────

    #[inline]
    pub fn in_new_space(&self, addr: usize) -> bool {
        self.new_space.contains(addr)
    }

    #[inline]
    pub fn in_new_space_value(&self, value: Value) -> bool {
        value.is_heap_object() && self.in_new_space(value.address())
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.new_space.in_reservation(addr)
            || self.old_space.contains(addr)
            || self.code_space.contains(addr)
            || self.map_space.contains(addr)
            || self.lo_space.contains(addr)
    }

    /// Promotion target for a young object: immutable flat data moves
    /// next to the code, everything else into old space.
    ///
    /// # Safety
    ///
    /// `obj` must have a readable map.
    pub unsafe fn target_space(&self, obj: HeapObject) -> AllocationSpace {
        // SAFETY: per contract
        let instance_type = unsafe { (*obj.map()).instance_type() };
        match instance_type {
            InstanceType::HeapNumber | InstanceType::SeqString => {
                AllocationSpace::Code
            }
            _ => AllocationSpace::Old,
        }
    }

    // ── Roots iteration ────────────────────────────────────────────

    /// Visit the strong roots: canonical objects, embedder handles, and
    /// strong global handles. The symbol table is not included; marking
    /// treats it specially.
    pub fn iterate_strong_roots<V: ObjectVisitor>(&mut self, visitor: &mut V) {
        self.roots.iterate(visitor);
        for handle in &mut self.handles {
            // SAFETY: embedder handle slots are live Value locations
            unsafe { visitor.visit_pointer(handle) };
        }
        self.global_handles.iterate_strong_roots(visitor);
    }

    /// Visit every root including the symbol-table slot. The pointer
    /// update phase uses this; marking must not.
    pub fn iterate_roots<V: ObjectVisitor>(&mut self, visitor: &mut V) {
        self.iterate_strong_roots(visitor);
        // SAFETY: the symbol-table field is a live Value slot
        unsafe { visitor.visit_pointer(&mut self.symbol_table) };
    }

    // ── Remembered sets ────────────────────────────────────────────

    /// Note an old-to-new store at `slot_addr` (paged spaces only).
    pub fn record_write(&mut self, slot_addr: usize) {
        debug_assert!(
            self.old_space.contains(slot_addr)
                || self.code_space.contains(slot_addr)
                || self.map_space.contains(slot_addr)
        );
        // SAFETY: slot is inside a paged space, so its page is mapped
        unsafe { (*Page::from_address(slot_addr)).set_rset_bit(slot_addr) };
    }

    /// Clear the remembered-set bits for a reclaimed region. The region
    /// never spans pages.
    pub fn clear_rset_range(&mut self, start: usize, size: usize) {
        // SAFETY: the region lies inside one mapped page
        unsafe { (*Page::from_address(start)).clear_rset_range(start, size) };
    }

    /// Recompute every remembered-set bit from scratch by scanning the
    /// paged spaces for pointers into new space.
    pub fn rebuild_rsets(&mut self) {
        struct RebuildVisitor {
            new_low: usize,
            new_high: usize,
        }

        impl ObjectVisitor for RebuildVisitor {
            unsafe fn visit_pointer(&mut self, slot: *mut Value) {
                // SAFETY: slot is a live field of a walked object
                let value = unsafe { *slot };
                if value.is_heap_object() {
                    let addr = value.address();
                    if addr >= self.new_low && addr < self.new_high {
                        // SAFETY: slot lies in a mapped paged-space page
                        unsafe {
                            (*Page::from_address(slot as usize))
                                .set_rset_bit(slot as usize);
                        }
                    }
                }
            }
        }

        let mut visitor = RebuildVisitor {
            new_low: self.new_space.bottom(),
            new_high: self.new_space.bottom() + self.new_space.capacity(),
        };

        for space in [&self.old_space, &self.code_space, &self.map_space] {
            for index in 0..space.pages_in_use() {
                // SAFETY: in-use pages are mapped
                unsafe { (*space.page(index)).clear_rset() };
            }
            for obj in HeapObjectIterator::new(space, None) {
                // SAFETY: post-collection spaces are linearly walkable
                unsafe {
                    let map = &*obj.map();
                    obj.iterate_body(
                        map.instance_type(),
                        obj.size_from_map(map),
                        &mut visitor,
                    );
                }
            }
        }
    }
}
