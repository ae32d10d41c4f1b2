use bitflags::bitflags;

use crate::map::{Map, VARIABLE_SIZE};
use crate::map_word::MapWord;
use crate::visitor::ObjectVisitor;
use crate::Value;

/// Round an object size up to allocation-word alignment.
#[inline(always)]
pub const fn align_object_size(size: usize) -> usize {
    (size + 7) & !7
}

// ── Instance types ─────────────────────────────────────────────────

/// Heap object type tag, stored in the object's map.
///
/// String types come first so that "is a string" is a range check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InstanceType {
    SeqString = 0,
    ConsString,
    HeapNumber,
    Oddball,
    FixedArray,
    SymbolTable,
    ByteArray,
    Code,
    Map,
    OneWordFiller,
}

pub const FIRST_NONSTRING_TYPE: u16 = InstanceType::HeapNumber as u16;

impl InstanceType {
    pub const COUNT: usize = Self::OneWordFiller as usize + 1;

    #[inline(always)]
    pub fn from_u16(raw: u16) -> Self {
        debug_assert!((raw as usize) < Self::COUNT);
        // SAFETY: raw is range-checked against the enum size
        unsafe { core::mem::transmute::<u16, InstanceType>(raw) }
    }

    #[inline(always)]
    pub fn is_string(self) -> bool {
        (self as u16) < FIRST_NONSTRING_TYPE
    }
}

// ── HeapObject ─────────────────────────────────────────────────────

/// An untyped view over a heap object: its start address.
///
/// All accessors are raw memory operations; the caller is responsible
/// for the address pointing at object memory in the phase-appropriate
/// map-word state.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeapObject(usize);

impl HeapObject {
    #[inline(always)]
    pub fn from_address(addr: usize) -> Self {
        debug_assert!(addr % size_of::<usize>() == 0);
        Self(addr)
    }

    #[inline(always)]
    pub fn from_value(value: Value) -> Self {
        Self(value.address())
    }

    #[inline(always)]
    pub const fn address(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn to_value(self) -> Value {
        Value::from_address(self.0)
    }

    // ── Map word ───────────────────────────────────────────────────

    /// # Safety
    ///
    /// The address must point at readable object memory.
    #[inline(always)]
    pub unsafe fn map_word(self) -> MapWord {
        // SAFETY: first word of the object by contract
        unsafe { *(self.0 as *const MapWord) }
    }

    /// # Safety
    ///
    /// The address must point at writable object memory.
    #[inline(always)]
    pub unsafe fn set_map_word(self, word: MapWord) {
        // SAFETY: first word of the object by contract
        unsafe { *(self.0 as *mut MapWord) = word };
    }

    /// The object's map. Valid in the unmarked and marked states, not
    /// while the map word holds a forwarding or free-region encoding.
    ///
    /// # Safety
    ///
    /// Object memory must be readable and the map word must carry a map
    /// pointer.
    #[inline(always)]
    pub unsafe fn map(self) -> *mut Map {
        // SAFETY: per contract
        unsafe { self.map_word().to_map_address() as *mut Map }
    }

    /// # Safety
    ///
    /// Object memory must be writable.
    #[inline(always)]
    pub unsafe fn set_map(self, map_addr: usize) {
        // SAFETY: per contract
        unsafe { self.set_map_word(MapWord::from_map_address(map_addr)) };
    }

    /// # Safety
    ///
    /// Object memory must be readable.
    #[inline(always)]
    pub unsafe fn is_marked(self) -> bool {
        // SAFETY: per contract
        unsafe { self.map_word().is_marked() }
    }

    /// # Safety
    ///
    /// Object memory must be writable and the map word must carry a map
    /// pointer.
    #[inline(always)]
    pub unsafe fn set_mark(self) {
        // SAFETY: per contract
        unsafe { self.set_map_word(self.map_word().set_mark()) };
    }

    /// # Safety
    ///
    /// Same as [`Self::set_mark`].
    #[inline(always)]
    pub unsafe fn clear_mark(self) {
        // SAFETY: per contract
        unsafe { self.set_map_word(self.map_word().clear_mark()) };
    }

    /// # Safety
    ///
    /// Object memory must be readable.
    #[inline(always)]
    pub unsafe fn is_overflowed(self) -> bool {
        // SAFETY: per contract
        unsafe { self.map_word().is_overflowed() }
    }

    /// # Safety
    ///
    /// Same as [`Self::set_mark`].
    #[inline(always)]
    pub unsafe fn set_overflow(self) {
        // SAFETY: per contract
        unsafe { self.set_map_word(self.map_word().set_overflow()) };
    }

    /// # Safety
    ///
    /// Same as [`Self::set_mark`].
    #[inline(always)]
    pub unsafe fn clear_overflow(self) {
        // SAFETY: per contract
        unsafe { self.set_map_word(self.map_word().clear_overflow()) };
    }

    // ── Size ───────────────────────────────────────────────────────

    /// Second word of the object, used as a length field by the
    /// variable-sized types.
    ///
    /// # Safety
    ///
    /// Object memory must be readable and at least two words long.
    #[inline(always)]
    pub unsafe fn length_field(self) -> usize {
        // SAFETY: per contract
        unsafe { *((self.0 + 8) as *const usize) }
    }

    /// # Safety
    ///
    /// The map word must carry a (possibly marked) map pointer.
    #[inline(always)]
    pub unsafe fn size(self) -> usize {
        // SAFETY: per contract
        unsafe { self.size_from_map(&*self.map()) }
    }

    /// Size in bytes, computed from the given map. The map word itself
    /// is not consulted, so this works while it holds a forwarding
    /// encoding — the caller recovers the map through the encoding.
    ///
    /// # Safety
    ///
    /// `map` must describe this object and the object's length fields
    /// must be intact.
    pub unsafe fn size_from_map(self, map: &Map) -> usize {
        let fixed = map.instance_size();
        if fixed != VARIABLE_SIZE {
            return fixed as usize;
        }
        // SAFETY: variable-sized objects keep their length in the second
        // word, which survives every map-word state
        unsafe {
            match map.instance_type() {
                InstanceType::FixedArray | InstanceType::SymbolTable => {
                    FixedArray::size_for(self.length_field())
                }
                InstanceType::ByteArray => {
                    ByteArray::size_for(self.length_field())
                }
                InstanceType::SeqString => {
                    SeqString::size_for(self.length_field())
                }
                InstanceType::Code => (*(self.0 as *const Code)).size(),
                _ => unreachable!("fixed-size type without instance size"),
            }
        }
    }

    // ── Body iteration ─────────────────────────────────────────────

    /// Visit the object's body fields (everything but the map word).
    ///
    /// # Safety
    ///
    /// `instance_type` and `object_size` must match the object, and the
    /// body must be intact.
    pub unsafe fn iterate_body<V: ObjectVisitor>(
        self,
        instance_type: InstanceType,
        object_size: usize,
        visitor: &mut V,
    ) {
        // SAFETY: offsets are within object_size per the type layouts
        unsafe {
            match instance_type {
                InstanceType::FixedArray | InstanceType::SymbolTable => {
                    visitor.visit_pointers(
                        (self.0 + FixedArray::HEADER_SIZE) as *mut Value,
                        (self.0 + object_size) as *mut Value,
                    );
                }
                InstanceType::ConsString => {
                    visitor.visit_pointers(
                        (self.0 + ConsString::FIRST_OFFSET) as *mut Value,
                        (self.0 + ConsString::SIZE) as *mut Value,
                    );
                }
                InstanceType::Map => {
                    visitor.visit_pointer(
                        (self.0 + Map::CODE_CACHE_OFFSET) as *mut Value,
                    );
                }
                InstanceType::Code => {
                    let code = &mut *(self.0 as *mut Code);
                    visitor.begin_code_iteration(self);
                    code.iterate_targets(visitor);
                    visitor.end_code_iteration(self);
                }
                InstanceType::SeqString
                | InstanceType::ByteArray
                | InstanceType::HeapNumber
                | InstanceType::Oddball
                | InstanceType::OneWordFiller => {}
            }
        }
    }
}

impl core::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HeapObject(0x{:x})", self.0)
    }
}

// ── FixedArray ─────────────────────────────────────────────────────

/// A variable-length array of tagged values.
///
/// ```text
/// [map word 8B] [length: u64 8B] [elem_0 8B] [elem_1 8B] ...
/// ```
#[repr(C)]
pub struct FixedArray {
    pub map_word: MapWord,
    length: u64,
}

const _: () = assert!(size_of::<FixedArray>() == 16);

impl FixedArray {
    pub const HEADER_SIZE: usize = size_of::<FixedArray>();

    #[inline(always)]
    pub const fn size_for(length: usize) -> usize {
        Self::HEADER_SIZE + length * size_of::<Value>()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline(always)]
    fn elements_ptr(&self) -> *mut Value {
        unsafe { (self as *const FixedArray).add(1) as *mut Value }
    }

    /// # Safety
    ///
    /// `index < len()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn get(&self, index: usize) -> Value {
        debug_assert!(index < self.len());
        // SAFETY: index checked against length
        unsafe { *self.elements_ptr().add(index) }
    }

    /// # Safety
    ///
    /// `index < len()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn set(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.len());
        // SAFETY: index checked against length
        unsafe { *self.elements_ptr().add(index) = value };
    }

    /// Address of the element slot at `index`.
    ///
    /// # Safety
    ///
    /// `index < len()`.
    #[inline(always)]
    pub unsafe fn slot(&self, index: usize) -> *mut Value {
        debug_assert!(index < self.len());
        // SAFETY: index checked against length
        unsafe { self.elements_ptr().add(index) }
    }

    /// Initialize a fixed array at a raw allocation, filling every
    /// element with `fill`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `size_for(length)` writable bytes.
    pub unsafe fn init(
        ptr: *mut FixedArray,
        map_addr: usize,
        length: usize,
        fill: Value,
    ) {
        // SAFETY: allocation is size_for(length) bytes by contract
        unsafe {
            ptr.write(FixedArray {
                map_word: MapWord::from_map_address(map_addr),
                length: length as u64,
            });
            let elements = ptr.add(1) as *mut Value;
            for i in 0..length {
                *elements.add(i) = fill;
            }
        }
    }
}

// ── SymbolTable ────────────────────────────────────────────────────

/// The canonical symbol (interned string) table.
///
/// Shares the fixed-array layout. The first [`Self::PREFIX_ENTRIES`]
/// elements are the table header — the live symbol count as a fixnum —
/// and the remaining elements are symbol slots. The table holds its
/// elements weakly: the collector marks the prefix, never the slots.
#[repr(transparent)]
pub struct SymbolTable(FixedArray);

impl SymbolTable {
    pub const PREFIX_ENTRIES: usize = 1;

    /// Reinterpret a heap object known to be the symbol table without
    /// consulting its map. The marking phase needs this: the table's map
    /// word is already marked when the table is pruned, so a map-checked
    /// cast cannot be used.
    ///
    /// # Safety
    ///
    /// `obj` must be the symbol table.
    #[inline(always)]
    pub unsafe fn assume_marked(obj: HeapObject) -> *mut SymbolTable {
        obj.address() as *mut SymbolTable
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.0.len() - Self::PREFIX_ENTRIES
    }

    pub fn element_count(&self) -> usize {
        // SAFETY: prefix entry 0 exists for any valid table
        unsafe { self.0.get(0).to_i64() as usize }
    }

    pub fn set_element_count(&mut self, count: usize) {
        // SAFETY: prefix entry 0 exists for any valid table
        unsafe { self.0.set(0, Value::from_i64(count as i64)) };
    }

    /// Called by the collector after pruning dead symbols.
    pub fn elements_removed(&mut self, removed: usize) {
        let count = self.element_count();
        debug_assert!(removed <= count);
        self.set_element_count(count - removed);
    }

    /// Address of the symbol slot at `index` (past the prefix).
    ///
    /// # Safety
    ///
    /// `index < capacity()`.
    #[inline(always)]
    pub unsafe fn slot(&self, index: usize) -> *mut Value {
        // SAFETY: caller bounds index by capacity
        unsafe { self.0.slot(Self::PREFIX_ENTRIES + index) }
    }

    /// Visit the table-header elements only.
    ///
    /// # Safety
    ///
    /// The table memory must be valid.
    pub unsafe fn iterate_prefix<V: ObjectVisitor>(&self, visitor: &mut V) {
        // SAFETY: prefix entries exist for any valid table
        unsafe {
            visitor.visit_pointers(
                self.0.slot(0),
                self.0.slot(0).add(Self::PREFIX_ENTRIES),
            );
        }
    }

    /// Visit the symbol slots only.
    ///
    /// # Safety
    ///
    /// The table memory must be valid.
    pub unsafe fn iterate_elements<V: ObjectVisitor>(&self, visitor: &mut V) {
        if self.capacity() == 0 {
            return;
        }
        // SAFETY: slots [PREFIX_ENTRIES, len) exist for any valid table
        unsafe {
            let first = self.0.slot(Self::PREFIX_ENTRIES);
            visitor.visit_pointers(first, first.add(self.capacity()));
        }
    }
}

// ── ByteArray ──────────────────────────────────────────────────────

/// A variable-length raw byte buffer. Doubles as the filler object for
/// dead regions of at least header size: a byte array laid over a dead
/// slot keeps the space linearly walkable.
///
/// ```text
/// [map word 8B] [length: u64 8B] [byte_0] [byte_1] ...
/// ```
#[repr(C)]
pub struct ByteArray {
    pub map_word: MapWord,
    length: u64,
}

const _: () = assert!(size_of::<ByteArray>() == 16);

impl ByteArray {
    pub const HEADER_SIZE: usize = size_of::<ByteArray>();

    #[inline(always)]
    pub const fn size_for(length: usize) -> usize {
        align_object_size(Self::HEADER_SIZE + length)
    }

    /// Byte length that makes a byte array occupy exactly `size` bytes.
    #[inline(always)]
    pub const fn length_for(size: usize) -> usize {
        debug_assert!(size >= Self::HEADER_SIZE);
        debug_assert!(size % size_of::<usize>() == 0);
        size - Self::HEADER_SIZE
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline(always)]
    pub fn set_length(&mut self, length: usize) {
        self.length = length as u64;
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len()` bytes.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        // SAFETY: per contract
        unsafe {
            core::slice::from_raw_parts(
                (self as *const ByteArray).add(1) as *const u8,
                self.len(),
            )
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to at least `size_for(length)` writable bytes.
    pub unsafe fn init(ptr: *mut ByteArray, map_addr: usize, length: usize) {
        // SAFETY: per contract
        unsafe {
            ptr.write(ByteArray {
                map_word: MapWord::from_map_address(map_addr),
                length: length as u64,
            });
        }
    }
}

// ── Strings ────────────────────────────────────────────────────────

/// A flat string: byte length, then bytes.
#[repr(C)]
pub struct SeqString {
    pub map_word: MapWord,
    length: u64,
}

const _: () = assert!(size_of::<SeqString>() == 16);

impl SeqString {
    pub const HEADER_SIZE: usize = size_of::<SeqString>();

    #[inline(always)]
    pub const fn size_for(length: usize) -> usize {
        align_object_size(Self::HEADER_SIZE + length)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len()` bytes.
    pub unsafe fn bytes(&self) -> &[u8] {
        // SAFETY: per contract
        unsafe {
            core::slice::from_raw_parts(
                (self as *const SeqString).add(1) as *const u8,
                self.len(),
            )
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to at least `size_for(data.len())` writable bytes.
    pub unsafe fn init(ptr: *mut SeqString, map_addr: usize, data: &[u8]) {
        // SAFETY: per contract
        unsafe {
            ptr.write(SeqString {
                map_word: MapWord::from_map_address(map_addr),
                length: data.len() as u64,
            });
            let bytes = ptr.add(1) as *mut u8;
            core::ptr::copy_nonoverlapping(data.as_ptr(), bytes, data.len());
        }
    }
}

/// A rope node: the concatenation of `first` and `second`.
#[repr(C)]
pub struct ConsString {
    pub map_word: MapWord,
    length: u64,
    first: Value,
    second: Value,
}

const _: () = assert!(size_of::<ConsString>() == 32);

impl ConsString {
    pub const SIZE: usize = size_of::<ConsString>();
    pub const FIRST_OFFSET: usize = 16;
    pub const SECOND_OFFSET: usize = 24;

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline(always)]
    pub fn first(&self) -> Value {
        self.first
    }

    #[inline(always)]
    pub fn second(&self) -> Value {
        self.second
    }

    /// # Safety
    ///
    /// `ptr` must point to at least [`Self::SIZE`] writable bytes.
    pub unsafe fn init(
        ptr: *mut ConsString,
        map_addr: usize,
        length: usize,
        first: Value,
        second: Value,
    ) {
        // SAFETY: per contract
        unsafe {
            ptr.write(ConsString {
                map_word: MapWord::from_map_address(map_addr),
                length: length as u64,
                first,
                second,
            });
        }
    }
}

// ── HeapNumber ─────────────────────────────────────────────────────

/// A boxed double.
#[repr(C)]
pub struct HeapNumber {
    pub map_word: MapWord,
    value: f64,
}

const _: () = assert!(size_of::<HeapNumber>() == 16);

impl HeapNumber {
    pub const SIZE: usize = size_of::<HeapNumber>();

    #[inline(always)]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// # Safety
    ///
    /// `ptr` must point to at least [`Self::SIZE`] writable bytes.
    pub unsafe fn init(ptr: *mut HeapNumber, map_addr: usize, value: f64) {
        // SAFETY: per contract
        unsafe {
            ptr.write(HeapNumber {
                map_word: MapWord::from_map_address(map_addr),
                value,
            });
        }
    }
}

// ── Oddball ────────────────────────────────────────────────────────

/// Kind tag for [`Oddball`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum OddballKind {
    Null = 0,
    True,
    False,
}

/// One of the fixed singleton values (null, true, false).
#[repr(C)]
pub struct Oddball {
    pub map_word: MapWord,
    kind: u64,
}

const _: () = assert!(size_of::<Oddball>() == 16);

impl Oddball {
    pub const SIZE: usize = size_of::<Oddball>();

    #[inline(always)]
    pub fn kind(&self) -> OddballKind {
        debug_assert!(self.kind <= OddballKind::False as u64);
        // SAFETY: kind is only written through init with a valid tag
        unsafe { core::mem::transmute::<u64, OddballKind>(self.kind) }
    }

    /// # Safety
    ///
    /// `ptr` must point to at least [`Self::SIZE`] writable bytes.
    pub unsafe fn init(ptr: *mut Oddball, map_addr: usize, kind: OddballKind) {
        // SAFETY: per contract
        unsafe {
            ptr.write(Oddball {
                map_word: MapWord::from_map_address(map_addr),
                kind: kind as u64,
            });
        }
    }
}

// ── Code ───────────────────────────────────────────────────────────

bitflags! {
    /// Per-code-object state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeFlags: u64 {
        /// Call-site targets currently hold tagged object pointers
        /// instead of entry addresses. Only set between the marking and
        /// relocation phases of a compacting collection.
        const IC_TARGET_IS_OBJECT = 1 << 0;
        /// This object is an inline-cache stub and may be flushed at GC.
        const INLINE_CACHE_STUB = 1 << 1;
    }
}

/// Relocation-entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RelocMode {
    /// Call site targeting another code object's entry point.
    CodeTarget = 0,
    /// Debugger-inserted call at a return site.
    DebugTarget,
    /// An embedded tagged object pointer.
    EmbeddedObject,
}

impl RelocMode {
    #[inline(always)]
    pub fn from_u32(raw: u32) -> Self {
        debug_assert!(raw <= RelocMode::EmbeddedObject as u32);
        // SAFETY: raw is range-checked
        unsafe { core::mem::transmute::<u32, RelocMode>(raw) }
    }
}

/// One relocation record: the kind, the call-site position inside the
/// instruction stream, and the target word.
///
/// For [`RelocMode::CodeTarget`] and [`RelocMode::DebugTarget`] the
/// target word is position-relative while in address form (the stored
/// value plus the site address yields the callee's entry), or a tagged
/// [`Value`] while in object form. For [`RelocMode::EmbeddedObject`] it
/// is always a tagged [`Value`].
#[repr(C)]
pub struct RelocEntry {
    pub mode: u32,
    pub pc_offset: u32,
    pub target: u64,
}

const _: () = assert!(size_of::<RelocEntry>() == 16);

/// A compiled code object.
///
/// ```text
/// [map word 8B] [flags: u64 8B] [instruction_size: u32, reloc_count: u32]
/// [instructions ...] [RelocEntry_0 16B] [RelocEntry_1 16B] ...
/// ```
///
/// The entry point is at a fixed offset from the object start, so a
/// derived (mid-object) target can always be converted back to the
/// containing object by subtracting [`Code::HEADER_SIZE`].
#[repr(C)]
pub struct Code {
    pub map_word: MapWord,
    flags: u64,
    instruction_size: u32,
    reloc_count: u32,
}

const _: () = assert!(size_of::<Code>() == 24);

impl Code {
    pub const HEADER_SIZE: usize = size_of::<Code>();

    #[inline(always)]
    pub const fn size_for(instruction_size: usize, reloc_count: usize) -> usize {
        Self::HEADER_SIZE
            + align_object_size(instruction_size)
            + reloc_count * size_of::<RelocEntry>()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        Self::size_for(self.instruction_size as usize, self.reloc_count as usize)
    }

    #[inline(always)]
    pub fn address(&self) -> usize {
        self as *const Code as usize
    }

    /// Address of the first instruction; the target of calls into this
    /// object.
    #[inline(always)]
    pub fn entry(&self) -> usize {
        self.address() + Self::HEADER_SIZE
    }

    #[inline(always)]
    pub fn flags(&self) -> CodeFlags {
        CodeFlags::from_bits_truncate(self.flags)
    }

    #[inline(always)]
    pub fn is_inline_cache_stub(&self) -> bool {
        self.flags().contains(CodeFlags::INLINE_CACHE_STUB)
    }

    #[inline(always)]
    pub fn ic_target_is_object(&self) -> bool {
        self.flags().contains(CodeFlags::IC_TARGET_IS_OBJECT)
    }

    #[inline(always)]
    pub fn set_ic_target_is_object(&mut self, on: bool) {
        let mut flags = self.flags();
        flags.set(CodeFlags::IC_TARGET_IS_OBJECT, on);
        self.flags = flags.bits();
    }

    #[inline(always)]
    pub fn reloc_count(&self) -> usize {
        self.reloc_count as usize
    }

    #[inline(always)]
    fn reloc_ptr(&self) -> *mut RelocEntry {
        let offset = Self::HEADER_SIZE
            + align_object_size(self.instruction_size as usize);
        (self.address() + offset) as *mut RelocEntry
    }

    /// # Safety
    ///
    /// The object memory must span `size()` bytes.
    #[inline(always)]
    pub unsafe fn reloc_entries(&mut self) -> &mut [RelocEntry] {
        // SAFETY: entries live after the aligned instruction area
        unsafe {
            core::slice::from_raw_parts_mut(
                self.reloc_ptr(),
                self.reloc_count as usize,
            )
        }
    }

    /// Call-site address of a relocation entry.
    #[inline(always)]
    pub fn site_address(&self, entry: &RelocEntry) -> usize {
        self.entry() + entry.pc_offset as usize
    }

    /// Absolute target of a call-site entry in address form.
    #[inline(always)]
    pub fn target_address(&self, entry: &RelocEntry) -> usize {
        (self.site_address(entry) as i64).wrapping_add(entry.target as i64)
            as usize
    }

    /// Store `addr` as the (position-relative) target of `entry`.
    #[inline(always)]
    pub fn set_target_address(&self, entry: &mut RelocEntry, addr: usize) {
        entry.target =
            (addr as i64).wrapping_sub(self.site_address(entry) as i64) as u64;
    }

    /// Target of a call-site entry in object form.
    #[inline(always)]
    pub fn target_object(entry: &RelocEntry) -> Value {
        Value::from_raw(entry.target)
    }

    #[inline(always)]
    pub fn set_target_object(entry: &mut RelocEntry, object: Value) {
        entry.target = object.raw();
    }

    /// Dispatch every relocation entry to the visitor. Call-site targets
    /// in object form are plain pointer slots; in address form they go
    /// through the code-target hooks.
    ///
    /// # Safety
    ///
    /// The object memory must span `size()` bytes.
    pub unsafe fn iterate_targets<V: ObjectVisitor>(&mut self, visitor: &mut V) {
        let as_object = self.ic_target_is_object();
        let this = HeapObject::from_address(self.address());
        // SAFETY: reloc entries are in-bounds per contract
        unsafe {
            for entry in self.reloc_entries() {
                match RelocMode::from_u32(entry.mode) {
                    RelocMode::CodeTarget => {
                        if as_object {
                            visitor.visit_pointer(
                                &mut entry.target as *mut u64 as *mut Value,
                            );
                        } else {
                            visitor.visit_code_target(this, entry);
                        }
                    }
                    RelocMode::DebugTarget => {
                        if as_object {
                            visitor.visit_pointer(
                                &mut entry.target as *mut u64 as *mut Value,
                            );
                        } else {
                            visitor.visit_debug_target(this, entry);
                        }
                    }
                    RelocMode::EmbeddedObject => {
                        visitor.visit_pointer(
                            &mut entry.target as *mut u64 as *mut Value,
                        );
                    }
                }
            }
        }
    }

    /// Convert object-form call-site targets back to address form,
    /// resolving sites against this object's current address. Used just
    /// before the object moves (or, for large and non-compacted code,
    /// after pointer update).
    ///
    /// # Safety
    ///
    /// The object memory must span `size()` bytes, and every object-form
    /// target must refer to a valid code object.
    pub unsafe fn convert_ic_targets_to_addresses(&mut self) {
        if !self.ic_target_is_object() {
            return;
        }
        let this = self as *mut Code;
        // SAFETY: entries in-bounds; targets are code objects by contract
        unsafe {
            for entry in (*this).reloc_entries() {
                let mode = RelocMode::from_u32(entry.mode);
                if matches!(mode, RelocMode::CodeTarget | RelocMode::DebugTarget)
                {
                    let code = Self::target_object(entry).address();
                    (*this).set_target_address(
                        entry,
                        code + Self::HEADER_SIZE,
                    );
                }
            }
        }
        self.set_ic_target_is_object(false);
    }

    /// Fix position-relative targets after the object moved by `delta`
    /// bytes. Absolute callee addresses are unchanged by this object's
    /// move, so each stored relative value shifts by `-delta`.
    ///
    /// # Safety
    ///
    /// The object memory must span `size()` bytes.
    pub unsafe fn relocate(&mut self, delta: isize) {
        debug_assert!(!self.ic_target_is_object());
        if delta == 0 {
            return;
        }
        // SAFETY: entries in-bounds per contract
        unsafe {
            for entry in self.reloc_entries() {
                let mode = RelocMode::from_u32(entry.mode);
                if matches!(mode, RelocMode::CodeTarget | RelocMode::DebugTarget)
                {
                    entry.target =
                        (entry.target as i64).wrapping_sub(delta as i64) as u64;
                }
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to at least `size_for(...)` writable bytes.
    pub unsafe fn init(
        ptr: *mut Code,
        map_addr: usize,
        flags: CodeFlags,
        instruction_size: usize,
        reloc_count: usize,
    ) {
        // SAFETY: per contract
        unsafe {
            ptr.write(Code {
                map_word: MapWord::from_map_address(map_addr),
                flags: flags.bits(),
                instruction_size: instruction_size as u32,
                reloc_count: reloc_count as u32,
            });
            // Zero the instruction area and entries so a fresh object is
            // walkable before its sites are patched.
            let body = ptr.add(1) as *mut u8;
            let body_len = Code::size_for(instruction_size, reloc_count)
                - Code::HEADER_SIZE;
            core::ptr::write_bytes(body, 0, body_len);
        }
    }
}

/// Recover the containing code object from a derived (entry) pointer.
#[inline(always)]
pub fn code_from_derived_pointer(addr: usize) -> HeapObject {
    debug_assert!(addr > Code::HEADER_SIZE);
    HeapObject::from_address(addr - Code::HEADER_SIZE)
}
