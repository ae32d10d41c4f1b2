//! Object model for the managed heap.
//!
//! Every heap object begins with a [`MapWord`]: in the normal state a
//! tagged pointer to the object's [`Map`] (type descriptor), and during
//! a collection a bit-packed carrier for mark, overflow, and forwarding
//! state. The concrete object layouts, size computation, and body
//! iteration live in [`objects`]; collection phases walk bodies through
//! the [`ObjectVisitor`] trait.

mod map;
mod map_word;
mod objects;
mod value;
mod visitor;

pub use map::{init_map, Map, VARIABLE_SIZE};
pub use map_word::{
    MapWord, MULTI_FREE_ENCODING, SINGLE_FREE_ENCODING, WORD_SIZE,
};
pub use objects::{
    align_object_size, code_from_derived_pointer, ByteArray, Code, CodeFlags,
    ConsString, FixedArray, HeapNumber, HeapObject, InstanceType, Oddball,
    OddballKind, RelocEntry, RelocMode, SeqString, SymbolTable,
    FIRST_NONSTRING_TYPE,
};
pub use value::Value;
pub use visitor::ObjectVisitor;

#[cfg(test)]
mod tests {
    use super::*;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, i64::MAX >> 2, i64::MIN >> 2] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_heap_object());
            assert_eq!(unsafe { v.to_i64() }, n);
        }
    }

    #[test]
    fn ref_tagging() {
        let dummy: u64 = 0;
        let ptr = &dummy as *const u64;
        let v = Value::from_ptr(ptr);
        assert!(v.is_heap_object());
        assert!(!v.is_fixnum());
        assert_eq!(v.address(), ptr as usize);
    }

    // ── Object layout and marking ──────────────────────────────────

    /// A map followed by a backing buffer large enough for small test
    /// objects, so object accessors can run against real memory.
    struct TestArena {
        map: Box<[u64; 3]>,
        buffer: Box<[u64; 64]>,
    }

    fn arena(instance_type: InstanceType, instance_size: u32) -> TestArena {
        let arena = TestArena {
            map: Box::new([0u64; 3]),
            buffer: Box::new([0u64; 64]),
        };
        let map_addr = arena.map.as_ptr() as usize;
        unsafe {
            init_map(map_addr as *mut Map, map_addr, instance_type, instance_size);
        }
        arena
    }

    impl TestArena {
        fn map_addr(&self) -> usize {
            self.map.as_ptr() as usize
        }

        fn object(&self) -> HeapObject {
            HeapObject::from_address(self.buffer.as_ptr() as usize)
        }
    }

    #[test]
    fn mark_state_round_trip() {
        let a = arena(InstanceType::HeapNumber, HeapNumber::SIZE as u32);
        let obj = a.object();
        unsafe {
            HeapNumber::init(obj.address() as *mut HeapNumber, a.map_addr(), 1.5);

            assert!(!obj.is_marked());
            obj.set_mark();
            assert!(obj.is_marked());
            assert!(!obj.is_overflowed());
            assert_eq!(obj.map() as usize, a.map_addr());

            obj.set_overflow();
            assert!(obj.is_marked());
            assert!(obj.is_overflowed());
            assert_eq!(obj.map() as usize, a.map_addr());

            obj.clear_overflow();
            obj.clear_mark();
            assert!(!obj.is_marked());
            assert_eq!(obj.map() as usize, a.map_addr());
        }
    }

    #[test]
    fn size_from_map_fixed_and_variable() {
        let numbers = arena(InstanceType::HeapNumber, HeapNumber::SIZE as u32);
        let obj = numbers.object();
        unsafe {
            HeapNumber::init(
                obj.address() as *mut HeapNumber,
                numbers.map_addr(),
                0.0,
            );
            assert_eq!(obj.size(), HeapNumber::SIZE);
        }

        let arrays = arena(InstanceType::FixedArray, VARIABLE_SIZE);
        let obj = arrays.object();
        unsafe {
            FixedArray::init(
                obj.address() as *mut FixedArray,
                arrays.map_addr(),
                5,
                Value::from_i64(0),
            );
            assert_eq!(obj.size(), FixedArray::size_for(5));
            assert_eq!(obj.size(), 16 + 5 * 8);
        }
    }

    #[test]
    fn byte_array_filler_length() {
        assert_eq!(ByteArray::length_for(ByteArray::HEADER_SIZE), 0);
        assert_eq!(ByteArray::length_for(64), 48);
        assert_eq!(ByteArray::size_for(ByteArray::length_for(64)), 64);
    }

    // ── Body iteration ─────────────────────────────────────────────

    struct SlotCollector {
        slots: Vec<usize>,
        code_targets: usize,
    }

    impl ObjectVisitor for SlotCollector {
        unsafe fn visit_pointer(&mut self, slot: *mut Value) {
            self.slots.push(slot as usize);
        }

        unsafe fn visit_code_target(
            &mut self,
            _code: HeapObject,
            _entry: *mut RelocEntry,
        ) {
            self.code_targets += 1;
        }
    }

    #[test]
    fn fixed_array_body_visits_every_element() {
        let a = arena(InstanceType::FixedArray, VARIABLE_SIZE);
        let obj = a.object();
        let mut v = SlotCollector { slots: Vec::new(), code_targets: 0 };
        unsafe {
            FixedArray::init(
                obj.address() as *mut FixedArray,
                a.map_addr(),
                3,
                Value::from_i64(7),
            );
            obj.iterate_body(InstanceType::FixedArray, obj.size(), &mut v);
        }
        assert_eq!(v.slots.len(), 3);
        assert_eq!(v.slots[0], obj.address() + FixedArray::HEADER_SIZE);
        assert_eq!(v.slots[2], obj.address() + FixedArray::HEADER_SIZE + 16);
    }

    #[test]
    fn cons_string_body_visits_both_halves() {
        let a = arena(InstanceType::ConsString, ConsString::SIZE as u32);
        let obj = a.object();
        let mut v = SlotCollector { slots: Vec::new(), code_targets: 0 };
        unsafe {
            ConsString::init(
                obj.address() as *mut ConsString,
                a.map_addr(),
                0,
                Value::from_i64(0),
                Value::from_i64(0),
            );
            obj.iterate_body(InstanceType::ConsString, ConsString::SIZE, &mut v);
        }
        assert_eq!(
            v.slots,
            vec![
                obj.address() + ConsString::FIRST_OFFSET,
                obj.address() + ConsString::SECOND_OFFSET,
            ]
        );
    }

    // ── Code targets ───────────────────────────────────────────────

    fn init_test_code(a: &TestArena, reloc_count: usize) -> *mut Code {
        let code = a.object().address() as *mut Code;
        unsafe {
            Code::init(code, a.map_addr(), CodeFlags::empty(), 8, reloc_count);
        }
        code
    }

    #[test]
    fn code_target_address_round_trip() {
        let a = arena(InstanceType::Code, VARIABLE_SIZE);
        let code = init_test_code(&a, 1);
        unsafe {
            let callee_entry = (*code).entry() + 0x40;
            {
                let entry = &mut (*code).reloc_entries()[0];
                entry.mode = RelocMode::CodeTarget as u32;
                entry.pc_offset = 4;
                (*code).set_target_address(entry, callee_entry);
            }
            let entry = &(*code).reloc_entries()[0];
            assert_eq!((*code).target_address(entry), callee_entry);
        }
    }

    #[test]
    fn ic_target_object_form_round_trip() {
        // Derived → object → derived is the identity when the code
        // object has not moved.
        let a = arena(InstanceType::Code, VARIABLE_SIZE);
        let callee = arena(InstanceType::Code, VARIABLE_SIZE);
        let code = init_test_code(&a, 1);
        let callee_code = init_test_code(&callee, 0);
        unsafe {
            let callee_entry = (*callee_code).entry();
            {
                let entry = &mut (*code).reloc_entries()[0];
                entry.mode = RelocMode::CodeTarget as u32;
                entry.pc_offset = 0;
                (*code).set_target_address(entry, callee_entry);
            }

            // Address → object, the way the marking visitor does it.
            {
                let entry = &mut (*code).reloc_entries()[0];
                let derived = (*code).target_address(entry);
                let target = code_from_derived_pointer(derived);
                Code::set_target_object(entry, target.to_value());
            }
            (*code).set_ic_target_is_object(true);

            // Object → address, then a zero-distance relocate.
            (*code).convert_ic_targets_to_addresses();
            (*code).relocate(0);

            let entry = &(*code).reloc_entries()[0];
            assert_eq!((*code).target_address(entry), callee_entry);
            assert!(!(*code).ic_target_is_object());
        }
    }

    #[test]
    fn relocate_keeps_absolute_targets() {
        // Simulate a move by recomputing what the stored relative value
        // denotes from the new site address.
        let a = arena(InstanceType::Code, VARIABLE_SIZE);
        let code = init_test_code(&a, 1);
        unsafe {
            let callee_entry = (*code).entry() + 0x100;
            {
                let entry = &mut (*code).reloc_entries()[0];
                entry.mode = RelocMode::CodeTarget as u32;
                entry.pc_offset = 0;
                (*code).set_target_address(entry, callee_entry);
            }

            let delta = 0x200isize;
            (*code).relocate(delta);

            // After a real move the site address grows by delta, so the
            // denoted absolute target is site + delta + stored.
            let entry = &(*code).reloc_entries()[0];
            let new_site = (*code).site_address(entry) as i64 + delta as i64;
            let denoted = new_site.wrapping_add(entry.target as i64) as usize;
            assert_eq!(denoted, callee_entry);
        }
    }

    #[test]
    fn code_iteration_dispatches_by_target_form() {
        let a = arena(InstanceType::Code, VARIABLE_SIZE);
        let code = init_test_code(&a, 2);
        unsafe {
            {
                let entries = (*code).reloc_entries();
                entries[0].mode = RelocMode::CodeTarget as u32;
                entries[0].pc_offset = 0;
                entries[1].mode = RelocMode::EmbeddedObject as u32;
                entries[1].pc_offset = 4;
                entries[1].target = Value::from_i64(1).raw();
            }

            // Address form: call sites reach visit_code_target.
            let mut v = SlotCollector { slots: Vec::new(), code_targets: 0 };
            (*code).iterate_targets(&mut v);
            assert_eq!(v.code_targets, 1);
            assert_eq!(v.slots.len(), 1);

            // Object form: call sites become plain pointer slots.
            (*code).set_ic_target_is_object(true);
            let mut v = SlotCollector { slots: Vec::new(), code_targets: 0 };
            (*code).iterate_targets(&mut v);
            assert_eq!(v.code_targets, 0);
            assert_eq!(v.slots.len(), 2);
        }
    }

    // ── Symbol table ───────────────────────────────────────────────

    #[test]
    fn symbol_table_prefix_and_elements() {
        let a = arena(InstanceType::SymbolTable, VARIABLE_SIZE);
        let obj = a.object();
        unsafe {
            FixedArray::init(
                obj.address() as *mut FixedArray,
                a.map_addr(),
                SymbolTable::PREFIX_ENTRIES + 4,
                Value::from_i64(0),
            );
            let table = &mut *SymbolTable::assume_marked(obj);
            assert_eq!(table.capacity(), 4);

            table.set_element_count(3);
            table.elements_removed(2);
            assert_eq!(table.element_count(), 1);

            let mut v = SlotCollector { slots: Vec::new(), code_targets: 0 };
            table.iterate_prefix(&mut v);
            assert_eq!(v.slots.len(), SymbolTable::PREFIX_ENTRIES);

            let mut v = SlotCollector { slots: Vec::new(), code_targets: 0 };
            table.iterate_elements(&mut v);
            assert_eq!(v.slots.len(), 4);
        }
    }
}
