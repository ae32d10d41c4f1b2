use crate::objects::{HeapObject, RelocEntry};
use crate::Value;

/// Callback interface for walking heap-object bodies.
///
/// [`HeapObject::iterate_body`] dispatches each field of an object to
/// the capability relevant to that field's kind: ordinary tagged slots
/// go through [`visit_pointer`](Self::visit_pointer), call-site targets
/// inside code objects through the code-target hooks. Each collection
/// phase supplies its own implementation; unneeded hooks default to
/// no-ops.
pub trait ObjectVisitor {
    /// Visit a single tagged slot.
    ///
    /// # Safety
    ///
    /// `slot` must point to a live, writable `Value`.
    unsafe fn visit_pointer(&mut self, slot: *mut Value);

    /// Visit the slots in `[start, end)`.
    ///
    /// # Safety
    ///
    /// The range must consist of live, writable `Value` slots.
    unsafe fn visit_pointers(&mut self, start: *mut Value, end: *mut Value) {
        let mut p = start;
        while p < end {
            // SAFETY: p stays within [start, end)
            unsafe {
                self.visit_pointer(p);
                p = p.add(1);
            }
        }
    }

    /// Visit a call-site entry of `code` whose target is a derived
    /// (entry-point) address.
    ///
    /// # Safety
    ///
    /// `entry` must be a relocation entry of `code` in address form.
    unsafe fn visit_code_target(&mut self, code: HeapObject, entry: *mut RelocEntry) {
        let _ = (code, entry);
    }

    /// Visit a debugger-inserted call site of `code`.
    ///
    /// # Safety
    ///
    /// `entry` must be a relocation entry of `code` in address form.
    unsafe fn visit_debug_target(&mut self, code: HeapObject, entry: *mut RelocEntry) {
        let _ = (code, entry);
    }

    /// Called before the call-site entries of `code` are dispatched.
    fn begin_code_iteration(&mut self, code: HeapObject) {
        let _ = code;
    }

    /// Called after the call-site entries of `code` were dispatched.
    fn end_code_iteration(&mut self, code: HeapObject) {
        let _ = code;
    }
}
