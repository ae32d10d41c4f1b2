//! Global handles: slots outside the heap that the embedder holds onto
//! across collections, with optional weakness, plus object groups.

use object::{ObjectVisitor, Value};

/// Invoked for a weak handle whose referent did not survive marking.
/// Receives the dying value; the handle itself is retired afterwards.
pub type WeakCallback = fn(Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Normal,
    Weak,
    /// Weak, referent unmarked — the callback fires during the next
    /// weak-root iteration, then the node is retired.
    Pending,
    Free,
}

struct Node {
    object: Value,
    state: NodeState,
    callback: Option<WeakCallback>,
}

/// Identifier of a global handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalHandle(usize);

/// A set of handles with "all live if any live" semantics, imposed by
/// ownership relationships the heap cannot see.
pub struct ObjectGroup {
    pub objects: Vec<GlobalHandle>,
}

#[derive(Default)]
pub struct GlobalHandles {
    nodes: Vec<Node>,
    object_groups: Vec<Option<ObjectGroup>>,
}

impl GlobalHandles {
    pub fn new() -> GlobalHandles {
        GlobalHandles::default()
    }

    pub fn create(&mut self, object: Value) -> GlobalHandle {
        if let Some(index) =
            self.nodes.iter().position(|n| n.state == NodeState::Free)
        {
            self.nodes[index] =
                Node { object, state: NodeState::Normal, callback: None };
            return GlobalHandle(index);
        }
        self.nodes.push(Node {
            object,
            state: NodeState::Normal,
            callback: None,
        });
        GlobalHandle(self.nodes.len() - 1)
    }

    pub fn destroy(&mut self, handle: GlobalHandle) {
        self.nodes[handle.0].state = NodeState::Free;
    }

    /// Demote a handle to weak. `callback` fires if the referent dies.
    pub fn make_weak(&mut self, handle: GlobalHandle, callback: Option<WeakCallback>) {
        let node = &mut self.nodes[handle.0];
        debug_assert!(node.state != NodeState::Free);
        node.state = NodeState::Weak;
        node.callback = callback;
    }

    /// Current value of a handle. Returns `None` once the handle has
    /// been retired by a weak-death callback or `destroy`.
    pub fn get(&self, handle: GlobalHandle) -> Option<Value> {
        let node = &self.nodes[handle.0];
        (node.state != NodeState::Free).then_some(node.object)
    }

    /// Visit every strong handle slot.
    pub fn iterate_strong_roots<V: ObjectVisitor>(&mut self, visitor: &mut V) {
        for node in &mut self.nodes {
            if node.state == NodeState::Normal {
                // SAFETY: the node slot is a live Value location
                unsafe { visitor.visit_pointer(&mut node.object) };
            }
        }
    }

    /// Flag weak handles whose referent the predicate reports as dead.
    pub fn mark_weak_roots(&mut self, must_be_marked: impl Fn(Value) -> bool) {
        for node in &mut self.nodes {
            if node.state == NodeState::Weak && must_be_marked(node.object) {
                node.state = NodeState::Pending;
            }
        }
    }

    /// Fire death callbacks for pending handles and retire them, then
    /// visit the surviving weak slots as strong.
    pub fn iterate_weak_roots<V: ObjectVisitor>(&mut self, visitor: &mut V) {
        for node in &mut self.nodes {
            match node.state {
                NodeState::Pending => {
                    let object = node.object;
                    node.state = NodeState::Free;
                    if let Some(callback) = node.callback.take() {
                        callback(object);
                    }
                }
                NodeState::Weak => {
                    // SAFETY: the node slot is a live Value location
                    unsafe { visitor.visit_pointer(&mut node.object) };
                }
                NodeState::Normal | NodeState::Free => {}
            }
        }
    }

    // ── Object groups ──────────────────────────────────────────────

    pub fn add_object_group(&mut self, handles: Vec<GlobalHandle>) {
        self.object_groups.push(Some(ObjectGroup { objects: handles }));
    }

    pub fn object_groups(&mut self) -> &mut Vec<Option<ObjectGroup>> {
        &mut self.object_groups
    }

    pub fn remove_object_groups(&mut self) {
        self.object_groups.clear();
    }

    /// Value of a group member's handle slot.
    pub fn handle_value(&self, handle: GlobalHandle) -> Value {
        self.nodes[handle.0].object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingVisitor {
        visited: Vec<u64>,
    }

    impl ObjectVisitor for CountingVisitor {
        unsafe fn visit_pointer(&mut self, slot: *mut Value) {
            // SAFETY: slots handed out by GlobalHandles are valid
            self.visited.push(unsafe { (*slot).raw() });
        }
    }

    #[test]
    fn strong_handles_are_iterated() {
        let mut handles = GlobalHandles::new();
        let a = handles.create(Value::from_i64(10));
        let _b = handles.create(Value::from_i64(20));
        handles.destroy(a);

        let mut v = CountingVisitor { visited: Vec::new() };
        handles.iterate_strong_roots(&mut v);
        assert_eq!(v.visited, vec![Value::from_i64(20).raw()]);
    }

    #[test]
    fn weak_handle_death_retires_node() {
        let mut handles = GlobalHandles::new();
        let h = handles.create(Value::from_i64(42));
        handles.make_weak(h, None);

        // Predicate says the referent still needs marking: it is dead.
        handles.mark_weak_roots(|_| true);

        let mut v = CountingVisitor { visited: Vec::new() };
        handles.iterate_weak_roots(&mut v);
        assert!(v.visited.is_empty());
        assert_eq!(handles.get(h), None);
    }

    #[test]
    fn weak_survivor_is_visited() {
        let mut handles = GlobalHandles::new();
        let h = handles.create(Value::from_i64(42));
        handles.make_weak(h, None);

        handles.mark_weak_roots(|_| false);

        let mut v = CountingVisitor { visited: Vec::new() };
        handles.iterate_weak_roots(&mut v);
        assert_eq!(v.visited.len(), 1);
        assert!(handles.get(h).is_some());
    }
}
