use crate::language::ast::BlockId;
use crate::runtime::value::{Slot, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Locals of one function activation, grouped by the block that declared
/// them. Stores are created when a block is entered and dropped when it
/// exits, whatever the exit path.
#[derive(Debug, Default)]
pub struct Frame {
    stores: HashMap<BlockId, BTreeMap<String, Slot>>,
}

impl Frame {
    pub fn ensure_store(&mut self, block: BlockId) {
        self.stores.entry(block).or_default();
    }

    pub fn remove_store(&mut self, block: BlockId) {
        self.stores.remove(&block);
    }

    pub fn store(&self, block: BlockId) -> Option<&BTreeMap<String, Slot>> {
        self.stores.get(&block)
    }

    pub fn declare(&mut self, block: BlockId, name: &str, value: Value) -> Slot {
        let slot: Slot = Rc::new(RefCell::new(value));
        self.stores
            .entry(block)
            .or_default()
            .insert(name.to_string(), slot.clone());
        slot
    }

    pub fn slot(&self, block: BlockId, name: &str) -> Option<Slot> {
        self.stores.get(&block).and_then(|s| s.get(name)).cloned()
    }

    /// Drops every binding of the block except the named one; the numeric
    /// for loop keeps its counter across iterations.
    pub fn clear_store_except(&mut self, block: BlockId, keep: &str) {
        if let Some(store) = self.stores.get_mut(&block) {
            store.retain(|name, _| name == keep);
        }
    }

    pub fn clear_store(&mut self, block: BlockId) {
        if let Some(store) = self.stores.get_mut(&block) {
            store.clear();
        }
    }
}

/// The frame stack plus the process-wide globals. The chunk runs as the
/// first activation.
#[derive(Debug, Default)]
pub struct Environment {
    frames: Vec<Frame>,
    globals: BTreeMap<String, Slot>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_at(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn global_slot(&self, name: &str) -> Option<Slot> {
        self.globals.get(name).cloned()
    }

    /// Fetch-or-create, for assignment position.
    pub fn define_global(&mut self, name: &str) -> Slot {
        self.globals
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(RefCell::new(Value::Nil)))
            .clone()
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let slot = self.define_global(name);
        *slot.borrow_mut() = value;
    }

    pub fn globals(&self) -> impl Iterator<Item = (&String, &Slot)> {
        self.globals.iter()
    }
}
