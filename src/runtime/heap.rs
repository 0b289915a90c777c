use crate::runtime::{
    table::Table,
    value::{Function, Userdata},
};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Registry of every heap object the interpreter has allocated. Ownership
/// itself is shared `Rc`s inside `Value`; the registry only holds weak
/// handles, so an object dies exactly when the last `Value` referencing it
/// is dropped. Reference cycles between tables and closures are not
/// collected.
#[derive(Default)]
pub struct Heap {
    tables: RefCell<Vec<Weak<RefCell<Table>>>>,
    functions: RefCell<Vec<Weak<Function>>>,
    userdata: RefCell<Vec<Weak<Userdata>>>,
    allocations: RefCell<u64>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_table(&self, table: Table) -> Rc<RefCell<Table>> {
        let rc = Rc::new(RefCell::new(table));
        self.tables.borrow_mut().push(Rc::downgrade(&rc));
        *self.allocations.borrow_mut() += 1;
        rc
    }

    pub fn alloc_function(&self, function: Function) -> Rc<Function> {
        let rc = Rc::new(function);
        self.functions.borrow_mut().push(Rc::downgrade(&rc));
        *self.allocations.borrow_mut() += 1;
        rc
    }

    pub fn alloc_userdata(&self) -> Rc<Userdata> {
        let rc = Rc::new(Userdata);
        self.userdata.borrow_mut().push(Rc::downgrade(&rc));
        *self.allocations.borrow_mut() += 1;
        rc
    }

    /// Drops registry entries whose objects have already been freed.
    pub fn sweep(&self) {
        self.tables.borrow_mut().retain(|w| w.strong_count() > 0);
        self.functions.borrow_mut().retain(|w| w.strong_count() > 0);
        self.userdata.borrow_mut().retain(|w| w.strong_count() > 0);
    }

    pub fn live_tables(&self) -> usize {
        self.tables
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn live_functions(&self) -> usize {
        self.functions
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn live_userdata(&self) -> usize {
        self.userdata
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn allocations(&self) -> u64 {
        *self.allocations.borrow()
    }

    pub fn dump(&self) -> String {
        format!(
            "Heap: {} tables, {} functions, {} userdata live ({} allocated)",
            self.live_tables(),
            self.live_functions(),
            self.live_userdata(),
            self.allocations()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_counts_follow_ownership() {
        let heap = Heap::new();
        assert_eq!(heap.live_tables(), 0);
        let table = heap.alloc_table(Table::new());
        assert_eq!(heap.live_tables(), 1);
        assert_eq!(heap.allocations(), 1);
        drop(table);
        assert_eq!(heap.live_tables(), 0);
    }

    #[test]
    fn clones_share_one_object() {
        let heap = Heap::new();
        let table = heap.alloc_table(Table::new());
        let alias = table.clone();
        assert_eq!(heap.live_tables(), 1);
        drop(table);
        assert_eq!(heap.live_tables(), 1);
        drop(alias);
        assert_eq!(heap.live_tables(), 0);
    }

    #[test]
    fn sweep_trims_dead_entries() {
        let heap = Heap::new();
        for _ in 0..8 {
            let _ = heap.alloc_table(Table::new());
        }
        heap.sweep();
        assert!(heap.tables.borrow().is_empty());
        assert_eq!(heap.allocations(), 8);
    }
}
