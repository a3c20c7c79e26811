//! `EventMatrix`: the per-descriptor, per-event cpu×thread grid (spec.md
//! §3).

use crate::event::EventObject;

/// Two-dimensional collection of `EventObject`s indexed by (cpu, thread),
/// or thread = -1 for system-wide (spec.md §3 `EventMatrix`). Cells are
/// created iff `perf_event_open` succeeded for that (cpu, thread) pair;
/// on any registration failure the caller must close everything already
/// opened (spec.md §3 invariant, enforced by `Registry::open`).
pub struct EventMatrix {
    pub event_name: String,
    cells: Vec<((i32, i32), EventObject)>,
}

impl EventMatrix {
    pub fn new(event_name: impl Into<String>) -> Self {
        EventMatrix {
            event_name: event_name.into(),
            cells: Vec::new(),
        }
    }

    pub fn insert(&mut self, cpu: i32, tid: i32, object: EventObject) {
        self.cells.push(((cpu, tid), object));
    }

    pub fn iter(&self) -> impl Iterator<Item = &((i32, i32), EventObject)> {
        self.cells.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ((i32, i32), EventObject)> {
        self.cells.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_matrix_is_empty() {
        let matrix = EventMatrix::new("cycles");
        assert!(matrix.is_empty());
        assert_eq!(matrix.len(), 0);
    }
}
