//! Positional iterator over a leaf's cells, crossing leaf boundaries via
//! `next_leaf` so a caller can walk the whole table in key order without
//! ever touching an internal node.

use crate::errors::Error;
use crate::node::Node;
use crate::pager::Pager;
use crate::row::Row;

/// `(page, cell)` always identifies a leaf; `end` is true once there is no
/// further cell to visit, whether because the leaf is empty or because
/// `advance` walked off the last leaf in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub page: u32,
    pub cell: u32,
    pub end: bool,
}

impl Cursor {
    pub fn value(&self, pager: &mut Pager) -> Result<Row, Error> {
        let node = Node::new(pager.get(self.page)?);
        Ok(node.leaf_row(self.cell as usize))
    }

    /// Moves to the next cell, following `next_leaf` when the current leaf
    /// is exhausted. Only sets `end` once `next_leaf == 0` — a cursor whose
    /// leaf is full does not stop at the leaf boundary, it keeps going.
    pub fn advance(&mut self, pager: &mut Pager) -> Result<(), Error> {
        let node = Node::new(pager.get(self.page)?);
        self.cell += 1;
        if self.cell >= node.leaf_num_cells() {
            let next = node.leaf_next_leaf();
            if next == 0 {
                self.end = true;
            } else {
                self.page = next;
                self.cell = 0;
            }
        }
        Ok(())
    }

    /// Inserts `row` at this cursor's `(page, cell)`, splitting the leaf
    /// (and, if needed, its ancestors) when it is already full. Delegates
    /// to the tree's leaf-insert algorithm, which owns all of the
    /// split/promote bookkeeping a single cursor position can't see.
    pub fn insert(&self, pager: &mut Pager, row: &Row) -> Result<(), Error> {
        crate::btree::leaf_insert(pager, self, row)
    }
}
