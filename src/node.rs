//! Fixed page layout: a common header followed by a leaf or internal body.
//!
//! Unlike a binary tree, each node in a B+ tree can have many children.
//! Leaf nodes hold keys paired with rows and are threaded into a singly
//! linked list (`next_leaf`) so range scans never have to walk back up
//! through internal nodes. Internal nodes hold `⟨key, child⟩` cells plus a
//! dedicated `right_child` pointer, where cell `i`'s key is the *maximum*
//! key reachable under `cells[i].child`, not a separator.
//!
//! A `Node` is a thin view over a page's bytes (`Rc<RefCell<Page>>`), not an
//! owned copy — accessors borrow the cell for the duration of a single call
//! and return owned values, so nothing here outlives the page itself.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::{err, Error};
use crate::row::{Row, ROW_SIZE};

pub const PAGE_SIZE: usize = 4096;

const NODE_TYPE_OFFSET: usize = 0;
const NODE_TYPE_SIZE: usize = 1;
const IS_ROOT_OFFSET: usize = NODE_TYPE_OFFSET + NODE_TYPE_SIZE;
const IS_ROOT_SIZE: usize = 1;
const PARENT_OFFSET: usize = IS_ROOT_OFFSET + IS_ROOT_SIZE;
const PARENT_SIZE: usize = 4;
const COMMON_HEADER_SIZE: usize = PARENT_OFFSET + PARENT_SIZE;

const LEAF_NEXT_LEAF_OFFSET: usize = COMMON_HEADER_SIZE;
const LEAF_NEXT_LEAF_SIZE: usize = 4;
const LEAF_NUM_CELLS_OFFSET: usize = LEAF_NEXT_LEAF_OFFSET + LEAF_NEXT_LEAF_SIZE;
const LEAF_NUM_CELLS_SIZE: usize = 4;
const LEAF_HEADER_SIZE: usize = LEAF_NUM_CELLS_OFFSET + LEAF_NUM_CELLS_SIZE;

const LEAF_KEY_SIZE: usize = 4;
pub const LEAF_CELL_SIZE: usize = LEAF_KEY_SIZE + ROW_SIZE;
const LEAF_SPACE_FOR_CELLS: usize = PAGE_SIZE - LEAF_HEADER_SIZE;
pub const LEAF_MAX_CELLS: usize = LEAF_SPACE_FOR_CELLS / LEAF_CELL_SIZE;
pub const LEAF_RIGHT_SPLIT_COUNT: usize = (LEAF_MAX_CELLS + 1) / 2;
pub const LEAF_LEFT_SPLIT_COUNT: usize = (LEAF_MAX_CELLS + 1) - LEAF_RIGHT_SPLIT_COUNT;

const INTERNAL_NUM_KEYS_OFFSET: usize = COMMON_HEADER_SIZE;
const INTERNAL_NUM_KEYS_SIZE: usize = 4;
const INTERNAL_RIGHT_CHILD_OFFSET: usize = INTERNAL_NUM_KEYS_OFFSET + INTERNAL_NUM_KEYS_SIZE;
const INTERNAL_RIGHT_CHILD_SIZE: usize = 4;
const INTERNAL_HEADER_SIZE: usize = INTERNAL_RIGHT_CHILD_OFFSET + INTERNAL_RIGHT_CHILD_SIZE;

const INTERNAL_KEY_SIZE: usize = 4;
const INTERNAL_CHILD_SIZE: usize = 4;
pub const INTERNAL_CELL_SIZE: usize = INTERNAL_CHILD_SIZE + INTERNAL_KEY_SIZE;
const INTERNAL_SPACE_FOR_CELLS: usize = PAGE_SIZE - INTERNAL_HEADER_SIZE;
pub const INTERNAL_MAX_CELLS: usize = INTERNAL_SPACE_FOR_CELLS / INTERNAL_CELL_SIZE;

/// Sentinel used for an internal node's `right_child` before it has one.
pub const INVALID_PAGE_NUM: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Internal,
}

/// Raw page storage. Lives behind `Rc<RefCell<_>>` in the pager's cache so
/// several `Node` views (different pages) can be held at once while still
/// letting each page be mutated through a short-lived borrow.
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    pub fn zeroed() -> Self {
        Page([0u8; PAGE_SIZE])
    }
}

pub type PageHandle = Rc<RefCell<Page>>;

#[derive(Clone)]
pub struct Node {
    page: PageHandle,
}

impl Node {
    pub fn new(page: PageHandle) -> Self {
        Node { page }
    }

    pub fn handle(&self) -> PageHandle {
        self.page.clone()
    }

    fn byte(&self, offset: usize) -> u8 {
        self.page.borrow().0[offset]
    }

    fn set_byte(&self, offset: usize, value: u8) {
        self.page.borrow_mut().0[offset] = value;
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let data = self.page.borrow();
        u32::from_le_bytes(data.0[offset..offset + 4].try_into().unwrap())
    }

    fn set_u32_at(&self, offset: usize, value: u32) {
        let mut data = self.page.borrow_mut();
        data.0[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    // --- common header ---

    pub fn node_type(&self) -> Result<NodeType, Error> {
        match self.byte(NODE_TYPE_OFFSET) {
            0 => Ok(NodeType::Leaf),
            1 => Ok(NodeType::Internal),
            other => Err(err!(Corrupted, "invalid node type byte: {}", other)),
        }
    }

    pub fn set_node_type(&self, ty: NodeType) {
        self.set_byte(NODE_TYPE_OFFSET, matches!(ty, NodeType::Internal) as u8);
    }

    pub fn is_root(&self) -> bool {
        self.byte(IS_ROOT_OFFSET) == 1
    }

    pub fn set_is_root(&self, is_root: bool) {
        self.set_byte(IS_ROOT_OFFSET, is_root as u8);
    }

    pub fn parent(&self) -> u32 {
        self.u32_at(PARENT_OFFSET)
    }

    pub fn set_parent(&self, parent: u32) {
        self.set_u32_at(PARENT_OFFSET, parent);
    }

    // --- leaf body ---

    pub fn leaf_num_cells(&self) -> u32 {
        self.u32_at(LEAF_NUM_CELLS_OFFSET)
    }

    pub fn set_leaf_num_cells(&self, num: u32) {
        self.set_u32_at(LEAF_NUM_CELLS_OFFSET, num);
    }

    pub fn leaf_next_leaf(&self) -> u32 {
        self.u32_at(LEAF_NEXT_LEAF_OFFSET)
    }

    pub fn set_leaf_next_leaf(&self, next: u32) {
        self.set_u32_at(LEAF_NEXT_LEAF_OFFSET, next);
    }

    fn leaf_cell_offset(&self, cell: usize) -> usize {
        LEAF_HEADER_SIZE + cell * LEAF_CELL_SIZE
    }

    pub fn leaf_key(&self, cell: usize) -> u32 {
        self.u32_at(self.leaf_cell_offset(cell))
    }

    pub fn set_leaf_key(&self, cell: usize, key: u32) {
        self.set_u32_at(self.leaf_cell_offset(cell), key);
    }

    pub fn leaf_row(&self, cell: usize) -> Row {
        let offset = self.leaf_cell_offset(cell) + LEAF_KEY_SIZE;
        let data = self.page.borrow();
        let bytes: [u8; ROW_SIZE] = data.0[offset..offset + ROW_SIZE].try_into().unwrap();
        Row::decode(&bytes)
    }

    pub fn set_leaf_row(&self, cell: usize, row: &Row) {
        let offset = self.leaf_cell_offset(cell) + LEAF_KEY_SIZE;
        let mut data = self.page.borrow_mut();
        data.0[offset..offset + ROW_SIZE].copy_from_slice(&row.encode());
    }

    /// Raw bytes of cell `cell` (key + row), for shifting cells during
    /// inserts and splits without decoding/re-encoding the row.
    pub fn leaf_cell_bytes(&self, cell: usize) -> [u8; LEAF_CELL_SIZE] {
        let offset = self.leaf_cell_offset(cell);
        let data = self.page.borrow();
        data.0[offset..offset + LEAF_CELL_SIZE].try_into().unwrap()
    }

    pub fn set_leaf_cell_bytes(&self, cell: usize, bytes: &[u8; LEAF_CELL_SIZE]) {
        let offset = self.leaf_cell_offset(cell);
        let mut data = self.page.borrow_mut();
        data.0[offset..offset + LEAF_CELL_SIZE].copy_from_slice(bytes);
    }

    // --- internal body ---

    pub fn internal_num_keys(&self) -> u32 {
        self.u32_at(INTERNAL_NUM_KEYS_OFFSET)
    }

    pub fn set_internal_num_keys(&self, num: u32) {
        self.set_u32_at(INTERNAL_NUM_KEYS_OFFSET, num);
    }

    pub fn internal_right_child(&self) -> u32 {
        self.u32_at(INTERNAL_RIGHT_CHILD_OFFSET)
    }

    pub fn set_internal_right_child(&self, page_num: u32) {
        self.set_u32_at(INTERNAL_RIGHT_CHILD_OFFSET, page_num);
    }

    fn internal_cell_offset(&self, cell: u32) -> usize {
        INTERNAL_HEADER_SIZE + cell as usize * INTERNAL_CELL_SIZE
    }

    pub fn internal_key(&self, cell: u32) -> u32 {
        self.u32_at(self.internal_cell_offset(cell) + INTERNAL_CHILD_SIZE)
    }

    pub fn set_internal_key(&self, cell: u32, key: u32) {
        self.set_u32_at(self.internal_cell_offset(cell) + INTERNAL_CHILD_SIZE, key);
    }

    pub fn internal_cell_child(&self, cell: u32) -> u32 {
        self.u32_at(self.internal_cell_offset(cell))
    }

    pub fn set_internal_cell_child(&self, cell: u32, child: u32) {
        self.set_u32_at(self.internal_cell_offset(cell), child);
    }

    /// Child pointer for cell `i` in `0..=num_keys`: the rightmost index
    /// (`i == num_keys`) is the dedicated `right_child`, everything else is
    /// `cells[i].child`.
    pub fn internal_child(&self, i: u32) -> u32 {
        if i == self.internal_num_keys() {
            self.internal_right_child()
        } else {
            self.internal_cell_child(i)
        }
    }

    pub fn internal_cell_bytes(&self, cell: u32) -> [u8; INTERNAL_CELL_SIZE] {
        let offset = self.internal_cell_offset(cell);
        let data = self.page.borrow();
        data.0[offset..offset + INTERNAL_CELL_SIZE]
            .try_into()
            .unwrap()
    }

    pub fn set_internal_cell_bytes(&self, cell: u32, bytes: &[u8; INTERNAL_CELL_SIZE]) {
        let offset = self.internal_cell_offset(cell);
        let mut data = self.page.borrow_mut();
        data.0[offset..offset + INTERNAL_CELL_SIZE].copy_from_slice(bytes);
    }

    // --- shared ---

    pub fn max_key(&self) -> Result<u32, Error> {
        match self.node_type()? {
            NodeType::Leaf => {
                let n = self.leaf_num_cells();
                if n == 0 {
                    return Err(err!(Corrupted, "empty leaf has no max key"));
                }
                Ok(self.leaf_key(n as usize - 1))
            }
            NodeType::Internal => Ok(self.internal_key(self.internal_num_keys() - 1)),
        }
    }

    pub fn init_leaf(&self) {
        self.set_node_type(NodeType::Leaf);
        self.set_is_root(false);
        self.set_leaf_num_cells(0);
        self.set_leaf_next_leaf(0);
    }

    pub fn init_internal(&self) {
        self.set_node_type(NodeType::Internal);
        self.set_is_root(false);
        self.set_internal_num_keys(0);
        self.set_internal_right_child(INVALID_PAGE_NUM);
    }

    /// Overwrites this page's bytes with `other`'s, used when the old root
    /// is demoted into a freshly allocated left child during a root split.
    pub fn copy_from(&self, other: &Node) {
        let src = other.page.borrow().0;
        self.page.borrow_mut().0 = src;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Node {
        Node::new(Rc::new(RefCell::new(Page::zeroed())))
    }

    #[test]
    fn test_leaf_header_round_trip() {
        let node = fresh();
        node.init_leaf();
        node.set_leaf_next_leaf(7);
        node.set_leaf_num_cells(3);
        node.set_parent(2);
        assert_eq!(node.node_type().unwrap(), NodeType::Leaf);
        assert_eq!(node.leaf_next_leaf(), 7);
        assert_eq!(node.leaf_num_cells(), 3);
        assert_eq!(node.parent(), 2);
    }

    #[test]
    fn test_leaf_cell_round_trip() {
        let node = fresh();
        node.init_leaf();
        let row = Row::new(42, b"k", b"v").unwrap();
        node.set_leaf_key(0, 42);
        node.set_leaf_row(0, &row);
        assert_eq!(node.leaf_key(0), 42);
        assert_eq!(node.leaf_row(0), row);
    }

    #[test]
    fn test_internal_child_falls_back_to_right_child() {
        let node = fresh();
        node.init_internal();
        node.set_internal_num_keys(1);
        node.set_internal_cell_child(0, 5);
        node.set_internal_key(0, 100);
        node.set_internal_right_child(9);
        assert_eq!(node.internal_child(0), 5);
        assert_eq!(node.internal_child(1), 9);
    }

    #[test]
    fn test_copy_from_clones_bytes() {
        let src = fresh();
        src.init_leaf();
        src.set_leaf_num_cells(4);
        let dst = fresh();
        dst.copy_from(&src);
        assert_eq!(dst.leaf_num_cells(), 4);
    }

    #[test]
    fn test_derived_cell_counts_fit_page() {
        assert!(LEAF_HEADER_SIZE + LEAF_MAX_CELLS * LEAF_CELL_SIZE <= PAGE_SIZE);
        assert!(INTERNAL_HEADER_SIZE + INTERNAL_MAX_CELLS * INTERNAL_CELL_SIZE <= PAGE_SIZE);
        assert_eq!(LEAF_LEFT_SPLIT_COUNT + LEAF_RIGHT_SPLIT_COUNT, LEAF_MAX_CELLS + 1);
    }
}
