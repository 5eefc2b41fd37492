//! # cidr-collapse
//!
//! Minimal CIDR cover of a set of IPv4 addresses, using a collapsing binary trie.
//!
//! Addresses, inclusive ranges and CIDR blocks are inserted into a depth-32
//! binary trie over the address space. Subtrees that are entirely absent or
//! entirely present are never materialized: their slots hold one of two
//! sentinels instead. Whenever both halves of a node become fully present the
//! node collapses into its parent slot, so walking the trie in order yields
//! the smallest list of CIDR blocks covering exactly the inserted addresses.
//!
//! ## Example
//!
//! ```rust
//! use cidr_collapse::{Block, CidrTrie};
//!
//! let mut trie = CidrTrie::new();
//! trie.insert_cidr(0x0A00_0000, 25); // 10.0.0.0/25
//! trie.insert_cidr(0x0A00_0080, 25); // 10.0.0.128/25
//!
//! assert!(trie.contains(0x0A00_00FF));
//! assert_eq!(trie.emit_blocks(), vec![Block::new(0x0A00_0000, 24)]);
//! assert_eq!(trie.emit_blocks()[0].to_string(), "10.0.0.0/24");
//! ```

use std::fmt;
use std::net::Ipv4Addr;

pub mod parse;

pub use parse::{Entry, ParseError, ParseErrorKind, Parser};

// =============================================================================
// Configuration
// =============================================================================

/// Bit index decided at the root slot.
const ROOT_BIT: i32 = 31;
/// Number of addresses in the IPv4 space.
const SPACE_SIZE: u64 = 1 << 32;
/// Widest prefix length (a single host).
pub const MAX_PREFIX_LEN: u8 = 32;

// =============================================================================
// Blocks
// =============================================================================

/// Netmask for a prefix length. `len == 0` is special-cased: shifting a `u32`
/// by 32 overflows.
#[inline]
fn netmask(len: u8) -> u32 {
    debug_assert!(len <= MAX_PREFIX_LEN);
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

/// Prefix length of the block committed at `stop` (see [`CidrTrie::add`]).
#[inline]
fn stop_to_len(stop: i32) -> u8 {
    debug_assert!((-1..=ROOT_BIT).contains(&stop));
    (ROOT_BIT - stop) as u8
}

#[inline]
fn len_to_stop(len: u8) -> i32 {
    ROOT_BIT - i32::from(len)
}

/// A CIDR block: a network address with all host bits cleared, plus its prefix length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    addr: u32,
    len: u8,
}

impl Block {
    /// Block of prefix length `len` containing `addr`. Host bits of `addr` are
    /// cleared.
    ///
    /// # Panics
    ///
    /// Panics if `len` is greater than 32.
    pub fn new(addr: u32, len: u8) -> Self {
        assert!(
            len <= MAX_PREFIX_LEN,
            "prefix length {len} exceeds {MAX_PREFIX_LEN}"
        );
        Self {
            addr: addr & netmask(len),
            len,
        }
    }

    /// The `/32` block holding a single address.
    #[inline]
    pub fn host(addr: u32) -> Self {
        Self {
            addr,
            len: MAX_PREFIX_LEN,
        }
    }

    #[inline]
    pub fn addr(&self) -> u32 {
        self.addr
    }

    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    #[inline]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }

    #[inline]
    pub fn first(&self) -> u32 {
        self.addr
    }

    /// Last address in the block (inclusive).
    #[inline]
    pub fn last(&self) -> u32 {
        self.addr | !netmask(self.len)
    }

    /// Number of addresses covered.
    #[inline]
    pub fn size(&self) -> u64 {
        SPACE_SIZE >> self.len
    }

    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        addr & netmask(self.len) == self.addr
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.len)
    }
}

impl From<Block> for (Ipv4Addr, u8) {
    fn from(block: Block) -> Self {
        (block.network(), block.len)
    }
}

// =============================================================================
// Range decomposition
// =============================================================================

/// Decompose `[lo, hi]` into the fewest aligned CIDR blocks, in ascending order.
///
/// At every step the cursor starts the largest block its alignment allows,
/// halved until it no longer passes `hi`. The cursor is kept in `u64` so a
/// range ending at `255.255.255.255` terminates by exhaustion.
///
/// # Panics
///
/// Panics if `lo > hi`.
pub fn range_blocks(lo: u32, hi: u32) -> RangeBlocks {
    assert!(lo <= hi, "range ends reversed: {lo} > {hi}");
    RangeBlocks {
        cursor: u64::from(lo),
        end: u64::from(hi),
    }
}

/// Iterator returned by [`range_blocks`].
#[derive(Clone, Debug)]
pub struct RangeBlocks {
    cursor: u64,
    end: u64,
}

impl Iterator for RangeBlocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.cursor > self.end {
            return None;
        }

        let mut size = if self.cursor == 0 {
            SPACE_SIZE
        } else {
            1u64 << self.cursor.trailing_zeros()
        };
        while self.cursor + size - 1 > self.end {
            size >>= 1;
        }

        // size is a power of two in 1..=2^32, so the exponent fits 0..=32.
        let len = (32 - size.trailing_zeros()) as u8;
        let block = Block {
            addr: self.cursor as u32,
            len,
        };
        self.cursor += size;
        Some(block)
    }
}

impl std::iter::FusedIterator for RangeBlocks {}

// =============================================================================
// Pointer type
// =============================================================================

/// Slot value: a node index into the arena, or one of two sentinels.
///
/// - `NONE`: every address below this slot is absent
/// - `ALL`: every address below this slot is present
///
/// Sentinels are reserved values at the top of the index space and are
/// compared by value, never dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Ptr(u32);

impl Ptr {
    const NONE: Ptr = Ptr(u32::MAX);
    const ALL: Ptr = Ptr(u32::MAX - 1);
    /// Node indices must stay below the sentinels.
    const MAX_NODES: u32 = u32::MAX - 1;

    #[inline]
    fn node(idx: u32) -> Self {
        debug_assert!(idx < Self::MAX_NODES);
        Self(idx)
    }

    #[inline]
    fn is_node(self) -> bool {
        self.0 < Self::MAX_NODES
    }

    #[inline]
    fn node_idx(self) -> usize {
        debug_assert!(self.is_node());
        self.0 as usize
    }
}

// =============================================================================
// Node arena
// =============================================================================

/// Arena of binary nodes with a free list of released slots.
#[derive(Clone)]
struct NodeArena {
    nodes: Vec<[Ptr; 2]>,
    free: Vec<u32>,
}

impl NodeArena {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    fn with_capacity(cap: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(cap),
            free: Vec::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.nodes.capacity() * std::mem::size_of::<[Ptr; 2]>()
            + self.free.capacity() * std::mem::size_of::<u32>()
    }

    fn shrink_to_fit(&mut self) {
        self.nodes.shrink_to_fit();
        self.free.shrink_to_fit();
    }

    /// Number of live (allocated and not released) nodes.
    #[inline]
    fn live(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Allocate a node with both children `NONE`.
    fn alloc(&mut self) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = [Ptr::NONE; 2];
            return idx;
        }
        let idx = self.nodes.len();
        assert!(
            idx < Ptr::MAX_NODES as usize,
            "node arena exhausted at {idx} nodes"
        );
        self.nodes.push([Ptr::NONE; 2]);
        idx as u32
    }

    #[inline]
    fn child(&self, idx: usize, side: usize) -> Ptr {
        self.nodes[idx][side]
    }

    #[inline]
    fn set_child(&mut self, idx: usize, side: usize, ptr: Ptr) {
        self.nodes[idx][side] = ptr;
    }

    #[inline]
    fn children(&self, idx: usize) -> [Ptr; 2] {
        self.nodes[idx]
    }

    /// Release a single node. Its children must already be released or sentinels.
    #[inline]
    fn release(&mut self, idx: usize) {
        self.free.push(idx as u32);
    }

    /// Release every node reachable from `ptr`.
    fn release_tree(&mut self, ptr: Ptr) {
        if !ptr.is_node() {
            return;
        }
        let mut stack = vec![ptr];
        while let Some(ptr) = stack.pop() {
            let idx = ptr.node_idx();
            for child in self.children(idx) {
                if child.is_node() {
                    stack.push(child);
                }
            }
            self.release(idx);
        }
    }

    /// Copy the subtree at `ptr` in `old` into `self`, parents before children.
    fn copy_subtree(&mut self, old: &NodeArena, ptr: Ptr) -> Ptr {
        if !ptr.is_node() {
            return ptr;
        }
        let idx = self.alloc();
        let [lo, hi] = old.children(ptr.node_idx());
        let lo = self.copy_subtree(old, lo);
        let hi = self.copy_subtree(old, hi);
        self.nodes[idx as usize] = [lo, hi];
        Ptr::node(idx)
    }
}

// =============================================================================
// CidrTrie
// =============================================================================

/// Set of IPv4 addresses stored as a collapsing binary trie.
///
/// Invariants, holding after every insertion:
/// - no node has both children `ALL` (it would have collapsed)
/// - no node has both children `NONE` (it would never have been allocated)
/// - every live node in the arena is reachable from the root
pub struct CidrTrie {
    nodes: NodeArena,
    root: Ptr,
}

impl CidrTrie {
    pub fn new() -> Self {
        Self {
            nodes: NodeArena::new(),
            root: Ptr::NONE,
        }
    }

    /// True if no address has been inserted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == Ptr::NONE
    }

    /// True if every IPv4 address is present.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.root == Ptr::ALL
    }

    /// Number of real nodes in the trie.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.live()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.nodes.capacity()
    }

    pub fn shrink_to_fit(&mut self) {
        self.nodes.shrink_to_fit();
    }

    /// Rebuild the node arena so it holds only live nodes, in depth-first order.
    ///
    /// Collapses leave holes in the arena that are only reused by later
    /// insertions. Returns the number of nodes rewritten.
    pub fn compact(&mut self) -> usize {
        let live = self.nodes.live();
        let old = std::mem::replace(&mut self.nodes, NodeArena::with_capacity(live));
        self.root = self.nodes.copy_subtree(&old, self.root);
        tracing::trace!(
            live,
            released = old.free.len(),
            "compacted node arena"
        );
        self.nodes.live()
    }
}

impl CidrTrie {
    /// Insert a single address.
    pub fn insert_address(&mut self, addr: u32) {
        self.insert_aligned(addr, -1);
    }

    /// Insert every address in `[lo, hi]`.
    ///
    /// # Panics
    ///
    /// Panics if `lo > hi`.
    pub fn insert_range(&mut self, lo: u32, hi: u32) {
        let mut inserted = 0usize;
        for block in range_blocks(lo, hi) {
            self.insert_block(block);
            inserted += 1;
        }
        tracing::trace!(lo, hi, blocks = inserted, "inserted range");
    }

    /// Insert the CIDR block `addr/prefix_len`. Host bits of `addr` are ignored.
    ///
    /// # Panics
    ///
    /// Panics if `prefix_len` is greater than 32.
    pub fn insert_cidr(&mut self, addr: u32, prefix_len: u8) {
        self.insert_block(Block::new(addr, prefix_len));
    }

    pub fn insert_block(&mut self, block: Block) {
        self.insert_aligned(block.addr, len_to_stop(block.len));
    }

    /// Insert a parsed input entry.
    pub fn insert_entry(&mut self, entry: &Entry) {
        match *entry {
            Entry::Address(addr) => self.insert_address(addr),
            Entry::Range(lo, hi) => self.insert_range(lo, hi),
            Entry::Cidr(block) => self.insert_block(block),
        }
    }

    #[inline]
    fn insert_aligned(&mut self, addr: u32, stop: i32) {
        self.root = self.add(self.root, addr, ROOT_BIT, stop);
    }

    /// Mark the aligned block of `2^(stop + 1)` addresses containing `addr` as
    /// present in the subtree at `ptr`, which decides bit `bit`. Returns the
    /// new value of the slot.
    ///
    /// A slot already `ALL` is left alone. Once `bit <= stop` the whole slot is
    /// committed to `ALL` and whatever subtree it held is released. Otherwise
    /// the walk descends (allocating a node if the slot was `NONE`), and on the
    /// way back up a node whose children are both `ALL` is released and
    /// replaced by `ALL`, which lets the caller collapse in turn.
    fn add(&mut self, ptr: Ptr, addr: u32, bit: i32, stop: i32) -> Ptr {
        if ptr == Ptr::ALL {
            return Ptr::ALL;
        }
        if bit <= stop {
            self.nodes.release_tree(ptr);
            return Ptr::ALL;
        }

        let idx = if ptr == Ptr::NONE {
            self.nodes.alloc() as usize
        } else {
            ptr.node_idx()
        };

        let side = ((addr >> bit) & 1) as usize;
        let child = self.nodes.child(idx, side);
        let child = self.add(child, addr, bit - 1, stop);
        self.nodes.set_child(idx, side, child);

        if self.nodes.children(idx) == [Ptr::ALL; 2] {
            self.nodes.release(idx);
            return Ptr::ALL;
        }
        Ptr::node(idx as u32)
    }
}

impl CidrTrie {
    /// True if `addr` is in the set.
    pub fn contains(&self, addr: u32) -> bool {
        let mut ptr = self.root;
        let mut bit = ROOT_BIT;
        loop {
            match ptr {
                Ptr::ALL => return true,
                Ptr::NONE => return false,
                _ => {}
            }
            debug_assert!(bit >= 0, "node below the last trie level");
            let side = ((addr >> bit) & 1) as usize;
            ptr = self.nodes.child(ptr.node_idx(), side);
            bit -= 1;
        }
    }

    /// Minimal CIDR blocks covering the set, in ascending address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            trie: self,
            stack: vec![(self.root, 0, ROOT_BIT)],
        }
    }

    /// Collect [`blocks`](Self::blocks) into a vector.
    pub fn emit_blocks(&self) -> Vec<Block> {
        self.blocks().collect()
    }

    /// Number of blocks in the minimal cover.
    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    /// Number of addresses in the set (up to 2^32).
    pub fn address_count(&self) -> u64 {
        self.blocks().map(|b| b.size()).sum()
    }
}

impl Default for CidrTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CidrTrie {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            root: self.root,
        }
    }
}

impl fmt::Debug for CidrTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for block in self.blocks() {
            list.entry(&format_args!("{block}"));
        }
        list.finish()
    }
}

impl Extend<Block> for CidrTrie {
    fn extend<I: IntoIterator<Item = Block>>(&mut self, iter: I) {
        for block in iter {
            self.insert_block(block);
        }
    }
}

impl FromIterator<Block> for CidrTrie {
    fn from_iter<I: IntoIterator<Item = Block>>(iter: I) -> Self {
        let mut trie = Self::new();
        trie.extend(iter);
        trie
    }
}

/// Depth-first iterator over the blocks of a [`CidrTrie`].
pub struct Blocks<'a> {
    trie: &'a CidrTrie,
    /// (slot, address bits accumulated so far, bit decided below this slot)
    stack: Vec<(Ptr, u32, i32)>,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        while let Some((ptr, acc, bit)) = self.stack.pop() {
            match ptr {
                Ptr::NONE => continue,
                Ptr::ALL => {
                    return Some(Block {
                        addr: acc,
                        len: stop_to_len(bit),
                    })
                }
                _ => {}
            }

            if bit < 0 {
                panic!("trie node found below the last address bit");
            }
            let [lo, hi] = self.trie.nodes.children(ptr.node_idx());
            // Upper half pushed first so the lower half comes out first.
            self.stack.push((hi, acc | (1 << bit), bit - 1));
            self.stack.push((lo, acc, bit - 1));
        }
        None
    }
}

impl std::iter::FusedIterator for Blocks<'_> {}


#[cfg(test)]
mod proptests;
