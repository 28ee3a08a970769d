//! Disk-resident B+ tree index.
//!
//! The tree maps variable-length byte keys to variable-length byte values
//! and persists across restarts through a single meta page whose id is the
//! only durable handle.
//!
//! ```text
//! Level 1: the root is a leaf.
//! Level N: root -> inner pages -> ... -> leaves (level counts down to 1).
//! ```
//!
//! Meta page layout:
//! ```text
//! Offset  Size  Field
//! 0       1     level_num (1 = root is a leaf)
//! 4       4     root page id
//! 8       8     tuple count
//! ```
//!
//! Inner pages hold `child || strict upper bound` slots plus one page id of
//! special region (the right-most child, which has no separator of its
//! own). Leaf pages hold `key_len || key || value` slots plus two page ids
//! of special region (prev and next leaf), forming a doubly linked chain
//! over all leaves in ascending key order with 0 as the end sentinel.
//!
//! Deletion never rebalances: a page is collapsed only once it is empty,
//! so a sparse workload can leave pages underfilled.

mod iter;
mod slot;

use std::cmp::Ordering;

use bytes::Bytes;
use log::debug;

use bramble_common::page::PageId;
use bramble_common::{BrambleError, Result};

use crate::page::{slot_capacity, PlainPage, SlotOrdering, SortedPage};
use crate::pager::PageManager;

pub use iter::TreeIter;
use slot::{InnerSlot, LeafSlot};

const META_LEVEL_OFFSET: usize = 0;
const META_ROOT_OFFSET: usize = 4;
const META_TUPLE_OFFSET: usize = 8;

/// Special region of an inner page: the right-most child.
const INNER_SPECIAL_LEN: usize = PageId::SIZE;

/// Special region of a leaf page: prev and next sibling.
const LEAF_SPECIAL_LEN: usize = 2 * PageId::SIZE;
const LEAF_PREV_OFFSET: usize = 0;
const LEAF_NEXT_OFFSET: usize = PageId::SIZE;

/// Largest encoded leaf entry the tree accepts. Capping entries at half a
/// leaf's capacity guarantees that a full page can always be split into two
/// fitting halves.
const fn max_entry_len() -> usize {
    slot_capacity(LEAF_SPECIAL_LEN) / 2
}

/// Total order over keys. The tree never interprets key bytes except
/// through this comparator; it is copied into the tree and must be cheap
/// and pure.
pub trait KeyComparator: Clone {
    /// Compares two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte order, with a u64-prefix fast path for longer keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        // For 8+ byte keys, compare the first 8 bytes as a big-endian u64
        // before falling back to slice comparison.
        if a.len() >= 8 && b.len() >= 8 {
            let a_prefix = u64::from_be_bytes([a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]]);
            let b_prefix = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            if a_prefix != b_prefix {
                return a_prefix.cmp(&b_prefix);
            }
        }
        a.cmp(b)
    }
}

/// Slot ordering for inner pages: order by the strict upper bound.
#[derive(Clone)]
pub(crate) struct InnerOrdering<C: KeyComparator> {
    cmp: C,
}

impl<C: KeyComparator> InnerOrdering<C> {
    pub(crate) fn new(cmp: C) -> Self {
        Self { cmp }
    }
}

impl<C: KeyComparator> SlotOrdering for InnerOrdering<C> {
    fn slot_vs_key(&self, slot: &[u8], key: &[u8]) -> Ordering {
        self.cmp.compare(InnerSlot::parse(slot).upper_bound, key)
    }

    fn slot_vs_slot(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.cmp
            .compare(InnerSlot::parse(a).upper_bound, InnerSlot::parse(b).upper_bound)
    }
}

/// Slot ordering for leaf pages: order by the key.
#[derive(Clone)]
pub(crate) struct LeafOrdering<C: KeyComparator> {
    cmp: C,
}

impl<C: KeyComparator> LeafOrdering<C> {
    pub(crate) fn new(cmp: C) -> Self {
        Self { cmp }
    }
}

impl<C: KeyComparator> SlotOrdering for LeafOrdering<C> {
    fn slot_vs_key(&self, slot: &[u8], key: &[u8]) -> Ordering {
        self.cmp.compare(LeafSlot::parse(slot).key, key)
    }

    fn slot_vs_slot(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.cmp.compare(LeafSlot::parse(a).key, LeafSlot::parse(b).key)
    }
}

pub(crate) type InnerPage<C> = SortedPage<InnerOrdering<C>>;
pub(crate) type LeafPage<C> = SortedPage<LeafOrdering<C>>;

pub(crate) fn leaf_prev<C: KeyComparator>(leaf: &LeafPage<C>) -> PageId {
    PageId::from_bytes(leaf.read_special(LEAF_PREV_OFFSET, PageId::SIZE))
}

pub(crate) fn leaf_next<C: KeyComparator>(leaf: &LeafPage<C>) -> PageId {
    PageId::from_bytes(leaf.read_special(LEAF_NEXT_OFFSET, PageId::SIZE))
}

fn set_leaf_prev<C: KeyComparator>(leaf: &mut LeafPage<C>, pgid: PageId) {
    leaf.write_special(LEAF_PREV_OFFSET, &pgid.to_bytes());
}

fn set_leaf_next<C: KeyComparator>(leaf: &mut LeafPage<C>, pgid: PageId) {
    leaf.write_special(LEAF_NEXT_OFFSET, &pgid.to_bytes());
}

/// Right-most child of an inner page.
fn inner_special<C: KeyComparator>(inner: &InnerPage<C>) -> PageId {
    PageId::from_bytes(inner.read_special(0, PageId::SIZE))
}

fn set_inner_special<C: KeyComparator>(inner: &mut InnerPage<C>, pgid: PageId) {
    inner.write_special(0, &pgid.to_bytes());
}

/// Left-most child of an inner page. An inner page can transiently hold
/// zero separators (see `delete`), in which case its only child is the
/// special one.
fn inner_first_child<C: KeyComparator>(inner: &InnerPage<C>) -> PageId {
    if inner.is_empty() {
        inner_special(inner)
    } else {
        InnerSlot::parse(inner.slot(0)).child
    }
}

/// Disk-resident B+ tree over a page manager.
///
/// Single-writer, single-reader per instance; duplicate keys are rejected.
/// Dropping an instance leaves the tree on disk; `destroy` frees it.
pub struct BPlusTree<'p, C: KeyComparator = BytewiseComparator> {
    /// The page manager backing this tree. Non-owning.
    pager: &'p PageManager,
    /// Meta page id: the tree's durable handle.
    meta_pgid: PageId,
    /// Key comparator.
    cmp: C,
}

impl<'p> BPlusTree<'p> {
    /// Allocates a meta page and initializes an empty tree whose root is an
    /// empty leaf. The meta page id identifies the tree afterwards.
    pub fn create(pager: &'p PageManager) -> Result<Self> {
        Self::create_with_comparator(pager, BytewiseComparator)
    }

    /// Opens an existing tree from its meta page id.
    pub fn open(pager: &'p PageManager, meta_pgid: PageId) -> Result<Self> {
        Self::open_with_comparator(pager, meta_pgid, BytewiseComparator)
    }
}

impl<'p, C: KeyComparator> BPlusTree<'p, C> {
    /// `create` with an explicit comparator.
    pub fn create_with_comparator(pager: &'p PageManager, cmp: C) -> Result<Self> {
        let mut meta = pager.alloc_plain_page()?;
        let tree = Self {
            pager,
            meta_pgid: meta.id(),
            cmp,
        };

        let mut root = tree.alloc_leaf_page()?;
        set_leaf_prev(&mut root, PageId::NULL);
        set_leaf_next(&mut root, PageId::NULL);
        tree.save(&root)?;

        meta.write(META_LEVEL_OFFSET, &[1u8]);
        meta.write(META_ROOT_OFFSET, &root.id().to_bytes());
        meta.write(META_TUPLE_OFFSET, &0u64.to_le_bytes());
        pager.write_page(meta.id(), meta.bytes())?;

        debug!("created tree with meta page {}", tree.meta_pgid);
        Ok(tree)
    }

    /// `open` with an explicit comparator.
    pub fn open_with_comparator(
        pager: &'p PageManager,
        meta_pgid: PageId,
        cmp: C,
    ) -> Result<Self> {
        let tree = Self {
            pager,
            meta_pgid,
            cmp,
        };
        if tree.level_num()? == 0 {
            return Err(BrambleError::PageCorrupted {
                page_id: meta_pgid,
                reason: "meta page has level count zero".to_string(),
            });
        }
        Ok(tree)
    }

    /// Returns the meta page id, the persistent handle for `open`.
    pub fn meta_page_id(&self) -> PageId {
        self.meta_pgid
    }

    /// Frees every page owned by the tree, including the meta page.
    pub fn destroy(self) -> Result<()> {
        let root = self.root()?;
        let level = self.level_num()?;
        self.free_subtree(root, level - 1)?;
        self.pager.free(self.meta_pgid)?;
        Ok(())
    }

    /// Returns true if the tree holds no tuples.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.tuple_num()? == 0)
    }

    /// Returns the number of key/value pairs in the tree.
    pub fn tuple_num(&self) -> Result<u64> {
        let meta = self.meta()?;
        let buf = meta.read(META_TUPLE_OFFSET, 8);
        Ok(u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]))
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let leaf = self.leaf_page(self.locate_leaf(key, None)?)?;
        Ok(leaf
            .find_slot(key)
            .map(|s| Bytes::copy_from_slice(LeafSlot::parse(s).value)))
    }

    /// Inserts a key/value pair. Returns false without mutating anything if
    /// the key already exists.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut stack = Vec::new();
        let leaf_id = self.locate_leaf(key, Some(&mut stack))?;
        let mut leaf = self.leaf_page(leaf_id)?;
        // An existing key fails the insert regardless of the new value.
        if leaf.find(key).is_some() {
            return Ok(false);
        }

        let slot = LeafSlot { key, value }.encode();
        let max = max_entry_len();
        if slot.len() > max {
            return Err(BrambleError::EntryTooLarge {
                size: slot.len(),
                max,
            });
        }

        let pos = leaf.lower_bound(key);
        if leaf.is_insertable(slot.len()) {
            leaf.insert_before_slot(pos, &slot);
            self.save(&leaf)?;
        } else {
            // Split. The freshly allocated page becomes the left sibling
            // and takes the low half, so the parent's existing reference to
            // this page (whose separator is a strict upper bound) stays
            // valid without rewriting any child pointer.
            let mut left = self.alloc_leaf_page()?;
            leaf.split_insert(&mut left, &slot, pos);
            debug!("leaf {} split, new left sibling {}", leaf.id(), left.id());

            let old_prev = leaf_prev(&leaf);
            set_leaf_prev(&mut left, old_prev);
            set_leaf_next(&mut left, leaf.id());
            set_leaf_prev(&mut leaf, left.id());
            if !old_prev.is_null() {
                let mut prev = self.leaf_page(old_prev)?;
                set_leaf_next(&mut prev, left.id());
                self.save(&prev)?;
            }
            self.save(&left)?;
            self.save(&leaf)?;

            // The separator is the smallest key of the right half: the
            // strict upper bound of everything that moved left.
            let separator = LeafSlot::parse(leaf.slot(0)).key.to_vec();
            self.propagate_split(stack, left.id(), leaf.id(), separator)?;
        }

        self.add_tuple_num(1)?;
        Ok(true)
    }

    /// Replaces the value under `key`. Returns false if the key does not
    /// exist.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        // An absent key fails the update regardless of the new value. The
        // size check runs before the delete so an oversized value cannot
        // drop the old pair.
        if self.get(key)?.is_none() {
            return Ok(false);
        }
        let size = LeafSlot { key, value }.encoded_len();
        let max = max_entry_len();
        if size > max {
            return Err(BrambleError::EntryTooLarge { size, max });
        }
        self.delete(key)?;
        self.insert(key, value)?;
        Ok(true)
    }

    /// Removes `key`. Returns false without mutating anything if the key
    /// does not exist.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let mut stack = Vec::new();
        let leaf_id = self.locate_leaf(key, Some(&mut stack))?;
        let mut leaf = self.leaf_page(leaf_id)?;
        let Some(i) = leaf.find(key) else {
            return Ok(false);
        };
        leaf.delete_slot(i);

        if !leaf.is_empty() || stack.is_empty() {
            // Entries remain, or the root is this leaf; an empty leaf root
            // is exactly the empty-tree shape.
            self.save(&leaf)?;
        } else {
            let prev = leaf_prev(&leaf);
            let next = leaf_next(&leaf);
            if prev.is_null() && next.is_null() {
                // Last leaf of the tree. Keep it: it becomes the root, and
                // the inner path above it is freed.
                self.save(&leaf)?;
                let new_root = leaf.id();
                drop(leaf);
                for inner_id in stack {
                    let inner = self.inner_page(inner_id)?;
                    self.free_sorted(inner)?;
                }
                self.set_root_and_level(new_root, 1)?;
                debug!("tree collapsed to leaf root {new_root}");
            } else {
                // Unlink the emptied leaf from the chain, free it, and
                // remove its reference from the ancestors.
                if !prev.is_null() {
                    let mut p = self.leaf_page(prev)?;
                    set_leaf_next(&mut p, next);
                    self.save(&p)?;
                }
                if !next.is_null() {
                    let mut n = self.leaf_page(next)?;
                    set_leaf_prev(&mut n, prev);
                    self.save(&n)?;
                }
                debug!("freeing empty leaf {}", leaf.id());
                self.free_sorted(leaf)?;
                self.remove_from_ancestors(stack, key)?;
                self.collapse_root()?;
            }
        }

        self.add_tuple_num(-1)?;
        Ok(true)
    }

    /// Looks up and removes `key` in one call. Returns the removed value.
    pub fn take(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        let value = self.get(key)?;
        if value.is_some() {
            self.delete(key)?;
        }
        Ok(value)
    }

    /// Returns the largest key in the tree, or `None` if the tree is empty.
    pub fn max_key(&self) -> Result<Option<Bytes>> {
        if self.is_empty()? {
            return Ok(None);
        }
        let mut level = self.level_num()?;
        let mut cur = self.root()?;
        while level > 1 {
            let inner = self.inner_page(cur)?;
            cur = inner_special(&inner);
            level -= 1;
        }
        let leaf = self.leaf_page(cur)?;
        debug_assert!(!leaf.is_empty());
        let last = LeafSlot::parse(leaf.slot(leaf.slot_num() - 1));
        Ok(Some(Bytes::copy_from_slice(last.key)))
    }

    /// Returns an iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<TreeIter<'p, C>> {
        let mut level = self.level_num()?;
        let mut cur = self.root()?;
        while level > 1 {
            let inner = self.inner_page(cur)?;
            cur = inner_first_child(&inner);
            level -= 1;
        }
        let leaf = self.leaf_page(cur)?;
        Ok(TreeIter::normalized(self.pager, self.cmp.clone(), &leaf, 0))
    }

    /// Returns an iterator positioned at the smallest key >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<TreeIter<'p, C>> {
        let leaf = self.leaf_page(self.locate_leaf(key, None)?)?;
        let slot = leaf.lower_bound(key);
        Ok(TreeIter::normalized(self.pager, self.cmp.clone(), &leaf, slot))
    }

    /// Returns an iterator positioned at the smallest key > `key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<TreeIter<'p, C>> {
        let leaf = self.leaf_page(self.locate_leaf(key, None)?)?;
        let slot = leaf.upper_bound(key);
        Ok(TreeIter::normalized(self.pager, self.cmp.clone(), &leaf, slot))
    }

    /// Renders the tree structure level by level, for diagnostics.
    pub fn format_tree(&self) -> Result<String> {
        let mut out = String::new();
        self.format_subtree(&mut out, self.root()?, self.level_num()? - 1, 0)?;
        Ok(out)
    }

    // Descent. Walks from the root to the leaf that would hold `key`,
    // optionally recording the inner ancestors root-first.
    fn locate_leaf(&self, key: &[u8], mut stack: Option<&mut Vec<PageId>>) -> Result<PageId> {
        let mut cur = self.root()?;
        let mut level = self.level_num()?;
        while level > 1 {
            let inner = self.inner_page(cur)?;
            if let Some(stack) = stack.as_mut() {
                stack.push(cur);
            }
            let u = inner.upper_bound(key);
            cur = if u == inner.slot_num() {
                inner_special(&inner)
            } else {
                InnerSlot::parse(inner.slot(u)).child
            };
            level -= 1;
        }
        Ok(cur)
    }

    // Hands a split up the ancestor chain. `promoted_child` is the new left
    // page, `separator` the strict upper bound of its subtree, and
    // `right_id` the page that split (needed when the root itself split).
    fn propagate_split(
        &mut self,
        mut stack: Vec<PageId>,
        mut promoted_child: PageId,
        mut right_id: PageId,
        mut separator: Vec<u8>,
    ) -> Result<()> {
        loop {
            let slot = InnerSlot {
                child: promoted_child,
                upper_bound: &separator,
            }
            .encode();

            let Some(parent_id) = stack.pop() else {
                // The page that split was the root: grow by one level.
                let mut new_root = self.alloc_inner_page()?;
                new_root.insert_before_slot(0, &slot);
                set_inner_special(&mut new_root, right_id);
                self.save(&new_root)?;
                let level = self.level_num()?;
                self.set_root_and_level(new_root.id(), level + 1)?;
                debug!("root split, new root {} at level {}", new_root.id(), level + 1);
                return Ok(());
            };

            let mut inner = self.inner_page(parent_id)?;
            let pos = inner.upper_bound(&separator);
            if inner.is_insertable(slot.len()) {
                inner.insert_before_slot(pos, &slot);
                self.save(&inner)?;
                return Ok(());
            }

            // The parent splits the same way. The last slot of the new left
            // page folds into its special region; the separator it carried
            // becomes the promotion key for the grandparent.
            let mut left = self.alloc_inner_page()?;
            inner.split_insert(&mut left, &slot, pos);
            let last = left.slot_num() - 1;
            let evicted = InnerSlot::parse(left.slot(last));
            let evicted_child = evicted.child;
            let evicted_key = evicted.upper_bound.to_vec();
            set_inner_special(&mut left, evicted_child);
            left.delete_slot(last);
            self.save(&left)?;
            self.save(&inner)?;
            debug!("inner {} split, new left sibling {}", inner.id(), left.id());

            promoted_child = left.id();
            right_id = inner.id();
            separator = evicted_key;
        }
    }

    // Removes the freed child's reference from the ancestors, bottom-up.
    // An inner page that loses its last child is freed and the removal
    // continues upward.
    fn remove_from_ancestors(&mut self, mut stack: Vec<PageId>, key: &[u8]) -> Result<()> {
        while let Some(parent_id) = stack.pop() {
            let mut inner = self.inner_page(parent_id)?;
            let u = inner.upper_bound(key);
            if u < inner.slot_num() {
                inner.delete_slot(u);
                self.save(&inner)?;
                return Ok(());
            }
            // The freed child was the special child: the last separator's
            // child takes its place.
            if !inner.is_empty() {
                let last = inner.slot_num() - 1;
                let child = InnerSlot::parse(inner.slot(last)).child;
                set_inner_special(&mut inner, child);
                inner.delete_slot(last);
                self.save(&inner)?;
                return Ok(());
            }
            debug!("freeing childless inner {}", inner.id());
            self.free_sorted(inner)?;
        }
        unreachable!("removal cascaded past the root");
    }

    // Shrinks the tree while the root is an inner page with no separators:
    // its special child becomes the root. Root id and level number move
    // together.
    fn collapse_root(&mut self) -> Result<()> {
        let mut root = self.root()?;
        let mut level = self.level_num()?;
        let mut changed = false;
        while level > 1 {
            let inner = self.inner_page(root)?;
            if !inner.is_empty() {
                break;
            }
            let child = inner_special(&inner);
            debug!("root {} collapsed into {}", root, child);
            self.free_sorted(inner)?;
            root = child;
            level -= 1;
            changed = true;
        }
        if changed {
            self.set_root_and_level(root, level)?;
        }
        Ok(())
    }

    // Frees the subtree rooted at `pgid` (level 0 = leaf), post-order.
    fn free_subtree(&self, pgid: PageId, level: u8) -> Result<()> {
        if level == 0 {
            let leaf = self.leaf_page(pgid)?;
            self.free_sorted(leaf)?;
            return Ok(());
        }
        let inner = self.inner_page(pgid)?;
        let children: Vec<PageId> = (0..inner.slot_num())
            .map(|i| InnerSlot::parse(inner.slot(i)).child)
            .collect();
        let special = inner_special(&inner);
        self.free_sorted(inner)?;
        for child in children {
            self.free_subtree(child, level - 1)?;
        }
        self.free_subtree(special, level - 1)
    }

    fn format_subtree(
        &self,
        out: &mut String,
        pgid: PageId,
        level: u8,
        depth: usize,
    ) -> Result<()> {
        use std::fmt::Write as _;

        let pad = "  ".repeat(depth);
        if level == 0 {
            let leaf = self.leaf_page(pgid)?;
            let keys: Vec<String> = (0..leaf.slot_num())
                .map(|i| format_key(LeafSlot::parse(leaf.slot(i)).key))
                .collect();
            let _ = writeln!(out, "{pad}leaf {pgid} [{}]", keys.join(" "));
            return Ok(());
        }
        let inner = self.inner_page(pgid)?;
        let seps: Vec<String> = (0..inner.slot_num())
            .map(|i| format_key(InnerSlot::parse(inner.slot(i)).upper_bound))
            .collect();
        let _ = writeln!(out, "{pad}inner {pgid} [{}]", seps.join(" "));
        for i in 0..inner.slot_num() {
            self.format_subtree(out, InnerSlot::parse(inner.slot(i)).child, level - 1, depth + 1)?;
        }
        self.format_subtree(out, inner_special(&inner), level - 1, depth + 1)
    }

    // Page handle helpers.

    fn meta(&self) -> Result<PlainPage> {
        self.pager.plain_page(self.meta_pgid)
    }

    fn inner_page(&self, pgid: PageId) -> Result<InnerPage<C>> {
        self.pager.sorted_page(pgid, InnerOrdering::new(self.cmp.clone()))
    }

    fn leaf_page(&self, pgid: PageId) -> Result<LeafPage<C>> {
        self.pager.sorted_page(pgid, LeafOrdering::new(self.cmp.clone()))
    }

    fn alloc_inner_page(&self) -> Result<InnerPage<C>> {
        let mut page = self
            .pager
            .alloc_sorted_page(InnerOrdering::new(self.cmp.clone()))?;
        page.init(INNER_SPECIAL_LEN);
        Ok(page)
    }

    fn alloc_leaf_page(&self) -> Result<LeafPage<C>> {
        let mut page = self
            .pager
            .alloc_sorted_page(LeafOrdering::new(self.cmp.clone()))?;
        page.init(LEAF_SPECIAL_LEN);
        Ok(page)
    }

    fn save<O: SlotOrdering>(&self, page: &SortedPage<O>) -> Result<()> {
        self.pager.write_page(page.id(), page.bytes())
    }

    // Consumes the handle before freeing so no live handle can outlast the
    // page.
    fn free_sorted<O: SlotOrdering>(&self, page: SortedPage<O>) -> Result<()> {
        let id = page.id();
        drop(page);
        self.pager.free(id)
    }

    // Meta page state.

    fn level_num(&self) -> Result<u8> {
        Ok(self.meta()?.read(META_LEVEL_OFFSET, 1)[0])
    }

    fn root(&self) -> Result<PageId> {
        Ok(PageId::from_bytes(self.meta()?.read(META_ROOT_OFFSET, PageId::SIZE)))
    }

    fn set_root_and_level(&self, root: PageId, level: u8) -> Result<()> {
        let mut meta = self.meta()?;
        meta.write(META_LEVEL_OFFSET, &[level]);
        meta.write(META_ROOT_OFFSET, &root.to_bytes());
        self.pager.write_page(meta.id(), meta.bytes())
    }

    fn add_tuple_num(&self, delta: i64) -> Result<()> {
        let num = self.tuple_num()?;
        if delta < 0 {
            assert!(num >= delta.unsigned_abs(), "tuple count underflow");
        }
        let num = num.wrapping_add_signed(delta);
        let mut meta = self.meta()?;
        meta.write(META_TUPLE_OFFSET, &num.to_le_bytes());
        self.pager.write_page(meta.id(), meta.bytes())
    }
}

fn format_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => {
            let hex: String = key.iter().map(|b| format!("{b:02x}")).collect();
            format!("0x{hex}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::PagerConfig;
    use bramble_common::page::PAGE_SIZE;
    use tempfile::tempdir;

    fn create_test_pager() -> (PageManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = PagerConfig {
            path: dir.path().join("tree.dat"),
            fsync_enabled: false,
        };
        (PageManager::open(config).unwrap(), dir)
    }

    fn collect_keys(tree: &BPlusTree<'_, BytewiseComparator>) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let mut iter = tree.begin().unwrap();
        while let Some((key, _)) = iter.cur().unwrap() {
            keys.push(key.to_vec());
            iter.advance().unwrap();
        }
        keys
    }

    /// Walks the whole structure and checks the ordering, chaining, and
    /// counting invariants.
    fn check_invariants(tree: &BPlusTree<'_, BytewiseComparator>) {
        let root = tree.root().unwrap();
        let level = tree.level_num().unwrap();
        assert!(level >= 1);

        let mut leaves = Vec::new();
        let count = check_subtree(tree, root, level - 1, None, None, &mut leaves);
        assert_eq!(
            count,
            tree.tuple_num().unwrap(),
            "tuple count does not match a full scan"
        );

        // Leaves must be chained left to right with 0 sentinels at the
        // ends.
        for (i, &id) in leaves.iter().enumerate() {
            let leaf = tree.leaf_page(id).unwrap();
            let expect_prev = if i == 0 { PageId::NULL } else { leaves[i - 1] };
            let expect_next = if i + 1 == leaves.len() {
                PageId::NULL
            } else {
                leaves[i + 1]
            };
            assert_eq!(leaf_prev(&leaf), expect_prev, "bad prev link on leaf {id}");
            assert_eq!(leaf_next(&leaf), expect_next, "bad next link on leaf {id}");
        }
    }

    /// Returns the number of tuples under `pgid`. `lower` is an inclusive
    /// bound, `upper` an exclusive one.
    fn check_subtree(
        tree: &BPlusTree<'_, BytewiseComparator>,
        pgid: PageId,
        level: u8,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        leaves: &mut Vec<PageId>,
    ) -> u64 {
        let cmp = BytewiseComparator;
        if level == 0 {
            let leaf = tree.leaf_page(pgid).unwrap();
            leaves.push(pgid);
            let mut prev_key: Option<Vec<u8>> = None;
            for i in 0..leaf.slot_num() {
                let key = LeafSlot::parse(leaf.slot(i)).key;
                if let Some(lower) = lower {
                    assert!(cmp.compare(key, lower) != Ordering::Less, "key below bound");
                }
                if let Some(upper) = upper {
                    assert!(cmp.compare(key, upper) == Ordering::Less, "key above bound");
                }
                if let Some(prev) = &prev_key {
                    assert!(cmp.compare(prev, key) == Ordering::Less, "keys out of order");
                }
                prev_key = Some(key.to_vec());
            }
            return leaf.slot_num() as u64;
        }

        let inner = tree.inner_page(pgid).unwrap();
        let mut count = 0;
        let mut child_lower = lower.map(|b| b.to_vec());
        for i in 0..inner.slot_num() {
            let slot = InnerSlot::parse(inner.slot(i));
            let sep = slot.upper_bound.to_vec();
            if let Some(prev) = &child_lower {
                assert!(
                    cmp.compare(prev, &sep) != Ordering::Greater,
                    "separators out of order"
                );
            }
            count += check_subtree(
                tree,
                slot.child,
                level - 1,
                child_lower.as_deref(),
                Some(&sep),
                leaves,
            );
            child_lower = Some(sep);
        }
        count += check_subtree(
            tree,
            inner_special(&inner),
            level - 1,
            child_lower.as_deref(),
            upper,
            leaves,
        );
        count
    }

    #[test]
    fn test_create_empty_tree() {
        let (pager, _dir) = create_test_pager();
        let tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        assert_eq!(tree.level_num().unwrap(), 1);
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.tuple_num().unwrap(), 0);
        assert!(tree.get(b"anything").unwrap().is_none());
        assert!(tree.max_key().unwrap().is_none());
        assert!(tree.begin().unwrap().cur().unwrap().is_none());
        check_invariants(&tree);
    }

    #[test]
    fn test_insert_get_single_level() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        assert!(tree.insert(b"b", b"2").unwrap());
        assert!(tree.insert(b"a", b"1").unwrap());
        assert!(tree.insert(b"c", b"3").unwrap());

        assert_eq!(tree.get(b"a").unwrap().unwrap(), &b"1"[..]);
        assert_eq!(tree.get(b"b").unwrap().unwrap(), &b"2"[..]);
        assert_eq!(tree.get(b"c").unwrap().unwrap(), &b"3"[..]);
        assert!(tree.get(b"d").unwrap().is_none());
        assert_eq!(tree.tuple_num().unwrap(), 3);
        check_invariants(&tree);
    }

    #[test]
    fn test_insert_duplicate_fails_without_mutation() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        assert!(tree.insert(b"a", b"1").unwrap());
        assert!(!tree.insert(b"a", b"X").unwrap());
        assert_eq!(tree.get(b"a").unwrap().unwrap(), &b"1"[..]);
        assert_eq!(tree.tuple_num().unwrap(), 1);

        // An existing key fails first, even when the new value is
        // oversized.
        let oversized = vec![0u8; PAGE_SIZE];
        assert!(!tree.insert(b"a", &oversized).unwrap());
        assert_eq!(tree.get(b"a").unwrap().unwrap(), &b"1"[..]);
        assert_eq!(tree.tuple_num().unwrap(), 1);
    }

    #[test]
    fn test_insert_oversized_entry_rejected() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        let value = vec![0u8; PAGE_SIZE];
        let err = tree.insert(b"k", &value).unwrap_err();
        assert!(matches!(err, BrambleError::EntryTooLarge { .. }));
        assert!(tree.is_empty().unwrap());

        // An entry exactly at the limit is accepted.
        let value = vec![0u8; max_entry_len() - 2 - 1];
        assert!(tree.insert(b"k", &value).unwrap());
        assert_eq!(tree.get(b"k").unwrap().unwrap(), &value[..]);
    }

    #[test]
    fn test_mixed_entry_sizes_split_cleanly() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        // Alternate tiny entries with entries near the size limit so splits
        // have to find a feasible point around the big slots.
        let big = vec![1u8; max_entry_len() - 16];
        for i in 0..40u32 {
            let key = format!("k{i:04}");
            if i % 2 == 0 {
                tree.insert(key.as_bytes(), &big).unwrap();
            } else {
                tree.insert(key.as_bytes(), b"tiny").unwrap();
            }
        }
        assert_eq!(tree.tuple_num().unwrap(), 40);
        check_invariants(&tree);

        // Now land more big entries between the existing keys.
        for i in 0..40u32 {
            let key = format!("k{i:04}x");
            tree.insert(key.as_bytes(), &big).unwrap();
        }
        assert_eq!(tree.tuple_num().unwrap(), 80);
        check_invariants(&tree);
    }

    #[test]
    fn test_leaf_split_builds_second_level() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        // Values sized so that two entries fill a leaf and the third forces
        // a split.
        let value = vec![7u8; 1800];
        assert!(tree.insert(b"a", &value).unwrap());
        assert!(tree.insert(b"b", &value).unwrap());
        assert_eq!(tree.level_num().unwrap(), 1);

        assert!(tree.insert(b"c", &value).unwrap());
        assert_eq!(tree.level_num().unwrap(), 2);
        assert_eq!(tree.tuple_num().unwrap(), 3);

        for key in [b"a".as_ref(), b"b", b"c"] {
            assert_eq!(tree.get(key).unwrap().unwrap(), &value[..]);
        }
        check_invariants(&tree);
    }

    #[test]
    fn test_splits_to_level_three() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        // Wide keys shrink the inner fan-out so a root split happens with a
        // manageable number of inserts.
        let value = vec![9u8; 900];
        let mut seen_two = false;
        let mut n = 0u32;
        while tree.level_num().unwrap() < 3 {
            let key = format!("{n:0128}");
            assert!(tree.insert(key.as_bytes(), &value).unwrap());
            n += 1;
            if tree.level_num().unwrap() == 2 && !seen_two {
                seen_two = true;
                check_invariants(&tree);
            }
        }
        assert!(seen_two, "never passed through level 2");
        assert_eq!(tree.tuple_num().unwrap(), n as u64);
        check_invariants(&tree);

        // Everything is still retrievable and in order.
        for i in 0..n {
            let key = format!("{i:0128}");
            assert!(tree.get(key.as_bytes()).unwrap().is_some(), "lost key {i}");
        }
        let keys = collect_keys(&tree);
        assert_eq!(keys.len(), n as usize);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_delete_simple() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"b", b"2").unwrap();

        assert!(tree.delete(b"a").unwrap());
        assert!(tree.get(b"a").unwrap().is_none());
        assert!(!tree.delete(b"a").unwrap());
        assert_eq!(tree.tuple_num().unwrap(), 1);
        check_invariants(&tree);
    }

    #[test]
    fn test_delete_to_empty_collapses_to_leaf_root() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        let value = vec![3u8; 900];
        let keys: Vec<String> = (0..64).map(|i| format!("{i:0128}")).collect();
        for key in &keys {
            tree.insert(key.as_bytes(), &value).unwrap();
        }
        assert!(tree.level_num().unwrap() >= 2);

        for key in &keys {
            assert!(tree.delete(key.as_bytes()).unwrap());
            check_invariants(&tree);
        }

        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.level_num().unwrap(), 1);
        let root = tree.leaf_page(tree.root().unwrap()).unwrap();
        assert!(root.is_empty());
        assert!(leaf_prev(&root).is_null());
        assert!(leaf_next(&root).is_null());
    }

    #[test]
    fn test_delete_descending_collapses() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        let value = vec![4u8; 900];
        let keys: Vec<String> = (0..48).map(|i| format!("{i:0128}")).collect();
        for key in &keys {
            tree.insert(key.as_bytes(), &value).unwrap();
        }
        for key in keys.iter().rev() {
            assert!(tree.delete(key.as_bytes()).unwrap());
            check_invariants(&tree);
        }
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.level_num().unwrap(), 1);
    }

    #[test]
    fn test_destroy_frees_every_page() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        let value = vec![5u8; 900];
        for i in 0..64 {
            let key = format!("{i:0128}");
            tree.insert(key.as_bytes(), &value).unwrap();
        }
        tree.destroy().unwrap();

        // Only the pager header page remains live.
        assert_eq!(
            pager.page_count() as u64 - 1,
            pager.free_count(),
            "destroy leaked pages"
        );
    }

    #[test]
    fn test_destroy_empty_tree() {
        let (pager, _dir) = create_test_pager();
        let tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();
        tree.destroy().unwrap();
        assert_eq!(pager.page_count() as u64 - 1, pager.free_count());
    }

    #[test]
    fn test_format_tree_renders_structure() {
        let (pager, _dir) = create_test_pager();
        let mut tree: BPlusTree<'_> = BPlusTree::create(&pager).unwrap();

        tree.insert(b"alpha", b"1").unwrap();
        tree.insert(b"beta", b"2").unwrap();
        let rendered = tree.format_tree().unwrap();
        assert!(rendered.contains("leaf"));
        assert!(rendered.contains("alpha"));
        assert!(rendered.contains("beta"));
    }

    #[test]
    fn test_custom_comparator_reverses_order() {
        #[derive(Clone, Default)]
        struct ReverseComparator;

        impl KeyComparator for ReverseComparator {
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                b.cmp(a)
            }
        }

        let (pager, _dir) = create_test_pager();
        let mut tree = BPlusTree::create_with_comparator(&pager, ReverseComparator).unwrap();

        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"b", b"2").unwrap();
        tree.insert(b"c", b"3").unwrap();

        let mut keys = Vec::new();
        let mut iter = tree.begin().unwrap();
        while let Some((key, _)) = iter.cur().unwrap() {
            keys.push(key.to_vec());
            iter.advance().unwrap();
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(tree.max_key().unwrap().unwrap(), &b"a"[..]);
    }

    #[test]
    fn test_bytewise_comparator_prefix_path() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"aaaaaaaa", b"aaaaaaab"), Ordering::Less);
        assert_eq!(cmp.compare(b"aaaaaaaaX", b"aaaaaaaa"), Ordering::Greater);
        assert_eq!(cmp.compare(b"zzzzzzzz", b"aaaaaaaa"), Ordering::Greater);
        assert_eq!(cmp.compare(b"ab", b"b"), Ordering::Less);
        assert_eq!(cmp.compare(b"", b""), Ordering::Equal);
    }
}
