//! Forward cursor over the leaf chain.

use bytes::Bytes;

use bramble_common::page::PageId;
use bramble_common::Result;

use crate::pager::PageManager;

use super::slot::LeafSlot;
use super::{leaf_next, BytewiseComparator, KeyComparator, LeafOrdering, LeafPage};

/// Forward iterator over the tree's key/value pairs, in comparator order.
///
/// The iterator holds only a leaf page id and a slot index; the leaf is
/// re-acquired on each call, so no page handle is pinned between calls. A
/// null page id marks the exhausted state. Mutating the tree invalidates
/// any outstanding iterator.
pub struct TreeIter<'p, C: KeyComparator = BytewiseComparator> {
    /// The page manager backing the tree.
    pager: &'p PageManager,
    /// Key comparator, used to rebuild leaf views.
    cmp: C,
    /// Current leaf, or null once exhausted.
    page_id: PageId,
    /// Slot index within the current leaf.
    slot_id: usize,
}

impl<'p, C: KeyComparator> TreeIter<'p, C> {
    /// Positions at `slot` of `leaf`, stepping to the next leaf (or the
    /// exhausted state) if `slot` is past the last slot.
    pub(crate) fn normalized(
        pager: &'p PageManager,
        cmp: C,
        leaf: &LeafPage<C>,
        slot: usize,
    ) -> Self {
        let (page_id, slot_id) = if slot < leaf.slot_num() {
            (leaf.id(), slot)
        } else {
            // Chained leaves are never empty, so one hop is enough.
            (leaf_next(leaf), 0)
        };
        Self {
            pager,
            cmp,
            page_id,
            slot_id,
        }
    }

    /// Returns true once the iterator has moved past the last pair.
    pub fn is_exhausted(&self) -> bool {
        self.page_id.is_null()
    }

    /// Returns the current key/value pair, or `None` if exhausted.
    pub fn cur(&self) -> Result<Option<(Bytes, Bytes)>> {
        if self.page_id.is_null() {
            return Ok(None);
        }
        let leaf = self.leaf(self.page_id)?;
        if self.slot_id >= leaf.slot_num() {
            return Ok(None);
        }
        let slot = LeafSlot::parse(leaf.slot(self.slot_id));
        Ok(Some((
            Bytes::copy_from_slice(slot.key),
            Bytes::copy_from_slice(slot.value),
        )))
    }

    /// Advances to the next pair, following the leaf chain. Advancing an
    /// exhausted iterator is a no-op.
    pub fn advance(&mut self) -> Result<()> {
        if self.page_id.is_null() {
            return Ok(());
        }
        let leaf = self.leaf(self.page_id)?;
        self.slot_id += 1;
        if self.slot_id >= leaf.slot_num() {
            self.page_id = leaf_next(&leaf);
            self.slot_id = 0;
        }
        Ok(())
    }

    fn leaf(&self, pgid: PageId) -> Result<LeafPage<C>> {
        self.pager
            .sorted_page(pgid, LeafOrdering::new(self.cmp.clone()))
    }
}
