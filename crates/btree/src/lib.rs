//! C6 — Data B-tree Index.
//!
//! A page-based B-tree keyed by a 64-bit row key (the table's `ROWID`),
//! storing a [`RecordId`] pointer into the heap/scan table at each leaf
//! entry rather than the row itself (spec §4.6: "a row lives in a heap
//! page; the index stores a pointer to it"). Built on [`storage::PageStore`],
//! so it inherits whatever caching the store was assembled with.

mod node;

#[cfg(test)]
mod tests;

use catalog::IndexId;
use common::{DbError, DbResult, PageId, RecordId, TableId, UndoSink};
use node::Node;
use storage::{PageKind, PageStore, PagedFile};

/// Number of samples after which [`BTreeIndex::memory_per_page`] switches
/// from a running mean to an exponentially-smoothed estimate (mirrors
/// `common::Row`'s per-row memory estimate, one level up).
const MEMORY_FACTOR: f64 = 32.0;

/// A page-based B-tree over 64-bit row keys.
pub struct BTreeIndex<F: PagedFile> {
    store: PageStore<F>,
    index_id: IndexId,
    root: PageId,
    row_count: u64,
    last_key: i64,
    memory_per_page: f64,
    memory_samples: u64,
    max_leaf_entries: usize,
    max_internal_keys: usize,
}

/// Outcome of inserting into a subtree: `None` if it fit without splitting,
/// `Some((pivot_key, new_right_page))` if the child had to split and a
/// separator needs to be threaded into the parent.
type SplitResult = Option<(i64, PageId)>;

impl<F: PagedFile> BTreeIndex<F> {
    /// Create a fresh index (a single empty leaf as root) over `file`.
    ///
    /// `max_leaf_entries`/`max_internal_keys` bound node fanout; the spec's
    /// "index page size" knob (scenario S1 uses a small page size to force
    /// frequent splits) is modeled here as an explicit fanout rather than a
    /// second physical page size, since `storage::PAGE_SIZE` is a
    /// workspace-wide constant (see `DESIGN.md`).
    pub fn create(
        file: F,
        index_id: IndexId,
        max_leaf_entries: usize,
        max_internal_keys: usize,
    ) -> DbResult<Self> {
        let mut store = PageStore::new(file);
        let root = store.allocate_page(PageKind::Leaf, None)?;
        let mut page = store.get_page(root, PageKind::Leaf)?;
        page.payload[..Node::new_leaf().encode().len()].copy_from_slice(&Node::new_leaf().encode());
        store.update(&page)?;
        store.set_root(index_id.0, root);
        Ok(Self {
            store,
            index_id,
            root,
            row_count: 0,
            last_key: 0,
            memory_per_page: 0.0,
            memory_samples: 0,
            max_leaf_entries: max_leaf_entries.max(2),
            max_internal_keys: max_internal_keys.max(2),
        })
    }

    /// Reopen an index whose root was previously registered in `file`'s page
    /// store, restoring the cached row count.
    pub fn open(
        file: F,
        index_id: IndexId,
        row_count: u64,
        max_leaf_entries: usize,
        max_internal_keys: usize,
    ) -> DbResult<Self> {
        let mut store = PageStore::new(file);
        let root = store.root(index_id.0).ok_or_else(|| {
            DbError::Storage(format!("no registered root for index {}", index_id.0))
        })?;
        Ok(Self {
            store,
            index_id,
            root,
            row_count,
            last_key: 0,
            memory_per_page: 0.0,
            memory_samples: 0,
            max_leaf_entries: max_leaf_entries.max(2),
            max_internal_keys: max_internal_keys.max(2),
        })
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    /// Cached row count, maintained incrementally by `add`/`remove` rather
    /// than recomputed by walking the tree (spec §4.6).
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn last_key(&self) -> i64 {
        self.last_key
    }

    /// Exponentially-smoothed average serialized node size, in bytes.
    pub fn memory_per_page(&self) -> f64 {
        self.memory_per_page
    }

    fn record_memory_sample(&mut self, bytes: usize) {
        self.memory_samples += 1;
        let x = bytes as f64;
        if self.memory_samples as f64 <= MEMORY_FACTOR {
            self.memory_per_page += (x - self.memory_per_page) / self.memory_samples as f64;
        } else {
            self.memory_per_page += (x - self.memory_per_page) / MEMORY_FACTOR;
        }
    }

    /// Insert `values` under `key`. `key == 0` means "assign the next row
    /// key" (no declared main index column, spec §4.6 step 1): the index
    /// increments its own `lastKey` counter and retries on collision by
    /// perturbing the candidate key, first by a bounded random jitter, then
    /// by successive increments, mirroring the spec's `addTry` retry policy.
    pub fn add(
        &mut self,
        sink: &mut impl UndoSink,
        table: TableId,
        key: i64,
        rid: RecordId,
    ) -> DbResult<i64> {
        let auto_assign = key == 0;
        let mut candidate = if auto_assign {
            self.last_key + 1
        } else {
            key
        };
        let mut attempt: u32 = 0;
        loop {
            match self.add_try(candidate, rid) {
                Ok(()) => break,
                Err(DbError::Constraint(_)) if auto_assign => {
                    attempt += 1;
                    candidate = if attempt == 1 {
                        candidate + (pseudo_random_jitter() % 10_000)
                    } else {
                        candidate + attempt as i64
                    };
                }
                Err(e) => return Err(e),
            }
        }
        self.last_key = self.last_key.max(candidate);
        self.row_count += 1;
        sink.log_add_or_remove_row(
            table,
            &common::Row::new(candidate, Vec::new()),
            true,
        )?;
        Ok(candidate)
    }

    /// Single insertion attempt with no retry: fails with
    /// `DbError::Constraint` if `key` is already present (spec: data index
    /// keys are unique).
    fn add_try(&mut self, key: i64, rid: RecordId) -> DbResult<()> {
        if let Some((pivot, right)) = self.insert_into(self.root, key, rid)? {
            let new_root_node = Node::Internal {
                keys: vec![pivot],
                children: vec![self.root, right],
            };
            let new_root = self.store.allocate_page(PageKind::Node, None)?;
            self.write_node(new_root, &new_root_node)?;
            self.root = new_root;
            self.store.set_root(self.index_id.0, new_root);
        }
        Ok(())
    }

    fn insert_into(&mut self, page_id: PageId, key: i64, rid: RecordId) -> DbResult<SplitResult> {
        let node = self.read_node(page_id)?;
        match node {
            Node::Internal { keys, children } => {
                let idx = keys.partition_point(|&k| k <= key);
                let child = children[idx];
                if let Some((pivot, new_child)) = self.insert_into(child, key, rid)? {
                    let mut keys = keys;
                    let mut children = children;
                    keys.insert(idx, pivot);
                    children.insert(idx + 1, new_child);
                    if keys.len() > self.max_internal_keys {
                        let mid = keys.len() / 2;
                        let split_key = keys[mid];
                        let right_keys = keys.split_off(mid + 1);
                        keys.pop(); // drop the now-promoted separator from the left side
                        let right_children = children.split_off(mid + 1);
                        self.write_node(page_id, &Node::Internal { keys, children })?;
                        let right_page = self.store.allocate_page(PageKind::Node, None)?;
                        self.write_node(
                            right_page,
                            &Node::Internal {
                                keys: right_keys,
                                children: right_children,
                            },
                        )?;
                        Ok(Some((split_key, right_page)))
                    } else {
                        self.write_node(page_id, &Node::Internal { keys, children })?;
                        Ok(None)
                    }
                } else {
                    Ok(None)
                }
            }
            Node::Leaf { mut entries, next_leaf } => {
                let idx = entries.partition_point(|(k, _)| *k < key);
                if entries.get(idx).map(|(k, _)| *k) == Some(key) {
                    return Err(DbError::Constraint(format!(
                        "DUPLICATE_KEY_1: key {key} already present in index {}",
                        self.index_id.0
                    )));
                }
                entries.insert(idx, (key, rid));
                if entries.len() > self.max_leaf_entries {
                    let mid = entries.len() / 2;
                    let right_entries = entries.split_off(mid);
                    let split_key = right_entries[0].0;
                    let right_page = self.store.allocate_page(PageKind::Leaf, None)?;
                    self.write_node(
                        right_page,
                        &Node::Leaf {
                            entries: right_entries,
                            next_leaf,
                        },
                    )?;
                    self.write_node(
                        page_id,
                        &Node::Leaf {
                            entries,
                            next_leaf: Some(right_page),
                        },
                    )?;
                    Ok(Some((split_key, right_page)))
                } else {
                    self.write_node(page_id, &Node::Leaf { entries, next_leaf })?;
                    Ok(None)
                }
            }
        }
    }

    /// Remove the entry for `key`. Returns `Ok(true)` if an entry was
    /// removed, `Ok(false)` if `key` was absent. Underflow after removal is
    /// tolerated rather than triggering a rebalance (spec's Non-goals allow
    /// under-full nodes; only splits are mandatory).
    ///
    /// Spec §4.6: "if `rowCount == 1`, replace root with a fresh empty
    /// leaf; else traverse `root.remove(key)`" — the last row resets the
    /// tree to a brand-new root page rather than leaving a tombstoned
    /// entry behind in whatever leaf it lived in.
    pub fn remove(&mut self, sink: &mut impl UndoSink, table: TableId, key: i64) -> DbResult<bool> {
        let removed = if self.row_count == 1 {
            if !self.contains_key(self.root, key)? {
                return Ok(false);
            }
            let old_root = self.root;
            let fresh = self.store.allocate_page(PageKind::Leaf, None)?;
            let mut page = self.store.get_page(fresh, PageKind::Leaf)?;
            let empty = Node::new_leaf().encode();
            page.payload[..empty.len()].copy_from_slice(&empty);
            self.store.update(&page)?;
            self.store.set_root(self.index_id.0, fresh);
            self.store.free(old_root)?;
            self.root = fresh;
            true
        } else {
            self.remove_from(self.root, key)?
        };
        if removed {
            self.row_count = self.row_count.saturating_sub(1);
            sink.log_add_or_remove_row(table, &common::Row::new(key, Vec::new()), false)?;
        }
        Ok(removed)
    }

    /// Whether `key` is present in the subtree rooted at `page_id` — used
    /// only by `remove`'s single-row fast path to confirm `key` actually
    /// names the tree's last row before resetting it.
    fn contains_key(&mut self, page_id: PageId, key: i64) -> DbResult<bool> {
        let node = self.read_node(page_id)?;
        match node {
            Node::Internal { keys, children } => {
                let idx = keys.partition_point(|&k| k <= key);
                self.contains_key(children[idx], key)
            }
            Node::Leaf { entries, .. } => Ok(entries.iter().any(|(k, _)| *k == key)),
        }
    }

    fn remove_from(&mut self, page_id: PageId, key: i64) -> DbResult<bool> {
        let node = self.read_node(page_id)?;
        match node {
            Node::Internal { keys, children } => {
                let idx = keys.partition_point(|&k| k <= key);
                self.remove_from(children[idx], key)
            }
            Node::Leaf { mut entries, next_leaf } => {
                let before = entries.len();
                entries.retain(|(k, _)| *k != key);
                let removed = entries.len() != before;
                if removed {
                    self.write_node(page_id, &Node::Leaf { entries, next_leaf })?;
                }
                Ok(removed)
            }
        }
    }

    /// Range lookup over `[low, high]` (either bound `None` means
    /// unbounded), returned in key order via the leaf sibling chain.
    pub fn find(&mut self, low: Option<i64>, high: Option<i64>) -> DbResult<Vec<(i64, RecordId)>> {
        let low = low.unwrap_or(i64::MIN);
        let high = high.unwrap_or(i64::MAX);
        let mut leaf = self.leftmost_leaf_from(self.root, low)?;
        let mut out = Vec::new();
        loop {
            let node = self.read_node(leaf)?;
            let Node::Leaf { entries, next_leaf } = node else {
                return Err(DbError::Storage("expected leaf while scanning".into()));
            };
            for (k, rid) in &entries {
                if *k < low {
                    continue;
                }
                if *k > high {
                    return Ok(out);
                }
                out.push((*k, *rid));
            }
            match next_leaf {
                Some(next) => leaf = next,
                None => return Ok(out),
            }
        }
    }

    fn leftmost_leaf_from(&mut self, page_id: PageId, low: i64) -> DbResult<PageId> {
        match self.read_node(page_id)? {
            Node::Internal { keys, children } => {
                let idx = keys.partition_point(|&k| k <= low);
                self.leftmost_leaf_from(children[idx], low)
            }
            Node::Leaf { .. } => Ok(page_id),
        }
    }

    fn read_node(&mut self, page_id: PageId) -> DbResult<Node> {
        let page = self.store.get_page_any(page_id)?;
        Node::decode(&page.payload)
    }

    fn write_node(&mut self, page_id: PageId, node: &Node) -> DbResult<()> {
        let bytes = node.encode();
        self.record_memory_sample(bytes.len());
        let kind = if node.is_leaf() {
            PageKind::Leaf
        } else {
            PageKind::Node
        };
        let mut page = self.store.get_page_any(page_id)?;
        if bytes.len() > page.payload.len() {
            return Err(DbError::Storage(format!(
                "btree node for page {} exceeds page payload ({} > {})",
                page_id.0,
                bytes.len(),
                page.payload.len()
            )));
        }
        page.kind = kind;
        page.row_count_hint = node.len() as u32;
        page.payload.fill(0);
        page.payload[..bytes.len()].copy_from_slice(&bytes);
        self.store.update(&page)
    }

    pub fn flush(&mut self) -> DbResult<()> {
        self.store.flush()
    }
}

/// Spec §4.6's duplicate-key retry jitter: `round(random() * 10000)` on the
/// first collision.
fn pseudo_random_jitter() -> i64 {
    rand::random::<u32>() as i64
}
