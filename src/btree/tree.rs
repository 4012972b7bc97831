//! B+ tree over fixed-size pages: 64-bit keys to 120-byte values, 248
//! branches per internal page, 31 records per leaf.
//!
//! `insert`/`remove` are index-maintenance paths: they restructure pages
//! and are not logged, so they belong to the bulk-load phase of a table.
//! `find`/`update` are the transactional paths; they take record locks and
//! follow the lock -> log -> mutate -> stamp-page-lsn order.

use std::sync::Arc;

use itertools::Itertools;
use log::debug;

use crate::{
    btree::{
        buffer_pool::BufferPool,
        page::{
            Branch, PageBuf, Record, INTERNAL_ORDER, LEAF_ORDER, MERGE_THRESHOLD,
        },
    },
    error::SmallError,
    transaction::{Lock, LockAcquireResult, LockManager, LockType, Xact, XactManager},
    tx_log::LogManager,
    types::{HierarchyId, PageNum, SmallResult, TableId, NULL_PAGE_NUM},
};

/// Split point: half, rounded up.
fn cut(length: usize) -> usize {
    if length % 2 == 1 {
        length / 2 + 1
    } else {
        length / 2
    }
}

enum LockedRead {
    Got(Record),
    Wait(Arc<Lock>, usize),
    Dead,
}

pub struct BPTree {
    pool: Arc<BufferPool>,
    lock_manager: Arc<LockManager>,
    log_manager: Arc<LogManager>,
    xact_manager: Arc<XactManager>,
}

impl BPTree {
    pub fn new(
        pool: Arc<BufferPool>,
        lock_manager: Arc<LockManager>,
        log_manager: Arc<LogManager>,
        xact_manager: Arc<XactManager>,
    ) -> Self {
        Self {
            pool,
            lock_manager,
            log_manager,
            xact_manager,
        }
    }

    fn root_page(&self, table_id: TableId) -> Result<PageNum, SmallError> {
        let header = self.pool.get_page(table_id, 0)?;
        let root = header.read().page.root_page_number();
        Ok(root)
    }

    /// Descend from the root: at each internal page take the largest
    /// branch whose key is <= the target (or `page_a` when none is).
    fn find_leaf(&self, table_id: TableId, key: i64) -> Result<PageNum, SmallError> {
        let mut current = self.root_page(table_id)?;
        if current == NULL_PAGE_NUM {
            return Ok(NULL_PAGE_NUM);
        }

        loop {
            let page = self.pool.get_page(table_id, current)?;
            let buf = page.read();
            if buf.page.is_leaf() {
                return Ok(current);
            }
            let index = buf.page.child_index(key);
            current = buf.page.child_at(index);
        }
    }

    /// Point lookup. With a transaction, takes a shared lock on the slot
    /// first; a deadlocked request aborts the transaction before failing.
    pub fn find(
        &self,
        table_id: TableId,
        key: i64,
        xact: Option<&Arc<Xact>>,
    ) -> Result<Record, SmallError> {
        let leaf = self.find_leaf(table_id, key)?;
        if leaf == NULL_PAGE_NUM {
            return Err(SmallError::NotFound(key));
        }

        let outcome = {
            let page = self.pool.get_page(table_id, leaf)?;
            let buf = page.read();
            let slot = buf
                .page
                .leaf_slot_of(key)
                .ok_or(SmallError::NotFound(key))?;

            match xact {
                None => LockedRead::Got(buf.page.record(slot)),
                Some(xact) => {
                    let hid = HierarchyId::new(table_id, leaf, slot);
                    let (lock, result) =
                        xact.add_lock(&self.lock_manager, hid, LockType::Shared);
                    match result {
                        LockAcquireResult::Acquired => LockedRead::Got(buf.page.record(slot)),
                        LockAcquireResult::NeedsWait => LockedRead::Wait(lock.unwrap(), slot),
                        _ => LockedRead::Dead,
                    }
                }
            }
        };

        match outcome {
            LockedRead::Got(record) => Ok(record),
            LockedRead::Dead => {
                let xact = xact.unwrap();
                let err = SmallError::Deadlock(xact.id());
                err.show_backtrace();
                self.xact_manager.abort(xact, &self.pool)?;
                Err(err)
            }
            LockedRead::Wait(lock, slot) => {
                if !lock.wait() {
                    return Err(SmallError::TransactionAborted(xact.unwrap().id()));
                }
                let page = self.pool.get_page(table_id, leaf)?;
                let buf = page.read();
                Ok(buf.page.record(slot))
            }
        }
    }

    /// Exclusive-locked value overwrite. The UPDATE record is appended
    /// before the page changes, and the page lsn is stamped with it.
    pub fn update(
        &self,
        table_id: TableId,
        key: i64,
        value: &[u8],
        xact: &Arc<Xact>,
    ) -> SmallResult {
        let leaf = self.find_leaf(table_id, key)?;
        if leaf == NULL_PAGE_NUM {
            return Err(SmallError::NotFound(key));
        }

        let outcome = {
            let page = self.pool.get_page(table_id, leaf)?;
            let mut buf = page.write();
            let slot = buf
                .page
                .leaf_slot_of(key)
                .ok_or(SmallError::NotFound(key))?;

            let hid = HierarchyId::new(table_id, leaf, slot);
            let (lock, result) = xact.add_lock(&self.lock_manager, hid, LockType::Exclusive);
            match result {
                LockAcquireResult::Acquired => {
                    self.apply_update(&mut buf, table_id, leaf, slot, key, value, xact);
                    return Ok(());
                }
                LockAcquireResult::NeedsWait => LockedRead::Wait(lock.unwrap(), slot),
                _ => LockedRead::Dead,
            }
        };

        match outcome {
            LockedRead::Dead => {
                let err = SmallError::Deadlock(xact.id());
                err.show_backtrace();
                self.xact_manager.abort(xact, &self.pool)?;
                Err(err)
            }
            LockedRead::Wait(lock, slot) => {
                if !lock.wait() {
                    return Err(SmallError::TransactionAborted(xact.id()));
                }
                let page = self.pool.get_page(table_id, leaf)?;
                let mut buf = page.write();
                self.apply_update(&mut buf, table_id, leaf, slot, key, value, xact);
                Ok(())
            }
            LockedRead::Got(_) => unreachable!(),
        }
    }

    fn apply_update(
        &self,
        buf: &mut crate::btree::buffer_pool::FrameBuf,
        table_id: TableId,
        leaf: PageNum,
        slot: usize,
        key: i64,
        value: &[u8],
        xact: &Arc<Xact>,
    ) {
        let old = buf.page.record(slot);
        let new = Record::new(key, value);
        let hid = HierarchyId::new(table_id, leaf, slot);

        let lsn = self
            .log_manager
            .log_update(xact, hid, &old.value, &new.value);

        buf.page.write_value(slot, &new.value);
        buf.page.set_page_lsn(lsn);
        buf.mark_dirty();
    }

    /// Inclusive ascending scan, walking the leaf chain.
    pub fn find_range(
        &self,
        table_id: TableId,
        key_start: i64,
        key_end: i64,
    ) -> Result<Vec<Record>, SmallError> {
        let mut out = Vec::new();

        let mut leaf = self.find_leaf(table_id, key_start)?;
        while leaf != NULL_PAGE_NUM {
            let page = self.pool.get_page(table_id, leaf)?;
            let buf = page.read();

            for slot in 0..buf.page.num_keys() {
                let key = buf.page.record_key(slot);
                if key < key_start {
                    continue;
                }
                if key > key_end {
                    return Ok(out);
                }
                out.push(buf.page.record(slot));
            }

            leaf = buf.page.page_a();
        }

        Ok(out)
    }

    // -------------------------------------------------------------------
    // insert path
    // -------------------------------------------------------------------

    pub fn insert(&self, table_id: TableId, record: &Record) -> SmallResult {
        match self.find(table_id, record.key, None) {
            Ok(_) => return Err(SmallError::DuplicateKey(record.key)),
            Err(SmallError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let root = self.root_page(table_id)?;

        if root == NULL_PAGE_NUM {
            return self.start_new_tree(table_id, record);
        }

        let leaf = self.find_leaf(table_id, record.key)?;

        let leaf_num_keys = {
            let page = self.pool.get_page(table_id, leaf)?;
            let n = page.read().page.num_keys();
            n
        };

        if leaf_num_keys < LEAF_ORDER - 1 {
            self.insert_into_leaf(table_id, leaf, record)
        } else {
            self.insert_into_leaf_after_splitting(table_id, leaf, record)
        }
    }

    fn start_new_tree(&self, table_id: TableId, record: &Record) -> SmallResult {
        let new_node = self.pool.create_page(table_id, true)?;

        {
            let header = self.pool.get_page(table_id, 0)?;
            let mut buf = header.write();
            buf.page.set_root_page_number(new_node);
            buf.mark_dirty();
        }

        let page = self.pool.get_page(table_id, new_node)?;
        let mut buf = page.write();
        buf.page.set_parent_page_number(NULL_PAGE_NUM);
        buf.page.set_num_keys(1);
        buf.page.set_record(0, record);
        buf.mark_dirty();

        debug!("table {}: new tree rooted at {}", table_id, new_node);
        Ok(())
    }

    fn insert_into_leaf(&self, table_id: TableId, leaf: PageNum, record: &Record) -> SmallResult {
        let page = self.pool.get_page(table_id, leaf)?;
        let mut buf = page.write();

        let num_keys = buf.page.num_keys();
        let point = buf.page.leaf_insertion_point(record.key);

        let mut slot = num_keys;
        while slot > point {
            let shifted = buf.page.record(slot - 1);
            buf.page.set_record(slot, &shifted);
            slot -= 1;
        }

        buf.page.set_record(point, record);
        buf.page.set_num_keys(num_keys + 1);
        buf.mark_dirty();

        Ok(())
    }

    fn insert_into_leaf_after_splitting(
        &self,
        table_id: TableId,
        leaf: PageNum,
        record: &Record,
    ) -> SmallResult {
        let split_pivot = cut(LEAF_ORDER - 1);

        let new_leaf = self.pool.create_page(table_id, true)?;

        let mut temp: Vec<Record> = Vec::with_capacity(LEAF_ORDER);
        let parent_page_number;
        let old_sibling;
        {
            let page = self.pool.get_page(table_id, leaf)?;
            let mut buf = page.write();

            parent_page_number = buf.page.parent_page_number();
            old_sibling = buf.page.page_a();

            let num_keys = buf.page.num_keys();
            let point = buf.page.leaf_insertion_point(record.key);

            for slot in 0..num_keys {
                if slot == point {
                    temp.push(*record);
                }
                temp.push(buf.page.record(slot));
            }
            if point == num_keys {
                temp.push(*record);
            }

            buf.page.set_num_keys(split_pivot);
            for (slot, entry) in temp.iter().take(split_pivot).enumerate() {
                buf.page.set_record(slot, entry);
            }

            buf.page.set_page_a(new_leaf);
            buf.mark_dirty();
        }

        let insert_key;
        {
            let page = self.pool.get_page(table_id, new_leaf)?;
            let mut buf = page.write();

            for (slot, entry) in temp.iter().skip(split_pivot).enumerate() {
                buf.page.set_record(slot, entry);
            }
            buf.page.set_num_keys(LEAF_ORDER - split_pivot);

            buf.page.set_page_a(old_sibling);
            buf.page.set_parent_page_number(parent_page_number);

            insert_key = temp[split_pivot].key;
            buf.mark_dirty();
        }

        debug!(
            "table {}: leaf {} split, new leaf {}, separator {}",
            table_id, leaf, new_leaf, insert_key
        );

        self.insert_into_parent(table_id, leaf, new_leaf, insert_key)
    }

    fn insert_into_parent(
        &self,
        table_id: TableId,
        left: PageNum,
        right: PageNum,
        key: i64,
    ) -> SmallResult {
        let parent = {
            let page = self.pool.get_page(table_id, left)?;
            let p = page.read().page.parent_page_number();
            p
        };

        if parent == NULL_PAGE_NUM {
            return self.insert_into_new_root(table_id, left, right, key);
        }

        let (num_keys, left_index) = {
            let page = self.pool.get_page(table_id, parent)?;
            let buf = page.read();
            (buf.page.num_keys(), get_left_index(&buf.page, left))
        };

        if num_keys < INTERNAL_ORDER - 1 {
            self.insert_into_node(table_id, parent, left_index, right, key)
        } else {
            self.insert_into_node_after_splitting(table_id, parent, left_index, right, key)
        }
    }

    fn insert_into_new_root(
        &self,
        table_id: TableId,
        left: PageNum,
        right: PageNum,
        key: i64,
    ) -> SmallResult {
        let new_root = self.pool.create_page(table_id, false)?;

        {
            let page = self.pool.get_page(table_id, new_root)?;
            let mut buf = page.write();
            buf.page.set_num_keys(1);
            buf.page.set_page_a(left);
            buf.page.set_branch(0, &Branch { key, child: right });
            buf.mark_dirty();
        }

        for child in [left, right].iter() {
            let page = self.pool.get_page(table_id, *child)?;
            let mut buf = page.write();
            buf.page.set_parent_page_number(new_root);
            buf.mark_dirty();
        }

        let header = self.pool.get_page(table_id, 0)?;
        let mut buf = header.write();
        buf.page.set_root_page_number(new_root);
        buf.mark_dirty();

        debug!("table {}: new root {}", table_id, new_root);
        Ok(())
    }

    fn insert_into_node(
        &self,
        table_id: TableId,
        parent: PageNum,
        left_index: usize,
        right: PageNum,
        key: i64,
    ) -> SmallResult {
        let page = self.pool.get_page(table_id, parent)?;
        let mut buf = page.write();

        let num_keys = buf.page.num_keys();
        let mut slot = num_keys;
        while slot > left_index {
            let shifted = buf.page.branch(slot - 1);
            buf.page.set_branch(slot, &shifted);
            slot -= 1;
        }

        buf.page.set_branch(left_index, &Branch { key, child: right });
        buf.page.set_num_keys(num_keys + 1);
        buf.mark_dirty();

        Ok(())
    }

    fn insert_into_node_after_splitting(
        &self,
        table_id: TableId,
        old: PageNum,
        left_index: usize,
        right: PageNum,
        key: i64,
    ) -> SmallResult {
        let split_pivot = cut(INTERNAL_ORDER);

        let new_page = self.pool.create_page(table_id, false)?;

        let mut temp: Vec<Branch> = Vec::with_capacity(INTERNAL_ORDER);
        let parent_page_number;
        {
            let page = self.pool.get_page(table_id, old)?;
            let mut buf = page.write();

            let num_keys = buf.page.num_keys();
            for slot in 0..num_keys {
                if slot == left_index {
                    temp.push(Branch { key, child: right });
                }
                temp.push(buf.page.branch(slot));
            }
            if left_index == num_keys {
                temp.push(Branch { key, child: right });
            }

            buf.page.set_num_keys(split_pivot - 1);
            for (slot, entry) in temp.iter().take(split_pivot - 1).enumerate() {
                buf.page.set_branch(slot, entry);
            }

            parent_page_number = buf.page.parent_page_number();
            buf.mark_dirty();
        }

        let k_prime = temp[split_pivot - 1].key;
        {
            let page = self.pool.get_page(table_id, new_page)?;
            let mut buf = page.write();

            buf.page.set_page_a(temp[split_pivot - 1].child);
            for (slot, entry) in temp.iter().skip(split_pivot).enumerate() {
                buf.page.set_branch(slot, entry);
            }
            buf.page.set_num_keys(INTERNAL_ORDER - split_pivot);
            buf.page.set_parent_page_number(parent_page_number);
            buf.mark_dirty();

            // every child that moved now answers to the new page
            let moved = buf.page.num_keys() as i64;
            for index in -1..moved {
                let child = buf.page.child_at(index);
                let child_page = self.pool.get_page(table_id, child)?;
                let mut child_buf = child_page.write();
                child_buf.page.set_parent_page_number(new_page);
                child_buf.mark_dirty();
            }
        }

        debug!(
            "table {}: internal {} split, new page {}, separator {}",
            table_id, old, new_page, k_prime
        );

        self.insert_into_parent(table_id, old, new_page, k_prime)
    }

    // -------------------------------------------------------------------
    // delete path
    // -------------------------------------------------------------------

    pub fn remove(&self, table_id: TableId, key: i64) -> SmallResult {
        self.find(table_id, key, None)?;

        let leaf = self.find_leaf(table_id, key)?;
        if leaf == NULL_PAGE_NUM {
            return Err(SmallError::NotFound(key));
        }

        self.delete_entry(table_id, leaf, key)
    }

    fn delete_entry(&self, table_id: TableId, node: PageNum, key: i64) -> SmallResult {
        let (is_leaf, node_num_keys, parent) = {
            let page = self.pool.get_page(table_id, node)?;
            let mut buf = page.write();

            if buf.page.is_leaf() {
                remove_record_from_leaf(&mut buf.page, key);
            } else {
                remove_branch_from_internal(&mut buf.page, key);
            }
            buf.mark_dirty();

            (
                buf.page.is_leaf(),
                buf.page.num_keys(),
                buf.page.parent_page_number(),
            )
        };

        let root = self.root_page(table_id)?;
        if root == node {
            return self.adjust_root(table_id, node);
        }

        if node_num_keys > MERGE_THRESHOLD {
            return Ok(());
        }

        let (neighbor_index, k_prime_index, k_prime, neighbor) = {
            let page = self.pool.get_page(table_id, parent)?;
            let buf = page.read();

            let neighbor_index = get_neighbor_index(&buf.page, node);
            let k_prime_index = if neighbor_index == -1 {
                0
            } else {
                neighbor_index as usize
            };
            let k_prime = buf.page.branch_key(k_prime_index);

            let neighbor = if neighbor_index == -1 {
                buf.page.branch(0).child
            } else if neighbor_index == 0 {
                buf.page.page_a()
            } else {
                buf.page.branch(neighbor_index as usize - 1).child
            };

            (neighbor_index, k_prime_index, k_prime, neighbor)
        };

        // with no previous sibling, the node itself plays the left role
        let (left, right) = if neighbor_index == -1 {
            (node, neighbor)
        } else {
            (neighbor, node)
        };

        let capacity = if is_leaf {
            LEAF_ORDER
        } else {
            INTERNAL_ORDER - 1
        };

        let neighbor_num_keys = {
            let page = self.pool.get_page(table_id, neighbor)?;
            let n = page.read().page.num_keys();
            n
        };

        if neighbor_num_keys + node_num_keys < capacity {
            self.coalesce_nodes(table_id, parent, left, right, k_prime)
        } else {
            self.redistribute_nodes(table_id, parent, left, right, k_prime_index, k_prime)
        }
    }

    /// The root shrank. An empty internal root hands the tree to its only
    /// child; an empty leaf root clears the tree. Either way the old root
    /// page goes back to the free list.
    fn adjust_root(&self, table_id: TableId, root: PageNum) -> SmallResult {
        let (num_keys, is_leaf, page_a) = {
            let page = self.pool.get_page(table_id, root)?;
            let buf = page.read();
            (buf.page.num_keys(), buf.page.is_leaf(), buf.page.page_a())
        };

        if num_keys > 0 {
            return Ok(());
        }

        let new_root = if is_leaf {
            NULL_PAGE_NUM
        } else {
            let page = self.pool.get_page(table_id, page_a)?;
            let mut buf = page.write();
            buf.page.set_parent_page_number(NULL_PAGE_NUM);
            buf.mark_dirty();
            page_a
        };

        {
            let header = self.pool.get_page(table_id, 0)?;
            let mut buf = header.write();
            buf.page.set_root_page_number(new_root);
            buf.mark_dirty();
        }

        debug!("table {}: root {} replaced by {}", table_id, root, new_root);
        self.pool.free_page(table_id, root)
    }

    /// Append `right` into `left` (for internal nodes, pulling the
    /// separator down in front), drop the separator from the parent, and
    /// free `right`.
    fn coalesce_nodes(
        &self,
        table_id: TableId,
        parent: PageNum,
        left: PageNum,
        right: PageNum,
        k_prime: i64,
    ) -> SmallResult {
        {
            let left_page = self.pool.get_page(table_id, left)?;
            let right_page = self.pool.get_page(table_id, right)?;
            let mut lbuf = left_page.write();
            let mut rbuf = right_page.write();

            let insertion_index = lbuf.page.num_keys();

            if rbuf.page.is_leaf() {
                let moved = rbuf.page.num_keys();
                for slot in 0..moved {
                    let record = rbuf.page.record(slot);
                    lbuf.page.set_record(insertion_index + slot, &record);
                }
                lbuf.page.set_num_keys(insertion_index + moved);
                rbuf.page.set_num_keys(0);

                lbuf.page.set_page_a(rbuf.page.page_a());
            } else {
                let moved = rbuf.page.num_keys() + 1;
                for offset in 0..moved {
                    let branch = if offset == 0 {
                        Branch {
                            key: k_prime,
                            child: rbuf.page.page_a(),
                        }
                    } else {
                        rbuf.page.branch(offset - 1)
                    };
                    lbuf.page.set_branch(insertion_index + offset, &branch);

                    let child_page = self.pool.get_page(table_id, branch.child)?;
                    let mut child_buf = child_page.write();
                    child_buf.page.set_parent_page_number(left);
                    child_buf.mark_dirty();
                }
                lbuf.page.set_num_keys(insertion_index + moved);
                rbuf.page.set_num_keys(0);
            }

            lbuf.mark_dirty();
            rbuf.mark_dirty();
        }

        debug!(
            "table {}: coalesced {} into {}, separator {}",
            table_id, right, left, k_prime
        );

        self.delete_entry(table_id, parent, k_prime)?;
        self.pool.free_page(table_id, right)
    }

    /// Shift one entry across the boundary from the fuller sibling and
    /// refresh the separator in the parent.
    fn redistribute_nodes(
        &self,
        table_id: TableId,
        parent: PageNum,
        left: PageNum,
        right: PageNum,
        k_prime_index: usize,
        k_prime: i64,
    ) -> SmallResult {
        let parent_page = self.pool.get_page(table_id, parent)?;
        let left_page = self.pool.get_page(table_id, left)?;
        let right_page = self.pool.get_page(table_id, right)?;

        let mut pbuf = parent_page.write();
        let mut lbuf = left_page.write();
        let mut rbuf = right_page.write();

        let left_num_keys = lbuf.page.num_keys();
        let right_num_keys = rbuf.page.num_keys();

        if left_num_keys < right_num_keys {
            // move right's first entry into left
            if lbuf.page.is_leaf() {
                let moved = rbuf.page.record(0);
                lbuf.page.set_record(left_num_keys, &moved);

                let mut separator = pbuf.page.branch(k_prime_index);
                separator.key = rbuf.page.record_key(1);
                pbuf.page.set_branch(k_prime_index, &separator);

                for slot in 0..right_num_keys - 1 {
                    let shifted = rbuf.page.record(slot + 1);
                    rbuf.page.set_record(slot, &shifted);
                }
            } else {
                let moved_child = rbuf.page.page_a();
                lbuf.page.set_branch(
                    left_num_keys,
                    &Branch {
                        key: k_prime,
                        child: moved_child,
                    },
                );

                {
                    let child_page = self.pool.get_page(table_id, moved_child)?;
                    let mut child_buf = child_page.write();
                    child_buf.page.set_parent_page_number(left);
                    child_buf.mark_dirty();
                }

                let mut separator = pbuf.page.branch(k_prime_index);
                separator.key = rbuf.page.branch_key(0);
                pbuf.page.set_branch(k_prime_index, &separator);

                let new_page_a = rbuf.page.branch(0).child;
                rbuf.page.set_page_a(new_page_a);
                for slot in 0..right_num_keys - 1 {
                    let shifted = rbuf.page.branch(slot + 1);
                    rbuf.page.set_branch(slot, &shifted);
                }
            }

            lbuf.page.set_num_keys(left_num_keys + 1);
            rbuf.page.set_num_keys(right_num_keys - 1);
        } else {
            // move left's last entry into right
            if lbuf.page.is_leaf() {
                let mut slot = right_num_keys;
                while slot > 0 {
                    let shifted = rbuf.page.record(slot - 1);
                    rbuf.page.set_record(slot, &shifted);
                    slot -= 1;
                }

                let moved = lbuf.page.record(left_num_keys - 1);
                rbuf.page.set_record(0, &moved);

                let mut separator = pbuf.page.branch(k_prime_index);
                separator.key = moved.key;
                pbuf.page.set_branch(k_prime_index, &separator);
            } else {
                let mut slot = right_num_keys;
                while slot > 0 {
                    let shifted = rbuf.page.branch(slot - 1);
                    rbuf.page.set_branch(slot, &shifted);
                    slot -= 1;
                }

                let page_a = rbuf.page.page_a();
                rbuf.page.set_branch(
                    0,
                    &Branch {
                        key: k_prime,
                        child: page_a,
                    },
                );

                let moved = lbuf.page.branch(left_num_keys - 1);
                let mut separator = pbuf.page.branch(k_prime_index);
                separator.key = moved.key;
                pbuf.page.set_branch(k_prime_index, &separator);

                rbuf.page.set_page_a(moved.child);

                let child_page = self.pool.get_page(table_id, moved.child)?;
                let mut child_buf = child_page.write();
                child_buf.page.set_parent_page_number(right);
                child_buf.mark_dirty();
            }

            lbuf.page.set_num_keys(left_num_keys - 1);
            rbuf.page.set_num_keys(right_num_keys + 1);
        }

        lbuf.mark_dirty();
        rbuf.mark_dirty();
        pbuf.mark_dirty();

        Ok(())
    }

    /// Render the tree shape for debugging; one line per node, children
    /// indented under their parent.
    pub fn draw_tree(&self, table_id: TableId) -> Result<String, SmallError> {
        let root = self.root_page(table_id)?;
        if root == NULL_PAGE_NUM {
            return Ok("<empty tree>\n".to_string());
        }

        let mut out = String::new();
        self.draw_node(table_id, root, 0, &mut out)?;
        Ok(out)
    }

    fn draw_node(
        &self,
        table_id: TableId,
        node: PageNum,
        depth: usize,
        out: &mut String,
    ) -> SmallResult {
        let (line, children) = {
            let page = self.pool.get_page(table_id, node)?;
            let buf = page.read();
            let indent = "    ".repeat(depth);

            if buf.page.is_leaf() {
                let keys: Vec<i64> = (0..buf.page.num_keys())
                    .map(|slot| buf.page.record_key(slot))
                    .collect();
                (
                    format!("{}leaf {}: {:?} -> {}\n", indent, node, keys, buf.page.page_a()),
                    Vec::new(),
                )
            } else {
                let keys: Vec<i64> = (0..buf.page.num_keys())
                    .map(|slot| buf.page.branch_key(slot))
                    .collect();
                let children: Vec<PageNum> = (-1..buf.page.num_keys() as i64)
                    .map(|index| buf.page.child_at(index))
                    .collect();
                (format!("{}node {}: {:?}\n", indent, node, keys), children)
            }
        };

        out.push_str(&line);
        for child in children {
            self.draw_node(table_id, child, depth + 1, out)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // structural validation
    // -------------------------------------------------------------------

    /// Walk the whole tree and verify its shape: strictly ascending keys,
    /// branch bounds, parent pointers, and a leaf chain that enumerates
    /// every key in order.
    pub fn check_integrity(&self, table_id: TableId) -> SmallResult {
        let root = self.root_page(table_id)?;
        if root == NULL_PAGE_NUM {
            return Ok(());
        }

        let mut keys_via_tree = Vec::new();
        self.check_subtree(
            table_id,
            root,
            NULL_PAGE_NUM,
            None,
            None,
            &mut keys_via_tree,
        )?;

        if !keys_via_tree.iter().tuple_windows().all(|(a, b)| a < b) {
            return Err(SmallError::invariant("tree keys are not strictly ascending"));
        }

        // the leaf chain must produce the same sequence
        let mut keys_via_chain = Vec::new();
        let mut leaf = self.find_leaf(table_id, i64::min_value())?;
        while leaf != NULL_PAGE_NUM {
            let page = self.pool.get_page(table_id, leaf)?;
            let buf = page.read();
            for slot in 0..buf.page.num_keys() {
                keys_via_chain.push(buf.page.record_key(slot));
            }
            leaf = buf.page.page_a();
        }

        if keys_via_tree != keys_via_chain {
            return Err(SmallError::invariant(
                "leaf chain disagrees with tree traversal",
            ));
        }

        Ok(())
    }

    fn check_subtree(
        &self,
        table_id: TableId,
        node: PageNum,
        expected_parent: PageNum,
        lower: Option<i64>,
        upper: Option<i64>,
        keys: &mut Vec<i64>,
    ) -> SmallResult {
        let page = self.pool.get_page(table_id, node)?;
        let buf = page.read();

        if buf.page.parent_page_number() != expected_parent {
            return Err(SmallError::Invariant(format!(
                "page {} parent pointer {} != {}",
                node,
                buf.page.parent_page_number(),
                expected_parent
            )));
        }

        let num_keys = buf.page.num_keys();
        if node != self.root_page(table_id)? && num_keys < 1 {
            return Err(SmallError::Invariant(format!("page {} is empty", node)));
        }

        if buf.page.is_leaf() {
            for slot in 0..num_keys {
                let key = buf.page.record_key(slot);
                if let Some(low) = lower {
                    if key < low {
                        return Err(SmallError::Invariant(format!(
                            "leaf {} key {} below bound {}",
                            node, key, low
                        )));
                    }
                }
                if let Some(high) = upper {
                    if key >= high {
                        return Err(SmallError::Invariant(format!(
                            "leaf {} key {} above bound {}",
                            node, key, high
                        )));
                    }
                }
                keys.push(key);
            }
            return Ok(());
        }

        let branch_keys: Vec<i64> = (0..num_keys).map(|s| buf.page.branch_key(s)).collect();
        if !branch_keys.iter().tuple_windows().all(|(a, b)| a < b) {
            return Err(SmallError::Invariant(format!(
                "internal {} branch keys not ascending",
                node
            )));
        }

        for index in -1..num_keys as i64 {
            let child = buf.page.child_at(index);
            let child_lower = if index == -1 {
                lower
            } else {
                Some(buf.page.branch_key(index as usize))
            };
            let child_upper = if (index + 1) < num_keys as i64 {
                Some(buf.page.branch_key((index + 1) as usize))
            } else {
                upper
            };

            self.check_subtree(table_id, child, node, child_lower, child_upper, keys)?;
        }

        Ok(())
    }
}

/// Position of `left` among the parent's children, counting `page_a` as 0.
fn get_left_index(parent: &PageBuf, left: PageNum) -> usize {
    if parent.page_a() == left {
        return 0;
    }

    let num_keys = parent.num_keys();
    let mut index = 0;
    while index < num_keys && parent.branch(index).child != left {
        index += 1;
    }
    index + 1
}

/// Index of the child pointer naming `node`, where -1 means `page_a`.
fn get_neighbor_index(parent: &PageBuf, node: PageNum) -> i64 {
    let num_keys = parent.num_keys() as i64;
    for index in -1..num_keys {
        if parent.child_at(index) == node {
            return index;
        }
    }
    num_keys
}

fn remove_record_from_leaf(page: &mut PageBuf, key: i64) {
    let num_keys = page.num_keys();
    if let Some(slot) = page.leaf_slot_of(key) {
        for moved in slot + 1..num_keys {
            let shifted = page.record(moved);
            page.set_record(moved - 1, &shifted);
        }
        page.set_num_keys(num_keys - 1);
    }
}

fn remove_branch_from_internal(page: &mut PageBuf, key: i64) {
    let num_keys = page.num_keys();
    if let Some(slot) = page.branch_slot_of(key) {
        for moved in slot + 1..num_keys {
            let shifted = page.branch(moved);
            page.set_branch(moved - 1, &shifted);
        }
        page.set_num_keys(num_keys - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_is_half_rounded_up() {
        assert_eq!(cut(31), 16);
        assert_eq!(cut(32), 16);
        assert_eq!(cut(249), 125);
        assert_eq!(cut(1), 1);
    }
}
