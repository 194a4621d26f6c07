//! Resizable byte sequences built as balanced k-ary trees of blocks.
//!
//! A blob is an arbitrarily large byte sequence addressed by the block id
//! of its tree root. Leaves hold payload bytes, inner nodes hold child
//! ids; every node's first byte is its kind, inner nodes also carry their
//! depth:
//!
//! ```text
//! leaf : [ 0x00 ][ payload... ]
//! inner: [ 0x01 ][ depth u8 ][ count u16 LE ][ count × BlockId ]
//! ```
//!
//! Structural invariants: all leaves sit at the same depth; every leaf
//! except the rightmost is full; every inner node except those on the
//! right spine is full. Blob length is not stored anywhere, it is derived
//! from the tree shape plus the rightmost leaf's block size.
//!
//! The root's id is the blob's identity and never changes: growing the
//! tree copies the old root's bytes into a fresh child and rewrites the
//! root in place as an inner node; shrinking copies the only child's
//! bytes back into the root and removes the child.
//!
//! Random access and resize touch one node per level, so they cost
//! O(log_F n) block loads plus the touched leaves.

use std::cmp::Ordering;

use crate::block_id::{BlockId, BLOCK_ID_SIZE};
use crate::error::StoreError;
use crate::parallel::{BlockHandle, ParallelAccessStore};
use crate::store::BlockStore;

/// Node kind byte of a leaf.
pub const LEAF_KIND: u8 = 0;

/// Node kind byte of an inner node.
pub const INNER_KIND: u8 = 1;

/// Header bytes of a leaf node.
pub const LEAF_HEADER_SIZE: usize = 1;

/// Header bytes of an inner node: kind, depth, child count.
pub const INNER_HEADER_SIZE: usize = 4;

/// Tree geometry derived from the plaintext capacity of a block.
#[derive(Clone, Copy, Debug)]
struct NodeLayout {
    capacity: usize,
}

impl NodeLayout {
    fn new(capacity: usize) -> Result<Self, StoreError> {
        let layout = Self { capacity };
        if layout.leaf_capacity() < 1 || layout.fanout() < 2 {
            return Err(StoreError::InvariantViolation(format!(
                "block capacity {capacity} is too small for a blob tree node"
            )));
        }
        Ok(layout)
    }

    /// Payload bytes a leaf can hold.
    fn leaf_capacity(&self) -> usize {
        self.capacity.saturating_sub(LEAF_HEADER_SIZE)
    }

    /// Child ids an inner node can hold.
    fn fanout(&self) -> usize {
        (self.capacity.saturating_sub(INNER_HEADER_SIZE) / BLOCK_ID_SIZE).min(u16::MAX as usize)
    }

    /// Leaves a full subtree of the given depth holds.
    fn leaves_per_subtree(&self, depth: u8) -> u64 {
        (0..depth).fold(1u64, |acc, _| acc.saturating_mul(self.fanout() as u64))
    }

    /// Payload bytes a full subtree of the given depth holds.
    fn bytes_per_subtree(&self, depth: u8) -> u64 {
        self.leaves_per_subtree(depth)
            .saturating_mul(self.leaf_capacity() as u64)
    }

    /// Number of leaves a blob of the given size occupies. An empty blob
    /// still has its root leaf.
    fn leaves_for(&self, size: u64) -> u64 {
        if size == 0 {
            1
        } else {
            size.div_ceil(self.leaf_capacity() as u64)
        }
    }
}

enum Node {
    Leaf { payload_len: usize },
    Inner { depth: u8, children: Vec<BlockId> },
}

fn parse_node(data: &[u8]) -> Result<Node, StoreError> {
    match data.first() {
        Some(&LEAF_KIND) => Ok(Node::Leaf {
            payload_len: data.len() - LEAF_HEADER_SIZE,
        }),
        Some(&INNER_KIND) => {
            if data.len() < INNER_HEADER_SIZE {
                return Err(StoreError::InvariantViolation(
                    "inner node shorter than its header".to_string(),
                ));
            }
            let depth = data[1];
            let count = u16::from_le_bytes([data[2], data[3]]) as usize;
            if depth == 0 || count == 0 {
                return Err(StoreError::InvariantViolation(format!(
                    "inner node with depth {depth} and {count} children"
                )));
            }
            let body = &data[INNER_HEADER_SIZE..];
            if body.len() < count * BLOCK_ID_SIZE {
                return Err(StoreError::InvariantViolation(
                    "inner node truncated".to_string(),
                ));
            }
            let children = body[..count * BLOCK_ID_SIZE]
                .chunks_exact(BLOCK_ID_SIZE)
                .filter_map(BlockId::from_slice)
                .collect();
            Ok(Node::Inner { depth, children })
        }
        _ => Err(StoreError::InvariantViolation(
            "empty or unknown tree node".to_string(),
        )),
    }
}

fn serialize_inner(depth: u8, children: &[BlockId]) -> Vec<u8> {
    let mut data = Vec::with_capacity(INNER_HEADER_SIZE + children.len() * BLOCK_ID_SIZE);
    data.push(INNER_KIND);
    data.push(depth);
    data.extend_from_slice(&(children.len() as u16).to_le_bytes());
    for child in children {
        data.extend_from_slice(child.as_bytes());
    }
    data
}

fn leaf_body(payload_len: usize) -> Vec<u8> {
    let mut data = vec![0u8; LEAF_HEADER_SIZE + payload_len];
    data[0] = LEAF_KIND;
    data
}

fn load_node_handle<B: BlockStore>(
    blocks: &ParallelAccessStore<B>,
    id: &BlockId,
) -> Result<BlockHandle<B>, StoreError> {
    blocks.load(id)?.ok_or_else(|| {
        StoreError::InvariantViolation(format!("blob tree references missing block {id}"))
    })
}

/// Post-order removal of a whole subtree including its root node.
fn remove_subtree<B: BlockStore>(
    blocks: &ParallelAccessStore<B>,
    id: &BlockId,
) -> Result<bool, StoreError> {
    let Some(handle) = blocks.load(id)? else {
        return Ok(false);
    };
    let node = parse_node(handle.read().data())?;
    drop(handle);
    if let Node::Inner { children, .. } = node {
        for child in &children {
            remove_subtree(blocks, child)?;
        }
    }
    blocks.remove_by_id(id)
}

/// Factory and registry of blobs on top of the block store stack.
pub struct BlobStore<B: BlockStore> {
    blocks: ParallelAccessStore<B>,
    layout: NodeLayout,
}

impl<B: BlockStore> BlobStore<B> {
    /// Build a blob store over `blocks` whose plaintext block capacity is
    /// `block_capacity` bytes.
    pub fn new(blocks: ParallelAccessStore<B>, block_capacity: usize) -> Result<Self, StoreError> {
        Ok(Self {
            blocks,
            layout: NodeLayout::new(block_capacity)?,
        })
    }

    /// Create an empty blob: a single empty leaf as root.
    pub fn create(&self) -> Result<Blob<B>, StoreError> {
        let handle = self.blocks.create(leaf_body(0))?;
        let root_id = handle.id();
        drop(handle);
        Ok(Blob {
            blocks: self.blocks.clone(),
            layout: self.layout,
            root_id,
            size: 0,
            depth: 0,
        })
    }

    /// Load an existing blob by its root id, deriving size and depth from
    /// the tree's right spine.
    pub fn load(&self, root_id: &BlockId) -> Result<Option<Blob<B>>, StoreError> {
        let Some(handle) = self.blocks.load(root_id)? else {
            return Ok(None);
        };
        let mut node = parse_node(handle.read().data())?;
        drop(handle);
        let depth = match &node {
            Node::Leaf { .. } => 0,
            Node::Inner { depth, .. } => *depth,
        };
        let mut size = 0u64;
        loop {
            match node {
                Node::Leaf { payload_len } => {
                    size += payload_len as u64;
                    break;
                }
                Node::Inner { depth, children } => {
                    size += (children.len() as u64 - 1) * self.layout.bytes_per_subtree(depth - 1);
                    let last = *children.last().ok_or_else(|| {
                        StoreError::InvariantViolation("inner node without children".to_string())
                    })?;
                    let handle = load_node_handle(&self.blocks, &last)?;
                    let child = parse_node(handle.read().data())?;
                    match (&child, depth) {
                        (Node::Leaf { .. }, 1) => {}
                        (Node::Inner { depth: child_depth, .. }, _) if *child_depth + 1 == depth => {}
                        _ => {
                            return Err(StoreError::InvariantViolation(format!(
                                "tree depth mismatch below {last}"
                            )))
                        }
                    }
                    node = child;
                }
            }
        }
        Ok(Some(Blob {
            blocks: self.blocks.clone(),
            layout: self.layout,
            root_id: *root_id,
            size,
            depth,
        }))
    }

    /// Remove a blob and every block of its tree, children first.
    pub fn remove(&self, root_id: &BlockId) -> Result<bool, StoreError> {
        remove_subtree(&self.blocks, root_id)
    }

    /// The block layer this blob store runs on.
    #[must_use]
    pub fn blocks(&self) -> &ParallelAccessStore<B> {
        &self.blocks
    }

    /// Push all deferred state down to the backend.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.blocks.flush()
    }
}

/// A resizable byte sequence with a stable root block id.
pub struct Blob<B: BlockStore> {
    blocks: ParallelAccessStore<B>,
    layout: NodeLayout,
    root_id: BlockId,
    size: u64,
    depth: u8,
}

impl<B: BlockStore> Blob<B> {
    /// The blob's identity: the block id of its tree root.
    #[must_use]
    pub fn root_id(&self) -> BlockId {
        self.root_id
    }

    /// Current length in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Tree depth: 0 when the root is a leaf.
    #[must_use]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Read `len` bytes at `offset`. The whole range must be inside the
    /// blob; bytes never written read as zeros.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        let out_of_range = || StoreError::OutOfRange {
            offset,
            len: len as u64,
            size: self.size,
        };
        let end = offset.checked_add(len as u64).ok_or_else(out_of_range)?;
        if end > self.size {
            return Err(out_of_range());
        }
        let mut buf = vec![0u8; len];
        if len > 0 {
            self.read_node(&self.root_id, self.depth, offset, &mut buf)?;
        }
        Ok(buf)
    }

    /// Write `data` at `offset`, growing the blob first if the range ends
    /// past the current size.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(StoreError::OutOfRange {
                offset,
                len: data.len() as u64,
                size: self.size,
            })?;
        if end > self.size {
            self.resize(end)?;
        }
        let root = self.root_id;
        self.write_node(&root, self.depth, offset, data)
    }

    /// Change the blob's length. New bytes read as zeros.
    pub fn resize(&mut self, new_size: u64) -> Result<(), StoreError> {
        match new_size.cmp(&self.size) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => self.grow(new_size),
            Ordering::Less => self.shrink_tree(new_size),
        }
    }

    /// Make all previous writes durable in the base store.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.blocks.flush()
    }

    // ------------------------------------------------------------
    // random access
    // ------------------------------------------------------------

    fn read_node(
        &self,
        id: &BlockId,
        depth: u8,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StoreError> {
        let handle = load_node_handle(&self.blocks, id)?;
        if depth == 0 {
            let guard = handle.read();
            let data = guard.data();
            if data.first() != Some(&LEAF_KIND) {
                return Err(StoreError::InvariantViolation(format!(
                    "expected leaf node at {id}"
                )));
            }
            let payload = &data[LEAF_HEADER_SIZE..];
            let start = offset as usize;
            let slice = payload.get(start..start + buf.len()).ok_or_else(|| {
                StoreError::InvariantViolation(format!("leaf {id} shorter than expected"))
            })?;
            buf.copy_from_slice(slice);
            return Ok(());
        }
        let node = parse_node(handle.read().data())?;
        drop(handle);
        let Node::Inner {
            depth: node_depth,
            children,
        } = node
        else {
            return Err(StoreError::InvariantViolation(format!(
                "expected inner node at {id}"
            )));
        };
        if node_depth != depth {
            return Err(StoreError::InvariantViolation(format!(
                "tree depth mismatch at {id}"
            )));
        }
        let child_span = self.layout.bytes_per_subtree(depth - 1);
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let child_idx = (pos / child_span) as usize;
            let child_off = pos % child_span;
            let take = u64::min(child_span - child_off, (buf.len() - done) as u64) as usize;
            let child = children.get(child_idx).ok_or_else(|| {
                StoreError::InvariantViolation(format!("child index out of range at {id}"))
            })?;
            self.read_node(child, depth - 1, child_off, &mut buf[done..done + take])?;
            pos += take as u64;
            done += take;
        }
        Ok(())
    }

    fn write_node(
        &self,
        id: &BlockId,
        depth: u8,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let handle = load_node_handle(&self.blocks, id)?;
        if depth == 0 {
            let mut guard = handle.write();
            if guard.data().first() != Some(&LEAF_KIND) {
                return Err(StoreError::InvariantViolation(format!(
                    "expected leaf node at {id}"
                )));
            }
            if !guard.write_at(LEAF_HEADER_SIZE + offset as usize, data) {
                return Err(StoreError::InvariantViolation(format!(
                    "write past the end of leaf {id}"
                )));
            }
            return Ok(());
        }
        let node = parse_node(handle.read().data())?;
        drop(handle);
        let Node::Inner {
            depth: node_depth,
            children,
        } = node
        else {
            return Err(StoreError::InvariantViolation(format!(
                "expected inner node at {id}"
            )));
        };
        if node_depth != depth {
            return Err(StoreError::InvariantViolation(format!(
                "tree depth mismatch at {id}"
            )));
        }
        let child_span = self.layout.bytes_per_subtree(depth - 1);
        let mut pos = offset;
        let mut done = 0usize;
        while done < data.len() {
            let child_idx = (pos / child_span) as usize;
            let child_off = pos % child_span;
            let take = u64::min(child_span - child_off, (data.len() - done) as u64) as usize;
            let child = children.get(child_idx).ok_or_else(|| {
                StoreError::InvariantViolation(format!("child index out of range at {id}"))
            })?;
            self.write_node(child, depth - 1, child_off, &data[done..done + take])?;
            pos += take as u64;
            done += take;
        }
        Ok(())
    }

    // ------------------------------------------------------------
    // resize
    // ------------------------------------------------------------

    fn grow(&mut self, new_size: u64) -> Result<(), StoreError> {
        let orig = self.size;
        match self.grow_tree(new_size) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Roll the partially grown tree back so the blob keeps its
                // original shape; the error still surfaces. This also
                // collapses a root that was promoted without ever
                // receiving its new leaf.
                if let Err(cleanup) = self.shrink_tree(orig) {
                    log::warn!(
                        "could not roll back partially grown blob {}: {cleanup}",
                        self.root_id
                    );
                }
                Err(e)
            }
        }
    }

    fn grow_tree(&mut self, new_size: u64) -> Result<(), StoreError> {
        let leaf_cap = self.layout.leaf_capacity() as u64;
        let cur_leaves = self.layout.leaves_for(self.size);
        let tgt_leaves = self.layout.leaves_for(new_size);

        // Fill up the current rightmost leaf first.
        let grown_last = if tgt_leaves > cur_leaves {
            cur_leaves * leaf_cap
        } else {
            new_size
        };
        let last_payload = grown_last - (cur_leaves - 1) * leaf_cap;
        self.set_last_leaf_payload(last_payload as usize)?;
        self.size = grown_last;

        // Then append fresh leaves along the right spine.
        let mut leaves = cur_leaves;
        while leaves < tgt_leaves {
            let payload = if leaves + 1 == tgt_leaves {
                new_size - leaves * leaf_cap
            } else {
                leaf_cap
            };
            self.append_leaf(payload as usize, leaves)?;
            leaves += 1;
            self.size = (leaves - 1) * leaf_cap + payload;
        }
        Ok(())
    }

    /// Append one leaf holding `payload` zero bytes to a tree currently
    /// holding `cur_leaves` leaves.
    fn append_leaf(&mut self, payload: usize, cur_leaves: u64) -> Result<(), StoreError> {
        while cur_leaves == self.layout.leaves_per_subtree(self.depth) {
            self.promote_root()?;
        }
        let root = self.root_id;
        self.append_into(&root, self.depth, cur_leaves, payload)
    }

    /// Put the current root's bytes under a new child and turn the root
    /// into an inner node above it, keeping the root id stable.
    fn promote_root(&mut self) -> Result<(), StoreError> {
        let root = load_node_handle(&self.blocks, &self.root_id)?;
        let body_copy = root.read().data().to_vec();
        let child = self.blocks.create(body_copy)?;
        let child_id = child.id();
        drop(child);
        root.write()
            .set_body(serialize_inner(self.depth + 1, &[child_id]));
        self.depth += 1;
        Ok(())
    }

    /// Descend the right spine of a non-full subtree and hang a new leaf
    /// (plus any connecting inner nodes) at the deepest spot with room.
    fn append_into(
        &self,
        id: &BlockId,
        depth: u8,
        leaves_in_subtree: u64,
        leaf_payload: usize,
    ) -> Result<(), StoreError> {
        if depth == 0 {
            return Err(StoreError::InvariantViolation(
                "cannot append below a leaf".to_string(),
            ));
        }
        let handle = load_node_handle(&self.blocks, id)?;
        let node = parse_node(handle.read().data())?;
        let Node::Inner {
            depth: node_depth,
            mut children,
        } = node
        else {
            return Err(StoreError::InvariantViolation(format!(
                "expected inner node at {id}"
            )));
        };
        if node_depth != depth {
            return Err(StoreError::InvariantViolation(format!(
                "tree depth mismatch at {id}"
            )));
        }
        let per_child = self.layout.leaves_per_subtree(depth - 1);
        let leaves_in_last = leaves_in_subtree - (children.len() as u64 - 1) * per_child;
        if leaves_in_last < per_child {
            let last = *children.last().ok_or_else(|| {
                StoreError::InvariantViolation("inner node without children".to_string())
            })?;
            drop(handle);
            return self.append_into(&last, depth - 1, leaves_in_last, leaf_payload);
        }
        if children.len() >= self.layout.fanout() {
            return Err(StoreError::InvariantViolation(format!(
                "appending into a full node at {id}"
            )));
        }
        let chain = self.create_chain(depth - 1, leaf_payload)?;
        children.push(chain);
        handle.write().set_body(serialize_inner(depth, &children));
        Ok(())
    }

    /// Create a leaf plus `levels` single-child inner nodes above it.
    /// Cleans up after itself when a creation fails partway.
    fn create_chain(&self, levels: u8, leaf_payload: usize) -> Result<BlockId, StoreError> {
        let mut created: Vec<BlockId> = Vec::new();
        let result = (|| {
            let leaf = self.blocks.create(leaf_body(leaf_payload))?;
            let mut top = leaf.id();
            drop(leaf);
            created.push(top);
            for level in 1..=levels {
                let inner = self.blocks.create(serialize_inner(level, &[top]))?;
                top = inner.id();
                drop(inner);
                created.push(top);
            }
            Ok(top)
        })();
        if result.is_err() {
            for id in created.iter().rev() {
                if let Err(e) = self.blocks.remove_by_id(id) {
                    log::warn!("could not remove block {id} while rolling back a failed resize: {e}");
                }
            }
        }
        result
    }

    fn shrink_tree(&mut self, new_size: u64) -> Result<(), StoreError> {
        let leaf_cap = self.layout.leaf_capacity() as u64;
        let tgt_leaves = self.layout.leaves_for(new_size);
        let root = self.root_id;
        self.prune(&root, self.depth, tgt_leaves)?;
        let last_payload = new_size - (tgt_leaves - 1) * leaf_cap;
        self.set_last_leaf_payload(last_payload as usize)?;
        self.collapse_root()?;
        self.size = new_size;
        Ok(())
    }

    /// Trim a subtree down to its first `keep_leaves` leaves, removing
    /// whole child subtrees right to left, children before parents.
    fn prune(&self, id: &BlockId, depth: u8, keep_leaves: u64) -> Result<(), StoreError> {
        if depth == 0 {
            return Ok(());
        }
        let handle = load_node_handle(&self.blocks, id)?;
        let node = parse_node(handle.read().data())?;
        let Node::Inner {
            depth: node_depth,
            children,
        } = node
        else {
            return Err(StoreError::InvariantViolation(format!(
                "expected inner node at {id}"
            )));
        };
        if node_depth != depth {
            return Err(StoreError::InvariantViolation(format!(
                "tree depth mismatch at {id}"
            )));
        }
        let per_child = self.layout.leaves_per_subtree(depth - 1);
        let keep_children = keep_leaves.div_ceil(per_child) as usize;
        if keep_children > children.len() {
            return Err(StoreError::InvariantViolation(format!(
                "tree at {id} is smaller than its blob claims"
            )));
        }
        let removed: Vec<BlockId> = children[keep_children..].to_vec();
        if !removed.is_empty() {
            handle
                .write()
                .set_body(serialize_inner(depth, &children[..keep_children]));
        }
        drop(handle);
        for victim in &removed {
            remove_subtree(&self.blocks, victim)?;
        }
        let leaves_in_last = keep_leaves - (keep_children as u64 - 1) * per_child;
        self.prune(&children[keep_children - 1], depth - 1, leaves_in_last)
    }

    /// While the root has a single child, move that child's bytes into
    /// the root and drop the child block.
    fn collapse_root(&mut self) -> Result<(), StoreError> {
        loop {
            let root = load_node_handle(&self.blocks, &self.root_id)?;
            let node = parse_node(root.read().data())?;
            match node {
                Node::Inner { children, .. } if children.len() == 1 => {
                    let child_id = children[0];
                    let child = load_node_handle(&self.blocks, &child_id)?;
                    let child_body = child.read().data().to_vec();
                    drop(child);
                    root.write().set_body(child_body);
                    drop(root);
                    self.blocks.remove_by_id(&child_id)?;
                    self.depth -= 1;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Resize the rightmost leaf so it holds exactly `payload` bytes.
    fn set_last_leaf_payload(&self, payload: usize) -> Result<(), StoreError> {
        let mut id = self.root_id;
        let mut depth = self.depth;
        while depth > 0 {
            let handle = load_node_handle(&self.blocks, &id)?;
            let node = parse_node(handle.read().data())?;
            let Node::Inner {
                depth: node_depth,
                children,
            } = node
            else {
                return Err(StoreError::InvariantViolation(format!(
                    "expected inner node at {id}"
                )));
            };
            if node_depth != depth {
                return Err(StoreError::InvariantViolation(format!(
                    "tree depth mismatch at {id}"
                )));
            }
            id = *children.last().ok_or_else(|| {
                StoreError::InvariantViolation("inner node without children".to_string())
            })?;
            depth -= 1;
        }
        let handle = load_node_handle(&self.blocks, &id)?;
        let mut guard = handle.write();
        if guard.data().first() != Some(&LEAF_KIND) {
            return Err(StoreError::InvariantViolation(format!(
                "expected leaf node at {id}"
            )));
        }
        if guard.size() != LEAF_HEADER_SIZE + payload {
            guard.resize(LEAF_HEADER_SIZE + payload);
        }
        Ok(())
    }
}
