//! The content chunker: byte streams to fixed-branching Merkle trees.
//!
//! A document is split into chunks of at most `chunk_size` payload bytes.
//! Every chunk starts with the little-endian 64-bit size of the subtree it
//! roots; a leaf carries raw bytes after the prefix, an internal node carries
//! the concatenated keys of up to `branches` children. The document hash is
//! the key of the root chunk, so any byte stream maps to a single address
//! and back.
//!
//! Retrieval is the inverse walk: child subtrees are fetched concurrently
//! and joined before their range of the document is readable, giving the
//! reader random access by offset with a fixed total size.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::address::{Address, Key, ADDRESS_LENGTH};
use crate::error::{RetrieveError, StoreError};
use crate::store::ChunkStore;

/// Width of the subtree-size prefix at the head of every chunk.
const SIZE_PREFIX: usize = 8;

/// Splits documents into chunk trees and reassembles them.
#[derive(Clone, Copy, Debug)]
pub struct TreeChunker {
    chunk_size: usize,
    branches: usize,
}

impl Default for TreeChunker {
    fn default() -> Self {
        Self::new(4096, 128)
    }
}

impl TreeChunker {
    pub fn new(chunk_size: usize, branches: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            branches: branches.max(2),
        }
    }

    /// Largest subtree size a single child covers for a parent of `size`
    /// bytes: `chunk_size * branches^depth` for the smallest depth that
    /// makes `branches` children suffice.
    fn child_span(&self, size: u64) -> u64 {
        let branches = self.branches as u64;
        let mut span = self.chunk_size as u64;
        while span * branches < size {
            span *= branches;
        }
        span
    }

    /// Split `data` into a chunk tree, writing every chunk through `store`.
    /// Returns the document key (the root chunk's address).
    pub async fn split(&self, data: &[u8], store: &dyn ChunkStore) -> Result<Key, StoreError> {
        self.split_tree(data, store).await
    }

    fn split_tree<'a>(
        &'a self,
        data: &'a [u8],
        store: &'a dyn ChunkStore,
    ) -> BoxFuture<'a, Result<Key, StoreError>> {
        async move {
            let size = data.len() as u64;
            let mut chunk = Vec::with_capacity(SIZE_PREFIX + self.chunk_size.min(data.len()));
            chunk.extend_from_slice(&size.to_le_bytes());
            if data.len() <= self.chunk_size {
                chunk.extend_from_slice(data);
            } else {
                let span = self.child_span(size) as usize;
                for sub in data.chunks(span) {
                    let child = self.split_tree(sub, store).await?;
                    chunk.extend_from_slice(child.as_bytes());
                }
            }
            let key = Address::hash(&chunk);
            store.put(key, chunk).await?;
            Ok(key)
        }
        .boxed()
    }

    /// Open a reader over the document rooted at `key`.
    pub async fn open(
        &self,
        store: Arc<dyn ChunkStore>,
        root: Key,
    ) -> Result<ChunkReader, RetrieveError> {
        let chunk = store.get(&root).await?;
        let (size, _) = parse_chunk(&root, &chunk)?;
        Ok(ChunkReader {
            chunker: *self,
            store,
            root,
            size,
        })
    }

    /// Fetch and reassemble a whole document.
    pub async fn join(
        &self,
        store: Arc<dyn ChunkStore>,
        root: Key,
    ) -> Result<Vec<u8>, RetrieveError> {
        self.open(store, root).await?.read_all().await
    }
}

fn parse_chunk<'a>(key: &Key, raw: &'a [u8]) -> Result<(u64, &'a [u8]), RetrieveError> {
    if raw.len() < SIZE_PREFIX {
        return Err(RetrieveError::InvalidChunk(*key));
    }
    let mut prefix = [0u8; SIZE_PREFIX];
    prefix.copy_from_slice(&raw[..SIZE_PREFIX]);
    Ok((u64::from_le_bytes(prefix), &raw[SIZE_PREFIX..]))
}

/// Random-access view of a chunked document: a fixed [`size`](Self::size)
/// and offset reads that fetch only the subtrees covering the requested
/// range, in parallel.
pub struct ChunkReader {
    chunker: TreeChunker,
    store: Arc<dyn ChunkStore>,
    root: Key,
    size: u64,
}

impl fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkReader")
            .field("chunker", &self.chunker)
            .field("root", &self.root)
            .field("size", &self.size)
            .finish()
    }
}

impl ChunkReader {
    /// Total document size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn root(&self) -> Key {
        self.root
    }

    /// Read up to `len` bytes starting at `offset`. Reads past the end are
    /// truncated; a read at or beyond the end returns an empty buffer.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, RetrieveError> {
        let end = (offset.saturating_add(len as u64)).min(self.size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let want = offset..end;
        let pieces = self.fetch_range(self.root, 0, &want).await?;
        let mut out = vec![0u8; (end - offset) as usize];
        for (base, bytes) in pieces {
            let at = (base - offset) as usize;
            out[at..at + bytes.len()].copy_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Read the whole document.
    pub async fn read_all(&self) -> Result<Vec<u8>, RetrieveError> {
        self.read_at(0, self.size as usize).await
    }

    fn fetch_range<'a>(
        &'a self,
        key: Key,
        base: u64,
        want: &'a Range<u64>,
    ) -> BoxFuture<'a, Result<Vec<(u64, Vec<u8>)>, RetrieveError>> {
        async move {
            let chunk = self.store.get(&key).await?;
            let (size, payload) = parse_chunk(&key, &chunk)?;

            if payload.len() as u64 == size {
                // leaf: clip the payload to the requested range
                let start = want.start.max(base);
                let end = want.end.min(base + size);
                if start >= end {
                    return Ok(Vec::new());
                }
                let lo = (start - base) as usize;
                let hi = (end - base) as usize;
                return Ok(vec![(start, payload[lo..hi].to_vec())]);
            }

            if payload.len() % ADDRESS_LENGTH != 0 {
                return Err(RetrieveError::InvalidChunk(key));
            }
            let span = self.chunker.child_span(size);
            let children = payload.len() / ADDRESS_LENGTH;
            let expected = size.div_ceil(span) as usize;
            if children != expected {
                return Err(RetrieveError::InvalidChunk(key));
            }

            let mut fetches = Vec::new();
            for (i, raw) in payload.chunks(ADDRESS_LENGTH).enumerate() {
                let child_base = base + i as u64 * span;
                let child_end = (child_base + span).min(base + size);
                if child_end <= want.start || child_base >= want.end {
                    continue;
                }
                let mut child = [0u8; ADDRESS_LENGTH];
                child.copy_from_slice(raw);
                fetches.push(self.fetch_range(Address(child), child_base, want));
            }
            let sections = future::try_join_all(fetches).await?;
            Ok(sections.into_iter().flatten().collect())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KVStore, LocalStore, SledKv};

    fn temp_store() -> (sled::Db, Arc<LocalStore>) {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        let kv: Arc<dyn KVStore> = Arc::new(SledKv::new(db.open_tree("chunks").expect("tree")));
        let store = LocalStore::new(kv, 10_000, 100_000).expect("store");
        (db, Arc::new(store))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn split_and_join_roundtrip_across_boundaries() {
        let (_db, store) = temp_store();
        let chunker = TreeChunker::default();
        for len in [0usize, 1, 4095, 4096, 4097, 1 << 20] {
            let data = pattern(len);
            let root = chunker
                .split(&data, store.as_ref())
                .await
                .expect("split");
            let joined = chunker
                .join(store.clone() as Arc<dyn ChunkStore>, root)
                .await
                .expect("join");
            assert_eq!(joined, data, "length {len}");
        }
    }

    #[tokio::test]
    async fn large_document_roundtrip() {
        let (_db, store) = temp_store();
        let chunker = TreeChunker::default();
        let data = pattern(16 << 20);
        let root = chunker.split(&data, store.as_ref()).await.expect("split");
        let joined = chunker
            .join(store.clone() as Arc<dyn ChunkStore>, root)
            .await
            .expect("join");
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn split_is_deterministic() {
        let (_db, store) = temp_store();
        let chunker = TreeChunker::default();
        let data = pattern(300_000);
        let one = chunker.split(&data, store.as_ref()).await.expect("one");
        let two = chunker.split(&data, store.as_ref()).await.expect("two");
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn read_at_returns_ranges_by_offset() {
        let (_db, store) = temp_store();
        let chunker = TreeChunker::new(64, 4);
        let data = pattern(10_000);
        let root = chunker.split(&data, store.as_ref()).await.expect("split");
        let reader = chunker
            .open(store.clone() as Arc<dyn ChunkStore>, root)
            .await
            .expect("open");
        assert_eq!(reader.size(), data.len() as u64);

        for (offset, len) in [(0usize, 10), (63, 2), (4096, 1000), (9_990, 100)] {
            let end = (offset + len).min(data.len());
            let got = reader.read_at(offset as u64, len).await.expect("read_at");
            assert_eq!(got, data[offset..end], "offset {offset} len {len}");
        }
        assert!(reader
            .read_at(20_000, 10)
            .await
            .expect("past end")
            .is_empty());
    }

    #[tokio::test]
    async fn missing_chunk_surfaces_unavailable() {
        let (_db, store) = temp_store();
        let chunker = TreeChunker::default();
        let missing = Address::hash(b"never stored");
        let err = chunker
            .open(store.clone() as Arc<dyn ChunkStore>, missing)
            .await
            .expect_err("must fail");
        assert!(matches!(err, RetrieveError::ChunkUnavailable(k) if k == missing));
    }
}
