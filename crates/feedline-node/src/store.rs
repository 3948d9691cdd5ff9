//! Product storage contract and the in-memory store.
//!
//! Sessions never mutate stored products. Each reader keeps its own cursor
//! and may suspend until a writer inserts something new.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use feedline_core::{FeedtypeDb, Product, ProductClass, Signature};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was closed for shutdown.
    #[error("product store is closed")]
    Closed,
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store snapshot encode error: {0}")]
    Encode(String),
    #[error("store snapshot decode error: {0}")]
    Decode(String),
}

/// Result of advancing a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextProduct {
    Product(Product),
    /// Nothing matching is stored yet.
    EndOfQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A product with the same signature is already stored.
    Duplicate,
    /// Larger than the store accepts.
    TooBig,
}

/// Read cursor over a store.
pub trait ProductReader: Send {
    /// Positions the cursor at the start of the class's time window.
    fn set_cursor_from_class(&mut self, class: &ProductClass) -> Result<(), StoreError>;

    /// Positions the cursor just after the product with `signature`.
    /// Returns `false` and leaves the cursor alone when it is not stored.
    fn set_cursor_from_signature(&mut self, signature: &Signature) -> Result<bool, StoreError>;

    /// Returns the next product after the cursor that `class` matches.
    fn next_matching(&mut self, class: &ProductClass) -> Result<NextProduct, StoreError>;

    /// Waits at most `max` for something new to be inserted.
    fn suspend(&mut self, max: Duration) -> impl Future<Output = ()> + Send;
}

pub trait ProductWriter: Send {
    fn insert(&mut self, product: Product) -> Result<InsertOutcome, StoreError>;

    fn contains(&self, signature: &Signature) -> Result<bool, StoreError>;

    /// Largest payload the store accepts.
    fn max_product_size(&self) -> u32;
}

/// Shared handle from which readers and writers are opened.
pub trait ProductStore: Clone + Send + Sync + 'static {
    type Reader: ProductReader + 'static;
    type Writer: ProductWriter + 'static;

    fn open_reader(&self) -> Result<Self::Reader, StoreError>;
    fn open_writer(&self) -> Result<Self::Writer, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_products: usize,
    pub max_bytes: usize,
    pub max_product_size: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_products: 100_000,
            max_bytes: 512 * 1024 * 1024,
            max_product_size: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<(u64, Product)>,
    signatures: HashSet<Signature>,
    next_seq: u64,
    bytes: usize,
    closed: bool,
}

impl State {
    fn first_seq(&self) -> u64 {
        self.entries.front().map_or(self.next_seq, |(seq, _)| *seq)
    }

    fn index_of(&self, seq: u64) -> usize {
        usize::try_from(seq.saturating_sub(self.first_seq())).unwrap_or(usize::MAX)
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    inserted: Notify,
    limits: StoreLimits,
    feedtypes: Arc<FeedtypeDb>,
}

/// Bounded in-memory store; the oldest products are evicted first.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}

impl MemoryStore {
    /// Store matching classes over the standard feedtypes.
    pub fn new(limits: StoreLimits) -> Self {
        Self::with_feedtypes(limits, Arc::new(FeedtypeDb::standard()))
    }

    pub fn with_feedtypes(limits: StoreLimits, feedtypes: Arc<FeedtypeDb>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                inserted: Notify::new(),
                limits,
                feedtypes,
            }),
        }
    }

    /// Rebuilds a store from products in insertion order.
    pub fn from_products(limits: StoreLimits, products: Vec<Product>) -> Self {
        let store = Self::new(limits);
        store.restore(products);
        store
    }

    /// Inserts `products` in order, skipping duplicates and oversized ones.
    pub fn restore(&self, products: Vec<Product>) {
        let limits = self.shared.limits;
        let mut state = self.lock();
        for product in products {
            insert_locked(&mut state, &limits, product);
        }
    }

    pub fn feedtypes(&self) -> &Arc<FeedtypeDb> {
        &self.shared.feedtypes
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limits(&self) -> StoreLimits {
        self.shared.limits
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every stored product, oldest first.
    pub fn snapshot(&self) -> Vec<Product> {
        self.lock()
            .entries
            .iter()
            .map(|(_, product)| product.clone())
            .collect()
    }

    /// Refuses further reads and writes and wakes suspended readers.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.inserted.notify_waiters();
    }
}

fn insert_locked(state: &mut State, limits: &StoreLimits, product: Product) -> InsertOutcome {
    if product.info.size > limits.max_product_size {
        return InsertOutcome::TooBig;
    }
    if !state.signatures.insert(product.info.signature) {
        return InsertOutcome::Duplicate;
    }
    state.bytes += product.data.len();
    let seq = state.next_seq;
    state.next_seq += 1;
    state.entries.push_back((seq, product));
    while state.entries.len() > 1
        && (state.entries.len() > limits.max_products || state.bytes > limits.max_bytes)
    {
        if let Some((_, old)) = state.entries.pop_front() {
            state.bytes -= old.data.len();
            state.signatures.remove(&old.info.signature);
        }
    }
    InsertOutcome::Inserted
}

impl ProductStore for MemoryStore {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn open_reader(&self) -> Result<MemoryReader, StoreError> {
        let state = self.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(MemoryReader {
            store: self.clone(),
            cursor: state.first_seq(),
            seen: state.next_seq,
        })
    }

    fn open_writer(&self) -> Result<MemoryWriter, StoreError> {
        if self.lock().closed {
            return Err(StoreError::Closed);
        }
        Ok(MemoryWriter { store: self.clone() })
    }
}

#[derive(Debug)]
pub struct MemoryReader {
    store: MemoryStore,
    /// Sequence number of the next entry to examine.
    cursor: u64,
    /// `next_seq` when the reader last reached the end.
    seen: u64,
}

impl ProductReader for MemoryReader {
    fn set_cursor_from_class(&mut self, class: &ProductClass) -> Result<(), StoreError> {
        let state = self.store.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        self.cursor = state
            .entries
            .iter()
            .find(|(_, product)| product.info.arrival >= class.from)
            .map_or(state.next_seq, |(seq, _)| *seq);
        Ok(())
    }

    fn set_cursor_from_signature(&mut self, signature: &Signature) -> Result<bool, StoreError> {
        let state = self.store.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        match state
            .entries
            .iter()
            .find(|(_, product)| product.info.signature == *signature)
        {
            Some((seq, _)) => {
                self.cursor = seq + 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_matching(&mut self, class: &ProductClass) -> Result<NextProduct, StoreError> {
        let state = self.store.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        let start = state.index_of(self.cursor.max(state.first_seq()));
        for (seq, product) in state.entries.iter().skip(start) {
            self.cursor = seq + 1;
            if class.matches_in(&self.store.shared.feedtypes, &product.info) {
                return Ok(NextProduct::Product(product.clone()));
            }
        }
        self.cursor = state.next_seq;
        self.seen = state.next_seq;
        Ok(NextProduct::EndOfQueue)
    }

    async fn suspend(&mut self, max: Duration) {
        let inserted = self.store.shared.inserted.notified();
        tokio::pin!(inserted);
        inserted.as_mut().enable();
        {
            let state = self.store.lock();
            if state.closed || state.next_seq > self.seen {
                return;
            }
        }
        let _ = tokio::time::timeout(max, inserted).await;
    }
}

#[derive(Debug)]
pub struct MemoryWriter {
    store: MemoryStore,
}

impl ProductWriter for MemoryWriter {
    fn insert(&mut self, product: Product) -> Result<InsertOutcome, StoreError> {
        let outcome = {
            let mut state = self.store.lock();
            if state.closed {
                return Err(StoreError::Closed);
            }
            insert_locked(&mut state, &self.store.shared.limits, product)
        };
        if outcome == InsertOutcome::Inserted {
            self.store.shared.inserted.notify_waiters();
        }
        Ok(outcome)
    }

    fn contains(&self, signature: &Signature) -> Result<bool, StoreError> {
        let state = self.store.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state.signatures.contains(signature))
    }

    fn max_product_size(&self) -> u32 {
        self.store.shared.limits.max_product_size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use feedline_core::{Feedtype, FeedtypeDb, Product, ProductClass, ProductSpec, Timestamp};

    use super::{
        InsertOutcome, MemoryStore, NextProduct, ProductReader, ProductStore, ProductWriter,
        StoreError, StoreLimits,
    };

    fn product(ft: u32, ident: &str, secs: i64) -> Product {
        Product::new(
            Feedtype(ft),
            ident,
            "origin",
            0,
            Timestamp::from_secs(secs),
            ident.as_bytes().to_vec(),
        )
    }

    fn next_ident(reader: &mut impl ProductReader, class: &ProductClass) -> Option<String> {
        match reader.next_matching(class).expect("next") {
            NextProduct::Product(p) => Some(p.info.ident),
            NextProduct::EndOfQueue => None,
        }
    }

    #[test]
    fn readers_see_matching_products_in_order() {
        let store = MemoryStore::default();
        let mut writer = store.open_writer().expect("writer");
        for (ft, ident, secs) in [(1, "a", 10), (2, "b", 20), (1, "c", 30)] {
            assert_eq!(writer.insert(product(ft, ident, secs)).expect("insert"), InsertOutcome::Inserted);
        }
        assert_eq!(writer.insert(product(1, "a", 10)).expect("dup"), InsertOutcome::Duplicate);

        let class = ProductClass::new(
            Timestamp::from_secs(15),
            Timestamp::END,
            vec![ProductSpec::any(Feedtype(1))],
        );
        let mut reader = store.open_reader().expect("reader");
        reader.set_cursor_from_class(&class).expect("cursor");
        assert_eq!(next_ident(&mut reader, &class).as_deref(), Some("c"));
        assert_eq!(next_ident(&mut reader, &class), None);
    }

    #[test]
    fn value_feedtypes_match_by_membership() {
        let mut db = FeedtypeDb::new();
        db.add_leaf("L1", 0x100).expect("L1");
        db.add_leaf("L2", 0x200).expect("L2");
        db.add_value("L12", 0x1000, &["L1", "L2"], &[]).expect("L12");
        let store = MemoryStore::with_feedtypes(StoreLimits::default(), Arc::new(db));
        let mut writer = store.open_writer().expect("writer");
        writer.insert(product(0x100, "a", 10)).expect("insert");
        writer.insert(product(0x200, "b", 11)).expect("insert");

        let class = ProductClass::new(Timestamp::ZERO, Timestamp::END, vec![ProductSpec::any(Feedtype(0x1000))]);
        let mut reader = store.open_reader().expect("reader");
        reader.set_cursor_from_class(&class).expect("cursor");
        assert_eq!(next_ident(&mut reader, &class).as_deref(), Some("a"));
        assert_eq!(next_ident(&mut reader, &class).as_deref(), Some("b"));
    }

    #[test]
    fn signature_cursor_resumes_after_product() {
        let store = MemoryStore::default();
        let mut writer = store.open_writer().expect("writer");
        let first = product(1, "a", 10);
        writer.insert(first.clone()).expect("insert");
        writer.insert(product(1, "b", 11)).expect("insert");

        let class = ProductClass::everything();
        let mut reader = store.open_reader().expect("reader");
        assert!(reader.set_cursor_from_signature(&first.info.signature).expect("cursor"));
        assert_eq!(next_ident(&mut reader, &class).as_deref(), Some("b"));
        assert!(!reader
            .set_cursor_from_signature(&product(1, "zzz", 1).info.signature)
            .expect("cursor"));
    }

    #[test]
    fn oldest_products_are_evicted() {
        let limits = StoreLimits {
            max_products: 2,
            max_bytes: 1024,
            max_product_size: 4,
        };
        let store = MemoryStore::new(limits);
        let mut writer = store.open_writer().expect("writer");
        let mut reader = store.open_reader().expect("reader");
        writer.insert(product(1, "a", 1)).expect("insert");
        writer.insert(product(1, "b", 2)).expect("insert");
        writer.insert(product(1, "c", 3)).expect("insert");
        assert_eq!(writer.insert(product(1, "toolong", 4)).expect("big"), InsertOutcome::TooBig);
        assert_eq!(store.len(), 2);
        assert!(!writer.contains(&product(1, "a", 1).info.signature).expect("contains"));
        assert_eq!(next_ident(&mut reader, &ProductClass::everything()).as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_wakes_on_insert() {
        let store = MemoryStore::default();
        let mut reader = store.open_reader().expect("reader");
        let class = ProductClass::everything();
        assert_eq!(next_ident(&mut reader, &class), None);

        let mut writer = store.open_writer().expect("writer");
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer.insert(product(1, "late", 5)).expect("insert");
        });
        let start = tokio::time::Instant::now();
        reader.suspend(Duration::from_secs(60)).await;
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(next_ident(&mut reader, &class).as_deref(), Some("late"));
        task.await.expect("writer task");
    }

    #[test]
    fn closed_store_refuses_access() {
        let store = MemoryStore::default();
        let mut reader = store.open_reader().expect("reader");
        store.close();
        assert!(matches!(
            reader.next_matching(&ProductClass::everything()),
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.open_writer(), Err(StoreError::Closed)));
    }
}
