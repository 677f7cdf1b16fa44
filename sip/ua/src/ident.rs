//! Call-ID and tag generation.
//!
//! Hot paths pop pre-generated values from two bounded pools; a miss
//! falls back to generating inline. The pools are topped up by the
//! stack's housekeeping task, never by the caller.

use bytesstr::BytesStr;
use parking_lot::Mutex;
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const CALL_ID_ENTROPY: usize = 16;
const TAG_ENTROPY: usize = 8;
const CALL_ID_SUFFIX: &str = "@softphone";
const POOL_CAPACITY: usize = 128;

/// Produces Call-IDs and tags for the whole stack.
///
/// Cheap to clone, handed to the stack on construction; there are no
/// hidden globals. In test mode every value is deterministic.
#[derive(Clone)]
pub struct IdentifierService {
    inner: Arc<Inner>,
}

struct Inner {
    /// Process-unique entropy captured once at startup
    node_id: [u8; 4],
    seq: AtomicU64,

    call_ids: Pool,
    tags: Pool,

    hits: AtomicU64,
    misses: AtomicU64,
    generated: AtomicU64,

    test_mode: bool,
}

struct Pool {
    entries: Mutex<VecDeque<BytesStr>>,
}

impl Pool {
    fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(POOL_CAPACITY)),
        }
    }

    /// Non-blocking pop; contention counts as a miss
    fn pop(&self) -> Option<BytesStr> {
        self.entries.try_lock()?.pop_front()
    }

    fn push(&self, value: BytesStr) -> bool {
        let mut entries = self.entries.lock();

        if entries.len() >= POOL_CAPACITY {
            return false;
        }

        entries.push_back(value);
        true
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl IdentifierService {
    pub fn new(test_mode: bool) -> Self {
        let mut node_id = [0u8; 4];

        if !test_mode {
            fill_random(&mut node_id, &[0, 0, 0, 0], &AtomicU64::new(0));
        }

        let service = Self {
            inner: Arc::new(Inner {
                node_id,
                seq: AtomicU64::new(0),
                call_ids: Pool::new(),
                tags: Pool::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                generated: AtomicU64::new(0),
                test_mode,
            }),
        };

        if !test_mode {
            service.refill();
        }

        service
    }

    /// A fresh Call-ID, `<hex>@softphone`
    pub fn call_id(&self) -> BytesStr {
        self.inner.generated.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.inner.call_ids.pop() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return value;
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        self.inner.generate_call_id()
    }

    /// A fresh From/To tag
    pub fn tag(&self) -> BytesStr {
        self.inner.generated.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.inner.tags.pop() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return value;
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        self.inner.generate_tag()
    }

    /// A Via branch with the RFC 3261 magic cookie
    pub fn branch(&self) -> BytesStr {
        let mut branch = String::from(crate::timer::consts::RFC3261_BRANCH_PREFIX);
        branch.push_str(&self.inner.generate_hex(8));
        branch.into()
    }

    /// Top the pools up to capacity. Called by housekeeping, not by the
    /// id consumers.
    pub fn refill(&self) {
        while self.inner.call_ids.len() < POOL_CAPACITY {
            if !self.inner.call_ids.push(self.inner.generate_call_id()) {
                break;
            }
        }

        while self.inner.tags.len() < POOL_CAPACITY {
            if !self.inner.tags.push(self.inner.generate_tag()) {
                break;
            }
        }
    }

    /// `(hits, misses, total)` counters; `total == hits + misses`
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.inner.hits.load(Ordering::Relaxed),
            self.inner.misses.load(Ordering::Relaxed),
            self.inner.generated.load(Ordering::Relaxed),
        )
    }
}

impl Inner {
    fn generate_call_id(&self) -> BytesStr {
        let mut value = self.generate_hex(CALL_ID_ENTROPY);
        value.push_str(CALL_ID_SUFFIX);
        value.into()
    }

    fn generate_tag(&self) -> BytesStr {
        self.generate_hex(TAG_ENTROPY).into()
    }

    fn generate_hex(&self, bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];

        if self.test_mode {
            // deterministic: sequence number spread over the buffer
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            for (idx, b) in buf.iter_mut().enumerate() {
                *b = (seq >> ((idx % 8) * 8)) as u8 ^ idx as u8;
            }
        } else {
            fill_random(&mut buf, &self.node_id, &self.seq);
        }

        let mut out = String::with_capacity(bytes * 2);
        for b in buf {
            let _ = write!(out, "{:02x}", b);
        }

        out
    }
}

/// Fill `buf` from the OS CSPRNG, mixed with the node id and a sequence
/// counter. When the CSPRNG is unavailable fall back to timestamp,
/// counter and node id alone.
fn fill_random(buf: &mut [u8], node_id: &[u8; 4], seq: &AtomicU64) {
    let seq = seq.fetch_add(1, Ordering::Relaxed);

    if OsRng.try_fill_bytes(buf).is_err() {
        log::warn!("OS entropy source unavailable, using safe-mode identifier generation");

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(seq);

        let mut state = nanos ^ seq.rotate_left(32);
        for (idx, b) in buf.iter_mut().enumerate() {
            // xorshift over timestamp, counter and node id
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = (state as u8) ^ node_id[idx % 4];
        }

        return;
    }

    // mix so that two processes seeded identically still diverge
    for (idx, b) in buf.iter_mut().enumerate() {
        *b ^= node_id[idx % 4] ^ (seq >> ((idx % 8) * 8)) as u8;
    }
}
