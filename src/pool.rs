use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use opentelemetry::metrics::UpDownCounter;
use opentelemetry::KeyValue;

/// A pool of reusable byte buffers, instrumented with a buffer-count gauge.
///
/// Used for the UDP read body and the write-request payload so that steady-state packet
/// processing does not allocate. Backed by [`lockfree_object_pool`], the same pooling crate the
/// rest of this codebase's buffer handling relies on.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<lockfree_object_pool::MutexObjectPool<BufferStorage>>,
}

impl BufferPool {
    pub fn new(capacity: usize, tag: &'static str) -> Self {
        let buffer_counter = opentelemetry::global::meter("bindtodevice_dispatch")
            .i64_up_down_counter("dispatch.buffer.count")
            .with_description("Number of buffers currently allocated in a pool.")
            .with_unit("{buffers}")
            .init();

        Self {
            inner: Arc::new(lockfree_object_pool::MutexObjectPool::new(
                move || {
                    BufferStorage::new(
                        vec![0; capacity],
                        buffer_counter.clone(),
                        [
                            KeyValue::new("dispatch.buffer.pool.name", tag),
                            KeyValue::new("dispatch.buffer.pool.capacity", capacity as i64),
                        ],
                    )
                },
                |buf| buf.inner.clear(),
            )),
        }
    }

    pub fn pull(&self) -> Buffer {
        Buffer {
            inner: self.inner.pull_owned(),
        }
    }
}

pub struct Buffer {
    inner: lockfree_object_pool::MutexOwnedReusable<BufferStorage>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Buffer").field(&self.len()).finish()
    }
}

impl Deref for Buffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner.inner
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner.inner
    }
}

/// Wraps a `Vec<u8>` so that dropping it (back into the pool or for good) decrements the
/// buffer-count gauge it was created with.
struct BufferStorage {
    inner: Vec<u8>,
    attributes: [KeyValue; 2],
    counter: UpDownCounter<i64>,
}

impl BufferStorage {
    fn new(inner: Vec<u8>, counter: UpDownCounter<i64>, attributes: [KeyValue; 2]) -> Self {
        counter.add(1, &attributes);

        Self {
            inner,
            counter,
            attributes,
        }
    }
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        self.counter.add(-1, &self.attributes);
    }
}
