use bytes::BytesMut;
use std::sync::Mutex;

const MIN_CLASS_SHIFT: u32 = 6;
const MAX_CLASS_SHIFT: u32 = 20;
const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
const DEFAULT_BUFFERS_PER_CLASS: usize = 64;

/// Recycles packet storage in power of two capacity classes so that busy
/// connections do not thrash the heap with short lived byte arrays
pub struct BufferPool {
    classes: Mutex<Vec<Vec<BytesMut>>>,
    buffers_per_class: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFERS_PER_CLASS)
    }

    pub fn with_capacity(buffers_per_class: usize) -> Self {
        Self {
            classes: Mutex::new(vec![Vec::new(); CLASS_COUNT]),
            buffers_per_class,
        }
    }

    /// Returns a zero filled buffer of exactly `size` bytes
    pub fn get(self: &Self, size: usize) -> BytesMut {
        let capacity = size.max(1 << MIN_CLASS_SHIFT).next_power_of_two();
        let mut buffer = match class_of_request(capacity) {
            Some(class) => self
                .lock_classes()
                .get_mut(class)
                .and_then(|buffers| buffers.pop())
                .unwrap_or_else(|| BytesMut::with_capacity(capacity)),
            None => BytesMut::with_capacity(size),
        };
        buffer.clear();
        buffer.resize(size, 0);
        buffer
    }

    pub fn reuse(self: &Self, mut buffer: BytesMut) {
        let Some(class) = class_of_buffer(buffer.capacity()) else {
            return;
        };
        let mut classes = self.lock_classes();
        if let Some(buffers) = classes.get_mut(class) {
            if buffers.len() < self.buffers_per_class {
                buffer.clear();
                buffers.push(buffer);
            }
        }
    }

    /// Number of idle buffers held by the pool
    pub fn pooled_count(self: &Self) -> usize {
        self.lock_classes().iter().map(|buffers| buffers.len()).sum()
    }

    fn lock_classes(self: &Self) -> std::sync::MutexGuard<'_, Vec<Vec<BytesMut>>> {
        self.classes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

fn class_of_request(capacity: usize) -> Option<usize> {
    let shift = capacity.trailing_zeros();
    if shift > MAX_CLASS_SHIFT {
        None
    } else {
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }
}

// A buffer serves requests up to the largest power of two that fits its capacity
fn class_of_buffer(capacity: usize) -> Option<usize> {
    if capacity < (1 << MIN_CLASS_SHIFT) {
        return None;
    }
    let shift = usize::BITS - 1 - capacity.leading_zeros();
    if shift > MAX_CLASS_SHIFT {
        None
    } else {
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }
}
