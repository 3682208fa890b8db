/// A free list for objects whose lifetime crosses packet boundaries, such
/// as queued commands and state records. Allocation falls back to `Default`
/// when the list is dry; recycled values are handed back as-is, so callers
/// overwrite every field they care about.
#[derive(Debug)]
pub struct Pool<T: Default> {
    free: Vec<T>,
    max_retained: usize,
}

impl<T: Default> Pool<T> {
    pub fn new(max_retained: usize) -> Self {
        Self {
            free: Vec::new(),
            max_retained,
        }
    }

    pub fn allocate(&mut self) -> T {
        self.free.pop().unwrap_or_default()
    }

    pub fn free(&mut self, value: T) {
        if self.free.len() < self.max_retained {
            self.free.push(value);
        }
    }

    pub fn retained(&self) -> usize {
        self.free.len()
    }
}

impl<T: Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_freed_values() {
        let mut pool: Pool<Vec<u8>> = Pool::new(4);
        let mut v = pool.allocate();
        v.reserve(128);
        let capacity = v.capacity();
        pool.free(v);

        let reused = pool.allocate();
        assert_eq!(reused.capacity(), capacity);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn retention_is_bounded() {
        let mut pool: Pool<u32> = Pool::new(2);
        pool.free(1);
        pool.free(2);
        pool.free(3);
        assert_eq!(pool.retained(), 2);
    }
}
