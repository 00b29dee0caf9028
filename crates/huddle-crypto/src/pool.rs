// LIFO pool reusing per-frame scratch objects across threads.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Mutex-guarded LIFO pool. Acquisition lazily creates, release pushes
/// back; the encryptor and decryptor reuse their frame processors through
/// this to keep per-frame allocations warm.
#[derive(Debug, Default)]
pub struct Pool<T: Default> {
    items: Mutex<Vec<T>>,
}

impl<T: Default> Pool<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Take an object from the pool, creating one when empty. The object
    /// returns to the pool when the guard drops.
    pub fn acquire(&self) -> Pooled<'_, T> {
        let item = self.items.lock().unwrap().pop().unwrap_or_default();
        Pooled {
            pool: self,
            item: Some(item),
        }
    }

    fn release(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

/// RAII handle to a pooled object.
#[derive(Debug)]
pub struct Pooled<'a, T: Default> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T: Default> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until drop")
    }
}

impl<T: Default> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until drop")
    }
}

impl<T: Default> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}
