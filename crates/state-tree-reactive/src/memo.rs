use std::cell::RefCell;

/// A memoized cell.
///
/// The cached value is returned until [`Memo::invalidate`] clears it;
/// the next read recomputes. Usable behind `&self`.
#[derive(Debug, Default)]
pub struct Memo<T> {
    cached: RefCell<Option<T>>,
}

impl<T: Clone> Memo<T> {
    pub fn new() -> Self {
        Self {
            cached: RefCell::new(None),
        }
    }

    /// Returns the cached value, computing and storing it first if stale.
    pub fn get_or_compute(&self, compute: impl FnOnce() -> T) -> T {
        let mut slot = self.cached.borrow_mut();
        if slot.is_none() {
            *slot = Some(compute());
        }
        slot.as_ref().expect("just filled").clone()
    }

    /// Clears the cache; the next read recomputes.
    pub fn invalidate(&self) {
        *self.cached.borrow_mut() = None;
    }

    pub fn is_valid(&self) -> bool {
        self.cached.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_once_until_invalidated() {
        let memo = Memo::new();
        let mut calls = 0;
        let mut read = |memo: &Memo<i32>| {
            memo.get_or_compute(|| {
                calls += 1;
                42
            })
        };
        assert_eq!(read(&memo), 42);
        assert_eq!(read(&memo), 42);
        drop(read);
        assert_eq!(calls, 1);

        memo.invalidate();
        let value = memo.get_or_compute(|| 7);
        assert_eq!(value, 7);
    }
}
