use std::collections::BTreeMap;

/// Verdict returned by an interceptor for a pending change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercept<T> {
    /// Let the change through unchanged.
    Proceed,
    /// Let the change through with a rewritten value.
    Rewrite(T),
    /// Drop the change entirely.
    Veto,
}

/// A mutable scalar with pre-change interception and post-change
/// notification.
///
/// Interceptors run in registration order and may veto or rewrite the
/// pending value; observers run after the value actually changed and see
/// `(old, new)`.
pub struct ObservableValue<T> {
    value: T,
    next_id: u64,
    interceptors: BTreeMap<u64, Box<dyn FnMut(&T, &T) -> Intercept<T>>>,
    observers: BTreeMap<u64, Box<dyn FnMut(&T, &T)>>,
}

impl<T: Clone + PartialEq> ObservableValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            next_id: 1,
            interceptors: BTreeMap::new(),
            observers: BTreeMap::new(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Sets the value, running interceptors first and observers after.
    /// Returns `false` when an interceptor vetoed the change.
    pub fn set(&mut self, proposed: T) -> bool {
        let mut pending = proposed;
        for interceptor in self.interceptors.values_mut() {
            match interceptor(&self.value, &pending) {
                Intercept::Proceed => {}
                Intercept::Rewrite(next) => pending = next,
                Intercept::Veto => return false,
            }
        }
        if pending == self.value {
            return true;
        }
        let old = std::mem::replace(&mut self.value, pending);
        for observer in self.observers.values_mut() {
            observer(&old, &self.value);
        }
        true
    }

    /// Registers a pre-change interceptor; returns its id.
    pub fn intercept(&mut self, handler: impl FnMut(&T, &T) -> Intercept<T> + 'static) -> u64 {
        let id = self.bump_id();
        self.interceptors.insert(id, Box::new(handler));
        id
    }

    /// Registers a post-change observer; returns its id.
    pub fn observe(&mut self, handler: impl FnMut(&T, &T) + 'static) -> u64 {
        let id = self.bump_id();
        self.observers.insert(id, Box::new(handler));
        id
    }

    pub fn unintercept(&mut self, id: u64) -> bool {
        self.interceptors.remove(&id).is_some()
    }

    pub fn unobserve(&mut self, id: u64) -> bool {
        self.observers.remove(&id).is_some()
    }

    fn bump_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        id
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableValue")
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn interceptor_can_rewrite_and_veto() {
        let mut cell = ObservableValue::new(0);
        cell.intercept(|_, proposed| {
            if *proposed < 0 {
                Intercept::Veto
            } else if *proposed > 10 {
                Intercept::Rewrite(10)
            } else {
                Intercept::Proceed
            }
        });

        assert!(cell.set(5));
        assert_eq!(*cell.get(), 5);
        assert!(!cell.set(-1));
        assert_eq!(*cell.get(), 5);
        assert!(cell.set(99));
        assert_eq!(*cell.get(), 10);
    }

    #[test]
    fn observer_sees_old_and_new() {
        let mut cell = ObservableValue::new("a".to_string());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        cell.observe(move |old, new| {
            sink.borrow_mut().push((old.clone(), new.clone()));
        });

        cell.set("b".to_string());
        cell.set("b".to_string()); // no-op, no notification
        assert_eq!(
            *seen.borrow(),
            vec![("a".to_string(), "b".to_string())]
        );
    }

    #[test]
    fn unregister_stops_delivery() {
        let mut cell = ObservableValue::new(1);
        let seen = Rc::new(RefCell::new(0));
        let sink = seen.clone();
        let id = cell.observe(move |_, _| *sink.borrow_mut() += 1);
        cell.set(2);
        assert!(cell.unobserve(id));
        cell.set(3);
        assert_eq!(*seen.borrow(), 1);
    }
}
