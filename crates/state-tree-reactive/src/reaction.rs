use crate::Atom;

/// A side effect re-run whenever a watched [`Atom`] has changed since the
/// effect last ran.
///
/// The owner drives scheduling explicitly: after a batch of mutations it
/// calls [`Reaction::check`] with the current atom, and the effect fires
/// only when the version moved.
pub struct Reaction<T> {
    effect: Box<dyn FnMut(&T)>,
    last_seen: u64,
}

impl<T> Reaction<T> {
    /// Creates a reaction that considers `atom`'s current version as seen,
    /// so only future changes fire the effect.
    pub fn new(atom: &Atom, effect: impl FnMut(&T) + 'static) -> Self {
        Self {
            effect: Box::new(effect),
            last_seen: atom.version(),
        }
    }

    /// Runs the effect if `atom` changed since the last run. Returns whether
    /// the effect fired.
    pub fn check(&mut self, atom: &Atom, value: &T) -> bool {
        let current = atom.version();
        if current == self.last_seen {
            return false;
        }
        self.last_seen = current;
        (self.effect)(value);
        true
    }
}

impl<T> std::fmt::Debug for Reaction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaction")
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn fires_only_on_change() {
        let atom = Atom::new();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        let mut reaction = Reaction::new(&atom, move |_: &i32| {
            counter.set(counter.get() + 1);
        });

        assert!(!reaction.check(&atom, &1));
        atom.report_changed();
        assert!(reaction.check(&atom, &2));
        assert!(!reaction.check(&atom, &2));
        assert_eq!(fired.get(), 1);
    }
}
