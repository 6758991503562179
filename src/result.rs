use crate::{CoroError, Result};

enum Slot<T> {
    Empty,
    Value(T),
    Failure(CoroError),
    Moved,
}

/// Single-producer result storage for one computation: starts empty, is set
/// exactly once with either a value or a failure, and can be read either by
/// cloning (shared access) or by moving out (which leaves a moved-from
/// sentinel behind).
pub struct ResultCell<T> {
    slot: Slot<T>,
}

impl<T> ResultCell<T> {
    pub fn new() -> Self {
        Self { slot: Slot::Empty }
    }

    pub fn has_value(&self) -> bool {
        matches!(self.slot, Slot::Value(_))
    }

    pub fn is_set(&self) -> bool {
        matches!(self.slot, Slot::Value(_) | Slot::Failure(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.slot, Slot::Empty)
    }

    pub fn set_value(&mut self, value: T) -> Result<()> {
        match self.slot {
            Slot::Empty => {
                self.slot = Slot::Value(value);
                Ok(())
            }
            _ => Err(CoroError::InvalidState("result already set")),
        }
    }

    pub fn set_failure(&mut self, err: CoroError) -> Result<()> {
        match self.slot {
            Slot::Empty => {
                self.slot = Slot::Failure(err);
                Ok(())
            }
            _ => Err(CoroError::InvalidState("result already set")),
        }
    }

    /// Shared read: clones the held value (or failure). The cell keeps its
    /// contents.
    pub fn result(&self) -> Result<T>
    where
        T: Clone,
    {
        match &self.slot {
            Slot::Value(v) => Ok(v.clone()),
            Slot::Failure(e) => Err(e.clone()),
            Slot::Empty => Err(CoroError::InvalidState("result is unset")),
            Slot::Moved => Err(CoroError::InvalidState("result already moved")),
        }
    }

    /// Consuming read: moves the value out, leaving the moved-from sentinel.
    pub fn take_result(&mut self) -> Result<T> {
        match std::mem::replace(&mut self.slot, Slot::Moved) {
            Slot::Value(v) => Ok(v),
            Slot::Failure(e) => Err(e),
            Slot::Empty => {
                self.slot = Slot::Empty;
                Err(CoroError::InvalidState("result is unset"))
            }
            Slot::Moved => Err(CoroError::InvalidState("result already moved")),
        }
    }
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static NEWS: Cell<usize> = Cell::new(0);
        static CLONES: Cell<usize> = Cell::new(0);
    }

    #[derive(Debug)]
    struct Counted(u32);

    impl Counted {
        fn new(v: u32) -> Self {
            NEWS.with(|c| c.set(c.get() + 1));
            Counted(v)
        }
    }

    impl Clone for Counted {
        fn clone(&self) -> Self {
            CLONES.with(|c| c.set(c.get() + 1));
            Counted(self.0)
        }
    }

    fn reset_counts() {
        NEWS.with(|c| c.set(0));
        CLONES.with(|c| c.set(0));
    }

    fn clones() -> usize {
        CLONES.with(|c| c.get())
    }

    fn news() -> usize {
        NEWS.with(|c| c.get())
    }

    #[test]
    fn test_set_value_from_owned_never_clones() {
        reset_counts();
        let mut res = ResultCell::new();
        assert!(!res.has_value());
        res.set_value(Counted::new(7)).unwrap();
        assert!(res.has_value());
        assert_eq!(news(), 1);
        assert_eq!(clones(), 0);

        let v = res.take_result().unwrap();
        assert_eq!(v.0, 7);
        assert_eq!(clones(), 0);
    }

    #[test]
    fn test_result_clones_once_per_shared_read() {
        reset_counts();
        let mut res = ResultCell::new();
        res.set_value(Counted::new(3)).unwrap();

        let a = res.result().unwrap();
        assert_eq!(clones(), 1);
        let b = res.result().unwrap();
        assert_eq!(clones(), 2);
        assert_eq!(a.0, 3);
        assert_eq!(b.0, 3);
        assert!(res.has_value());
    }

    #[test]
    fn test_take_leaves_moved_sentinel() {
        let mut res = ResultCell::new();
        res.set_value(5u32).unwrap();
        assert_eq!(res.take_result().unwrap(), 5);

        assert!(!res.has_value());
        assert_eq!(
            res.take_result(),
            Err(CoroError::InvalidState("result already moved"))
        );
        assert_eq!(
            res.result(),
            Err(CoroError::InvalidState("result already moved"))
        );
    }

    #[test]
    fn test_double_set_fails() {
        let mut res = ResultCell::new();
        res.set_value(1u32).unwrap();
        assert_eq!(
            res.set_value(2),
            Err(CoroError::InvalidState("result already set"))
        );
        assert_eq!(
            res.set_failure(CoroError::failure("late")),
            Err(CoroError::InvalidState("result already set"))
        );
    }

    #[test]
    fn test_read_while_empty_fails() {
        let res: ResultCell<u32> = ResultCell::new();
        assert_eq!(res.result(), Err(CoroError::InvalidState("result is unset")));
    }

    #[test]
    fn test_failure_is_reraised_verbatim() {
        let mut res: ResultCell<u32> = ResultCell::new();
        res.set_failure(CoroError::failure("boom")).unwrap();
        assert!(res.is_set());
        assert!(!res.has_value());
        assert_eq!(res.result(), Err(CoroError::failure("boom")));
        assert_eq!(res.take_result(), Err(CoroError::failure("boom")));
    }
}
