use std::any::Any;

/// A single-slot, type-checked carrier. The transport stashes its private
/// per-channel state here without the rest of the core knowing the type.
/// Retrieval with the wrong type yields `None`; dropping the carrier drops
/// the occupant exactly once, unless ownership was surrendered with `take`.
#[derive(Default)]
pub struct AnyObject {
    slot: Option<Box<dyn Any + Send>>,
}

impl AnyObject {
    pub fn new() -> AnyObject {
        AnyObject { slot: None }
    }

    /// Store a value, dropping any previous occupant.
    pub fn set<T: Any + Send>(&mut self, value: T) {
        self.slot = Some(Box::new(value));
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.slot.as_ref().and_then(|boxed| boxed.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.slot.as_mut().and_then(|boxed| boxed.downcast_mut())
    }

    /// Surrender ownership of the occupant. A type mismatch leaves the
    /// occupant in place and returns `None`.
    pub fn take<T: Any>(&mut self) -> Option<Box<T>> {
        match self.slot.take() {
            Some(boxed) => match boxed.downcast() {
                Ok(value) => Some(value),
                Err(original) => {
                    self.slot = Some(original);
                    None
                }
            },
            None => None,
        }
    }

    pub fn has_value(&self) -> bool {
        self.slot.is_some()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropProbe {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Other {
        #[allow(dead_code)]
        value: i32,
    }

    #[test]
    fn test_type_checked_access() {
        let mut any = AnyObject::new();
        any.set(DropProbe {
            drops: Arc::new(AtomicUsize::new(0)),
        });

        assert!(any.has_value());
        assert!(any.get::<Other>().is_none());
        assert!(any.get::<DropProbe>().is_some());
    }

    #[test]
    fn test_drop_destroys_occupant_once() {
        let drops = Arc::new(AtomicUsize::new(0));

        {
            let mut any = AnyObject::new();
            any.set(DropProbe {
                drops: drops.clone(),
            });
        }

        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_take_surrenders_ownership() {
        let drops = Arc::new(AtomicUsize::new(0));
        let probe;

        {
            let mut any = AnyObject::new();
            any.set(DropProbe {
                drops: drops.clone(),
            });
            probe = any.take::<DropProbe>().unwrap();

            assert!(!any.has_value());
        }

        // The carrier is gone but the occupant survived the move.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(probe);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_take_wrong_type_leaves_occupant() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut any = AnyObject::new();
        any.set(DropProbe {
            drops: drops.clone(),
        });

        assert!(any.take::<Other>().is_none());
        assert!(any.has_value());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_set_replaces_previous() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut any = AnyObject::new();

        any.set(DropProbe {
            drops: drops.clone(),
        });
        any.set(Other { value: 5 });

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(any.get::<Other>().is_some());
        assert!(any.get::<DropProbe>().is_none());
    }

    #[test]
    fn test_empty_carrier() {
        let mut any = AnyObject::new();

        assert!(!any.has_value());
        assert!(any.get::<Other>().is_none());
        assert!(any.take::<Other>().is_none());
        any.clear();
    }
}
