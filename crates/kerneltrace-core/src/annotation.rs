//! Thread-local annotation naming the operation that is about to launch GPU work.
//!
//! The launch callback runs synchronously on the launching thread, so the
//! annotation it reads is always the one set by that thread around the launch.
//!
//! # Example
//!
//! ```
//! use kerneltrace_core::annotation::{annotate, current_annotation};
//!
//! {
//!     let _scope = annotate("matmul_0");
//!     assert_eq!(current_annotation().as_deref(), Some("matmul_0"));
//!     // ... launch kernels ...
//! }
//! assert_eq!(current_annotation(), None);
//! ```

use std::cell::RefCell;

thread_local! {
    static CURRENT: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Set the calling thread's current annotation, replacing any previous one.
pub fn set_current_annotation(text: &str) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(existing) => {
                existing.clear();
                existing.push_str(text);
            }
            None => *slot = Some(text.to_owned()),
        }
    });
}

/// Reset the calling thread's annotation to none.
pub fn clear_current_annotation() {
    CURRENT.with(|slot| *slot.borrow_mut() = None);
}

/// Snapshot of the calling thread's annotation.
pub fn current_annotation() -> Option<String> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Run `f` with a borrowed view of the current annotation.
pub(crate) fn with_current_annotation<R>(f: impl FnOnce(Option<&str>) -> R) -> R {
    CURRENT.with(|slot| f(slot.borrow().as_deref()))
}

/// Set `text` as the current annotation until the returned guard drops.
///
/// The previous annotation, if any, is restored on drop.
pub fn annotate(text: &str) -> AnnotationGuard {
    let previous = CURRENT.with(|slot| slot.borrow_mut().replace(text.to_owned()));
    AnnotationGuard {
        previous,
        _not_send: std::marker::PhantomData,
    }
}

/// Scope guard returned by [`annotate`].
///
/// Bound to the thread that created it.
#[must_use = "the annotation is cleared as soon as the guard drops"]
pub struct AnnotationGuard {
    previous: Option<String>,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for AnnotationGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}
