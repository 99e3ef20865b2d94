use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Opaque, closeable token representing a resource, subscription or pending
/// operation.
///
/// Closing runs the release hook exactly once, synchronously; further closes
/// are no-ops. Clones share identity: the hook still fires once across all
/// clones. Release hooks must not panic.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: &'static str,
    id: u64,
    on_close: Mutex<Option<ReleaseHook>>,
}

impl Handle {
    pub fn new(name: &'static str, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name,
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                on_close: Mutex::new(Some(Box::new(on_close))),
            }),
        }
    }

    /// Handle with no release hook; valid until closed.
    pub fn empty(name: &'static str) -> Self {
        Self::new(name, || {})
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Unique id, stable across clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this refers to the same underlying handle.
    pub fn is_same(&self, other: &Handle) -> bool {
        self.inner.id == other.inner.id
    }

    pub fn is_valid(&self) -> bool {
        self.inner.on_close.lock().is_some()
    }

    /// Release the underlying resource. Safe to call more than once.
    pub fn close(&self) {
        let hook = self.inner.on_close.lock().take();
        if let Some(hook) = hook {
            debug!("Closing handle '{}' ({})", self.inner.name, self.inner.id);
            hook();
        }
    }

    /// Close the handle held in `slot` (if any) and clear it. Mirrors the
    /// `handle = close(handle)` ownership-transfer idiom.
    pub fn close_opt(slot: &mut Option<Handle>) {
        if let Some(handle) = slot.take() {
            handle.close();
        }
    }

    /// False for absent or closed handles.
    pub fn is_valid_opt(slot: &Option<Handle>) -> bool {
        slot.as_ref().map(Handle::is_valid).unwrap_or(false)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
