use std::sync::Arc;

/// Progress callback: `(current, total, member name)`.
///
/// Invoked once per archive member while payload bytes are copied.
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

pub(crate) fn report(progress: Option<&ProgressFn>, current: usize, total: usize, name: &str) {
    if let Some(cb) = progress {
        cb(current, total, name);
    }
}
