/// Mark a slow path as #[cold], e.g. first-use initialization
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
