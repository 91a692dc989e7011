/// Round up `n` to the nearest `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Like [`round_up()`], but `None` instead of overflowing
pub const fn checked_round_up(n: usize, to: usize) -> Option<usize> {
    match n.checked_add(to - 1) {
        Some(m) => Some(to * (m / to)),
        None => None,
    }
}
