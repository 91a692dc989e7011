use std::fmt;

/// Decimal (powers of 1000) size units
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeUnit {
    B,
    K,
    M,
    G,
    T,
    P,
}

impl SizeUnit {
    pub const ALL: [SizeUnit; 6] = [
        SizeUnit::B,
        SizeUnit::K,
        SizeUnit::M,
        SizeUnit::G,
        SizeUnit::T,
        SizeUnit::P,
    ];

    pub const fn as_char(self) -> char {
        match self {
            SizeUnit::B => 'B',
            SizeUnit::K => 'K',
            SizeUnit::M => 'M',
            SizeUnit::G => 'G',
            SizeUnit::T => 'T',
            SizeUnit::P => 'P',
        }
    }
}

impl fmt::Display for SizeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use fmt::Write;
        f.write_char(self.as_char())
    }
}

/// A byte count scaled for humans: divided by 1000 until it drops below
/// 1000, or until we run out of units (then it just stays big, in `P`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HumanSize {
    pub value: f64,
    pub unit: SizeUnit,
}

impl HumanSize {
    pub fn from_bytes(bytes: usize) -> Self {
        let mut value = bytes as f64;
        let mut units = SizeUnit::ALL.iter().peekable();
        while let Some(&unit) = units.next() {
            if value < 1000.0 || units.peek().is_none() {
                return Self { value, unit };
            }
            value /= 1000.0;
        }
        unreachable!("SizeUnit::ALL is not empty")
    }
}

/// Renders as `%6.1f` plus the unit letter, e.g. `   1.5K`
impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:6.1}{}", self.value, self.unit)
    }
}
