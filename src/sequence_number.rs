//! Dedicated logic for 8-bit service sequence numbers, compared with
//! [serial number arithmetic](https://datatracker.ietf.org/doc/html/rfc1982).

use core::fmt;
use core::ops::{Add, AddAssign};

/// This value is compared against when deciding if a `SeqNo` is larger or
/// smaller. Half of the 8 bit sequence number space.
const SEQNO_COMPARE_THRESHOLD: u8 = 128;

/// A sequence number advertised in a service record.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNo(u8);

impl SeqNo {
    /// Create a new `SeqNo` with the default value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom PartialOrd implementation following serial number arithmetic.
    /// Note that we don't implement the [`PartialOrd`](std::cmp::PartialOrd)
    /// trait, as the contract on that trait specifically defines that it is
    /// transitive, which is clearly not the case here.
    ///
    /// There is a quirk in this comparison where values which are exactly
    /// 128 apart will result in false in either way of ordering the
    /// arguments, which is counterintuitive to our understanding that a < b
    /// generally implies !(b < a).
    pub fn lt(&self, other: &Self) -> bool {
        if self.0 == other.0 {
            false
        } else {
            other.0.wrapping_sub(self.0) < SEQNO_COMPARE_THRESHOLD
        }
    }

    /// Custom PartialOrd implementation following serial number arithmetic.
    /// Note that we don't implement the [`PartialOrd`](std::cmp::PartialOrd)
    /// trait, as the contract on that trait specifically defines that it is
    /// transitive, which is clearly not the case here.
    ///
    /// There is a quirk in this comparison where values which are exactly
    /// 128 apart will result in false in either way of ordering the
    /// arguments, which is counterintuitive to our understanding that a < b
    /// generally implies !(b < a).
    pub fn gt(&self, other: &Self) -> bool {
        if self.0 == other.0 {
            false
        } else {
            other.0.wrapping_sub(self.0) > SEQNO_COMPARE_THRESHOLD
        }
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

impl From<u8> for SeqNo {
    fn from(value: u8) -> Self {
        SeqNo(value)
    }
}

impl From<SeqNo> for u8 {
    fn from(value: SeqNo) -> Self {
        value.0
    }
}

impl Add<u8> for SeqNo {
    type Output = Self;

    fn add(self, rhs: u8) -> Self::Output {
        SeqNo(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u8> for SeqNo {
    fn add_assign(&mut self, rhs: u8) {
        *self = SeqNo(self.0.wrapping_add(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::SeqNo;

    #[test]
    fn cmp_eq_seqno() {
        let s1 = SeqNo::from(1);
        let s2 = SeqNo::from(1);
        assert_eq!(s1, s2);

        let s1 = SeqNo::from(200);
        let s2 = SeqNo::from(200);
        assert_eq!(s1, s2);
    }

    #[test]
    fn cmp_small_seqno_increase() {
        let s1 = SeqNo::from(1);
        let s2 = SeqNo::from(2);
        assert!(s1.lt(&s2));
        assert!(!s2.lt(&s1));

        assert!(s2.gt(&s1));
        assert!(!s1.gt(&s2));

        let s1 = SeqNo::from(3);
        let s2 = SeqNo::from(100);
        assert!(s1.lt(&s2));
        assert!(!s2.lt(&s1));

        assert!(s2.gt(&s1));
        assert!(!s1.gt(&s2));
    }

    #[test]
    fn cmp_big_seqno_increase() {
        let s1 = SeqNo::from(0);
        let s2 = SeqNo::from(127);
        assert!(s1.lt(&s2));
        assert!(!s2.lt(&s1));

        assert!(s2.gt(&s1));
        assert!(!s1.gt(&s2));

        // Test equality quirk at cutoff point.
        let s1 = SeqNo::from(0);
        let s2 = SeqNo::from(128);
        assert!(!s1.lt(&s2));
        assert!(!s2.lt(&s1));

        assert!(!s2.gt(&s1));
        assert!(!s1.gt(&s2));

        let s1 = SeqNo::from(0);
        let s2 = SeqNo::from(129);
        assert!(!s1.lt(&s2));
        assert!(s2.lt(&s1));

        assert!(!s2.gt(&s1));
        assert!(s1.gt(&s2));

        let s1 = SeqNo::from(6);
        let s2 = SeqNo::from(250);
        assert!(!s1.lt(&s2));
        assert!(s2.lt(&s1));

        assert!(!s2.gt(&s1));
        assert!(s1.gt(&s2));
    }

    #[test]
    fn wrapping_add() {
        let mut s = SeqNo::from(250);
        s += 10;
        assert_eq!(u8::from(s), 4);
        assert_eq!(u8::from(SeqNo::from(255) + 1), 0);
    }
}
