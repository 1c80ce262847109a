//! Exact multi-precision integer arithmetic
//!
//! Sample rates span micro-Hz to tens of MHz and delays span picoseconds to hours. Converting
//! between the two at milli-sample-per-second resolution needs intermediate products well beyond
//! 64 bits. [Wide] is a small fixed-width little-endian byte integer with just the operations the
//! conversion needs: add, multiply, divide by a signed 64-bit scalar and two's-complement negation.
#![cfg_attr(not(test), no_std)]

/// Picoseconds per second times milli-samples per sample.
///
/// `samples = rate_msps * delay_ps / SCALE`.
pub const SCALE: u64 = 1_000_000_000_000_000;

/// Accumulator width used by the sample/picosecond conversions.
pub type Acc = Wide<16>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The result does not fit the destination width.
    #[error("Arithmetic overflow")]
    Overflow,
    /// Division by a zero scalar.
    #[error("Division by zero")]
    DivideByZero,
}

/// An `N` byte little-endian integer.
///
/// Arithmetic is unsigned. A signed interpretation in two's complement is available through
/// [Wide::negate], [Wide::is_negative] and [Wide::to_i64].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Wide<const N: usize>([u8; N]);

impl<const N: usize> Default for Wide<N> {
    fn default() -> Self {
        Self::ZERO
    }
}

impl<const N: usize> Wide<N> {
    pub const ZERO: Self = Self([0; N]);

    pub const fn from_le_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub const fn to_le_bytes(self) -> [u8; N] {
        self.0
    }

    /// Construct from an unsigned value.
    ///
    /// # Returns
    /// `Error::Overflow` if `N` is too narrow to hold `value`.
    pub fn from_u64(value: u64) -> Result<Self, Error> {
        let mut bytes = [0; N];
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            match bytes.get_mut(i) {
                Some(dst) => *dst = *b,
                None if *b != 0 => return Err(Error::Overflow),
                None => {}
            }
        }
        Ok(Self(bytes))
    }

    /// Construct the two's-complement representation of a signed value.
    pub fn from_i64(value: i64) -> Result<Self, Error> {
        let magnitude = Self::from_u64(value.unsigned_abs())?;
        Ok(if value < 0 {
            magnitude.negate()
        } else {
            magnitude
        })
    }

    /// The value as an unsigned 64-bit integer.
    pub fn to_u64(&self) -> Result<u64, Error> {
        if self.0.iter().skip(8).any(|b| *b != 0) {
            return Err(Error::Overflow);
        }
        let mut bytes = [0; 8];
        for (dst, src) in bytes.iter_mut().zip(self.0.iter()) {
            *dst = *src;
        }
        Ok(u64::from_le_bytes(bytes))
    }

    /// The value in two's complement as a signed 64-bit integer.
    pub fn to_i64(&self) -> Result<i64, Error> {
        if self.is_negative() {
            let magnitude = self.negate().to_u64()?;
            0i64.checked_sub_unsigned(magnitude).ok_or(Error::Overflow)
        } else {
            i64::try_from(self.to_u64()?).map_err(|_| Error::Overflow)
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// The sign bit of the two's-complement interpretation.
    pub fn is_negative(&self) -> bool {
        self.0.last().is_some_and(|b| b & 0x80 != 0)
    }

    /// Two's-complement negation (wrapping).
    pub fn negate(&self) -> Self {
        let mut out = [0; N];
        let mut carry = 1u16;
        for (dst, src) in out.iter_mut().zip(self.0.iter()) {
            let s = (!*src) as u16 + carry;
            *dst = s as u8;
            carry = s >> 8;
        }
        Self(out)
    }

    /// Unsigned addition.
    pub fn checked_add(&self, rhs: &Self) -> Result<Self, Error> {
        let mut out = [0; N];
        let mut carry = 0u16;
        for ((dst, a), b) in out.iter_mut().zip(self.0.iter()).zip(rhs.0.iter())
        {
            let s = *a as u16 + *b as u16 + carry;
            *dst = s as u8;
            carry = s >> 8;
        }
        if carry != 0 {
            return Err(Error::Overflow);
        }
        Ok(Self(out))
    }

    /// Unsigned schoolbook multiplication.
    pub fn checked_mul(&self, rhs: &Self) -> Result<Self, Error> {
        let mut out = [0u8; N];
        for (i, a) in self.0.iter().enumerate() {
            if *a == 0 {
                continue;
            }
            let mut carry = 0u32;
            for (j, b) in rhs.0.iter().enumerate() {
                let p = *a as u32 * *b as u32 + carry;
                match out.get_mut(i + j) {
                    Some(dst) => {
                        let s = *dst as u32 + p;
                        *dst = s as u8;
                        carry = s >> 8;
                    }
                    None if p != 0 => return Err(Error::Overflow),
                    None => carry = 0,
                }
            }
            if carry != 0 {
                return Err(Error::Overflow);
            }
        }
        Ok(Self(out))
    }

    /// Unsigned long division by a signed scalar.
    ///
    /// The dividend is treated as unsigned. A negative divisor yields the two's-complement
    /// negated quotient.
    ///
    /// # Returns
    /// The quotient and the magnitude of the remainder.
    pub fn div_rem(&self, divisor: i64) -> Result<(Self, u64), Error> {
        if divisor == 0 {
            return Err(Error::DivideByZero);
        }
        let d = divisor.unsigned_abs() as u128;
        let mut out = [0; N];
        let mut rem = 0u128;
        for (dst, src) in out.iter_mut().zip(self.0.iter()).rev() {
            rem = (rem << 8) | *src as u128;
            // rem < 256 * d
            *dst = (rem / d) as u8;
            rem %= d;
        }
        let q = Self(out);
        let q = if divisor < 0 { q.negate() } else { q };
        Ok((q, rem as u64))
    }
}

/// `round(a * b / divisor)` with ties away from zero.
fn mul_div_round(a: u64, b: i64, divisor: u64) -> Result<i64, Error> {
    if divisor == 0 {
        return Err(Error::DivideByZero);
    }
    let divisor = i64::try_from(divisor).map_err(|_| Error::Overflow)?;
    let q = Acc::from_u64(a)?
        .checked_mul(&Acc::from_u64(b.unsigned_abs())?)?
        .checked_add(&Acc::from_u64(divisor as u64 / 2)?)?
        .div_rem(divisor)?
        .0;
    if q.is_negative() {
        // Magnitude exceeds the signed range of the accumulator.
        return Err(Error::Overflow);
    }
    if b < 0 {
        q.negate().to_i64()
    } else {
        q.to_i64()
    }
}

/// Convert a delay to a sample count.
///
/// # Args
/// * `rate` - Sample rate in milli-samples per second.
/// * `delay` - Delay in picoseconds.
///
/// # Returns
/// `round(rate * delay / 1e15)`
pub fn samples_from_ps(rate: u64, delay: i64) -> Result<i64, Error> {
    mul_div_round(rate, delay, SCALE)
}

/// Convert a sample count to a delay.
///
/// # Args
/// * `rate` - Sample rate in milli-samples per second.
/// * `samples` - Signed number of samples.
///
/// # Returns
/// `round(samples * 1e15 / rate)` picoseconds.
pub fn ps_from_samples(rate: u64, samples: i64) -> Result<i64, Error> {
    mul_div_round(SCALE, samples, rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::{RngCore, SeedableRng};
    use rand_xorshift::XorShiftRng;

    fn wide(v: u128) -> Acc {
        Acc::from_le_bytes(v.to_le_bytes())
    }

    fn value(w: Acc) -> u128 {
        u128::from_le_bytes(w.to_le_bytes())
    }

    #[test]
    fn arithmetic_matches_u128() {
        let mut rng = XorShiftRng::seed_from_u64(0x1234);
        for _ in 0..1000 {
            let a = rng.next_u64() as u128;
            let b = (rng.next_u64() >> 1) as u128;
            assert_eq!(value(wide(a).checked_mul(&wide(b)).unwrap()), a * b);
            assert_eq!(value(wide(a).checked_add(&wide(b)).unwrap()), a + b);

            let n = a * b;
            let d = (rng.next_u64() >> 1).max(1) as i64;
            let (q, r) = wide(n).div_rem(d).unwrap();
            assert_eq!(value(q), n / d as u128);
            assert_eq!(r as u128, n % d as u128);
        }
    }

    #[test]
    fn negative_divisor() {
        let (q, r) = wide(1001).div_rem(-10).unwrap();
        assert_eq!(q.to_i64(), Ok(-100));
        assert_eq!(r, 1);
    }

    #[test]
    fn negate() {
        let x = Acc::from_i64(-5).unwrap();
        assert!(x.is_negative());
        assert_eq!(x.to_i64(), Ok(-5));
        assert_eq!(x.negate().to_i64(), Ok(5));
        assert_eq!(Acc::ZERO.negate(), Acc::ZERO);
        assert_eq!(Acc::from_i64(i64::MIN).unwrap().to_i64(), Ok(i64::MIN));
    }

    #[test]
    fn overflow() {
        let big = wide(1 << 127);
        assert_eq!(big.checked_mul(&wide(2)), Err(Error::Overflow));
        assert_eq!(big.checked_add(&big), Err(Error::Overflow));
        assert_eq!(Wide::<4>::from_u64(1 << 40), Err(Error::Overflow));
        assert_eq!(wide(1 << 64).to_u64(), Err(Error::Overflow));
        assert_eq!(wide(1 << 63).to_i64(), Err(Error::Overflow));
    }

    #[test]
    fn divide_by_zero() {
        assert_eq!(wide(1).div_rem(0), Err(Error::DivideByZero));
        assert_eq!(ps_from_samples(0, 10), Err(Error::DivideByZero));
    }

    #[test]
    fn conversions() {
        // 1 kHz: one sample per ms
        assert_eq!(samples_from_ps(1_000_000, 1_000_000_000), Ok(1));
        assert_eq!(samples_from_ps(1_000_000, -3_000_000_000), Ok(-3));
        assert_eq!(ps_from_samples(1_000_000, 7), Ok(7_000_000_000));
        // Ties round away from zero.
        assert_eq!(samples_from_ps(1_000_000, 500_000_000), Ok(1));
        assert_eq!(samples_from_ps(1_000_000, -500_000_000), Ok(-1));
        assert_eq!(samples_from_ps(1_000_000, 499_999_999), Ok(0));
        // 3 Sps: 1 / 3 s per sample
        assert_eq!(ps_from_samples(3_000, 1), Ok(333_333_333_333));
        assert_eq!(ps_from_samples(3_000, -2), Ok(-666_666_666_667));
        // Beyond 64 bit intermediates: 20 MSps times 100 s
        assert_eq!(
            samples_from_ps(20_000_000_000, 100_000_000_000_000),
            Ok(2_000_000_000)
        );
        assert_eq!(
            samples_from_ps(u64::MAX >> 1, i64::MAX),
            Err(Error::Overflow)
        );
    }

    #[test]
    fn round_trip() {
        let mut rng = XorShiftRng::seed_from_u64(0xfeed);
        for _ in 0..2000 {
            // 1 Hz to 10 MHz in mSps, -10 ms to 10 ms in ps
            let rate = 1_000 + rng.next_u64() % 10_000_000_000;
            let delay =
                (rng.next_u64() % 20_000_000_001) as i64 - 10_000_000_000;
            let samples = samples_from_ps(rate, delay).unwrap();
            let ps = ps_from_samples(rate, samples).unwrap();
            let again = samples_from_ps(rate, ps).unwrap();
            assert!(
                (again - samples).abs() <= 1,
                "rate {rate} delay {delay}: {samples} -> {ps} -> {again}"
            );
        }
    }
}
