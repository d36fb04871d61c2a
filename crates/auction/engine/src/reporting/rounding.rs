//! Stochastic rounding of values exposed to reporting
//!
//! Values are rounded to `bits` significant bits, up or down with
//! probability proportional to their distance from each neighbour, so the
//! rounded value is unbiased while carrying fewer identifying bits.

use crate::random::RandomSource;

const MAX_EXPONENT: i32 = 127;
const MIN_EXPONENT: i32 = -128;

/// Split a finite non-zero normal `value` into `(mantissa, exponent)` with
/// `0.5 <= |mantissa| < 1` and `value == mantissa * 2^exponent`.
fn frexp(value: f64) -> Option<(f64, i32)> {
    let bits = value.to_bits();
    let exponent_bits = ((bits >> 52) & 0x7ff) as i32;
    if exponent_bits == 0 || exponent_bits == 0x7ff {
        return None;
    }
    let mantissa = f64::from_bits((bits & !(0x7ff_u64 << 52)) | (1022_u64 << 52));
    Some((mantissa, exponent_bits - 1022))
}

fn ldexp(value: f64, exponent: i32) -> f64 {
    value * 2f64.powi(exponent)
}

/// Round `value` to `bits` significant bits.
pub fn round_stochastically(value: f64, bits: u32, random: &dyn RandomSource) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let Some((mantissa, exponent)) = frexp(value) else {
        // Subnormals are far below the smallest representable exponent.
        return 0.0;
    };
    if exponent < MIN_EXPONENT {
        return 0.0;
    }
    if exponent > MAX_EXPONENT {
        return if value > 0.0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        };
    }

    let bits = bits as i32;
    let scaled = ldexp(mantissa, bits);
    let mut truncated = scaled.trunc();
    if random.unit_f64() < (scaled - truncated).abs() {
        truncated += scaled.signum();
    }
    ldexp(truncated, exponent - bits)
}
