// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;

/// Constant defining the [QuantSpec] which performs no quantization.
pub const NO_QUANTIZATION: QuantSpec = QuantSpec { unit: 1, offset: 0 };

/// A spec for quantization.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct QuantSpec {
    /// The unit of quantization
    pub unit: ChainEpoch,
    /// The offset from zero from which to base the modulus
    pub offset: ChainEpoch,
}

impl QuantSpec {
    /// Rounds `epoch` to the nearest exact multiple of the quantization unit offset by
    /// `offset % unit`, rounding up.
    ///
    /// This function is equivalent to `unit * ceil(epoch - (offset % unit) / unit) + (offset % unit)`
    /// with the variables/operations over real numbers instead of ints.
    ///
    /// Precondition: `unit >= 0`
    pub fn quantize_up(&self, epoch: ChainEpoch) -> ChainEpoch {
        let offset = self.offset % self.unit;

        let remainder = (epoch - offset) % self.unit;
        let quotient = (epoch - offset) / self.unit;

        // Don't round if epoch falls on a quantization epoch
        if remainder == 0
        // Negative truncating division rounds up
        || epoch - offset < 0
        {
            self.unit * quotient + offset
        } else {
            self.unit * (quotient + 1) + offset
        }
    }

    pub fn quantize_down(&self, epoch: ChainEpoch) -> ChainEpoch {
        let next = self.quantize_up(epoch);
        // QuantizeDown == QuantizeUp iff epoch is a fixed point of QuantizeUp
        if epoch == next {
            next
        } else {
            next - self.unit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_quantization() {
        assert_eq!(NO_QUANTIZATION.quantize_up(0), 0);
        assert_eq!(NO_QUANTIZATION.quantize_up(1), 1);
        assert_eq!(NO_QUANTIZATION.quantize_up(2), 2);
        assert_eq!(NO_QUANTIZATION.quantize_up(123456789), 123456789);
    }

    #[test]
    fn zero_offset() {
        // for a quantization spec of {unit: 10, offset: 0}
        let spec = QuantSpec { unit: 10, offset: 0 };

        // 7 rounds up to 10
        assert_eq!(spec.quantize_up(7), 10);
        // exact multiples don't round
        assert_eq!(spec.quantize_up(30), 30);
        assert_eq!(spec.quantize_up(0), 0);
    }

    #[test]
    fn non_zero_offset() {
        let spec = QuantSpec { unit: 10, offset: 3 };

        assert_eq!(spec.quantize_up(9), 13);
        assert_eq!(spec.quantize_up(13), 13);
        assert_eq!(spec.quantize_up(14), 23);
        // offset below the epoch
        assert_eq!(spec.quantize_up(2), 3);
    }

    #[test]
    fn offset_seed_bigger_than_unit_is_normalized() {
        let spec = QuantSpec { unit: 5, offset: 42 };

        // 42 % 5 = 2
        assert_eq!(spec.quantize_up(9), 12);
        assert_eq!(spec.quantize_up(2), 2);
    }

    #[test]
    fn negative_epochs_round_up_toward_zero() {
        let spec = QuantSpec { unit: 10, offset: 3 };

        assert_eq!(spec.quantize_up(-1), 3);
        assert_eq!(spec.quantize_up(-7), -7);
        assert_eq!(spec.quantize_up(-8), -7);
    }

    #[test]
    fn quantize_down_matches_up_at_fixed_points() {
        let spec = QuantSpec { unit: 10, offset: 3 };

        assert_eq!(spec.quantize_down(13), 13);
        assert_eq!(spec.quantize_down(14), 13);
        assert_eq!(spec.quantize_down(22), 13);
        assert_eq!(spec.quantize_down(23), 23);
    }
}
