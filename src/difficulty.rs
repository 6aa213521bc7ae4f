//! Compact-bits difficulty encoding, block work, and the windowed retarget
//! controller.

use primitive_types::{U256, U512};

use crate::config::ConsensusConfig;
use crate::crypto::Hash32;
use crate::error::CoreError;
use crate::Result;

/// Expand compact bits into the full 256-bit target. Rejects the sign bit
/// and encodings whose value does not fit 256 bits.
pub fn target_from_bits(bits: u32) -> Result<U256> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 {
        return Err(CoreError::Malformed(format!("negative compact target {bits:#010x}")));
    }
    if mantissa == 0 {
        return Err(CoreError::Malformed(format!("zero compact target {bits:#010x}")));
    }
    let target = if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        let shift = 8 * (exponent - 3);
        let mantissa_bits = 32 - mantissa.leading_zeros() as usize;
        if mantissa_bits + shift > 256 {
            return Err(CoreError::Malformed(format!(
                "compact target {bits:#010x} overflows 256 bits"
            )));
        }
        U256::from(mantissa) << shift
    };
    if target.is_zero() {
        return Err(CoreError::Malformed(format!("zero compact target {bits:#010x}")));
    }
    Ok(target)
}

/// Compress a target back to compact bits (lossy below the top three bytes).
pub fn bits_from_target(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        target.low_u64() << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3))).low_u64()
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    ((size as u32) << 24) | (compact as u32 & 0x007f_ffff)
}

/// Work contributed by one block at this target: `2^256 / (target + 1)`.
pub fn work_from_bits(bits: u32) -> Result<U256> {
    let target = target_from_bits(bits)?;
    // (2^256 - target - 1) / (target + 1) + 1 == floor(2^256 / (target + 1))
    Ok((!target) / (target + 1) + 1)
}

/// PoW check: interpret the header hash as a big-endian integer and compare
/// against the expanded target.
pub fn meets_target(hash: &Hash32, bits: u32) -> Result<bool> {
    let target = target_from_bits(bits)?;
    Ok(U256::from_big_endian(hash) <= target)
}

/// Proportional retarget. `actual_span_secs` is the observed wall-clock time
/// of the last `n_measurement` block intervals; the expected span is
/// `n_measurement * block_timing_seconds`.
///
/// The controller scales the target by the damped ratio
/// `kp*actual / (kp*actual + expected - actual)` (difficulty factor
/// `1 + (expected/actual - 1)/kp`), then clamps the per-retarget change to
/// [¼, 4×] and never exceeds `max_target_bits` (the network minimum
/// difficulty).
pub fn retarget(
    current_bits: u32,
    actual_span_secs: u64,
    consensus: &ConsensusConfig,
    max_target_bits: u32,
) -> Result<u32> {
    let current = target_from_bits(current_bits)?;
    let max_target = target_from_bits(max_target_bits)?;

    let expected = consensus
        .n_measurement
        .saturating_mul(consensus.block_timing_seconds)
        .max(1);
    let actual = actual_span_secs.clamp(expected / 4, expected.saturating_mul(4)).max(1);

    let kp = consensus.kp.max(1);
    // new_target = current * kp*actual / (kp*actual + expected - actual)
    let numerator = U256::from(kp) * U256::from(actual);
    let denominator = numerator + U256::from(expected) - U256::from(actual);
    let mut next = u512_div_to_u256(current.full_mul(numerator), denominator);

    // Per-retarget clamp on the target itself.
    let lower = current >> 2;
    let upper = clamp_mul4(current);
    if next < lower {
        next = lower;
    }
    if next > upper {
        next = upper;
    }
    if next > max_target {
        next = max_target;
    }
    if next.is_zero() {
        next = U256::one();
    }
    Ok(bits_from_target(next))
}

fn u512_div_to_u256(value: U512, divisor: U256) -> U256 {
    let divisor = U512::from_big_endian(&{
        let mut buf = [0u8; 64];
        divisor.to_big_endian(&mut buf[32..]);
        buf
    });
    let quotient = value / divisor;
    let mut buf = [0u8; 64];
    quotient.to_big_endian(&mut buf);
    U256::from_big_endian(&buf[32..])
}

fn clamp_mul4(value: U256) -> U256 {
    if value.leading_zeros() < 2 {
        U256::MAX
    } else {
        value << 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        for bits in [0x207fffffu32, 0x1f00ffff, 0x1d00ffff, 0x02123400] {
            let target = target_from_bits(bits).unwrap();
            assert_eq!(bits_from_target(target), bits);
        }
    }

    #[test]
    fn compact_rejects_sign_and_overflow() {
        assert!(target_from_bits(0x0180_0000).is_err());
        assert!(target_from_bits(0x2200_ffff).is_err());
        assert!(target_from_bits(0x2000_0000).is_err());
    }

    #[test]
    fn work_grows_as_target_shrinks() {
        let easy = work_from_bits(0x207fffff).unwrap();
        let harder = work_from_bits(0x1f00ffff).unwrap();
        assert!(harder > easy);
    }

    #[test]
    fn meets_target_boundary() {
        let bits = 0x2100ffff_u32 & 0x207fffff; // keep a valid easy target
        let target = target_from_bits(bits).unwrap();
        let mut at_target = [0u8; 32];
        target.to_big_endian(&mut at_target);
        assert!(meets_target(&at_target, bits).unwrap());

        let above = target + 1;
        let mut above_bytes = [0u8; 32];
        above.to_big_endian(&mut above_bytes);
        assert!(!meets_target(&above_bytes, bits).unwrap());
    }

    #[test]
    fn retarget_halves_difficulty_when_blocks_twice_as_slow() {
        let consensus = ConsensusConfig::default();
        let current_bits = 0x1f00ffff;
        let expected = consensus.n_measurement * consensus.block_timing_seconds;

        let next_bits = retarget(current_bits, expected * 2, &consensus, 0x207fffff).unwrap();
        let current = target_from_bits(current_bits).unwrap();
        let next = target_from_bits(next_bits).unwrap();
        // Target doubled (difficulty halved), within compact-encoding slack.
        let ratio = (next / (current >> 8)).low_u64();
        assert!((510..=514).contains(&ratio), "ratio/256 was {ratio}");
    }

    #[test]
    fn retarget_steady_state_is_stable() {
        let consensus = ConsensusConfig::default();
        let expected = consensus.n_measurement * consensus.block_timing_seconds;
        let bits = 0x1f00ffff;
        assert_eq!(retarget(bits, expected, &consensus, 0x207fffff).unwrap(), bits);
    }

    #[test]
    fn retarget_clamps_to_factor_four() {
        let consensus = ConsensusConfig::default();
        let expected = consensus.n_measurement * consensus.block_timing_seconds;
        let current_bits = 0x1f00ffff;
        let current = target_from_bits(current_bits).unwrap();

        // Wildly slow blocks: the span clamp holds the change to 4x.
        let slow_bits = retarget(current_bits, expected * 1_000, &consensus, 0x207fffff).unwrap();
        assert_eq!(target_from_bits(slow_bits).unwrap(), current << 2);

        // Wildly fast blocks: clamped to a quarter.
        let fast_bits = retarget(current_bits, 1, &consensus, 0x207fffff).unwrap();
        assert_eq!(target_from_bits(fast_bits).unwrap(), current >> 2);
    }

    #[test]
    fn retarget_respects_network_minimum_difficulty() {
        let consensus = ConsensusConfig::default();
        let expected = consensus.n_measurement * consensus.block_timing_seconds;
        // Already at the minimum: slowing down cannot raise the target.
        let bits = retarget(0x207fffff, expected * 4, &consensus, 0x207fffff).unwrap();
        assert_eq!(bits, 0x207fffff);
    }

    #[test]
    fn higher_kp_damps_the_step() {
        let mut consensus = ConsensusConfig::default();
        let expected = consensus.n_measurement * consensus.block_timing_seconds;
        let current_bits = 0x1f00ffff;

        consensus.kp = 1;
        let full = retarget(current_bits, expected * 2, &consensus, 0x207fffff).unwrap();
        consensus.kp = 5;
        let damped = retarget(current_bits, expected * 2, &consensus, 0x207fffff).unwrap();

        let full_target = target_from_bits(full).unwrap();
        let damped_target = target_from_bits(damped).unwrap();
        let current = target_from_bits(current_bits).unwrap();
        assert!(damped_target > current);
        assert!(damped_target < full_target);
    }
}
