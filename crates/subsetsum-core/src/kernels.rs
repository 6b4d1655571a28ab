//! Unrolled Gray-code scan kernels for the naive method.
//!
//! A packet covers `2^14` node assignments: 32 five-bit prefixes, each
//! extended by a 512-step binary-reflected Gray walk over nine deltas. The
//! walk is expanded at compile time by a doubling macro ladder so the running
//! sum and the hit mask stay in registers; the same expansion is shared by
//! the scalar, portable-SIMD and x86 lanes through [`GrayLane`].
//!
//! SIMD lanes process two packets at once, one 64-bit sum per lane, and
//! report hits for the second packet as indices `>= 32`.

use std::sync::OnceLock;

use wide::{CmpEq, i64x2};

/// One accumulator lane type for the Gray walk.
pub trait GrayLane: Copy {
    /// Broadcasts a delta to all lanes.
    fn splat(value: i64) -> Self;
    /// Packs the two packet sums (the scalar lane ignores the second).
    fn pack(sum1: i64, sum2: i64) -> Self;
    /// Wrapping lane-wise add.
    fn add(self, rhs: Self) -> Self;
    /// All-ones in every lane that equals zero.
    fn zero_hit(self) -> Self;
    /// Bitwise or, used to accumulate hits.
    fn merge(self, rhs: Self) -> Self;
    /// Bit `i` set iff lane `i` accumulated any hit.
    fn hit_mask(self) -> u32;
}

impl GrayLane for i64 {
    #[inline(always)]
    fn splat(value: i64) -> Self {
        value
    }

    #[inline(always)]
    fn pack(sum1: i64, _sum2: i64) -> Self {
        sum1
    }

    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }

    #[inline(always)]
    fn zero_hit(self) -> Self {
        if self == 0 {
            -1
        } else {
            0
        }
    }

    #[inline(always)]
    fn merge(self, rhs: Self) -> Self {
        self | rhs
    }

    #[inline(always)]
    fn hit_mask(self) -> u32 {
        u32::from(self != 0)
    }
}

impl GrayLane for i64x2 {
    #[inline(always)]
    fn splat(value: i64) -> Self {
        i64x2::splat(value)
    }

    #[inline(always)]
    fn pack(sum1: i64, sum2: i64) -> Self {
        i64x2::from([sum1, sum2])
    }

    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline(always)]
    fn zero_hit(self) -> Self {
        self.cmp_eq(i64x2::ZERO)
    }

    #[inline(always)]
    fn merge(self, rhs: Self) -> Self {
        self | rhs
    }

    #[inline(always)]
    fn hit_mask(self) -> u32 {
        let lanes = self.to_array();
        u32::from(lanes[0] != 0) | (u32::from(lanes[1] != 0) << 1)
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::GrayLane;
    use core::arch::x86_64::{
        __m128i, _mm_add_epi64, _mm_and_si128, _mm_cmpeq_epi32, _mm_cmpeq_epi64,
        _mm_movemask_epi8, _mm_or_si128, _mm_set1_epi64x, _mm_set_epi64x, _mm_setzero_si128,
        _mm_srli_epi64,
    };

    /// Two packets per register; 64-bit equality synthesised from two 32-bit
    /// compares (no `pcmpeqq` before SSE4.1).
    #[derive(Clone, Copy)]
    pub struct Sse2Lane(pub(super) __m128i);

    impl GrayLane for Sse2Lane {
        #[inline(always)]
        fn splat(value: i64) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            Self(unsafe { _mm_set1_epi64x(value) })
        }

        #[inline(always)]
        fn pack(sum1: i64, sum2: i64) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            Self(unsafe { _mm_set_epi64x(sum2, sum1) })
        }

        #[inline(always)]
        fn add(self, rhs: Self) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            Self(unsafe { _mm_add_epi64(self.0, rhs.0) })
        }

        #[inline(always)]
        fn zero_hit(self) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            unsafe {
                let eq32 = _mm_cmpeq_epi32(self.0, _mm_setzero_si128());
                Self(_mm_and_si128(_mm_srli_epi64(eq32, 32), eq32))
            }
        }

        #[inline(always)]
        fn merge(self, rhs: Self) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            Self(unsafe { _mm_or_si128(self.0, rhs.0) })
        }

        #[inline(always)]
        fn hit_mask(self) -> u32 {
            // SAFETY: SSE2 is baseline on x86_64.
            let bytes = unsafe { _mm_movemask_epi8(self.0) } as u32;
            u32::from(bytes & 0x000f != 0) | (u32::from(bytes & 0x0f00 != 0) << 1)
        }
    }

    /// SSE4.1 variant using the native 64-bit compare.
    #[derive(Clone, Copy)]
    pub struct Sse41Lane(pub(super) __m128i);

    impl GrayLane for Sse41Lane {
        #[inline(always)]
        fn splat(value: i64) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            Self(unsafe { _mm_set1_epi64x(value) })
        }

        #[inline(always)]
        fn pack(sum1: i64, sum2: i64) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            Self(unsafe { _mm_set_epi64x(sum2, sum1) })
        }

        #[inline(always)]
        fn add(self, rhs: Self) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            Self(unsafe { _mm_add_epi64(self.0, rhs.0) })
        }

        #[inline(always)]
        fn zero_hit(self) -> Self {
            // SAFETY: callers reach this lane only after runtime SSE4.1
            // detection (see `detect_kernel`).
            Self(unsafe { _mm_cmpeq_epi64(self.0, _mm_setzero_si128()) })
        }

        #[inline(always)]
        fn merge(self, rhs: Self) -> Self {
            // SAFETY: SSE2 is baseline on x86_64.
            Self(unsafe { _mm_or_si128(self.0, rhs.0) })
        }

        #[inline(always)]
        fn hit_mask(self) -> u32 {
            // SAFETY: SSE2 is baseline on x86_64.
            let bytes = unsafe { _mm_movemask_epi8(self.0) } as u32;
            u32::from(bytes & 0x00ff != 0) | (u32::from(bytes & 0xff00 != 0) << 1)
        }
    }
}

macro_rules! gray_step {
    ($sum:ident, $hits:ident, $delta:expr) => {
        $sum = $sum.add($delta);
        $hits = $hits.merge($sum.zero_hit());
    };
}

/// Doubling ladder: level `n` visits every subset of the first `n+1` deltas,
/// `2^(n+1) - 1` steps in total.
macro_rules! gray_core {
    ($sum:ident, $hits:ident, $v:ident, 1) => {
        gray_step!($sum, $hits, $v[0]);
        gray_step!($sum, $hits, $v[1]);
        gray_step!($sum, $hits, $v[0]);
    };
    ($sum:ident, $hits:ident, $v:ident, 2) => {
        gray_core!($sum, $hits, $v, 1);
        gray_step!($sum, $hits, $v[2]);
        gray_core!($sum, $hits, $v, 1);
    };
    ($sum:ident, $hits:ident, $v:ident, 3) => {
        gray_core!($sum, $hits, $v, 2);
        gray_step!($sum, $hits, $v[3]);
        gray_core!($sum, $hits, $v, 2);
    };
    ($sum:ident, $hits:ident, $v:ident, 4) => {
        gray_core!($sum, $hits, $v, 3);
        gray_step!($sum, $hits, $v[4]);
        gray_core!($sum, $hits, $v, 3);
    };
    ($sum:ident, $hits:ident, $v:ident, 5) => {
        gray_core!($sum, $hits, $v, 4);
        gray_step!($sum, $hits, $v[5]);
        gray_core!($sum, $hits, $v, 4);
    };
    ($sum:ident, $hits:ident, $v:ident, 6) => {
        gray_core!($sum, $hits, $v, 5);
        gray_step!($sum, $hits, $v[6]);
        gray_core!($sum, $hits, $v, 5);
    };
    ($sum:ident, $hits:ident, $v:ident, 7) => {
        gray_core!($sum, $hits, $v, 6);
        gray_step!($sum, $hits, $v[7]);
        gray_core!($sum, $hits, $v, 6);
    };
    ($sum:ident, $hits:ident, $v:ident, 8) => {
        gray_core!($sum, $hits, $v, 7);
        gray_step!($sum, $hits, $v[8]);
        gray_core!($sum, $hits, $v, 7);
    };
}

/// Gray deltas `v0..v8` from the 41-entry table: `v_k` is the signed change
/// when bit `k` toggles mid-walk.
#[inline(always)]
fn gray_deltas<L: GrayLane>(sum_changes: &[i64; 41]) -> [L; 9] {
    let mut deltas = [L::splat(sum_changes[32]); 9];
    let mut running = sum_changes[32];
    for k in 1..9 {
        deltas[k] = L::splat(sum_changes[32 + k].wrapping_sub(running));
        running = running.wrapping_add(sum_changes[32 + k]);
    }
    deltas
}

/// Runs the full 32 x 512 scan for up to two packet sums; hit prefixes for
/// the second sum are reported as `index + 32`.
#[inline(always)]
fn gray_scan_pair<L: GrayLane>(
    sum_changes: &[i64; 41],
    input_sum1: i64,
    input_sum2: i64,
    found: &mut [u32; 64],
) -> usize {
    let deltas = gray_deltas::<L>(sum_changes);
    let inputs = L::pack(input_sum1, input_sum2);
    let mut found_num = 0usize;
    for current in 0..32u32 {
        let mut sum = inputs.add(L::splat(sum_changes[current as usize]));
        let mut hits = sum.zero_hit();
        gray_core!(sum, hits, deltas, 8);
        let mask = hits.hit_mask();
        if mask & 1 != 0 {
            found[found_num] = current;
            found_num += 1;
        }
        if mask & 2 != 0 {
            found[found_num] = current + 32;
            found_num += 1;
        }
        let _ = sum;
    }
    found_num
}

/// Scalar scan of a single packet.
#[must_use]
pub fn naive_scan_scalar(sum_changes: &[i64; 41], input_sum: i64, found: &mut [u32; 64]) -> usize {
    gray_scan_pair::<i64>(sum_changes, input_sum, 0, found)
}

/// Portable two-packet scan via `wide::i64x2`.
#[must_use]
pub fn naive_scan_portable(
    sum_changes: &[i64; 41],
    input_sum1: i64,
    input_sum2: i64,
    found: &mut [u32; 64],
) -> usize {
    gray_scan_pair::<i64x2>(sum_changes, input_sum1, input_sum2, found)
}

/// SSE2 two-packet scan.
///
/// # Safety
///
/// SSE2 is baseline on `x86_64`; kept unsafe for symmetry with the SSE4.1
/// entry so dispatch sites look alike.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
pub unsafe fn naive_scan_sse2(
    sum_changes: &[i64; 41],
    input_sum1: i64,
    input_sum2: i64,
    found: &mut [u32; 64],
) -> usize {
    gray_scan_pair::<x86::Sse2Lane>(sum_changes, input_sum1, input_sum2, found)
}

/// SSE4.1 two-packet scan using `pcmpeqq`.
///
/// # Safety
///
/// The CPU must support SSE4.1; call only after runtime detection.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.1")]
pub unsafe fn naive_scan_sse41(
    sum_changes: &[i64; 41],
    input_sum1: i64,
    input_sum2: i64,
    found: &mut [u32; 64],
) -> usize {
    gray_scan_pair::<x86::Sse41Lane>(sum_changes, input_sum1, input_sum2, found)
}

/// CPU kernel flavour for the naive method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaiveKernel {
    /// One packet per scan, plain integer code.
    Scalar,
    /// Two packets per scan through `wide::i64x2`.
    Portable,
    /// Two packets per scan, SSE2 compare trick.
    Sse2,
    /// Two packets per scan, native 64-bit compare.
    Sse41,
}

impl NaiveKernel {
    /// True when the kernel consumes two packets per scan.
    #[must_use]
    pub fn is_paired(self) -> bool {
        self != Self::Scalar
    }
}

/// Cached runtime pick - detected once at first use.
static DETECTED: OnceLock<NaiveKernel> = OnceLock::new();

/// Best kernel for the current CPU.
#[must_use]
pub fn detect_kernel() -> NaiveKernel {
    *DETECTED.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("sse4.1") {
                return NaiveKernel::Sse41;
            }
            return NaiveKernel::Sse2;
        }
        #[allow(unreachable_code)]
        NaiveKernel::Portable
    })
}

/// Dispatches a two-packet scan to the selected kernel. For
/// [`NaiveKernel::Scalar`] only `input_sum1` is scanned.
#[must_use]
pub fn naive_scan(
    kernel: NaiveKernel,
    sum_changes: &[i64; 41],
    input_sum1: i64,
    input_sum2: i64,
    found: &mut [u32; 64],
) -> usize {
    match kernel {
        NaiveKernel::Scalar => naive_scan_scalar(sum_changes, input_sum1, found),
        NaiveKernel::Portable => naive_scan_portable(sum_changes, input_sum1, input_sum2, found),
        #[cfg(target_arch = "x86_64")]
        // SAFETY: SSE2 is baseline on x86_64.
        NaiveKernel::Sse2 => unsafe {
            naive_scan_sse2(sum_changes, input_sum1, input_sum2, found)
        },
        #[cfg(target_arch = "x86_64")]
        // SAFETY: Sse41 is only selected by detect_kernel or an explicit
        // user flag; both promise the feature is present.
        NaiveKernel::Sse41 => unsafe {
            naive_scan_sse41(sum_changes, input_sum1, input_sum2, found)
        },
        #[cfg(not(target_arch = "x86_64"))]
        NaiveKernel::Sse2 | NaiveKernel::Sse41 => {
            naive_scan_portable(sum_changes, input_sum1, input_sum2, found)
        }
    }
}
