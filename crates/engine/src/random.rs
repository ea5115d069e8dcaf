use std::time::{SystemTime, UNIX_EPOCH};

use rand::{RngCore, SeedableRng, TryRngCore, rngs::OsRng, rngs::SmallRng};

const PING_RESERVED_64: u64 = 0x00FF_FFFF_FFFF_FFFF;
const PING_RESERVED_32: u32 = 0x00FF_FFFF;

// One second's worth of microseconds mixed with OS entropy; the clock's
// least significant bits are themselves a usable randomness source on links
// where segments arrive at unpredictable times.
fn hardware_seed() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0);

    micros ^ OsRng.try_next_u64().unwrap_or(0x9E37_79B9_7F4A_7C15)
}

/// Hybrid pseudo/hardware random source.
///
/// A fast PRNG is reseeded from the OS entropy source every 256 outputs,
/// and every output is XOR-mixed with an additional entropy word that is
/// itself refreshed halfway through each reseed period. The mixing keeps
/// outputs unpredictable even if the PRNG state leaks.
pub struct HybridRng {
    prng: SmallRng,
    additional_entropy: u64,
    use_counter: u8,
    reseed_prng_count: u64,
    reseed_additional_entropy_count: u64,
}

impl Default for HybridRng {
    fn default() -> Self {
        Self {
            prng: SmallRng::seed_from_u64(hardware_seed()),
            additional_entropy: hardware_seed(),
            use_counter: 0,
            reseed_prng_count: 0,
            reseed_additional_entropy_count: 0,
        }
    }
}

impl HybridRng {
    pub fn next_u64(&mut self) -> u64 {
        self.use_counter = self.use_counter.wrapping_add(1);
        if self.use_counter == 0 {
            self.prng = SmallRng::seed_from_u64(hardware_seed());
            self.reseed_prng_count += 1;
        } else if self.use_counter == 127 {
            self.add_hardware_entropy();
            self.reseed_additional_entropy_count += 1;
        }

        self.prng.next_u64() ^ self.additional_entropy
    }

    pub fn add_hardware_entropy(&mut self) {
        self.additional_entropy ^= hardware_seed();
    }

    pub fn add_custom_entropy(&mut self, entropy: u64) {
        self.additional_entropy ^= entropy;
    }

    pub fn reseed_prng_count(&self) -> u64 {
        self.reseed_prng_count
    }

    pub fn reseed_additional_entropy_count(&self) -> u64 {
        self.reseed_additional_entropy_count
    }
}

/// Generator for LTP session numbers and serial numbers.
///
/// Session numbers combine three parts so that concurrent sessions cannot
/// collide even when the random bits do:
///
/// - the engine index in the top byte, so a receiver can recover it from
///   any session number with a constant shift;
/// - a random middle, below one zero bit of headroom so that incrementing
///   serial-number-style values can never roll into the index;
/// - a circular incremental counter in the low bits, which guarantees that
///   any two session numbers generated within the counter's period differ.
///
/// 64-bit layout: bits 63..56 engine index, bit 55 zero, bits 54..24
/// random, bits 23..0 incremental in `[1, 2^24 - 1]`. 32-bit layout: bits
/// 31..24 engine index, bit 23 zero, bits 22..21 random, bits 20..0
/// incremental in `[1, 2^21 - 1]`. All-ones in the non-index bits is the
/// reserved ping session number.
pub struct RandomNumberGenerator {
    rng: HybridRng,
    incremental: u32,
    engine_index: u8,
}

impl RandomNumberGenerator {
    /// `engine_index` must be in `[1, 7]`.
    pub fn new(engine_index: u8) -> Self {
        debug_assert!((1..=7).contains(&engine_index));

        Self {
            rng: HybridRng::default(),
            incremental: 1,
            engine_index,
        }
    }

    pub fn random_session_number_64(&mut self) -> u64 {
        let mut number = (self.rng.next_u64() << 24) & 0x007F_FFFF_FF00_0000;
        number |= (self.engine_index as u64) << 56;
        number |= self.incremental as u64;

        self.incremental += 1;
        if self.incremental == 1 << 24 {
            self.incremental = 1;
        }

        number
    }

    pub fn random_session_number_32(&mut self) -> u32 {
        let mut number = ((self.rng.next_u64() << 21) as u32) & 0x0060_0000;
        number |= (self.engine_index as u32) << 24;
        number |= self.incremental;

        self.incremental += 1;
        if self.incremental == 1 << 21 {
            self.incremental = 1;
        }

        number
    }

    pub fn ping_session_number_64(&self) -> u64 {
        PING_RESERVED_64 | ((self.engine_index as u64) << 56)
    }

    pub fn ping_session_number_32(&self) -> u32 {
        PING_RESERVED_32 | ((self.engine_index as u32) << 24)
    }

    /// Random initial serial number: bit 63 zero for increment headroom, 47
    /// random bits, low 16 bits set to 1 so the serial number is never zero.
    pub fn random_serial_number_64(&mut self) -> u64 {
        ((self.rng.next_u64() << 16) & 0x7FFF_FFFF_FFFF_0000) | 1
    }

    pub fn random_serial_number_32(&mut self) -> u32 {
        (((self.rng.next_u64() << 16) as u32) & 0x7FFF_0000) | 1
    }

    pub fn engine_index(&self) -> u8 {
        self.engine_index
    }

    pub fn set_engine_index(&mut self, engine_index: u8) {
        debug_assert!((1..=7).contains(&engine_index));
        self.engine_index = engine_index;
    }

    pub fn rng_mut(&mut self) -> &mut HybridRng {
        &mut self.rng
    }

    /// Current value of the circular incremental counter.
    pub fn incremental_part(&self) -> u32 {
        self.incremental
    }

    /// Recover the engine index from a session number of either width: a
    /// non-zero top byte means a 64-bit number, otherwise the number is
    /// 32-bit and the index sits in bits 31..24.
    pub fn engine_index_from_session_number(session_number: u64) -> u8 {
        let index_64 = (session_number >> 56) as u8;
        if index_64 != 0 {
            index_64
        } else {
            (session_number >> 24) as u8
        }
    }

    pub fn is_ping_session(session_number: u64, is_32_bit: bool) -> bool {
        if is_32_bit {
            session_number & PING_RESERVED_32 as u64 == PING_RESERVED_32 as u64
        } else {
            session_number & PING_RESERVED_64 == PING_RESERVED_64
        }
    }
}
