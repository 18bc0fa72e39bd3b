//! Lazily-typed vector registers.
//!
//! Scalar SSE code tends to keep a single `f32`/`f64` in lane 0 for long stretches. A register
//! therefore caches that scalar in its [`Repr`] and only writes it back into the raw 512-bit
//! storage (lane 0, little-endian low bits) when some other view is requested.

/// Live representation of a [`VectorReg`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Repr {
    /// The raw storage is authoritative.
    Vector,
    /// Bits 0..32 are this value; the raw copy of those bits is stale.
    F32(f32),
    /// Bits 0..64 are this value; the raw copy of those bits is stale.
    F64(f64),
}

/// One 512-bit vector register. `xmm` is bits 0..128, `ymm` bits 0..256.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorReg {
    raw: [u128; 4],
    repr: Repr,
}

impl Default for VectorReg {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl VectorReg {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            raw: [0; 4],
            repr: Repr::Vector,
        }
    }

    #[must_use]
    pub fn repr(&self) -> Repr {
        self.repr
    }

    /// Writes a cached scalar back into lane 0 and switches to [`Repr::Vector`].
    pub fn materialize(&mut self) {
        match self.repr {
            Repr::Vector => return,
            Repr::F32(v) => {
                self.raw[0] = (self.raw[0] & !0xffff_ffff) | u128::from(v.to_bits());
            }
            Repr::F64(v) => {
                self.raw[0] = (self.raw[0] & !u128::from(u64::MAX)) | u128::from(v.to_bits());
            }
        }
        self.repr = Repr::Vector;
    }

    #[must_use]
    pub fn xmm(&mut self) -> u128 {
        self.materialize();
        self.raw[0]
    }

    #[must_use]
    pub fn ymm(&mut self) -> [u128; 2] {
        self.materialize();
        [self.raw[0], self.raw[1]]
    }

    #[must_use]
    pub fn zmm(&mut self) -> [u128; 4] {
        self.materialize();
        self.raw
    }

    #[must_use]
    pub fn f32(&mut self) -> f32 {
        match self.repr {
            Repr::F32(v) => v,
            _ => f32::from_bits(self.xmm() as u32),
        }
    }

    #[must_use]
    pub fn f64(&mut self) -> f64 {
        match self.repr {
            Repr::F64(v) => v,
            _ => f64::from_bits(self.xmm() as u64),
        }
    }

    /// Scalar write of bits 0..32; everything else is preserved.
    pub fn set_f32(&mut self, v: f32) {
        if let Repr::F64(_) = self.repr {
            self.materialize();
        }
        self.repr = Repr::F32(v);
    }

    /// Scalar write of bits 0..64; everything else is preserved.
    pub fn set_f64(&mut self, v: f64) {
        if let Repr::F32(_) = self.repr {
            self.materialize();
        }
        self.repr = Repr::F64(v);
    }

    /// Legacy-SSE 128-bit write: bits 128..512 are preserved.
    pub fn set_xmm(&mut self, v: u128) {
        self.raw[0] = v;
        self.repr = Repr::Vector;
    }

    /// VEX.128 write: bits 128..512 are zeroed.
    pub fn set_xmm_vex(&mut self, v: u128) {
        self.raw = [v, 0, 0, 0];
        self.repr = Repr::Vector;
    }

    /// VEX.256 write: bits 256..512 are zeroed.
    pub fn set_ymm(&mut self, v: [u128; 2]) {
        self.raw = [v[0], v[1], 0, 0];
        self.repr = Repr::Vector;
    }

    pub fn set_zmm(&mut self, v: [u128; 4]) {
        self.raw = v;
        self.repr = Repr::Vector;
    }

    /// `vzeroupper`: zeroes bits 128..512.
    pub fn zero_upper(&mut self) {
        self.materialize();
        self.raw[1] = 0;
        self.raw[2] = 0;
        self.raw[3] = 0;
    }

    /// Materialized contents as eight little-endian 64-bit words.
    #[must_use]
    pub fn words(&mut self) -> [u64; 8] {
        self.materialize();
        let mut out = [0u64; 8];
        for (i, lane) in self.raw.iter().enumerate() {
            out[i * 2] = *lane as u64;
            out[i * 2 + 1] = (*lane >> 64) as u64;
        }
        out
    }

    #[must_use]
    pub fn from_words(words: [u64; 8]) -> Self {
        let mut raw = [0u128; 4];
        for (i, lane) in raw.iter_mut().enumerate() {
            *lane = u128::from(words[i * 2]) | (u128::from(words[i * 2 + 1]) << 64);
        }
        Self {
            raw,
            repr: Repr::Vector,
        }
    }
}
