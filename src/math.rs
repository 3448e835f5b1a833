//! Math types for FernSonic

pub use glam::Vec3;

/// A facing described by position-relative `at` and `up` direction vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub at: Vec3,
    pub up: Vec3,
}

impl Orientation {
    pub fn new(at: Vec3, up: Vec3) -> Self {
        Self { at, up }
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            at: -Vec3::Z,
            up: Vec3::Y,
        }
    }
}

/// Converts a value from decibels to linear gain.
pub fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Converts a value from linear gain to decibels.
pub fn linear_to_db(gain: f32) -> f32 {
    gain.log10() * 20.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_round_trip() {
        let gain = db_to_linear(-6.0);
        assert!((gain - 0.5012).abs() < 1e-3);
        assert!((linear_to_db(gain) + 6.0).abs() < 1e-4);
    }
}
