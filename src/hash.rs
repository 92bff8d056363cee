//! Format/version hashing.
//!
//! Small integer fingerprints of pixel formats, combined across a render
//! pass's attachments to cheaply detect "did anything this bundle depends on
//! structurally change". Combination is order-sensitive. Equality comparison
//! only; not suitable for anything security-related.

/// Fingerprint of one pixel format, or of a pass's combined attachment
/// formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FormatHash(pub u32);

impl FormatHash {
    pub const ZERO: Self = Self(0);
}

/// Hash a small format id through a mulberry32-style bit mix.
pub fn hash_format(id: u32) -> FormatHash {
    let mut t = id.wrapping_add(0x6d2b_79f5);
    t = (t ^ (t >> 15)).wrapping_mul(t | 1);
    t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
    FormatHash(t ^ (t >> 14))
}

/// Combine two hashes. Order-sensitive: `combine(a, b) != combine(b, a)`
/// in general.
pub fn combine(a: FormatHash, b: FormatHash) -> FormatHash {
    FormatHash(a.0 ^ b.0.rotate_left(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::TextureFormat;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_format(3), hash_format(3));
        assert_eq!(hash_format(0), hash_format(0));
    }

    #[test]
    fn test_no_collisions_among_concrete_formats() {
        let formats = [
            TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float,
            TextureFormat::Depth32Float,
            TextureFormat::Depth24PlusStencil8,
            TextureFormat::R32Float,
            TextureFormat::Rg32Float,
        ];
        for (i, a) in formats.iter().enumerate() {
            for b in &formats[i + 1..] {
                assert_ne!(hash_format(a.id()), hash_format(b.id()));
            }
        }
    }

    #[test]
    fn test_combine_distinguishes_second_operand() {
        let a = hash_format(TextureFormat::Bgra8UnormSrgb.id());
        for x in 0..10u32 {
            for y in 0..10u32 {
                if x != y {
                    assert_ne!(
                        combine(a, hash_format(x)),
                        combine(a, hash_format(y)),
                        "combined hashes collided for format ids {x} and {y}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_combine_is_order_sensitive() {
        let a = hash_format(1);
        let b = hash_format(2);
        assert_ne!(combine(a, b), combine(b, a));
    }
}
