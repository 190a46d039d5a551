use crate::config::{Number, EPSILON};
use wide::f32x8;

const LANES: usize = 8;

#[inline]
fn lane(v: &[Number], i: usize) -> f32x8 {
    f32x8::new([
        v[i],
        v[i + 1],
        v[i + 2],
        v[i + 3],
        v[i + 4],
        v[i + 5],
        v[i + 6],
        v[i + 7],
    ])
}

/// Squared Euclidean distance between two vectors of equal length.
pub fn squared_l2_distance_simd(a: &[Number], b: &[Number]) -> Number {
    debug_assert_eq!(a.len(), b.len());

    let len = a.len().min(b.len());
    let simd_len = len - (len % LANES);
    let mut acc = f32x8::splat(0.0);

    for i in (0..simd_len).step_by(LANES) {
        let diff = lane(a, i) - lane(b, i);
        acc += diff * diff;
    }

    let mut sum = acc.reduce_add();
    for i in simd_len..len {
        let diff = a[i] - b[i];
        sum += diff * diff;
    }
    sum
}

/// Cosine similarity in `[-1, 1]`. Zero-magnitude inputs score 0.
pub fn cosine_similarity_simd(a: &[Number], b: &[Number]) -> Number {
    debug_assert_eq!(a.len(), b.len());

    let mut dot_product = f32x8::splat(0.0);
    let mut mag_a = f32x8::splat(0.0);
    let mut mag_b = f32x8::splat(0.0);

    let len = a.len().min(b.len());
    let simd_len = len - (len % LANES);

    for i in (0..simd_len).step_by(LANES) {
        let va = lane(a, i);
        let vb = lane(b, i);
        dot_product += va * vb;
        mag_a += va * va;
        mag_b += vb * vb;
    }

    let mut scalar_dot_product = dot_product.reduce_add();
    let mut scalar_mag_a = mag_a.reduce_add();
    let mut scalar_mag_b = mag_b.reduce_add();

    for i in simd_len..len {
        scalar_dot_product += a[i] * b[i];
        scalar_mag_a += a[i] * a[i];
        scalar_mag_b += b[i] * b[i];
    }

    let denominator = (scalar_mag_a * scalar_mag_b).sqrt();
    if denominator < EPSILON {
        0.0
    } else {
        (scalar_dot_product / denominator).clamp(-1.0, 1.0)
    }
}

/// `1 - cosine_similarity`, so identical directions score 0.
pub fn cosine_distance_simd(a: &[Number], b: &[Number]) -> Number {
    (1.0 - cosine_similarity_simd(a, b)).max(0.0)
}

pub fn normalize_vector(vector: &mut [Number]) {
    let magnitude: Number = vector.iter().map(|&x| x * x).sum::<Number>().sqrt();
    if magnitude > EPSILON {
        for x in vector.iter_mut() {
            *x /= magnitude;
        }
    }
}

pub fn all_finite(vector: &[Number]) -> bool {
    vector.iter().all(|x| x.is_finite())
}
