//! Vector math shared by the encoder, index and ranker.
//!
//! All stored and query embeddings are expected to be unit length so that
//! a dot product equals cosine similarity.

/// Allowed deviation of ‖v‖₂ from 1.0 before a vector is rejected.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place. Returns `false` (and leaves `v`
/// untouched) when the norm is zero or not finite.
pub fn l2_normalize_in_place(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < f32::EPSILON {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

pub fn is_unit_norm(v: &[f32]) -> bool {
    (l2_norm(v) - 1.0).abs() < UNIT_NORM_TOLERANCE
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
