//! Numerical-stability guard for sampling.
//!
//! LoRA-adapted models can produce extreme logits (inf, -inf, nan) that make
//! the sampler's probability tensor invalid. The guard replaces them with
//! clamped sentinels and is a strict no-op on finite input so the
//! distribution is never perturbed unnecessarily.

/// Replacement magnitude for non-finite logits.
pub const LOGIT_CLAMP: f32 = 1e4;

/// Sanitize a logits vector in place. Returns whether anything was touched.
pub fn sanitize_logits(logits: &mut [f32]) -> bool {
    if logits.iter().all(|v| v.is_finite()) {
        return false;
    }
    for value in logits.iter_mut() {
        if value.is_nan() {
            *value = -LOGIT_CLAMP;
        } else if *value == f32::INFINITY {
            *value = LOGIT_CLAMP;
        } else if *value == f32::NEG_INFINITY {
            *value = -LOGIT_CLAMP;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_input_is_untouched() {
        let mut logits = vec![0.5, -3.0, 100.0, -1e9];
        let before = logits.clone();
        assert!(!sanitize_logits(&mut logits));
        assert_eq!(logits, before);
    }

    #[test]
    fn non_finite_values_are_replaced() {
        let mut logits = vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 1.0];
        assert!(sanitize_logits(&mut logits));
        assert_eq!(logits[0], -LOGIT_CLAMP);
        assert_eq!(logits[1], LOGIT_CLAMP);
        assert_eq!(logits[2], -LOGIT_CLAMP);
        assert_eq!(logits[3], 1.0);
        assert!(logits.iter().all(|v| v.is_finite()));
    }
}
