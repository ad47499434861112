//! Token-level stopping criterion.

/// Stops generation when a stop token sequence appears in the generated
/// tokens: single-token stops match anywhere, multi-token stops by sliding
/// window.
#[derive(Debug, Clone)]
pub struct StopOnTokens {
    sequences: Vec<Vec<u32>>,
}

impl StopOnTokens {
    /// Build from encoded stop sequences; empty sequences are dropped.
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        Self { sequences: sequences.into_iter().filter(|s| !s.is_empty()).collect() }
    }

    /// Whether any stop sequence appears in `generated`.
    pub fn should_stop(&self, generated: &[u32]) -> bool {
        for sequence in &self.sequences {
            match sequence.as_slice() {
                [single] => {
                    if generated.contains(single) {
                        return true;
                    }
                }
                multi => {
                    if generated.len() >= multi.len()
                        && generated.windows(multi.len()).any(|window| window == multi)
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Whether any sequences are registered at all.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_stop_matches_anywhere() {
        let stop = StopOnTokens::new(vec![vec![7]]);
        assert!(stop.should_stop(&[1, 7, 3]));
        assert!(stop.should_stop(&[7]));
        assert!(!stop.should_stop(&[1, 2, 3]));
    }

    #[test]
    fn multi_token_stop_uses_sliding_window() {
        let stop = StopOnTokens::new(vec![vec![4, 5]]);
        assert!(stop.should_stop(&[1, 4, 5, 9]));
        assert!(stop.should_stop(&[4, 5]));
        // Tokens present but not adjacent do not match.
        assert!(!stop.should_stop(&[4, 1, 5]));
    }

    #[test]
    fn empty_sequences_are_ignored() {
        let stop = StopOnTokens::new(vec![vec![], vec![2, 3]]);
        assert!(!stop.is_empty());
        assert!(!stop.should_stop(&[1]));
        assert!(stop.should_stop(&[2, 3]));

        let none = StopOnTokens::new(vec![]);
        assert!(none.is_empty());
        assert!(!none.should_stop(&[1, 2, 3]));
    }
}
