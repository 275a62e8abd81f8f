//! Ordered fallback chains.
//!
//! Format detection, pattern parsing and header decoding all follow the same
//! shape: try a list of strategies in order and keep the first whose output
//! passes a shared "did it mostly succeed" predicate.

#[derive(Debug, Clone, PartialEq)]
pub struct Accepted<S, T> {
    pub strategy: S,
    pub output: T,
    /// 1-based position of the accepted strategy in the chain.
    pub attempts: usize,
}

/// Runs `strategies` in order and returns the first output accepted by
/// `accept`. Rejected outputs are dropped; `None` means every strategy was
/// rejected.
pub fn first_accepted<S, T, I, R, A>(strategies: I, mut run: R, accept: A) -> Option<Accepted<S, T>>
where
    I: IntoIterator<Item = S>,
    R: FnMut(&S) -> T,
    A: Fn(&T) -> bool,
{
    for (idx, strategy) in strategies.into_iter().enumerate() {
        let output = run(&strategy);
        if accept(&output) {
            return Some(Accepted {
                strategy,
                output,
                attempts: idx + 1,
            });
        }
    }
    None
}

/// Fraction of `hits` over `total`, with an empty population scoring zero.
pub fn ratio(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_accepted_not_best() {
        let scores = [0.3, 0.85, 0.99];
        let accepted = first_accepted(0..scores.len(), |idx| scores[*idx], |s| *s >= 0.8)
            .expect("one strategy accepted");
        assert_eq!(accepted.strategy, 1);
        assert_eq!(accepted.attempts, 2);
    }

    #[test]
    fn stops_running_after_acceptance() {
        let mut runs = 0;
        let _ = first_accepted(
            ["a", "b", "c"],
            |_| {
                runs += 1;
                true
            },
            |ok| *ok,
        );
        assert_eq!(runs, 1);
    }

    #[test]
    fn none_when_all_rejected() {
        assert!(first_accepted([1, 2, 3], |n| *n, |n| *n > 10).is_none());
    }

    #[test]
    fn ratio_handles_empty_population() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}
