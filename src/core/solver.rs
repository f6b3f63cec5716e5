use std::convert::Infallible;

pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// Which half of the bracket the evaluator wants to keep.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// The target lies below the midpoint: move the upper bound down.
    Lower,
    /// The target lies above the midpoint: move the lower bound up.
    Higher,
    Stop,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Tolerance {
    Absolute(f64),
    Relative(f64),
}

/// Bounded bisection over `[lo, hi]`.
///
/// The evaluator owns whatever "best so far" bookkeeping it needs; the bracket
/// only decides where the next midpoint goes. The width test runs before every
/// evaluation, so a search never evaluates more than `max_iterations` points.
#[derive(Copy, Clone, Debug)]
pub struct Bisection {
    lo: f64,
    hi: f64,
    max_iterations: u32,
    tolerance: Tolerance,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BisectionOutcome {
    pub lo: f64,
    pub hi: f64,
    pub iterations: u32,
    pub converged: bool,
}

impl Bisection {
    pub fn new(lo: f64, hi: f64) -> Self {
        Self {
            lo,
            hi,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: Tolerance::Absolute(0.0),
        }
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn tolerance(mut self, width: f64) -> Self {
        self.tolerance = Tolerance::Absolute(width);
        self
    }

    /// Width tolerance as a fraction of the initial bracket width.
    pub fn relative_tolerance(mut self, fraction: f64) -> Self {
        self.tolerance = Tolerance::Relative(fraction);
        self
    }

    pub fn try_run<F, E>(self, mut evaluate: F) -> Result<BisectionOutcome, E>
    where
        F: FnMut(f64) -> Result<Step, E>,
    {
        let width = match self.tolerance {
            Tolerance::Absolute(width) => width,
            Tolerance::Relative(fraction) => fraction * (self.hi - self.lo).abs(),
        };

        let mut lo = self.lo;
        let mut hi = self.hi;
        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.max_iterations {
            if hi - lo < width {
                converged = true;
                break;
            }
            let mid = (lo + hi) / 2.0;
            iterations += 1;
            match evaluate(mid)? {
                Step::Lower => hi = mid,
                Step::Higher => lo = mid,
                Step::Stop => {
                    converged = true;
                    break;
                }
            }
        }

        Ok(BisectionOutcome {
            lo,
            hi,
            iterations,
            converged,
        })
    }

    pub fn run<F>(self, mut evaluate: F) -> BisectionOutcome
    where
        F: FnMut(f64) -> Step,
    {
        match self.try_run::<_, Infallible>(|mid| Ok(evaluate(mid))) {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    #[test]
    fn finds_square_root_within_tolerance() {
        let outcome = Bisection::new(0.0, 4.0)
            .tolerance(1e-9)
            .run(|x| if x * x >= 2.0 { Step::Lower } else { Step::Higher });
        assert!(outcome.converged);
        assert_close(outcome.hi, 2.0_f64.sqrt(), 1e-9);
        assert!(outcome.lo <= 2.0_f64.sqrt() && 2.0_f64.sqrt() <= outcome.hi);
    }

    #[test]
    fn stops_at_iteration_cap() {
        let mut calls = 0;
        let outcome = Bisection::new(0.0, 1.0).max_iterations(5).run(|_| {
            calls += 1;
            Step::Higher
        });
        assert_eq!(calls, 5);
        assert_eq!(outcome.iterations, 5);
        assert!(!outcome.converged);
        assert_close(outcome.lo, 1.0 - 1.0 / 32.0, 1e-15);
    }

    #[test]
    fn stop_ends_search_immediately() {
        let outcome = Bisection::new(-1.0, 1.0).run(|mid| {
            assert_eq!(mid, 0.0);
            Step::Stop
        });
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.converged);
    }

    #[test]
    fn relative_tolerance_scales_with_bracket() {
        let outcome = Bisection::new(0.0, 1_000_000.0)
            .relative_tolerance(1e-6)
            .run(|x| if x >= 123_456.0 { Step::Lower } else { Step::Higher });
        assert!(outcome.hi - outcome.lo < 1.0);
        assert!(outcome.iterations <= 21);
    }

    #[test]
    fn evaluator_errors_propagate() {
        let result = Bisection::new(0.0, 1.0).try_run(|mid| {
            if mid < 0.3 {
                Err("too low")
            } else {
                Ok(Step::Lower)
            }
        });
        assert_eq!(result, Err("too low"));
    }

    proptest! {
        #[test]
        fn prop_monotone_predicate_brackets_threshold(
            threshold in -0.999f64..0.999,
            tolerance_exp in 3i32..10
        ) {
            let tolerance = 10f64.powi(-tolerance_exp);
            let outcome = Bisection::new(-1.0, 1.0)
                .tolerance(tolerance)
                .run(|x| if x >= threshold { Step::Lower } else { Step::Higher });
            prop_assert!(outcome.converged);
            prop_assert!(outcome.lo <= threshold && threshold <= outcome.hi);
            prop_assert!(outcome.hi - outcome.lo < tolerance);
        }
    }
}
