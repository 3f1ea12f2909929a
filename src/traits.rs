use crate::error::Result;
use faer::Mat;
use sprs::CsMat;

/// A direct solver for real sparse systems `A·x = b`.
///
/// Implementations are stateless so that a single instance may be shared
/// between islands solved on different threads.
pub trait LinearSolver: Send + Sync {
    /// Factorizes `a` once for repeated solves.
    fn factorize(&self, a: &CsMat<f64>) -> Result<Box<dyn Factorization>>;

    /// Factorizes `a` and solves for a single right-hand side.
    fn solve(&self, a: &CsMat<f64>, b: &[f64]) -> Result<Vec<f64>> {
        self.factorize(a)?.solve(b)
    }
}

/// A factorized matrix.
pub trait Factorization {
    fn dim(&self) -> usize;

    fn solve(&self, b: &[f64]) -> Result<Vec<f64>>;

    /// Solves for every column of `b` in one batch.
    fn solve_mat(&self, b: &Mat<f64>) -> Result<Mat<f64>>;
}

pub trait ProgressMonitor {
    fn update(&self, i: usize, norm_f: f64);
}

/// Forwards iteration progress to the `log` facade.
pub struct LogProgress<'a> {
    pub method: &'a str,
}

impl<'a> ProgressMonitor for LogProgress<'a> {
    fn update(&self, i: usize, norm_f: f64) {
        log::debug!("{} {:>3}  {:10.3e}", self.method, i, norm_f);
    }
}
