use crate::error::{PowerFlowError, Result};
use crate::traits::{Factorization, LinearSolver};
use faer::linalg::solvers::PartialPivLu;
use faer::prelude::*;
use faer::sparse::linalg::solvers::Lu;
use faer::sparse::linalg::LuError;
use faer::sparse::{SparseColMat, Triplet};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

/// Direct linear solver backends.
///
/// The backend is an explicit option passed down to every solver; there is
/// no process-wide selection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverBackend {
    /// Sparse LU with partial pivoting.
    #[default]
    SparseLu,
    /// Dense LU with partial pivoting. Only sensible for small systems.
    DenseLu,
}

impl SolverBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolverBackend::SparseLu => "sparse",
            SolverBackend::DenseLu => "dense",
        }
    }

    pub fn build(&self) -> Box<dyn LinearSolver> {
        match self {
            SolverBackend::SparseLu => Box::new(SparseLu),
            SolverBackend::DenseLu => Box::new(DenseLu),
        }
    }
}

impl fmt::Display for SolverBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SolverBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sparse" | "sparselu" | "sparse_lu" => Ok(SolverBackend::SparseLu),
            "dense" | "denselu" | "dense_lu" => Ok(SolverBackend::DenseLu),
            other => Err(format!("unknown solver backend: {}", other)),
        }
    }
}

fn check_square(a: &CsMat<f64>) -> Result<usize> {
    if a.rows() != a.cols() {
        return Err(PowerFlowError::DimensionMismatch {
            what: "system matrix columns",
            expected: a.rows(),
            found: a.cols(),
        });
    }
    Ok(a.rows())
}

fn check_rhs(n: usize, found: usize) -> Result<()> {
    if n != found {
        return Err(PowerFlowError::DimensionMismatch {
            what: "right-hand side",
            expected: n,
            found,
        });
    }
    Ok(())
}

// Numerically singular pivots surface as non-finite values.
fn check_finite<'a>(x: impl IntoIterator<Item = &'a f64>) -> Result<()> {
    if x.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(PowerFlowError::Singular(
            "factorization produced non-finite values".to_string(),
        ))
    }
}

fn column(b: &[f64]) -> Mat<f64> {
    Mat::from_fn(b.len(), 1, |i, _| b[i])
}

fn mat_col(x: &Mat<f64>) -> Vec<f64> {
    (0..x.nrows()).map(|i| x[(i, 0)]).collect()
}

fn mat_values(x: &Mat<f64>) -> Vec<f64> {
    let mut values = Vec::with_capacity(x.nrows() * x.ncols());
    for j in 0..x.ncols() {
        values.extend_from_slice(x.col_as_slice(j));
    }
    values
}

pub struct SparseLu;

struct SparseLuFactors {
    n: usize,
    // `None` for an empty system.
    lu: Option<Lu<usize, f64>>,
}

impl LinearSolver for SparseLu {
    fn factorize(&self, a: &CsMat<f64>) -> Result<Box<dyn Factorization>> {
        let n = check_square(a)?;
        if n == 0 {
            return Ok(Box::new(SparseLuFactors { n, lu: None }));
        }

        let triplets: Vec<Triplet<usize, usize, f64>> = a
            .iter()
            .map(|(&v, (i, j))| Triplet::new(i, j, v))
            .collect();
        let mat = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
            .map_err(|err| PowerFlowError::LinearSolver(err.to_string()))?;

        // The simplicial factorization panics on an exactly zero pivot.
        let lu = panic::catch_unwind(AssertUnwindSafe(|| mat.sp_lu()))
            .map_err(|_| PowerFlowError::Singular("zero pivot".to_string()))?
            .map_err(|err| match err {
                LuError::SymbolicSingular { index } => {
                    PowerFlowError::Singular(format!("no pivot found in column {}", index))
                }
                err => PowerFlowError::LinearSolver(err.to_string()),
            })?;

        Ok(Box::new(SparseLuFactors { n, lu: Some(lu) }))
    }
}

impl Factorization for SparseLuFactors {
    fn dim(&self) -> usize {
        self.n
    }

    fn solve(&self, b: &[f64]) -> Result<Vec<f64>> {
        check_rhs(self.n, b.len())?;
        let Some(lu) = &self.lu else {
            return Ok(Vec::new());
        };
        let x = mat_col(&lu.solve(&column(b)));
        check_finite(&x)?;
        Ok(x)
    }

    fn solve_mat(&self, b: &Mat<f64>) -> Result<Mat<f64>> {
        check_rhs(self.n, b.nrows())?;
        let Some(lu) = &self.lu else {
            return Ok(Mat::zeros(0, b.ncols()));
        };
        let x = lu.solve(b);
        check_finite(&mat_values(&x))?;
        Ok(x)
    }
}

pub struct DenseLu;

struct DenseLuFactors {
    n: usize,
    lu: PartialPivLu<f64>,
}

impl LinearSolver for DenseLu {
    fn factorize(&self, a: &CsMat<f64>) -> Result<Box<dyn Factorization>> {
        let n = check_square(a)?;
        let mut dense = Mat::<f64>::zeros(n, n);
        for (&v, (i, j)) in a.iter() {
            dense[(i, j)] += v;
        }
        let lu = dense.partial_piv_lu();
        Ok(Box::new(DenseLuFactors { n, lu }))
    }
}

impl Factorization for DenseLuFactors {
    fn dim(&self) -> usize {
        self.n
    }

    fn solve(&self, b: &[f64]) -> Result<Vec<f64>> {
        check_rhs(self.n, b.len())?;
        if self.n == 0 {
            return Ok(Vec::new());
        }
        let x = mat_col(&self.lu.solve(&column(b)));
        check_finite(&x)?;
        Ok(x)
    }

    fn solve_mat(&self, b: &Mat<f64>) -> Result<Mat<f64>> {
        check_rhs(self.n, b.nrows())?;
        if self.n == 0 {
            return Ok(Mat::zeros(0, b.ncols()));
        }
        let x = self.lu.solve(b);
        check_finite(&mat_values(&x))?;
        Ok(x)
    }
}
