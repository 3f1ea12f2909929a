use num_traits::Zero;
use sprs::{CsMat, TriMat};
use std::ops::{AddAssign, Mul};

/// Builds a CSC matrix from (row, col, value) triplets. Duplicate entries
/// are summed.
pub fn csc_from_triplets<N>(shape: (usize, usize), entries: &[(usize, usize, N)]) -> CsMat<N>
where
    N: Copy + Zero,
{
    let mut tri = TriMat::with_capacity(shape, entries.len());
    for &(i, j, v) in entries {
        tri.add_triplet(i, j, v);
    }
    tri.to_csc()
}

/// Builds a square diagonal matrix.
pub fn spdiag<N>(d: &[N]) -> CsMat<N>
where
    N: Copy + Zero,
{
    let entries: Vec<(usize, usize, N)> = d.iter().enumerate().map(|(i, &v)| (i, i, v)).collect();
    csc_from_triplets((d.len(), d.len()), &entries)
}

/// Sparse matrix-vector product `A * x`.
pub fn spmv<N>(a: &CsMat<N>, x: &[N]) -> Vec<N>
where
    N: Copy + Zero + AddAssign + Mul<Output = N>,
{
    let mut y = vec![N::zero(); a.rows()];
    for (&v, (i, j)) in a.iter() {
        y[i] += v * x[j];
    }
    y
}

/// Transposed product `A^T * x`.
pub fn spmv_t<N>(a: &CsMat<N>, x: &[N]) -> Vec<N>
where
    N: Copy + Zero + AddAssign + Mul<Output = N>,
{
    let mut y = vec![N::zero(); a.cols()];
    for (&v, (i, j)) in a.iter() {
        y[j] += v * x[i];
    }
    y
}

/// Returns `A[rows, cols]` in CSC format. Indices must be unique.
pub fn select<N>(a: &CsMat<N>, rows: &[usize], cols: &[usize]) -> CsMat<N>
where
    N: Copy + Zero,
{
    let row_map = position_map(a.rows(), rows);
    let col_map = position_map(a.cols(), cols);

    let mut tri = TriMat::new((rows.len(), cols.len()));
    for (&v, (i, j)) in a.iter() {
        if let (Some(r), Some(c)) = (row_map[i], col_map[j]) {
            tri.add_triplet(r, c, v);
        }
    }
    tri.to_csc()
}

/// Inverse lookup of an index list: `map[idx[k]] = Some(k)`.
pub fn position_map(n: usize, idx: &[usize]) -> Vec<Option<usize>> {
    let mut map = vec![None; n];
    for (k, &i) in idx.iter().enumerate() {
        map[i] = Some(k);
    }
    map
}

pub fn diagonal<N>(a: &CsMat<N>) -> Vec<N>
where
    N: Copy + Zero,
{
    let n = a.rows().min(a.cols());
    (0..n)
        .map(|i| a.get(i, i).copied().unwrap_or_else(N::zero))
        .collect()
}

/// Dense copy of a (small) sparse matrix, row-major.
pub fn to_dense<N>(a: &CsMat<N>) -> Vec<Vec<N>>
where
    N: Copy + Zero + AddAssign,
{
    let mut m = vec![vec![N::zero(); a.cols()]; a.rows()];
    for (&v, (i, j)) in a.iter() {
        m[i][j] += v;
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CsMat<f64> {
        // | 4 -1  0 |
        // |-1  4 -2 |
        // | 0 -2  5 |
        csc_from_triplets(
            (3, 3),
            &[
                (0, 0, 4.0),
                (0, 1, -1.0),
                (1, 0, -1.0),
                (1, 1, 3.0),
                (1, 1, 1.0),
                (1, 2, -2.0),
                (2, 1, -2.0),
                (2, 2, 5.0),
            ],
        )
    }

    #[test]
    fn duplicates_are_summed() {
        let a = sample();
        assert_eq!(a.get(1, 1), Some(&4.0));
        assert_eq!(diagonal(&a), vec![4.0, 4.0, 5.0]);
    }

    #[test]
    fn products() {
        let a = sample();
        let x = [1.0, 2.0, 3.0];
        assert_eq!(spmv(&a, &x), vec![2.0, 1.0, 11.0]);
        assert_eq!(spmv_t(&a, &x), vec![2.0, 1.0, 11.0]);
    }

    #[test]
    fn select_reorders() {
        let a = sample();
        let s = select(&a, &[2, 0], &[1, 2]);
        let d = to_dense(&s);
        assert_eq!(d, vec![vec![-2.0, 5.0], vec![-1.0, 0.0]]);
    }
}
