use crate::sbus::d_sbus_d_v;
use crate::sparse::{csc_from_triplets, position_map};
use num_complex::Complex64;
use sprs::CsMat;

/// Forms the power flow Jacobian in polar coordinates.
///
/// The unknowns are ordered `[Va[pvpq]; Vm[pq]]` and the equations
/// `[P[pvpq]; Q[pq]]`, so that
///
/// ```text
///  J = | dP/dVa[pvpq,pvpq]  dP/dVm[pvpq,pq] |
///      | dQ/dVa[pq,pvpq]    dQ/dVm[pq,pq]   |
/// ```
///
/// `d_sd_d_vm` is the diagonal derivative of the specified (voltage
/// dependent) injections, which is subtracted from dSbus/dVm.
pub fn make_jac(
    y_bus: &CsMat<Complex64>,
    v: &[Complex64],
    pvpq: &[usize],
    pq: &[usize],
    d_sd_d_vm: &[Complex64],
) -> CsMat<f64> {
    let n = v.len();
    let (d_va, d_vm) = d_sbus_d_v(y_bus, v);

    let npvpq = pvpq.len();
    let dim = npvpq + pq.len();
    let map_pvpq = position_map(n, pvpq);
    let map_pq = position_map(n, pq);

    let mut entries = Vec::with_capacity(2 * (d_va.nnz() + d_vm.nnz()));
    let mut push = |i: usize, col: usize, z: Complex64| {
        if let Some(r) = map_pvpq[i] {
            entries.push((r, col, z.re));
        }
        if let Some(r) = map_pq[i] {
            entries.push((npvpq + r, col, z.im));
        }
    };

    for (&z, (i, k)) in d_va.iter() {
        if let Some(c) = map_pvpq[k] {
            push(i, c, z);
        }
    }
    for (&z, (i, k)) in d_vm.iter() {
        if let Some(c) = map_pq[k] {
            push(i, npvpq + c, z);
        }
    }
    for &k in pq {
        if let Some(c) = map_pq[k] {
            push(k, npvpq + c, -d_sd_d_vm[k]);
        }
    }

    let jac = csc_from_triplets((dim, dim), &entries);
    log::trace!("J: {}x{}, nnz={}", dim, dim, jac.nnz());
    jac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmplx;
    use crate::math::polar;
    use crate::sbus::mismatch;
    use crate::sparse::{csc_from_triplets, to_dense};

    #[test]
    fn jacobian_matches_finite_differences() {
        // 0 slack, 1 pv, 2 pq
        let ys = cmplx!(1.0, -8.0);
        let y_bus = csc_from_triplets(
            (3, 3),
            &[
                (0, 0, 2.0 * ys),
                (0, 1, -ys),
                (0, 2, -ys),
                (1, 0, -ys),
                (1, 1, 2.0 * ys),
                (1, 2, -ys),
                (2, 0, -ys),
                (2, 1, -ys),
                (2, 2, 2.0 * ys),
            ],
        );
        let pvpq = [1, 2];
        let pq = [2];
        let s = vec![cmplx!(), cmplx!(0.3), cmplx!(-0.5, -0.2)];

        let mut vm = vec![1.0, 1.01, 0.97];
        let mut va = vec![0.0, 0.02, -0.04];
        let jac = to_dense(&make_jac(&y_bus, &polar(&vm, &va), &pvpq, &pq, &[cmplx!(); 3]));

        let (f0, _) = mismatch(&y_bus, &polar(&vm, &va), &s, &pvpq, &pq);
        let h = 1e-7;
        // columns: Va[1], Va[2], Vm[2]
        let mut cols = Vec::new();
        for k in [1, 2] {
            va[k] += h;
            cols.push(mismatch(&y_bus, &polar(&vm, &va), &s, &pvpq, &pq).0);
            va[k] -= h;
        }
        vm[2] += h;
        cols.push(mismatch(&y_bus, &polar(&vm, &va), &s, &pvpq, &pq).0);

        for (c, f) in cols.iter().enumerate() {
            for r in 0..3 {
                let fd = (f[r] - f0[r]) / h;
                assert!(
                    (jac[r][c] - fd).abs() < 1e-5,
                    "J[{},{}] = {} but finite difference gives {}",
                    r,
                    c,
                    jac[r][c],
                    fd
                );
            }
        }
    }
}
