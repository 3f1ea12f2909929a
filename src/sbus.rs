use crate::sparse::{csc_from_triplets, spmv};
use num_complex::Complex64;
use sprs::CsMat;

/// Voltage dependent bus power injections (generation minus load).
pub trait SBus {
    /// Effective injections at the voltage magnitudes `v_m`.
    fn s_bus(&self, v_m: &[f64]) -> Vec<Complex64>;

    /// Diagonal of the derivative of the injections with respect to
    /// voltage magnitude.
    fn d_sbus_d_vm(&self, v_m: &[f64]) -> Vec<Complex64>;
}

/// Computes the calculated bus power injections `V .* conj(Ybus * V)`.
pub fn calc_power(y_bus: &CsMat<Complex64>, v: &[Complex64]) -> Vec<Complex64> {
    let i_bus = spmv(y_bus, v);
    v.iter().zip(&i_bus).map(|(v, i)| v * i.conj()).collect()
}

/// Evaluates the power flow mismatch function.
///
/// Returns `F = [Re(mis[pvpq]); Im(mis[pq])]` together with the calculated
/// power, where `mis = V .* conj(Ybus * V) - Sbus(|V|)`.
pub fn mismatch(
    y_bus: &CsMat<Complex64>,
    v: &[Complex64],
    s_spec: &[Complex64],
    pvpq: &[usize],
    pq: &[usize],
) -> (Vec<f64>, Vec<Complex64>) {
    let s_calc = calc_power(y_bus, v);
    let mut f = Vec::with_capacity(pvpq.len() + pq.len());
    f.extend(pvpq.iter().map(|&i| (s_calc[i] - s_spec[i]).re));
    f.extend(pq.iter().map(|&i| (s_calc[i] - s_spec[i]).im));
    (f, s_calc)
}

/// Computes partial derivatives of power injection w.r.t. voltage in polar
/// coordinates.
///
/// Returns `(dSbus/dVa, dSbus/dVm)` where
///
/// ```text
///  dSbus/dVa = 1j * diagV * conj(diagIbus - Ybus * diagV)
///  dSbus/dVm = diagV * conj(Ybus * diagVnorm) + conj(diagIbus) * diagVnorm
/// ```
///
/// Both matrices share the sparsity of `Ybus` (plus its diagonal).
pub fn d_sbus_d_v(
    y_bus: &CsMat<Complex64>,
    v: &[Complex64],
) -> (CsMat<Complex64>, CsMat<Complex64>) {
    let n = v.len();
    let i_bus = spmv(y_bus, v);
    let v_norm: Vec<Complex64> = v
        .iter()
        .map(|v| {
            let m = v.norm();
            if m == 0.0 {
                Complex64::new(1.0, 0.0)
            } else {
                v / m
            }
        })
        .collect();

    let nnz = y_bus.nnz() + n;
    let mut d_va = Vec::with_capacity(nnz);
    let mut d_vm = Vec::with_capacity(nnz);

    for (&y, (i, k)) in y_bus.iter() {
        d_va.push((i, k, -Complex64::i() * v[i] * (y * v[k]).conj()));
        d_vm.push((i, k, v[i] * (y * v_norm[k]).conj()));
    }
    for i in 0..n {
        d_va.push((i, i, Complex64::i() * v[i] * i_bus[i].conj()));
        d_vm.push((i, i, i_bus[i].conj() * v_norm[i]));
    }

    (
        csc_from_triplets((n, n), &d_va),
        csc_from_triplets((n, n), &d_vm),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BusMode, NumericCircuit};
    use crate::cmplx;
    use crate::math::polar;
    use crate::sparse::to_dense;
    use crate::ybus::make_ybus;
    use approx::assert_abs_diff_eq;

    fn ybus() -> CsMat<Complex64> {
        let mut nc = NumericCircuit {
            sbase: 100.0,
            ..Default::default()
        };
        nc.push_bus(BusMode::Slack, 1.0, cmplx!());
        nc.push_bus(BusMode::PQ, 1.0, cmplx!());
        nc.push_bus(BusMode::PQ, 1.0, cmplx!());
        nc.branch.push_line(0, 1, 0.02, 0.1, 0.04, 1.0);
        nc.branch.push_line(1, 2, 0.01, 0.05, 0.02, 1.0);
        nc.branch.push_line(0, 2, 0.03, 0.2, 0.0, 1.0);
        make_ybus(&nc).ybus
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let y = ybus();
        let vm = [1.02, 0.97, 0.99];
        let va = [0.0, -0.05, -0.03];
        let v = polar(&vm, &va);
        let (d_va, d_vm) = d_sbus_d_v(&y, &v);
        let (d_va, d_vm) = (to_dense(&d_va), to_dense(&d_vm));
        let s0 = calc_power(&y, &v);

        let h = 1e-7;
        for k in 0..3 {
            let mut va_h = va;
            va_h[k] += h;
            let s = calc_power(&y, &polar(&vm, &va_h));
            let mut vm_h = vm;
            vm_h[k] += h;
            let t = calc_power(&y, &polar(&vm_h, &va));
            for i in 0..3 {
                let fd_a = (s[i] - s0[i]) / h;
                let fd_m = (t[i] - s0[i]) / h;
                assert_abs_diff_eq!(d_va[i][k].re, fd_a.re, epsilon = 1e-5);
                assert_abs_diff_eq!(d_va[i][k].im, fd_a.im, epsilon = 1e-5);
                assert_abs_diff_eq!(d_vm[i][k].re, fd_m.re, epsilon = 1e-5);
                assert_abs_diff_eq!(d_vm[i][k].im, fd_m.im, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn mismatch_layout() {
        let y = ybus();
        let v = vec![cmplx!(1.0); 3];
        let s_spec = vec![cmplx!(), cmplx!(-0.5, -0.2), cmplx!(0.3, 0.1)];
        let (f, s_calc) = mismatch(&y, &v, &s_spec, &[2, 1], &[1]);
        assert_eq!(f.len(), 3);
        assert_abs_diff_eq!(f[0], (s_calc[2] - s_spec[2]).re, epsilon = 1e-15);
        assert_abs_diff_eq!(f[2], (s_calc[1] - s_spec[1]).im, epsilon = 1e-15);
    }
}
