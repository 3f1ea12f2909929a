use crate::error::{PowerFlowError, Result};
use crate::math::{norm_inf, vm};
use crate::mpopt::{Alg, PowerFlowOptions};
use crate::results::NumericPowerFlowResults;
use crate::sbus::{mismatch, SBus};
use crate::traits::ProgressMonitor;
use num_complex::Complex64;
use sprs::CsMat;
use std::time::Instant;

/// `(Ybus[k,:]·V, Ybus[k,k])` for one row of a CSR matrix.
fn row_product(y_csr: &CsMat<Complex64>, k: usize, v: &[Complex64]) -> (Complex64, Complex64) {
    let mut sum = Complex64::default();
    let mut diag = Complex64::default();
    if let Some(row) = y_csr.outer_view(k) {
        for (j, &y) in row.iter() {
            sum += y * v[j];
            if j == k {
                diag += y;
            }
        }
    }
    (sum, diag)
}

/// Solves the power flow using a Gauss-Seidel method.
///
/// Each sweep updates the PQ bus voltages in place with
///
/// ```text
///  V[k] += (conj(S[k] / V[k]) - Ybus[k,:]·V) / Ybus[k,k]
/// ```
///
/// and then the PV buses, whose reactive injection is first replaced by
/// the calculated value and whose magnitude is scaled back to the initial
/// (set point) magnitude after the update.
pub fn gauss_pf(
    y_bus: &CsMat<Complex64>,
    s_bus: &dyn SBus,
    v0: &[Complex64],
    pv: &[usize],
    pq: &[usize],
    opt: &PowerFlowOptions,
    progress: Option<&dyn ProgressMonitor>,
) -> Result<NumericPowerFlowResults> {
    let start = Instant::now();
    let pvpq = [pv, pq].concat();

    let tol = opt.tolerance;
    let max_it = opt.max_iter_for(Alg::GS);

    let y_csr = y_bus.to_csr();
    for &k in &pvpq {
        if row_product(&y_csr, k, v0).1 == Complex64::default() {
            return Err(PowerFlowError::Singular(format!(
                "zero diagonal admittance at bus {}",
                k
            )));
        }
    }

    let mut v = v0.to_vec();
    let vm_set = vm(v0);

    let (f, mut s_calc) = mismatch(y_bus, &v, &s_bus.s_bus(&vm(&v)), &pvpq, pq);
    let mut norm_f = norm_inf(&f);
    if let Some(pm) = progress {
        pm.update(0, norm_f);
    }
    let mut converged = norm_f < tol;
    let mut i = 0;

    while !converged && i < max_it {
        i += 1;

        let mut s = s_bus.s_bus(&vm(&v));

        for &k in pq {
            let (yv, ykk) = row_product(&y_csr, k, &v);
            let vk = v[k];
            v[k] = vk + ((s[k] / vk).conj() - yv) / ykk;
        }

        for &k in pv {
            let (yv, ykk) = row_product(&y_csr, k, &v);
            let vk = v[k];
            s[k].im = (vk * yv.conj()).im;
            let vk = vk + ((s[k] / vk).conj() - yv) / ykk;
            v[k] = vk * (vm_set[k] / vk.norm());
        }

        let (f, sc) = mismatch(y_bus, &v, &s_bus.s_bus(&vm(&v)), &pvpq, pq);
        s_calc = sc;
        norm_f = norm_inf(&f);
        if let Some(pm) = progress {
            pm.update(i, norm_f);
        }
        if !norm_f.is_finite() {
            log::warn!("Gauss-Seidel power flow diverged at iteration {}", i);
            break;
        }
        converged = norm_f < tol;
    }

    if converged {
        log::info!("Gauss-Seidel power flow converged in {} iterations.", i);
    } else {
        log::warn!("Gauss-Seidel power flow did not converge in {} iterations.", i);
    }

    Ok(NumericPowerFlowResults {
        v,
        converged,
        norm_f,
        scalc: s_calc,
        iterations: i,
        elapsed: start.elapsed(),
        method: Alg::GS,
    })
}
