use crate::error::{PowerFlowError, Result};
use crate::math::{norm_inf, polar, va, vm};
use crate::mpopt::{Alg, PowerFlowOptions};
use crate::results::NumericPowerFlowResults;
use crate::sbus::{mismatch, SBus};
use crate::sparse::select;
use crate::traits::{LinearSolver, ProgressMonitor};
use num_complex::Complex64;
use sprs::CsMat;
use std::time::Instant;

/// Mismatch scaled by the voltage magnitude, split into the P equations of
/// `pvpq` and the Q equations of `pq`.
fn scaled_mismatch(
    y_bus: &CsMat<Complex64>,
    s_bus: &dyn SBus,
    v: &[Complex64],
    pvpq: &[usize],
    pq: &[usize],
) -> (Vec<f64>, Vec<f64>, f64, Vec<Complex64>) {
    let v_m = vm(v);
    let s = s_bus.s_bus(&v_m);
    let (f, s_calc) = mismatch(y_bus, v, &s, pvpq, pq);
    let p = pvpq
        .iter()
        .map(|&i| (s_calc[i] - s[i]).re / v_m[i])
        .collect();
    let q = pq.iter().map(|&i| (s_calc[i] - s[i]).im / v_m[i]).collect();
    (p, q, norm_inf(&f), s_calc)
}

/// Solves the power flow using a fast decoupled method.
///
/// `b_p` and `b_pp` are the full B prime and B double prime matrices from
/// [`make_b_fd`](crate::ybus::make_b_fd). Their reduced forms are factorized
/// once and each iteration performs one angle and one magnitude half step.
pub fn fd_pf(
    y_bus: &CsMat<Complex64>,
    s_bus: &dyn SBus,
    v0: &[Complex64],
    pv: &[usize],
    pq: &[usize],
    b_p: &CsMat<f64>,
    b_pp: &CsMat<f64>,
    alg: Alg,
    lin_solver: &dyn LinearSolver,
    opt: &PowerFlowOptions,
    progress: Option<&dyn ProgressMonitor>,
) -> Result<NumericPowerFlowResults> {
    if alg != Alg::FDXB && alg != Alg::FDBX {
        return Err(PowerFlowError::InvalidOption(format!(
            "{} is not a fast decoupled method",
            alg
        )));
    }
    let start = Instant::now();
    let pvpq = [pv, pq].concat();

    let tol = opt.tolerance;
    let max_it = opt.max_iter_for(alg);

    let mut v = v0.to_vec();
    let mut v_a = va(&v);
    let mut v_m = vm(&v);

    let (mut p, mut q, mut norm_f, mut s_calc) = scaled_mismatch(y_bus, s_bus, &v, &pvpq, pq);
    if let Some(pm) = progress {
        pm.update(0, norm_f);
    }
    let mut converged = norm_f < tol;

    // reduce B matrices and factor them once
    let lu_p = lin_solver.factorize(&select(b_p, &pvpq, &pvpq))?;
    let lu_pp = lin_solver.factorize(&select(b_pp, pq, pq))?;

    let mut i = 0;
    while !converged && i < max_it {
        i += 1;

        // P iteration, update Va
        let dva = lu_p.solve(&p)?;
        pvpq.iter().zip(&dva).for_each(|(&b, d)| v_a[b] -= d);
        v = polar(&v_m, &v_a);

        (p, q, norm_f, s_calc) = scaled_mismatch(y_bus, s_bus, &v, &pvpq, pq);
        if norm_f < tol {
            converged = true;
            if let Some(pm) = progress {
                pm.update(i, norm_f);
            }
            break;
        }

        // Q iteration, update Vm
        let dvm = lu_pp.solve(&q)?;
        pq.iter().zip(&dvm).for_each(|(&b, d)| v_m[b] -= d);
        v = polar(&v_m, &v_a);

        (p, q, norm_f, s_calc) = scaled_mismatch(y_bus, s_bus, &v, &pvpq, pq);
        if let Some(pm) = progress {
            pm.update(i, norm_f);
        }
        if !norm_f.is_finite() {
            log::warn!("fast decoupled power flow diverged at iteration {}", i);
            break;
        }
        converged = norm_f < tol;
    }

    if converged {
        log::info!(
            "Fast decoupled power flow ({}) converged in {} iterations.",
            alg,
            i
        );
    } else {
        log::warn!(
            "Fast decoupled power flow ({}) did not converge in {} iterations.",
            alg,
            i
        );
    }

    Ok(NumericPowerFlowResults {
        v,
        converged,
        norm_f,
        scalc: s_calc,
        iterations: i,
        elapsed: start.elapsed(),
        method: alg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BusMode, NumericCircuit};
    use crate::cmplx;
    use crate::linsolve::SolverBackend;
    use crate::ybus::{make_b_fd, make_ybus};
    use crate::zip::ZipInjection;

    #[test]
    fn both_variants_converge() {
        let mut nc = NumericCircuit {
            sbase: 100.0,
            ..Default::default()
        };
        nc.push_bus(BusMode::Slack, 1.0, cmplx!());
        nc.push_bus(BusMode::PQ, 1.0, cmplx!(-0.4, -0.1));
        nc.push_bus(BusMode::PV, 1.01, cmplx!(0.2));
        nc.branch.push_line(0, 1, 0.01, 0.08, 0.02, 1.0);
        nc.branch.push_line(1, 2, 0.02, 0.1, 0.02, 1.0);
        nc.branch.push_line(0, 2, 0.01, 0.06, 0.0, 1.0);

        let y = make_ybus(&nc);
        let sbus = ZipInjection::from_circuit(&nc);
        let opt = PowerFlowOptions {
            tolerance: 1e-8,
            ..Default::default()
        };
        let solver = SolverBackend::SparseLu.build();
        for alg in [Alg::FDXB, Alg::FDBX] {
            let (bp, bpp) = make_b_fd(&nc, alg);
            let res = fd_pf(
                &y.ybus,
                &sbus,
                &nc.bus.v0,
                &[2],
                &[1],
                &bp,
                &bpp,
                alg,
                solver.as_ref(),
                &opt,
                None,
            )
            .unwrap();
            assert!(res.converged, "{} did not converge", alg);
            assert_eq!(res.method, alg);
        }
    }

    #[test]
    fn rejects_other_methods() {
        let nc = NumericCircuit::default();
        let y = make_ybus(&nc);
        let sbus = ZipInjection::default();
        let (bp, bpp) = make_b_fd(&nc, Alg::FDXB);
        let solver = SolverBackend::SparseLu.build();
        let res = fd_pf(
            &y.ybus,
            &sbus,
            &[],
            &[],
            &[],
            &bp,
            &bpp,
            Alg::NR,
            solver.as_ref(),
            &PowerFlowOptions::default(),
            None,
        );
        assert!(matches!(res, Err(PowerFlowError::InvalidOption(_))));
    }
}
