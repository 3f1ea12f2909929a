use crate::error::{PowerFlowError, Result};
use crate::jac::make_jac;
use crate::math::{norm_inf, polar, va, vm};
use crate::mpopt::{Alg, PowerFlowOptions};
use crate::results::NumericPowerFlowResults;
use crate::sbus::{mismatch, SBus};
use crate::traits::{LinearSolver, ProgressMonitor};
use num_complex::Complex64;
use sprs::CsMat;
use std::time::Instant;

/// Number of step length reductions tried before giving up on an iteration.
const MAX_BACKTRACKS: usize = 10;

/// Solves power flow using full Newton's method (power/polar).
///
/// Solves for bus voltages given the full system admittance matrix (for
/// all buses), the (voltage dependent) complex bus power injections, the
/// initial vector of complex bus voltages, and the lists of PV and PQ bus
/// indices. Slack bus voltages are never updated.
///
/// Each step `x <- x - mu*dx` is shortened by `backtracking_parameter`
/// while the mismatch norm does not decrease. When no step length
/// improves the mismatch the iteration stops unconverged.
///
/// A singular Jacobian ends the iteration without convergence. Other
/// linear solver failures are returned as errors.
pub fn newton_pf(
    y_bus: &CsMat<Complex64>,
    s_bus: &dyn SBus,
    v0: &[Complex64],
    pv: &[usize],
    pq: &[usize],
    lin_solver: &dyn LinearSolver,
    opt: &PowerFlowOptions,
    progress: Option<&dyn ProgressMonitor>,
) -> Result<NumericPowerFlowResults> {
    let start = Instant::now();
    let pvpq = [pv, pq].concat();
    let npvpq = pvpq.len();

    let tol = opt.tolerance;
    let max_it = opt.max_iter_for(Alg::NR);

    let mut v = v0.to_vec();
    let mut v_m = vm(&v);
    let mut v_a = va(&v);

    // evaluate F(x0)
    let (mut f, mut s_calc) = mismatch(y_bus, &v, &s_bus.s_bus(&v_m), &pvpq, pq);
    let mut norm_f = norm_inf(&f);
    if let Some(pm) = progress {
        pm.update(0, norm_f);
    }
    let mut converged = norm_f < tol;
    let mut i = 0;

    while !converged && i < max_it {
        i += 1;

        let jac = make_jac(y_bus, &v, &pvpq, pq, &s_bus.d_sbus_d_vm(&v_m));
        let dx = match lin_solver.solve(&jac, &f) {
            Ok(dx) => dx,
            Err(PowerFlowError::Singular(msg)) => {
                log::warn!("Newton's method: singular Jacobian at iteration {} ({})", i, msg);
                break;
            }
            Err(err) => return Err(err),
        };

        let mut mu = opt.mu;
        let mut accepted = false;
        for _ in 0..=MAX_BACKTRACKS {
            let mut va_new = v_a.clone();
            let mut vm_new = v_m.clone();
            pvpq.iter()
                .zip(&dx[..npvpq])
                .for_each(|(&b, d)| va_new[b] -= mu * d);
            pq.iter()
                .zip(&dx[npvpq..])
                .for_each(|(&b, d)| vm_new[b] -= mu * d);

            // update Vm and Va again in case we wrapped around with a negative Vm
            let v_new = polar(&vm_new, &va_new);
            let vm_new = vm(&v_new);

            let (f_new, s_new) = mismatch(y_bus, &v_new, &s_bus.s_bus(&vm_new), &pvpq, pq);
            let norm_new = norm_inf(&f_new);
            if norm_new < norm_f {
                v_a = va(&v_new);
                v_m = vm_new;
                v = v_new;
                f = f_new;
                s_calc = s_new;
                norm_f = norm_new;
                accepted = true;
                break;
            }
            mu *= opt.backtracking_parameter;
            log::trace!("Newton's method: backtracking, mu = {:e}", mu);
        }

        if !accepted {
            log::warn!(
                "Newton's method: backtracking failed to reduce the mismatch at iteration {}",
                i
            );
            break;
        }

        if let Some(pm) = progress {
            pm.update(i, norm_f);
        }
        converged = norm_f < tol;
    }

    if converged {
        log::info!(
            "Newton's method power flow (power balance, polar) converged in {} iterations.",
            i
        );
    } else {
        log::warn!(
            "Newton's method power flow (power balance, polar) did not converge in {} iterations.",
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
        method: Alg::NR,
    })
}
