use crate::bus_types::BusClassification;
use crate::circuit::NumericCircuit;
use crate::error::{PowerFlowError, Result};
use crate::jac::make_jac;
use crate::linsolve::SolverBackend;
use crate::math::{norm, norm_inf, polar, va, vm};
use crate::sbus::calc_power;
use crate::sparse::{csc_from_triplets, spmv};
use crate::traits::LinearSolver;
use crate::ybus::{make_ybus, AdmittanceSystem};
use derive_builder::Builder;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Number of step length reductions tried in a corrector iteration.
const MAX_BACKTRACKS: usize = 10;

/// Continuation parametrization: the extra equation that pins the next
/// point on the curve.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum CpfParametrization {
    /// Fixed increments of the loading parameter. Fails at the nose.
    Natural,
    /// Fixed Euclidean distance from the previous point.
    ArcLength,
    /// Fixed distance along the previous tangent.
    #[default]
    PseudoArcLength,
}

/// When to stop tracing the curve.
#[derive(Debug, Default, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub enum CpfStopAt {
    /// Stop once lambda starts to decrease.
    #[default]
    Nose,
    /// Trace the lower half of the curve back to lambda = 0.
    Full,
    /// Stop when more branches are overloaded than in the base case.
    ExtraOverloads,
    /// Stop when any bus voltage magnitude falls below the limit (p.u.).
    MinVoltage(f64),
}

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(default)]
pub struct CpfOptions {
    pub parametrization: CpfParametrization,
    pub stop_at: CpfStopAt,

    /// Initial continuation step.
    pub step: f64,
    /// Adapt the step to the predictor error.
    pub adapt_step: bool,
    pub step_min: f64,
    pub step_max: f64,
    /// Predictor/corrector discrepancy aimed at by the step adaptation.
    pub error_tol: f64,

    /// Corrector tolerance on the mismatch infinity norm.
    pub tolerance: f64,
    /// Maximum corrector iterations.
    pub max_iter: usize,
    /// Maximum number of continuation steps.
    pub max_steps: usize,

    pub backend: SolverBackend,
}

impl Default for CpfOptions {
    fn default() -> Self {
        Self {
            parametrization: CpfParametrization::PseudoArcLength,
            stop_at: CpfStopAt::Nose,
            step: 0.01,
            adapt_step: true,
            step_min: 1e-4,
            step_max: 0.2,
            error_tol: 1e-3,
            tolerance: 1e-6,
            max_iter: 20,
            max_steps: 1000,
            backend: SolverBackend::SparseLu,
        }
    }
}

/// Why the continuation ended.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize)]
pub enum CpfStopReason {
    Nose,
    FullCurve,
    ExtraOverloads,
    MinVoltage,
    /// The corrector failed at the minimum step.
    CorrectorFailed,
    MaxSteps,
    Cancelled,
}

/// One accepted point of the continuation curve. Powers in MVA.
#[derive(Debug, Clone, Serialize)]
pub struct CpfPoint {
    pub lambda: f64,
    pub voltage: Vec<Complex64>,
    /// Calculated bus power injections.
    pub sbus: Vec<Complex64>,
    pub sf: Vec<Complex64>,
    pub st: Vec<Complex64>,
    pub loading: Vec<f64>,
    pub losses: Vec<Complex64>,
    /// Corrector mismatch norm.
    pub norm_f: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpfResults {
    pub points: Vec<CpfPoint>,
    pub stop_reason: CpfStopReason,
    /// Continuation steps taken, including rejected ones.
    pub steps: usize,
    /// Wall time in seconds.
    pub elapsed: f64,
}

impl CpfResults {
    /// Largest loading parameter reached.
    pub fn max_lambda(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.lambda)
            .fold(0.0, f64::max)
    }
}

/// Bus index sets and transfer direction shared by predictor and
/// corrector.
struct Continuation<'a> {
    y_bus: &'a CsMat<Complex64>,
    s_base: &'a [Complex64],
    s_xfr: Vec<Complex64>,
    pvpq: Vec<usize>,
    pq: Vec<usize>,
    lin_solver: &'a dyn LinearSolver,
}

/// A point in the reduced state space `[Va[pvpq]; Vm[pq]; lambda]`.
#[derive(Debug, Clone)]
struct State {
    v: Vec<Complex64>,
    lambda: f64,
}

struct Correction {
    state: State,
    converged: bool,
    norm_f: f64,
    s_calc: Vec<Complex64>,
}

impl<'a> Continuation<'a> {
    fn dim(&self) -> usize {
        self.pvpq.len() + self.pq.len()
    }

    fn reduced(&self, st: &State) -> Vec<f64> {
        let mut x = Vec::with_capacity(self.dim() + 1);
        x.extend(self.pvpq.iter().map(|&k| st.v[k].arg()));
        x.extend(self.pq.iter().map(|&k| st.v[k].norm()));
        x.push(st.lambda);
        x
    }

    /// Evaluates the parametrization equation.
    fn param(
        &self,
        par: CpfParametrization,
        step: f64,
        z: &[f64],
        x: &[f64],
        x_prev: &[f64],
    ) -> f64 {
        let n = self.dim();
        let (lam, lam_prev) = (x[n], x_prev[n]);
        match par {
            CpfParametrization::Natural => {
                if lam >= lam_prev {
                    lam - lam_prev - step
                } else {
                    lam_prev - lam - step
                }
            }
            CpfParametrization::ArcLength => {
                x.iter()
                    .zip(x_prev)
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    - step * step
            }
            CpfParametrization::PseudoArcLength => {
                z.iter()
                    .zip(x.iter().zip(x_prev))
                    .map(|(z, (a, b))| z * (a - b))
                    .sum::<f64>()
                    - step
            }
        }
    }

    /// Gradient of the parametrization equation, lambda last.
    fn param_jac(&self, par: CpfParametrization, z: &[f64], x: &[f64], x_prev: &[f64]) -> Vec<f64> {
        let n = self.dim();
        match par {
            CpfParametrization::Natural => {
                let mut row = vec![0.0; n + 1];
                row[n] = if x[n] >= x_prev[n] { 1.0 } else { -1.0 };
                row
            }
            CpfParametrization::ArcLength => {
                let mut row: Vec<f64> = x.iter().zip(x_prev).map(|(a, b)| 2.0 * (a - b)).collect();
                if x[n] == x_prev[n] {
                    // first step: keep the bordered matrix non-singular
                    row[n] = 1.0;
                }
                row
            }
            CpfParametrization::PseudoArcLength => z.to_vec(),
        }
    }

    /// Power flow equations with the scheduled transfer scaled by lambda.
    fn mismatch(&self, st: &State) -> (Vec<f64>, Vec<Complex64>) {
        let s_calc = calc_power(self.y_bus, &st.v);
        let mis = |k: usize| s_calc[k] - self.s_base[k] - st.lambda * self.s_xfr[k];
        let mut f = Vec::with_capacity(self.dim() + 1);
        f.extend(self.pvpq.iter().map(|&k| mis(k).re));
        f.extend(self.pq.iter().map(|&k| mis(k).im));
        (f, s_calc)
    }

    /// Power flow Jacobian bordered by the lambda column and the
    /// parametrization row:
    ///
    /// ```text
    ///  | J      dF/dlam |
    ///  | dP/dx  dP/dlam |
    /// ```
    fn bordered_jac(&self, v: &[Complex64], p_row: &[f64]) -> CsMat<f64> {
        let n = self.dim();
        let npvpq = self.pvpq.len();
        let jac = make_jac(self.y_bus, v, &self.pvpq, &self.pq, &vec![Complex64::default(); v.len()]);

        let mut entries: Vec<(usize, usize, f64)> = jac.iter().map(|(&a, (i, j))| (i, j, a)).collect();
        for (r, &k) in self.pvpq.iter().enumerate() {
            entries.push((r, n, -self.s_xfr[k].re));
        }
        for (r, &k) in self.pq.iter().enumerate() {
            entries.push((npvpq + r, n, -self.s_xfr[k].im));
        }
        for (c, &a) in p_row.iter().enumerate() {
            if a != 0.0 {
                entries.push((n, c, a));
            }
        }
        csc_from_triplets((n + 1, n + 1), &entries)
    }

    fn apply(&self, st: &State, x: &[f64]) -> State {
        let npvpq = self.pvpq.len();
        let mut v_a = va(&st.v);
        let mut v_m = vm(&st.v);
        for (&k, &a) in self.pvpq.iter().zip(x) {
            v_a[k] = a;
        }
        for (&k, &m) in self.pq.iter().zip(&x[npvpq..]) {
            v_m[k] = m;
        }
        State {
            v: polar(&v_m, &v_a),
            lambda: x[self.dim()],
        }
    }

    /// Normalized tangent predictor.
    ///
    /// Solves the bordered system for the tangent `z` with
    /// `dP/dx·z = 1`, normalizes it, and moves `step` along it. A singular
    /// bordered matrix leaves the state and tangent unchanged.
    fn predict(
        &self,
        par: CpfParametrization,
        st: &State,
        prev: &State,
        z: &[f64],
        step: f64,
    ) -> Result<(State, Vec<f64>)> {
        let n = self.dim();
        let (x, x_prev) = (self.reduced(st), self.reduced(prev));
        let j2 = self.bordered_jac(&st.v, &self.param_jac(par, z, &x, &x_prev));
        let mut rhs = vec![0.0; n + 1];
        rhs[n] = 1.0;

        let mut z_new = match self.lin_solver.solve(&j2, &rhs) {
            Ok(z) => z,
            Err(PowerFlowError::Singular(msg)) => {
                log::warn!("CPF predictor: singular bordered Jacobian ({})", msg);
                return Ok((st.clone(), z.to_vec()));
            }
            Err(err) => return Err(err),
        };
        let len = norm(&z_new);
        z_new.iter_mut().for_each(|a| *a /= len);

        let x0: Vec<f64> = x.iter().zip(&z_new).map(|(a, dz)| a + step * dz).collect();
        Ok((self.apply(st, &x0), z_new))
    }

    /// Newton corrector on the power flow equations augmented with the
    /// parametrization equation, with backtracking.
    #[allow(clippy::too_many_arguments)]
    fn correct(
        &self,
        par: CpfParametrization,
        st0: State,
        prev: &State,
        z: &[f64],
        step: f64,
        tol: f64,
        max_it: usize,
    ) -> Result<Correction> {
        let x_prev = self.reduced(prev);
        let eval = |st: &State| {
            let (mut f, s_calc) = self.mismatch(st);
            f.push(self.param(par, step, z, &self.reduced(st), &x_prev));
            (f, s_calc)
        };

        let mut st = st0;
        let (mut f, mut s_calc) = eval(&st);
        let mut norm_f = norm_inf(&f);
        let mut converged = norm_f < tol;
        let mut i = 0;

        while !converged && i < max_it {
            i += 1;
            let x = self.reduced(&st);
            let j2 = self.bordered_jac(&st.v, &self.param_jac(par, z, &x, &x_prev));
            let dx = match self.lin_solver.solve(&j2, &f) {
                Ok(dx) => dx,
                Err(PowerFlowError::Singular(msg)) => {
                    log::debug!("CPF corrector: singular Jacobian at iteration {} ({})", i, msg);
                    break;
                }
                Err(err) => return Err(err),
            };

            let mut mu = 1.0;
            let mut accepted = false;
            for _ in 0..=MAX_BACKTRACKS {
                let x_new: Vec<f64> = x.iter().zip(&dx).map(|(a, d)| a - mu * d).collect();
                let st_new = self.apply(&st, &x_new);
                let (f_new, s_new) = eval(&st_new);
                let norm_new = norm_inf(&f_new);
                if norm_new <= norm_f {
                    st = st_new;
                    f = f_new;
                    s_calc = s_new;
                    norm_f = norm_new;
                    accepted = true;
                    break;
                }
                mu *= 0.5;
            }
            if !accepted {
                break;
            }
            log::trace!("CPF corrector {:>3}  {:10.3e}", i, norm_f);
            converged = norm_f < tol;
        }

        Ok(Correction {
            state: st,
            converged,
            norm_f,
            s_calc,
        })
    }
}

/// Branch flows of a continuation point, in MVA.
fn make_point(nc: &NumericCircuit, ys: &AdmittanceSystem, corr: Correction) -> CpfPoint {
    let v = corr.state.v;
    let sbase = nc.sbase;
    let if_ = spmv(&ys.yf, &v);
    let it = spmv(&ys.yt, &v);
    let nbr = nc.nbr();
    let (mut sf, mut st) = (Vec::with_capacity(nbr), Vec::with_capacity(nbr));
    for k in 0..nbr {
        sf.push(v[nc.branch.f[k]] * if_[k].conj() * sbase);
        st.push(v[nc.branch.t[k]] * it[k].conj() * sbase);
    }
    let loading = sf
        .iter()
        .zip(&nc.branch.rate)
        .map(|(s, r)| s.re / (r * sbase + 1e-9))
        .collect();
    let losses = sf.iter().zip(&st).map(|(a, b)| a + b).collect();
    CpfPoint {
        lambda: corr.state.lambda,
        sbus: corr.s_calc.iter().map(|s| s * sbase).collect(),
        voltage: v,
        sf,
        st,
        loading,
        losses,
        norm_f: corr.norm_f,
    }
}

fn count_overloads(loading: &[f64]) -> usize {
    loading.iter().filter(|l| l.abs() > 1.0).count()
}

/// Runs an AC continuation power flow.
///
/// Traces the solutions of `S(lambda) = sbus_base + lambda * (sbus_target
/// - sbus_base)` from the solved base case `v0` (lambda = 0) using a
/// normalized tangent predictor and a Newton corrector on the equations
/// augmented with the selected parametrization. Injections are in p.u.
/// and held at constant power. Bus types are fixed for the whole run.
///
/// When the corrector fails the step is halved and the prediction retried
/// from the last accepted point, down to `step_min`. `progress` is called
/// with the step number and lambda of every accepted point, and `cancel`
/// is polled before each step.
pub fn continuation_pf(
    nc: &NumericCircuit,
    sbus_base: &[Complex64],
    sbus_target: &[Complex64],
    v0: &[Complex64],
    opt: &CpfOptions,
    progress: Option<&dyn Fn(usize, f64)>,
    cancel: &AtomicBool,
) -> Result<CpfResults> {
    let start = Instant::now();
    nc.validate()?;
    let nb = nc.nbus();
    for (what, len) in [
        ("base injections", sbus_base.len()),
        ("target injections", sbus_target.len()),
        ("initial voltages", v0.len()),
    ] {
        if len != nb {
            return Err(PowerFlowError::DimensionMismatch {
                what,
                expected: nb,
                found: len,
            });
        }
    }
    if !(opt.step_min > 0.0 && opt.step_min <= opt.step_max) || opt.step <= 0.0 {
        return Err(PowerFlowError::InvalidOption(format!(
            "invalid continuation steps: step={}, step_min={}, step_max={}",
            opt.step, opt.step_min, opt.step_max
        )));
    }
    let states = BusClassification::from_modes(&nc.bus.mode);
    if !states.has_slack() {
        return Err(PowerFlowError::NoSlack { island: 0 });
    }

    let ys = make_ybus(nc);
    let lin_solver = opt.backend.build();
    let cont = Continuation {
        y_bus: &ys.ybus,
        s_base: sbus_base,
        s_xfr: sbus_target.iter().zip(sbus_base).map(|(t, b)| t - b).collect(),
        pvpq: states.pvpq(),
        pq: states.pq(),
        lin_solver: lin_solver.as_ref(),
    };
    let n = cont.dim();

    let mut par = opt.parametrization;
    let mut adapt_step = opt.adapt_step;
    let mut step = opt.step.min(opt.step_max);
    let mut z = vec![0.0; n + 1];
    z[n] = 1.0;

    let mut cur = State {
        v: v0.to_vec(),
        lambda: 0.0,
    };
    let mut prev = cur.clone();

    let base_overloads = {
        let (_, s_calc) = cont.mismatch(&cur);
        let base = make_point(
            nc,
            &ys,
            Correction {
                state: cur.clone(),
                converged: true,
                norm_f: 0.0,
                s_calc,
            },
        );
        count_overloads(&base.loading)
    };

    log::info!(
        "continuation power flow: {} buses, {:?} parametrization, stop at {:?}",
        nb,
        par,
        opt.stop_at
    );

    let mut points = Vec::new();
    let mut steps = 0;
    let stop_reason = loop {
        if cancel.load(Ordering::Relaxed) {
            log::info!("continuation cancelled after {} steps", steps);
            break CpfStopReason::Cancelled;
        }
        if steps >= opt.max_steps {
            log::warn!("continuation stopped after {} steps", steps);
            break CpfStopReason::MaxSteps;
        }
        steps += 1;

        let (pred, z_new) = cont.predict(par, &cur, &prev, &z, step)?;
        let x_pred = cont.reduced(&pred);
        let corr = cont.correct(par, pred, &cur, &z_new, step, opt.tolerance, opt.max_iter)?;

        if !corr.converged {
            if step > opt.step_min {
                step = (step / 2.0).max(opt.step_min);
                log::debug!(
                    "step {}: corrector did not converge (normF = {:e}), retrying with step {:e}",
                    steps,
                    corr.norm_f,
                    step
                );
                continue;
            }
            log::warn!(
                "step {}: corrector did not converge at lambda = {:.6} with the minimum step",
                steps,
                cur.lambda
            );
            break CpfStopReason::CorrectorFailed;
        }

        let x_corr = cont.reduced(&corr.state);
        prev = std::mem::replace(&mut cur, corr.state.clone());
        z = z_new;
        let point = make_point(nc, &ys, corr);
        log::debug!(
            "step {}: lambda = {:.6} (prev {:.6}), step = {:e}",
            steps,
            cur.lambda,
            prev.lambda,
            step
        );

        let stop = match opt.stop_at {
            CpfStopAt::Nose => (cur.lambda < prev.lambda).then_some(CpfStopReason::Nose),
            CpfStopAt::Full => {
                if cur.lambda.abs() < 1e-8 {
                    Some(CpfStopReason::FullCurve)
                } else {
                    if cur.lambda < prev.lambda && cur.lambda - step < 0.0 {
                        // land exactly on lambda = 0
                        step = cur.lambda;
                        par = CpfParametrization::Natural;
                        adapt_step = false;
                    }
                    None
                }
            }
            CpfStopAt::ExtraOverloads => (count_overloads(&point.loading) > base_overloads)
                .then_some(CpfStopReason::ExtraOverloads),
            CpfStopAt::MinVoltage(v_min) => point
                .voltage
                .iter()
                .any(|v| v.norm() < v_min)
                .then_some(CpfStopReason::MinVoltage),
        };

        points.push(point);
        if let Some(f) = progress {
            f(steps, cur.lambda);
        }
        if let Some(reason) = stop {
            break reason;
        }

        if adapt_step {
            let mut err = norm_inf(
                &x_corr
                    .iter()
                    .zip(&x_pred)
                    .map(|(a, b)| a - b)
                    .collect::<Vec<f64>>(),
            );
            if err == 0.0 {
                err = 1e-20;
            }
            step = (step * opt.error_tol / err).clamp(opt.step_min, opt.step_max);
        }
    };

    log::info!(
        "continuation ended ({:?}) after {} steps, max lambda = {:.6}",
        stop_reason,
        steps,
        points.iter().map(|p| p.lambda).fold(0.0, f64::max)
    );

    Ok(CpfResults {
        points,
        stop_reason,
        steps,
        elapsed: start.elapsed().as_secs_f64(),
    })
}
