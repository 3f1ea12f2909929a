use crate::bus_types::BusClassification;
use crate::circuit::NumericCircuit;
use crate::controls::{
    control_q_direct, control_q_iterative, control_taps_direct, control_taps_iterative,
    distribute_slack,
};
use crate::dc::{dc_pf, make_b_dc};
use crate::debug::{format_polar_vec, format_states};
use crate::error::{PowerFlowError, Result};
use crate::fd::fd_pf;
use crate::gauss::gauss_pf;
use crate::math::{norm_inf, polar, va, vm};
use crate::mpopt::{Alg, PowerFlowOptions, QControl, TapControl};
use crate::newton::newton_pf;
use crate::results::{ConvergenceReport, NumericPowerFlowResults, PowerFlowResults};
use crate::sbus::{calc_power, SBus};
use crate::sparse::spmv;
use crate::topology::split_into_islands;
use crate::traits::{LinearSolver, LogProgress};
use crate::ybus::{make_b_fd, make_ybus, AdmittanceSystem};
use crate::zip::ZipInjection;
use num_complex::Complex64;
use std::time::Instant;

/// Runs one inner solve with the given method.
pub fn solve_inner(
    alg: Alg,
    nc: &NumericCircuit,
    ys: &AdmittanceSystem,
    s_bus: &ZipInjection,
    v0: &[Complex64],
    states: &BusClassification,
    lin_solver: &dyn LinearSolver,
    opt: &PowerFlowOptions,
) -> Result<NumericPowerFlowResults> {
    let (pv, pq) = (states.pv(), states.pq());
    let progress = LogProgress {
        method: alg.as_str(),
    };
    match alg {
        Alg::NR => newton_pf(&ys.ybus, s_bus, v0, &pv, &pq, lin_solver, opt, Some(&progress)),
        Alg::GS => gauss_pf(&ys.ybus, s_bus, v0, &pv, &pq, opt, Some(&progress)),
        Alg::FDXB | Alg::FDBX => {
            let (b_p, b_pp) = make_b_fd(nc, alg);
            fd_pf(
                &ys.ybus,
                s_bus,
                v0,
                &pv,
                &pq,
                &b_p,
                &b_pp,
                alg,
                lin_solver,
                opt,
                Some(&progress),
            )
        }
        Alg::DC => Err(PowerFlowError::InvalidOption(
            "the DC power flow has no iterative inner solve".to_string(),
        )),
    }
}

/// Solves with the selected method and, when allowed, the other AC methods.
///
/// Every attempt starts from `v0`. The attempt with the smallest mismatch
/// is kept and the first converged one ends the search. Returns the kept
/// solution and one report per attempt.
pub fn solve_with_retry(
    nc: &NumericCircuit,
    ys: &AdmittanceSystem,
    s_bus: &ZipInjection,
    v0: &[Complex64],
    states: &BusClassification,
    lin_solver: &dyn LinearSolver,
    opt: &PowerFlowOptions,
) -> Result<(NumericPowerFlowResults, Vec<ConvergenceReport>)> {
    let mut methods = vec![opt.alg];
    if opt.retry_with_other_methods {
        methods.extend(Alg::retry_order().into_iter().filter(|&a| a != opt.alg));
    }

    let mut best: Option<NumericPowerFlowResults> = None;
    let mut first_err = None;
    let mut reports = Vec::with_capacity(methods.len());
    for alg in methods {
        let res = match solve_inner(alg, nc, ys, s_bus, v0, states, lin_solver, opt) {
            Ok(res) => res,
            Err(err) => {
                log::warn!("{} failed: {}", alg, err);
                first_err.get_or_insert(err);
                continue;
            }
        };
        reports.push(res.report());
        let converged = res.converged;
        let better = match &best {
            Some(b) => res.norm_f < b.norm_f || b.norm_f.is_nan(),
            None => true,
        };
        if better {
            best = Some(res);
        }
        if converged {
            break;
        }
        log::info!("{} did not converge", alg);
    }

    match (best, first_err) {
        (Some(best), _) => Ok((best, reports)),
        (None, Some(err)) => Err(err),
        (None, None) => Err(PowerFlowError::InvalidOption(
            "no power flow method selected".to_string(),
        )),
    }
}

/// Initial voltages with controlled magnitudes set to their set points.
fn initial_voltage(nc: &NumericCircuit, states: &BusClassification) -> Vec<Complex64> {
    let pv_slack: Vec<usize> = [states.slack(), states.pv()].concat();
    let mut v0 = nc.bus.v0.clone();
    for k in pv_slack {
        let angle = v0[k].arg();
        v0[k] = Complex64::from_polar(nc.bus.vset[k], angle);
    }
    v0
}

/// Solves the AC power flow of one island, including the outer control
/// loop (reactive limits, taps and distributed slack).
pub fn run_island_pf(
    nc: &NumericCircuit,
    island: usize,
    opt: &PowerFlowOptions,
) -> Result<PowerFlowResults> {
    if opt.alg == Alg::DC {
        return run_island_dc(nc, island, opt);
    }
    let mut states = BusClassification::from_modes(&nc.bus.mode);
    if !states.has_slack() {
        return Err(PowerFlowError::NoSlack { island });
    }

    let lin_solver = opt.backend.build();
    let mut circuit = nc.clone();
    let mut ys = make_ybus(&circuit);
    let mut s_bus = ZipInjection::from_circuit(&circuit);
    let mut v = initial_voltage(&circuit, &states);
    let mut reports = Vec::new();

    let mut outer = 0;
    let res = loop {
        let (res, attempts) = solve_with_retry(
            &circuit,
            &ys,
            &s_bus,
            &v,
            &states,
            lin_solver.as_ref(),
            opt,
        )?;
        reports.extend(attempts);
        if !res.converged {
            break res;
        }

        outer += 1;
        if outer >= opt.max_outer_loop_iter {
            log::warn!(
                "island {}: controls still acting after {} outer iterations",
                island,
                outer
            );
            break res;
        }

        v = res.v.clone();
        let mut acted = false;

        match opt.control_q {
            QControl::NoControl => {}
            QControl::Direct => {
                acted |= control_q_direct(
                    &mut states,
                    &mut v,
                    &mut s_bus,
                    &res.scalc,
                    &circuit.bus,
                    opt.tolerance,
                );
            }
            QControl::Iterative => {
                acted |= control_q_iterative(
                    &mut states,
                    &mut v,
                    &mut s_bus,
                    &res.scalc,
                    &circuit.bus,
                    opt.q_steepness_factor,
                );
            }
        }

        let taps_moved = match opt.control_taps {
            TapControl::NoControl => false,
            TapControl::Direct => control_taps_direct(&mut circuit.branch, &v),
            TapControl::Iterative => control_taps_iterative(&mut circuit.branch, &v),
        };
        if taps_moved {
            ys = make_ybus(&circuit);
            acted = true;
        }

        if opt.distributed_slack {
            let s_eff = s_bus.s_bus(&vm(&v));
            let slack_p: f64 = states
                .slack()
                .iter()
                .map(|&k| (res.scalc[k] - s_eff[k]).re)
                .sum();
            if slack_p.abs() > opt.tolerance {
                if let Some(delta) =
                    distribute_slack(slack_p, &circuit.bus.installed_power, &circuit.bus.active)
                {
                    log::debug!("island {}: distributing {:.6} p.u. of slack power", island, slack_p);
                    s_bus.add_p(&delta);
                    acted = true;
                }
            }
        }

        if !acted {
            break res;
        }
        log::debug!("island {}: bus states {}", island, format_states(&states.states));
    };

    log::trace!("island {}: V = {}", island, format_polar_vec(&res.v));

    let mut results = post_process(&circuit, &ys, &res.v, &s_bus, &states);
    results.bus_states = states.states;
    results.reports = reports;
    results.converged = res.converged;
    Ok(results)
}

/// Computes bus injections and branch flows from a voltage solution.
///
/// Slack injections and PV reactive injections are replaced by their
/// calculated values. Powers are returned in MVA.
pub fn post_process(
    nc: &NumericCircuit,
    ys: &AdmittanceSystem,
    v: &[Complex64],
    s_bus: &ZipInjection,
    states: &BusClassification,
) -> PowerFlowResults {
    let sbase = nc.sbase;
    let br = &nc.branch;
    let s_calc = calc_power(&ys.ybus, v);
    let mut sbus = s_bus.s_bus(&vm(v));
    for k in states.slack() {
        sbus[k] = s_calc[k];
    }
    for k in states.pv() {
        sbus[k].im = s_calc[k].im;
    }

    let if_ = spmv(&ys.yf, v);
    let it = spmv(&ys.yt, v);
    let mut res = PowerFlowResults::new(nc.nbus(), nc.nbr());
    for k in 0..nc.nbr() {
        let (vf, vt) = (v[br.f[k]], v[br.t[k]]);
        let sf = vf * if_[k].conj();
        let st = vt * it[k].conj();
        res.sf[k] = sf * sbase;
        res.st[k] = st * sbase;
        res.losses[k] = (sf + st) * sbase;
        res.vbranch[k] = vf - vt;
        res.loading[k] = sf.re / (br.rate[k] + 1e-9);
    }
    res.if_ = if_;
    res.it = it;
    res.voltage = v.to_vec();
    res.sbus = sbus.iter().map(|s| s * sbase).collect();
    res.bus_states = states.states.clone();
    res.tap_module = br.tap_module.clone();
    res
}

/// Linearized power flow of one island.
fn run_island_dc(nc: &NumericCircuit, island: usize, opt: &PowerFlowOptions) -> Result<PowerFlowResults> {
    let start = Instant::now();
    let states = BusClassification::from_modes(&nc.bus.mode);
    if !states.has_slack() {
        return Err(PowerFlowError::NoSlack { island });
    }
    let ref_ = states.slack();
    let pvpq = states.pvpq();
    let lin_solver = opt.backend.build();

    let dc = make_b_dc(nc);
    let s0 = ZipInjection::from_circuit(nc).s_bus(&vec![1.0; nc.nbus()]);
    let p_bus: Vec<f64> = s0
        .iter()
        .zip(&dc.pbusinj)
        .map(|(s, inj)| s.re - inj)
        .collect();
    let va0 = va(&nc.bus.v0);
    let (theta, success) = dc_pf(&dc.bbus, &p_bus, &va0, &ref_, &pvpq, lin_solver.as_ref())?;

    let p_calc = spmv(&dc.bbus, &theta);
    let mis: Vec<f64> = pvpq.iter().map(|&k| p_calc[k] - p_bus[k]).collect();
    let norm_f = norm_inf(&mis);
    let v = polar(&vec![1.0; nc.nbus()], &theta);

    let sbase = nc.sbase;
    let pf = dc.branch_flows(&theta);
    let mut res = PowerFlowResults::new(nc.nbus(), nc.nbr());
    for k in 0..nc.nbr() {
        let (vf, vt) = (v[nc.branch.f[k]], v[nc.branch.t[k]]);
        res.sf[k] = Complex64::new(pf[k] * sbase, 0.0);
        res.st[k] = -res.sf[k];
        res.vbranch[k] = vf - vt;
        res.if_[k] = pf[k] / (vf + 1e-20);
        res.it[k] = -res.if_[k];
        res.loading[k] = pf[k] / (nc.branch.rate[k] + 1e-9);
    }
    let mut sbus: Vec<Complex64> = s0.iter().map(|s| Complex64::new(s.re, 0.0)).collect();
    for &k in &ref_ {
        sbus[k] = Complex64::new(p_calc[k] + dc.pbusinj[k], 0.0);
    }
    res.sbus = sbus.iter().map(|s| s * sbase).collect();
    res.voltage = v;
    res.bus_states = states.states;
    res.tap_module = nc.branch.tap_module.clone();
    res.converged = success;
    res.reports = vec![ConvergenceReport {
        method: Alg::DC,
        converged: success,
        error: norm_f,
        iterations: 1,
        elapsed: start.elapsed().as_secs_f64(),
    }];
    Ok(res)
}

/// Runs a power flow on every island of the circuit and assembles the
/// whole-grid results.
///
/// Input contract violations are returned as errors. Islands that cannot
/// be solved (no slack bus, singular system) are recorded in
/// `island_errors` and left at zero voltage; the other islands are still
/// solved.
pub fn run_pf(nc: &NumericCircuit, opt: &PowerFlowOptions) -> Result<PowerFlowResults> {
    if opt.tolerance <= 0.0 {
        return Err(PowerFlowError::InvalidOption(format!(
            "tolerance must be positive, got {}",
            opt.tolerance
        )));
    }
    let start = Instant::now();
    let islands = split_into_islands(nc)?;
    log::info!(
        "{} power flow: {} buses, {} branches, {} island(s)",
        opt.alg,
        nc.nbus(),
        nc.nbr(),
        islands.len()
    );

    let mut results = PowerFlowResults::new(nc.nbus(), nc.nbr());
    results.tap_module = nc.branch.tap_module.clone();
    for island in &islands {
        match run_island_pf(&island.circuit, island.index, opt) {
            Ok(res) => {
                results.apply_from_island(&res, &island.original_bus_idx, &island.original_branch_idx)
            }
            Err(err) => {
                log::warn!("island {} skipped: {}", island.index, err);
                results.island_errors.push((island.index, err));
                results.converged = false;
            }
        }
    }

    log::info!(
        "power flow {} in {:.3} s",
        if results.converged {
            "converged"
        } else {
            "did not converge"
        },
        start.elapsed().as_secs_f64()
    );
    Ok(results)
}

/// Active power balance of a solution: `max |P_calc - P_spec|` over the
/// non-slack buses, in p.u.
pub fn power_balance_error(nc: &NumericCircuit, ys: &AdmittanceSystem, v: &[Complex64]) -> f64 {
    let states = BusClassification::from_modes(&nc.bus.mode);
    let s = ZipInjection::from_circuit(nc).s_bus(&vm(v));
    let s_calc = calc_power(&ys.ybus, v);
    let p: Vec<f64> = states
        .pvpq()
        .iter()
        .map(|&k| (s_calc[k] - s[k]).re)
        .collect();
    let q: Vec<f64> = states
        .pq()
        .iter()
        .map(|&k| (s_calc[k] - s[k]).im)
        .collect();
    norm_inf(&p).max(norm_inf(&q))
}
