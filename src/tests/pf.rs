use crate::bus_types::BusState;
use crate::circuit::BusMode;
use crate::math::vm;
use crate::mpopt::{Alg, PowerFlowOptions, PowerFlowOptionsBuilder, QControl, TapControl};
use crate::pf::{power_balance_error, run_pf};
use crate::tests::cases::{stagg5, tap_feeder};
use crate::ybus::make_ybus;
use anyhow::{format_err, Result};
use approx::assert_abs_diff_eq;
use num_complex::Complex64;

fn nr(tol: f64) -> PowerFlowOptions {
    PowerFlowOptionsBuilder::default()
        .tolerance(tol)
        .build()
        .unwrap()
}

#[test]
fn stagg5_newton() -> Result<()> {
    let nc = stagg5()?;
    let res = run_pf(&nc, &nr(1e-8))?;
    if !res.converged {
        return Err(format_err!("did not converge: {:?}", res.reports));
    }
    assert_eq!(res.reports.len(), 1);
    assert_eq!(res.reports[0].method, Alg::NR);
    assert!(res.reports[0].iterations <= 6);

    // controlled magnitudes held, loads see a voltage drop
    assert_abs_diff_eq!(res.voltage[0].norm(), 1.06, epsilon = 1e-12);
    assert_abs_diff_eq!(res.voltage[1].norm(), 1.0, epsilon = 1e-9);
    assert_eq!(res.voltage[0].arg(), 0.0);
    for v in &res.voltage[1..] {
        assert!(v.norm() > 0.9 && v.norm() < 1.06);
        assert!(v.arg() < 0.0);
    }

    let ys = make_ybus(&nc);
    assert!(power_balance_error(&nc, &ys, &res.voltage) < 1e-8);

    // bus injections balance branch losses
    let total: Complex64 = res.sbus.iter().sum();
    let losses = res.total_losses();
    assert_abs_diff_eq!(total.re, losses.re, epsilon = 1e-4);
    assert_abs_diff_eq!(total.im, losses.im, epsilon = 1e-4);
    assert!(losses.re > 0.0);
    Ok(())
}

#[test]
fn gauss_seidel_agrees_with_newton() -> Result<()> {
    let nc = stagg5()?;
    let v_nr = run_pf(&nc, &nr(1e-9))?.voltage;

    let opt = PowerFlowOptionsBuilder::default()
        .alg(Alg::GS)
        .tolerance(1e-9)
        .retry_with_other_methods(false)
        .build()?;
    let res = run_pf(&nc, &opt)?;
    assert!(res.converged);
    assert_eq!(res.reports[0].method, Alg::GS);
    for (a, b) in res.voltage.iter().zip(&v_nr) {
        assert!((a - b).norm() < 1e-6, "GS {} vs NR {}", a, b);
    }
    Ok(())
}

#[test]
fn fast_decoupled_agrees_with_newton() -> Result<()> {
    let nc = stagg5()?;
    let v_nr = run_pf(&nc, &nr(1e-9))?.voltage;
    for alg in [Alg::FDXB, Alg::FDBX] {
        let opt = PowerFlowOptionsBuilder::default()
            .alg(alg)
            .tolerance(1e-9)
            .max_iter(100)
            .retry_with_other_methods(false)
            .build()?;
        let res = run_pf(&nc, &opt)?;
        assert!(res.converged, "{} did not converge", alg);
        for (a, b) in res.voltage.iter().zip(&v_nr) {
            assert!((a - b).norm() < 1e-6);
        }
    }
    Ok(())
}

#[test]
fn solved_case_is_a_fixed_point() -> Result<()> {
    let mut nc = stagg5()?;
    let opt = nr(1e-9);
    let first = run_pf(&nc, &opt)?;

    nc.bus.v0 = first.voltage.clone();
    let second = run_pf(&nc, &opt)?;
    assert!(second.converged);
    assert_eq!(second.reports[0].iterations, 0);
    for (a, b) in first.voltage.iter().zip(&second.voltage) {
        assert!((a - b).norm() < 1e-12);
    }
    Ok(())
}

#[test]
fn failed_method_is_retried() -> Result<()> {
    let nc = stagg5()?;
    let opt = PowerFlowOptionsBuilder::default()
        .alg(Alg::GS)
        .max_iter_gs(2)
        .build()?;
    let res = run_pf(&nc, &opt)?;
    assert!(res.converged);
    assert_eq!(res.reports.len(), 2);
    assert_eq!(res.reports[0].method, Alg::GS);
    assert!(!res.reports[0].converged);
    assert_eq!(res.reports[1].method, Alg::NR);
    assert!(res.reports[1].converged);

    // without retries the failure is reported, not raised
    let opt = PowerFlowOptions {
        retry_with_other_methods: false,
        ..opt
    };
    let res = run_pf(&nc, &opt)?;
    assert!(!res.converged);
    assert_eq!(res.reports.len(), 1);
    Ok(())
}

#[test]
fn reactive_limit_switches_pv_bus() -> Result<()> {
    let mut nc = stagg5()?;
    let free = run_pf(&nc, &nr(1e-8))?;
    let q_free = free.sbus[1].im / nc.sbase;

    // limit the PV bus below what it needs
    let qmax = q_free - 0.1;
    nc.bus.qmax[1] = qmax;
    nc.bus.qmin[1] = q_free - 1.0;

    let opt = PowerFlowOptionsBuilder::default()
        .tolerance(1e-8)
        .control_q(QControl::Direct)
        .build()?;
    let res = run_pf(&nc, &opt)?;
    assert!(res.converged);
    assert_eq!(res.bus_states[1], BusState::PqAtQmax);
    assert_abs_diff_eq!(res.sbus[1].im / nc.sbase, qmax, epsilon = 1e-6);
    assert!(res.voltage[1].norm() < 1.0);
    // the outer loop needed a second solve
    assert!(res.reports.len() >= 2);
    Ok(())
}

#[test]
fn wide_reactive_limits_change_nothing() -> Result<()> {
    let mut nc = stagg5()?;
    nc.bus.qmin[1] = -10.0;
    nc.bus.qmax[1] = 10.0;
    let free = run_pf(&nc, &nr(1e-8))?;
    let opt = PowerFlowOptionsBuilder::default()
        .tolerance(1e-8)
        .control_q(QControl::Direct)
        .build()?;
    let res = run_pf(&nc, &opt)?;
    assert_eq!(res.bus_states[1], BusState::Pv);
    assert_eq!(res.reports.len(), 1);
    for (a, b) in res.voltage.iter().zip(&free.voltage) {
        assert!((a - b).norm() < 1e-12);
    }
    Ok(())
}

#[test]
fn iterative_q_control_approaches_limit() -> Result<()> {
    // bus 2 needs about -72 MVAr to hold 1.0 p.u. but may only absorb 40
    let nc = stagg5()?;
    let opt = PowerFlowOptionsBuilder::default()
        .tolerance(1e-8)
        .control_q(QControl::Iterative)
        .build()?;
    let res = run_pf(&nc, &opt)?;
    assert!(res.converged);
    assert_eq!(res.bus_states[1], BusState::Pq);
    assert_abs_diff_eq!(res.sbus[1].im, -40.0, epsilon = 0.5);
    assert!(res.sbus[1].im > -40.0);
    assert!(res.voltage[1].norm() > 1.0);
    assert!(res.reports.len() > 2);
    Ok(())
}

#[test]
fn iterative_q_control_without_limits_keeps_regulation() -> Result<()> {
    let mut nc = stagg5()?;
    nc.bus.qmin[1] = f64::NEG_INFINITY;
    nc.bus.qmax[1] = f64::INFINITY;
    let free = run_pf(&nc, &nr(1e-8))?;

    let opt = PowerFlowOptionsBuilder::default()
        .tolerance(1e-8)
        .control_q(QControl::Iterative)
        .build()?;
    let res = run_pf(&nc, &opt)?;
    assert!(res.converged);
    assert_eq!(res.bus_states[1], BusState::Pv);
    assert_abs_diff_eq!(res.voltage[1].norm(), 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(res.sbus[1].im, free.sbus[1].im, epsilon = 1e-6);
    Ok(())
}

#[test]
fn held_generator_is_released_when_voltage_recovers() -> Result<()> {
    // generator behind a regulating transformer that aims above its set point
    let mut nc = tap_feeder();
    nc.bus.mode[1] = BusMode::PV;
    nc.bus.qmin[1] = -10.0;
    nc.bus.qmax[1] = -0.2;
    nc.branch.vset[0] = 1.05;

    let held = run_pf(&nc, &nr(1e-8))?;
    assert!(held.sbus[1].im / nc.sbase > -0.2);

    let opt = PowerFlowOptionsBuilder::default()
        .tolerance(1e-8)
        .control_q(QControl::Direct)
        .control_taps(TapControl::Direct)
        .build()?;
    let res = run_pf(&nc, &opt)?;
    assert!(res.converged);
    // clamped at Qmax first, then back on voltage control
    assert!(res.reports.len() >= 3);
    assert_eq!(res.bus_states[1], BusState::Pv);
    assert_abs_diff_eq!(res.voltage[1].norm(), 1.0, epsilon = 1e-9);
    assert!(res.sbus[1].im / nc.sbase < -0.2);
    assert_abs_diff_eq!(res.tap_module[0], 0.9, epsilon = 1e-12);
    Ok(())
}

#[test]
fn distributed_slack_shares_generation() -> Result<()> {
    let nc = stagg5()?;
    let single = run_pf(&nc, &nr(1e-8))?;

    let opt = PowerFlowOptionsBuilder::default()
        .tolerance(1e-8)
        .distributed_slack(true)
        .build()?;
    let res = run_pf(&nc, &opt)?;
    assert!(res.converged);
    // the PV generator picks up part of the slack
    assert!(res.sbus[1].re > single.sbus[1].re + 1.0);
    assert!(res.sbus[0].re < single.sbus[0].re - 1.0);
    // loads are untouched
    for k in 2..5 {
        assert_abs_diff_eq!(res.sbus[k].re, single.sbus[k].re, epsilon = 1e-9);
    }
    Ok(())
}

#[test]
fn tap_changer_regulates_load_voltage() -> Result<()> {
    let nc = tap_feeder();
    let untapped = run_pf(&nc, &nr(1e-8))?;
    assert!(untapped.voltage[1].norm() < 0.98);

    for control in [TapControl::Iterative, TapControl::Direct] {
        let opt = PowerFlowOptionsBuilder::default()
            .tolerance(1e-8)
            .control_taps(control)
            .build()?;
        let res = run_pf(&nc, &opt)?;
        assert!(res.converged);
        assert!(res.tap_module[0] < 1.0, "{:?}: tap {}", control, res.tap_module[0]);
        assert!((res.voltage[1].norm() - 1.0).abs() < 0.011);
    }
    Ok(())
}

#[test]
fn dc_power_flow_is_lossless() -> Result<()> {
    let nc = stagg5()?;
    let opt = PowerFlowOptionsBuilder::default().alg(Alg::DC).build()?;
    let res = run_pf(&nc, &opt)?;
    assert!(res.converged);
    assert_eq!(res.reports.len(), 1);
    assert_eq!(res.reports[0].method, Alg::DC);

    let total: f64 = res.sbus.iter().map(|s| s.re).sum();
    assert_abs_diff_eq!(total, 0.0, epsilon = 1e-9);
    for (sf, st) in res.sf.iter().zip(&res.st) {
        assert_abs_diff_eq!(sf.re, -st.re, epsilon = 1e-12);
    }
    for m in vm(&res.voltage) {
        assert_abs_diff_eq!(m, 1.0, epsilon = 1e-12);
    }
    Ok(())
}

#[test]
fn non_positive_tolerance_is_rejected() -> Result<()> {
    let nc = stagg5()?;
    assert!(run_pf(&nc, &nr(0.0)).is_err());
    Ok(())
}
