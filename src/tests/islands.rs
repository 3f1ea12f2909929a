use crate::circuit::{BusMode, NumericCircuit};
use crate::cmplx;
use crate::error::PowerFlowError;
use crate::mpopt::PowerFlowOptions;
use crate::pf::run_pf;
use crate::tests::cases::{append, stagg5};
use crate::topology::split_into_islands;
use anyhow::Result;
use approx::assert_abs_diff_eq;

fn two_bus(slack: bool) -> NumericCircuit {
    let mut nc = NumericCircuit {
        sbase: 100.0,
        ..Default::default()
    };
    let mode = if slack { BusMode::Slack } else { BusMode::PV };
    nc.push_bus(mode, 1.0, cmplx!(0.1));
    nc.push_bus(BusMode::PQ, 1.0, cmplx!(-0.1, -0.05));
    nc.branch.push_line(0, 1, 0.01, 0.05, 0.0, 1.0);
    nc
}

#[test]
fn island_without_slack_is_reported() -> Result<()> {
    let mut nc = stagg5()?;
    append(&mut nc, &two_bus(false));
    append(&mut nc, &two_bus(true));
    assert_eq!(split_into_islands(&nc)?.len(), 3);

    let res = run_pf(&nc, &PowerFlowOptions::default())?;
    assert!(!res.converged);
    assert_eq!(res.island_errors, vec![(1, PowerFlowError::NoSlack { island: 1 })]);

    // the other islands are solved
    let alone = run_pf(&stagg5()?, &PowerFlowOptions::default())?;
    for k in 0..5 {
        assert!((res.voltage[k] - alone.voltage[k]).norm() < 1e-12);
    }
    assert_eq!(res.voltage[5], cmplx!());
    assert_eq!(res.voltage[6], cmplx!());
    assert_eq!(res.sf[7], cmplx!());
    assert_abs_diff_eq!(res.voltage[7].norm(), 1.0, epsilon = 1e-12);
    assert!(res.voltage[8].norm() < 1.0);
    assert!(res.sf[8].re > 0.0);

    // one report per solved island
    assert_eq!(res.reports.len(), 2);
    Ok(())
}

#[test]
fn opening_a_branch_splits_the_solution() -> Result<()> {
    let mut nc = stagg5()?;
    append(&mut nc, &two_bus(true));
    // tie the two islands together, then open the tie
    nc.branch.push_line(4, 5, 0.01, 0.1, 0.0, 1.0);
    nc.branch.active[8] = false;

    let res = run_pf(&nc, &PowerFlowOptions::default())?;
    assert!(res.converged);
    assert!(res.island_errors.is_empty());
    assert_eq!(res.sf[8], cmplx!());
    assert_eq!(res.loading[8], 0.0);
    Ok(())
}

#[test]
fn contract_violations_are_errors() {
    let mut nc = two_bus(true);
    nc.branch.t[0] = 7;
    assert!(matches!(
        run_pf(&nc, &PowerFlowOptions::default()),
        Err(PowerFlowError::BusIndexOutOfRange { branch: 0, bus: 7, nbus: 2 })
    ));

    let mut nc = two_bus(true);
    nc.bus.vset.pop();
    assert!(matches!(
        run_pf(&nc, &PowerFlowOptions::default()),
        Err(PowerFlowError::DimensionMismatch { .. })
    ));
}
