use crate::bus_types::{BusClassification, BusState, Switch};
use crate::circuit::{BranchData, BusData, BusMode};
use crate::zip::ZipInjection;
use num_complex::Complex64;

/// Decimal places used when comparing voltages in iterative Q control.
const Q_PRECISION: i32 = 4;

fn round_to(x: f64, digits: i32) -> f64 {
    let f = 10f64.powi(digits);
    (x * f).round() / f
}

/// Enforces reactive power limits with PV/PQ switching (J. Zhao).
///
/// PV buses whose calculated reactive injection leaves `[qmin, qmax]`
/// become PQ with Q fixed at the violated limit. Buses held at a limit
/// return to PV, with their magnitude reset to the set point and their
/// angle kept, once their voltage crosses the set point by more than
/// `deadband`. Returns true when any bus changed state.
pub fn control_q_direct(
    states: &mut BusClassification,
    v: &mut [Complex64],
    s_bus: &mut ZipInjection,
    s_calc: &[Complex64],
    bus: &BusData,
    deadband: f64,
) -> bool {
    let mut changed = false;
    for k in 0..states.len() {
        let vm = v[k].norm();
        let q = s_calc[k].im;
        let Some(sw) = states.states[k].switch(vm, bus.vset[k], q, bus.qmin[k], bus.qmax[k], deadband)
        else {
            continue;
        };
        match sw {
            Switch::ToPq(state, q_lim) => {
                log::debug!("bus {}: PV -> {} (Q = {:.4})", k, state.code(), q_lim);
                states.states[k] = state;
                s_bus.set_q(k, q_lim, vm);
            }
            Switch::ToPv => {
                log::debug!("bus {}: {} -> PV", k, states.states[k].code());
                states.states[k] = BusState::Pv;
                v[k] *= bus.vset[k] / vm;
            }
        }
        changed = true;
    }
    changed
}

/// Iterative reactive power control.
///
/// Buses that are PV in the circuit data and have both reactive limits
/// are first switched to PQ with zero reactive injection. On later calls
/// their Q is moved towards the limit that helps to restore the voltage
/// set point, by a fraction of the remaining range given by the logistic
/// gain
///
/// ```text
///  2 * (1 / (1 + exp(-k * |Vset - V|)) - 0.5)
/// ```
///
/// A bus with one unbounded side is only held at its finite limit when
/// that limit is violated, and goes back to PV as soon as it needs
/// reactive power from the unbounded side. Without any limit the bus
/// stays PV. Returns true when any injection or state changed.
pub fn control_q_iterative(
    states: &mut BusClassification,
    v: &mut [Complex64],
    s_bus: &mut ZipInjection,
    s_calc: &[Complex64],
    bus: &BusData,
    steepness: f64,
) -> bool {
    let inc_precision = (1.5 * Q_PRECISION as f64) as i32;
    let mut changed = false;

    for k in 0..states.len() {
        let vm = v[k].norm();
        let (qmin, qmax) = (bus.qmin[k], bus.qmax[k]);
        match states.states[k] {
            BusState::Pv => {
                let q = s_calc[k].im;
                let q_fixed = if qmin.is_finite() && qmax.is_finite() {
                    Some(0.0)
                } else if q > qmax {
                    Some(qmax)
                } else if q < qmin {
                    Some(qmin)
                } else {
                    None
                };
                if let Some(q_fixed) = q_fixed {
                    log::debug!("bus {}: PV -> PQ (Q = {:.4})", k, q_fixed);
                    states.states[k] = BusState::Pq;
                    s_bus.set_q(k, q_fixed, vm);
                    changed = true;
                }
            }
            BusState::Pq if bus.mode[k] == BusMode::PV => {
                let (vset, q) = (bus.vset[k], s_calc[k].im);
                let (vm_r, vset_r) = (round_to(vm, Q_PRECISION), round_to(vset, Q_PRECISION));
                let raise = vm_r < vset_r;
                if vm_r == vset_r {
                    continue;
                }

                let limit = if raise { qmax } else { qmin };
                if !limit.is_finite() {
                    log::debug!("bus {}: PQ -> PV", k);
                    states.states[k] = BusState::Pv;
                    v[k] *= vset / vm;
                    changed = true;
                    continue;
                }

                let gain = 2.0 * (1.0 / (1.0 + (-steepness * (vset - vm).abs()).exp()) - 0.5);
                let inc = round_to((limit - q).abs() * gain, inc_precision);
                let q_new = if raise {
                    (inc > 0.0 && q + inc < limit).then_some(q + inc)
                } else {
                    (inc > 0.0 && q - inc > limit).then_some(q - inc)
                };

                if let Some(q_new) = q_new {
                    log::trace!("bus {}: Q {:.6} -> {:.6}", k, q, q_new);
                    s_bus.set_q(k, q_new, vm);
                    changed = true;
                }
            }
            _ => {}
        }
    }
    changed
}

/// Tap module for a tap position.
pub fn tap_module(br: &BranchData, k: usize, position: i32) -> f64 {
    let inc = if position >= 0 {
        br.tap_inc_reg_up[k]
    } else {
        br.tap_inc_reg_down[k]
    };
    1.0 + position as f64 * inc
}

fn regulated(br: &BranchData) -> impl Iterator<Item = usize> + '_ {
    (0..br.len()).filter(|&k| br.active[k] && br.tap_control[k])
}

/// Moves regulating taps one position per call towards the voltage set
/// point of their "to" bus. Returns true when any tap moved.
pub fn control_taps_iterative(br: &mut BranchData, v: &[Complex64]) -> bool {
    let mut changed = false;
    let idx: Vec<usize> = regulated(br).collect();
    for k in idx {
        let vt = v[br.t[k]].norm();
        let pos = br.tap_position[k];
        let step = if pos > 0 {
            br.tap_inc_reg_up[k]
        } else {
            br.tap_inc_reg_down[k]
        };

        let new_pos = if br.vset[k] > vt + step / 2.0 {
            // voltage too low: reduce the ratio
            (pos > br.min_tap[k]).then_some(pos - 1)
        } else if br.vset[k] < vt - step / 2.0 {
            (pos < br.max_tap[k]).then_some(pos + 1)
        } else {
            None
        };

        if let Some(new_pos) = new_pos {
            br.tap_position[k] = new_pos;
            br.tap_module[k] = tap_module(br, k, new_pos);
            log::debug!("branch {}: tap {} -> {} (m = {:.4})", k, pos, new_pos, br.tap_module[k]);
            changed = true;
        }
    }
    changed
}

/// Sets regulating taps to the position whose ratio best restores the
/// voltage set point of their "to" bus. Returns true when any tap moved.
pub fn control_taps_direct(br: &mut BranchData, v: &[Complex64]) -> bool {
    let mut changed = false;
    let idx: Vec<usize> = regulated(br).collect();
    for k in idx {
        let vt = v[br.t[k]].norm();
        let desired = vt / br.vset[k] * br.tap_module[k];
        let inc = if desired >= 1.0 {
            br.tap_inc_reg_up[k]
        } else {
            br.tap_inc_reg_down[k]
        };
        if inc == 0.0 {
            continue;
        }
        let pos = (((desired - 1.0) / inc).round() as i32).clamp(br.min_tap[k], br.max_tap[k]);
        if pos != br.tap_position[k] {
            log::debug!("branch {}: tap {} -> {}", k, br.tap_position[k], pos);
            br.tap_position[k] = pos;
            br.tap_module[k] = tap_module(br, k, pos);
            changed = true;
        }
    }
    changed
}

/// Active power increments that share `slack_p` among the buses in
/// proportion to their installed power. Empty when nothing is installed.
pub fn distribute_slack(slack_p: f64, installed_power: &[f64], active: &[bool]) -> Option<Vec<f64>> {
    let total: f64 = installed_power
        .iter()
        .zip(active)
        .filter(|(_, &a)| a)
        .map(|(p, _)| p)
        .sum();
    if total <= 0.0 {
        return None;
    }
    Some(
        installed_power
            .iter()
            .zip(active)
            .map(|(p, &a)| if a { slack_p * p / total } else { 0.0 })
            .collect(),
    )
}
