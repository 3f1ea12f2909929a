use crate::error::{PowerFlowError, Result};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Bus type code as supplied by the circuit builder.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum BusMode {
    /// Fixed active and reactive power.
    #[default]
    PQ,
    /// Fixed voltage magnitude and active power.
    PV,
    /// Reference voltage angle. Slack active and reactive power.
    Slack,
}

/// Per-bus arrays of a compiled circuit. All powers in per unit.
#[derive(Debug, Clone, Default)]
pub struct BusData {
    pub active: Vec<bool>,
    pub mode: Vec<BusMode>,

    /// Voltage magnitude set point of PV and slack buses.
    pub vset: Vec<f64>,
    /// Initial voltage guess.
    pub v0: Vec<Complex64>,

    pub qmin: Vec<f64>,
    pub qmax: Vec<f64>,

    /// Installed generation used to distribute the slack.
    pub installed_power: Vec<f64>,

    /// Constant power injection (generation minus load).
    pub s: Vec<Complex64>,
    /// Constant current injection, as power at 1 p.u. voltage.
    pub i: Vec<Complex64>,
    /// Constant admittance injection, as power at 1 p.u. voltage.
    pub y: Vec<Complex64>,

    /// Shunt admittance stamped on the Ybus diagonal.
    pub shunt: Vec<Complex64>,
}

impl BusData {
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Per-branch arrays of a compiled circuit.
///
/// Branches follow the pi model with an ideal transformer of complex ratio
/// `tap_module·exp(j·tap_angle)` at the "from" end.
#[derive(Debug, Clone, Default)]
pub struct BranchData {
    pub f: Vec<usize>,
    pub t: Vec<usize>,
    pub active: Vec<bool>,

    pub r: Vec<f64>,
    pub x: Vec<f64>,
    /// Total line charging susceptance.
    pub b: Vec<f64>,

    pub tap_module: Vec<f64>,
    /// Phase shift (radians).
    pub tap_angle: Vec<f64>,

    /// Rating (p.u.) used for loading.
    pub rate: Vec<f64>,

    /// Branch regulates the voltage of its "to" bus with its tap changer.
    pub tap_control: Vec<bool>,
    pub tap_position: Vec<i32>,
    pub min_tap: Vec<i32>,
    pub max_tap: Vec<i32>,
    pub tap_inc_reg_up: Vec<f64>,
    pub tap_inc_reg_down: Vec<f64>,
    /// Voltage set point of the regulated bus.
    pub vset: Vec<f64>,
}

impl BranchData {
    pub fn len(&self) -> usize {
        self.f.len()
    }

    pub fn is_empty(&self) -> bool {
        self.f.is_empty()
    }

    /// Appends an untapped, unregulated line.
    pub fn push_line(&mut self, f: usize, t: usize, r: f64, x: f64, b: f64, rate: f64) {
        self.f.push(f);
        self.t.push(t);
        self.active.push(true);
        self.r.push(r);
        self.x.push(x);
        self.b.push(b);
        self.tap_module.push(1.0);
        self.tap_angle.push(0.0);
        self.rate.push(rate);
        self.tap_control.push(false);
        self.tap_position.push(0);
        self.min_tap.push(0);
        self.max_tap.push(0);
        self.tap_inc_reg_up.push(0.0);
        self.tap_inc_reg_down.push(0.0);
        self.vset.push(1.0);
    }
}

/// Numerical circuit consumed by the solver core: buses and branches as
/// structures of arrays, in per unit on `sbase`.
#[derive(Debug, Clone, Default)]
pub struct NumericCircuit {
    /// System MVA base.
    pub sbase: f64,
    pub bus: BusData,
    pub branch: BranchData,
}

fn check_len(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(PowerFlowError::DimensionMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

impl NumericCircuit {
    pub fn nbus(&self) -> usize {
        self.bus.len()
    }

    pub fn nbr(&self) -> usize {
        self.branch.len()
    }

    /// Appends a bus with the given type, set point and constant power
    /// injection. Reactive limits are left unbounded.
    pub fn push_bus(&mut self, mode: BusMode, vset: f64, s: Complex64) -> usize {
        let bus = &mut self.bus;
        bus.active.push(true);
        bus.mode.push(mode);
        bus.vset.push(vset);
        bus.v0.push(Complex64::new(vset, 0.0));
        bus.qmin.push(f64::NEG_INFINITY);
        bus.qmax.push(f64::INFINITY);
        bus.installed_power.push(0.0);
        bus.s.push(s);
        bus.i.push(Complex64::default());
        bus.y.push(Complex64::default());
        bus.shunt.push(Complex64::default());
        bus.len() - 1
    }

    /// Checks the array lengths and branch end indices.
    pub fn validate(&self) -> Result<()> {
        let nb = self.nbus();
        let bus = &self.bus;
        check_len("bus.mode", nb, bus.mode.len())?;
        check_len("bus.vset", nb, bus.vset.len())?;
        check_len("bus.v0", nb, bus.v0.len())?;
        check_len("bus.qmin", nb, bus.qmin.len())?;
        check_len("bus.qmax", nb, bus.qmax.len())?;
        check_len("bus.installed_power", nb, bus.installed_power.len())?;
        check_len("bus.s", nb, bus.s.len())?;
        check_len("bus.i", nb, bus.i.len())?;
        check_len("bus.y", nb, bus.y.len())?;
        check_len("bus.shunt", nb, bus.shunt.len())?;

        let nl = self.nbr();
        let br = &self.branch;
        check_len("branch.t", nl, br.t.len())?;
        check_len("branch.active", nl, br.active.len())?;
        check_len("branch.r", nl, br.r.len())?;
        check_len("branch.x", nl, br.x.len())?;
        check_len("branch.b", nl, br.b.len())?;
        check_len("branch.tap_module", nl, br.tap_module.len())?;
        check_len("branch.tap_angle", nl, br.tap_angle.len())?;
        check_len("branch.rate", nl, br.rate.len())?;
        check_len("branch.tap_control", nl, br.tap_control.len())?;
        check_len("branch.tap_position", nl, br.tap_position.len())?;
        check_len("branch.min_tap", nl, br.min_tap.len())?;
        check_len("branch.max_tap", nl, br.max_tap.len())?;
        check_len("branch.tap_inc_reg_up", nl, br.tap_inc_reg_up.len())?;
        check_len("branch.tap_inc_reg_down", nl, br.tap_inc_reg_down.len())?;
        check_len("branch.vset", nl, br.vset.len())?;

        for (k, (&f, &t)) in br.f.iter().zip(&br.t).enumerate() {
            for bus in [f, t] {
                if bus >= nb {
                    return Err(PowerFlowError::BusIndexOutOfRange {
                        branch: k,
                        bus,
                        nbus: nb,
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns an owned copy restricted to `bus_idx` and `br_idx`, with
    /// branch ends renumbered to positions in `bus_idx`. Branches must have
    /// both ends inside the bus selection.
    pub fn slice(&self, bus_idx: &[usize], br_idx: &[usize]) -> Result<NumericCircuit> {
        let mut new_index = vec![usize::MAX; self.nbus()];
        for (k, &i) in bus_idx.iter().enumerate() {
            new_index[i] = k;
        }

        let b = &self.bus;
        let bus = BusData {
            active: bus_idx.iter().map(|&i| b.active[i]).collect(),
            mode: bus_idx.iter().map(|&i| b.mode[i]).collect(),
            vset: bus_idx.iter().map(|&i| b.vset[i]).collect(),
            v0: bus_idx.iter().map(|&i| b.v0[i]).collect(),
            qmin: bus_idx.iter().map(|&i| b.qmin[i]).collect(),
            qmax: bus_idx.iter().map(|&i| b.qmax[i]).collect(),
            installed_power: bus_idx.iter().map(|&i| b.installed_power[i]).collect(),
            s: bus_idx.iter().map(|&i| b.s[i]).collect(),
            i: bus_idx.iter().map(|&i| b.i[i]).collect(),
            y: bus_idx.iter().map(|&i| b.y[i]).collect(),
            shunt: bus_idx.iter().map(|&i| b.shunt[i]).collect(),
        };

        let r = &self.branch;
        let mut f = Vec::with_capacity(br_idx.len());
        let mut t = Vec::with_capacity(br_idx.len());
        for &k in br_idx {
            let (fi, ti) = (new_index[r.f[k]], new_index[r.t[k]]);
            if fi == usize::MAX || ti == usize::MAX {
                return Err(PowerFlowError::BusIndexOutOfRange {
                    branch: k,
                    bus: if fi == usize::MAX { r.f[k] } else { r.t[k] },
                    nbus: bus_idx.len(),
                });
            }
            f.push(fi);
            t.push(ti);
        }
        let branch = BranchData {
            f,
            t,
            active: br_idx.iter().map(|&k| r.active[k]).collect(),
            r: br_idx.iter().map(|&k| r.r[k]).collect(),
            x: br_idx.iter().map(|&k| r.x[k]).collect(),
            b: br_idx.iter().map(|&k| r.b[k]).collect(),
            tap_module: br_idx.iter().map(|&k| r.tap_module[k]).collect(),
            tap_angle: br_idx.iter().map(|&k| r.tap_angle[k]).collect(),
            rate: br_idx.iter().map(|&k| r.rate[k]).collect(),
            tap_control: br_idx.iter().map(|&k| r.tap_control[k]).collect(),
            tap_position: br_idx.iter().map(|&k| r.tap_position[k]).collect(),
            min_tap: br_idx.iter().map(|&k| r.min_tap[k]).collect(),
            max_tap: br_idx.iter().map(|&k| r.max_tap[k]).collect(),
            tap_inc_reg_up: br_idx.iter().map(|&k| r.tap_inc_reg_up[k]).collect(),
            tap_inc_reg_down: br_idx.iter().map(|&k| r.tap_inc_reg_down[k]).collect(),
            vset: br_idx.iter().map(|&k| r.vset[k]).collect(),
        };

        Ok(NumericCircuit {
            sbase: self.sbase,
            bus,
            branch,
        })
    }

    /// Indices of the slack buses.
    pub fn slack_buses(&self) -> Vec<usize> {
        self.bus
            .mode
            .iter()
            .enumerate()
            .filter(|(_, &m)| m == BusMode::Slack)
            .map(|(i, _)| i)
            .collect()
    }
}
