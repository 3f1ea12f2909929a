use crate::circuit::{BusMode, NumericCircuit};
use anyhow::{bail, Context, Result};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn default_sbase() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

fn default_one() -> f64 {
    1.0
}

/// Bus record of a JSON case. Powers in MW/MVAr, angles in degrees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseBus {
    /// External bus number.
    pub id: usize,
    #[serde(default)]
    pub mode: BusMode,
    #[serde(default = "default_true")]
    pub active: bool,

    /// Voltage magnitude: set point of PV and slack buses, initial guess
    /// otherwise.
    #[serde(default = "default_one")]
    pub vm: f64,
    /// Initial voltage angle.
    #[serde(default)]
    pub va: f64,

    #[serde(default)]
    pub p_gen: f64,
    #[serde(default)]
    pub q_gen: f64,
    pub qmin: Option<f64>,
    pub qmax: Option<f64>,
    /// Generation capacity sharing the distributed slack.
    #[serde(default)]
    pub installed_power: f64,

    /// Constant power load.
    #[serde(default)]
    pub p_load: f64,
    #[serde(default)]
    pub q_load: f64,
    /// Constant current load, as (MW, MVAr) at 1 p.u. voltage.
    #[serde(default)]
    pub i_load: (f64, f64),
    /// Constant impedance load, as (MW, MVAr) at 1 p.u. voltage.
    #[serde(default)]
    pub y_load: (f64, f64),

    /// Shunt conductance (MW at 1 p.u. voltage).
    #[serde(default)]
    pub gs: f64,
    /// Shunt susceptance (MVAr injected at 1 p.u. voltage).
    #[serde(default)]
    pub bs: f64,
}

/// On-load tap changer regulating the "to" bus voltage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseTapChanger {
    #[serde(default)]
    pub position: i32,
    pub min: i32,
    pub max: i32,
    /// Ratio increment per step above the neutral position.
    pub inc_up: f64,
    /// Ratio increment per step below the neutral position.
    pub inc_down: f64,
    #[serde(default = "default_one")]
    pub vset: f64,
}

/// Branch record of a JSON case. Impedances in p.u., rating in MVA,
/// phase shift in degrees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseBranch {
    pub from: usize,
    pub to: usize,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub r: f64,
    pub x: f64,
    #[serde(default)]
    pub b: f64,
    #[serde(default)]
    pub rate: f64,
    #[serde(default = "default_one")]
    pub tap: f64,
    #[serde(default)]
    pub shift: f64,
    pub tap_changer: Option<CaseTapChanger>,
}

/// Power system case file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    #[serde(default = "default_sbase")]
    pub sbase: f64,
    pub buses: Vec<CaseBus>,
    #[serde(default)]
    pub branches: Vec<CaseBranch>,
}

impl Case {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// External bus numbers, in internal order.
    pub fn bus_ids(&self) -> Vec<usize> {
        self.buses.iter().map(|b| b.id).collect()
    }

    /// Compiles the case into a per unit numerical circuit with buses
    /// numbered consecutively in file order.
    pub fn to_circuit(&self) -> Result<NumericCircuit> {
        if self.sbase <= 0.0 {
            bail!("base MVA must be positive, got {}", self.sbase);
        }
        let base = self.sbase;

        let mut index = HashMap::with_capacity(self.buses.len());
        for (i, b) in self.buses.iter().enumerate() {
            if index.insert(b.id, i).is_some() {
                bail!("duplicate bus number {}", b.id);
            }
        }

        let mut nc = NumericCircuit {
            sbase: base,
            ..Default::default()
        };
        for b in &self.buses {
            let s = Complex64::new(b.p_gen - b.p_load, b.q_gen - b.q_load) / base;
            let k = nc.push_bus(b.mode, b.vm, s);
            let bus = &mut nc.bus;
            bus.active[k] = b.active;
            bus.v0[k] = Complex64::from_polar(b.vm, b.va.to_radians());
            bus.qmin[k] = b.qmin.map_or(f64::NEG_INFINITY, |q| q / base);
            bus.qmax[k] = b.qmax.map_or(f64::INFINITY, |q| q / base);
            bus.installed_power[k] = b.installed_power / base;
            bus.i[k] = -Complex64::new(b.i_load.0, b.i_load.1) / base;
            bus.y[k] = -Complex64::new(b.y_load.0, b.y_load.1) / base;
            bus.shunt[k] = Complex64::new(b.gs, b.bs) / base;
        }

        for (l, br) in self.branches.iter().enumerate() {
            let f = *index
                .get(&br.from)
                .with_context(|| format!("branch {}: unknown from bus {}", l, br.from))?;
            let t = *index
                .get(&br.to)
                .with_context(|| format!("branch {}: unknown to bus {}", l, br.to))?;
            let branch = &mut nc.branch;
            branch.push_line(f, t, br.r, br.x, br.b, br.rate / base);
            branch.active[l] = br.active;
            branch.tap_module[l] = br.tap;
            branch.tap_angle[l] = br.shift.to_radians();

            if let Some(tc) = &br.tap_changer {
                if tc.min > tc.max {
                    bail!("branch {}: tap range {}..{} is empty", l, tc.min, tc.max);
                }
                branch.tap_control[l] = true;
                branch.tap_position[l] = tc.position;
                branch.min_tap[l] = tc.min;
                branch.max_tap[l] = tc.max;
                branch.tap_inc_reg_up[l] = tc.inc_up;
                branch.tap_inc_reg_down[l] = tc.inc_down;
                branch.vset[l] = tc.vset;
            }
        }

        nc.validate()?;
        log::debug!("case: {} buses, {} branches", nc.nbus(), nc.nbr());
        Ok(nc)
    }
}

pub fn read_case(case_path: &Path) -> Result<Case> {
    let file = File::open(case_path)
        .with_context(|| format!("unable to open {}", case_path.display()))?;
    let case = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("unable to parse {}", case_path.display()))?;
    Ok(case)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const CASE: &str = r#"{
        "sbase": 100,
        "buses": [
            {"id": 10, "mode": "Slack", "vm": 1.02},
            {"id": 20, "mode": "PV", "vm": 1.01, "p_gen": 40, "qmin": -30, "qmax": 30,
             "installed_power": 80},
            {"id": 30, "p_load": 60, "q_load": 20, "y_load": [10, 5], "bs": 19, "va": -2}
        ],
        "branches": [
            {"from": 10, "to": 20, "r": 0.01, "x": 0.1, "b": 0.02, "rate": 150},
            {"from": 20, "to": 30, "x": 0.2, "tap": 0.98, "shift": 3,
             "tap_changer": {"min": -8, "max": 8, "inc_up": 0.0125, "inc_down": 0.0125}},
            {"from": 10, "to": 30, "x": 0.3, "active": false}
        ]
    }"#;

    #[test]
    fn per_unit_conversion() {
        let case = Case::from_json(CASE).unwrap();
        assert_eq!(case.bus_ids(), vec![10, 20, 30]);
        let nc = case.to_circuit().unwrap();

        assert_eq!(nc.bus.mode, vec![BusMode::Slack, BusMode::PV, BusMode::PQ]);
        assert_eq!(nc.bus.s[1], Complex64::new(0.4, 0.0));
        assert_eq!(nc.bus.s[2], Complex64::new(-0.6, -0.2));
        assert_eq!(nc.bus.y[2], Complex64::new(-0.1, -0.05));
        assert_eq!(nc.bus.shunt[2], Complex64::new(0.0, 0.19));
        assert_eq!(nc.bus.qmax[1], 0.3);
        assert_eq!(nc.bus.qmin[0], f64::NEG_INFINITY);
        assert_eq!(nc.bus.installed_power[1], 0.8);
        assert_abs_diff_eq!(nc.bus.v0[2].arg(), (-2.0f64).to_radians(), epsilon = 1e-15);
        assert_eq!(nc.bus.vset[0], 1.02);

        assert_eq!(nc.branch.f, vec![0, 1, 0]);
        assert_eq!(nc.branch.t, vec![1, 2, 2]);
        assert_eq!(nc.branch.rate[0], 1.5);
        assert_eq!(nc.branch.active, vec![true, true, false]);
        assert_abs_diff_eq!(nc.branch.tap_angle[1], (3.0f64).to_radians());
        assert!(nc.branch.tap_control[1]);
        assert_eq!(nc.branch.max_tap[1], 8);
        assert_eq!(nc.branch.vset[1], 1.0);
    }

    #[test]
    fn unknown_bus_is_reported() {
        let json = r#"{"buses": [{"id": 1, "mode": "Slack"}],
                       "branches": [{"from": 1, "to": 2, "x": 0.1}]}"#;
        let err = Case::from_json(json).unwrap().to_circuit().unwrap_err();
        assert!(err.to_string().contains("unknown to bus 2"));
    }

    #[test]
    fn duplicate_bus_is_reported() {
        let json = r#"{"buses": [{"id": 1}, {"id": 1}]}"#;
        assert!(Case::from_json(json).unwrap().to_circuit().is_err());
    }
}
