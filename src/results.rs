use crate::bus_types::BusState;
use crate::error::PowerFlowError;
use crate::mpopt::Alg;
use num_complex::Complex64;
use serde::Serialize;
use std::time::Duration;

/// Outcome of a single inner solve.
#[derive(Debug, Clone)]
pub struct NumericPowerFlowResults {
    pub v: Vec<Complex64>,
    pub converged: bool,
    /// Infinity norm of the mismatch at the last iterate.
    pub norm_f: f64,
    /// Calculated bus power injections (p.u.).
    pub scalc: Vec<Complex64>,
    pub iterations: usize,
    pub elapsed: Duration,
    pub method: Alg,
}

impl NumericPowerFlowResults {
    pub fn report(&self) -> ConvergenceReport {
        ConvergenceReport {
            method: self.method,
            converged: self.converged,
            error: self.norm_f,
            iterations: self.iterations,
            elapsed: self.elapsed.as_secs_f64(),
        }
    }
}

/// Record of one solve attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub method: Alg,
    pub converged: bool,
    pub error: f64,
    pub iterations: usize,
    /// Wall time in seconds.
    pub elapsed: f64,
}

/// Whole-grid power flow results.
///
/// Island results are written back through their original bus and branch
/// indices. Powers are in MVA, voltages in p.u.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PowerFlowResults {
    pub voltage: Vec<Complex64>,
    /// Calculated bus power injections.
    pub sbus: Vec<Complex64>,
    pub bus_states: Vec<BusState>,

    /// Power entering each branch at its "from" end.
    pub sf: Vec<Complex64>,
    /// Power entering each branch at its "to" end.
    pub st: Vec<Complex64>,
    #[serde(rename = "if")]
    pub if_: Vec<Complex64>,
    pub it: Vec<Complex64>,
    pub vbranch: Vec<Complex64>,
    pub loading: Vec<f64>,
    pub losses: Vec<Complex64>,
    /// Tap modules after tap control.
    pub tap_module: Vec<f64>,

    /// Convergence reports of every solve attempt on every island.
    pub reports: Vec<ConvergenceReport>,
    /// Islands that could not be solved, by island number.
    #[serde(skip)]
    pub island_errors: Vec<(usize, PowerFlowError)>,
    /// True when every island converged.
    pub converged: bool,
}

impl PowerFlowResults {
    pub fn new(nbus: usize, nbr: usize) -> Self {
        PowerFlowResults {
            voltage: vec![Complex64::default(); nbus],
            sbus: vec![Complex64::default(); nbus],
            bus_states: vec![BusState::default(); nbus],
            sf: vec![Complex64::default(); nbr],
            st: vec![Complex64::default(); nbr],
            if_: vec![Complex64::default(); nbr],
            it: vec![Complex64::default(); nbr],
            vbranch: vec![Complex64::default(); nbr],
            loading: vec![0.0; nbr],
            losses: vec![Complex64::default(); nbr],
            tap_module: vec![1.0; nbr],
            reports: Vec::new(),
            island_errors: Vec::new(),
            converged: true,
        }
    }

    /// Writes an island result into the whole-grid arrays.
    pub fn apply_from_island(&mut self, island: &PowerFlowResults, bus_idx: &[usize], br_idx: &[usize]) {
        for (k, &i) in bus_idx.iter().enumerate() {
            self.voltage[i] = island.voltage[k];
            self.sbus[i] = island.sbus[k];
            self.bus_states[i] = island.bus_states[k];
        }
        for (k, &l) in br_idx.iter().enumerate() {
            self.sf[l] = island.sf[k];
            self.st[l] = island.st[k];
            self.if_[l] = island.if_[k];
            self.it[l] = island.it[k];
            self.vbranch[l] = island.vbranch[k];
            self.loading[l] = island.loading[k];
            self.losses[l] = island.losses[k];
            self.tap_module[l] = island.tap_module[k];
        }
        self.reports.extend(island.reports.iter().cloned());
        self.converged &= island.converged;
    }

    /// Total branch losses (MVA).
    pub fn total_losses(&self) -> Complex64 {
        self.losses.iter().sum()
    }
}
