use crate::circuit::NumericCircuit;
use crate::sbus::SBus;
use num_complex::Complex64;

/// Bus power injections of the ZIP model.
///
/// The fields `s`, `i` and `y` hold the constant power, constant current
/// and constant admittance portions, each expressed as the complex power
/// injected at 1 p.u. voltage magnitude.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZipInjection {
    pub s: Vec<Complex64>,
    pub i: Vec<Complex64>,
    pub y: Vec<Complex64>,
}

impl ZipInjection {
    pub fn from_circuit(nc: &NumericCircuit) -> Self {
        ZipInjection {
            s: nc.bus.s.clone(),
            i: nc.bus.i.clone(),
            y: nc.bus.y.clone(),
        }
    }

    /// Constant power injections only.
    pub fn constant_power(s: Vec<Complex64>) -> Self {
        let n = s.len();
        ZipInjection {
            s,
            i: vec![Complex64::default(); n],
            y: vec![Complex64::default(); n],
        }
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.s.is_empty()
    }

    /// Fixes the reactive injection of bus `k` at `q` for the magnitude `vm`,
    /// keeping the voltage dependent portions.
    pub fn set_q(&mut self, k: usize, q: f64, vm: f64) {
        let q_zi = (self.i[k] * vm + self.y[k] * (vm * vm)).im;
        self.s[k].im = q - q_zi;
    }

    /// Adds an active power increment to the constant power portion.
    pub fn add_p(&mut self, delta: &[f64]) {
        self.s
            .iter_mut()
            .zip(delta)
            .for_each(|(s, d)| s.re += d);
    }
}

impl SBus for ZipInjection {
    fn s_bus(&self, vm: &[f64]) -> Vec<Complex64> {
        (0..self.s.len())
            .map(|k| self.s[k] + self.i[k] * vm[k] + self.y[k] * (vm[k] * vm[k]))
            .collect()
    }

    fn d_sbus_d_vm(&self, vm: &[f64]) -> Vec<Complex64> {
        (0..self.s.len())
            .map(|k| self.i[k] + self.y[k] * (2.0 * vm[k]))
            .collect()
    }
}
