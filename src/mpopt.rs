use crate::linsolve::SolverBackend;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum Alg {
    /// Newton's method.
    #[default]
    NR = 0,
    /// Fast-Decoupled method (BX version).
    FDBX = 1,
    /// Fast-Decoupled method (XB version).
    FDXB = 2,
    /// Gauss-Seidel method.
    GS = 3,
    /// Linearized DC power flow that assumes lossless branches,
    /// 1pu voltages and small voltage angle differences.
    DC = 4,
}

impl Alg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Alg::NR => "NR",
            Alg::FDBX => "FDBX",
            Alg::FDXB => "FDXB",
            Alg::GS => "GS",
            Alg::DC => "DC",
        }
    }

    /// AC methods tried in order when retrying after a failed solve.
    pub fn retry_order() -> [Alg; 4] {
        [Alg::NR, Alg::FDXB, Alg::FDBX, Alg::GS]
    }
}

impl fmt::Display for Alg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Alg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NR" | "NEWTON" => Ok(Alg::NR),
            "FDBX" => Ok(Alg::FDBX),
            "FDXB" | "FD" => Ok(Alg::FDXB),
            "GS" | "GAUSS" => Ok(Alg::GS),
            "DC" => Ok(Alg::DC),
            other => Err(format!("unknown power flow algorithm: {}", other)),
        }
    }
}

/// Generator reactive power limit enforcement.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum QControl {
    #[default]
    NoControl,
    /// PV-PQ switching with Zhao's algorithm.
    Direct,
    /// Gradual Q adjustment with a logistic gain.
    Iterative,
}

/// Transformer tap changer voltage control.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum TapControl {
    #[default]
    NoControl,
    /// Jump straight to the tap that best matches the set point.
    Direct,
    /// Move one tap position per outer iteration.
    Iterative,
}

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(default)]
pub struct PowerFlowOptions {
    /// AC power flow algorithm.
    pub alg: Alg,

    /// Try the other methods if the selected one fails to converge.
    pub retry_with_other_methods: bool,

    /// Termination tolerance on per unit P & Q mismatch. Default value is 1e-6.
    pub tolerance: f64,

    /// Maximum number of iterations for Newton's and the fast decoupled
    /// methods. Default value is 25.
    pub max_iter: usize,
    /// Maximum number of iterations for Gauss-Seidel. Default value is 1000.
    pub max_iter_gs: usize,

    /// Maximum number of control loop iterations. Default value is 100.
    pub max_outer_loop_iter: usize,

    pub control_q: QControl,
    /// Steepness of the logistic gain used by iterative Q control.
    pub q_steepness_factor: f64,

    pub control_taps: TapControl,

    /// Share the slack active power among buses by installed power.
    pub distributed_slack: bool,

    /// Initial Newton step length.
    pub mu: f64,
    /// Step reduction factor used while backtracking.
    pub backtracking_parameter: f64,

    pub backend: SolverBackend,
}

impl Default for PowerFlowOptions {
    fn default() -> Self {
        Self {
            alg: Alg::NR,
            retry_with_other_methods: true,
            tolerance: 1e-6,
            max_iter: 25,
            max_iter_gs: 1000,
            max_outer_loop_iter: 100,
            control_q: QControl::NoControl,
            q_steepness_factor: 30.0,
            control_taps: TapControl::NoControl,
            distributed_slack: false,
            mu: 1.0,
            backtracking_parameter: 0.5,
            backend: SolverBackend::SparseLu,
        }
    }
}

impl PowerFlowOptions {
    pub fn max_iter_for(&self, alg: Alg) -> usize {
        match alg {
            Alg::GS => self.max_iter_gs,
            _ => self.max_iter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_defaults() {
        let opt = PowerFlowOptionsBuilder::default()
            .alg(Alg::GS)
            .tolerance(1e-9)
            .build()
            .unwrap();
        assert_eq!(opt.alg, Alg::GS);
        assert_eq!(opt.tolerance, 1e-9);
        assert_eq!(opt.max_iter, 25);
        assert_eq!(opt.max_iter_for(Alg::GS), 1000);
        assert!(opt.retry_with_other_methods);
    }

    #[test]
    fn alg_names() {
        assert_eq!("fdxb".parse::<Alg>(), Ok(Alg::FDXB));
        assert_eq!("nr".parse::<Alg>(), Ok(Alg::NR));
        assert!("helm".parse::<Alg>().is_err());
    }
}
