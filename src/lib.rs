mod bus_types;
mod case;
mod circuit;
mod controls;
mod cpf;
mod dc;
mod error;
mod fd;
mod gauss;
mod jac;
mod mpopt;
mod newton;
mod pf;
mod results;
mod sbus;
mod short_circuit;
mod ybus;
mod zip;

pub mod contingency;
pub mod debug;
pub mod linsolve;
pub mod math;
pub mod ptdf;
pub mod sparse;
pub mod topology;
pub mod traits;

#[cfg(test)]
mod tests;

pub use bus_types::*;
pub use case::*;
pub use circuit::*;
pub use controls::*;
pub use cpf::*;
pub use dc::*;
pub use error::*;
pub use fd::*;
pub use gauss::*;
pub use jac::*;
pub use mpopt::*;
pub use newton::*;
pub use pf::*;
pub use results::*;
pub use sbus::*;
pub use short_circuit::*;
pub use ybus::*;
pub use zip::*;

pub use contingency::{n_minus_1, rebuild_outage_angles, NMinusOneResults, OutageResult, ShermanMorrison};
pub use linsolve::SolverBackend;
pub use ptdf::{linear_analysis, make_lodf, make_ptdf, LinearAnalysis, LodfMatrix, PtdfSlack};
pub use topology::{split_into_islands, Island};
