use crate::circuit::NumericCircuit;
use crate::dc::{make_b_dc, DcSystem};
use crate::error::{PowerFlowError, Result};
use crate::linsolve::SolverBackend;
use crate::sparse::{position_map, select};
use crate::topology::split_into_islands;
use crate::traits::LinearSolver;
use faer::Mat;
use sprs::CsMat;

/// Denominators `1 - H[k,k]` below this magnitude mean that the outage of
/// branch `k` splits the network.
pub const LODF_NUMERICAL_ZERO: f64 = 1e-10;

/// Factors below this magnitude are ignored when estimating contingency
/// flows.
pub const CONTINGENCY_THRESHOLD: f64 = 1e-5;

/// How the slack absorbs an injection when computing the PTDF.
#[derive(Debug, Clone, PartialEq)]
pub enum PtdfSlack {
    /// Single slack bus.
    Single(usize),
    /// Weights specifying the proportion of the slack taken up at each bus.
    Distributed(Vec<f64>),
}

/// Builds the DC PTDF matrix for a given choice of slack.
///
/// Returns the `nbr x nbus` matrix `H` such that `H[l,j]` is the change
/// in flow on branch `l` for a unit injection at bus `j` balanced by the
/// slack. The reduced B matrix is factorized once and solved against all
/// unit injections in a single batch.
pub fn make_ptdf(dc: &DcSystem, slack: &PtdfSlack, lin_solver: &dyn LinearSolver) -> Result<Mat<f64>> {
    let nb = dc.bbus.rows();
    let nl = dc.bf.rows();

    let slack_bus = match slack {
        PtdfSlack::Single(s) => *s,
        PtdfSlack::Distributed(w) => {
            if w.len() != nb {
                return Err(PowerFlowError::DimensionMismatch {
                    what: "slack weights",
                    expected: nb,
                    found: w.len(),
                });
            }
            w.iter().position(|&x| x != 0.0).ok_or_else(|| {
                PowerFlowError::InvalidOption("slack weights are all zero".to_string())
            })?
        }
    };
    if slack_bus >= nb {
        return Err(PowerFlowError::InvalidOption(format!(
            "slack bus {} out of range for {} buses",
            slack_bus, nb
        )));
    }

    let noslack: Vec<usize> = (0..nb).filter(|&i| i != slack_bus).collect();
    let b_red = select(&dc.bbus, &noslack, &noslack);
    let lu = lin_solver.factorize(&b_red)?;
    let d_theta = lu.solve_mat(&Mat::identity(noslack.len(), noslack.len()))?;

    // H[:, noslack] = Bf[:, noslack] * dTheta
    let map = position_map(nb, &noslack);
    let mut h = Mat::<f64>::zeros(nl, nb);
    for (&b, (l, i)) in dc.bf.iter() {
        if let Some(r) = map[i] {
            for (c, &j) in noslack.iter().enumerate() {
                h[(l, j)] += b * d_theta[(r, c)];
            }
        }
    }

    if let PtdfSlack::Distributed(w) = slack {
        let total: f64 = w.iter().sum();
        for l in 0..nl {
            let hw: f64 = (0..nb).map(|j| h[(l, j)] * w[j]).sum::<f64>() / total;
            for j in 0..nb {
                h[(l, j)] -= hw;
            }
        }
    }
    Ok(h)
}

/// Branch to branch transfer factors `PTDF * Cft^T`: entry `(l, k)` is
/// the flow change on `l` for a unit transfer between the ends of `k`.
fn branch_transfer(ptdf: &Mat<f64>, cft: &CsMat<f64>) -> Mat<f64> {
    let nl = ptdf.nrows();
    let mut h = Mat::<f64>::zeros(nl, cft.rows());
    for (&c, (k, b)) in cft.iter() {
        for l in 0..nl {
            h[(l, k)] += c * ptdf[(l, b)];
        }
    }
    h
}

/// Line outage distribution factors with the outages that island the
/// network flagged.
#[derive(Debug, Clone)]
pub struct LodfMatrix {
    /// `nbr x nbr`; column `k` holds the flow change on every branch per
    /// unit of pre-outage flow on `k`. Islanding columns are zero.
    pub lodf: Mat<f64>,
    /// Branches whose outage splits the network.
    pub islanding: Vec<usize>,
}

impl LodfMatrix {
    pub fn is_islanding(&self, k: usize) -> bool {
        self.islanding.contains(&k)
    }

    /// `LODF[l, k]`, or an islanding error when the outage of `k` splits
    /// the network.
    pub fn get(&self, l: usize, k: usize) -> Result<f64> {
        if self.is_islanding(k) {
            return Err(PowerFlowError::Islanding { branch: k });
        }
        Ok(self.lodf[(l, k)])
    }

    /// Column `k` of the matrix, or an islanding error.
    pub fn column(&self, k: usize) -> Result<Vec<f64>> {
        if self.is_islanding(k) {
            return Err(PowerFlowError::Islanding { branch: k });
        }
        Ok(self.lodf.col_as_slice(k).to_vec())
    }
}

/// Computes the LODF matrix.
///
/// ```text
///  LODF[:, k] = H[:, k] / (1 - H[k, k]),  H = PTDF * Cft^T
/// ```
///
/// with `LODF[k, k] = -1`. When `1 - H[k,k]` is numerically zero the
/// branch is radial: its column is left at zero and `k` is reported in
/// `islanding`.
pub fn make_lodf(ptdf: &Mat<f64>, cft: &CsMat<f64>) -> LodfMatrix {
    let nl = ptdf.nrows();
    let h = branch_transfer(ptdf, cft);

    let mut lodf = Mat::<f64>::zeros(nl, nl);
    let mut islanding = Vec::new();
    for k in 0..nl {
        let div = 1.0 - h[(k, k)];
        if div.abs() > LODF_NUMERICAL_ZERO {
            for l in 0..nl {
                lodf[(l, k)] = h[(l, k)] / div;
            }
        } else {
            log::warn!("outage of branch {} islands the network", k);
            islanding.push(k);
        }
        lodf[(k, k)] = -1.0;
    }
    LodfMatrix { lodf, islanding }
}

/// Outage sensitivity of the branches when transferring power from bus
/// `j` to the slack:
///
/// ```text
///  OTDF[k, l] = PTDF[k, j] + LODF[k, l] * PTDF[l, j]
/// ```
pub fn make_otdf(ptdf: &Mat<f64>, lodf: &Mat<f64>, j: usize) -> Mat<f64> {
    let nl = ptdf.nrows();
    Mat::from_fn(nl, nl, |k, l| ptdf[(k, j)] + lodf[(k, l)] * ptdf[(l, j)])
}

/// Maximum transfer allowed by each branch in normal operation: the
/// signed `(rate - flow) / PTDF[m, i]` of largest magnitude over buses.
pub fn make_transfer_limits(ptdf: &Mat<f64>, flows: &[f64], rates: &[f64]) -> Vec<f64> {
    (0..ptdf.nrows())
        .map(|m| {
            let mut tmc = 0.0f64;
            for i in 0..ptdf.ncols() {
                if ptdf[(m, i)] != 0.0 {
                    let val = (rates[m] - flows[m]) / ptdf[(m, i)];
                    if val.abs() > tmc.abs() {
                        tmc = val;
                    }
                }
            }
            tmc
        })
        .collect()
}

/// Estimates the branch flows after a multiple contingency: the outage
/// of `outages` plus the bus injection changes `injections` (bus, MW).
///
/// Factors whose magnitude does not exceed `threshold` are ignored.
pub fn contingency_flows(
    base_flow: &[f64],
    lodf: &Mat<f64>,
    ptdf: &Mat<f64>,
    outages: &[usize],
    injections: &[(usize, f64)],
    threshold: f64,
) -> Vec<f64> {
    let mut flow = base_flow.to_vec();
    for (m, f) in flow.iter_mut().enumerate() {
        for &c in outages {
            let factor = lodf[(m, c)];
            if factor.abs() > threshold {
                *f += factor * base_flow[c];
            }
        }
        for &(bus, p) in injections {
            let factor = ptdf[(m, bus)];
            if factor.abs() > threshold {
                *f += factor * p;
            }
        }
    }
    flow
}

/// Whole-grid linear sensitivities assembled from every island.
#[derive(Debug, Clone)]
pub struct LinearAnalysis {
    /// `nbr x nbus`; zero between different islands.
    pub ptdf: Mat<f64>,
    pub lodf: LodfMatrix,
}

impl LinearAnalysis {
    /// DC branch flows for the bus active injections `p`.
    pub fn branch_flows(&self, p: &[f64]) -> Vec<f64> {
        (0..self.ptdf.nrows())
            .map(|l| (0..self.ptdf.ncols()).map(|j| self.ptdf[(l, j)] * p[j]).sum())
            .collect()
    }

    pub fn otdf(&self, j: usize) -> Mat<f64> {
        make_otdf(&self.ptdf, &self.lodf.lodf, j)
    }
}

/// Computes PTDF and LODF for every island of the circuit.
///
/// With `distributed_slack` the slack is shared by installed power (or
/// uniformly when no bus has any). Otherwise the island's slack bus takes
/// it; islands with no slack, or with several, use their first slack (or
/// first bus) and a warning is logged.
pub fn linear_analysis(
    nc: &NumericCircuit,
    distributed_slack: bool,
    backend: SolverBackend,
) -> Result<LinearAnalysis> {
    let lin_solver = backend.build();
    let (nb, nl) = (nc.nbus(), nc.nbr());
    let mut ptdf = Mat::<f64>::zeros(nl, nb);
    let mut lodf = Mat::<f64>::zeros(nl, nl);
    let mut islanding = Vec::new();

    for island in split_into_islands(nc)? {
        let sub = &island.circuit;
        let dc = make_b_dc(sub);

        let slack = if distributed_slack {
            let installed = &sub.bus.installed_power;
            let w = if installed.iter().any(|&p| p > 0.0) {
                installed.iter().map(|&p| p.max(0.0)).collect()
            } else {
                vec![1.0; sub.nbus()]
            };
            PtdfSlack::Distributed(w)
        } else {
            let slacks = sub.slack_buses();
            if slacks.len() != 1 {
                log::warn!(
                    "island {} has {} slack buses, using bus {} as reference",
                    island.index,
                    slacks.len(),
                    island.original_bus_idx[slacks.first().copied().unwrap_or(0)]
                );
            }
            PtdfSlack::Single(slacks.first().copied().unwrap_or(0))
        };

        let h = make_ptdf(&dc, &slack, lin_solver.as_ref())?;
        let l = make_lodf(&h, &dc.cft);

        let (buses, branches) = (&island.original_bus_idx, &island.original_branch_idx);
        for (a, &la) in branches.iter().enumerate() {
            for (j, &bj) in buses.iter().enumerate() {
                ptdf[(la, bj)] = h[(a, j)];
            }
            for (c, &lc) in branches.iter().enumerate() {
                lodf[(la, lc)] = l.lodf[(a, c)];
            }
        }
        islanding.extend(l.islanding.iter().map(|&k| branches[k]));
    }

    // branches outside every island
    for k in 0..nl {
        lodf[(k, k)] = -1.0;
    }
    islanding.sort_unstable();

    Ok(LinearAnalysis {
        ptdf,
        lodf: LodfMatrix { lodf, islanding },
    })
}

/// Dense matrix as a list of rows.
pub fn to_rows(m: &Mat<f64>) -> Vec<Vec<f64>> {
    (0..m.nrows())
        .map(|i| (0..m.ncols()).map(|j| m[(i, j)]).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::BusMode;
    use crate::cmplx;
    use approx::assert_abs_diff_eq;

    fn triangle() -> NumericCircuit {
        let mut nc = NumericCircuit {
            sbase: 100.0,
            ..Default::default()
        };
        nc.push_bus(BusMode::Slack, 1.0, cmplx!());
        nc.push_bus(BusMode::PQ, 1.0, cmplx!(0.5));
        nc.push_bus(BusMode::PQ, 1.0, cmplx!(-1.0));
        nc.branch.push_line(0, 1, 0.0, 0.25, 0.0, 1.0);
        nc.branch.push_line(0, 2, 0.0, 0.20, 0.0, 1.0);
        nc.branch.push_line(1, 2, 0.0, 0.40, 0.0, 1.0);
        nc
    }

    #[test]
    fn ptdf_flows_match_dc_power_flow() {
        let nc = triangle();
        let dc = make_b_dc(&nc);
        let solver = SolverBackend::SparseLu.build();
        let h = make_ptdf(&dc, &PtdfSlack::Single(0), solver.as_ref()).unwrap();

        // slack column is zero
        for l in 0..3 {
            assert_eq!(h[(l, 0)], 0.0);
        }

        let p = [0.0, 0.5, -1.0];
        let (va, _) = crate::dc::dc_pf(&dc.bbus, &p, &[0.0; 3], &[0], &[1, 2], solver.as_ref())
            .unwrap();
        let pf = dc.branch_flows(&va);
        for l in 0..3 {
            let f: f64 = (0..3).map(|j| h[(l, j)] * p[j]).sum();
            assert_abs_diff_eq!(f, pf[l], epsilon = 1e-12);
        }
    }

    #[test]
    fn distributed_slack_rows_sum_to_zero_weighted() {
        let nc = triangle();
        let dc = make_b_dc(&nc);
        let w = vec![1.0, 2.0, 1.0];
        let solver = SolverBackend::DenseLu.build();
        let h = make_ptdf(&dc, &PtdfSlack::Distributed(w.clone()), solver.as_ref()).unwrap();
        for l in 0..3 {
            let s: f64 = (0..3).map(|j| h[(l, j)] * w[j]).sum();
            assert_abs_diff_eq!(s, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn lodf_redistributes_outaged_flow() {
        let nc = triangle();
        let dc = make_b_dc(&nc);
        let solver = SolverBackend::SparseLu.build();
        let h = make_ptdf(&dc, &PtdfSlack::Single(0), solver.as_ref()).unwrap();
        let l = make_lodf(&h, &dc.cft);
        assert!(l.islanding.is_empty());

        let p = [0.5, 0.5, -1.0];
        let base: Vec<f64> = (0..3)
            .map(|k| (0..3).map(|j| h[(k, j)] * p[j]).sum())
            .collect();

        // outage of branch 0: the remaining branches carry everything
        let post = contingency_flows(&base, &l.lodf, &h, &[0], &[], 0.0);
        assert_abs_diff_eq!(post[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(post[1], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(post[2], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn otdf_and_transfer_limits() {
        let ptdf = Mat::from_fn(2, 2, |i, j| if i == j { 0.5 } else { 0.25 });
        let lodf = Mat::from_fn(2, 2, |i, j| if i == j { -1.0 } else { 1.0 });
        let otdf = make_otdf(&ptdf, &lodf, 0);
        assert_abs_diff_eq!(otdf[(0, 0)], 0.0);
        assert_abs_diff_eq!(otdf[(1, 0)], 0.25 + 0.5);

        let tmc = make_transfer_limits(&ptdf, &[0.5, -0.5], &[1.0, 1.0]);
        assert_abs_diff_eq!(tmc[0], 2.0);
        assert_abs_diff_eq!(tmc[1], 6.0);
    }

    #[test]
    fn islanding_outage_is_reported() {
        // triangle plus a radial spur 2-3
        let mut nc = triangle();
        nc.push_bus(BusMode::PQ, 1.0, cmplx!(-0.1));
        nc.branch.push_line(2, 3, 0.0, 0.1, 0.0, 1.0);

        let la = linear_analysis(&nc, false, SolverBackend::SparseLu).unwrap();
        assert_eq!(la.lodf.islanding, vec![3]);
        assert_eq!(la.lodf.get(0, 3), Err(PowerFlowError::Islanding { branch: 3 }));
        for k in 0..3 {
            for v in la.lodf.column(k).unwrap() {
                assert!(v.is_finite());
            }
        }
    }
}
