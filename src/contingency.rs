use crate::circuit::NumericCircuit;
use crate::dc::{branch_susceptance, dc_pf, make_b_dc, DcSystem};
use crate::error::{PowerFlowError, Result};
use crate::ptdf::LODF_NUMERICAL_ZERO;
use crate::sparse::select;
use crate::traits::{Factorization, LinearSolver};
use serde::Serialize;

/// Single branch outages of a DC network by rank-1 update.
///
/// The reduced susceptance matrix `B` is factorized once. The outage of
/// branch `k` with series susceptance `b` changes it to `B - b·u·u^T`,
/// `u` being the reduced incidence vector of the branch, and
///
/// ```text
///  theta_post = theta_base + v · (b · u^T · theta_base + pfinj) / d
///  v = B^-1 · u,   d = 1 - b · u^T · v
/// ```
///
/// where `pfinj` is the phase shift injection the branch takes with it,
/// gives the post-outage angles with one extra solve and no
/// refactorization. The base factorization is never modified.
pub struct ShermanMorrison {
    dc: DcSystem,
    b: Vec<f64>,
    f: Vec<usize>,
    t: Vec<usize>,
    slack: usize,
    /// Reduced position of each bus, `None` for the slack.
    reduced: Vec<Option<usize>>,
    lu: Box<dyn Factorization>,
    theta_base: Vec<f64>,
}

impl ShermanMorrison {
    /// Factorizes the network and solves the base case for the bus active
    /// injections `p_bus` (p.u.). The slack angle is zero.
    pub fn new(
        nc: &NumericCircuit,
        p_bus: &[f64],
        slack: usize,
        lin_solver: &dyn LinearSolver,
    ) -> Result<Self> {
        nc.validate()?;
        let nb = nc.nbus();
        if p_bus.len() != nb {
            return Err(PowerFlowError::DimensionMismatch {
                what: "bus injections",
                expected: nb,
                found: p_bus.len(),
            });
        }
        if slack >= nb {
            return Err(PowerFlowError::InvalidOption(format!(
                "slack bus {} out of range for {} buses",
                slack, nb
            )));
        }

        let dc = make_b_dc(nc);
        let noslack: Vec<usize> = (0..nb).filter(|&i| i != slack).collect();
        let mut reduced = vec![None; nb];
        for (r, &i) in noslack.iter().enumerate() {
            reduced[i] = Some(r);
        }

        let lu = lin_solver.factorize(&select(&dc.bbus, &noslack, &noslack))?;
        let rhs: Vec<f64> = noslack.iter().map(|&i| p_bus[i] - dc.pbusinj[i]).collect();
        let theta_red = lu.solve(&rhs)?;
        let mut theta_base = vec![0.0; nb];
        for (&i, &a) in noslack.iter().zip(&theta_red) {
            theta_base[i] = a;
        }

        Ok(ShermanMorrison {
            b: branch_susceptance(nc),
            f: nc.branch.f.clone(),
            t: nc.branch.t.clone(),
            dc,
            slack,
            reduced,
            lu,
            theta_base,
        })
    }

    pub fn slack(&self) -> usize {
        self.slack
    }

    /// Base case angles (radians).
    pub fn base_angles(&self) -> &[f64] {
        &self.theta_base
    }

    /// Base case branch flows (p.u.).
    pub fn base_flows(&self) -> Vec<f64> {
        self.dc.branch_flows(&self.theta_base)
    }

    /// Reduced incidence vector of branch `k`.
    fn incidence(&self, k: usize) -> Vec<f64> {
        let mut u = vec![0.0; self.lu.dim()];
        if let Some(r) = self.reduced[self.f[k]] {
            u[r] += 1.0;
        }
        if let Some(r) = self.reduced[self.t[k]] {
            u[r] -= 1.0;
        }
        u
    }

    /// Bus angles after the outage of branch `k`.
    ///
    /// Fails with [`PowerFlowError::Islanding`] when the outage splits the
    /// network.
    pub fn branch_outage(&self, k: usize) -> Result<Vec<f64>> {
        if k >= self.b.len() {
            return Err(PowerFlowError::InvalidOption(format!(
                "branch {} out of range for {} branches",
                k,
                self.b.len()
            )));
        }
        let bk = self.b[k];
        if bk == 0.0 {
            return Ok(self.theta_base.clone());
        }

        let u = self.incidence(k);
        let v = self.lu.solve(&u)?;
        let utv: f64 = u.iter().zip(&v).map(|(a, b)| a * b).sum();
        let d = 1.0 - bk * utv;
        if d.abs() < LODF_NUMERICAL_ZERO {
            log::warn!("outage of branch {} islands the network (d = {:e})", k, d);
            return Err(PowerFlowError::Islanding { branch: k });
        }

        // the phase shift injection of the branch leaves with it
        let ut_theta = self.theta_base[self.f[k]] - self.theta_base[self.t[k]];
        let scale = (bk * ut_theta + self.dc.pfinj[k]) / d;
        let mut theta = self.theta_base.clone();
        for (i, r) in self.reduced.iter().enumerate() {
            if let Some(r) = *r {
                theta[i] += scale * v[r];
            }
        }
        Ok(theta)
    }

    /// Branch flows (p.u.) after the outage of branch `k`, which itself
    /// carries nothing.
    pub fn outage_flows(&self, k: usize) -> Result<Vec<f64>> {
        let theta = self.branch_outage(k)?;
        let mut flows = self.dc.branch_flows(&theta);
        flows[k] = 0.0;
        Ok(flows)
    }
}

/// Bus angles after the outage of branch `k`, by rebuilding and solving
/// the network without it.
pub fn rebuild_outage_angles(
    nc: &NumericCircuit,
    p_bus: &[f64],
    slack: usize,
    k: usize,
    lin_solver: &dyn LinearSolver,
) -> Result<Vec<f64>> {
    let mut post = nc.clone();
    post.branch.active[k] = false;
    let dc = make_b_dc(&post);
    let p: Vec<f64> = p_bus.iter().zip(&dc.pbusinj).map(|(p, inj)| p - inj).collect();
    let pvpq: Vec<usize> = (0..nc.nbus()).filter(|&i| i != slack).collect();
    let (theta, _) = dc_pf(&dc.bbus, &p, &vec![0.0; nc.nbus()], &[slack], &pvpq, lin_solver)?;
    Ok(theta)
}

/// Post-outage state of one branch contingency.
#[derive(Debug, Clone, Serialize)]
pub struct OutageResult {
    /// Outaged branch.
    pub branch: usize,
    /// Branch active power flows (MW).
    pub flows: Vec<f64>,
    /// Flow over rating.
    pub loading: Vec<f64>,
    /// Rated branches loaded beyond their rating.
    pub overloads: Vec<usize>,
}

/// Results of a batch of single branch outages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NMinusOneResults {
    /// Base case branch flows (MW).
    pub base_flows: Vec<f64>,
    pub outages: Vec<OutageResult>,
    /// Contingencies that could not be evaluated, by branch.
    #[serde(skip)]
    pub errors: Vec<(usize, PowerFlowError)>,
}

impl NMinusOneResults {
    /// Contingencies that overload at least one branch.
    pub fn critical(&self) -> impl Iterator<Item = &OutageResult> {
        self.outages.iter().filter(|o| !o.overloads.is_empty())
    }
}

/// Runs the single outage of every branch in `outages` on the DC network.
///
/// The network is factorized once. A contingency that cannot be evaluated
/// (an outage that islands part of the network, an unknown branch) is
/// recorded in `errors` and the batch carries on.
pub fn n_minus_1(
    nc: &NumericCircuit,
    p_bus: &[f64],
    slack: usize,
    outages: &[usize],
    lin_solver: &dyn LinearSolver,
) -> Result<NMinusOneResults> {
    let sm = ShermanMorrison::new(nc, p_bus, slack, lin_solver)?;
    let sbase = nc.sbase;
    let rate = &nc.branch.rate;

    let mut res = NMinusOneResults {
        base_flows: sm.base_flows().iter().map(|p| p * sbase).collect(),
        ..Default::default()
    };
    for &k in outages {
        let flows = match sm.outage_flows(k) {
            Ok(flows) => flows,
            Err(err) => {
                log::warn!("contingency {}: {}", k, err);
                res.errors.push((k, err));
                continue;
            }
        };
        let loading: Vec<f64> = flows
            .iter()
            .zip(rate)
            .map(|(p, r)| p / (r + 1e-9))
            .collect();
        let overloads = (0..flows.len())
            .filter(|&l| rate[l] > 0.0 && loading[l].abs() > 1.0)
            .collect();
        res.outages.push(OutageResult {
            branch: k,
            flows: flows.iter().map(|p| p * sbase).collect(),
            loading,
            overloads,
        });
    }
    log::info!(
        "N-1: {} contingencies, {} not evaluated, {} with overloads",
        outages.len(),
        res.errors.len(),
        res.critical().count()
    );
    Ok(res)
}
