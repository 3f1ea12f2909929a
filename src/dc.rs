use crate::circuit::NumericCircuit;
use crate::error::Result;
use crate::math::{norm_inf, select as gather};
use crate::sparse::{csc_from_triplets, select, spmv, spmv_t};
use crate::traits::LinearSolver;
use sprs::CsMat;

/// Matrices of the linearized (DC) network model.
///
/// The bus real power injections are related to bus voltage angles by
///
/// ```text
///  P = Bbus * Va + Pbusinj
/// ```
///
/// and the real power flows at the from end of the branches by
///
/// ```text
///  Pf = Bf * Va + Pfinj
/// ```
#[derive(Debug, Clone)]
pub struct DcSystem {
    pub bbus: CsMat<f64>,
    pub bf: CsMat<f64>,
    /// Connection matrix `Cf - Ct`.
    pub cft: CsMat<f64>,
    pub pbusinj: Vec<f64>,
    pub pfinj: Vec<f64>,
}

/// Series susceptance of each branch, zero when out of service.
pub fn branch_susceptance(nc: &NumericCircuit) -> Vec<f64> {
    let br = &nc.branch;
    (0..nc.nbr())
        .map(|k| {
            if !br.active[k] || br.x[k] == 0.0 {
                return 0.0;
            }
            let tap = if br.tap_module[k] == 0.0 {
                1.0
            } else {
                br.tap_module[k]
            };
            1.0 / br.x[k] / tap
        })
        .collect()
}

/// Builds the B matrices and phase shift injections for DC power flow.
pub fn make_b_dc(nc: &NumericCircuit) -> DcSystem {
    let (nb, nl) = (nc.nbus(), nc.nbr());
    let b = branch_susceptance(nc);

    let mut b_f = Vec::with_capacity(2 * nl);
    let mut c_ft = Vec::with_capacity(2 * nl);
    let mut b_bus = Vec::with_capacity(4 * nl);
    for (k, &bk) in b.iter().enumerate() {
        let (f, t) = (nc.branch.f[k], nc.branch.t[k]);

        b_f.push((k, f, bk));
        b_f.push((k, t, -bk));

        c_ft.push((k, f, 1.0));
        c_ft.push((k, t, -1.0));

        // Bbus = Cft^T * Bf
        b_bus.push((f, f, bk));
        b_bus.push((f, t, -bk));
        b_bus.push((t, f, -bk));
        b_bus.push((t, t, bk));
    }
    let cft = csc_from_triplets((nl, nb), &c_ft);

    // injected at the from bus and extracted at the to bus
    let pfinj: Vec<f64> = b
        .iter()
        .zip(&nc.branch.tap_angle)
        .map(|(bk, shift)| -bk * shift)
        .collect();
    let pbusinj = spmv_t(&cft, &pfinj);

    DcSystem {
        bbus: csc_from_triplets((nb, nb), &b_bus),
        bf: csc_from_triplets((nl, nb), &b_f),
        cft,
        pbusinj,
        pfinj,
    }
}

impl DcSystem {
    /// Branch active power flows (p.u.) for the angles `va`.
    pub fn branch_flows(&self, va: &[f64]) -> Vec<f64> {
        spmv(&self.bf, va)
            .iter()
            .zip(&self.pfinj)
            .map(|(p, inj)| p + inj)
            .collect()
    }
}

/// Solves a DC power flow.
///
/// Solves for the bus voltage angles at all but the reference buses,
/// given the full system B matrix, the vector of bus real power
/// injections, the initial vector of bus voltage angles (in radians), and
/// the lists of reference and non-reference bus indices. Returns the
/// angles in radians and a success flag.
pub fn dc_pf(
    b_mat: &CsMat<f64>,
    p_bus: &[f64],
    va0: &[f64],
    ref_: &[usize],
    pvpq: &[usize],
    lin_solver: &dyn LinearSolver,
) -> Result<(Vec<f64>, bool)> {
    let va_threshold = 1e5; // arbitrary threshold on |Va| for declaring failure

    let mut va = va0.to_vec();

    // Va[pvpq] = B[pvpq,pvpq] \ (Pbus[pvpq] - B[pvpq,ref] * Va0[ref])
    let b_pvpq = select(b_mat, pvpq, pvpq);
    let b_ref = select(b_mat, pvpq, ref_);
    let p_ref = spmv(&b_ref, &gather(va0, ref_));
    let rhs: Vec<f64> = pvpq
        .iter()
        .zip(&p_ref)
        .map(|(&i, p)| p_bus[i] - p)
        .collect();

    let va_pvpq = lin_solver.solve(&b_pvpq, &rhs)?;
    pvpq.iter().zip(&va_pvpq).for_each(|(&i, &a)| va[i] = a);

    let success = norm_inf(&va) <= va_threshold;
    Ok((va, success))
}
