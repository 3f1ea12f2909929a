use crate::circuit::NumericCircuit;
use crate::error::{PowerFlowError, Result};
use crate::mpopt::Alg;
use crate::sparse::csc_from_triplets;
use num_complex::Complex64;
use sprs::CsMat;

/// Admittance matrices of one island.
///
/// `ybus` relates bus voltages to bus current injections. `yf` and `yt`
/// give the branch currents injected at the "from" and "to" ends, and
/// `cf`/`ct` are the branch-bus incidence matrices of both ends.
#[derive(Debug, Clone)]
pub struct AdmittanceSystem {
    pub ybus: CsMat<Complex64>,
    pub yf: CsMat<Complex64>,
    pub yt: CsMat<Complex64>,
    pub cf: CsMat<f64>,
    pub ct: CsMat<f64>,
}

fn check_shape(what: &'static str, shape: (usize, usize), expected: (usize, usize)) -> Result<()> {
    if shape.0 != expected.0 {
        return Err(PowerFlowError::DimensionMismatch {
            what,
            expected: expected.0,
            found: shape.0,
        });
    }
    if shape.1 != expected.1 {
        return Err(PowerFlowError::DimensionMismatch {
            what,
            expected: expected.1,
            found: shape.1,
        });
    }
    Ok(())
}

impl AdmittanceSystem {
    /// Wraps externally built matrices after checking their shapes.
    pub fn new(
        ybus: CsMat<Complex64>,
        yf: CsMat<Complex64>,
        yt: CsMat<Complex64>,
        cf: CsMat<f64>,
        ct: CsMat<f64>,
    ) -> Result<Self> {
        let n = ybus.rows();
        let m = yf.rows();
        check_shape("ybus", ybus.shape(), (n, n))?;
        check_shape("yf", yf.shape(), (m, n))?;
        check_shape("yt", yt.shape(), (m, n))?;
        check_shape("cf", cf.shape(), (m, n))?;
        check_shape("ct", ct.shape(), (m, n))?;
        Ok(AdmittanceSystem { ybus, yf, yt, cf, ct })
    }

    pub fn nbus(&self) -> usize {
        self.ybus.rows()
    }

    pub fn nbr(&self) -> usize {
        self.yf.rows()
    }
}

/// Builds the bus admittance matrix and branch admittance matrices.
///
/// For each branch, compute the elements of the branch admittance matrix where
///
/// ```text
///   | If |   | Yff  Yft |   | Vf |
///   |    | = |          | * |    |
///   | It |   | Ytf  Ytt |   | Vt |
/// ```
///
/// Out-of-service branches contribute nothing but keep their rows.
pub fn make_ybus(nc: &NumericCircuit) -> AdmittanceSystem {
    let nb = nc.nbus();
    let nl = nc.nbr();
    let br = &nc.branch;

    let mut y_bus = Vec::with_capacity(4 * nl + nb);
    let mut y_f = Vec::with_capacity(2 * nl);
    let mut y_t = Vec::with_capacity(2 * nl);
    let mut c_f = Vec::with_capacity(nl);
    let mut c_t = Vec::with_capacity(nl);

    for k in 0..nl {
        let (y_s, b_c) = if br.active[k] {
            (
                Complex64::new(1.0, 0.0) / Complex64::new(br.r[k], br.x[k]),
                br.b[k],
            )
        } else {
            (Complex64::default(), 0.0)
        };
        let m = if br.tap_module[k] == 0.0 {
            1.0
        } else {
            br.tap_module[k]
        };
        let tap = Complex64::from_polar(m, br.tap_angle[k]);

        let y_tt = y_s + Complex64::new(0.0, b_c / 2.0);
        let y_ff = y_tt / (tap * tap.conj());
        let y_ft = -y_s / tap.conj();
        let y_tf = -y_s / tap;

        let (f, t) = (br.f[k], br.t[k]);

        y_f.push((k, f, y_ff));
        y_f.push((k, t, y_ft));
        y_t.push((k, f, y_tf));
        y_t.push((k, t, y_tt));

        y_bus.push((f, f, y_ff));
        y_bus.push((f, t, y_ft));
        y_bus.push((t, f, y_tf));
        y_bus.push((t, t, y_tt));

        c_f.push((k, f, 1.0));
        c_t.push((k, t, 1.0));
    }

    for (i, &y_sh) in nc.bus.shunt.iter().enumerate() {
        y_bus.push((i, i, y_sh));
    }

    AdmittanceSystem {
        ybus: csc_from_triplets((nb, nb), &y_bus),
        yf: csc_from_triplets((nl, nb), &y_f),
        yt: csc_from_triplets((nl, nb), &y_t),
        cf: csc_from_triplets((nl, nb), &c_f),
        ct: csc_from_triplets((nl, nb), &c_t),
    }
}

/// Builds the two matrices B prime and B double prime used in the fast
/// decoupled power flow.
///
/// B′ ignores shunts, line charging and tap magnitudes (and resistance for
/// the XB variant); B″ ignores phase shifters (and resistance for the BX
/// variant).
pub fn make_b_fd(nc: &NumericCircuit, alg: Alg) -> (CsMat<f64>, CsMat<f64>) {
    let mut base = nc.clone();
    base.bus.shunt.iter_mut().for_each(|y| *y = Complex64::default());

    let b_p = {
        let mut nc_p = base.clone();
        let br = &mut nc_p.branch;
        br.b.iter_mut().for_each(|b| *b = 0.0);
        br.tap_module.iter_mut().for_each(|m| *m = 1.0);
        if alg == Alg::FDXB {
            br.r.iter_mut().for_each(|r| *r = 0.0);
        }
        make_ybus(&nc_p).ybus.map(|y| -y.im)
    };

    let b_pp = {
        let mut nc_pp = base;
        let br = &mut nc_pp.branch;
        br.tap_angle.iter_mut().for_each(|a| *a = 0.0);
        if alg == Alg::FDBX {
            br.r.iter_mut().for_each(|r| *r = 0.0);
        }
        make_ybus(&nc_pp).ybus.map(|y| -y.im)
    };

    (b_p, b_pp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::BusMode;
    use crate::cmplx;
    use crate::sparse::to_dense;
    use approx::assert_abs_diff_eq;

    fn two_bus() -> NumericCircuit {
        let mut nc = NumericCircuit {
            sbase: 100.0,
            ..Default::default()
        };
        nc.push_bus(BusMode::Slack, 1.0, cmplx!());
        nc.push_bus(BusMode::PQ, 1.0, cmplx!(-0.5));
        nc.branch.push_line(0, 1, 0.0, 0.5, 0.2, 1.0);
        nc
    }

    #[test]
    fn pi_model_stamp() {
        let ys = make_ybus(&two_bus());
        let y = to_dense(&ys.ybus);
        assert_abs_diff_eq!(y[0][0].im, -2.0 + 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(y[0][1].im, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y[1][0].im, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y[1][1].im, -2.0 + 0.1, epsilon = 1e-12);
    }

    #[test]
    fn ybus_is_sum_of_branch_rows() {
        // Ybus = Cf^T·Yf + Ct^T·Yt (+ shunts)
        let mut nc = two_bus();
        nc.branch.tap_module[0] = 1.05;
        nc.branch.tap_angle[0] = 0.1;
        let ys = make_ybus(&nc);
        let y = to_dense(&ys.ybus);
        let yf = to_dense(&ys.yf);
        let yt = to_dense(&ys.yt);
        for j in 0..2 {
            assert!((y[0][j] - yf[0][j]).norm() < 1e-12);
            assert!((y[1][j] - yt[0][j]).norm() < 1e-12);
        }
    }

    #[test]
    fn out_of_service_branch_is_empty() {
        let mut nc = two_bus();
        nc.branch.active[0] = false;
        let ys = make_ybus(&nc);
        assert!(ys.ybus.iter().all(|(v, _)| v.norm() == 0.0));
        assert_eq!(ys.cf.get(0, 0), Some(&1.0));
    }

    #[test]
    fn shapes_are_checked() {
        let ys = make_ybus(&two_bus());
        let err = AdmittanceSystem::new(ys.ybus, ys.yf, ys.yt.transpose_into(), ys.cf, ys.ct);
        assert!(err.is_err());
    }

    #[test]
    fn fd_matrices_drop_charging() {
        let (bp, bpp) = make_b_fd(&two_bus(), Alg::FDXB);
        let bp = to_dense(&bp);
        let bpp = to_dense(&bpp);
        assert_abs_diff_eq!(bp[0][0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(bpp[0][0], 2.0 - 0.1, epsilon = 1e-12);
    }
}
