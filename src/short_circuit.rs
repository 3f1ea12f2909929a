use crate::circuit::NumericCircuit;
use crate::error::{PowerFlowError, Result};
use crate::sparse::{csc_from_triplets, spmv};
use crate::traits::LinearSolver;
use crate::ybus::make_ybus;
use num_complex::Complex64;
use serde::Serialize;

/// Balanced three phase fault results. Powers in MVA, the rest in p.u.
#[derive(Debug, Clone, Serialize)]
pub struct ShortCircuitResults {
    /// Faulted bus.
    pub bus: usize,
    /// Current flowing into the fault.
    pub fault_current: Complex64,
    /// Short circuit power `|Vpre| * |If|` at the faulted bus.
    pub sc_power: f64,
    /// Post-fault bus voltages.
    pub voltage: Vec<Complex64>,
    pub sf: Vec<Complex64>,
    pub st: Vec<Complex64>,
    #[serde(rename = "if")]
    pub if_: Vec<Complex64>,
    pub it: Vec<Complex64>,
    pub vbranch: Vec<Complex64>,
    pub loading: Vec<f64>,
    pub losses: Vec<Complex64>,
}

/// Three phase short circuit at bus `bus` through the fault impedance `zf`.
///
/// The network is grounded through the source admittances `y_source`
/// (generator sub-transient admittances, positive sequence) added to the
/// Ybus diagonal. Only column `bus` of `Zbus = Ybus^-1` is needed:
///
/// ```text
///  If = Vpre[bus] / (Zbus[bus,bus] + zf)
///  V  = Vpre - Zbus[:,bus] * If
/// ```
///
/// The complex system is rotated by `-j`, which puts the susceptances on
/// the diagonal, and solved in its real form
///
/// ```text
///  | B   G | | zr |   |  0   |
///  | -G  B | | zi | = | -e_k |
/// ```
pub fn short_circuit_3p(
    nc: &NumericCircuit,
    v_pre: &[Complex64],
    y_source: &[Complex64],
    bus: usize,
    zf: Complex64,
    lin_solver: &dyn LinearSolver,
) -> Result<ShortCircuitResults> {
    nc.validate()?;
    let nb = nc.nbus();
    for (what, len) in [("pre-fault voltage", v_pre.len()), ("source admittance", y_source.len())] {
        if len != nb {
            return Err(PowerFlowError::DimensionMismatch {
                what,
                expected: nb,
                found: len,
            });
        }
    }
    if bus >= nb {
        return Err(PowerFlowError::InvalidOption(format!(
            "fault bus {} out of range for {} buses",
            bus, nb
        )));
    }

    let ys = make_ybus(nc);
    let mut entries = Vec::with_capacity(4 * (ys.ybus.nnz() + nb));
    let mut push = |i: usize, j: usize, y: Complex64| {
        let y = y * Complex64::new(0.0, -1.0);
        entries.push((i, j, y.re));
        entries.push((i, j + nb, -y.im));
        entries.push((i + nb, j, y.im));
        entries.push((i + nb, j + nb, y.re));
    };
    for (&y, (i, j)) in ys.ybus.iter() {
        push(i, j, y);
    }
    for (k, &y) in y_source.iter().enumerate() {
        push(k, k, y);
    }
    let a = csc_from_triplets((2 * nb, 2 * nb), &entries);

    let mut e = vec![0.0; 2 * nb];
    e[bus + nb] = -1.0;
    let x = lin_solver.solve(&a, &e)?;
    let z_col: Vec<Complex64> = (0..nb).map(|k| Complex64::new(x[k], x[k + nb])).collect();

    let z_th = z_col[bus] + zf;
    if z_th.norm() == 0.0 {
        return Err(PowerFlowError::Singular(format!(
            "zero Thevenin impedance at bus {}",
            bus
        )));
    }
    let fault_current = v_pre[bus] / z_th;
    let voltage: Vec<Complex64> = v_pre
        .iter()
        .zip(&z_col)
        .map(|(v, z)| v - z * fault_current)
        .collect();
    let sc_power = v_pre[bus].norm() * fault_current.norm() * nc.sbase;
    log::info!(
        "3ph fault at bus {}: |If| = {:.4} p.u., Ssc = {:.2} MVA",
        bus,
        fault_current.norm(),
        sc_power
    );

    let br = &nc.branch;
    let if_ = spmv(&ys.yf, &voltage);
    let it = spmv(&ys.yt, &voltage);
    let nl = nc.nbr();
    let mut res = ShortCircuitResults {
        bus,
        fault_current,
        sc_power,
        voltage,
        sf: vec![Complex64::default(); nl],
        st: vec![Complex64::default(); nl],
        if_: Vec::new(),
        it: Vec::new(),
        vbranch: vec![Complex64::default(); nl],
        loading: vec![0.0; nl],
        losses: vec![Complex64::default(); nl],
    };
    for k in 0..nl {
        let (vf, vt) = (res.voltage[br.f[k]], res.voltage[br.t[k]]);
        let sf = vf * if_[k].conj() * nc.sbase;
        let st = vt * it[k].conj() * nc.sbase;
        res.sf[k] = sf;
        res.st[k] = st;
        res.losses[k] = sf + st;
        res.vbranch[k] = vf - vt;
        res.loading[k] = sf.re / (br.rate[k] * nc.sbase + 1e-9);
    }
    res.if_ = if_;
    res.it = it;
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::BusMode;
    use crate::cmplx;
    use crate::linsolve::SolverBackend;
    use approx::assert_abs_diff_eq;

    /// Source behind j0.2 feeding a line of j0.1.
    fn feeder() -> (NumericCircuit, Vec<Complex64>) {
        let mut nc = NumericCircuit {
            sbase: 100.0,
            ..Default::default()
        };
        nc.push_bus(BusMode::Slack, 1.0, cmplx!());
        nc.push_bus(BusMode::PQ, 1.0, cmplx!());
        nc.branch.push_line(0, 1, 0.0, 0.1, 0.0, 1.0);
        let y_source = vec![cmplx!(1.0) / cmplx!(0.0, 0.2), cmplx!()];
        (nc, y_source)
    }

    #[test]
    fn bolted_fault() {
        let (nc, y_source) = feeder();
        let v = vec![cmplx!(1.0); 2];
        let solver = SolverBackend::SparseLu.build();
        let res = short_circuit_3p(&nc, &v, &y_source, 1, cmplx!(), solver.as_ref()).unwrap();

        // Zth = j0.3
        assert_abs_diff_eq!(res.fault_current.re, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(res.fault_current.im, -1.0 / 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(res.sc_power, 100.0 / 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(res.voltage[1].norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(res.voltage[0].re, 1.0 / 3.0, epsilon = 1e-12);
        // the whole fault current comes down the line
        assert_abs_diff_eq!((res.if_[0] - res.fault_current).norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn fault_impedance_limits_current() {
        let (nc, y_source) = feeder();
        let v = vec![cmplx!(1.0); 2];
        let solver = SolverBackend::DenseLu.build();
        let res =
            short_circuit_3p(&nc, &v, &y_source, 1, cmplx!(0.0, 0.1), solver.as_ref()).unwrap();
        assert_abs_diff_eq!(res.fault_current.norm(), 2.5, epsilon = 1e-9);
        assert_abs_diff_eq!(res.voltage[1].norm(), 0.25, epsilon = 1e-9);
    }

    #[test]
    fn rejects_bad_inputs() {
        let (nc, y_source) = feeder();
        let solver = SolverBackend::SparseLu.build();
        let v = vec![cmplx!(1.0); 2];
        assert!(matches!(
            short_circuit_3p(&nc, &v[..1], &y_source, 1, cmplx!(), solver.as_ref()),
            Err(PowerFlowError::DimensionMismatch { .. })
        ));
        assert!(short_circuit_3p(&nc, &v, &y_source, 2, cmplx!(), solver.as_ref()).is_err());
    }
}
