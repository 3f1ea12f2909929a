use crate::bus_types::BusState;
use num_complex::Complex64;
use pretty_dtoa::{dtoa, FmtFloatConfig};

const FLOAT_CONFIG: FmtFloatConfig = FmtFloatConfig::default()
    .add_point_zero(false)
    .max_significant_digits(6);

fn join<T>(v: &[T], f: impl Fn(&T) -> String) -> String {
    let a: Vec<String> = v.iter().map(f).collect();
    format!("[{}]", a.join(", "))
}

/// Magnitude and angle (degrees) of each element.
pub fn format_polar_vec(v: &[Complex64]) -> String {
    join(v, |z| {
        format!(
            "{}\u{2220}{}\u{00B0}",
            dtoa(z.norm(), FLOAT_CONFIG),
            dtoa(z.arg().to_degrees(), FLOAT_CONFIG)
        )
    })
}

pub fn format_states(v: &[BusState]) -> String {
    join(v, |s| s.code().to_string())
}
