// Copyright (c) 2022-2024, Richard Lincoln. All rights reserved.

use num_complex::Complex64;

#[macro_export]
macro_rules! cmplx {
    () => {
        num_complex::Complex64::new(0.0, 0.0)
    };
    ($arg1:expr) => {
        num_complex::Complex64::new($arg1, 0.0)
    };
    ($arg1:expr, $arg2:expr) => {
        num_complex::Complex64::new($arg1, $arg2)
    };
}

/// Computes the infinity norm: `max(abs(a))`. Zero for an empty slice.
pub fn norm_inf(a: &[f64]) -> f64 {
    a.iter().fold(0.0, |max, v| {
        let abs = v.abs();
        // NaN must propagate so that a diverged solve never looks converged
        if abs.is_nan() || abs > max {
            abs
        } else {
            max
        }
    })
}

/// Returns the 2-norm (Euclidean) of `a`.
pub fn norm(a: &[f64]) -> f64 {
    a.iter().map(|v| v * v).sum::<f64>().sqrt()
}

pub fn vm(v: &[Complex64]) -> Vec<f64> {
    v.iter().map(|v| v.norm()).collect()
}

pub fn va(v: &[Complex64]) -> Vec<f64> {
    v.iter().map(|v| v.arg()).collect()
}

pub fn polar(vm: &[f64], va: &[f64]) -> Vec<Complex64> {
    vm.iter()
        .zip(va)
        .map(|(&m, &a)| Complex64::from_polar(m, a))
        .collect()
}

/// Gathers `a[idx]`.
pub fn select<T: Copy>(a: &[T], idx: &[usize]) -> Vec<T> {
    idx.iter().map(|&i| a[i]).collect()
}
