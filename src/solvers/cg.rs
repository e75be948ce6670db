//! Conjugate gradients for symmetric positive (semi-)definite operators
//!
//! Singular operators are fine as long as the system is consistent: the
//! iterates then stay in the operator's range and converge to a solution.

/// Solve `A x = b` with `A` given as a closure computing `A v`
///
/// Stops when `||b - A x|| <= tol * ||b||` or after `max_iter` iterations.
/// Returns the solution and the number of iterations run.
pub fn cg_solve<F>(a_op: F, b: &[f64], x0: &[f64], tol: f64, max_iter: usize) -> (Vec<f64>, usize)
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let dot = |u: &[f64], v: &[f64]| u.iter().zip(v).map(|(a, b)| a * b).sum::<f64>();

    let mut x = x0.to_vec();
    let mut r: Vec<f64> = b.iter().zip(a_op(&x)).map(|(bi, axi)| bi - axi).collect();
    let mut p = r.clone();
    let mut rs = dot(&r, &r);
    let threshold = tol * dot(b, b).sqrt();

    if rs.sqrt() <= threshold {
        return (x, 0);
    }

    for iter in 1..=max_iter {
        let ap = a_op(&p);
        let pap = dot(&p, &ap);
        if pap.abs() < 1e-30 {
            return (x, iter);
        }
        let alpha = rs / pap;
        for ((xi, ri), (pi, api)) in x.iter_mut().zip(r.iter_mut()).zip(p.iter().zip(&ap)) {
            *xi += alpha * pi;
            *ri -= alpha * api;
        }

        let rs_new = dot(&r, &r);
        if rs_new.sqrt() <= threshold {
            return (x, iter);
        }
        let beta = rs_new / rs;
        for (pi, ri) in p.iter_mut().zip(&r) {
            *pi = ri + beta * *pi;
        }
        rs = rs_new;
    }

    (x, max_iter)
}
