// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::bigint::{BigInt, ParseBigIntError};

/// Fixed-point precision (in bits) used for math in this module.
pub const PRECISION: u64 = 128;

/// Parses a string to a BigInt. Precision is dependent on the inputs to this function.
pub fn poly_parse(coefs: &[&str]) -> Result<Vec<BigInt>, ParseBigIntError> {
    coefs.iter().map(|c| c.parse()).collect()
}

/// Evaluates a polynomial with the given coefficients (in descending order of
/// degree) at x using Horner's rule. Coefficients and argument are Q.128 format;
/// the result is Q.128.
pub fn poly_val(poly: &[BigInt], x: &BigInt) -> BigInt {
    let mut res = BigInt::default();

    for coef in poly {
        res = ((res * x) >> PRECISION) + coef;
    }
    res
}
