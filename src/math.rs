use std::ops::Index;

use elliptic_curve::Field;
use k256::Scalar;
use rand_core::CryptoRngCore;

/// Represents a polynomial with coefficients in the scalar field of the curve.
///
/// A polynomial with `threshold + 1` coefficients is what secret shares are
/// evaluations of: any `threshold + 1` evaluations determine it, fewer reveal
/// nothing about its constant term.
#[derive(Debug, Clone)]
pub struct Polynomial {
    /// The coefficients of our polynomial, from 0..size-1.
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Generate a random polynomial with a certain number of coefficients.
    pub fn random(rng: &mut impl CryptoRngCore, size: usize) -> Self {
        let coefficients = (0..size).map(|_| Scalar::random(&mut *rng)).collect();
        Self { coefficients }
    }

    /// Extend a constant to a random polynomial of a certain size.
    ///
    /// This is useful if you want the polynomial to have a certain value, but
    /// otherwise be random.
    pub fn extend_random(rng: &mut impl CryptoRngCore, size: usize, constant: &Scalar) -> Self {
        let mut coefficients = Vec::with_capacity(size);
        coefficients.push(*constant);
        for _ in 1..size {
            coefficients.push(Scalar::random(&mut *rng));
        }
        Self { coefficients }
    }

    /// Evaluate this polynomial at 0.
    pub fn evaluate_zero(&self) -> Scalar {
        self.coefficients.first().copied().unwrap_or(Scalar::ZERO)
    }

    /// Evaluate this polynomial at a given point, using Horner's method.
    pub fn evaluate(&self, x: &Scalar) -> Scalar {
        let mut out = Scalar::ZERO;
        for c in self.coefficients.iter().rev() {
            out = out * x + c;
        }
        out
    }
}

impl Index<usize> for Polynomial {
    type Output = Scalar;

    fn index(&self, i: usize) -> &Self::Output {
        &self.coefficients[i]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rand_core::OsRng;

    #[test]
    fn test_evaluate_matches_definition() {
        let f = Polynomial::random(&mut OsRng, 3);
        let x = Scalar::from(7u64);
        let expected = f[0] + f[1] * x + f[2] * x * x;
        assert_eq!(f.evaluate(&x), expected);
        assert_eq!(f.evaluate(&Scalar::ZERO), f.evaluate_zero());
    }
}
