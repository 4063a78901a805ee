//! Kernel functions for the one-class SVM.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelType {
    Linear,
    Poly,
    Rbf,
    Sigmoid,
}

impl std::str::FromStr for KernelType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "poly" | "polynomial" => Ok(Self::Poly),
            "rbf" | "gaussian" => Ok(Self::Rbf),
            "sigmoid" => Ok(Self::Sigmoid),
            _ => Err(ModelError::InvalidParameter {
                name: "kernel",
                reason: format!("unknown kernel '{}'", s),
            }),
        }
    }
}

impl std::fmt::Display for KernelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Poly => write!(f, "poly"),
            Self::Rbf => write!(f, "rbf"),
            Self::Sigmoid => write!(f, "sigmoid"),
        }
    }
}

/// Kernel coefficient, resolved against the training data at fit time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Gamma {
    /// `1 / (n_features * var(X))`
    #[default]
    Scale,
    /// `1 / n_features`
    Auto,
    Value(f64),
}

impl Gamma {
    pub fn resolve(&self, x: &Array2<f64>) -> f64 {
        let n_features = x.ncols().max(1) as f64;
        match self {
            Self::Scale => {
                let var = x.var(0.0);
                if var > 0.0 {
                    1.0 / (n_features * var)
                } else {
                    1.0
                }
            }
            Self::Auto => 1.0 / n_features,
            Self::Value(v) => *v,
        }
    }
}

impl std::str::FromStr for Gamma {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scale" => Ok(Self::Scale),
            "auto" => Ok(Self::Auto),
            other => match other.parse::<f64>() {
                Ok(v) if v > 0.0 => Ok(Self::Value(v)),
                _ => Err(ModelError::InvalidParameter {
                    name: "gamma",
                    reason: format!("expected 'scale', 'auto' or a positive number, got '{}'", s),
                }),
            },
        }
    }
}

impl std::fmt::Display for Gamma {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scale => write!(f, "scale"),
            Self::Auto => write!(f, "auto"),
            Self::Value(v) => write!(f, "{}", v),
        }
    }
}

/// A kernel with its coefficients resolved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub kind: KernelType,
    pub gamma: f64,
    pub degree: u32,
    pub coef0: f64,
}

impl Kernel {
    pub fn eval(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        match self.kind {
            KernelType::Linear => a.dot(&b),
            KernelType::Poly => (self.gamma * a.dot(&b) + self.coef0).powi(self.degree as i32),
            KernelType::Rbf => {
                let dist2: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
                (-self.gamma * dist2).exp()
            }
            KernelType::Sigmoid => (self.gamma * a.dot(&b) + self.coef0).tanh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};

    use super::*;

    fn kernel(kind: KernelType) -> Kernel {
        Kernel {
            kind,
            gamma: 0.5,
            degree: 2,
            coef0: 1.0,
        }
    }

    #[test]
    fn test_kernel_values() {
        let a = array![1.0, 2.0];
        let b = array![3.0, 0.0];

        assert_eq!(kernel(KernelType::Linear).eval(a.view(), b.view()), 3.0);
        // (0.5 * 3 + 1)^2
        assert!((kernel(KernelType::Poly).eval(a.view(), b.view()) - 6.25).abs() < 1e-12);
        // exp(-0.5 * (4 + 4))
        assert!((kernel(KernelType::Rbf).eval(a.view(), b.view()) - (-4.0f64).exp()).abs() < 1e-12);
        assert!((kernel(KernelType::Sigmoid).eval(a.view(), b.view()) - 2.5f64.tanh()).abs() < 1e-12);
        assert_eq!(kernel(KernelType::Rbf).eval(a.view(), a.view()), 1.0);
    }

    #[test]
    fn test_gamma_resolution() {
        let x = array![[0.0, 2.0], [2.0, 0.0]];
        // Population variance of {0, 2, 2, 0} is 1
        assert!((Gamma::Scale.resolve(&x) - 0.5).abs() < 1e-12);
        assert!((Gamma::Auto.resolve(&x) - 0.5).abs() < 1e-12);
        assert_eq!(Gamma::Value(3.0).resolve(&x), 3.0);

        let constant = Array2::<f64>::ones((3, 2));
        assert_eq!(Gamma::Scale.resolve(&constant), 1.0);
    }

    #[test]
    fn test_parse_kernel_and_gamma() {
        assert_eq!("RBF".parse::<KernelType>().unwrap(), KernelType::Rbf);
        assert!("cubic".parse::<KernelType>().is_err());
        assert_eq!("scale".parse::<Gamma>().unwrap(), Gamma::Scale);
        assert_eq!("0.25".parse::<Gamma>().unwrap(), Gamma::Value(0.25));
        assert!("-1".parse::<Gamma>().is_err());
    }
}
