//! One-class SVM (nu formulation) trained with SMO.
//!
//! The dual problem is
//!
//! ```text
//! min  1/2 a'Qa    s.t.  0 <= a_i <= 1,  sum(a) = nu * l
//! ```
//!
//! with `Q_ij = K(x_i, x_j)`. Working pairs are chosen with second-order
//! selection and kernel rows are kept in an LRU cache. The decision value
//! of a sample is `sum_i a_i K(sv_i, x) - rho`; non-negative values are
//! inliers.

use std::num::NonZeroUsize;
use std::rc::Rc;

use lru::LruCache;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::kernel::{Gamma, Kernel, KernelType};
use super::NoveltyDetector;
use crate::error::ModelError;

const TAU: f64 = 1e-12;

/// Hyperparameters of [`OneClassSvm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcsvmParams {
    pub kernel: KernelType,
    /// Upper bound on the training outlier fraction, lower bound on the
    /// support vector fraction.
    pub nu: f64,
    pub gamma: Gamma,
    pub degree: u32,
    pub coef0: f64,
    /// Stopping tolerance on the KKT violation.
    pub tol: f64,
    /// Iteration cap. `None` uses `max(10_000_000, 100 * n_samples)`.
    pub max_iter: Option<usize>,
    /// Number of kernel rows kept in the LRU cache.
    pub cache_rows: usize,
    /// Recorded with the model. The solver itself is deterministic.
    pub random_state: u64,
}

impl Default for OcsvmParams {
    fn default() -> Self {
        Self {
            kernel: KernelType::Rbf,
            nu: 0.5,
            gamma: Gamma::Scale,
            degree: 3,
            coef0: 0.0,
            tol: 1e-3,
            max_iter: None,
            cache_rows: 512,
            random_state: 42,
        }
    }
}

impl OcsvmParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if !(self.nu > 0.0 && self.nu <= 1.0) {
            return Err(ModelError::InvalidParameter {
                name: "nu",
                reason: format!("must be in (0, 1], got {}", self.nu),
            });
        }
        if !(self.tol > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "tol",
                reason: format!("must be positive, got {}", self.tol),
            });
        }
        if let Gamma::Value(g) = self.gamma {
            if !(g > 0.0) {
                return Err(ModelError::InvalidParameter {
                    name: "gamma",
                    reason: format!("must be positive, got {}", g),
                });
            }
        }
        if self.max_iter == Some(0) {
            return Err(ModelError::InvalidParameter {
                name: "max_iter",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// State kept after fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedSvm {
    pub kernel: Kernel,
    pub support_vectors: Array2<f64>,
    pub dual_coef: Array1<f64>,
    pub rho: f64,
    pub n_features: usize,
    pub iterations: usize,
}

/// One-class support vector machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneClassSvm {
    params: OcsvmParams,
    fitted: Option<FittedSvm>,
}

impl OneClassSvm {
    pub const NAME: &'static str = "OCSVM";

    pub fn new(params: OcsvmParams) -> Result<Self, ModelError> {
        params.validate()?;
        Ok(Self {
            params,
            fitted: None,
        })
    }

    fn require_fitted(&self, x: &Array2<f64>) -> Result<&FittedSvm, ModelError> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| ModelError::NotFitted(Self::NAME.into()))?;
        if x.ncols() != fitted.n_features {
            return Err(ModelError::DimensionMismatch {
                expected: fitted.n_features,
                actual: x.ncols(),
            });
        }
        Ok(fitted)
    }

    /// `sum_i a_i K(sv_i, x)` for each row of `x`.
    fn kernel_sums(fitted: &FittedSvm, x: &Array2<f64>) -> Array1<f64> {
        x.outer_iter()
            .map(|row| {
                fitted
                    .support_vectors
                    .outer_iter()
                    .zip(fitted.dual_coef.iter())
                    .map(|(sv, a)| a * fitted.kernel.eval(sv, row))
                    .sum()
            })
            .collect()
    }
}

impl NoveltyDetector for OneClassSvm {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn fit(&mut self, x: &Array2<f64>) -> Result<(), ModelError> {
        self.params.validate()?;
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(ModelError::EmptyInput("training matrix"));
        }

        let kernel = Kernel {
            kind: self.params.kernel,
            gamma: self.params.gamma.resolve(x),
            degree: self.params.degree,
            coef0: self.params.coef0,
        };
        debug!(
            "Fitting {} on {}x{} (kernel={}, gamma={:.6}, nu={})",
            Self::NAME,
            x.nrows(),
            x.ncols(),
            kernel.kind,
            kernel.gamma,
            self.params.nu
        );

        let mut solver = Solver::new(x, kernel, &self.params);
        let solution = solver.solve();

        let sv_idx: Vec<usize> = solution
            .alpha
            .iter()
            .enumerate()
            .filter(|(_, a)| **a > 0.0)
            .map(|(i, _)| i)
            .collect();
        let support_vectors = x.select(Axis(0), &sv_idx);
        let dual_coef: Array1<f64> = sv_idx.iter().map(|&i| solution.alpha[i]).collect();

        info!(
            "{} fitted: {} support vectors of {} samples, rho={:.6}, {} iterations",
            Self::NAME,
            sv_idx.len(),
            x.nrows(),
            solution.rho,
            solution.iterations
        );

        self.fitted = Some(FittedSvm {
            kernel,
            support_vectors,
            dual_coef,
            rho: solution.rho,
            n_features: x.ncols(),
            iterations: solution.iterations,
        });
        Ok(())
    }

    fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        let fitted = self.require_fitted(x)?;
        Ok(Self::kernel_sums(fitted, x) - fitted.rho)
    }

    fn score_samples(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        let fitted = self.require_fitted(x)?;
        Ok(Self::kernel_sums(fitted, x))
    }

    fn n_features(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.n_features)
    }
}

struct Solution {
    alpha: Vec<f64>,
    rho: f64,
    iterations: usize,
}

/// SMO state for the one-class dual. Every label is +1 and every upper
/// bound is 1.
struct Solver<'a> {
    x: &'a Array2<f64>,
    kernel: Kernel,
    cache: LruCache<usize, Rc<Vec<f64>>>,
    diag: Vec<f64>,
    alpha: Vec<f64>,
    grad: Vec<f64>,
    tol: f64,
    max_iter: usize,
}

impl<'a> Solver<'a> {
    fn new(x: &'a Array2<f64>, kernel: Kernel, params: &OcsvmParams) -> Self {
        let l = x.nrows();
        let cache_rows = NonZeroUsize::new(params.cache_rows.max(2)).unwrap_or(NonZeroUsize::MIN);
        let diag = x.outer_iter().map(|row| kernel.eval(row, row)).collect();

        // floor(nu * l) variables start at the bound, one more takes the remainder
        let total = params.nu * l as f64;
        let n_full = (total.floor() as usize).min(l);
        let mut alpha = vec![0.0; l];
        for a in alpha.iter_mut().take(n_full) {
            *a = 1.0;
        }
        if n_full < l {
            alpha[n_full] = total - n_full as f64;
        }

        let max_iter = params
            .max_iter
            .unwrap_or_else(|| 10_000_000usize.max(l.saturating_mul(100)));

        let mut solver = Self {
            x,
            kernel,
            cache: LruCache::new(cache_rows),
            diag,
            alpha,
            grad: vec![0.0; l],
            tol: params.tol,
            max_iter,
        };
        solver.init_gradient();
        solver
    }

    fn row(&mut self, i: usize) -> Rc<Vec<f64>> {
        if let Some(row) = self.cache.get(&i) {
            return Rc::clone(row);
        }
        let xi = self.x.row(i);
        let row: Rc<Vec<f64>> = Rc::new(
            self.x
                .outer_iter()
                .map(|xj: ArrayView1<f64>| self.kernel.eval(xi, xj))
                .collect(),
        );
        self.cache.put(i, Rc::clone(&row));
        row
    }

    fn init_gradient(&mut self) {
        for i in 0..self.alpha.len() {
            let a = self.alpha[i];
            if a > 0.0 {
                let q = self.row(i);
                for (g, qk) in self.grad.iter_mut().zip(q.iter()) {
                    *g += a * qk;
                }
            }
        }
    }

    /// Second-order working-set selection. `None` when optimal within `tol`.
    fn select_working_set(&mut self) -> Option<(usize, usize)> {
        let mut gmax = f64::NEG_INFINITY;
        let mut i_sel = None;
        for (t, (&a, &g)) in self.alpha.iter().zip(self.grad.iter()).enumerate() {
            if a < 1.0 && -g >= gmax {
                gmax = -g;
                i_sel = Some(t);
            }
        }
        let i = i_sel?;
        let qi = self.row(i);

        let mut gmax2 = f64::NEG_INFINITY;
        let mut j_sel = None;
        let mut obj_min = f64::INFINITY;
        for (j, (&a, &g)) in self.alpha.iter().zip(self.grad.iter()).enumerate() {
            if a <= 0.0 {
                continue;
            }
            if g >= gmax2 {
                gmax2 = g;
            }
            let grad_diff = gmax + g;
            if grad_diff > 0.0 {
                let mut quad = self.diag[i] + self.diag[j] - 2.0 * qi[j];
                if quad <= 0.0 {
                    quad = TAU;
                }
                let obj = -(grad_diff * grad_diff) / quad;
                if obj <= obj_min {
                    obj_min = obj;
                    j_sel = Some(j);
                }
            }
        }

        if gmax + gmax2 < self.tol {
            return None;
        }
        j_sel.map(|j| (i, j))
    }

    fn update_pair(&mut self, i: usize, j: usize) {
        let qi = self.row(i);
        let qj = self.row(j);

        let old_i = self.alpha[i];
        let old_j = self.alpha[j];

        let mut quad = self.diag[i] + self.diag[j] - 2.0 * qi[j];
        if quad <= 0.0 {
            quad = TAU;
        }
        let delta = (self.grad[i] - self.grad[j]) / quad;
        let sum = old_i + old_j;
        let mut ai = old_i - delta;
        let mut aj = old_j + delta;

        if sum > 1.0 {
            if ai > 1.0 {
                ai = 1.0;
                aj = sum - 1.0;
            }
        } else if aj < 0.0 {
            aj = 0.0;
            ai = sum;
        }
        if sum > 1.0 {
            if aj > 1.0 {
                aj = 1.0;
                ai = sum - 1.0;
            }
        } else if ai < 0.0 {
            ai = 0.0;
            aj = sum;
        }

        self.alpha[i] = ai;
        self.alpha[j] = aj;

        let di = ai - old_i;
        let dj = aj - old_j;
        for (k, g) in self.grad.iter_mut().enumerate() {
            *g += qi[k] * di + qj[k] * dj;
        }
    }

    fn rho(&self) -> f64 {
        let mut ub = f64::INFINITY;
        let mut lb = f64::NEG_INFINITY;
        let mut free_sum = 0.0;
        let mut free = 0usize;

        for (&a, &g) in self.alpha.iter().zip(self.grad.iter()) {
            if a >= 1.0 {
                lb = lb.max(g);
            } else if a <= 0.0 {
                ub = ub.min(g);
            } else {
                free += 1;
                free_sum += g;
            }
        }

        if free > 0 {
            free_sum / free as f64
        } else {
            match (ub.is_finite(), lb.is_finite()) {
                (true, true) => (ub + lb) / 2.0,
                (true, false) => ub,
                (false, true) => lb,
                (false, false) => 0.0,
            }
        }
    }

    fn solve(&mut self) -> Solution {
        let mut iterations = 0;
        while iterations < self.max_iter {
            match self.select_working_set() {
                Some((i, j)) => self.update_pair(i, j),
                None => break,
            }
            iterations += 1;
        }
        if iterations >= self.max_iter {
            warn!(
                "SMO stopped at max_iter={} before reaching tol={}",
                self.max_iter, self.tol
            );
        }

        Solution {
            alpha: self.alpha.clone(),
            rho: self.rho(),
            iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};

    use super::*;

    /// A tight cluster around the origin.
    fn cluster() -> Array2<f64> {
        let mut rows = Vec::new();
        for i in 0..20 {
            let angle = i as f64 * std::f64::consts::TAU / 20.0;
            let r = 0.1 + 0.05 * (i % 3) as f64;
            rows.push(r * angle.cos());
            rows.push(r * angle.sin());
        }
        Array2::from_shape_vec((20, 2), rows).unwrap()
    }

    fn svm(nu: f64) -> OneClassSvm {
        OneClassSvm::new(OcsvmParams {
            nu,
            gamma: Gamma::Value(1.0),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_dual_constraints_hold() {
        let x = cluster();
        let mut model = svm(0.3);
        model.fit(&x).unwrap();

        let fitted = model.fitted.as_ref().unwrap();
        let total: f64 = fitted.dual_coef.sum();
        assert!((total - 0.3 * 20.0).abs() < 1e-9);
        assert!(fitted.dual_coef.iter().all(|a| *a > 0.0 && *a <= 1.0));
        // At least nu * l support vectors
        assert!(fitted.support_vectors.nrows() >= 6);
    }

    #[test]
    fn test_far_point_is_outlier() {
        let x = cluster();
        let mut model = svm(0.1);
        model.fit(&x).unwrap();

        let points = array![[0.0, 0.0], [5.0, 5.0]];
        let decision = model.decision_function(&points).unwrap();
        assert!(decision[0] > decision[1]);

        let predicted = model.predict(&points).unwrap();
        assert_eq!(predicted[0], 1);
        assert_eq!(predicted[1], -1);
    }

    #[test]
    fn test_training_outlier_fraction_bounded_by_nu() {
        let x = cluster();
        let mut model = svm(0.2);
        model.fit(&x).unwrap();

        let predicted = model.predict(&x).unwrap();
        let outliers = predicted.iter().filter(|p| **p == -1).count();
        // nu bounds the training outlier fraction, with slack for tol
        assert!(outliers as f64 <= 0.2 * 20.0 + 1.0);
    }

    #[test]
    fn test_score_samples_offset_by_rho() {
        let x = cluster();
        let mut model = svm(0.5);
        model.fit(&x).unwrap();

        let rho = model.fitted.as_ref().unwrap().rho;
        let scores = model.score_samples(&x).unwrap();
        let decision = model.decision_function(&x).unwrap();
        for (s, d) in scores.iter().zip(decision.iter()) {
            assert!((s - rho - d).abs() < 1e-12);
        }
    }

    #[test]
    fn test_single_sample() {
        let x = array![[1.0, 2.0]];
        let mut model = svm(0.5);
        model.fit(&x).unwrap();

        let decision = model.decision_function(&x).unwrap();
        assert!(decision[0].abs() < 1e-9);
        assert_eq!(model.predict(&x).unwrap()[0], 1);
    }

    #[test]
    fn test_nu_one_keeps_every_sample() {
        let x = cluster();
        let mut model = svm(1.0);
        model.fit(&x).unwrap();

        let fitted = model.fitted.as_ref().unwrap();
        assert_eq!(fitted.support_vectors.nrows(), 20);
        assert!(fitted.rho.is_finite());
    }

    #[test]
    fn test_small_cache_matches_large_cache() {
        let x = cluster();
        let mut small = OneClassSvm::new(OcsvmParams {
            nu: 0.3,
            cache_rows: 2,
            ..Default::default()
        })
        .unwrap();
        let mut large = OneClassSvm::new(OcsvmParams {
            nu: 0.3,
            cache_rows: 1024,
            ..Default::default()
        })
        .unwrap();
        small.fit(&x).unwrap();
        large.fit(&x).unwrap();

        let a = small.decision_function(&x).unwrap();
        let b = large.decision_function(&x).unwrap();
        for (p, q) in a.iter().zip(b.iter()) {
            assert!((p - q).abs() < 1e-12);
        }
    }

    #[test]
    fn test_invalid_params() {
        for nu in [0.0, -0.1, 1.5, f64::NAN] {
            let err = OneClassSvm::new(OcsvmParams {
                nu,
                ..Default::default()
            })
            .unwrap_err();
            assert!(matches!(err, ModelError::InvalidParameter { name: "nu", .. }));
        }
    }

    #[test]
    fn test_unfitted_and_dimension_errors() {
        let x = cluster();
        let mut model = svm(0.5);
        assert!(matches!(
            model.decision_function(&x),
            Err(ModelError::NotFitted(_))
        ));

        model.fit(&x).unwrap();
        let wrong = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            model.decision_function(&wrong),
            Err(ModelError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));

        let empty = Array2::<f64>::zeros((0, 2));
        assert!(matches!(
            svm(0.5).fit(&empty),
            Err(ModelError::EmptyInput(_))
        ));
    }
}
