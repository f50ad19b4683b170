//! Distances between reward arrays and pairwise cross distances

use dashmap::DashMap;
use indexmap::IndexMap;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::canon::{canonicalize, DeshapeKind, FixedPointConfig};
use crate::reward::ensure_finite;
use crate::tabular::{RewardTensor, TransitionDistribution};
use crate::{RewardError, Result};

/// Variance below which a reward is treated as constant
pub const VARIANCE_EPS: f64 = 1e-12;

fn normalized_weights(n: usize, weights: Option<ArrayView1<'_, f64>>) -> Result<Array1<f64>> {
    if n == 0 {
        return Err(RewardError::Computation("cannot compare empty reward arrays".to_string()));
    }
    match weights {
        None => Ok(Array1::from_elem(n, 1.0 / n as f64)),
        Some(w) => {
            if w.len() != n {
                return Err(RewardError::DimensionMismatch {
                    expected: n,
                    actual: w.len(),
                });
            }
            if w.iter().any(|x| !x.is_finite() || *x < 0.0) {
                return Err(RewardError::InvalidDistribution(
                    "weights must be finite and non-negative".to_string(),
                ));
            }
            let total = w.sum();
            if total <= 0.0 {
                return Err(RewardError::InvalidDistribution("weights sum to zero".to_string()));
            }
            Ok(&w / total)
        }
    }
}

fn check_pair(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> Result<()> {
    if a.len() != b.len() {
        return Err(RewardError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    ensure_finite(a, "first reward")?;
    ensure_finite(b, "second reward")
}

fn check_p(p: f64) -> Result<()> {
    if p.is_finite() && p > 0.0 {
        Ok(())
    } else {
        Err(RewardError::invalid_config("direct_p", format!("{p} is not a positive number")))
    }
}

/// Weighted Lp norm `(sum_i w_i |x_i|^p)^(1/p)` with weights normalized to one
pub fn weighted_norm(values: ArrayView1<'_, f64>, weights: Option<ArrayView1<'_, f64>>, p: f64) -> Result<f64> {
    check_p(p)?;
    ensure_finite(values, "reward")?;
    let w = normalized_weights(values.len(), weights)?;
    let total: f64 = values.iter().zip(w.iter()).map(|(x, w)| w * x.abs().powf(p)).sum();
    Ok(total.powf(1.0 / p))
}

/// Weighted Lp distance between two reward arrays, without any scale factor
pub fn direct_distance(
    a: ArrayView1<'_, f64>,
    b: ArrayView1<'_, f64>,
    weights: Option<ArrayView1<'_, f64>>,
    p: f64,
) -> Result<f64> {
    check_pair(a, b)?;
    weighted_norm((&a - &b).view(), weights, p)
}

/// Divide a reward by its weighted Lp norm. Constant-zero rewards are returned unchanged.
pub fn normalize_reward(values: ArrayView1<'_, f64>, weights: Option<ArrayView1<'_, f64>>, p: f64) -> Result<Array1<f64>> {
    let norm = weighted_norm(values, weights, p)?;
    if norm <= VARIANCE_EPS {
        Ok(values.to_owned())
    } else {
        Ok(&values / norm)
    }
}

/// Direct distance with its exponent and scale factor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectDistance {
    /// Norm exponent, any positive number
    pub p: f64,
    /// Multiplier on the norm
    pub scale: f64,
}

impl Default for DirectDistance {
    fn default() -> Self {
        Self { p: 1.0, scale: 0.5 }
    }
}

impl DirectDistance {
    /// Create a new direct distance
    pub fn new(p: f64, scale: f64) -> Result<Self> {
        check_p(p)?;
        if !(scale.is_finite() && scale > 0.0) {
            return Err(RewardError::invalid_config("direct_scale", "must be positive"));
        }
        Ok(Self { p, scale })
    }

    /// `scale * ||a - b||_p` under `weights`
    pub fn distance(&self, a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>, weights: Option<ArrayView1<'_, f64>>) -> Result<f64> {
        Ok(self.scale * direct_distance(a, b, weights, self.p)?)
    }
}

/// Weighted Pearson correlation, or `None` if either input has zero variance
pub fn pearson_correlation(
    a: ArrayView1<'_, f64>,
    b: ArrayView1<'_, f64>,
    weights: Option<ArrayView1<'_, f64>>,
) -> Result<Option<f64>> {
    check_pair(a, b)?;
    let w = normalized_weights(a.len(), weights)?;
    let mean_a = w.dot(&a);
    let mean_b = w.dot(&b);
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for ((x, y), wi) in a.iter().zip(b.iter()).zip(w.iter()) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += wi * dx * dy;
        var_a += wi * dx * dx;
        var_b += wi * dy * dy;
    }
    if var_a <= VARIANCE_EPS || var_b <= VARIANCE_EPS {
        return Ok(None);
    }
    Ok(Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)))
}

/// `1 - rho_w(a, b)`, in `[0, 2]`.
///
/// If either input is constant the correlation is undefined; the distance is
/// reported as `1` and a warning is emitted.
pub fn pearson_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>, weights: Option<ArrayView1<'_, f64>>) -> Result<f64> {
    match pearson_correlation(a, b, weights)? {
        Some(rho) => Ok(1.0 - rho),
        None => {
            warn!("zero variance reward in pearson distance, reporting 1");
            Ok(1.0)
        }
    }
}

fn canonical_pair(
    a: &RewardTensor,
    b: &RewardTensor,
    dist: &TransitionDistribution,
    discount: f64,
    kind: DeshapeKind,
    config: &FixedPointConfig,
) -> Result<(Array1<f64>, Array1<f64>)> {
    a.ensure_same_shape(b)?;
    let ca = canonicalize(a, dist, discount, kind, config)?;
    let cb = canonicalize(b, dist, discount, kind, config)?;
    let flat = |t: &RewardTensor| t.view().iter().copied().collect::<Array1<f64>>();
    Ok((flat(&ca.tensor), flat(&cb.tensor)))
}

/// Canonicalize both rewards, normalize each by its weighted norm and take the direct distance
#[instrument(skip(a, b, dist, config, kind), fields(kind = %kind))]
pub fn canonical_reward_distance(
    a: &RewardTensor,
    b: &RewardTensor,
    dist: &TransitionDistribution,
    discount: f64,
    kind: DeshapeKind,
    config: &FixedPointConfig,
    direct: &DirectDistance,
) -> Result<f64> {
    let (ca, cb) = canonical_pair(a, b, dist, discount, kind, config)?;
    let weights = dist.flat_weights();
    let na = normalize_reward(ca.view(), Some(weights.view()), direct.p)?;
    let nb = normalize_reward(cb.view(), Some(weights.view()), direct.p)?;
    direct.distance(na.view(), nb.view(), Some(weights.view()))
}

/// Canonicalize both rewards and take the Pearson distance under the reference distribution
#[instrument(skip(a, b, dist, config, kind), fields(kind = %kind))]
pub fn deshape_pearson_distance(
    a: &RewardTensor,
    b: &RewardTensor,
    dist: &TransitionDistribution,
    discount: f64,
    kind: DeshapeKind,
    config: &FixedPointConfig,
) -> Result<f64> {
    let (ca, cb) = canonical_pair(a, b, dist, discount, kind, config)?;
    let weights = dist.flat_weights();
    pearson_distance(ca.view(), cb.view(), Some(weights.view()))
}

/// Distance selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceKind {
    /// Scaled Lp distance
    Direct,
    /// `1 - rho`
    Pearson,
    /// Residual loss of the best equivalence fit
    Npec,
    /// NPEC normalized by the target's distance from zero, one direction
    Asymmetric,
    /// Mean of both asymmetric directions
    Symmetric,
    /// Minimum of both asymmetric directions
    SymmetricMin,
}

impl DistanceKind {
    /// All kinds, in a fixed order
    pub const ALL: [Self; 6] = [
        Self::Direct,
        Self::Pearson,
        Self::Npec,
        Self::Asymmetric,
        Self::Symmetric,
        Self::SymmetricMin,
    ];

    /// Configuration string
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Pearson => "pearson",
            Self::Npec => "npec",
            Self::Asymmetric => "asymmetric",
            Self::Symmetric => "symmetric",
            Self::SymmetricMin => "symmetric_min",
        }
    }

    /// Whether this kind needs an equivalence fit per pair
    #[must_use]
    pub fn requires_fit(self) -> bool {
        !matches!(self, Self::Direct | Self::Pearson)
    }

    /// Whether `d(a, b) == d(b, a)` holds
    #[must_use]
    pub fn is_symmetric(self) -> bool {
        matches!(self, Self::Pearson | Self::Direct | Self::Symmetric | Self::SymmetricMin)
    }
}

impl fmt::Display for DistanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceKind {
    type Err = RewardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RewardError::unknown_kind("distance_kind", s))
    }
}

/// How the two directions of an asymmetric distance are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymmetricAggregation {
    /// Arithmetic mean
    #[default]
    Mean,
    /// Minimum
    Min,
}

impl SymmetricAggregation {
    /// Combine `d(a, b)` and `d(b, a)`
    #[must_use]
    pub fn combine(self, forward: f64, backward: f64) -> f64 {
        match self {
            Self::Mean => 0.5 * (forward + backward),
            Self::Min => forward.min(backward),
        }
    }
}

/// Apply `distance_fn` to every `(x, y)` pair, keyed by `(x_key, y_key)`.
///
/// The distance type `D` is usually `f64`, or a
/// [`Dissimilarity`](crate::Dissimilarity) when entries carry a flag.
#[instrument(skip_all, fields(n_x = xs.len(), n_y = ys.len()))]
pub fn cross_distance<KX, KY, V, D, F>(
    xs: &IndexMap<KX, V>,
    ys: &IndexMap<KY, V>,
    distance_fn: F,
) -> Result<IndexMap<(KX, KY), D>>
where
    KX: Clone + Eq + Hash,
    KY: Clone + Eq + Hash,
    F: Fn(&V, &V) -> Result<D>,
{
    let mut out = IndexMap::with_capacity(xs.len() * ys.len());
    for (kx, x) in xs {
        for (ky, y) in ys {
            out.insert((kx.clone(), ky.clone()), distance_fn(x, y)?);
        }
    }
    debug!(pairs = out.len(), "cross distance complete");
    Ok(out)
}

/// Parallel [`cross_distance`]: each pair runs on the blocking pool, at most
/// `max_workers` at a time. Output order matches the sequential version.
pub async fn cross_distance_parallel<KX, KY, V, D, F>(
    xs: Arc<IndexMap<KX, V>>,
    ys: Arc<IndexMap<KY, V>>,
    distance_fn: F,
    max_workers: usize,
) -> Result<IndexMap<(KX, KY), D>>
where
    KX: Clone + Eq + Hash + Send + Sync + 'static,
    KY: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    D: Send + Sync + 'static,
    F: Fn(&V, &V) -> Result<D> + Send + Sync + 'static,
{
    let distance_fn = Arc::new(distance_fn);
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let results: Arc<DashMap<(usize, usize), D>> = Arc::new(DashMap::new());

    let mut handles = Vec::with_capacity(xs.len() * ys.len());
    for i in 0..xs.len() {
        for j in 0..ys.len() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| RewardError::Computation(e.to_string()))?;
            let xs = Arc::clone(&xs);
            let ys = Arc::clone(&ys);
            let distance_fn = Arc::clone(&distance_fn);
            let results = Arc::clone(&results);
            handles.push(tokio::task::spawn_blocking(move || -> Result<()> {
                let _permit = permit;
                let (x, y) = match (xs.get_index(i), ys.get_index(j)) {
                    (Some((_, x)), Some((_, y))) => (x, y),
                    _ => return Err(RewardError::Computation(format!("pair ({i}, {j}) out of range"))),
                };
                results.insert((i, j), distance_fn(x, y)?);
                Ok(())
            }));
        }
    }
    for handle in handles {
        handle.await.map_err(|e| RewardError::Computation(e.to_string()))??;
    }

    let mut out = IndexMap::with_capacity(results.len());
    for (i, kx) in xs.keys().enumerate() {
        for (j, ky) in ys.keys().enumerate() {
            let (_, value) = results
                .remove(&(i, j))
                .ok_or_else(|| RewardError::Computation(format!("missing result for pair ({i}, {j})")))?;
            out.insert((kx.clone(), ky.clone()), value);
        }
    }
    debug!(pairs = out.len(), max_workers, "parallel cross distance complete");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_non_finite_inputs_rejected() {
        let a = array![1.0, f64::NAN, 3.0];
        let b = array![0.0, 1.0, 2.0];
        assert!(matches!(
            pearson_correlation(a.view(), b.view(), None),
            Err(RewardError::NonFinite { .. })
        ));
        assert!(matches!(
            pearson_distance(b.view(), a.view(), None),
            Err(RewardError::NonFinite { .. })
        ));
        assert!(matches!(
            direct_distance(a.view(), b.view(), None, 1.0),
            Err(RewardError::NonFinite { .. })
        ));
        assert!(matches!(
            weighted_norm(array![f64::INFINITY].view(), None, 2.0),
            Err(RewardError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_direct_distance_weighted() {
        let a = array![1.0, 2.0, 3.0];
        let b = array![1.0, 0.0, 3.0];
        // only the middle entry differs
        let d = direct_distance(a.view(), b.view(), Some(array![0.25, 0.5, 0.25].view()), 2.0).unwrap();
        assert_abs_diff_eq!(d, (0.5f64 * 4.0).sqrt(), epsilon = 1e-12);
        let scaled = DirectDistance::new(2.0, 0.5).unwrap();
        assert_abs_diff_eq!(
            scaled.distance(a.view(), b.view(), Some(array![0.25, 0.5, 0.25].view())).unwrap(),
            0.5 * d,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_fractional_p() {
        let d = direct_distance(array![0.0, 0.0].view(), array![1.0, 1.0].view(), None, 0.5).unwrap();
        assert_abs_diff_eq!(d, 1.0, epsilon = 1e-12);
        assert!(direct_distance(array![0.0].view(), array![1.0].view(), None, 0.0).is_err());
    }

    #[test]
    fn test_pearson_affine_invariant() {
        let a = array![0.3, -1.0, 2.0, 0.7];
        let b = a.mapv(|x| 3.0 * x - 2.0);
        assert_abs_diff_eq!(pearson_distance(a.view(), b.view(), None).unwrap(), 0.0, epsilon = 1e-12);
        let neg = a.mapv(|x| -x);
        assert_abs_diff_eq!(pearson_distance(a.view(), neg.view(), None).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pearson_degenerate_is_one() {
        let a = array![1.0, 1.0, 1.0];
        let b = array![0.0, 1.0, 2.0];
        assert!(pearson_correlation(a.view(), b.view(), None).unwrap().is_none());
        assert_abs_diff_eq!(pearson_distance(a.view(), b.view(), None).unwrap(), 1.0);
    }

    #[test]
    fn test_kind_strings() {
        for kind in DistanceKind::ALL {
            assert_eq!(kind.as_str().parse::<DistanceKind>().unwrap(), kind);
        }
        assert!("euclid".parse::<DistanceKind>().is_err());
        assert!(DistanceKind::Npec.requires_fit());
        assert!(!DistanceKind::Pearson.requires_fit());
    }

    #[test]
    fn test_aggregation() {
        assert_abs_diff_eq!(SymmetricAggregation::Mean.combine(1.0, 3.0), 2.0);
        assert_abs_diff_eq!(SymmetricAggregation::Min.combine(1.0, 3.0), 1.0);
    }

    #[test]
    fn test_cross_distance_keys() {
        let mut xs = IndexMap::new();
        xs.insert("a", array![1.0, 2.0]);
        xs.insert("b", array![2.0, 4.0]);
        let out = cross_distance(&xs, &xs, |x, y| direct_distance(x.view(), y.view(), None, 1.0)).unwrap();
        assert_eq!(out.len(), 4);
        assert_abs_diff_eq!(out[&("a", "a")], 0.0);
        assert_abs_diff_eq!(out[&("a", "b")], 1.5);
    }

    #[tokio::test]
    async fn test_parallel_matches_sequential() {
        let mut xs = IndexMap::new();
        for i in 0..5 {
            xs.insert(i, Array1::from_shape_fn(8, |j| ((i * 7 + j * 3) % 5) as f64));
        }
        let xs = Arc::new(xs);
        let sequential = cross_distance(&xs, &xs, |x, y| pearson_distance(x.view(), y.view(), None)).unwrap();
        let parallel = cross_distance_parallel(
            Arc::clone(&xs),
            Arc::clone(&xs),
            |x: &Array1<f64>, y: &Array1<f64>| pearson_distance(x.view(), y.view(), None),
            3,
        )
        .await
        .unwrap();
        assert_eq!(sequential.keys().collect::<Vec<_>>(), parallel.keys().collect::<Vec<_>>());
        for (k, v) in &sequential {
            assert_abs_diff_eq!(*v, parallel[k], epsilon = 1e-12);
        }
    }
}
