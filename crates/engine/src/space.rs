//! Parameter spaces and candidate generation
//!
//! A strategy registers an ordered list of [`ParameterSpec`]s once. Every
//! [`ParameterSet`] produced here (sampling, clamping, decoding from the unit
//! cube) holds values inside those bounds, with integral values for integer
//! parameters.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::error::{OptimizeError, OptimizeResult};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Integer,
    Real,
}

/// Bounds and type of one tunable parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpec {
    name: String,
    kind: ParamKind,
    lower: f64,
    upper: f64,
}

impl ParameterSpec {
    pub fn integer(name: impl Into<String>, lower: i64, upper: i64) -> OptimizeResult<Self> {
        Self::new(name, ParamKind::Integer, lower as f64, upper as f64)
    }

    pub fn real(name: impl Into<String>, lower: f64, upper: f64) -> OptimizeResult<Self> {
        Self::new(name, ParamKind::Real, lower, upper)
    }

    pub fn new(
        name: impl Into<String>,
        kind: ParamKind,
        lower: f64,
        upper: f64,
    ) -> OptimizeResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(OptimizeError::Configuration(
                "Parameter name must not be empty".to_string(),
            ));
        }
        if !lower.is_finite() || !upper.is_finite() {
            return Err(OptimizeError::Configuration(format!(
                "Parameter {name}: bounds must be finite"
            )));
        }
        if lower > upper {
            return Err(OptimizeError::Configuration(format!(
                "Parameter {name}: lower bound {lower} exceeds upper bound {upper}"
            )));
        }
        let (lower, upper) = match kind {
            ParamKind::Integer => (lower.ceil(), upper.floor()),
            ParamKind::Real => (lower, upper),
        };
        if lower > upper {
            return Err(OptimizeError::Configuration(format!(
                "Parameter {name}: no integer lies within the bounds"
            )));
        }
        Ok(Self {
            name,
            kind,
            lower,
            upper,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Whether `value` is a legal value for this parameter
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite()
            && value >= self.lower
            && value <= self.upper
            && (self.kind == ParamKind::Real || value.fract() == 0.0)
    }

    /// Project an arbitrary number onto the nearest legal value
    pub fn clamp(&self, value: f64) -> f64 {
        let value = if value.is_nan() { self.lower } else { value };
        let value = value.clamp(self.lower, self.upper);
        match self.kind {
            ParamKind::Integer => value.round().clamp(self.lower, self.upper),
            ParamKind::Real => value,
        }
    }

    /// Uniform draw within bounds
    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        match self.kind {
            ParamKind::Integer => rng.gen_range(self.lower as i64..=self.upper as i64) as f64,
            ParamKind::Real if self.width() == 0.0 => self.lower,
            ParamKind::Real => rng.gen_range(self.lower..=self.upper),
        }
    }

    /// Local move around `value`, clamped back into bounds.
    ///
    /// Integers step by at least one unit (up to 10% of the range); reals move
    /// by up to 10% of the range.
    pub fn perturb(&self, value: f64, rng: &mut impl Rng) -> f64 {
        match self.kind {
            ParamKind::Integer => {
                if self.width() == 0.0 {
                    return self.lower;
                }
                let step = ((self.width() * 0.1).round() as i64).max(1);
                let mut delta = rng.gen_range(-step..=step);
                if delta == 0 {
                    delta = if rng.gen_bool(0.5) { 1 } else { -1 };
                }
                self.clamp(value + delta as f64)
            }
            ParamKind::Real => {
                let delta = rng.gen_range(-0.1..=0.1) * self.width();
                self.clamp(value + delta)
            }
        }
    }

    /// Up to `resolution` evenly spaced points from lower to upper bound.
    /// Integer points are rounded and de-duplicated, preserving order.
    pub fn grid_points(&self, resolution: usize) -> Vec<f64> {
        if resolution == 0 {
            return Vec::new();
        }
        if resolution == 1 || self.width() == 0.0 {
            return vec![self.lower];
        }
        let steps = (resolution - 1) as f64;
        let mut points: Vec<f64> = Vec::with_capacity(resolution);
        for i in 0..resolution {
            let raw = self.lower + self.width() * (i as f64) / steps;
            let point = self.clamp(raw);
            if points.last().map_or(true, |&last| last != point) {
                points.push(point);
            }
        }
        points
    }

    /// Map a legal value to [0, 1]
    pub fn to_unit(&self, value: f64) -> f64 {
        if self.width() == 0.0 {
            0.5
        } else {
            ((value - self.lower) / self.width()).clamp(0.0, 1.0)
        }
    }

    /// Map a point of [0, 1] back to the nearest legal value
    pub fn from_unit(&self, unit: f64) -> f64 {
        self.clamp(self.lower + unit.clamp(0.0, 1.0) * self.width())
    }
}

/// Concrete values for one strategy's parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    strategy_id: String,
    values: BTreeMap<String, f64>,
}

impl ParameterSet {
    /// Only the space constructs sets, so bounds hold by construction
    fn from_parts(strategy_id: &str, values: BTreeMap<String, f64>) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            values,
        }
    }

    /// Rebuild a set read back from the result store. Values are trusted as
    /// saved; the space may have changed since.
    pub(crate) fn from_stored(strategy_id: &str, values: BTreeMap<String, f64>) -> Self {
        Self::from_parts(strategy_id, values)
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).map(|v| v.round() as i64)
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stable fingerprint of strategy id and values
    pub fn params_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.strategy_id.as_bytes());
        for (name, value) in &self.values {
            hasher.update(name.as_bytes());
            hasher.update(value.to_bits().to_le_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

// ============================================================================
// Strategy space
// ============================================================================

/// The ordered, immutable parameter space of one strategy
#[derive(Debug, Clone)]
pub struct StrategySpace {
    strategy_id: String,
    specs: Arc<[ParameterSpec]>,
}

impl StrategySpace {
    pub fn new(strategy_id: impl Into<String>, specs: Vec<ParameterSpec>) -> OptimizeResult<Self> {
        let strategy_id = strategy_id.into();
        if specs.is_empty() {
            return Err(OptimizeError::Configuration(format!(
                "Strategy {strategy_id}: parameter space is empty"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name()) {
                return Err(OptimizeError::Configuration(format!(
                    "Strategy {strategy_id}: duplicate parameter {}",
                    spec.name()
                )));
            }
        }
        Ok(Self {
            strategy_id,
            specs: Arc::from(specs),
        })
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Specs in declaration order
    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn dimensions(&self) -> usize {
        self.specs.len()
    }

    /// One uniformly drawn candidate
    pub fn sample(&self, rng: &mut impl Rng) -> ParameterSet {
        let values = self
            .specs
            .iter()
            .map(|spec| (spec.name().to_string(), spec.sample(rng)))
            .collect();
        ParameterSet::from_parts(&self.strategy_id, values)
    }

    pub fn sample_uniform(&self, count: usize, rng: &mut impl Rng) -> Vec<ParameterSet> {
        (0..count).map(|_| self.sample(rng)).collect()
    }

    /// Build a set from raw values, projecting each onto its bounds.
    /// Missing parameters take their lower bound; unknown names are rejected.
    pub fn build(&self, raw: &BTreeMap<String, f64>) -> OptimizeResult<ParameterSet> {
        if let Some(unknown) = raw.keys().find(|k| self.spec(k).is_none()) {
            return Err(OptimizeError::Configuration(format!(
                "Strategy {}: unknown parameter {unknown}",
                self.strategy_id
            )));
        }
        let values = self
            .specs
            .iter()
            .map(|spec| {
                let v = raw.get(spec.name()).copied().unwrap_or(spec.lower());
                (spec.name().to_string(), spec.clamp(v))
            })
            .collect();
        Ok(ParameterSet::from_parts(&self.strategy_id, values))
    }

    /// Build a set by asking `value_of` for each spec in declaration order;
    /// every answer is clamped onto its bounds.
    pub fn assemble(&self, mut value_of: impl FnMut(&ParameterSpec) -> f64) -> ParameterSet {
        let values = self
            .specs
            .iter()
            .map(|spec| (spec.name().to_string(), spec.clamp(value_of(spec))))
            .collect();
        ParameterSet::from_parts(&self.strategy_id, values)
    }

    /// Project every value of `set` onto its bounds; missing parameters take
    /// their lower bound and undeclared ones are dropped
    pub fn clamp(&self, set: &ParameterSet) -> ParameterSet {
        self.assemble(|spec| set.get(spec.name()).unwrap_or(spec.lower()))
    }

    /// Replace one value, clamped to its spec
    pub fn with_value(&self, set: &ParameterSet, name: &str, value: f64) -> ParameterSet {
        let mut out = set.clone();
        if let Some(spec) = self.spec(name) {
            out.values.insert(name.to_string(), spec.clamp(value));
        }
        out
    }

    pub fn spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.specs.iter().find(|s| s.name() == name)
    }

    /// Whether every declared parameter is present and within bounds
    pub fn contains(&self, set: &ParameterSet) -> bool {
        set.strategy_id() == self.strategy_id
            && set.len() == self.specs.len()
            && self
                .specs
                .iter()
                .all(|spec| set.get(spec.name()).is_some_and(|v| spec.contains(v)))
    }

    /// Values in declaration order, mapped to the unit cube
    pub fn encode(&self, set: &ParameterSet) -> Vec<f64> {
        self.specs
            .iter()
            .map(|spec| spec.to_unit(set.get(spec.name()).unwrap_or(spec.lower())))
            .collect()
    }

    /// Inverse of [`encode`](Self::encode); out-of-range coordinates are clamped
    pub fn decode(&self, unit: &[f64]) -> ParameterSet {
        let values = self
            .specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let u = unit.get(i).copied().unwrap_or(0.0);
                (spec.name().to_string(), spec.from_unit(u))
            })
            .collect();
        ParameterSet::from_parts(&self.strategy_id, values)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of parameter spaces keyed by strategy id
#[derive(Default)]
pub struct ParameterSpace {
    spaces: RwLock<HashMap<String, StrategySpace>>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the space for `strategy_id`; re-registration overwrites
    pub fn register_strategy(
        &self,
        strategy_id: &str,
        specs: Vec<ParameterSpec>,
    ) -> OptimizeResult<()> {
        let space = StrategySpace::new(strategy_id, specs)?;
        info!(
            strategy = %strategy_id,
            parameters = space.dimensions(),
            "Parameter space registered"
        );
        self.spaces
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(strategy_id.to_string(), space);
        Ok(())
    }

    pub fn get(&self, strategy_id: &str) -> OptimizeResult<StrategySpace> {
        self.spaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| OptimizeError::unknown_strategy(strategy_id))
    }

    pub fn specs(&self, strategy_id: &str) -> OptimizeResult<Vec<ParameterSpec>> {
        Ok(self.get(strategy_id)?.specs().to_vec())
    }

    pub fn sample_uniform(
        &self,
        strategy_id: &str,
        count: usize,
        rng: &mut impl Rng,
    ) -> OptimizeResult<Vec<ParameterSet>> {
        Ok(self.get(strategy_id)?.sample_uniform(count, rng))
    }

    /// Registered strategy ids, sorted
    pub fn strategies(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .spaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ema_space() -> StrategySpace {
        StrategySpace::new(
            "ema",
            vec![
                ParameterSpec::integer("ema_fast", 8, 20).unwrap(),
                ParameterSpec::integer("ema_slow", 20, 50).unwrap(),
                ParameterSpec::real("stoploss_pct", 0.02, 0.08).unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_spec_rejects_inverted_bounds() {
        assert!(ParameterSpec::real("x", 2.0, 1.0).is_err());
        assert!(ParameterSpec::real("x", f64::NAN, 1.0).is_err());
        assert!(ParameterSpec::real("", 0.0, 1.0).is_err());
        // 0.2..0.8 contains no integer
        assert!(ParameterSpec::new("x", ParamKind::Integer, 0.2, 0.8).is_err());
    }

    #[test]
    fn test_space_rejects_duplicates_and_empty() {
        let dup = vec![
            ParameterSpec::integer("a", 0, 1).unwrap(),
            ParameterSpec::integer("a", 0, 2).unwrap(),
        ];
        assert!(StrategySpace::new("s", dup).is_err());
        assert!(StrategySpace::new("s", vec![]).is_err());
    }

    #[test]
    fn test_unknown_strategy_is_configuration_error() {
        let registry = ParameterSpace::new();
        let mut rng = StdRng::seed_from_u64(1);
        let err = registry.sample_uniform("nope", 3, &mut rng).unwrap_err();
        assert!(matches!(err, OptimizeError::Configuration(_)));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = ParameterSpace::new();
        registry
            .register_strategy("s", vec![ParameterSpec::integer("a", 0, 5).unwrap()])
            .unwrap();
        registry
            .register_strategy("s", vec![ParameterSpec::integer("b", 10, 20).unwrap()])
            .unwrap();
        let space = registry.get("s").unwrap();
        assert_eq!(space.dimensions(), 1);
        assert_eq!(space.specs()[0].name(), "b");
        assert_eq!(registry.strategies(), vec!["s".to_string()]);
        assert_eq!(registry.specs("s").unwrap()[0].upper(), 20.0);
    }

    #[test]
    fn test_clamp_projects_foreign_set() {
        let space = ema_space();
        let wide = StrategySpace::new(
            "ema",
            vec![
                ParameterSpec::integer("ema_fast", 0, 100).unwrap(),
                ParameterSpec::integer("ema_slow", 0, 100).unwrap(),
            ],
        )
        .unwrap();
        let base = wide.sample(&mut StdRng::seed_from_u64(3));
        let raw = wide.with_value(&wide.with_value(&base, "ema_fast", 2.0), "ema_slow", 90.0);

        let clamped = space.clamp(&raw);
        assert!(space.contains(&clamped));
        assert_eq!(clamped.get("ema_fast"), Some(8.0));
        assert_eq!(clamped.get("ema_slow"), Some(50.0));
        assert_eq!(clamped.get("stoploss_pct"), Some(0.02));
    }

    #[test]
    fn test_grid_points_integer_and_real() {
        let int = ParameterSpec::integer("p", 8, 20).unwrap();
        assert_eq!(int.grid_points(4), vec![8.0, 12.0, 16.0, 20.0]);

        let narrow = ParameterSpec::integer("p", 1, 2).unwrap();
        assert_eq!(narrow.grid_points(4), vec![1.0, 2.0]);

        let real = ParameterSpec::real("r", 0.0, 0.3).unwrap();
        let pts = real.grid_points(4);
        assert_eq!(pts.len(), 4);
        assert!((pts[1] - 0.1).abs() < 1e-12);
        assert_eq!(pts[3], 0.3);
    }

    #[test]
    fn test_encode_decode_roundtrip_keeps_values() {
        let space = ema_space();
        let mut rng = StdRng::seed_from_u64(7);
        let set = space.sample(&mut rng);
        let decoded = space.decode(&space.encode(&set));
        assert_eq!(decoded.get_int("ema_fast"), set.get_int("ema_fast"));
        assert!((decoded.get("stoploss_pct").unwrap() - set.get("stoploss_pct").unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_build_clamps_and_rejects_unknown() {
        let space = ema_space();
        let mut raw = BTreeMap::new();
        raw.insert("ema_fast".to_string(), 3.4);
        raw.insert("ema_slow".to_string(), 33.6);
        let set = space.build(&raw).unwrap();
        assert_eq!(set.get("ema_fast"), Some(8.0));
        assert_eq!(set.get("ema_slow"), Some(34.0));
        assert_eq!(set.get("stoploss_pct"), Some(0.02));

        raw.insert("bogus".to_string(), 1.0);
        assert!(space.build(&raw).is_err());
    }

    #[test]
    fn test_params_hash_is_stable_and_value_sensitive() {
        let space = ema_space();
        let mut rng = StdRng::seed_from_u64(3);
        let a = space.sample(&mut rng);
        assert_eq!(a.params_hash(), a.clone().params_hash());
        let b = space.with_value(&a, "ema_fast", if a.get("ema_fast") == Some(8.0) { 9.0 } else { 8.0 });
        assert_ne!(a.params_hash(), b.params_hash());
    }

    proptest! {
        #[test]
        fn prop_uniform_samples_within_bounds(seed in any::<u64>(), count in 1usize..40) {
            let space = ema_space();
            let mut rng = StdRng::seed_from_u64(seed);
            for set in space.sample_uniform(count, &mut rng) {
                prop_assert!(space.contains(&set));
            }
        }

        #[test]
        fn prop_perturb_stays_within_bounds(seed in any::<u64>(), start in -100.0f64..200.0) {
            let space = ema_space();
            let mut rng = StdRng::seed_from_u64(seed);
            for spec in space.specs() {
                let v = spec.perturb(spec.clamp(start), &mut rng);
                prop_assert!(spec.contains(v), "{} = {}", spec.name(), v);
            }
        }

        #[test]
        fn prop_decode_any_point_within_bounds(u in proptest::collection::vec(-1.0f64..2.0, 3)) {
            let space = ema_space();
            prop_assert!(space.contains(&space.decode(&u)));
        }
    }
}
