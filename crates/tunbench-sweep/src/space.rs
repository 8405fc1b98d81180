//! Mapping normalized design coordinates to physical parameter values.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// How a continuous value is truncated after the affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rounding {
    /// Truncate toward zero to an integer (bandwidth in kbit, delay in ms).
    Integer,
    /// Truncate to two decimals (loss percent).
    Hundredths,
    Exact,
}

impl Rounding {
    fn apply(self, v: f64) -> ParamValue {
        match self {
            Rounding::Integer => ParamValue::Int(v.trunc() as i64),
            Rounding::Hundredths => ParamValue::Float((v * 100.0).trunc() / 100.0),
            Rounding::Exact => ParamValue::Float(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DimensionKind {
    Continuous { min: f64, max: f64, rounding: Rounding },
    Categorical { levels: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub kind: DimensionKind,
}

impl Dimension {
    pub fn continuous(name: &str, min: f64, max: f64, rounding: Rounding) -> Self {
        Self {
            name: name.into(),
            kind: DimensionKind::Continuous { min, max, rounding },
        }
    }

    pub fn categorical<S: Into<String>>(name: &str, levels: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            kind: DimensionKind::Categorical {
                levels: levels.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Map a normalized coordinate `c` in `[0, 1)`.
    ///
    /// Continuous: `min + c * (max - min)`, then rounded. Categorical:
    /// level `floor(c * count)`, clamped to the last level.
    pub fn map(&self, c: f64) -> ParamValue {
        match &self.kind {
            DimensionKind::Continuous { min, max, rounding } => {
                rounding.apply(min + c * (max - min))
            }
            DimensionKind::Categorical { levels } => {
                let idx = ((c * levels.len() as f64).floor().max(0.0) as usize)
                    .min(levels.len().saturating_sub(1));
                ParamValue::Level(levels.get(idx).cloned().unwrap_or_default())
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match &self.kind {
            DimensionKind::Continuous { min, max, .. } => {
                if !min.is_finite() || !max.is_finite() || min > max {
                    return Err(format!("dimension `{}`: invalid range {min}..{max}", self.name));
                }
            }
            DimensionKind::Categorical { levels } => {
                if levels.is_empty() {
                    return Err(format!("dimension `{}`: no levels", self.name));
                }
            }
        }
        Ok(())
    }
}

/// A mapped parameter value as it appears in banners and result lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Level(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Level(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) => Some(v.trunc() as i64),
            ParamValue::Level(_) => None,
        }
    }

    pub fn as_level(&self) -> Option<&str> {
        match self {
            ParamValue::Level(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Level(s) => f.write_str(s),
        }
    }
}

/// Range or level overrides for one dimension, from configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DimensionOverride {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Pin the dimension to a single value (`min = max = fixed`).
    pub fixed: Option<f64>,
    pub levels: Option<Vec<String>>,
}

/// The ordered dimensions of one design grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    dims: Vec<Dimension>,
}

impl ParameterSpace {
    pub fn new(dims: Vec<Dimension>) -> Result<Self, String> {
        let space = Self { dims };
        space.validate()?;
        Ok(space)
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for d in &self.dims {
            if !seen.insert(d.name.as_str()) {
                return Err(format!("duplicate dimension `{}`", d.name));
            }
            d.validate()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dims.iter().map(|d| d.name.as_str())
    }

    /// Map one design row. `coords.len()` must equal the dimension count.
    pub fn map(&self, coords: &[f64]) -> Result<Vec<ParamValue>, String> {
        if coords.len() != self.dims.len() {
            return Err(format!(
                "design row has {} coordinates, space has {} dimensions",
                coords.len(),
                self.dims.len()
            ));
        }
        Ok(self.dims.iter().zip(coords).map(|(d, &c)| d.map(c)).collect())
    }

    /// Apply configured overrides by dimension name. Names this space does
    /// not have are skipped; another grid of the same experiment may own them.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, DimensionOverride>) -> Result<(), String> {
        for (name, ov) in overrides {
            let Some(dim) = self.dims.iter_mut().find(|d| &d.name == name) else {
                continue;
            };
            match &mut dim.kind {
                DimensionKind::Continuous { min, max, .. } => {
                    if ov.levels.is_some() {
                        return Err(format!("dimension `{name}` is continuous, `levels` not allowed"));
                    }
                    if let Some(v) = ov.fixed {
                        *min = v;
                        *max = v;
                    }
                    if let Some(v) = ov.min {
                        *min = v;
                    }
                    if let Some(v) = ov.max {
                        *max = v;
                    }
                }
                DimensionKind::Categorical { levels } => {
                    if ov.min.is_some() || ov.max.is_some() || ov.fixed.is_some() {
                        return Err(format!("dimension `{name}` is categorical, only `levels` allowed"));
                    }
                    if let Some(l) = &ov.levels {
                        *levels = l.clone();
                    }
                }
            }
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bw() -> Dimension {
        Dimension::continuous("bw", 1000.0, 100_000.0, Rounding::Integer)
    }

    #[test]
    fn continuous_boundaries() {
        assert_eq!(bw().map(0.0), ParamValue::Int(1000));
        assert_eq!(bw().map(0.5), ParamValue::Int(50_500));
        assert_eq!(bw().map(0.75), ParamValue::Int(75_250));
    }

    #[test]
    fn loss_truncates_to_hundredths() {
        let loss = Dimension::continuous("loss", 0.0, 2.0, Rounding::Hundredths);
        assert_eq!(loss.map(0.0), ParamValue::Float(0.0));
        assert_eq!(loss.map(0.3333), ParamValue::Float(0.66));
        assert_eq!(loss.map(0.5).to_string(), "1");
    }

    #[test]
    fn categorical_floor_and_clamp() {
        let f = Dimension::categorical("fsize", ["8k", "64k", "256k", "1024k", "8192k"]);
        assert_eq!(f.map(0.0).as_level(), Some("8k"));
        assert_eq!(f.map(0.19).as_level(), Some("8k"));
        assert_eq!(f.map(0.2).as_level(), Some("64k"));
        assert_eq!(f.map(0.999).as_level(), Some("8192k"));
        assert_eq!(f.map(1.0).as_level(), Some("8192k"));
    }

    #[test]
    fn fixed_dimension() {
        let d = Dimension::continuous("jitter", 0.0, 0.0, Rounding::Integer);
        assert_eq!(d.map(0.73), ParamValue::Int(0));
    }

    #[test]
    fn space_rejects_bad_dims() {
        assert!(ParameterSpace::new(vec![bw(), bw()]).is_err());
        assert!(
            ParameterSpace::new(vec![Dimension::continuous("d", 5.0, 1.0, Rounding::Integer)])
                .is_err()
        );
        assert!(ParameterSpace::new(vec![Dimension::categorical::<String>("f", [])]).is_err());
    }

    #[test]
    fn row_length_checked() {
        let space = ParameterSpace::new(vec![bw()]).unwrap();
        assert!(space.map(&[0.1, 0.2]).is_err());
        assert_eq!(space.map(&[0.5]).unwrap(), vec![ParamValue::Int(50_500)]);
    }

    #[test]
    fn overrides() {
        let mut space = ParameterSpace::new(vec![
            bw(),
            Dimension::categorical("fsize", ["4M"]),
        ])
        .unwrap();
        let mut ov = HashMap::new();
        ov.insert(
            "bw".to_string(),
            DimensionOverride {
                fixed: Some(10_000.0),
                ..Default::default()
            },
        );
        ov.insert(
            "fsize".to_string(),
            DimensionOverride {
                levels: Some(vec!["1024k".into(), "2M".into()]),
                ..Default::default()
            },
        );
        space.apply_overrides(&ov).unwrap();
        assert_eq!(
            space.map(&[0.9, 0.9]).unwrap(),
            vec![ParamValue::Int(10_000), ParamValue::Level("2M".into())]
        );

        let mut bad = HashMap::new();
        bad.insert(
            "bw".to_string(),
            DimensionOverride {
                min: Some(500_000.0),
                ..Default::default()
            },
        );
        assert!(space.apply_overrides(&bad).is_err());
    }

    proptest! {
        #[test]
        fn continuous_mapping_is_affine(
            min in -1.0e6f64..1.0e6,
            span in 0.0f64..1.0e6,
            c in 0.0f64..1.0,
        ) {
            let d = Dimension::continuous("x", min, min + span, Rounding::Exact);
            let v = d.map(c).as_f64().unwrap();
            prop_assert!((v - (min + c * span)).abs() <= 1e-6 * (1.0 + v.abs()));
            prop_assert!(v >= min - 1e-6 && v <= min + span + 1e-6);
        }

        #[test]
        fn integer_mapping_stays_in_range(c in 0.0f64..1.0) {
            let v = bw().map(c).as_i64().unwrap();
            prop_assert!((1000..=100_000).contains(&v));
        }

        #[test]
        fn categorical_index_in_bounds(n in 1usize..20, c in 0.0f64..=1.0) {
            let levels: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            let d = Dimension::categorical("l", levels.clone());
            let picked = d.map(c);
            let idx: usize = picked.as_level().unwrap().parse().unwrap();
            prop_assert!(idx < n);
            prop_assert_eq!(idx, ((c * n as f64).floor() as usize).min(n - 1));
        }
    }
}
