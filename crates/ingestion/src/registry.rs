//! Variable registry: abstract variable ids to selection and derivation recipes.
//!
//! The registry is built once at process start, either from the built-in
//! table or from a YAML list of [`VariableSpec`]s, and is read-only afterwards.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IngestionError, Result};
use crate::models::{Model, PrecipType};

/// Named combine functions for composite variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeriveKind {
    /// Magnitude of two orthogonal wind components, in mph.
    WindSpeed,
    /// Reflectivity blended with categorical precipitation type.
    RadarPtype,
    /// Precipitation rate (mm/hr) blended with categorical precipitation type.
    PrecipTypeIntensity,
}

impl DeriveKind {
    /// Roles that must be present for every model.
    pub fn required_roles(&self) -> &'static [&'static str] {
        match self {
            DeriveKind::WindSpeed => &["u", "v"],
            DeriveKind::RadarPtype => &["refl"],
            DeriveKind::PrecipTypeIntensity => &["rate"],
        }
    }

    /// Whether the recipe takes the model's precipitation type flags.
    pub fn uses_precip_types(&self) -> bool {
        matches!(self, DeriveKind::RadarPtype | DeriveKind::PrecipTypeIntensity)
    }
}

/// Rendering and unit hints carried with a variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hints {
    /// Output units after derivation.
    #[serde(default)]
    pub units: Option<String>,
    /// Categorical semantics: never interpolate, discrete palette.
    #[serde(default)]
    pub categorical: bool,
    /// Value range mapped onto bytes 0..=254 for continuous variables.
    #[serde(default)]
    pub value_range: Option<(f32, f32)>,
    /// Values below this are masked transparent.
    #[serde(default)]
    pub min_significant: Option<f32>,
    /// Component variable ids by role, for derived variables.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
}

/// Selection parameters for the external decoder and the providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selectors {
    /// Decoder filter keys, e.g. `shortName`, `typeOfLevel`, `level`.
    #[serde(default)]
    pub filter_keys: BTreeMap<String, String>,
    /// Inventory search patterns (substring match on `.idx` lines).
    #[serde(default)]
    pub search: Vec<String>,
    #[serde(default)]
    pub hints: Hints,
}

/// Static definition of one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub derived: bool,
    #[serde(default)]
    pub derive: Option<DeriveKind>,
    #[serde(default)]
    pub selectors: Selectors,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Models this variable is offered for; empty means all.
    #[serde(default)]
    pub models: Vec<Model>,
}

impl VariableSpec {
    pub fn is_categorical(&self) -> bool {
        self.selectors.hints.categorical
    }

    pub fn offered_for(&self, model: Model) -> bool {
        self.models.is_empty() || self.models.contains(&model)
    }
}

/// Concrete selection for one upstream field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelection {
    /// Variable id the field is cached under.
    pub var_id: String,
    pub filter_keys: BTreeMap<String, String>,
    pub search: Vec<String>,
}

/// How to obtain a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Primary(FieldSelection),
    Derived {
        kind: DeriveKind,
        /// Component selections keyed by role, restricted to what the model has.
        components: BTreeMap<String, FieldSelection>,
    },
}

impl Plan {
    /// Every upstream field needed, in role order.
    pub fn selections(&self) -> Vec<&FieldSelection> {
        match self {
            Plan::Primary(sel) => vec![sel],
            Plan::Derived { components, .. } => components.values().collect(),
        }
    }
}

/// A variable resolved for a specific model.
#[derive(Debug, Clone)]
pub struct ResolvedVariable {
    pub model: Model,
    pub spec: VariableSpec,
    pub plan: Plan,
}

/// Registry of all known variables.
#[derive(Debug, Clone)]
pub struct VariableRegistry {
    specs: HashMap<String, VariableSpec>,
    aliases: HashMap<String, String>,
}

impl VariableRegistry {
    /// Build a registry, checking that every derived variable's components exist.
    pub fn new(specs: Vec<VariableSpec>) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut aliases = HashMap::new();
        for spec in specs {
            wx_common::validate_segment(&spec.id)?;
            if spec.derived != spec.derive.is_some() {
                return Err(IngestionError::InvalidConfig(format!(
                    "variable '{}': `derived` must be set exactly when `derive` is",
                    spec.id
                )));
            }
            for alias in &spec.aliases {
                aliases.insert(alias.to_ascii_lowercase(), spec.id.clone());
            }
            if by_id.insert(spec.id.clone(), spec).is_some() {
                return Err(IngestionError::InvalidConfig("duplicate variable id".into()));
            }
        }

        for spec in by_id.values() {
            for component in spec.selectors.hints.components.values() {
                match by_id.get(component) {
                    Some(c) if c.primary => {}
                    _ => {
                        return Err(IngestionError::InvalidConfig(format!(
                            "variable '{}' references unknown or non-primary component '{}'",
                            spec.id, component
                        )))
                    }
                }
            }
            if let Some(kind) = spec.derive {
                for role in kind.required_roles() {
                    if !spec.selectors.hints.components.contains_key(*role) {
                        return Err(IngestionError::InvalidConfig(format!(
                            "variable '{}' is missing component role '{}'",
                            spec.id, role
                        )));
                    }
                }
            }
        }

        Ok(Self {
            specs: by_id,
            aliases,
        })
    }

    /// Load variable definitions from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let specs: Vec<VariableSpec> = serde_yaml::from_str(&content).map_err(|e| {
            IngestionError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), count = specs.len(), "Loaded variable definitions");
        Self::new(specs)
    }

    /// The built-in variable table, validated like any loaded table.
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_specs())
    }

    pub fn get(&self, id: &str) -> Option<&VariableSpec> {
        self.specs.get(id)
    }

    /// All variable ids offered for a model, sorted.
    pub fn ids_for(&self, model: Model) -> Vec<String> {
        let mut ids: Vec<String> = self
            .specs
            .values()
            .filter(|s| s.offered_for(model))
            .filter(|s| s.derive.map_or(true, |k| model.supports_derive(k)))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Map a requested id (any alias, any case) to the canonical id.
    pub fn canonical_id(&self, model: Model, requested: &str) -> Option<String> {
        let normalized = model.normalize_var_id(requested);
        if self.specs.contains_key(&normalized) {
            return Some(normalized);
        }
        self.aliases.get(&normalized).cloned()
    }

    /// Resolve a requested variable for a model into a concrete plan.
    pub fn resolve(&self, model: Model, requested: &str) -> Result<ResolvedVariable> {
        let id = self
            .canonical_id(model, requested)
            .ok_or_else(|| IngestionError::UnknownVariable {
                model: model.to_string(),
                variable: requested.to_string(),
            })?;
        let spec = &self.specs[&id];

        if !spec.offered_for(model) {
            return Err(IngestionError::UnsupportedForModel {
                model: model.to_string(),
                variable: id,
                reason: "not offered for this model".into(),
            });
        }

        let plan = match spec.derive {
            None => Plan::Primary(model.select_field(spec)),
            Some(kind) => {
                if !model.supports_derive(kind) {
                    return Err(IngestionError::UnsupportedForModel {
                        model: model.to_string(),
                        variable: id,
                        reason: format!("{:?} composite needs fields the model lacks", kind),
                    });
                }
                let mut components = BTreeMap::new();
                for (role, component_id) in &spec.selectors.hints.components {
                    // Precipitation type roles are optional; only the flags the
                    // model actually publishes are requested.
                    if let Some(ptype) = PrecipType::from_role(role) {
                        if !kind.uses_precip_types() || !model.precip_types().contains(&ptype) {
                            continue;
                        }
                    }
                    let component = &self.specs[component_id];
                    components.insert(role.clone(), model.select_field(component));
                }
                Plan::Derived { kind, components }
            }
        };

        Ok(ResolvedVariable {
            model,
            spec: spec.clone(),
            plan,
        })
    }
}

fn filters(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn primary(
    id: &str,
    name: &str,
    keys: &[(&str, &str)],
    search: &str,
    hints: Hints,
    aliases: &[&str],
) -> VariableSpec {
    VariableSpec {
        id: id.to_string(),
        name: name.to_string(),
        primary: true,
        derived: false,
        derive: None,
        selectors: Selectors {
            filter_keys: filters(keys),
            search: vec![search.to_string()],
            hints,
        },
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
        models: Vec::new(),
    }
}

fn derived(id: &str, name: &str, kind: DeriveKind, hints: Hints, aliases: &[&str]) -> VariableSpec {
    VariableSpec {
        id: id.to_string(),
        name: name.to_string(),
        primary: false,
        derived: true,
        derive: Some(kind),
        selectors: Selectors {
            filter_keys: BTreeMap::new(),
            search: Vec::new(),
            hints,
        },
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
        models: Vec::new(),
    }
}

fn continuous(units: &str, range: (f32, f32)) -> Hints {
    Hints {
        units: Some(units.to_string()),
        value_range: Some(range),
        ..Default::default()
    }
}

fn flag() -> Hints {
    Hints {
        units: Some("flag".to_string()),
        categorical: true,
        ..Default::default()
    }
}

fn ptype_components(first: (&str, &str)) -> BTreeMap<String, String> {
    let mut components = filters(&[first]);
    components.extend(filters(&[
        ("rain", "crain"),
        ("snow", "csnow"),
        ("sleet", "cicep"),
        ("frzr", "cfrzr"),
    ]));
    components
}

fn builtin_specs() -> Vec<VariableSpec> {
    let hag = "heightAboveGround";
    vec![
        primary(
            "tmp2m",
            "2 m Temperature",
            &[("shortName", "2t"), ("typeOfLevel", hag), ("level", "2")],
            ":TMP:2 m above ground:",
            continuous("K", (220.0, 330.0)),
            &["temperature", "tmp2"],
        ),
        primary(
            "dpt2m",
            "2 m Dew Point",
            &[("shortName", "2d"), ("typeOfLevel", hag), ("level", "2")],
            ":DPT:2 m above ground:",
            continuous("K", (220.0, 310.0)),
            &["dewpoint"],
        ),
        primary(
            "ugrd10m",
            "10 m U Wind",
            &[("shortName", "10u"), ("typeOfLevel", hag), ("level", "10")],
            ":UGRD:10 m above ground:",
            continuous("m/s", (-60.0, 60.0)),
            &[],
        ),
        primary(
            "vgrd10m",
            "10 m V Wind",
            &[("shortName", "10v"), ("typeOfLevel", hag), ("level", "10")],
            ":VGRD:10 m above ground:",
            continuous("m/s", (-60.0, 60.0)),
            &[],
        ),
        primary(
            "gust",
            "Surface Wind Gust",
            &[("shortName", "gust"), ("typeOfLevel", "surface")],
            ":GUST:surface:",
            continuous("m/s", (0.0, 60.0)),
            &[],
        ),
        primary(
            "prmsl",
            "Mean Sea Level Pressure",
            &[("shortName", "prmsl"), ("typeOfLevel", "meanSea")],
            ":PRMSL:mean sea level:",
            continuous("Pa", (94000.0, 106000.0)),
            &["mslp"],
        ),
        primary(
            "refc",
            "Composite Reflectivity",
            &[("shortName", "refc"), ("typeOfLevel", "atmosphere")],
            ":REFC:entire atmosphere",
            Hints {
                min_significant: Some(crate::derive::MIN_REFLECTIVITY_DBZ),
                ..continuous("dBZ", (-10.0, 75.0))
            },
            &["radar", "reflectivity"],
        ),
        primary(
            "prate",
            "Precipitation Rate",
            &[("shortName", "prate"), ("typeOfLevel", "surface")],
            ":PRATE:surface:",
            continuous("kg m-2 s-1", (0.0, 0.01)),
            &["precip_rate"],
        ),
        primary("crain", "Categorical Rain", &[("shortName", "crain"), ("typeOfLevel", "surface")], ":CRAIN:surface:", flag(), &[]),
        primary("csnow", "Categorical Snow", &[("shortName", "csnow"), ("typeOfLevel", "surface")], ":CSNOW:surface:", flag(), &[]),
        primary("cicep", "Categorical Ice Pellets", &[("shortName", "cicep"), ("typeOfLevel", "surface")], ":CICEP:surface:", flag(), &[]),
        primary("cfrzr", "Categorical Freezing Rain", &[("shortName", "cfrzr"), ("typeOfLevel", "surface")], ":CFRZR:surface:", flag(), &[]),
        derived(
            "wspd10m",
            "10 m Wind Speed",
            DeriveKind::WindSpeed,
            Hints {
                components: filters(&[("u", "ugrd10m"), ("v", "vgrd10m")]),
                ..continuous("mph", (0.0, 120.0))
            },
            &["wind_speed", "ws10"],
        ),
        derived(
            "radar_ptype",
            "Reflectivity by Precipitation Type",
            DeriveKind::RadarPtype,
            Hints {
                units: Some("dBZ".to_string()),
                categorical: true,
                min_significant: Some(crate::derive::MIN_REFLECTIVITY_DBZ),
                components: ptype_components(("refl", "refc")),
                ..Default::default()
            },
            &["radar_type"],
        ),
        derived(
            "precip_ptype",
            "Precipitation Intensity by Type",
            DeriveKind::PrecipTypeIntensity,
            Hints {
                units: Some("mm/hr".to_string()),
                categorical: true,
                min_significant: Some(crate::derive::MIN_PRECIP_RATE_MM_HR),
                components: ptype_components(("rate", "prate")),
                ..Default::default()
            },
            &["ptype_intensity"],
        ),
    ]
}
