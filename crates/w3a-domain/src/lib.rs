#![forbid(unsafe_code)]

//! Shared data model for W-3A plugging plans.
//!
//! Facts and the effective policy are inputs owned by callers. Steps and the
//! plan document are produced by `w3a-kernel`, with materials filled in by
//! `w3a-materials`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const KERNEL_VERSION: &str = "w3a-kernel.v1";

/// Cubic feet per oilfield barrel.
pub const FT3_PER_BBL: f64 = 5.6146;
pub const GAL_PER_BBL: f64 = 42.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PlanError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("missing recipe: {0}")]
    MissingRecipe(String),
    #[error("missing geometry default: {0}")]
    MissingGeometryDefault(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    #[default]
    Nearest,
    Ceil,
    Floor,
}

impl RoundingMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Ceil => "ceil",
            Self::Floor => "floor",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "nearest" => Some(Self::Nearest),
            "ceil" => Some(Self::Ceil),
            "floor" => Some(Self::Floor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GeometryContext {
    OpenHole,
    CasedProduction,
    CasedIntermediate,
    CasedSurface,
}

impl GeometryContext {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenHole => "open_hole",
            Self::CasedProduction => "cased_production",
            Self::CasedIntermediate => "cased_intermediate",
            Self::CasedSurface => "cased_surface",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open_hole" => Some(Self::OpenHole),
            "cased_production" => Some(Self::CasedProduction),
            "cased_intermediate" => Some(Self::CasedIntermediate),
            "cased_surface" => Some(Self::CasedSurface),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cased(self) -> bool {
        !matches!(self, Self::OpenHole)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SurfaceCasingShoePlug,
    CibpCap,
    UqwIsolationPlug,
    CementPlug,
    Squeeze,
    PerfCirculate,
    FormationTopPlug,
}

impl StepType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SurfaceCasingShoePlug => "surface_casing_shoe_plug",
            Self::CibpCap => "cibp_cap",
            Self::UqwIsolationPlug => "uqw_isolation_plug",
            Self::CementPlug => "cement_plug",
            Self::Squeeze => "squeeze",
            Self::PerfCirculate => "perf_circulate",
            Self::FormationTopPlug => "formation_top_plug",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "surface_casing_shoe_plug" => Some(Self::SurfaceCasingShoePlug),
            "cibp_cap" => Some(Self::CibpCap),
            "uqw_isolation_plug" => Some(Self::UqwIsolationPlug),
            "cement_plug" => Some(Self::CementPlug),
            "squeeze" => Some(Self::Squeeze),
            "perf_circulate" => Some(Self::PerfCirculate),
            "formation_top_plug" => Some(Self::FormationTopPlug),
            _ => None,
        }
    }

    /// Step types that must end the materials pass with an integer sack count.
    #[must_use]
    pub fn requires_cement(self) -> bool {
        !matches!(self, Self::PerfCirculate)
    }

    /// Step types that district tagging triggers apply to.
    #[must_use]
    pub fn is_tag_sensitive(self) -> bool {
        matches!(self, Self::SurfaceCasingShoePlug | Self::UqwIsolationPlug)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Fact {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            value,
            units: None,
            provenance: None,
            confidence: None,
        }
    }
}

pub type FactMap = BTreeMap<String, Fact>;

/// Typed view over a fact map. Missing or mistyped facts fall back to
/// `None`/`false`; reading facts never fails.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct WellFacts {
    pub api14: Option<String>,
    pub state: Option<String>,
    pub district: Option<String>,
    pub county: Option<String>,
    pub field: Option<String>,
    pub lease: Option<String>,
    pub well_no: Option<String>,
    pub has_uqw: bool,
    pub use_cibp: bool,
    pub uqw_base_ft: Option<f64>,
    pub surface_shoe_ft: Option<f64>,
    pub cibp_ft: Option<f64>,
}

impl WellFacts {
    #[must_use]
    pub fn from_facts(facts: &FactMap) -> Self {
        Self {
            api14: fact_text(facts, "api14"),
            state: fact_text(facts, "state"),
            district: fact_text(facts, "district"),
            county: fact_text(facts, "county"),
            field: fact_text(facts, "field"),
            lease: fact_text(facts, "lease"),
            well_no: fact_text(facts, "well_no"),
            has_uqw: fact_flag(facts, "has_uqw"),
            use_cibp: fact_flag(facts, "use_cibp"),
            uqw_base_ft: fact_number(facts, "uqw_base_ft"),
            surface_shoe_ft: fact_number(facts, "surface_shoe_ft"),
            cibp_ft: fact_number(facts, "cibp_ft"),
        }
    }
}

#[must_use]
pub fn fact_text(facts: &FactMap, key: &str) -> Option<String> {
    match facts.get(key).map(|fact| &fact.value) {
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

#[must_use]
pub fn fact_flag(facts: &FactMap, key: &str) -> bool {
    match facts.get(key).map(|fact| &fact.value) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "1"
        ),
        Some(Value::Number(number)) => number.as_f64().is_some_and(|value| value != 0.0),
        _ => false,
    }
}

#[must_use]
pub fn fact_number(facts: &FactMap, key: &str) -> Option<f64> {
    match facts.get(key).map(|fact| &fact.value) {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|value| value.is_finite())
}

/// Canonical 8-digit well id from an API number in 8, 10 or 14 digit form.
///
/// The id is the last 8 digits of the API-10 number. A 14-digit API carries
/// a 4-digit sidetrack and event suffix, which is dropped before taking the
/// last 8 digits, so `42-003-46118-00-00` and `4200346118` share an id.
#[must_use]
pub fn canonical_well_id(api: &str) -> Option<String> {
    let digits: String = api.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 8 {
        return None;
    }
    let base = if digits.len() >= 10 {
        &digits[..10]
    } else {
        digits.as_str()
    };
    Some(base[base.len() - 8..].to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Additive {
    #[serde(default)]
    pub name: Option<String>,
    pub rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlurryRecipe {
    pub recipe_id: String,
    pub cement_class: String,
    pub density_ppg: f64,
    pub yield_ft3_per_sk: f64,
    pub water_gal_per_sk: f64,
    #[serde(default)]
    pub additives: Vec<Additive>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub value: Value,
    #[serde(default)]
    pub citation_keys: Vec<String>,
}

impl Requirement {
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequirementSet {
    #[serde(default)]
    pub requirements: BTreeMap<String, Requirement>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeometryDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_context: Option<GeometryContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub casing_id_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stinger_od_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stinger_id_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hole_d_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annular_excess: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squeeze_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_length_ft: Option<f64>,
    /// Surface shoe plug set as a cement cap on a bridge plug rather than
    /// as a balanced plug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_style: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FluidPolicy {
    #[serde(default = "default_spacer_min_bbl")]
    pub spacer_min_bbl: f64,
    #[serde(default = "default_spacer_multiple")]
    pub spacer_multiple: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_rate_bpm: Option<f64>,
    #[serde(default)]
    pub displacement_margin_bbl: f64,
}

impl Default for FluidPolicy {
    fn default() -> Self {
        Self {
            spacer_min_bbl: default_spacer_min_bbl(),
            spacer_multiple: default_spacer_multiple(),
            contact_minutes: None,
            pump_rate_bpm: None,
            displacement_margin_bbl: 0.0,
        }
    }
}

fn default_spacer_min_bbl() -> f64 {
    5.0
}

fn default_spacer_multiple() -> f64 {
    1.5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_recipe: Option<SlurryRecipe>,
    #[serde(default)]
    pub geometry_defaults: BTreeMap<String, GeometryDefaults>,
    #[serde(default)]
    pub rounding_policy: RoundingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluids: Option<FluidPolicy>,
}

impl Preferences {
    #[must_use]
    pub fn geometry_defaults_for(&self, step_type: StepType) -> Option<&GeometryDefaults> {
        self.geometry_defaults.get(step_type.as_str())
    }
}

/// Geometry fields an override entry may carry. Which of them survive onto
/// the step depends on the entry's geometry context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeometryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_context: Option<GeometryContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hole_d_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub casing_id_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stinger_od_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stinger_id_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annular_excess: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AnnulusSegment {
    pub top_ft: f64,
    pub bottom_ft: f64,
    pub hole_d_in: f64,
    pub pipe_od_in: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CementPlugOverride {
    pub top_ft: f64,
    pub bottom_ft: f64,
    #[serde(flatten)]
    pub geometry: GeometryOverride,
    #[serde(default)]
    pub segments: Vec<AnnulusSegment>,
    #[serde(default)]
    pub recipe: Option<SlurryRecipe>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub tag_required: Option<bool>,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerfCirculateOverride {
    pub top_ft: f64,
    pub bottom_ft: f64,
    #[serde(default)]
    pub perf_ft: Option<f64>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqueezeOverride {
    pub top_ft: f64,
    pub bottom_ft: f64,
    #[serde(default)]
    pub squeeze_factor: Option<f64>,
    #[serde(flatten)]
    pub geometry: GeometryOverride,
    #[serde(default)]
    pub recipe: Option<SlurryRecipe>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub tag_required: Option<bool>,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CibpCapOverride {
    #[serde(default)]
    pub cibp_ft: Option<f64>,
    #[serde(default)]
    pub cap_length_ft: Option<f64>,
    #[serde(flatten)]
    pub geometry: GeometryOverride,
    #[serde(default)]
    pub recipe: Option<SlurryRecipe>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub tag_required: Option<bool>,
}

/// Per-step-type overrides. A policy document may give any entry as a single
/// object or a list; both deserialize to a list in document order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepsOverrides {
    #[serde(default, deserialize_with = "one_or_many")]
    pub perf_circulate: Vec<PerfCirculateOverride>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub squeeze_via_perf: Vec<SqueezeOverride>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cibp_cap: Vec<CibpCapOverride>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cement_plugs: Vec<CementPlugOverride>,
}

impl StepsOverrides {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.perf_circulate.is_empty()
            && self.squeeze_via_perf.is_empty()
            && self.cibp_cap.is_empty()
            && self.cement_plugs.is_empty()
    }
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
        None => Vec::new(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtectInterval {
    pub top_ft: f64,
    pub bottom_ft: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormationTopEntry {
    pub formation: String,
    pub top_ft: f64,
    #[serde(default)]
    pub plug_required: bool,
    #[serde(default)]
    pub tag_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_context: Option<GeometryContext>,
    #[serde(default)]
    pub citations: Vec<String>,
}

/// District (and nested county) overlay flags and data.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DistrictOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wbl: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protect_intervals: Vec<ProtectInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_recovery_zone: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formation_tops: Vec<FormationTopEntry>,
    #[serde(default)]
    pub pump_via_tubing_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_mud_weight_ppg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funnel_viscosity_s_per_qt: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counties: BTreeMap<String, DistrictOverlay>,
}

impl DistrictOverlay {
    /// Any one tagging trigger is sufficient.
    #[must_use]
    pub fn requires_tagging(&self) -> bool {
        overlay_value_present(self.tag.as_ref())
            || overlay_value_present(self.wbl.as_ref())
            || !self.protect_intervals.is_empty()
            || overlay_value_present(self.enhanced_recovery_zone.as_ref())
    }

    #[must_use]
    pub fn county_overlay(&self, county: &str) -> Option<&DistrictOverlay> {
        let wanted = normalize_county_name(county);
        self.counties
            .iter()
            .find(|(name, _)| normalize_county_name(name) == wanted)
            .map(|(_, overlay)| overlay)
    }

    /// District overlay with the matching county overlay applied on top.
    /// Flags combine as a union; scalar values from the county win.
    #[must_use]
    pub fn resolved_for_county(&self, county: Option<&str>) -> DistrictOverlay {
        let mut merged = DistrictOverlay {
            counties: BTreeMap::new(),
            ..self.clone()
        };
        let Some(county_overlay) = county.and_then(|name| self.county_overlay(name)) else {
            return merged;
        };

        if overlay_value_present(county_overlay.tag.as_ref()) {
            merged.tag.clone_from(&county_overlay.tag);
        }
        if overlay_value_present(county_overlay.wbl.as_ref()) {
            merged.wbl.clone_from(&county_overlay.wbl);
        }
        if overlay_value_present(county_overlay.enhanced_recovery_zone.as_ref()) {
            merged
                .enhanced_recovery_zone
                .clone_from(&county_overlay.enhanced_recovery_zone);
        }
        merged
            .protect_intervals
            .extend(county_overlay.protect_intervals.iter().cloned());
        merged
            .formation_tops
            .extend(county_overlay.formation_tops.iter().cloned());
        merged.pump_via_tubing_only |= county_overlay.pump_via_tubing_only;
        if county_overlay.min_mud_weight_ppg.is_some() {
            merged.min_mud_weight_ppg = county_overlay.min_mud_weight_ppg;
        }
        if county_overlay.funnel_viscosity_s_per_qt.is_some() {
            merged.funnel_viscosity_s_per_qt = county_overlay.funnel_viscosity_s_per_qt;
        }
        merged
    }
}

fn overlay_value_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null | Value::Bool(false)) => false,
        Some(Value::String(text)) => !text.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

/// "Andrews County", "andrews" and " ANDREWS " all name the same county.
#[must_use]
pub fn normalize_county_name(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    lowered
        .strip_suffix(" county")
        .unwrap_or(&lowered)
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSection {
    #[serde(default)]
    pub requirements: BTreeMap<String, Requirement>,
    #[serde(default)]
    pub steps_overrides: StepsOverrides,
    #[serde(default)]
    pub district_overrides: DistrictOverlay,
}

/// A resolved policy: base rules merged with district and county overlays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectivePolicy {
    pub policy_id: String,
    #[serde(default)]
    pub policy_version: String,
    pub jurisdiction: String,
    pub form: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    pub complete: bool,
    #[serde(default)]
    pub incomplete_reasons: Vec<String>,
    #[serde(default)]
    pub base: RequirementSet,
    #[serde(default)]
    pub effective: EffectiveSection,
    #[serde(default)]
    pub preferences: Preferences,
}

impl EffectivePolicy {
    /// Effective requirement for `key`, falling back to the base rules.
    #[must_use]
    pub fn requirement(&self, key: &str) -> Option<&Requirement> {
        self.effective
            .requirements
            .get(key)
            .or_else(|| self.base.requirements.get(key))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenHoleGeometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hole_d_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stinger_od_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stinger_id_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annular_excess: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CasedGeometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub casing_id_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stinger_od_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stinger_id_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annular_excess: Option<f64>,
}

/// Where cement sits: an open hole has no casing ID, a cased interval has no
/// hole diameter. The variant decides which field can exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "geometry_context", rename_all = "snake_case")]
pub enum PlugGeometry {
    OpenHole(OpenHoleGeometry),
    CasedProduction(CasedGeometry),
    CasedIntermediate(CasedGeometry),
    CasedSurface(CasedGeometry),
}

impl PlugGeometry {
    #[must_use]
    pub fn empty(context: GeometryContext) -> Self {
        match context {
            GeometryContext::OpenHole => Self::OpenHole(OpenHoleGeometry::default()),
            GeometryContext::CasedProduction => Self::CasedProduction(CasedGeometry::default()),
            GeometryContext::CasedIntermediate => {
                Self::CasedIntermediate(CasedGeometry::default())
            }
            GeometryContext::CasedSurface => Self::CasedSurface(CasedGeometry::default()),
        }
    }

    /// Builds a geometry for `context` from an override entry. Returns the
    /// names of fields dropped because they do not belong to the context.
    #[must_use]
    pub fn from_override(
        context: GeometryContext,
        source: &GeometryOverride,
    ) -> (Self, Vec<&'static str>) {
        let mut dropped = Vec::new();
        let geometry = if context.is_cased() {
            if source.hole_d_in.is_some() {
                dropped.push("hole_d_in");
            }
            let cased = CasedGeometry {
                casing_id_in: source.casing_id_in,
                stinger_od_in: source.stinger_od_in,
                stinger_id_in: source.stinger_id_in,
                annular_excess: source.annular_excess,
            };
            match context {
                GeometryContext::CasedIntermediate => Self::CasedIntermediate(cased),
                GeometryContext::CasedSurface => Self::CasedSurface(cased),
                _ => Self::CasedProduction(cased),
            }
        } else {
            if source.casing_id_in.is_some() {
                dropped.push("casing_id_in");
            }
            Self::OpenHole(OpenHoleGeometry {
                hole_d_in: source.hole_d_in,
                stinger_od_in: source.stinger_od_in,
                stinger_id_in: source.stinger_id_in,
                annular_excess: source.annular_excess,
            })
        };
        (geometry, dropped)
    }

    #[must_use]
    pub fn context(&self) -> GeometryContext {
        match self {
            Self::OpenHole(_) => GeometryContext::OpenHole,
            Self::CasedProduction(_) => GeometryContext::CasedProduction,
            Self::CasedIntermediate(_) => GeometryContext::CasedIntermediate,
            Self::CasedSurface(_) => GeometryContext::CasedSurface,
        }
    }

    /// Hole diameter in open hole, casing ID when cased.
    #[must_use]
    pub fn outer_diameter_in(&self) -> Option<f64> {
        match self {
            Self::OpenHole(geometry) => geometry.hole_d_in,
            Self::CasedProduction(geometry)
            | Self::CasedIntermediate(geometry)
            | Self::CasedSurface(geometry) => geometry.casing_id_in,
        }
    }

    #[must_use]
    pub fn outer_field_name(&self) -> &'static str {
        match self {
            Self::OpenHole(_) => "hole_d_in",
            _ => "casing_id_in",
        }
    }

    #[must_use]
    pub fn stinger_od_in(&self) -> Option<f64> {
        match self {
            Self::OpenHole(geometry) => geometry.stinger_od_in,
            Self::CasedProduction(geometry)
            | Self::CasedIntermediate(geometry)
            | Self::CasedSurface(geometry) => geometry.stinger_od_in,
        }
    }

    #[must_use]
    pub fn stinger_id_in(&self) -> Option<f64> {
        match self {
            Self::OpenHole(geometry) => geometry.stinger_id_in,
            Self::CasedProduction(geometry)
            | Self::CasedIntermediate(geometry)
            | Self::CasedSurface(geometry) => geometry.stinger_id_in,
        }
    }

    #[must_use]
    pub fn annular_excess(&self) -> Option<f64> {
        match self {
            Self::OpenHole(geometry) => geometry.annular_excess,
            Self::CasedProduction(geometry)
            | Self::CasedIntermediate(geometry)
            | Self::CasedSurface(geometry) => geometry.annular_excess,
        }
    }

    /// Fills missing fields from step-type defaults. Only the field that
    /// belongs to the context is taken: open hole never picks up a casing ID.
    pub fn fill_from(&mut self, defaults: &GeometryDefaults) {
        match self {
            Self::OpenHole(geometry) => {
                geometry.hole_d_in = geometry.hole_d_in.or(defaults.hole_d_in);
                geometry.stinger_od_in = geometry.stinger_od_in.or(defaults.stinger_od_in);
                geometry.stinger_id_in = geometry.stinger_id_in.or(defaults.stinger_id_in);
                geometry.annular_excess = geometry.annular_excess.or(defaults.annular_excess);
            }
            Self::CasedProduction(geometry)
            | Self::CasedIntermediate(geometry)
            | Self::CasedSurface(geometry) => {
                geometry.casing_id_in = geometry.casing_id_in.or(defaults.casing_id_in);
                geometry.stinger_od_in = geometry.stinger_od_in.or(defaults.stinger_od_in);
                geometry.stinger_id_in = geometry.stinger_id_in.or(defaults.stinger_id_in);
                geometry.annular_excess = geometry.annular_excess.or(defaults.annular_excess);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShoePlugStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_ft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom_ft: Option<f64>,
    pub min_length_ft: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface_shoe_ft: Option<f64>,
    /// Cement cap on a bridge plug (annulus only); otherwise a balanced plug.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cap_style: bool,
    #[serde(flatten)]
    pub geometry: PlugGeometry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CibpCapStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cibp_ft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_ft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom_ft: Option<f64>,
    pub cap_length_ft: f64,
    #[serde(flatten)]
    pub geometry: PlugGeometry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalancedPlugStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_ft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom_ft: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length_ft: Option<f64>,
    #[serde(flatten)]
    pub geometry: PlugGeometry,
}

impl BalancedPlugStep {
    /// Interval length when both bounds are known, else the minimum length.
    #[must_use]
    pub fn length_ft(&self) -> Option<f64> {
        interval_length(self.top_ft, self.bottom_ft).or(self.min_length_ft)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UqwIsolationStep {
    #[serde(flatten)]
    pub plug: BalancedPlugStep,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uqw_base_ft: Option<f64>,
    pub below_base_ft: f64,
    pub above_base_ft: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqueezeStep {
    pub top_ft: f64,
    pub bottom_ft: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squeeze_factor: Option<f64>,
    #[serde(flatten)]
    pub geometry: PlugGeometry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerfCirculateStep {
    pub top_ft: f64,
    pub bottom_ft: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf_ft: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormationTopStep {
    pub formation: String,
    pub formation_top_ft: f64,
    pub plug_required: bool,
    #[serde(flatten)]
    pub plug: BalancedPlugStep,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    SurfaceCasingShoePlug(ShoePlugStep),
    CibpCap(CibpCapStep),
    UqwIsolationPlug(UqwIsolationStep),
    CementPlug(BalancedPlugStep),
    Squeeze(SqueezeStep),
    PerfCirculate(PerfCirculateStep),
    FormationTopPlug(FormationTopStep),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SlurryExplain {
    pub recipe_id: String,
    pub cement_class: String,
    pub yield_ft3_per_sk: f64,
    pub water_gal_per_sk: f64,
    pub rounding: RoundingMode,
    pub raw_sacks: f64,
    pub ft3_per_bbl: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_components: BTreeMap<String, f64>,
}

/// Canonical slurry result attached under `materials.slurry`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VolumeBreakdown {
    pub total_bbl: f64,
    pub sacks: u32,
    pub ft3: f64,
    pub water_bbl: f64,
    pub additives: BTreeMap<String, f64>,
    pub explain: SlurryExplain,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FluidsBreakdown {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spacer_bbl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displacement_bbl: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Materials {
    #[serde(default, with = "slurry_or_empty")]
    pub slurry: Option<VolumeBreakdown>,
    #[serde(default)]
    pub fluids: FluidsBreakdown,
}

/// A missing slurry is written as `{}`.
mod slurry_or_empty {
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    use super::VolumeBreakdown;

    pub(super) fn serialize<S>(
        value: &Option<VolumeBreakdown>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(breakdown) => breakdown.serialize(serializer),
            None => serializer.serialize_map(Some(0))?.end(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<VolumeBreakdown>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            _ => serde_json::from_value(value)
                .map(Some)
                .map_err(D::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<AnnulusSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<SlurryRecipe>,
    #[serde(default)]
    pub regulatory_basis: Vec<String>,
    #[serde(default)]
    pub tag_required: bool,
    #[serde(default)]
    pub special_instructions: String,
    #[serde(default)]
    pub materials: Materials,
}

impl Step {
    #[must_use]
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            segments: Vec::new(),
            recipe: None,
            regulatory_basis: Vec::new(),
            tag_required: false,
            special_instructions: String::new(),
            materials: Materials::default(),
        }
    }

    #[must_use]
    pub fn step_type(&self) -> StepType {
        match &self.kind {
            StepKind::SurfaceCasingShoePlug(_) => StepType::SurfaceCasingShoePlug,
            StepKind::CibpCap(_) => StepType::CibpCap,
            StepKind::UqwIsolationPlug(_) => StepType::UqwIsolationPlug,
            StepKind::CementPlug(_) => StepType::CementPlug,
            StepKind::Squeeze(_) => StepType::Squeeze,
            StepKind::PerfCirculate(_) => StepType::PerfCirculate,
            StepKind::FormationTopPlug(_) => StepType::FormationTopPlug,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> Option<&PlugGeometry> {
        match &self.kind {
            StepKind::SurfaceCasingShoePlug(step) => Some(&step.geometry),
            StepKind::CibpCap(step) => Some(&step.geometry),
            StepKind::UqwIsolationPlug(step) => Some(&step.plug.geometry),
            StepKind::CementPlug(step) => Some(&step.geometry),
            StepKind::Squeeze(step) => Some(&step.geometry),
            StepKind::FormationTopPlug(step) => Some(&step.plug.geometry),
            StepKind::PerfCirculate(_) => None,
        }
    }

    #[must_use]
    pub fn geometry_mut(&mut self) -> Option<&mut PlugGeometry> {
        match &mut self.kind {
            StepKind::SurfaceCasingShoePlug(step) => Some(&mut step.geometry),
            StepKind::CibpCap(step) => Some(&mut step.geometry),
            StepKind::UqwIsolationPlug(step) => Some(&mut step.plug.geometry),
            StepKind::CementPlug(step) => Some(&mut step.geometry),
            StepKind::Squeeze(step) => Some(&mut step.geometry),
            StepKind::FormationTopPlug(step) => Some(&mut step.plug.geometry),
            StepKind::PerfCirculate(_) => None,
        }
    }

    /// `(top_ft, bottom_ft)` when the step has a located interval.
    #[must_use]
    pub fn interval(&self) -> Option<(f64, f64)> {
        let (top, bottom) = match &self.kind {
            StepKind::SurfaceCasingShoePlug(step) => (step.top_ft, step.bottom_ft),
            StepKind::CibpCap(step) => (step.top_ft, step.bottom_ft),
            StepKind::UqwIsolationPlug(step) => (step.plug.top_ft, step.plug.bottom_ft),
            StepKind::CementPlug(step) => (step.top_ft, step.bottom_ft),
            StepKind::Squeeze(step) => (Some(step.top_ft), Some(step.bottom_ft)),
            StepKind::PerfCirculate(step) => (Some(step.top_ft), Some(step.bottom_ft)),
            StepKind::FormationTopPlug(step) => (step.plug.top_ft, step.plug.bottom_ft),
        };
        top.zip(bottom)
    }

    #[must_use]
    pub fn sacks(&self) -> Option<u32> {
        self.materials.slurry.as_ref().map(|slurry| slurry.sacks)
    }

    pub fn append_instruction(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() || self.special_instructions.contains(text) {
            return;
        }
        if !self.special_instructions.is_empty() {
            self.special_instructions.push_str("; ");
        }
        self.special_instructions.push_str(text);
    }

    pub fn extend_basis<I, S>(&mut self, citations: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for citation in citations {
            let citation = citation.as_ref().trim();
            if !citation.is_empty() && !self.regulatory_basis.iter().any(|c| c == citation) {
                self.regulatory_basis.push(citation.to_string());
            }
        }
    }
}

#[must_use]
pub fn interval_length(top_ft: Option<f64>, bottom_ft: Option<f64>) -> Option<f64> {
    match (top_ft, bottom_ft) {
        (Some(top), Some(bottom)) => Some(bottom - top),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub code: String,
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// Reserved: no check produces violations yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputsSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api14: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub well_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub well_no: Option<String>,
}

impl From<&WellFacts> for InputsSummary {
    fn from(value: &WellFacts) -> Self {
        Self {
            api14: value.api14.clone(),
            well_id: value.api14.as_deref().and_then(canonical_well_id),
            state: value.state.clone(),
            district: value.district.clone(),
            county: value.county.clone(),
            field: value.field.clone(),
            lease: value.lease.clone(),
            well_no: value.well_no.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDocument {
    pub kernel_version: String,
    pub policy_id: String,
    pub policy_version: String,
    pub jurisdiction: String,
    pub form: String,
    pub district: Option<String>,
    pub policy_complete: bool,
    pub constraints: Vec<Constraint>,
    pub violations: Vec<Violation>,
    pub rounding_policy: RoundingMode,
    pub citations: Vec<String>,
    pub inputs_summary: InputsSummary,
    pub steps: Vec<Step>,
}

impl PlanDocument {
    #[must_use]
    pub fn steps_of_type(&self, step_type: StepType) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| step.step_type() == step_type)
            .collect()
    }
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}
