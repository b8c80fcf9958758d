#![forbid(unsafe_code)]

//! Boundary loaders: effective policies, policy packs and facts documents.
//!
//! Everything here runs before the kernel. Documents are parsed, validated
//! and normalized once; the kernel only ever sees the resulting values.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use w3a_domain::{
    hash_bytes, hash_json, DistrictOverlay, EffectivePolicy, EffectiveSection, Fact, FactMap,
    FluidPolicy, GeometryDefaults, Preferences, Requirement, RequirementSet, RoundingMode,
    SlurryRecipe, StepsOverrides,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }

    /// `.json` files are JSON; anything else is read as YAML.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

fn parse_document<T>(text: &str, format: DocumentFormat, what: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    match format {
        DocumentFormat::Yaml => serde_yaml::from_str(text)
            .map_err(|err| anyhow!("invalid {what} YAML structure: {err}")),
        DocumentFormat::Json => serde_json::from_str(text)
            .map_err(|err| anyhow!("invalid {what} JSON structure: {err}")),
    }
}

fn read_document(path: &Path) -> Result<(String, DocumentFormat)> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok((content, DocumentFormat::from_path(path)))
}

/// # Errors
/// Returns an error when the value is blank.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PolicyEnvelope {
    pub source_format: String,
    pub source_hash: String,
    pub normalized_hash: String,
    pub policy: EffectivePolicy,
    pub normalized_json: Value,
}

/// Load an effective policy from disk and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or normalized.
pub fn load_policy_from_path(path: &Path) -> Result<PolicyEnvelope> {
    let (content, format) = read_document(path)?;
    normalize_policy_document(&content, format)
        .with_context(|| format!("policy document {}", path.display()))
}

/// Normalize an effective policy document into canonical form + hashes.
///
/// # Errors
/// Returns an error when parsing, validation, or serialization fails.
pub fn normalize_policy_document(text: &str, format: DocumentFormat) -> Result<PolicyEnvelope> {
    let source_hash = hash_bytes(text.as_bytes());
    let mut policy: EffectivePolicy = parse_document(text, format, "policy")?;

    validate_policy(&policy)?;
    normalize_policy(&mut policy);
    validate_policy(&policy)?;

    envelope(policy, format.as_str(), source_hash)
}

/// Wraps an already-built policy (for example one resolved from a pack).
///
/// # Errors
/// Returns an error when validation or serialization fails.
pub fn policy_envelope(mut policy: EffectivePolicy, source_format: &str) -> Result<PolicyEnvelope> {
    validate_policy(&policy)?;
    normalize_policy(&mut policy);
    let source_hash = hash_json(&serde_json::to_value(&policy)?)?;
    envelope(policy, source_format, source_hash)
}

fn envelope(policy: EffectivePolicy, source_format: &str, source_hash: String) -> Result<PolicyEnvelope> {
    let normalized_json = serde_json::to_value(&policy)?;
    let normalized_hash = hash_json(&normalized_json)?;
    tracing::debug!(
        policy_id = %policy.policy_id,
        complete = policy.complete,
        %normalized_hash,
        "normalized policy document"
    );
    Ok(PolicyEnvelope {
        source_format: source_format.to_string(),
        source_hash,
        normalized_hash,
        policy,
        normalized_json,
    })
}

/// # Errors
/// Returns an error naming the first field that fails validation.
pub fn validate_policy(policy: &EffectivePolicy) -> Result<()> {
    ensure_non_empty("policy_id", &policy.policy_id)?;
    ensure_non_empty("jurisdiction", &policy.jurisdiction)?;
    ensure_non_empty("form", &policy.form)?;
    validate_preferences(&policy.preferences)?;
    for recipe in override_recipes(&policy.effective.steps_overrides) {
        validate_recipe(recipe)?;
    }
    Ok(())
}

fn validate_preferences(preferences: &Preferences) -> Result<()> {
    if let Some(recipe) = &preferences.default_recipe {
        validate_recipe(recipe)?;
    }
    for (step_type, defaults) in &preferences.geometry_defaults {
        validate_geometry_defaults(step_type, defaults)?;
    }
    if let Some(fluids) = &preferences.fluids {
        validate_fluids(fluids)?;
    }
    Ok(())
}

fn validate_recipe(recipe: &SlurryRecipe) -> Result<()> {
    ensure_non_empty("recipe_id", &recipe.recipe_id)?;
    if !(recipe.yield_ft3_per_sk.is_finite() && recipe.yield_ft3_per_sk > 0.0) {
        return Err(anyhow!(
            "recipe {} yield_ft3_per_sk MUST be > 0",
            recipe.recipe_id
        ));
    }
    if !(recipe.water_gal_per_sk.is_finite() && recipe.water_gal_per_sk >= 0.0) {
        return Err(anyhow!(
            "recipe {} water_gal_per_sk MUST be >= 0",
            recipe.recipe_id
        ));
    }
    Ok(())
}

fn validate_geometry_defaults(step_type: &str, defaults: &GeometryDefaults) -> Result<()> {
    let positive = [
        ("casing_id_in", defaults.casing_id_in),
        ("stinger_od_in", defaults.stinger_od_in),
        ("stinger_id_in", defaults.stinger_id_in),
        ("hole_d_in", defaults.hole_d_in),
        ("cap_length_ft", defaults.cap_length_ft),
    ];
    for (field, value) in positive {
        if let Some(value) = value {
            if !(value.is_finite() && value > 0.0) {
                return Err(anyhow!(
                    "geometry_defaults.{step_type}.{field} MUST be > 0 (got {value})"
                ));
            }
        }
    }
    if let Some(excess) = defaults.annular_excess {
        if !(excess.is_finite() && excess >= 0.0) {
            return Err(anyhow!(
                "geometry_defaults.{step_type}.annular_excess MUST be >= 0 (got {excess})"
            ));
        }
    }
    if let Some(factor) = defaults.squeeze_factor {
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(anyhow!(
                "geometry_defaults.{step_type}.squeeze_factor MUST be >= 1.0 (got {factor})"
            ));
        }
    }
    Ok(())
}

fn validate_fluids(fluids: &FluidPolicy) -> Result<()> {
    let values = [
        ("spacer_min_bbl", Some(fluids.spacer_min_bbl)),
        ("spacer_multiple", Some(fluids.spacer_multiple)),
        ("contact_minutes", fluids.contact_minutes),
        ("pump_rate_bpm", fluids.pump_rate_bpm),
        ("displacement_margin_bbl", Some(fluids.displacement_margin_bbl)),
    ];
    for (field, value) in values {
        if let Some(value) = value {
            if !(value.is_finite() && value >= 0.0) {
                return Err(anyhow!("fluids.{field} MUST be >= 0 (got {value})"));
            }
        }
    }
    Ok(())
}

fn override_recipes(overrides: &StepsOverrides) -> impl Iterator<Item = &SlurryRecipe> {
    overrides
        .squeeze_via_perf
        .iter()
        .filter_map(|entry| entry.recipe.as_ref())
        .chain(
            overrides
                .cibp_cap
                .iter()
                .filter_map(|entry| entry.recipe.as_ref()),
        )
        .chain(
            overrides
                .cement_plugs
                .iter()
                .filter_map(|entry| entry.recipe.as_ref()),
        )
}

fn normalize_policy(policy: &mut EffectivePolicy) {
    policy.policy_id = policy.policy_id.trim().to_string();
    policy.jurisdiction = policy.jurisdiction.trim().to_string();
    policy.form = policy.form.trim().to_string();
    policy.district = policy
        .district
        .as_deref()
        .map(str::trim)
        .filter(|district| !district.is_empty())
        .map(str::to_string);

    let mut reasons: Vec<String> = policy
        .incomplete_reasons
        .iter()
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty())
        .collect();
    reasons.sort();
    reasons.dedup();
    policy.incomplete_reasons = reasons;

    for requirement in policy
        .base
        .requirements
        .values_mut()
        .chain(policy.effective.requirements.values_mut())
    {
        normalize_citations(&mut requirement.citation_keys);
    }

    let overrides = &mut policy.effective.steps_overrides;
    for entry in &mut overrides.perf_circulate {
        normalize_citations(&mut entry.citations);
    }
    for entry in &mut overrides.squeeze_via_perf {
        normalize_citations(&mut entry.citations);
    }
    for entry in &mut overrides.cibp_cap {
        normalize_citations(&mut entry.citations);
    }
    for entry in &mut overrides.cement_plugs {
        normalize_citations(&mut entry.citations);
    }
    normalize_overlay(&mut policy.effective.district_overrides);
}

fn normalize_overlay(overlay: &mut DistrictOverlay) {
    for entry in &mut overlay.formation_tops {
        entry.formation = entry.formation.trim().to_string();
        normalize_citations(&mut entry.citations);
    }
    for county in overlay.counties.values_mut() {
        normalize_overlay(county);
    }
}

/// Trims citation keys and drops blanks and repeats, keeping first occurrence.
pub fn normalize_citations(citations: &mut Vec<String>) {
    let mut seen: Vec<String> = Vec::with_capacity(citations.len());
    for citation in citations.drain(..) {
        let citation = citation.trim().to_string();
        if !citation.is_empty() && !seen.contains(&citation) {
            seen.push(citation);
        }
    }
    *citations = seen;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackBase {
    #[serde(default)]
    pub requirements: BTreeMap<String, Requirement>,
    #[serde(default)]
    pub steps_overrides: StepsOverrides,
    #[serde(default)]
    pub district_overrides: DistrictOverlay,
    #[serde(default)]
    pub preferences: Preferences,
}

/// Per-field preference changes a district applies over the pack base.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreferencesPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_recipe: Option<SlurryRecipe>,
    #[serde(default)]
    pub geometry_defaults: BTreeMap<String, GeometryDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounding_policy: Option<RoundingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluids: Option<FluidPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DistrictPatch {
    #[serde(default)]
    pub requirements: BTreeMap<String, Requirement>,
    #[serde(default)]
    pub steps_overrides: StepsOverrides,
    #[serde(default)]
    pub district_overrides: Option<DistrictOverlay>,
    #[serde(default)]
    pub preferences: PreferencesPatch,
}

/// Base rules for a jurisdiction plus per-district patches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyPack {
    pub policy_id: String,
    #[serde(default)]
    pub policy_version: String,
    pub jurisdiction: String,
    pub form: String,
    #[serde(default)]
    pub required_requirements: Vec<String>,
    #[serde(default)]
    pub base: PackBase,
    #[serde(default)]
    pub districts: BTreeMap<String, DistrictPatch>,
}

impl PolicyPack {
    /// District codes compare case-insensitively ("08a" finds "08A").
    #[must_use]
    pub fn district(&self, code: &str) -> Option<(&str, &DistrictPatch)> {
        let wanted = code.trim();
        self.districts
            .iter()
            .find(|(name, _)| name.trim().eq_ignore_ascii_case(wanted))
            .map(|(name, patch)| (name.as_str(), patch))
    }
}

/// Load a policy pack from disk and validate it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_pack_from_path(path: &Path) -> Result<PolicyPack> {
    let (content, format) = read_document(path)?;
    parse_pack_document(&content, format)
        .with_context(|| format!("policy pack {}", path.display()))
}

/// # Errors
/// Returns an error when parsing or validation fails.
pub fn parse_pack_document(text: &str, format: DocumentFormat) -> Result<PolicyPack> {
    let pack: PolicyPack = parse_document(text, format, "policy pack")?;
    ensure_non_empty("policy_id", &pack.policy_id)?;
    ensure_non_empty("jurisdiction", &pack.jurisdiction)?;
    ensure_non_empty("form", &pack.form)?;
    validate_preferences(&pack.base.preferences)
        .with_context(|| "base preferences".to_string())?;
    for (code, patch) in &pack.districts {
        ensure_non_empty("district code", code)?;
        if let Some(recipe) = &patch.preferences.default_recipe {
            validate_recipe(recipe).with_context(|| format!("district {code}"))?;
        }
        for (step_type, defaults) in &patch.preferences.geometry_defaults {
            validate_geometry_defaults(step_type, defaults)
                .with_context(|| format!("district {code}"))?;
        }
        if let Some(fluids) = &patch.preferences.fluids {
            validate_fluids(fluids).with_context(|| format!("district {code}"))?;
        }
    }
    Ok(pack)
}

/// Merges the pack base with one district (and that district's county
/// overlay) into an effective policy.
///
/// An unknown district or a required requirement missing after the merge
/// makes the policy incomplete; neither is an error.
#[must_use]
pub fn resolve_pack(
    pack: &PolicyPack,
    district: Option<&str>,
    county: Option<&str>,
) -> EffectivePolicy {
    let mut reasons = Vec::new();
    let mut requirements = pack.base.requirements.clone();
    let mut steps_overrides = pack.base.steps_overrides.clone();
    let mut overlay = pack.base.district_overrides.clone();
    let mut preferences = pack.base.preferences.clone();
    let mut resolved_district = district
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string);

    if let Some(code) = resolved_district.clone() {
        match pack.district(&code) {
            Some((name, patch)) => {
                resolved_district = Some(name.to_string());
                for (key, requirement) in &patch.requirements {
                    requirements.insert(key.clone(), requirement.clone());
                }
                merge_steps_overrides(&mut steps_overrides, &patch.steps_overrides);
                if let Some(district_overlay) = &patch.district_overrides {
                    overlay = district_overlay.clone();
                }
                apply_preferences_patch(&mut preferences, &patch.preferences);
            }
            None => reasons.push(format!(
                "district {code} is not defined in policy pack {}",
                pack.policy_id
            )),
        }
    }

    for key in &pack.required_requirements {
        if !requirements.contains_key(key) {
            reasons.push(format!("missing requirement {key}"));
        }
    }

    if let Some(county) = county {
        overlay = overlay.resolved_for_county(Some(county));
    }

    reasons.sort();
    reasons.dedup();
    let complete = reasons.is_empty();
    if complete {
        tracing::debug!(
            policy_id = %pack.policy_id,
            district = resolved_district.as_deref().unwrap_or("-"),
            requirements = requirements.len(),
            "resolved policy pack"
        );
    } else {
        tracing::warn!(
            policy_id = %pack.policy_id,
            district = resolved_district.as_deref().unwrap_or("-"),
            reasons = reasons.len(),
            "resolved policy pack is incomplete"
        );
    }

    EffectivePolicy {
        policy_id: pack.policy_id.clone(),
        policy_version: pack.policy_version.clone(),
        jurisdiction: pack.jurisdiction.clone(),
        form: pack.form.clone(),
        district: resolved_district,
        complete,
        incomplete_reasons: reasons,
        base: RequirementSet {
            requirements: pack.base.requirements.clone(),
        },
        effective: EffectiveSection {
            requirements,
            steps_overrides,
            district_overrides: overlay,
        },
        preferences,
    }
}

/// A non-empty district list replaces the base list for that key.
fn merge_steps_overrides(target: &mut StepsOverrides, patch: &StepsOverrides) {
    if !patch.perf_circulate.is_empty() {
        target.perf_circulate.clone_from(&patch.perf_circulate);
    }
    if !patch.squeeze_via_perf.is_empty() {
        target.squeeze_via_perf.clone_from(&patch.squeeze_via_perf);
    }
    if !patch.cibp_cap.is_empty() {
        target.cibp_cap.clone_from(&patch.cibp_cap);
    }
    if !patch.cement_plugs.is_empty() {
        target.cement_plugs.clone_from(&patch.cement_plugs);
    }
}

fn apply_preferences_patch(target: &mut Preferences, patch: &PreferencesPatch) {
    if patch.default_recipe.is_some() {
        target.default_recipe.clone_from(&patch.default_recipe);
    }
    if let Some(rounding) = patch.rounding_policy {
        target.rounding_policy = rounding;
    }
    if patch.fluids.is_some() {
        target.fluids.clone_from(&patch.fluids);
    }
    for (step_type, defaults) in &patch.geometry_defaults {
        let entry = target.geometry_defaults.entry(step_type.clone()).or_default();
        merge_geometry_defaults(entry, defaults);
    }
}

fn merge_geometry_defaults(target: &mut GeometryDefaults, patch: &GeometryDefaults) {
    target.geometry_context = patch.geometry_context.or(target.geometry_context);
    target.casing_id_in = patch.casing_id_in.or(target.casing_id_in);
    target.stinger_od_in = patch.stinger_od_in.or(target.stinger_od_in);
    target.stinger_id_in = patch.stinger_id_in.or(target.stinger_id_in);
    target.hole_d_in = patch.hole_d_in.or(target.hole_d_in);
    target.annular_excess = patch.annular_excess.or(target.annular_excess);
    target.squeeze_factor = patch.squeeze_factor.or(target.squeeze_factor);
    target.cap_length_ft = patch.cap_length_ft.or(target.cap_length_ft);
    target.cap_style = patch.cap_style.or(target.cap_style);
}

/// Load a facts document from disk.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_facts_from_path(path: &Path) -> Result<FactMap> {
    let (content, format) = read_document(path)?;
    parse_facts_document(&content, format)
        .with_context(|| format!("facts document {}", path.display()))
}

/// Parses `{key: {value, units?, provenance?, confidence?}}` or the
/// shorthand `{key: value}`. Both give the same fact map.
///
/// # Errors
/// Returns an error when the document is not a mapping or an entry is malformed.
pub fn parse_facts_document(text: &str, format: DocumentFormat) -> Result<FactMap> {
    let document: Value = parse_document(text, format, "facts")?;
    let Value::Object(entries) = document else {
        return Err(anyhow!("facts document MUST be a mapping of fact keys"));
    };

    let mut facts = FactMap::new();
    for (key, value) in entries {
        ensure_non_empty("fact key", &key)?;
        let full_shape = matches!(&value, Value::Object(map) if map.contains_key("value"));
        let fact = if full_shape {
            serde_json::from_value::<Fact>(value)
                .map_err(|err| anyhow!("invalid fact {key}: {err}"))?
        } else {
            Fact::new(value)
        };
        facts.insert(key.trim().to_string(), fact);
    }
    Ok(facts)
}
