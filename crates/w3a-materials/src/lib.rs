#![forbid(unsafe_code)]

//! Cement volume math, sack calculation and the per-step materials pass.
//!
//! Diameters are inches, lengths are feet and volumes are barrels.

use std::collections::BTreeMap;

use serde::Serialize;
use w3a_domain::{
    Additive, AnnulusSegment, FluidPolicy, FluidsBreakdown, GeometryContext, Materials,
    PlanError, PlugGeometry, Preferences, RoundingMode, SlurryExplain, SlurryRecipe, Step,
    StepKind, StepType, VolumeBreakdown, FT3_PER_BBL, GAL_PER_BBL,
};

/// Barrels per foot of a 1 inch diameter cylinder.
pub const BBL_PER_FT_PER_SQ_IN: f64 = 0.000_971;

/// Capacity of a cylinder of `diameter_in`.
///
/// # Errors
/// Returns [`PlanError::InvalidGeometry`] when the diameter is not positive.
pub fn cylinder_capacity_bbl_per_ft(diameter_in: f64) -> Result<f64, PlanError> {
    if diameter_in <= 0.0 || !diameter_in.is_finite() {
        return Err(PlanError::InvalidGeometry(format!(
            "cylinder diameter MUST be > 0 (got {diameter_in})"
        )));
    }
    Ok(BBL_PER_FT_PER_SQ_IN * diameter_in * diameter_in)
}

/// Capacity of the annulus between a hole (or casing ID) and a pipe OD.
/// A pipe as large as the hole leaves no annulus and yields exactly `0.0`.
///
/// # Errors
/// Returns [`PlanError::InvalidGeometry`] when the hole diameter is not
/// positive or the pipe OD is negative.
pub fn annulus_capacity_bbl_per_ft(hole_d_in: f64, pipe_od_in: f64) -> Result<f64, PlanError> {
    if hole_d_in <= 0.0 || !hole_d_in.is_finite() {
        return Err(PlanError::InvalidGeometry(format!(
            "annulus hole diameter MUST be > 0 (got {hole_d_in})"
        )));
    }
    if pipe_od_in < 0.0 || !pipe_od_in.is_finite() {
        return Err(PlanError::InvalidGeometry(format!(
            "annulus pipe OD MUST be >= 0 (got {pipe_od_in})"
        )));
    }
    if pipe_od_in >= hole_d_in {
        return Ok(0.0);
    }
    Ok(BBL_PER_FT_PER_SQ_IN * (hole_d_in * hole_d_in - pipe_od_in * pipe_od_in))
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct BalancedPlugVolume {
    pub annular_bbl: f64,
    pub inside_bbl: f64,
    pub total_bbl: f64,
}

/// # Errors
/// Returns [`PlanError::InvalidGeometry`] for a non-positive interval or any
/// negative capacity or excess.
pub fn balanced_plug_volume(
    interval_ft: f64,
    annulus_cap_per_ft: f64,
    pipe_id_cap_per_ft: f64,
    annular_excess: f64,
) -> Result<BalancedPlugVolume, PlanError> {
    ensure_positive("balanced plug interval_ft", interval_ft)?;
    ensure_non_negative("balanced plug annulus capacity", annulus_cap_per_ft)?;
    ensure_non_negative("balanced plug pipe ID capacity", pipe_id_cap_per_ft)?;
    ensure_non_negative("balanced plug annular_excess", annular_excess)?;

    let annular_bbl = interval_ft * annulus_cap_per_ft * (1.0 + annular_excess);
    let inside_bbl = interval_ft * pipe_id_cap_per_ft;
    Ok(BalancedPlugVolume {
        annular_bbl,
        inside_bbl,
        total_bbl: annular_bbl + inside_bbl,
    })
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct CapVolume {
    pub annular_bbl: f64,
    pub total_bbl: f64,
}

/// Cement cap set on top of a bridge plug: annulus only, over the cap length.
///
/// # Errors
/// Returns [`PlanError::InvalidGeometry`] for non-physical geometry.
pub fn bridge_plug_cap_volume(
    cap_length_ft: f64,
    casing_id_in: f64,
    stinger_od_in: f64,
    annular_excess: f64,
) -> Result<CapVolume, PlanError> {
    ensure_positive("cap_length_ft", cap_length_ft)?;
    ensure_non_negative("cap annular_excess", annular_excess)?;
    let capacity = annulus_capacity_bbl_per_ft(casing_id_in, stinger_od_in)?;
    let annular_bbl = cap_length_ft * capacity * (1.0 + annular_excess);
    Ok(CapVolume {
        annular_bbl,
        total_bbl: annular_bbl,
    })
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct SqueezeVolume {
    pub base_bbl: f64,
    pub total_bbl: f64,
}

/// # Errors
/// Returns [`PlanError::InvalidGeometry`] for non-physical geometry or a
/// negative squeeze factor.
pub fn squeeze_volume(
    interval_ft: f64,
    casing_id_in: f64,
    stinger_od_in: f64,
    squeeze_factor: f64,
) -> Result<SqueezeVolume, PlanError> {
    ensure_positive("squeeze interval_ft", interval_ft)?;
    ensure_non_negative("squeeze_factor", squeeze_factor)?;
    let base_bbl = interval_ft * annulus_capacity_bbl_per_ft(casing_id_in, stinger_od_in)?;
    Ok(SqueezeVolume {
        base_bbl,
        total_bbl: base_bbl * squeeze_factor,
    })
}

/// Sums annular volume over piecewise segments, each with its own hole
/// diameter and pipe OD.
///
/// # Errors
/// Returns [`PlanError::InvalidGeometry`] when a segment has `bottom <= top`,
/// carries non-physical diameters, or the excess is negative.
pub fn integrate_annulus_over_segments(
    segments: &[AnnulusSegment],
    annular_excess: f64,
) -> Result<f64, PlanError> {
    ensure_non_negative("segment annular_excess", annular_excess)?;
    let mut total_bbl = 0.0;
    for (index, segment) in segments.iter().enumerate() {
        if !(segment.bottom_ft - segment.top_ft).is_finite() || segment.bottom_ft <= segment.top_ft {
            return Err(PlanError::InvalidGeometry(format!(
                "segment {index} MUST have bottom_ft > top_ft (got top {} bottom {})",
                segment.top_ft, segment.bottom_ft
            )));
        }
        let capacity = annulus_capacity_bbl_per_ft(segment.hole_d_in, segment.pipe_od_in)?;
        total_bbl += (segment.bottom_ft - segment.top_ft) * capacity * (1.0 + annular_excess);
    }
    Ok(total_bbl)
}

/// Spacer ahead of a plug: the largest of the floor, the annular multiple and
/// the contact-time volume (when both contact time and pump rate are given).
///
/// `fluids.spacer_min_bbl` is the floor (default 5.0), `spacer_multiple` the
/// annular multiple (default 1.5), and `contact_minutes`/`pump_rate_bpm` the
/// optional contact-time pair.
///
/// # Errors
/// Returns [`PlanError::InvalidGeometry`] for negative inputs.
pub fn spacer_volume(
    interval_ft: f64,
    annulus_cap_per_ft: f64,
    fluids: &FluidPolicy,
) -> Result<f64, PlanError> {
    ensure_non_negative("spacer interval_ft", interval_ft)?;
    ensure_non_negative("spacer annulus capacity", annulus_cap_per_ft)?;
    ensure_non_negative("spacer_min_bbl", fluids.spacer_min_bbl)?;
    ensure_non_negative("spacer_multiple", fluids.spacer_multiple)?;

    let mut volume = fluids
        .spacer_min_bbl
        .max(fluids.spacer_multiple * interval_ft * annulus_cap_per_ft);
    if let (Some(minutes), Some(rate)) = (fluids.contact_minutes, fluids.pump_rate_bpm) {
        volume = volume.max(minutes * rate);
    }
    Ok(volume)
}

/// # Errors
/// Returns [`PlanError::InvalidGeometry`] for negative inputs.
pub fn balanced_displacement_volume(
    interval_ft: f64,
    pipe_id_cap_per_ft: f64,
    margin_bbl: f64,
) -> Result<f64, PlanError> {
    ensure_non_negative("displacement interval_ft", interval_ft)?;
    ensure_non_negative("displacement pipe ID capacity", pipe_id_cap_per_ft)?;
    ensure_non_negative("displacement_margin_bbl", margin_bbl)?;
    Ok(interval_ft * pipe_id_cap_per_ft + margin_bbl)
}

fn ensure_positive(field: &str, value: f64) -> Result<(), PlanError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(PlanError::InvalidGeometry(format!(
            "{field} MUST be > 0 (got {value})"
        )))
    }
}

fn ensure_non_negative(field: &str, value: f64) -> Result<(), PlanError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(PlanError::InvalidGeometry(format!(
            "{field} MUST be >= 0 (got {value})"
        )))
    }
}

/// Unrounded sack count for a slurry volume.
///
/// # Errors
/// Returns [`PlanError::InvalidInput`] for a negative volume or non-positive yield.
pub fn raw_sacks(total_bbl: f64, yield_ft3_per_sk: f64) -> Result<f64, PlanError> {
    if total_bbl < 0.0 || !total_bbl.is_finite() {
        return Err(PlanError::InvalidInput(format!(
            "total_bbl MUST be >= 0 (got {total_bbl})"
        )));
    }
    if yield_ft3_per_sk <= 0.0 || !yield_ft3_per_sk.is_finite() {
        return Err(PlanError::InvalidInput(format!(
            "yield_ft3_per_sk MUST be > 0 (got {yield_ft3_per_sk})"
        )));
    }
    Ok(total_bbl * FT3_PER_BBL / yield_ft3_per_sk)
}

/// Sack count for `total_bbl`. `Nearest` rounds half up (`floor(raw + 0.5)`).
///
/// # Errors
/// Returns [`PlanError::InvalidInput`] for a negative volume, a non-positive
/// yield, or a count that does not fit a `u32`.
pub fn sacks_from_volume(
    total_bbl: f64,
    yield_ft3_per_sk: f64,
    rounding: RoundingMode,
) -> Result<u32, PlanError> {
    round_sacks(raw_sacks(total_bbl, yield_ft3_per_sk)?, rounding)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn round_sacks(raw: f64, rounding: RoundingMode) -> Result<u32, PlanError> {
    let rounded = match rounding {
        RoundingMode::Nearest => (raw + 0.5).floor(),
        RoundingMode::Ceil => raw.ceil(),
        RoundingMode::Floor => raw.floor(),
    };
    if rounded > f64::from(u32::MAX) {
        return Err(PlanError::InvalidInput(format!(
            "sack count {rounded} is out of range"
        )));
    }
    Ok(rounded.max(0.0) as u32)
}

#[must_use]
pub fn water_volume_from_sacks(sacks: u32, water_gal_per_sk: f64) -> f64 {
    f64::from(sacks) * water_gal_per_sk / GAL_PER_BBL
}

/// Additive quantities per named additive. Unnamed additives are skipped and
/// repeated names accumulate.
#[must_use]
pub fn additive_totals(sacks: u32, additives: &[Additive]) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for additive in additives {
        let Some(name) = additive.name.as_deref().map(str::trim) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        *totals.entry(name.to_string()).or_insert(0.0) += f64::from(sacks) * additive.rate;
    }
    totals
}

/// Canonical slurry breakdown for a volume and recipe.
///
/// # Errors
/// Returns [`PlanError::InvalidInput`] for a negative volume or a recipe with a
/// non-positive yield.
pub fn compute_sacks(
    total_bbl: f64,
    recipe: &SlurryRecipe,
    rounding: RoundingMode,
) -> Result<VolumeBreakdown, PlanError> {
    let raw = raw_sacks(total_bbl, recipe.yield_ft3_per_sk)?;
    let sacks = round_sacks(raw, rounding)?;
    Ok(VolumeBreakdown {
        total_bbl,
        sacks,
        ft3: total_bbl * FT3_PER_BBL,
        water_bbl: water_volume_from_sacks(sacks, recipe.water_gal_per_sk),
        additives: additive_totals(sacks, &recipe.additives),
        explain: SlurryExplain {
            recipe_id: recipe.recipe_id.clone(),
            cement_class: recipe.cement_class.clone(),
            yield_ft3_per_sk: recipe.yield_ft3_per_sk,
            water_gal_per_sk: recipe.water_gal_per_sk,
            rounding,
            raw_sacks: raw,
            ft3_per_bbl: FT3_PER_BBL,
            volume_method: None,
            volume_components: BTreeMap::new(),
        },
    })
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum VolumeMethod {
    Segments,
    BalancedPlug,
    Squeeze,
    BridgePlugCap,
}

impl VolumeMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Segments => "segments",
            Self::BalancedPlug => "balanced_plug",
            Self::Squeeze => "squeeze",
            Self::BridgePlugCap => "bridge_plug_cap",
        }
    }
}

struct StepVolume {
    method: VolumeMethod,
    total_bbl: f64,
    components: BTreeMap<String, f64>,
    fluids: FluidsBreakdown,
}

/// Fills `materials` on every step in place, in order. The first step that
/// cannot get materials stops the pass with its error.
///
/// # Errors
/// Returns the [`PlanError`] of the failing step, with its index and type in
/// the message.
pub fn compute_step_materials(
    steps: &mut [Step],
    preferences: &Preferences,
) -> Result<(), PlanError> {
    for (index, step) in steps.iter_mut().enumerate() {
        compute_one(index, step, preferences)?;
    }
    Ok(())
}

fn compute_one(index: usize, step: &mut Step, preferences: &Preferences) -> Result<(), PlanError> {
    let step_type = step.step_type();
    if !step_type.requires_cement() {
        step.materials = Materials::default();
        tracing::debug!(
            step_index = index,
            step_type = step_type.as_str(),
            "circulation step carries no slurry"
        );
        return Ok(());
    }

    apply_geometry_defaults(step, preferences);
    let volume = step_volume(step, preferences).map_err(|err| label(index, step_type, err))?;

    let recipe = step
        .recipe
        .as_ref()
        .or(preferences.default_recipe.as_ref())
        .ok_or_else(|| {
            PlanError::MissingRecipe(format!(
                "step {index} ({}) has no recipe and the policy has no default_recipe",
                step_type.as_str()
            ))
        })?;

    let mut slurry = compute_sacks(volume.total_bbl, recipe, preferences.rounding_policy)
        .map_err(|err| label(index, step_type, err))?;
    slurry.explain.volume_method = Some(volume.method.as_str().to_string());
    slurry.explain.volume_components = volume.components;

    tracing::debug!(
        step_index = index,
        step_type = step_type.as_str(),
        method = volume.method.as_str(),
        total_bbl = slurry.total_bbl,
        sacks = slurry.sacks,
        "computed step materials"
    );

    step.materials = Materials {
        slurry: Some(slurry),
        fluids: volume.fluids,
    };
    Ok(())
}

fn label(index: usize, step_type: StepType, err: PlanError) -> PlanError {
    let prefix = format!("step {index} ({})", step_type.as_str());
    match err {
        PlanError::InvalidGeometry(message) => {
            PlanError::InvalidGeometry(format!("{prefix}: {message}"))
        }
        PlanError::InvalidInput(message) => PlanError::InvalidInput(format!("{prefix}: {message}")),
        PlanError::MissingRecipe(message) => {
            PlanError::MissingRecipe(format!("{prefix}: {message}"))
        }
        PlanError::MissingGeometryDefault(message) => {
            PlanError::MissingGeometryDefault(format!("{prefix}: {message}"))
        }
    }
}

/// Formation-top plugs fall back to the cement plug defaults after their own.
fn apply_geometry_defaults(step: &mut Step, preferences: &Preferences) {
    let step_type = step.step_type();
    let own = preferences.geometry_defaults_for(step_type).cloned();
    let fallback = match step_type {
        StepType::FormationTopPlug => preferences
            .geometry_defaults_for(StepType::CementPlug)
            .cloned(),
        _ => None,
    };

    if let Some(geometry) = step.geometry_mut() {
        for defaults in own.iter().chain(fallback.iter()) {
            geometry.fill_from(defaults);
        }
    }

    if let (StepKind::Squeeze(squeeze), Some(defaults)) = (&mut step.kind, own) {
        squeeze.squeeze_factor = squeeze.squeeze_factor.or(defaults.squeeze_factor);
    }
}

fn step_volume(
    step: &Step,
    preferences: &Preferences,
) -> Result<StepVolume, PlanError> {
    if !step.segments.is_empty() {
        let excess = step
            .geometry()
            .and_then(PlugGeometry::annular_excess)
            .unwrap_or(0.0);
        let total_bbl = integrate_annulus_over_segments(&step.segments, excess)?;
        let mut components = BTreeMap::new();
        components.insert("segment_count".to_string(), count_as_f64(step.segments.len()));
        components.insert("annular_excess".to_string(), excess);
        return Ok(StepVolume {
            method: VolumeMethod::Segments,
            total_bbl,
            components,
            fluids: FluidsBreakdown::default(),
        });
    }

    match &step.kind {
        StepKind::CementPlug(plug) => balanced_step_volume(
            plug.length_ft(),
            plug.top_ft,
            &plug.geometry,
            preferences.fluids.as_ref(),
        ),
        StepKind::FormationTopPlug(plug) => balanced_step_volume(
            plug.plug.length_ft(),
            plug.plug.top_ft,
            &plug.plug.geometry,
            preferences.fluids.as_ref(),
        ),
        StepKind::UqwIsolationPlug(uqw) => balanced_step_volume(
            uqw.plug.length_ft(),
            uqw.plug.top_ft,
            &uqw.plug.geometry,
            preferences.fluids.as_ref(),
        ),
        StepKind::Squeeze(squeeze) => {
            let outer = required_outer(&squeeze.geometry)?;
            let stinger = squeeze.geometry.stinger_od_in().unwrap_or(0.0);
            let factor = squeeze.squeeze_factor.unwrap_or(1.0);
            let volume = squeeze_volume(
                squeeze.bottom_ft - squeeze.top_ft,
                outer,
                stinger,
                factor,
            )?;
            let mut components = BTreeMap::new();
            components.insert("base_bbl".to_string(), volume.base_bbl);
            components.insert("squeeze_factor".to_string(), factor);
            Ok(StepVolume {
                method: VolumeMethod::Squeeze,
                total_bbl: volume.total_bbl,
                components,
                fluids: FluidsBreakdown::default(),
            })
        }
        StepKind::CibpCap(cap) => {
            let length = w3a_domain::interval_length(cap.top_ft, cap.bottom_ft)
                .unwrap_or(cap.cap_length_ft);
            cap_step_volume(length, &cap.geometry)
        }
        StepKind::SurfaceCasingShoePlug(shoe) => {
            let length = w3a_domain::interval_length(shoe.top_ft, shoe.bottom_ft)
                .unwrap_or(shoe.min_length_ft);
            if shoe.cap_style {
                cap_step_volume(length, &shoe.geometry)
            } else {
                balanced_step_volume(
                    Some(length),
                    shoe.top_ft,
                    &shoe.geometry,
                    preferences.fluids.as_ref(),
                )
            }
        }
        StepKind::PerfCirculate(_) => Ok(StepVolume {
            method: VolumeMethod::BalancedPlug,
            total_bbl: 0.0,
            components: BTreeMap::new(),
            fluids: FluidsBreakdown::default(),
        }),
    }
}

fn balanced_step_volume(
    length_ft: Option<f64>,
    top_ft: Option<f64>,
    geometry: &PlugGeometry,
    fluids: Option<&FluidPolicy>,
) -> Result<StepVolume, PlanError> {
    let length = length_ft.ok_or_else(|| {
        PlanError::InvalidGeometry("plug has neither an interval nor a minimum length".to_string())
    })?;
    let outer = required_outer(geometry)?;
    let stinger_od = geometry.stinger_od_in().ok_or_else(|| {
        PlanError::MissingGeometryDefault(format!(
            "{} geometry has no stinger_od_in after defaults",
            geometry.context().as_str()
        ))
    })?;
    let annulus_cap = annulus_capacity_bbl_per_ft(outer, stinger_od)?;
    let pipe_id_cap = match geometry.stinger_id_in() {
        Some(stinger_id) => cylinder_capacity_bbl_per_ft(stinger_id)?,
        None => 0.0,
    };
    let excess = geometry.annular_excess().unwrap_or(0.0);
    let volume = balanced_plug_volume(length, annulus_cap, pipe_id_cap, excess)?;

    let mut fluids_out = FluidsBreakdown::default();
    if let Some(fluids) = fluids {
        fluids_out.spacer_bbl = Some(spacer_volume(length, annulus_cap, fluids)?);
        if let Some(top) = top_ft.filter(|_| pipe_id_cap > 0.0) {
            fluids_out.displacement_bbl = Some(balanced_displacement_volume(
                top,
                pipe_id_cap,
                fluids.displacement_margin_bbl,
            )?);
        }
    }

    let mut components = BTreeMap::new();
    components.insert("annular_bbl".to_string(), volume.annular_bbl);
    components.insert("inside_bbl".to_string(), volume.inside_bbl);
    components.insert("interval_ft".to_string(), length);
    components.insert("annular_excess".to_string(), excess);
    Ok(StepVolume {
        method: VolumeMethod::BalancedPlug,
        total_bbl: volume.total_bbl,
        components,
        fluids: fluids_out,
    })
}

fn cap_step_volume(
    length_ft: f64,
    geometry: &PlugGeometry,
) -> Result<StepVolume, PlanError> {
    if geometry.context() == GeometryContext::OpenHole {
        return Err(PlanError::InvalidGeometry(
            "bridge plug cap MUST be in a cased context (got open_hole)".to_string(),
        ));
    }
    let casing_id = required_outer(geometry)?;
    let stinger_od = geometry.stinger_od_in().unwrap_or(0.0);
    let excess = geometry.annular_excess().unwrap_or(0.0);
    let volume = bridge_plug_cap_volume(length_ft, casing_id, stinger_od, excess)?;

    let mut components = BTreeMap::new();
    components.insert("annular_bbl".to_string(), volume.annular_bbl);
    components.insert("cap_length_ft".to_string(), length_ft);
    components.insert("annular_excess".to_string(), excess);
    Ok(StepVolume {
        method: VolumeMethod::BridgePlugCap,
        total_bbl: volume.total_bbl,
        components,
        fluids: FluidsBreakdown::default(),
    })
}

fn required_outer(geometry: &PlugGeometry) -> Result<f64, PlanError> {
    geometry.outer_diameter_in().ok_or_else(|| {
        PlanError::MissingGeometryDefault(format!(
            "{} geometry has no {} after defaults",
            geometry.context().as_str(),
            geometry.outer_field_name()
        ))
    })
}

#[allow(clippy::cast_precision_loss)]
fn count_as_f64(count: usize) -> f64 {
    count as f64
}
