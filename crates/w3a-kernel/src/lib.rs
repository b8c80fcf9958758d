#![forbid(unsafe_code)]

//! W-3A step synthesis.
//!
//! [`plan_w3a`] walks a fixed, forward-only sequence of phases. An incomplete
//! policy stops the walk at the first phase and yields a constraint-only plan.

use w3a_domain::{
    BalancedPlugStep, CasedGeometry, CementPlugOverride, CibpCapOverride, CibpCapStep, Constraint,
    DistrictOverlay, EffectivePolicy, FactMap, FormationTopEntry, FormationTopStep,
    GeometryContext, GeometryDefaults, GeometryOverride, InputsSummary, OpenHoleGeometry,
    PerfCirculateOverride, PerfCirculateStep, PlanDocument, PlanError, PlugGeometry, Requirement,
    ShoePlugStep, SqueezeOverride, SqueezeStep, Step, StepKind, StepType, UqwIsolationStep,
    WellFacts, KERNEL_VERSION,
};

pub const SURFACE_SHOE_MIN_FT: &str = "surface_casing_shoe_plug_min_ft";
pub const CIBP_CAP_MIN_FT: &str = "cement_above_cibp_min_ft";
pub const UQW_MIN_LEN_FT: &str = "uqw_isolation_min_len_ft";
pub const UQW_BELOW_BASE_FT: &str = "uqw_below_base_ft";
pub const UQW_ABOVE_BASE_FT: &str = "uqw_above_base_ft";

pub const POLICY_INCOMPLETE: &str = "policy_incomplete";

pub const PUMP_VIA_TUBING: &str = "Pump via tubing/drill pipe only";

/// Half-height of a formation-top plug around the top depth.
pub const FORMATION_TOP_HALF_SPAN_FT: f64 = 50.0;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum KernelPhase {
    Incomplete,
    HeaderBuilt,
    BaseStepsEmitted,
    OverrideStepsEmitted,
    OverlaysApplied,
    MaterialsComputed,
}

impl KernelPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::HeaderBuilt => "header_built",
            Self::BaseStepsEmitted => "base_steps_emitted",
            Self::OverrideStepsEmitted => "override_steps_emitted",
            Self::OverlaysApplied => "overlays_applied",
            Self::MaterialsComputed => "materials_computed",
        }
    }
}

/// Builds the W-3A plan for one well.
///
/// # Errors
/// Returns a [`PlanError`] when an interval is inverted, a requirement value
/// is not numeric, or any step cannot get materials. No partial plan is
/// returned.
pub fn plan_w3a(facts: &FactMap, policy: &EffectivePolicy) -> Result<PlanDocument, PlanError> {
    let well = WellFacts::from_facts(facts);
    let mut plan = header(&well, policy);

    if !policy.complete {
        tracing::warn!(
            policy_id = %policy.policy_id,
            reasons = policy.incomplete_reasons.len(),
            phase = KernelPhase::Incomplete.as_str(),
            "policy incomplete; returning constraint-only plan"
        );
        plan.policy_complete = false;
        plan.constraints.push(Constraint {
            code: POLICY_INCOMPLETE.to_string(),
            reasons: policy.incomplete_reasons.clone(),
        });
        return Ok(plan);
    }
    log_phase(KernelPhase::HeaderBuilt, 0);

    let mut steps = base_steps(&well, policy)?;
    log_phase(KernelPhase::BaseStepsEmitted, steps.len());

    apply_overrides(&mut steps, policy)?;
    log_phase(KernelPhase::OverrideStepsEmitted, steps.len());

    let overlay = policy
        .effective
        .district_overrides
        .resolved_for_county(well.county.as_deref());
    apply_overlay(&mut steps, &overlay);
    steps.extend(formation_top_steps(&well, policy, &overlay));
    log_phase(KernelPhase::OverlaysApplied, steps.len());

    w3a_materials::compute_step_materials(&mut steps, &policy.preferences)?;
    log_phase(KernelPhase::MaterialsComputed, steps.len());

    plan.citations = plan_citations(&steps);
    plan.steps = steps;
    Ok(plan)
}

fn log_phase(phase: KernelPhase, step_count: usize) {
    tracing::debug!(phase = phase.as_str(), step_count, "kernel phase");
}

fn header(well: &WellFacts, policy: &EffectivePolicy) -> PlanDocument {
    PlanDocument {
        kernel_version: KERNEL_VERSION.to_string(),
        policy_id: policy.policy_id.clone(),
        policy_version: policy.policy_version.clone(),
        jurisdiction: policy.jurisdiction.clone(),
        form: policy.form.clone(),
        district: policy.district.clone().or_else(|| well.district.clone()),
        policy_complete: true,
        constraints: Vec::new(),
        violations: Vec::new(),
        rounding_policy: policy.preferences.rounding_policy,
        citations: Vec::new(),
        inputs_summary: InputsSummary::from(well),
        steps: Vec::new(),
    }
}

fn base_steps(well: &WellFacts, policy: &EffectivePolicy) -> Result<Vec<Step>, PlanError> {
    let mut steps = Vec::new();

    if let Some(requirement) = policy.requirement(SURFACE_SHOE_MIN_FT) {
        let min_length = requirement_ft(SURFACE_SHOE_MIN_FT, requirement)?;
        let (top_ft, bottom_ft) = match well.surface_shoe_ft {
            Some(shoe) => {
                let (top, bottom) = centered_interval(shoe, min_length);
                (Some(top), Some(bottom))
            }
            None => (None, None),
        };
        let context = default_context(policy, StepType::SurfaceCasingShoePlug)
            .unwrap_or(GeometryContext::CasedSurface);
        let cap_style = policy
            .preferences
            .geometry_defaults_for(StepType::SurfaceCasingShoePlug)
            .and_then(|defaults| defaults.cap_style)
            .unwrap_or(false);
        let mut step = Step::new(StepKind::SurfaceCasingShoePlug(ShoePlugStep {
            top_ft,
            bottom_ft,
            min_length_ft: min_length,
            surface_shoe_ft: well.surface_shoe_ft,
            cap_style,
            geometry: PlugGeometry::empty(context),
        }));
        step.extend_basis(&requirement.citation_keys);
        steps.push(step);
    }

    if well.use_cibp {
        if let Some(requirement) = policy.requirement(CIBP_CAP_MIN_FT) {
            let cap_length = requirement_ft(CIBP_CAP_MIN_FT, requirement)?;
            let context = default_context(policy, StepType::CibpCap)
                .unwrap_or(GeometryContext::CasedProduction);
            let mut step = Step::new(StepKind::CibpCap(CibpCapStep {
                cibp_ft: well.cibp_ft,
                top_ft: well.cibp_ft.map(|depth| (depth - cap_length).max(0.0)),
                bottom_ft: well.cibp_ft,
                cap_length_ft: cap_length,
                geometry: PlugGeometry::empty(context),
            }));
            step.extend_basis(&requirement.citation_keys);
            steps.push(step);
        }
    }

    if well.has_uqw {
        if let Some(step) = uqw_step(well, policy)? {
            steps.push(step);
        }
    }

    Ok(steps)
}

/// With a minimum length, missing above/below offsets default to half of it
/// each. Without one, the plug spans the offsets that are given (a missing
/// offset counts as zero). No UQW key at all means no UQW step.
fn uqw_step(well: &WellFacts, policy: &EffectivePolicy) -> Result<Option<Step>, PlanError> {
    let min_requirement = policy.requirement(UQW_MIN_LEN_FT);
    let below = policy.requirement(UQW_BELOW_BASE_FT);
    let above = policy.requirement(UQW_ABOVE_BASE_FT);
    let below_ft = optional_ft(UQW_BELOW_BASE_FT, below)?;
    let above_ft = optional_ft(UQW_ABOVE_BASE_FT, above)?;

    let (min_length, below_ft, above_ft) = match optional_ft(UQW_MIN_LEN_FT, min_requirement)? {
        Some(min_length) => (
            min_length,
            below_ft.unwrap_or(min_length / 2.0),
            above_ft.unwrap_or(min_length / 2.0),
        ),
        None if below_ft.is_some() || above_ft.is_some() => {
            let below_ft = below_ft.unwrap_or(0.0);
            let above_ft = above_ft.unwrap_or(0.0);
            (below_ft + above_ft, below_ft, above_ft)
        }
        None => return Ok(None),
    };
    if min_length <= 0.0 {
        tracing::warn!(
            below_base_ft = below_ft,
            above_base_ft = above_ft,
            "uqw isolation length is zero; skipping uqw step"
        );
        return Ok(None);
    }

    let (top_ft, bottom_ft) = match well.uqw_base_ft {
        Some(base) => {
            let top = (base - above_ft).max(0.0);
            let bottom = (base + below_ft).max(top + min_length);
            (Some(top), Some(bottom))
        }
        None => (None, None),
    };

    let context =
        default_context(policy, StepType::UqwIsolationPlug).unwrap_or(GeometryContext::CasedProduction);
    let mut step = Step::new(StepKind::UqwIsolationPlug(UqwIsolationStep {
        plug: BalancedPlugStep {
            top_ft,
            bottom_ft,
            min_length_ft: Some(min_length),
            geometry: PlugGeometry::empty(context),
        },
        uqw_base_ft: well.uqw_base_ft,
        below_base_ft: below_ft,
        above_base_ft: above_ft,
    }));
    for requirement in [min_requirement, below, above].into_iter().flatten() {
        step.extend_basis(&requirement.citation_keys);
    }
    Ok(Some(step))
}

fn optional_ft(key: &str, requirement: Option<&Requirement>) -> Result<Option<f64>, PlanError> {
    requirement
        .map(|requirement| requirement_ft(key, requirement))
        .transpose()
}

fn requirement_ft(key: &str, requirement: &Requirement) -> Result<f64, PlanError> {
    match requirement.as_f64() {
        Some(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(PlanError::InvalidInput(format!(
            "requirement {key} MUST be a non-negative number (got {})",
            requirement.value
        ))),
    }
}

/// Interval of `length` centered on `depth`, shifted down when it would
/// start above surface.
fn centered_interval(depth: f64, length: f64) -> (f64, f64) {
    let top = (depth - length / 2.0).max(0.0);
    (top, top + length)
}

fn default_context(policy: &EffectivePolicy, step_type: StepType) -> Option<GeometryContext> {
    policy
        .preferences
        .geometry_defaults_for(step_type)
        .and_then(|defaults| defaults.geometry_context)
}

/// Override steps follow the base flow grouped by kind; inside each kind the
/// document order is kept as given.
fn apply_overrides(steps: &mut Vec<Step>, policy: &EffectivePolicy) -> Result<(), PlanError> {
    let overrides = &policy.effective.steps_overrides;

    for (index, entry) in overrides.perf_circulate.iter().enumerate() {
        steps.push(perf_circulate_step(index, entry)?);
    }
    for (index, entry) in overrides.squeeze_via_perf.iter().enumerate() {
        steps.push(squeeze_step(index, entry)?);
    }

    let mut entries = overrides.cibp_cap.iter();
    if let Some(first) = entries.next() {
        match steps
            .iter_mut()
            .find(|step| step.step_type() == StepType::CibpCap)
        {
            Some(base) => refine_cibp_cap(base, first),
            None => steps.push(cibp_cap_step(policy, first)?),
        }
    }
    for entry in entries {
        steps.push(cibp_cap_step(policy, entry)?);
    }

    for (index, entry) in overrides.cement_plugs.iter().enumerate() {
        steps.push(cement_plug_step(index, entry)?);
    }
    Ok(())
}

fn ensure_interval(
    kind: &str,
    index: usize,
    top_ft: f64,
    bottom_ft: f64,
) -> Result<(), PlanError> {
    if top_ft.is_finite() && bottom_ft.is_finite() && top_ft >= 0.0 && bottom_ft > top_ft {
        Ok(())
    } else {
        Err(PlanError::InvalidGeometry(format!(
            "{kind} override {index} MUST have 0 <= top_ft < bottom_ft (got top {top_ft} bottom {bottom_ft})"
        )))
    }
}

fn override_geometry(kind: &str, index: usize, source: &GeometryOverride) -> PlugGeometry {
    let context = source
        .geometry_context
        .unwrap_or(GeometryContext::CasedProduction);
    let (geometry, dropped) = PlugGeometry::from_override(context, source);
    for field in dropped {
        tracing::warn!(
            override_kind = kind,
            override_index = index,
            field,
            geometry_context = context.as_str(),
            "dropping override field that does not apply to the geometry context"
        );
    }
    geometry
}

fn perf_circulate_step(index: usize, entry: &PerfCirculateOverride) -> Result<Step, PlanError> {
    ensure_interval("perf_circulate", index, entry.top_ft, entry.bottom_ft)?;
    let mut step = Step::new(StepKind::PerfCirculate(PerfCirculateStep {
        top_ft: entry.top_ft,
        bottom_ft: entry.bottom_ft,
        perf_ft: entry.perf_ft,
    }));
    step.extend_basis(&entry.citations);
    if let Some(note) = &entry.special_instructions {
        step.append_instruction(note);
    }
    Ok(step)
}

fn squeeze_step(index: usize, entry: &SqueezeOverride) -> Result<Step, PlanError> {
    ensure_interval("squeeze_via_perf", index, entry.top_ft, entry.bottom_ft)?;
    let mut step = Step::new(StepKind::Squeeze(SqueezeStep {
        top_ft: entry.top_ft,
        bottom_ft: entry.bottom_ft,
        squeeze_factor: entry.squeeze_factor,
        geometry: override_geometry("squeeze_via_perf", index, &entry.geometry),
    }));
    step.recipe.clone_from(&entry.recipe);
    step.extend_basis(&entry.citations);
    step.tag_required = entry.tag_required.unwrap_or(false);
    if let Some(note) = &entry.special_instructions {
        step.append_instruction(note);
    }
    Ok(step)
}

fn cement_plug_step(index: usize, entry: &CementPlugOverride) -> Result<Step, PlanError> {
    ensure_interval("cement_plugs", index, entry.top_ft, entry.bottom_ft)?;
    let mut step = Step::new(StepKind::CementPlug(BalancedPlugStep {
        top_ft: Some(entry.top_ft),
        bottom_ft: Some(entry.bottom_ft),
        min_length_ft: None,
        geometry: override_geometry("cement_plugs", index, &entry.geometry),
    }));
    step.segments.clone_from(&entry.segments);
    step.recipe.clone_from(&entry.recipe);
    step.extend_basis(&entry.citations);
    step.tag_required = entry.tag_required.unwrap_or(false);
    if let Some(note) = &entry.special_instructions {
        step.append_instruction(note);
    }
    Ok(step)
}

fn cibp_cap_step(policy: &EffectivePolicy, entry: &CibpCapOverride) -> Result<Step, PlanError> {
    let minimum = match policy.requirement(CIBP_CAP_MIN_FT) {
        Some(requirement) => Some(requirement_ft(CIBP_CAP_MIN_FT, requirement)?),
        None => None,
    };
    let cap_length = match (entry.cap_length_ft, minimum) {
        (Some(length), Some(minimum)) => length.max(minimum),
        (Some(length), None) => length,
        (None, Some(minimum)) => minimum,
        (None, None) => policy
            .preferences
            .geometry_defaults_for(StepType::CibpCap)
            .and_then(|defaults| defaults.cap_length_ft)
            .ok_or_else(|| {
                PlanError::MissingGeometryDefault(format!(
                    "cibp_cap override has no cap_length_ft and the policy has no {CIBP_CAP_MIN_FT}"
                ))
            })?,
    };

    let mut geometry = override_geometry("cibp_cap", 0, &entry.geometry);
    if entry.geometry.geometry_context.is_none() {
        if let Some(context) = default_context(policy, StepType::CibpCap) {
            let (contextual, _) = PlugGeometry::from_override(context, &entry.geometry);
            geometry = contextual;
        }
    }

    let mut step = Step::new(StepKind::CibpCap(CibpCapStep {
        cibp_ft: entry.cibp_ft,
        top_ft: entry.cibp_ft.map(|depth| (depth - cap_length).max(0.0)),
        bottom_ft: entry.cibp_ft,
        cap_length_ft: cap_length,
        geometry,
    }));
    step.recipe.clone_from(&entry.recipe);
    step.extend_basis(&entry.citations);
    step.tag_required = entry.tag_required.unwrap_or(false);
    Ok(step)
}

/// The first CIBP override refines the base-flow cap: depth and geometry
/// come from the override, the cap never drops below the required minimum.
fn refine_cibp_cap(step: &mut Step, entry: &CibpCapOverride) {
    if let StepKind::CibpCap(cap) = &mut step.kind {
        if let Some(length) = entry.cap_length_ft {
            cap.cap_length_ft = cap.cap_length_ft.max(length);
        }
        if let Some(depth) = entry.cibp_ft {
            cap.cibp_ft = Some(depth);
        }
        if let Some(depth) = cap.cibp_ft {
            cap.top_ft = Some((depth - cap.cap_length_ft).max(0.0));
            cap.bottom_ft = Some(depth);
        }

        let context = entry
            .geometry
            .geometry_context
            .unwrap_or_else(|| cap.geometry.context());
        let (mut geometry, dropped) = PlugGeometry::from_override(context, &entry.geometry);
        for field in dropped {
            tracing::warn!(
                override_kind = "cibp_cap",
                field,
                geometry_context = context.as_str(),
                "dropping override field that does not apply to the geometry context"
            );
        }
        if context == cap.geometry.context() {
            geometry.fill_from(&as_defaults(&cap.geometry));
        }
        cap.geometry = geometry;
    }

    if entry.recipe.is_some() {
        step.recipe.clone_from(&entry.recipe);
    }
    step.extend_basis(&entry.citations);
    if entry.tag_required == Some(true) {
        step.tag_required = true;
    }
}

fn as_defaults(geometry: &PlugGeometry) -> GeometryDefaults {
    match geometry {
        PlugGeometry::OpenHole(OpenHoleGeometry {
            hole_d_in,
            stinger_od_in,
            stinger_id_in,
            annular_excess,
        }) => GeometryDefaults {
            hole_d_in: *hole_d_in,
            stinger_od_in: *stinger_od_in,
            stinger_id_in: *stinger_id_in,
            annular_excess: *annular_excess,
            ..GeometryDefaults::default()
        },
        PlugGeometry::CasedProduction(cased)
        | PlugGeometry::CasedIntermediate(cased)
        | PlugGeometry::CasedSurface(cased) => {
            let CasedGeometry {
                casing_id_in,
                stinger_od_in,
                stinger_id_in,
                annular_excess,
            } = cased;
            GeometryDefaults {
                casing_id_in: *casing_id_in,
                stinger_od_in: *stinger_od_in,
                stinger_id_in: *stinger_id_in,
                annular_excess: *annular_excess,
                ..GeometryDefaults::default()
            }
        }
    }
}

/// Operational notes an overlay attaches to every cementing step.
#[must_use]
pub fn overlay_instructions(overlay: &DistrictOverlay) -> Vec<String> {
    let mut notes = Vec::new();
    if overlay.pump_via_tubing_only {
        notes.push(PUMP_VIA_TUBING.to_string());
    }
    if let Some(weight) = overlay.min_mud_weight_ppg {
        notes.push(format!("Mud weight minimum {weight} ppg"));
    }
    if let Some(viscosity) = overlay.funnel_viscosity_s_per_qt {
        notes.push(format!("Funnel viscosity minimum {viscosity} s/qt"));
    }
    notes
}

fn apply_overlay(steps: &mut [Step], overlay: &DistrictOverlay) {
    let tagging = overlay.requires_tagging();
    let notes = overlay_instructions(overlay);
    for step in steps.iter_mut() {
        let step_type = step.step_type();
        if tagging && step_type.is_tag_sensitive() {
            step.tag_required = true;
        }
        if step_type.requires_cement() {
            for note in &notes {
                step.append_instruction(note);
            }
        }
    }
}

fn formation_top_steps(
    well: &WellFacts,
    policy: &EffectivePolicy,
    overlay: &DistrictOverlay,
) -> Vec<Step> {
    let notes = overlay_instructions(overlay);
    let fallback_context = default_context(policy, StepType::FormationTopPlug)
        .unwrap_or(GeometryContext::CasedProduction);

    overlay
        .formation_tops
        .iter()
        .filter(|entry| formation_top_applies(well, entry))
        .map(|entry| {
            let top = (entry.top_ft - FORMATION_TOP_HALF_SPAN_FT).max(0.0);
            let context = entry.geometry_context.unwrap_or(fallback_context);
            let mut step = Step::new(StepKind::FormationTopPlug(FormationTopStep {
                formation: entry.formation.clone(),
                formation_top_ft: entry.top_ft,
                plug_required: entry.plug_required,
                plug: BalancedPlugStep {
                    top_ft: Some(top),
                    bottom_ft: Some(entry.top_ft + FORMATION_TOP_HALF_SPAN_FT),
                    min_length_ft: None,
                    geometry: PlugGeometry::empty(context),
                },
            }));
            step.tag_required = entry.tag_required;
            step.extend_basis(&entry.citations);
            for note in &notes {
                step.append_instruction(note);
            }
            step
        })
        .collect()
}

/// An entry scoped to a county or field applies only to wells there.
fn formation_top_applies(well: &WellFacts, entry: &FormationTopEntry) -> bool {
    let county_matches = match (&entry.county, &well.county) {
        (None, _) => true,
        (Some(wanted), Some(actual)) => {
            w3a_domain::normalize_county_name(wanted) == w3a_domain::normalize_county_name(actual)
        }
        (Some(_), None) => false,
    };
    let field_matches = match (&entry.field, &well.field) {
        (None, _) => true,
        (Some(wanted), Some(actual)) => wanted.trim().eq_ignore_ascii_case(actual.trim()),
        (Some(_), None) => false,
    };
    county_matches && field_matches
}

fn plan_citations(steps: &[Step]) -> Vec<String> {
    let mut citations: Vec<String> = Vec::new();
    for citation in steps.iter().flat_map(|step| step.regulatory_basis.iter()) {
        if !citations.contains(citation) {
            citations.push(citation.clone());
        }
    }
    citations
}
