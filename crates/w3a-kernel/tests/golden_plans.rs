#![allow(clippy::single_match_else, clippy::float_cmp)]

use serde_json::{json, Value};
use w3a_domain::{
    EffectivePolicy, Fact, FactMap, GeometryContext, PlanDocument, PlanError, PlugGeometry,
    StepType,
};
use w3a_kernel::plan_w3a;

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn facts(value: Value) -> FactMap {
    let Value::Object(map) = value else {
        panic!("fixture facts must be an object");
    };
    map.into_iter()
        .map(|(key, value)| (key, Fact::new(value)))
        .collect()
}

fn policy(value: Value) -> EffectivePolicy {
    must_ok(serde_json::from_value(value))
}

fn class_a_recipe() -> Value {
    json!({
        "recipe_id": "class_a_15_6",
        "cement_class": "A",
        "density_ppg": 15.6,
        "yield_ft3_per_sk": 1.18,
        "water_gal_per_sk": 5.2,
        "additives": []
    })
}

fn andrews_facts() -> FactMap {
    facts(json!({
        "api14": "4200346118",
        "state": "TX",
        "district": "08A",
        "county": "Andrews County",
        "use_cibp": true,
        "has_uqw": true
    }))
}

fn andrews_cement_plugs() -> Value {
    json!([
        {"top_ft": 10870, "bottom_ft": 11000, "geometry_context": "open_hole",
         "hole_d_in": 7.875, "stinger_od_in": 2.875, "annular_excess": 0.25,
         "citations": ["tx.tac.16.3.14(k)"]},
        {"top_ft": 9820, "bottom_ft": 10000, "geometry_context": "cased_production",
         "casing_id_in": 4.892, "stinger_od_in": 2.375, "stinger_id_in": 1.995, "annular_excess": 0.1},
        {"top_ft": 5110, "bottom_ft": 5500, "geometry_context": "cased_intermediate",
         "casing_id_in": 7.921, "stinger_od_in": 2.375, "stinger_id_in": 1.995, "annular_excess": 0.0},
        {"top_ft": 4330, "bottom_ft": 4500, "geometry_context": "open_hole",
         "hole_d_in": 7.875, "stinger_od_in": 2.875, "annular_excess": 0.5},
        {"top_ft": 3505, "bottom_ft": 3700, "geometry_context": "cased_production",
         "casing_id_in": 4.892, "stinger_od_in": 2.375, "stinger_id_in": 1.995, "annular_excess": 0.0},
        {"top_ft": 2610, "bottom_ft": 2900, "geometry_context": "open_hole",
         "hole_d_in": 7.875, "stinger_od_in": 2.875, "annular_excess": 0.25},
        {"top_ft": 1940, "bottom_ft": 2200, "geometry_context": "cased_intermediate",
         "casing_id_in": 7.921, "stinger_od_in": 2.375, "stinger_id_in": 1.995, "annular_excess": 0.2},
        {"top_ft": 350, "bottom_ft": 480, "geometry_context": "cased_surface",
         "casing_id_in": 12.415, "stinger_od_in": 2.875, "stinger_id_in": 2.441, "annular_excess": 0.1,
         "citations": ["tx.tac.16.3.14(e)(2)"]}
    ])
}

fn andrews_policy(cement_plugs: Value) -> EffectivePolicy {
    policy(json!({
        "policy_id": "tx.w3a",
        "policy_version": "2025.1",
        "jurisdiction": "TX",
        "form": "W-3A",
        "district": "08A",
        "complete": true,
        "incomplete_reasons": [],
        "base": {"requirements": {}},
        "effective": {
            "requirements": {},
            "steps_overrides": {
                "perf_circulate": [
                    {"top_ft": 0, "bottom_ft": 400, "citations": ["tx.tac.16.3.14(d)"]}
                ],
                "cement_plugs": cement_plugs
            },
            "district_overrides": {
                "counties": {
                    "Andrews": {"pump_via_tubing_only": true}
                }
            }
        },
        "preferences": {
            "rounding_policy": "nearest",
            "default_recipe": class_a_recipe(),
            "geometry_defaults": {}
        }
    }))
}

fn minimal_policy() -> EffectivePolicy {
    policy(json!({
        "policy_id": "tx.w3a",
        "policy_version": "2025.1",
        "jurisdiction": "TX",
        "form": "W-3A",
        "complete": true,
        "base": {"requirements": {
            "surface_casing_shoe_plug_min_ft": {"value": 100, "citation_keys": ["tx.tac.16.3.14(e)(2)"]},
            "cement_above_cibp_min_ft": {"value": 20, "citation_keys": ["tx.tac.16.3.14(g)(3)"]},
            "uqw_isolation_min_len_ft": {"value": 100, "citation_keys": ["tx.tac.16.3.14(g)(1)"]},
            "uqw_below_base_ft": {"value": 50, "citation_keys": ["tx.tac.16.3.14(g)(1)"]},
            "uqw_above_base_ft": {"value": 50, "citation_keys": ["tx.tac.16.3.14(g)(1)"]}
        }},
        "preferences": {
            "default_recipe": class_a_recipe(),
            "geometry_defaults": {
                "surface_casing_shoe_plug": {"casing_id_in": 7.921, "stinger_od_in": 2.375},
                "cibp_cap": {"casing_id_in": 4.892, "stinger_od_in": 2.375},
                "uqw_isolation_plug": {"casing_id_in": 4.892, "stinger_od_in": 2.375, "stinger_id_in": 1.995}
            }
        }
    }))
}

fn sacks(plan: &PlanDocument) -> Vec<u32> {
    plan.steps
        .iter()
        .map(|step| step.sacks().unwrap_or(0))
        .collect()
}

fn step_json(plan: &PlanDocument) -> Vec<Value> {
    let value = must_ok(serde_json::to_value(plan));
    match value.get("steps") {
        Some(Value::Array(steps)) => steps.clone(),
        _ => panic!("plan JSON has no steps array"),
    }
}

#[test]
fn andrews_end_to_end_plan_matches_golden() {
    let plan = must_ok(plan_w3a(&andrews_facts(), &andrews_policy(andrews_cement_plugs())));

    assert!(plan.policy_complete);
    assert!(plan.violations.is_empty());
    assert!(plan.constraints.is_empty());
    assert_eq!(plan.kernel_version, "w3a-kernel.v1");
    assert_eq!(plan.district.as_deref(), Some("08A"));
    assert_eq!(plan.inputs_summary.well_id.as_deref(), Some("00346118"));

    assert_eq!(plan.steps.len(), 9);
    assert_eq!(plan.steps[0].step_type(), StepType::PerfCirculate);
    assert!(plan.steps[1..]
        .iter()
        .all(|step| step.step_type() == StepType::CementPlug));
    assert_eq!(sacks(&plan), vec![0, 40, 20, 110, 63, 20, 90, 87, 100]);

    let intervals: Vec<Option<(f64, f64)>> = plan.steps.iter().map(|step| step.interval()).collect();
    assert_eq!(
        intervals,
        vec![
            Some((0.0, 400.0)),
            Some((10_870.0, 11_000.0)),
            Some((9_820.0, 10_000.0)),
            Some((5_110.0, 5_500.0)),
            Some((4_330.0, 4_500.0)),
            Some((3_505.0, 3_700.0)),
            Some((2_610.0, 2_900.0)),
            Some((1_940.0, 2_200.0)),
            Some((350.0, 480.0)),
        ]
    );

    let steps = step_json(&plan);
    assert_eq!(steps[0]["materials"]["slurry"], json!({}));
    for index in [1_usize, 4, 6] {
        assert_eq!(steps[index]["geometry_context"], json!("open_hole"));
        assert!(steps[index].get("casing_id_in").is_none());
    }
    for index in [2_usize, 3, 5, 7, 8] {
        assert!(steps[index].get("hole_d_in").is_none());
    }

    assert_eq!(
        plan.citations,
        vec![
            "tx.tac.16.3.14(d)".to_string(),
            "tx.tac.16.3.14(k)".to_string(),
            "tx.tac.16.3.14(e)(2)".to_string(),
        ]
    );
}

#[test]
fn county_overlay_instructions_reach_every_cementing_step() {
    let plan = must_ok(plan_w3a(&andrews_facts(), &andrews_policy(andrews_cement_plugs())));
    assert!(plan.steps[0].special_instructions.is_empty());
    for step in &plan.steps[1..] {
        assert!(step
            .special_instructions
            .contains("Pump via tubing/drill pipe only"));
    }
}

#[test]
fn minimal_w3a_plan_matches_golden() {
    let plan = must_ok(plan_w3a(
        &facts(json!({
            "api14": "42000000000000",
            "state": "TX",
            "use_cibp": true,
            "has_uqw": true
        })),
        &minimal_policy(),
    ));

    let types: Vec<StepType> = plan.steps.iter().map(|step| step.step_type()).collect();
    assert_eq!(
        types,
        vec![
            StepType::SurfaceCasingShoePlug,
            StepType::CibpCap,
            StepType::UqwIsolationPlug,
        ]
    );

    let steps = step_json(&plan);
    assert_eq!(steps[0]["min_length_ft"], json!(100.0));
    assert_eq!(steps[0]["regulatory_basis"], json!(["tx.tac.16.3.14(e)(2)"]));
    assert_eq!(steps[0]["geometry_context"], json!("cased_surface"));
    assert_eq!(steps[1]["cap_length_ft"], json!(20.0));
    assert_eq!(steps[1]["regulatory_basis"], json!(["tx.tac.16.3.14(g)(3)"]));
    assert_eq!(steps[2]["min_length_ft"], json!(100.0));
    assert_eq!(steps[2]["below_base_ft"], json!(50.0));
    assert_eq!(steps[2]["above_base_ft"], json!(50.0));
    assert_eq!(steps[2]["regulatory_basis"], json!(["tx.tac.16.3.14(g)(1)"]));

    assert_eq!(sacks(&plan), vec![26, 2, 10]);
    assert_eq!(plan.district, None);
    assert_eq!(plan.inputs_summary.api14.as_deref(), Some("42000000000000"));
    assert_eq!(plan.inputs_summary.well_id.as_deref(), Some("00000000"));
}

#[test]
fn minimal_plan_skips_conditional_steps_without_flags() {
    let plan = must_ok(plan_w3a(&facts(json!({"state": "TX"})), &minimal_policy()));
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].step_type(), StepType::SurfaceCasingShoePlug);
}

#[test]
fn cement_plug_order_follows_override_list() {
    let Value::Array(mut plugs) = andrews_cement_plugs() else {
        panic!("fixture plugs must be a list");
    };
    plugs.reverse();
    let plan = must_ok(plan_w3a(&andrews_facts(), &andrews_policy(Value::Array(plugs))));

    let tops: Vec<f64> = plan
        .steps_of_type(StepType::CementPlug)
        .iter()
        .filter_map(|step| step.interval().map(|(top, _)| top))
        .collect();
    assert_eq!(
        tops,
        vec![350.0, 1_940.0, 2_610.0, 3_505.0, 4_330.0, 5_110.0, 9_820.0, 10_870.0]
    );
    assert_eq!(sacks(&plan), vec![0, 100, 87, 90, 20, 63, 110, 20, 40]);
}

#[test]
fn incomplete_policy_short_circuits() {
    let mut incomplete = andrews_policy(andrews_cement_plugs());
    incomplete.complete = false;
    incomplete.incomplete_reasons = vec!["district 08A missing uqw_isolation_min_len_ft".to_string()];
    // no recipe: materials would fail if the kernel got that far
    incomplete.preferences.default_recipe = None;

    let plan = must_ok(plan_w3a(&andrews_facts(), &incomplete));
    assert!(!plan.policy_complete);
    assert_eq!(plan.constraints.len(), 1);
    assert_eq!(plan.constraints[0].code, "policy_incomplete");
    assert_eq!(plan.constraints[0].reasons, incomplete.incomplete_reasons);
    assert!(plan.steps.is_empty());
    assert!(plan.violations.is_empty());
    assert!(plan.citations.is_empty());
}

#[test]
fn missing_recipe_fails_the_whole_plan() {
    let mut no_recipe = andrews_policy(andrews_cement_plugs());
    no_recipe.preferences.default_recipe = None;
    let result = plan_w3a(&andrews_facts(), &no_recipe);
    assert!(matches!(result, Err(PlanError::MissingRecipe(_))));
}

#[test]
fn tag_triggers_mark_shoe_and_uqw_steps() {
    for trigger in [
        json!({"tag": true}),
        json!({"wbl": {"depth_ft": 300}}),
        json!({"protect_intervals": [{"top_ft": 100, "bottom_ft": 200}]}),
        json!({"enhanced_recovery_zone": "Wasson ERZ"}),
    ] {
        let mut tagged = minimal_policy();
        tagged.effective.district_overrides = must_ok(serde_json::from_value(trigger));
        let plan = must_ok(plan_w3a(
            &facts(json!({"use_cibp": true, "has_uqw": true})),
            &tagged,
        ));
        let flags: Vec<bool> = plan.steps.iter().map(|step| step.tag_required).collect();
        assert_eq!(flags, vec![true, false, true]);
    }
}

#[test]
fn open_hole_override_drops_casing_id() {
    let plugs = json!([
        {"top_ft": 4330, "bottom_ft": 4500, "geometry_context": "open_hole",
         "hole_d_in": 7.875, "casing_id_in": 4.892, "stinger_od_in": 2.875, "annular_excess": 0.5}
    ]);
    let plan = must_ok(plan_w3a(&andrews_facts(), &andrews_policy(plugs)));
    let steps = step_json(&plan);
    assert!(steps[1].get("casing_id_in").is_none());
    assert_eq!(steps[1]["hole_d_in"], json!(7.875));
    assert_eq!(plan.steps[1].sacks(), Some(63));
}

#[test]
fn override_without_context_is_cased_production() {
    let plugs = json!([
        {"top_ft": 9820, "bottom_ft": 10000, "hole_d_in": 7.875,
         "casing_id_in": 4.892, "stinger_od_in": 2.375, "stinger_id_in": 1.995, "annular_excess": 0.1}
    ]);
    let plan = must_ok(plan_w3a(&andrews_facts(), &andrews_policy(plugs)));
    let geometry = plan.steps[1].geometry().map(PlugGeometry::context);
    assert_eq!(geometry, Some(GeometryContext::CasedProduction));
    assert!(step_json(&plan)[1].get("hole_d_in").is_none());
    assert_eq!(plan.steps[1].sacks(), Some(20));
}

#[test]
fn first_cibp_override_refines_base_cap() {
    let mut refined = minimal_policy();
    refined.effective.steps_overrides = must_ok(serde_json::from_value(json!({
        "cibp_cap": [
            {"cibp_ft": 9000, "cap_length_ft": 50, "citations": ["district.08a.cibp"]},
            {"cibp_ft": 6000, "geometry_context": "cased_intermediate",
             "casing_id_in": 7.921, "stinger_od_in": 2.375}
        ]
    })));
    let plan = must_ok(plan_w3a(
        &facts(json!({"use_cibp": true})),
        &refined,
    ));

    let caps = plan.steps_of_type(StepType::CibpCap);
    assert_eq!(caps.len(), 2);
    assert_eq!(caps[0].interval(), Some((8_950.0, 9_000.0)));
    assert_eq!(
        caps[0].regulatory_basis,
        vec![
            "tx.tac.16.3.14(g)(3)".to_string(),
            "district.08a.cibp".to_string(),
        ]
    );
    assert_eq!(
        caps[0].geometry().and_then(PlugGeometry::outer_diameter_in),
        Some(4.892)
    );
    assert_eq!(caps[1].interval(), Some((5_980.0, 6_000.0)));
    assert_eq!(
        caps[1].geometry().map(PlugGeometry::context),
        Some(GeometryContext::CasedIntermediate)
    );
}

#[test]
fn formation_tops_emit_plugs_with_flags() {
    let mut with_tops = minimal_policy();
    with_tops.effective.district_overrides = must_ok(serde_json::from_value(json!({
        "formation_tops": [
            {"formation": "San Andres", "top_ft": 4500, "plug_required": true,
             "tag_required": true, "county": "Andrews", "citations": ["district.08a.san_andres"]},
            {"formation": "Yates", "top_ft": 2800, "plug_required": true, "county": "Ward"}
        ]
    })));
    with_tops.preferences.geometry_defaults.insert(
        "cement_plug".to_string(),
        must_ok(serde_json::from_value(json!({
            "casing_id_in": 4.892, "stinger_od_in": 2.375
        }))),
    );

    let plan = must_ok(plan_w3a(
        &facts(json!({"county": "Andrews County"})),
        &with_tops,
    ));
    let tops = plan.steps_of_type(StepType::FormationTopPlug);
    assert_eq!(tops.len(), 1);
    assert!(tops[0].tag_required);
    assert_eq!(tops[0].interval(), Some((4_450.0, 4_550.0)));
    assert!(tops[0].sacks().is_some());

    let steps = step_json(&plan);
    let formation = &steps[steps.len() - 1];
    assert_eq!(formation["type"], json!("formation_top_plug"));
    assert_eq!(formation["formation"], json!("San Andres"));
    assert_eq!(formation["plug_required"], json!(true));
    assert!(plan
        .citations
        .contains(&"district.08a.san_andres".to_string()));
}

#[test]
fn rounding_policy_is_echoed_and_applied() {
    let mut ceil = minimal_policy();
    ceil.preferences.rounding_policy = w3a_domain::RoundingMode::Ceil;
    let plan = must_ok(plan_w3a(
        &facts(json!({"use_cibp": true, "has_uqw": true})),
        &ceil,
    ));
    assert_eq!(plan.rounding_policy, w3a_domain::RoundingMode::Ceil);
    assert_eq!(sacks(&plan), vec![27, 2, 11]);
}

fn shoe_only_policy(shoe_defaults: Value) -> EffectivePolicy {
    policy(json!({
        "policy_id": "tx.w3a",
        "policy_version": "2025.1",
        "jurisdiction": "TX",
        "form": "W-3A",
        "complete": true,
        "base": {"requirements": {
            "surface_casing_shoe_plug_min_ft": {"value": 100, "citation_keys": ["tx.tac.16.3.14(e)(2)"]}
        }},
        "preferences": {
            "default_recipe": class_a_recipe(),
            "geometry_defaults": {"surface_casing_shoe_plug": shoe_defaults}
        }
    }))
}

#[test]
fn open_hole_shoe_plug_is_sized_against_the_hole() {
    let plan = must_ok(plan_w3a(
        &facts(json!({})),
        &shoe_only_policy(json!({
            "geometry_context": "open_hole", "hole_d_in": 12.25, "stinger_od_in": 2.875
        })),
    ));
    assert_eq!(sacks(&plan), vec![66]);

    let steps = step_json(&plan);
    assert_eq!(steps[0]["geometry_context"], json!("open_hole"));
    assert_eq!(steps[0]["hole_d_in"], json!(12.25));
    assert!(steps[0].get("casing_id_in").is_none());
    assert_eq!(
        steps[0]["materials"]["slurry"]["explain"]["volume_method"],
        json!("balanced_plug")
    );
}

#[test]
fn cased_shoe_plug_counts_stinger_volume_unless_cap_style() {
    let balanced = must_ok(plan_w3a(
        &facts(json!({})),
        &shoe_only_policy(json!({
            "casing_id_in": 7.921, "stinger_od_in": 2.375, "stinger_id_in": 1.995
        })),
    ));
    assert_eq!(sacks(&balanced), vec![28]);

    let capped = must_ok(plan_w3a(
        &facts(json!({})),
        &shoe_only_policy(json!({
            "casing_id_in": 7.921, "stinger_od_in": 2.375, "stinger_id_in": 1.995,
            "cap_style": true
        })),
    ));
    assert_eq!(sacks(&capped), vec![26]);
    assert_eq!(step_json(&capped)[0]["cap_style"], json!(true));
}

fn uqw_policy(requirements: Value) -> EffectivePolicy {
    policy(json!({
        "policy_id": "tx.w3a",
        "policy_version": "2025.1",
        "jurisdiction": "TX",
        "form": "W-3A",
        "complete": true,
        "base": {"requirements": requirements},
        "preferences": {
            "default_recipe": class_a_recipe(),
            "geometry_defaults": {
                "uqw_isolation_plug": {"casing_id_in": 4.892, "stinger_od_in": 2.375, "stinger_id_in": 1.995}
            }
        }
    }))
}

#[test]
fn uqw_plug_spans_offsets_without_a_minimum_length() {
    let plan = must_ok(plan_w3a(
        &facts(json!({"has_uqw": true, "uqw_base_ft": 300})),
        &uqw_policy(json!({
            "uqw_below_base_ft": {"value": 50, "citation_keys": ["tx.tac.16.3.14(g)(1)"]},
            "uqw_above_base_ft": {"value": 30, "citation_keys": ["tx.tac.16.3.14(g)(1)"]}
        })),
    ));
    let uqw = plan.steps_of_type(StepType::UqwIsolationPlug);
    assert_eq!(uqw.len(), 1);
    assert_eq!(uqw[0].interval(), Some((270.0, 350.0)));
    assert_eq!(uqw[0].sacks(), Some(8));
    assert_eq!(step_json(&plan)[0]["min_length_ft"], json!(80.0));
    assert_eq!(plan.citations, vec!["tx.tac.16.3.14(g)(1)".to_string()]);
}

#[test]
fn uqw_flag_without_uqw_requirements_emits_no_plug() {
    let plan = must_ok(plan_w3a(
        &facts(json!({"has_uqw": true, "uqw_base_ft": 300})),
        &uqw_policy(json!({})),
    ));
    assert!(plan.steps.is_empty());
}
