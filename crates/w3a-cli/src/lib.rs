//! `w3a` command surface.
//!
//! [`run_cli`] executes a parsed [`Cli`]; every command prints one JSON
//! document on stdout. Diagnostics go to stderr through `tracing`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use w3a_domain::{AnnulusSegment, EffectivePolicy, FactMap, RoundingMode, SlurryRecipe, WellFacts};
use w3a_policy::{PolicyEnvelope, PolicyPack};

#[derive(Debug, Parser)]
#[command(name = "w3a")]
#[command(about = "W-3A plugging plan kernel CLI")]
pub struct Cli {
    /// Used when `RUST_LOG` is not set.
    #[arg(long, global = true, value_enum, default_value_t = LogLevelArg::Warn)]
    log_level: LogLevelArg,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> LogLevelArg {
        self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a plugging plan from facts and a policy.
    Plan(PlanArgs),
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    Materials {
        #[command(subcommand)]
        command: MaterialsCommand,
    },
}

#[derive(Debug, Args)]
pub struct PolicySource {
    /// Effective (already resolved) policy document.
    #[arg(long, conflicts_with = "pack", required_unless_present = "pack")]
    policy: Option<PathBuf>,
    /// Policy pack to resolve for the well's district and county.
    #[arg(long)]
    pack: Option<PathBuf>,
    #[arg(long, requires = "pack")]
    district: Option<String>,
    #[arg(long, requires = "pack")]
    county: Option<String>,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[arg(long)]
    facts: PathBuf,
    #[command(flatten)]
    source: PolicySource,
    /// Overrides the policy's rounding for this run.
    #[arg(long, value_enum)]
    rounding: Option<RoundingArg>,
    #[arg(long)]
    compact: bool,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// Validate and normalize a policy; print hashes and completeness.
    Check(PolicySource),
    /// Resolve a pack into the effective policy the kernel consumes.
    Resolve(PolicyResolveArgs),
}

#[derive(Debug, Args)]
pub struct PolicyResolveArgs {
    #[arg(long)]
    pack: PathBuf,
    #[arg(long)]
    district: Option<String>,
    #[arg(long)]
    county: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum MaterialsCommand {
    /// Sack count and slurry breakdown for a volume.
    Sacks(SacksArgs),
    /// Annular volume over piecewise segments, with sacks.
    Segments(SegmentsArgs),
}

#[derive(Debug, Args)]
pub struct RecipeArgs {
    #[arg(long = "yield")]
    yield_ft3_per_sk: f64,
    #[arg(long, default_value_t = 0.0)]
    water_gal_per_sk: f64,
    #[arg(long, default_value = "cli")]
    recipe_id: String,
    #[arg(long, default_value = "unspecified")]
    cement_class: String,
    #[arg(long, value_enum, default_value_t = RoundingArg::Nearest)]
    rounding: RoundingArg,
}

impl RecipeArgs {
    fn recipe(&self) -> SlurryRecipe {
        SlurryRecipe {
            recipe_id: self.recipe_id.clone(),
            cement_class: self.cement_class.clone(),
            density_ppg: 0.0,
            yield_ft3_per_sk: self.yield_ft3_per_sk,
            water_gal_per_sk: self.water_gal_per_sk,
            additives: Vec::new(),
        }
    }
}

#[derive(Debug, Args)]
pub struct SacksArgs {
    #[arg(long)]
    bbl: f64,
    #[command(flatten)]
    recipe: RecipeArgs,
}

#[derive(Debug, Args)]
pub struct SegmentsArgs {
    /// `top_ft,bottom_ft,hole_d_in,pipe_od_in`; repeat per segment.
    #[arg(long = "segment", required = true, value_parser = parse_segment)]
    segments: Vec<AnnulusSegment>,
    #[arg(long, default_value_t = 0.0)]
    excess: f64,
    #[command(flatten)]
    recipe: RecipeArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoundingArg {
    Nearest,
    Ceil,
    Floor,
}

impl From<RoundingArg> for RoundingMode {
    fn from(value: RoundingArg) -> Self {
        match value {
            RoundingArg::Nearest => Self::Nearest,
            RoundingArg::Ceil => Self::Ceil,
            RoundingArg::Floor => Self::Floor,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevelArg {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

fn parse_segment(value: &str) -> Result<AnnulusSegment, String> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|err| format!("invalid number {part:?}: {err}"))
        })
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [top_ft, bottom_ft, hole_d_in, pipe_od_in] => Ok(AnnulusSegment {
            top_ft: *top_ft,
            bottom_ft: *bottom_ft,
            hole_d_in: *hole_d_in,
            pipe_od_in: *pipe_od_in,
        }),
        _ => Err(format!(
            "segment MUST be top_ft,bottom_ft,hole_d_in,pipe_od_in (got {value:?})"
        )),
    }
}

/// Installs the stderr subscriber. `RUST_LOG` wins over `level`. Safe to call
/// more than once; later calls are ignored.
pub fn init_tracing(level: LogLevelArg) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Executes the parsed command.
///
/// # Errors
/// Returns an error when an input document cannot be loaded or validated,
/// or when the kernel or materials engine rejects the inputs.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Plan(args) => run_plan(&args),
        Command::Policy { command } => match command {
            PolicyCommand::Check(source) => run_policy_check(&source),
            PolicyCommand::Resolve(args) => run_policy_resolve(&args),
        },
        Command::Materials { command } => match command {
            MaterialsCommand::Sacks(args) => run_materials_sacks(&args),
            MaterialsCommand::Segments(args) => run_materials_segments(&args),
        },
    }
}

fn print_json<T: Serialize>(value: &T, compact: bool) -> Result<()> {
    if compact {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

fn load_pack(path: &Path) -> Result<PolicyPack> {
    w3a_policy::load_pack_from_path(path)
}

/// Resolves the policy for a run. Pack district and county default to the
/// well's own facts.
fn load_envelope(source: &PolicySource, facts: Option<&FactMap>) -> Result<PolicyEnvelope> {
    if let Some(path) = &source.policy {
        return w3a_policy::load_policy_from_path(path);
    }
    let path = source
        .pack
        .as_ref()
        .ok_or_else(|| anyhow!("either --policy or --pack MUST be given"))?;
    let pack = load_pack(path)?;
    let well = facts.map(WellFacts::from_facts).unwrap_or_default();
    let district = source.district.clone().or(well.district);
    let county = source.county.clone().or(well.county);
    let policy = w3a_policy::resolve_pack(&pack, district.as_deref(), county.as_deref());
    w3a_policy::policy_envelope(policy, "pack")
        .with_context(|| format!("policy pack {}", path.display()))
}

fn run_plan(args: &PlanArgs) -> Result<()> {
    let facts = w3a_policy::load_facts_from_path(&args.facts)?;
    let envelope = load_envelope(&args.source, Some(&facts))?;
    let mut policy: EffectivePolicy = envelope.policy;
    if let Some(rounding) = args.rounding {
        policy.preferences.rounding_policy = rounding.into();
    }

    tracing::info!(
        policy_id = %policy.policy_id,
        policy_hash = %envelope.normalized_hash,
        facts = facts.len(),
        "planning"
    );
    let plan = w3a_kernel::plan_w3a(&facts, &policy).context("plan computation failed")?;
    tracing::info!(
        steps = plan.steps.len(),
        complete = plan.policy_complete,
        "plan ready"
    );
    print_json(&plan, args.compact)
}

#[derive(Debug, Serialize)]
struct PolicyCheckReport<'a> {
    policy_id: &'a str,
    policy_version: &'a str,
    jurisdiction: &'a str,
    form: &'a str,
    district: Option<&'a str>,
    complete: bool,
    incomplete_reasons: &'a [String],
    source_format: &'a str,
    source_hash: &'a str,
    normalized_hash: &'a str,
}

fn run_policy_check(source: &PolicySource) -> Result<()> {
    let envelope = load_envelope(source, None)?;
    let policy = &envelope.policy;
    let report = PolicyCheckReport {
        policy_id: &policy.policy_id,
        policy_version: &policy.policy_version,
        jurisdiction: &policy.jurisdiction,
        form: &policy.form,
        district: policy.district.as_deref(),
        complete: policy.complete,
        incomplete_reasons: &policy.incomplete_reasons,
        source_format: &envelope.source_format,
        source_hash: &envelope.source_hash,
        normalized_hash: &envelope.normalized_hash,
    };
    print_json(&report, false)
}

fn run_policy_resolve(args: &PolicyResolveArgs) -> Result<()> {
    let pack = load_pack(&args.pack)?;
    let policy = w3a_policy::resolve_pack(&pack, args.district.as_deref(), args.county.as_deref());
    let envelope = w3a_policy::policy_envelope(policy, "pack")?;
    print_json(&envelope.normalized_json, false)
}

fn run_materials_sacks(args: &SacksArgs) -> Result<()> {
    let breakdown =
        w3a_materials::compute_sacks(args.bbl, &args.recipe.recipe(), args.recipe.rounding.into())?;
    print_json(&breakdown, false)
}

fn run_materials_segments(args: &SegmentsArgs) -> Result<()> {
    let total_bbl = w3a_materials::integrate_annulus_over_segments(&args.segments, args.excess)?;
    let breakdown =
        w3a_materials::compute_sacks(total_bbl, &args.recipe.recipe(), args.recipe.rounding.into())?;
    let segments: Vec<Value> = args
        .segments
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()?;
    let report = serde_json::json!({
        "segments": segments,
        "annular_excess": args.excess,
        "total_bbl": breakdown.total_bbl,
        "ft3": breakdown.ft3,
        "sacks": breakdown.sacks,
        "rounding": breakdown.explain.rounding,
        "slurry": breakdown,
    });
    print_json(&report, false)
}
