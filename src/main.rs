use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::info;
use rayon::prelude::*;

use podrom::{
    Basis, BasisBuilder, BasisCache, Case, CaseLoader, DecompositionMethod, FieldSnapshot, FsArtifactStore,
    JsonFieldWriter, ReducedNavierStokes, Reconstructor, Stabilization,
};

const RECONSTRUCTION_DIR: &str = "online_rec";
const LOG_ENV: &str = "PODROM_LOG";

const USAGE: &str = "\
usage: podrom [--cases <dir>] [--offline-only] [case ...]

Builds the POD bases of every named case (all cases under the root when none
is named) and runs the reduced online stage of the cases with an online.json.

options:
  --cases <dir>     case root directory (default: cases)
  --offline-only    stop after the offline stage
  -h, --help        print this message";

#[derive(Debug, Default, PartialEq)]
struct Args {
    cases_root: Option<PathBuf>,
    cases: Vec<String>,
    offline_only: bool,
    help: bool,
}

fn parse_args(argv: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut args = Args::default();
    let mut argv = argv.into_iter();

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--cases" => {
                let root = argv.next().context("--cases requires a directory")?;
                args.cases_root = Some(PathBuf::from(root));
            }
            "--offline-only" => args.offline_only = true,
            "--help" | "-h" => args.help = true,
            flag if flag.starts_with('-') => anyhow::bail!("unknown option {flag}\n\n{USAGE}"),
            case => args.cases.push(case.to_string()),
        }
    }
    Ok(args)
}

fn init_logging() {
    let env = env_logger::Env::default().filter_or(LOG_ENV, "info");
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }
    init_logging();

    let mut loader = CaseLoader::default();
    if let Some(root) = &args.cases_root {
        loader = loader.with_root(root);
    }
    let cases = if args.cases.is_empty() {
        let cases = loader.list()?;
        if cases.is_empty() {
            anyhow::bail!("no cases under {:?}", loader.root());
        }
        cases
    } else {
        args.cases.clone()
    };

    info!("Starting offline stage for {} case(s)", cases.len());
    let mut offline_cases = Vec::with_capacity(cases.len());
    for name in &cases {
        let case = loader.load(name).with_context(|| format!("load case {name}"))?;
        let bases = prepare_offline(&case)?;
        offline_cases.push((case, bases));
    }
    info!("Offline stage completed");
    if args.offline_only {
        return Ok(());
    }

    for (case, bases) in &offline_cases {
        if case.online.is_none() {
            info!("Case {}: no online inputs, skipping", case.name);
            continue;
        }
        execute_online(case, bases)?;
    }
    info!("Online stage completed");
    Ok(())
}

type FieldBases = IndexMap<String, Arc<Basis<FieldSnapshot>>>;

fn prepare_offline(case: &Case) -> Result<FieldBases> {
    let offline_start = Instant::now();
    let config = &case.config.offline;
    let store = FsArtifactStore::new(case.output_root());
    let builder = BasisBuilder::new(config.spectral.clone()).orthogonalize(config.orthogonalize);
    let cache = BasisCache::new(store, builder);
    let policy = config.cache_policy;

    let fields: Vec<_> = case.fields.iter().collect();
    let bases = fields
        .into_par_iter()
        .map(|(field, set)| -> Result<(String, Arc<Basis<FieldSnapshot>>)> {
            let requested = config.modes.get(field).copied().unwrap_or(0);
            let lift = case.lift(field);
            let basis = match config.method {
                DecompositionMethod::Snapshots if lift.is_empty() => {
                    cache.compute_or_load_basis(set, requested, policy)
                }
                DecompositionMethod::Snapshots => cache.compute_or_load_lifted(set, lift, requested, policy),
                DecompositionMethod::Svd if lift.is_empty() => cache.compute_or_load_svd(set, requested, policy),
                DecompositionMethod::Svd => {
                    anyhow::bail!("case {}: field {field} has lift functions, use the Snapshots method", case.name)
                }
            }
            .with_context(|| format!("compute POD basis of {field} for case {}", case.name))?;
            Ok((field.clone(), Arc::new(basis)))
        })
        .collect::<Result<Vec<_>>>()?;

    for (field, basis) in &bases {
        info!(
            "Case {}: field {} keeps {} lift + {} POD modes capturing {:.6} of the energy",
            case.name,
            field,
            basis.lift_count(),
            basis.pod_count(),
            basis.energy().captured()
        );
    }
    info!(
        "Case {} offline duration {:?} (fields {})",
        case.name,
        offline_start.elapsed(),
        bases.len()
    );
    Ok(bases.into_iter().collect())
}

/// The velocity basis of the online stage, with the supremizer modes
/// appended when the case names a supremizer field.
fn velocity_space(case: &Case, bases: &FieldBases) -> Result<Arc<Basis<FieldSnapshot>>> {
    let Some(online) = &case.online else {
        anyhow::bail!("case {} has no online inputs", case.name);
    };
    let velocity = bases
        .get(&online.velocity)
        .with_context(|| format!("case {} has no basis for {}", case.name, online.velocity))?;
    let Some(supremizer) = &online.supremizer else {
        return Ok(Arc::clone(velocity));
    };
    if case.config.online.stabilization != Stabilization::Supremizer {
        anyhow::bail!(
            "case {}: supremizer field {supremizer} given for a {:?} run",
            case.name,
            case.config.online.stabilization
        );
    }
    let extra = bases
        .get(supremizer)
        .with_context(|| format!("case {} has no basis for {supremizer}", case.name))?;
    let augmented = velocity
        .augment(extra.pod_modes())
        .with_context(|| format!("append {supremizer} modes to the {} basis", online.velocity))?;
    info!(
        "Case {}: velocity basis {} + {} supremizer modes",
        case.name,
        velocity.len(),
        augmented.extra_count()
    );
    Ok(Arc::new(augmented))
}

fn execute_online(case: &Case, bases: &FieldBases) -> Result<()> {
    let Some(online) = &case.online else {
        return Ok(());
    };
    info!("Case {}: online stage start", case.name);
    let online_start = Instant::now();
    let velocity_basis = velocity_space(case, bases)?;
    let velocity_basis: &Basis<FieldSnapshot> = velocity_basis.as_ref();
    let pressure_basis: &Basis<FieldSnapshot> = bases
        .get(&online.pressure)
        .with_context(|| format!("case {} has no basis for {}", case.name, online.pressure))?;

    let problem = ReducedNavierStokes::new(
        online.operators.clone(),
        velocity_basis,
        pressure_basis,
        case.field(&online.velocity)?,
        case.field(&online.pressure)?,
        case.config.online.clone(),
    )
    .with_context(|| format!("set up the reduced problem for case {}", case.name))?;
    let trajectory = problem
        .solve_online(&online.parameters, online.start_index)
        .with_context(|| format!("solve the reduced problem for case {}", case.name))?;

    let output = case.dir.join(RECONSTRUCTION_DIR);
    let stride = case.config.online.print_every;
    let mut velocity_writer = JsonFieldWriter::new(&output, online.velocity.as_str());
    let mut pressure_writer = JsonFieldWriter::new(&output, online.pressure.as_str());
    let written = Reconstructor::reconstruct(&trajectory, velocity_basis, 0, stride, &mut velocity_writer)
        .with_context(|| format!("reconstruct {} into {:?}", online.velocity, output))?;
    Reconstructor::reconstruct(
        &trajectory,
        pressure_basis,
        velocity_basis.len(),
        stride,
        &mut pressure_writer,
    )
    .with_context(|| format!("reconstruct {} into {:?}", online.pressure, output))?;

    info!(
        "Case {}: online duration {:?}, {} reduced states, {} fields written to {:?}",
        case.name,
        online_start.elapsed(),
        trajectory.len(),
        written,
        output
    );
    Ok(())
}
