// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::ValueEnum;
use kpart::apply_plan;
use kpart::cat::share_all_ways;
use kpart::ucp::ucp_ipcs;
use kpart::ucp::ucp_mrcs;
use kpart::AppProfile;
use kpart::CacheAllocation;
use kpart::CounterSample;
use kpart::DryRunCat;
use kpart::Kpart;
use kpart::KpartConfig;
use kpart::MissCurve;
use kpart::PartitionPlan;
use log::*;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Cluster applications and partition the cache across clusters.
    Kpart,
    /// One partition per application, sized on miss curves.
    UcpMrc,
    /// One partition per application, sized on IPC curves.
    UcpIpc,
}

/// kpart_plan: Last-level cache partition planner
///
/// Reads recorded application profiles and computes which cache ways every
/// application (running on core i, class of service i) should use. The
/// profile file is JSON:
///
///   {"apps": [{"name": "mcf", "mrc": [...], "ipc": [...]},
///             {"name": "lbm", "samples": [[{"ways": 1, "instructions": ...,
///              "cycles": ..., "mem_traffic_bytes": ...}, ...], ...]}]}
///
/// Every application needs either dense "mrc" and "ipc" curves with one
/// value per way count from 0 to the number of cache ways, or one or more
/// rounds of raw counter "samples" to derive them from.
///
/// The plan is applied to an in-memory controller which logs every
/// register write. A plan only replaces the previous one once the
/// controller accepted it; with --interval, failed rounds keep the previous
/// plan in force.
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
struct Opts {
    /// Profile file to read. Re-read every round with --interval.
    profile: PathBuf,

    /// Partitioning policy.
    #[clap(short = 'm', long, value_enum, default_value_t = Mode::Kpart)]
    mode: Mode,

    /// Platform and policy configuration, either inline JSON or
    /// "f:<path>"/"file:<path>" of a JSON file.
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Classes of service of the controller. Defaults to one per core.
    #[clap(long)]
    num_cos: Option<usize>,

    /// Emulate a controller that rejects cache way masks with holes.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    contiguous_masks: bool,

    /// Output the plan as JSON (one line per round). When not set, the
    /// plan is printed one application per line.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Recompute the plan every this many seconds until interrupted. When
    /// not set, a single round runs.
    #[clap(short = 'i', long)]
    interval: Option<u64>,

    /// Enable verbose output. Specify multiple times to increase
    /// verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Deserialize)]
struct AppInput {
    name: String,
    #[serde(default)]
    mrc: Option<Vec<f64>>,
    #[serde(default)]
    ipc: Option<Vec<f64>>,
    #[serde(default)]
    samples: Vec<Vec<CounterSample>>,
}

#[derive(Debug, Deserialize)]
struct ProfileInput {
    apps: Vec<AppInput>,
}

struct Workload {
    names: Vec<String>,
    mrcs: Vec<Vec<MissCurve>>,
    ipcs: Vec<MissCurve>,
}

fn load_workload(path: &Path, cfg: &KpartConfig) -> Result<Workload> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    let input: ProfileInput = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse profile {}", path.display()))?;
    if input.apps.is_empty() {
        bail!("Profile {} lists no applications", path.display());
    }

    let mut workload = Workload {
        names: vec![],
        mrcs: vec![],
        ipcs: vec![],
    };
    for app in input.apps.into_iter() {
        let mut profile = AppProfile::new(&app.name, cfg);
        for (round, samples) in app.samples.iter().enumerate() {
            if let Err(e) = profile.record(samples, cfg) {
                warn!("Skipping profiling round {} of {}: {:#}", round, app.name, e);
            }
        }

        let mrc = match app.mrc {
            Some(y) => MissCurve::new(y),
            None => profile.mrc_curve()?,
        };
        let ipc = match app.ipc {
            Some(y) => MissCurve::new(y),
            None => profile.ipc_curve()?,
        };
        debug!("{}: MRC {}", app.name, mrc);
        debug!("{}: IPC {}", app.name, ipc);

        workload.names.push(app.name);
        workload.mrcs.push(vec![mrc]);
        workload.ipcs.push(ipc);
    }
    Ok(workload)
}

fn compute_plan(opts: &Opts, kpart: &Kpart) -> Result<(PartitionPlan, Vec<String>)> {
    let cfg = kpart.config();
    let workload = load_workload(&opts.profile, cfg)?;
    let names = workload.names;

    let plan = match opts.mode {
        Mode::Kpart => {
            let report = kpart.partition_round(&workload.mrcs, &workload.ipcs)?;
            for eval in report.evaluations.iter() {
                info!(
                    "K={:<2} allocations={:?} predicted WS={:.3}",
                    eval.k, eval.allocations, eval.predicted_ws
                );
            }
            report.plan
        }
        Mode::UcpMrc => {
            let mrcs: Vec<MissCurve> = workload
                .mrcs
                .into_iter()
                .filter_map(|mut app| app.pop())
                .collect();
            ucp_mrcs(&mrcs, cfg)?
        }
        Mode::UcpIpc => ucp_ipcs(&workload.ipcs, cfg)?,
    };
    Ok((plan, names))
}

/// Compute a plan and program it into `cat`. The plan, and the names of
/// the applications it was computed for, only replace the ones in force
/// once the controller accepted it. Returns the plan in force afterwards.
fn run_round(
    opts: &Opts,
    kpart: &mut Kpart,
    cat: &mut dyn CacheAllocation,
    names: &mut Vec<String>,
) -> Option<PartitionPlan> {
    let outcome = compute_plan(opts, kpart).and_then(|(plan, new_names)| {
        let stats = apply_plan(cat, &plan).context("Controller rejected the plan")?;
        info!(
            "{} clusters, {} masks written, {} cores remapped",
            plan.num_clusters(),
            stats.masks_written,
            stats.cores_remapped
        );
        Ok((plan, new_names))
    });

    let outcome = match outcome {
        Ok((plan, new_names)) => {
            *names = new_names;
            Ok(plan)
        }
        Err(e) => Err(e),
    };
    kpart.commit(outcome).cloned()
}

#[derive(Debug, Serialize)]
struct Assignment<'a> {
    app: &'a str,
    core: usize,
    cos: usize,
    cluster: usize,
    ways: String,
    mask: String,
}

fn print_plan(plan: &PartitionPlan, names: &[String], json: bool) -> Result<()> {
    let mut assignments = vec![];
    for (core, &cos) in plan.core_cos.iter().enumerate() {
        assignments.push(Assignment {
            app: names.get(core).map(|n| n.as_str()).unwrap_or("-"),
            core,
            cos,
            cluster: plan.app_cluster.get(core).copied().unwrap_or(0),
            ways: plan.ways_string(cos),
            mask: format!("0x{}", plan.cos_mask(cos)?),
        });
    }

    if json {
        match serde_json::to_string(&assignments) {
            Ok(s) => println!("{}", s),
            Err(e) => error!("Failed to serialize plan: {e}"),
        }
    } else {
        for a in assignments.iter() {
            println!(
                "{:<16} core={:<3} cos={:<3} cluster={:<3} mask={:<8} ways={}",
                a.app, a.core, a.cos, a.cluster, a.mask, a.ways
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    if lcfg.set_time_offset_to_local().is_err() {
        eprintln!("Failed to set local time offset");
    }
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let cfg = match &opts.config {
        Some(input) => KpartConfig::parse(input)?,
        None => KpartConfig::default(),
    };
    debug!("{:?}", cfg);

    let num_cos = opts.num_cos.unwrap_or(cfg.num_cores);
    let mut cat = DryRunCat::new(cfg.num_cores, num_cos, cfg.cache_ways as usize)?;
    if opts.contiguous_masks {
        cat = cat.contiguous_only();
    }
    let mut kpart = Kpart::new(cfg)?;
    share_all_ways(&mut cat)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut names = vec![];
    while !shutdown.load(Ordering::Relaxed) {
        let plan = run_round(&opts, &mut kpart, &mut cat, &mut names);

        match (plan, opts.interval) {
            (Some(plan), _) => print_plan(&plan, &names, opts.json)?,
            (None, None) => bail!("No partition plan could be computed"),
            (None, Some(_)) => {}
        }

        match opts.interval {
            Some(secs) => std::thread::sleep(Duration::from_secs(secs.max(1))),
            None => break,
        }
    }

    if opts.interval.is_some() {
        info!(
            "Exiting after {} rounds ({} failed), sharing all ways",
            kpart.rounds(),
            kpart.failed_rounds()
        );
        share_all_ways(&mut cat)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_profile(file: &mut tempfile::NamedTempFile, num_apps: usize) {
        let apps: Vec<serde_json::Value> = (0..num_apps)
            .map(|i| {
                let steep = 1.0 + i as f64;
                let mrc: Vec<f64> = (0..=12).map(|w| 100.0 / (1.0 + steep * w as f64)).collect();
                let ipc: Vec<f64> = mrc.iter().map(|m| 2.0 - m / 100.0).collect();
                serde_json::json!({"name": format!("app{}", i), "mrc": mrc, "ipc": ipc})
            })
            .collect();
        let content = serde_json::json!({ "apps": apps }).to_string();
        file.as_file().set_len(0).unwrap();
        let mut f = file.reopen().unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn opts(file: &tempfile::NamedTempFile) -> Opts {
        Opts::parse_from([
            "kpart_plan",
            file.path().to_str().unwrap(),
            "--interval",
            "5",
        ])
    }

    #[test]
    fn test_rejected_plan_keeps_previous() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let cfg = KpartConfig {
            num_cores: 4,
            fixed_k: Some(2),
            ..Default::default()
        };
        let mut kpart = Kpart::new(cfg).unwrap();
        // Fewer classes of service than the four applications need later.
        let mut cat = DryRunCat::new(4, 2, 12).unwrap();
        let mut names = vec![];

        write_profile(&mut file, 2);
        let first = run_round(&opts(&file), &mut kpart, &mut cat, &mut names).unwrap();
        assert_eq!(names, vec!["app0", "app1"]);
        let masks: Vec<u64> = (0..2).map(|c| cat.cos_ways(c).unwrap().as_cbm()).collect();

        write_profile(&mut file, 4);
        let kept = run_round(&opts(&file), &mut kpart, &mut cat, &mut names).unwrap();
        assert_eq!(kept, first);
        assert_eq!(kpart.plan(), Some(&first));
        assert_eq!(kpart.failed_rounds(), 1);
        assert_eq!(names, vec!["app0", "app1"]);
        for (c, &mask) in masks.iter().enumerate() {
            assert_eq!(cat.cos_ways(c).unwrap().as_cbm(), mask);
        }
        assert_eq!(cat.core_cos(2).unwrap(), 0);
    }

    #[test]
    fn test_unreadable_profile_keeps_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let cfg = KpartConfig {
            num_cores: 4,
            ..Default::default()
        };
        let mut kpart = Kpart::new(cfg).unwrap();
        let mut cat = DryRunCat::new(4, 4, 12).unwrap();
        let mut names = vec![];

        // Nothing in force yet.
        file.as_file().set_len(0).unwrap();
        assert!(run_round(&opts(&file), &mut kpart, &mut cat, &mut names).is_none());
        assert!(names.is_empty());

        write_profile(&mut file, 3);
        let first = run_round(&opts(&file), &mut kpart, &mut cat, &mut names).unwrap();
        assert_eq!(names.len(), 3);

        file.as_file().set_len(0).unwrap();
        let kept = run_round(&opts(&file), &mut kpart, &mut cat, &mut names).unwrap();
        assert_eq!(kept, first);
        assert_eq!(names, vec!["app0", "app1", "app2"]);
        assert_eq!(kpart.failed_rounds(), 2);
        assert_eq!(kpart.rounds(), 3);
    }
}
