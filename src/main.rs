// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod classes;
mod config;
mod feedback;
mod outlier;
mod policy;
mod resctrl;
mod rolling;
mod stats;
mod waymask;

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics_exporter_prometheus::PrometheusBuilder;

use config::Config;
use resctrl::ResctrlFs;
use stats::IntervalBatch;

/// cachepart: a userspace LLC way-partitioning controller
///
/// Every sampling interval an external collector delivers one JSON line
/// with per-task performance counters (instructions, cycles, LLC
/// misses/hits, occupancy). The selected policy classifies each task as
/// cache-critical or not, assigns tasks to resctrl classes of service,
/// and tunes each class's way mask with a feedback loop that compares
/// aggregate IPC against the previous interval.
///
/// The policies (critical-aware, critical-aware v4, critical
/// phase-aware, and the no-partitioning baseline) and all of their
/// thresholds and partition tables are selected via a TOML config file;
/// see config.rs for the defaults.
///
/// The sample stream is read from a file, FIFO or stdin, so the
/// counter collector paces the control loop.
#[derive(Debug, Parser)]
struct Opts {
    /// Path to the TOML configuration. Falls back to
    /// /etc/cachepart/config.toml, then to built-in defaults.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Sample stream: one JSON interval batch per line. "-" for stdin.
    #[clap(short = 's', long, default_value = "-")]
    samples: String,

    /// Mount point of the resctrl filesystem.
    #[clap(short = 'r', long, default_value = "/sys/fs/resctrl")]
    resctrl_root: PathBuf,

    /// Seconds to sleep between batches when replaying from a file.
    /// 0 disables pacing (live FIFO/stdin streams pace themselves).
    #[clap(short = 'i', long, default_value = "0.0")]
    replay_interval: f64,

    /// Exit on the first failed interval instead of resuming with the
    /// next batch.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    strict: bool,

    /// Leave the current class masks in place at startup instead of
    /// resetting every class to the full mask.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_reset: bool,

    /// Enable verbose output. Specify multiple times to increase
    /// verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

struct Metrics {
    intervals: Counter,
    interval_errors: Counter,
    critical_apps: Gauge,
    isolated_apps: Gauge,
    ipc_total: Gauge,
    limit_outlier: Gauge,
    num_shared_ways: Gauge,
    processing_duration: Histogram,
}

impl Metrics {
    fn new() -> Self {
        Self {
            intervals: counter!("intervals_total"),
            interval_errors: counter!("interval_errors_total"),
            critical_apps: gauge!("critical_apps"),
            isolated_apps: gauge!("isolated_apps"),
            ipc_total: gauge!("ipc_total"),
            limit_outlier: gauge!("limit_outlier"),
            num_shared_ways: gauge!("num_shared_ways"),
            processing_duration: histogram!("processing_duration_us"),
        }
    }

    fn record(&self, stats: &stats::IntervalStats) {
        self.intervals.increment(1);
        self.critical_apps.set(stats.critical_apps as f64);
        self.isolated_apps.set(stats.isolated_apps as f64);
        self.ipc_total.set(stats.ipc_total);
        self.limit_outlier.set(stats.limit_outlier);
        self.num_shared_ways.set(stats.num_shared_ways as f64);
    }
}

fn open_samples(path: &str) -> Result<Box<dyn BufRead>> {
    if path == "-" {
        Ok(Box::new(BufReader::new(std::io::stdin())))
    } else {
        let file =
            File::open(path).with_context(|| format!("Failed to open sample stream {}", path))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
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

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .expect("failed to install Prometheus recorder");
    }

    let cfg = Config::load(opts.config.as_deref())?;
    info!("Policy: {:?}, every {} interval(s), warm-up {}", cfg.policy, cfg.every, cfg.first_interval);

    let mut ctl = ResctrlFs::new(
        &opts.resctrl_root,
        cfg.cache.total_ways,
        cfg.cache.min_ways,
        cfg.cache.max_classes,
    )?;
    if !opts.no_reset {
        ctl.reset()?;
    }
    let mut policy = policy::build(&cfg, ctl)?;
    let metrics = Metrics::new();

    let reader = open_samples(&opts.samples)?;
    for line in reader.lines() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let batch = match IntervalBatch::from_json_line(&line) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Skipping unparsable sample batch: {:#}", e);
                continue;
            }
        };

        let started_at = Instant::now();
        match policy.apply(batch.interval, &batch.tasks) {
            Ok(()) => {
                let stats = policy.stats();
                metrics.record(&stats);
                let mut buf = Vec::new();
                stats.format(&mut buf)?;
                for out in String::from_utf8_lossy(&buf).lines() {
                    info!("{}", out);
                }
            }
            Err(e) => {
                metrics.interval_errors.increment(1);
                if opts.strict {
                    return Err(e.context(format!("Interval {} failed", batch.interval)));
                }
                warn!("Interval {} aborted: {:#}", batch.interval, e);
            }
        }
        metrics
            .processing_duration
            .record(started_at.elapsed().as_micros() as f64);

        if opts.replay_interval > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(opts.replay_interval));
        }
    }

    info!("Sample stream ended, exiting");
    Ok(())
}
