use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use clap::{Parser, Subcommand};

use pivid::display::headless::{HeadlessDriver, HeadlessOptions, VirtualScreen};
use pivid::display::DisplayMode;
use pivid::media::cache::CacheOptions;
use pivid::media::ffmpeg::FfmpegOpener;
use pivid::play::ScriptRunner;
use pivid::script::{LayerEvalContext, Script};
use pivid::SystemClock;

#[derive(Parser, Debug)]
#[command(name = "pivid", version)]
struct Cli {
    /// Log filter, e.g. "info" or "pivid=trace".
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a play script, printing its contents.
    Inspect(InspectArgs),
    /// Dry-run a play script against a headless display.
    Play(PlayArgs),
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Play script JSON.
    #[arg(long)]
    script: PathBuf,

    /// Also print evaluated layer placements at this script time (seconds).
    #[arg(long)]
    at: Option<f64>,
}

#[derive(Parser, Debug)]
struct PlayArgs {
    /// Play script JSON.
    #[arg(long)]
    script: PathBuf,

    /// Virtual screens, e.g. "HDMI-1:1920x1080@60". Repeatable.
    #[arg(long = "screen", required = true)]
    screens: Vec<String>,

    /// Media root; defaults to the script's directory.
    #[arg(long)]
    media_root: Option<PathBuf>,

    /// How long to run before stopping.
    #[arg(long, default_value_t = 2.0)]
    seconds: f64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.cmd {
        Command::Inspect(args) => cmd_inspect(args),
        Command::Play(args) => cmd_play(args),
    }
}

fn load_script(path: &Path) -> anyhow::Result<Script> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read script '{}'", path.display()))?;
    Script::from_json(&text).with_context(|| format!("parse script '{}'", path.display()))
}

fn cmd_inspect(args: InspectArgs) -> anyhow::Result<()> {
    let script = load_script(&args.script)?;

    println!("main_loop_hz: {}", script.main_loop_hz);
    for (path, opts) in &script.media {
        println!(
            "media {path}: seek {:.3}s, buffer_ahead {:.3}s",
            opts.seek, opts.buffer_ahead
        );
    }
    for (name, screen) in &script.screens {
        match screen.mode {
            Some(mode) => println!("screen {name} [{}x{}@{}]:", mode.0, mode.1, mode.2),
            None => println!("screen {name} [active mode]:"),
        }
        for (i, layer) in screen.layers.iter().enumerate() {
            println!("  layer {i}: {}", layer.media);
            if let Some(t) = args.at {
                let (w, h) = screen
                    .mode
                    .map(|m| (m.0 as f64, m.1 as f64))
                    .unwrap_or((1920.0, 1080.0));
                let ctx = LayerEvalContext {
                    screen_size: (w, h),
                    media_size: (w, h),
                    media_duration: None,
                };
                match layer.compile()?.evaluate(t, &ctx) {
                    Some(p) => println!(
                        "    at {t:.3}s: pts {:.3}s, to {:?}, alpha {:.3}",
                        p.media_pts, p.screen_rect, p.alpha
                    ),
                    None => println!("    at {t:.3}s: culled"),
                }
            }
        }
    }
    Ok(())
}

fn cmd_play(args: PlayArgs) -> anyhow::Result<()> {
    let script = load_script(&args.script)?;
    let media_root = match args.media_root {
        Some(root) => root,
        None => args
            .script
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let clock = SystemClock::new();
    let screens = args
        .screens
        .iter()
        .map(|spec| parse_screen_spec(spec))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let driver = Arc::new(HeadlessDriver::new(
        clock.clone(),
        screens,
        HeadlessOptions::default(),
    ));
    let runner = Arc::new(ScriptRunner::new(
        clock.clone(),
        driver.clone(),
        Arc::new(FfmpegOpener::new(media_root)),
        CacheOptions::default(),
    ));

    runner.post_script(script)?;

    let stopper = runner.clone();
    let seconds = args.seconds.max(0.0);
    let stop_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs_f64(seconds));
        stopper.shutdown();
    });
    runner.run();
    stop_thread
        .join()
        .map_err(|_| anyhow!("stop thread panicked"))?;

    for (i, spec) in args.screens.iter().enumerate() {
        let connector = (i + 1) as u32;
        let (modesets, flips) = driver.commit_counts(connector);
        let name = spec.split(':').next().unwrap_or(spec);
        let stats = runner.player_stats(name).unwrap_or_default();
        println!(
            "{name}: {modesets} modeset(s), {flips} flip(s), {} presented, {} skipped",
            stats.presented, stats.skipped
        );
    }
    Ok(())
}

/// Parse "NAME:WxH@HZ" into a connected virtual screen.
fn parse_screen_spec(spec: &str) -> anyhow::Result<VirtualScreen> {
    let bad = || anyhow!("screen spec '{spec}' must look like NAME:1920x1080@60");
    let (name, rest) = spec.split_once(':').ok_or_else(bad)?;
    let (size, hz) = rest.split_once('@').ok_or_else(bad)?;
    let (w, h) = size.split_once('x').ok_or_else(bad)?;
    let mode = DisplayMode::new(
        w.parse().map_err(|_| bad())?,
        h.parse().map_err(|_| bad())?,
        hz.parse().map_err(|_| bad())?,
    );
    Ok(VirtualScreen {
        connector: name.to_owned(),
        detected: true,
        modes: vec![mode],
        // Start idle so the first commit is the modeset.
        active: None,
    })
}
