use clap::Parser;
use log::{error, info};
use pick_servo::config::SessionConfig;
use pick_servo::interface::Arm;
use pick_servo::pick::PickAndPlace;
use pick_servo::sim::{RecordingDisplay, SimConfig, SimulatedRobot};
use pick_servo::stop::StopSignal;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tokio::runtime::Builder;

/// Pick and place demonstration on a simulated Baxter-style arm.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// number of objects to pick up
    #[arg(short = 'n', long, default_value_t = 3)]
    objects: usize,

    /// arm to use: left or right
    #[arg(long, value_parser = parse_arm)]
    arm: Option<Arm>,

    /// JSON session config; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<String>,

    /// seed for perturbations and trigger waits
    #[arg(long)]
    seed: Option<u64>,

    /// stop after this many pick attempts
    #[arg(long)]
    attempts: Option<usize>,

    /// longest simulated wait for the object trigger, seconds
    #[arg(long)]
    max_wait: Option<f64>,
}

fn parse_arm(value: &str) -> Result<Arm, String> {
    match value {
        "left" => Ok(Arm::Left),
        "right" => Ok(Arm::Right),
        other => Err(format!("unknown arm '{}', expected left or right", other)),
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig, String> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_json_file(path).map_err(|e| e.to_string())?,
        None => SessionConfig::default(),
    };
    if let Some(arm) = cli.arm {
        config.arm = arm;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    if cli.attempts.is_some() {
        config.pick.max_attempts = cli.attempts;
    }
    if let Some(max_wait) = cli.max_wait {
        config.pick.max_trigger_wait_secs = max_wait;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// A table with a few objects scattered below the top-down view pose.
fn build_scene() -> (SimulatedRobot, Vec<String>) {
    let robot = SimulatedRobot::new(SimConfig::default());
    let objects = [
        ("bottle", 0.54, -0.03, 0.05, 0.03, 0.0),
        ("cup", 0.47, 0.04, 0.04, 0.04, 0.0),
        ("box", 0.52, -0.07, 0.06, 0.03, 15.0),
    ];
    for (id, x, y, length, width, yaw) in objects {
        robot.add_object(id, x, y, length, width, yaw);
    }
    let ids = objects.iter().map(|o| o.0.to_string()).collect();
    (robot, ids)
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let n_objects = cli.objects;

    // Run the session on its own thread with a single-threaded runtime
    let handle = thread::spawn(move || {
        let rt = match Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!("Cannot start runtime: {}", e);
                return false;
            }
        };
        rt.block_on(async move {
            let stop = StopSignal::new();
            tokio::spawn({
                let stop = stop.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Stop requested");
                        stop.request_stop();
                    }
                }
            });

            let (robot, object_ids) = build_scene();
            let robot = Arc::new(robot);
            let segmentation = Arc::new(robot.segmentation());
            let display = Arc::new(RecordingDisplay::default());
            let mut session =
                match PickAndPlace::setup(robot.clone(), segmentation, display.clone(), &config, stop).await {
                    Ok(session) => session,
                    Err(e) => {
                        error!("Setup failed: {}", e);
                        return false;
                    }
                };
            let summary = session.demonstrate(n_objects, &object_ids).await;
            session.shutdown().await;
            info!(
                "Picked {}/{} object(s) in {} attempt(s); {} image(s) displayed",
                summary.picked,
                n_objects,
                summary.attempts,
                display.published()
            );
            summary.picked == n_objects
        })
    });

    match handle.join() {
        Ok(true) => {
            info!("Done.");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(_) => {
            error!("Session thread panicked");
            ExitCode::FAILURE
        }
    }
}
