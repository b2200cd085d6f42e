use std::process::exit;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use lightmeter_collect::{collect, logging, plan, remote, terminal};

/// Collect light meter calibration data incident with remote laser firings.
///
/// Root is required on the remote host to operate the GPIO pins, and locally
/// for stty; the principle of least privilege is in effect everywhere else.
#[derive(Parser, Debug)]
#[command(name = "lightmeter-collect", version)]
struct Args {
    /// Remote hostname or IP address of the host firing the laser.
    host: String,
    /// The remote host user's password. Remember to escape shell meta characters.
    password: String,
    /// The local root password, required for stty. Remember to escape shell meta characters.
    su_password: String,
    /// Remote host user that can fire the laser.
    #[arg(short, long, default_value = "root")]
    user: String,
    /// Directory for storing the training data.
    #[arg(short, long, default_value = ".")]
    data_dir: std::path::PathBuf,
    /// Regular expression matching the end of one transmission from the light meter.
    #[arg(short, long, default_value = collect::DEFAULT_END_PATTERN)]
    regex: String,
    /// Tty device connected to the light meter.
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    tty: String,
    /// Baud rate of the tty.
    #[arg(short, long, default_value_t = 230_400)]
    baud: u32,
    /// Minimum duty cycle.
    #[arg(long, default_value_t = 20)]
    min: u8,
    /// Maximum duty cycle.
    #[arg(long, default_value_t = 80)]
    max: u8,
    /// Number of samples at each duty cycle.
    #[arg(short, long, default_value_t = 50)]
    samples: u32,
    /// Collect samples in randomized order (disable with --no-random).
    #[arg(long = "no-random", action = clap::ArgAction::SetFalse, default_value_t = true)]
    random: bool,
    /// Per-sample read deadline in seconds; a sample that never completes is discarded.
    #[arg(long, default_value_t = 10)]
    read_timeout_secs: u64,
    /// Settle time between firings, in seconds.
    #[arg(long, default_value_t = collect::DEFAULT_PACING.as_secs())]
    pacing_secs: u64,
    /// Path of the CNC driver binary on the remote host.
    #[arg(long, default_value = remote::DEFAULT_DRIVER)]
    driver: String,
    /// Directory of per-duty laser configuration files on the remote host.
    #[arg(long, default_value = remote::DEFAULT_CONFIG_DIR)]
    config_dir: String,
    /// Laser on-time in seconds, passed verbatim to the driver.
    #[arg(long, default_value = remote::DEFAULT_FIRE_SECS)]
    fire_secs: String,
}

fn main() {
    logging::init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    remote::validate_duty_range(args.min, args.max)?;

    // Both endpoints must be up before any sample is attempted; each failure
    // here is fatal and never retried.
    let sudo = terminal::SudoStty::new(&args.su_password);
    terminal::configure_line_discipline(&args.tty, args.baud, &sudo)?;
    let terminal = terminal::ReadTerminal::new(&args.tty, args.baud)?;
    let remote = remote::RemoteSession::connect(&args.host, &args.user, &args.password)?;

    let manifest = plan::RunManifest::create(&args.data_dir)?;
    println!("{}", manifest.to_json_line()?);
    let samples = plan::generate(&manifest, args.min, args.max, args.samples, args.random);

    let trigger = remote::TriggerCommand {
        driver: args.driver,
        config_dir: args.config_dir,
        fire_secs: args.fire_secs,
    };

    let mut collector = collect::Collector::new(
        terminal,
        remote,
        trigger,
        &args.regex,
        Duration::from_secs(args.read_timeout_secs),
        Duration::from_secs(args.pacing_secs),
    )?;
    collector.run(&samples)
}
