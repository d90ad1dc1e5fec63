//! xm-cli — headless XM module inspector and player.
//!
//! Usage:
//!   xm-cli inspect song.xm
//!   xm-cli simulate song.xm --seconds 30 --mute 2,3
//!   xm-cli play song.xm --mute 2,3
//!   xm-cli save song.xm out.xm

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use xm_master::Controller;

#[derive(Parser)]
#[command(name = "xm-cli")]
#[command(about = "Headless XM module inspector and player")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a song's header, pattern and instrument summary
    Inspect {
        /// Path to the XM file
        file: PathBuf,
    },
    /// Run the engine offline for a fixed budget and report what happened
    Simulate {
        /// Path to the XM file
        file: PathBuf,

        /// Simulated playback budget, in seconds
        #[arg(long, default_value_t = 30)]
        seconds: u32,

        /// Comma-separated channel indices to mute, e.g. 2,3
        #[arg(long, value_delimiter = ',')]
        mute: Vec<u8>,
    },
    /// Play a song on a background thread, printing the cursor as it moves
    Play {
        /// Path to the XM file
        file: PathBuf,

        /// Comma-separated channel indices to mute, e.g. 2,3
        #[arg(long, value_delimiter = ',')]
        mute: Vec<u8>,
    },
    /// Load an XM file and re-save it, exercising the round-trip
    Save {
        /// Path to the input XM file
        input: PathBuf,
        /// Path to write the re-encoded XM file to
        output: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { file } => inspect(&file),
        Commands::Simulate {
            file,
            seconds,
            mute,
        } => simulate(&file, seconds, &mute),
        Commands::Play { file, mute } => play(&file, &mute),
        Commands::Save { input, output } => save(&input, &output),
    }
}

fn load_or_exit(path: &PathBuf) -> Controller {
    let mut ctrl = Controller::new();
    if let Err(e) = ctrl.load_xm_file(path) {
        eprintln!("failed to load {}: {}", path.display(), e);
        std::process::exit(1);
    }
    ctrl
}

fn inspect(path: &PathBuf) {
    let ctrl = load_or_exit(path);
    let song = ctrl.song();

    println!("Name:        {}", song.name);
    println!("Channels:    {}", song.channels);
    println!("Tempo/BPM:   {}/{}", song.tempo, song.bpm);
    println!("Patterns:    {}", song.patterns.len());
    println!("Orders:      {}", song.pot_length());
    println!("Restart pos: {}", song.restart_position);

    let samples_with_data = song
        .instruments
        .iter()
        .flat_map(|i| i.samples.iter())
        .filter(|s| !s.is_empty())
        .count();
    println!("Instruments: {}", song.instruments.len());
    println!("Samples:     {} (with data)", samples_with_data);
}

fn apply_mutes(ctrl: &mut Controller, mute: &[u8]) {
    for &channel in mute {
        ctrl.set_channel_muted(channel, true);
    }
}

fn simulate(path: &PathBuf, seconds: u32, mute: &[u8]) {
    let mut ctrl = load_or_exit(path);
    apply_mutes(&mut ctrl, mute);

    let report = ctrl.simulate(seconds.saturating_mul(1000));
    println!("Rows played:       {}", report.row_updates);
    println!("Order advances:    {}", report.pot_updates);
    println!("Channel triggers:  {}", report.channel_starts);
    println!("Samples finished:  {}", report.samples_finished);
    println!("Ended at:          {:?}", report.final_position);
    println!(
        "Stopped early:     {}",
        if report.stopped { "yes" } else { "no (budget exhausted)" }
    );
}

fn play(path: &PathBuf, mute: &[u8]) {
    let mut ctrl = load_or_exit(path);
    apply_mutes(&mut ctrl, mute);

    ctrl.play();
    println!("Playing {}...", path.display());

    while ctrl.is_playing() {
        if let Some(pos) = ctrl.position() {
            print!(
                "\rPot: {:3} | Pat: {:3} | Row: {:3}",
                pos.pot_pos, pos.pattern, pos.row
            );
            let _ = std::io::stdout().flush();
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    println!("\rDone.                              ");
}

fn save(input: &PathBuf, output: &PathBuf) {
    let ctrl = load_or_exit(input);
    if let Err(e) = ctrl.save_xm_file(output) {
        eprintln!("failed to save {}: {}", output.display(), e);
        std::process::exit(1);
    }
    println!("wrote {}", output.display());
}
