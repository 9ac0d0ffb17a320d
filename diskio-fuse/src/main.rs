#[macro_use]
extern crate log;

mod host;
mod logging;
mod verify;

use clap::{value_t, App, Arg};
use diskio::sd::{SdConfig, SdDisk, SdDmaDisk};
use diskio::sram::RamDisk;
use diskio::BLOCK_SIZE;
use host::{ImageCard, StdKernel};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use verify::Options;

fn main() {
    if let Err(err) = run() {
        error!("{}", err);
        eprintln!("diskio-fuse: {}", err);
        process::exit(1);
    }
}

fn run() -> std::io::Result<()> {
    let matches = App::new("diskio-fuse")
        .about("Exercise the disk drivers against an image file")
        .arg(
            Arg::with_name("image")
                .short("i")
                .long("image")
                .takes_value(true)
                .default_value("sdcard.img")
                .help("Image file backing the simulated SD card"),
        )
        .arg(
            Arg::with_name("backend")
                .short("b")
                .long("backend")
                .takes_value(true)
                .possible_values(&["sd", "sd-poll", "ram"])
                .default_value("sd")
                .help("Driver to exercise"),
        )
        .arg(
            Arg::with_name("sectors")
                .short("n")
                .long("sectors")
                .takes_value(true)
                .default_value("8192")
                .help("Disk size in sectors"),
        )
        .arg(
            Arg::with_name("rounds")
                .short("r")
                .long("rounds")
                .takes_value(true)
                .default_value("64")
                .help("Number of random write/read rounds"),
        )
        .arg(
            Arg::with_name("max-count")
                .short("c")
                .long("max-count")
                .takes_value(true)
                .default_value("16")
                .help("Largest number of sectors in one transfer"),
        )
        .arg(
            Arg::with_name("latency")
                .long("latency")
                .takes_value(true)
                .default_value("100")
                .help("Simulated DMA latency in microseconds"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .help("Seed of the random generator"),
        )
        .arg(
            Arg::with_name("log")
                .long("log")
                .takes_value(true)
                .help("Log level (overrides the LOG environment variable)"),
        )
        .get_matches();

    logging::init(matches.value_of("log"));
    let sectors = value_t!(matches, "sectors", u64).unwrap_or_else(|e| e.exit());
    let opts = Options {
        rounds: value_t!(matches, "rounds", usize).unwrap_or_else(|e| e.exit()),
        max_count: value_t!(matches, "max-count", u32).unwrap_or_else(|e| e.exit()),
    };
    let latency = value_t!(matches, "latency", u64).unwrap_or_else(|e| e.exit());
    let mut rng = match matches.value_of("seed") {
        Some(_) => {
            let seed = value_t!(matches, "seed", u64).unwrap_or_else(|e| e.exit());
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_entropy(),
    };
    let image = Path::new(matches.value_of("image").unwrap_or("sdcard.img"));
    let kernel = Arc::new(StdKernel::new());

    let report = match matches.value_of("backend").unwrap_or("sd") {
        "ram" => verify::exercise(
            Arc::new(RamDisk::new(sectors as usize * BLOCK_SIZE)),
            &opts,
            &mut rng,
        )?,
        "sd-poll" => {
            let card = ImageCard::open(image, sectors, Duration::from_micros(latency))?;
            let disk = SdDisk::new(card, kernel, SdConfig::default());
            verify::exercise(Arc::new(disk), &opts, &mut rng)?
        }
        _ => {
            let card = ImageCard::open(image, sectors, Duration::from_micros(latency))?;
            let disk = Arc::new(SdDmaDisk::new(card, kernel, SdConfig::default()));
            disk.host().attach(disk.completion_port());
            let report = verify::exercise(disk.clone(), &opts, &mut rng)?;
            let stats = disk.stats();
            println!(
                "transfers: {} direct, {} staged, {} failed; {} completion event(s) dropped",
                stats.direct,
                stats.staged,
                stats.failed,
                disk.dropped_events()
            );
            report
        }
    };
    println!(
        "verified {} round(s) on {} sectors: {} bytes moved, {} misaligned buffer(s)",
        report.rounds, report.sectors, report.bytes, report.misaligned
    );
    Ok(())
}
