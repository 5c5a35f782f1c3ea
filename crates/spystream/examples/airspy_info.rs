//! Discover Airspy devices and print their identification.
//!
//! ```sh
//! cargo run --example airspy_info
//! cargo run --example airspy_info -- --serial 35AC63DC2D8C7A4F -v
//! ```
//!
//! NOTE: After each run, the device may need time to reset.
//! If you get "I/O Error", unplug and replug the device or wait 30 seconds.

use clap::{ArgAction, Parser};
use spystream::{Airspy, DeviceSelector};
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about = "Print information about connected Airspy boards", long_about = None)]
struct Args {
    /// Only query the board with this serial number (hex)
    #[arg(short, long, value_parser = parse_serial)]
    serial: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_serial(s: &str) -> Result<u64, String> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn main() {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        if let Some(err) = e.downcast_ref::<spystream::Error>() {
            eprintln!("Error Code: {} ({})", err.code().name(), err.code() as i32);
        }
        eprintln!("\nTroubleshooting:");
        eprintln!("- If you see 'I/O Error', the device may be hung");
        eprintln!("- Try unplugging and replugging the Airspy device");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let selectors: Vec<DeviceSelector> = match args.serial {
        Some(serial) => vec![DeviceSelector::Serial(serial)],
        None => {
            let devices = Airspy::list_devices()?;
            if devices.is_empty() {
                return Err(spystream::Error::DeviceNotFound.into());
            }
            (0..devices.len()).map(DeviceSelector::Index).collect()
        }
    };

    for (n, selector) in selectors.iter().enumerate() {
        let airspy = Airspy::open(selector)?;
        let info = airspy.device_info()?;

        println!("Found AirSpy board {}", n + 1);
        println!("Board ID Number: {} ({})", info.board_id, info.board_name());
        println!("Firmware Version: {}", info.firmware_version);
        println!(
            "Part ID Number: 0x{:08X} 0x{:08X}",
            info.part_id[0], info.part_id[1]
        );
        println!("Serial Number: 0x{:016X}", info.serial_number);
        println!("Supported sample rates:");
        for rate in &info.supported_sample_rates {
            println!("\t{:.6} MSPS", *rate as f64 / 1e6);
        }
        println!();
    }

    Ok(())
}
