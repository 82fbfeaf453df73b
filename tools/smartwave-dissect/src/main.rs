//! Decode SmartWave serial captures into readable frames.

mod capture;
mod dissect;

use anyhow::{Context, Result};
use capture::{Assembled, Direction, FrameAssembler};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Capture file with `time,direction,hex` lines; stdin when omitted
    input: Option<PathBuf>,

    /// Print the raw bytes under each frame
    #[arg(long)]
    raw: bool,

    /// Only show frames in one direction (host or device)
    #[arg(long)]
    direction: Option<Direction>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.no_color {
        colored::control::set_override(false);
    }

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut host = FrameAssembler::new(Direction::HostToDevice);
    let mut device = FrameAssembler::new(Direction::DeviceToHost);
    let mut frames = 0usize;

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let Some(chunk) =
            capture::parse_line(&line).with_context(|| format!("line {}", number + 1))?
        else {
            continue;
        };
        let assembler = match chunk.direction {
            Direction::HostToDevice => &mut host,
            Direction::DeviceToHost => &mut device,
        };
        for item in assembler.push(chunk.timestamp, &chunk.data) {
            frames += print(&args, item);
        }
    }
    for item in [host.finish(), device.finish()].into_iter().flatten() {
        print(&args, item);
    }

    eprintln!("{} frames", frames);
    Ok(())
}

/// Print one assembled item, returning the number of frames shown.
fn print(args: &Args, item: Assembled) -> usize {
    match item {
        Assembled::Frame(frame) => {
            if args.direction.is_some_and(|d| d != frame.direction) {
                return 0;
            }
            let dissected = dissect::dissect_serial_frame(&frame);
            println!("{}", dissected);
            if args.raw {
                println!("{:>12} {}", "", hex::encode(&dissected.raw_data));
            }
            1
        }
        Assembled::Garbage {
            timestamp,
            direction,
            data,
        } => {
            if args.direction.is_some_and(|d| d != direction) {
                return 0;
            }
            println!(
                "{:>12.6} {} {}",
                timestamp,
                direction,
                dissect::describe_garbage(&data)
            );
            0
        }
    }
}
