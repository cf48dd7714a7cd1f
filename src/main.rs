// Copyright 2026 ecp5jtag contributors
// Licensed under the Apache-2.0 and MIT licenses.

use std::{fs::File, io::Write, time::Instant};
use clap::{Command, Arg, ArgAction, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};
use anyhow::bail;

use ecp5jtag::{ECP5, ECP5IDCODE, Ecp5Config, FlashGeometry};
use ecp5jtag::gpio::{LinuxGpio, LinuxGpioConfig};

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let matches = Command::new("ecp5jtag")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("chip")
             .help("GPIO character device the JTAG lines are on")
             .long("chip")
             .short('c')
             .action(ArgAction::Set)
             .default_value("/dev/gpiochip0")
             .global(true))
        .arg(Arg::new("tck")
             .help("GPIO line offset for TCK")
             .long("tck")
             .action(ArgAction::Set)
             .default_value("18")
             .value_parser(value_parser!(u32))
             .global(true))
        .arg(Arg::new("tms")
             .help("GPIO line offset for TMS")
             .long("tms")
             .action(ArgAction::Set)
             .default_value("21")
             .value_parser(value_parser!(u32))
             .global(true))
        .arg(Arg::new("tdi")
             .help("GPIO line offset for TDI")
             .long("tdi")
             .action(ArgAction::Set)
             .default_value("23")
             .value_parser(value_parser!(u32))
             .global(true))
        .arg(Arg::new("tdo")
             .help("GPIO line offset for TDO")
             .long("tdo")
             .action(ArgAction::Set)
             .default_value("19")
             .value_parser(value_parser!(u32))
             .global(true))
        .arg(Arg::new("led")
             .help("GPIO line offset for an activity LED, lit while JTAG is in use")
             .long("led")
             .action(ArgAction::Set)
             .value_parser(value_parser!(u32))
             .global(true))
        .arg(Arg::new("freq")
             .help("Block transfer clock frequency in Hz (k and M suffixes allowed)")
             .long("freq")
             .short('f')
             .action(ArgAction::Set)
             .default_value("30M")
             .value_parser(si_number::<u32>)
             .global(true))
        .arg(Arg::new("bit-mode")
             .help("Shift all data bit by bit instead of using block transfers")
             .long("bit-mode")
             .action(ArgAction::SetTrue)
             .global(true))
        .subcommand(Command::new("idcode")
            .about("Read the ECP5 IDCODE and status register"))
        .subcommand(Command::new("reload")
            .about("Request the ECP5 reload its configuration"))
        .subcommand(Command::new("program")
            .about("Program ECP5 SRAM with bitstream")
            .arg(Arg::new("file")
                 .help("File to program to ECP5")
                 .required(true)))
        .subcommand(Command::new("flash")
            .about("Access the SPI flash attached to the ECP5")
            .subcommand_required(true)
            .arg_required_else_help(true)
            .arg(Arg::new("page-size")
                 .help("Flash write page size in bytes")
                 .long("page-size")
                 .action(ArgAction::Set)
                 .default_value("256")
                 .value_parser(maybe_hex::<usize>)
                 .global(true))
            .arg(Arg::new("erase-size")
                 .help("Flash erase block size in bytes: 4096, 32768 or 65536")
                 .long("erase-size")
                 .action(ArgAction::Set)
                 .default_value("4096")
                 .value_parser(maybe_hex::<usize>)
                 .global(true))
            .subcommand(Command::new("write")
                .about("Write binary file to SPI flash")
                .arg(Arg::new("file")
                     .help("File to write to SPI flash")
                     .required(true))
                .arg(Arg::new("offset")
                     .help("Start address (in bytes) to write to (decimal, or hex with 0x prefix)")
                     .long("offset")
                     .value_parser(maybe_hex::<u32>)
                     .default_value("0"))
                .arg(Arg::new("force")
                     .help("Erase and write every block instead of only blocks that differ")
                     .long("force")
                     .action(ArgAction::SetTrue)))
            .subcommand(Command::new("read")
                .about("Read SPI flash contents to file")
                .arg(Arg::new("file")
                     .help("File to write SPI flash contents to")
                     .required(true))
                .arg(Arg::new("offset")
                     .help("Start address (in bytes) of read (decimal, or hex with 0x prefix)")
                     .long("offset")
                     .action(ArgAction::Set)
                     .value_parser(maybe_hex::<u32>)
                     .default_value("0"))
                .arg(Arg::new("length")
                     .help("Length (in bytes) of read (decimal, or hex with 0x prefix)")
                     .long("length")
                     .action(ArgAction::Set)
                     .required(true)
                     .value_parser(maybe_hex::<usize>)))
            )
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    let gpio = LinuxGpio::new(LinuxGpioConfig {
        chip: matches.get_one::<String>("chip").unwrap().clone(),
        tck: *matches.get_one("tck").unwrap(),
        tms: *matches.get_one("tms").unwrap(),
        tdi: *matches.get_one("tdi").unwrap(),
        tdo: *matches.get_one("tdo").unwrap(),
        led: matches.get_one("led").copied(),
    });

    let mut config = Ecp5Config {
        block_mode: !matches.get_flag("bit-mode"),
        spi_clock_hz: *matches.get_one("freq").unwrap(),
        ..Default::default()
    };
    if let Some(matches) = matches.subcommand_matches("flash") {
        let page_size = *matches.get_one("page-size").unwrap();
        let erase_size = *matches.get_one("erase-size").unwrap();
        config.geometry = FlashGeometry::new(page_size, erase_size)?;
    }

    let mut ecp5 = ECP5::new(gpio, config);

    match matches.subcommand_name() {
        Some("idcode") => {
            let idcode = ecp5.idcode()?;
            match ECP5IDCODE::try_from_idcode(idcode) {
                Some(device) => println!("IDCODE: 0x{idcode:08X} ({})", device.name()),
                None => println!("IDCODE: 0x{idcode:08X} (not a known ECP5)"),
            }
            println!("{:?}", ecp5.status()?);
        },
        Some("reload") => {
            if !quiet { println!("Reloading ECP5 configuration...") };
            ecp5.refresh()?;
        },
        Some("program") => {
            let matches = matches.subcommand_matches("program").unwrap();
            let path = matches.get_one::<String>("file").unwrap();
            let data = std::fs::read(path)?;
            check_idcode(&mut ecp5)?;
            let ok = if quiet {
                ecp5.program(&data[..])?
            } else {
                ecp5.program_progress(&data)?
            };
            if !ok {
                bail!("ECP5 did not report DONE after loading the bitstream.");
            }
        },
        Some("flash") => {
            let matches = matches.subcommand_matches("flash").unwrap();
            check_idcode(&mut ecp5)?;
            match matches.subcommand_name() {
                Some("write") => {
                    let matches = matches.subcommand_matches("write").unwrap();
                    let path = matches.get_one::<String>("file").unwrap();
                    let offset = *matches.get_one("offset").unwrap();
                    let force = matches.get_flag("force");
                    let data = std::fs::read(path)?;
                    let ok = if quiet {
                        ecp5.flash_program(offset, &data[..], force)?
                    } else {
                        ecp5.flash_program_progress(offset, &data, force)?
                    };
                    if !ok {
                        bail!("Flash did not report idle with writes disabled after programming.");
                    }
                },
                Some("read") => {
                    let matches = matches.subcommand_matches("read").unwrap();
                    let path = matches.get_one::<String>("file").unwrap();
                    let offset = *matches.get_one("offset").unwrap();
                    let length = *matches.get_one("length").unwrap();
                    let mut file = File::create(path)?;
                    let data = if quiet {
                        ecp5.flash_read(offset, length)?
                    } else {
                        ecp5.flash_read_progress(offset, length)?
                    };
                    file.write_all(&data)?;
                },
                _ => panic!("Unhandled flash subcommand."),
            }
        },
        _ => panic!("Unhandled command."),
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

/// Refuse to continue if the JTAG chain does not answer with an ECP5 IDCODE.
fn check_idcode(ecp5: &mut ECP5<LinuxGpio>) -> anyhow::Result<()> {
    let idcode = ecp5.idcode()?;
    match ECP5IDCODE::try_from_idcode(idcode) {
        Some(device) => {
            log::info!("Found {} (IDCODE 0x{:08X})", device.name(), idcode);
            Ok(())
        },
        None => bail!("IDCODE 0x{idcode:08X} is not a known ECP5."),
    }
}
