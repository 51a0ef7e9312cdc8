#[macro_use]
extern crate log;

use std::io::Read;

use anyhow::{bail, Context, Result};
use clap::Parser;

use btt::*;

fn open_btt(args: &OpenArgs) -> Result<Btt<FileNamespace>> {
    let ns = FileNamespace::open(&args.path).with_context(|| format!("open {}", args.path))?;
    let rawsize = ns.size() as u64;
    let btt = Btt::new(
        ns,
        BttConfig {
            rawsize,
            lbasize: args.lbasize,
            parent_uuid: [0u8; 16],
            maxlane: args.maxlane,
        },
    )?;
    Ok(btt)
}

fn print_info(btt: &Btt<FileNamespace>) {
    println!(
        "laidout {}  nlba {}  lbasize {}  nlane {}",
        btt.laidout(),
        btt.nlba(),
        btt.lbasize(),
        btt.nlane()
    );
    for (start, info) in btt.arena_infos() {
        println!("arena at {:#x}:", start);
        println!("  flags          {:#x}", info.flags);
        println!("  version        {}.{}", info.major, info.minor);
        println!("  external_lbasize {}", info.external_lbasize);
        println!("  external_nlba  {}", info.external_nlba);
        println!("  internal_lbasize {}", info.internal_lbasize);
        println!("  internal_nlba  {}", info.internal_nlba);
        println!("  nfree          {}", info.nfree);
        println!(
            "  dataoff {:#x}  mapoff {:#x}  flogoff {:#x}  infooff {:#x}  nextoff {:#x}",
            info.dataoff, info.mapoff, info.flogoff, info.infooff, info.nextoff
        );
    }
}

fn hexdump(buf: &[u8]) {
    for (i, line) in buf.chunks(16).enumerate() {
        print!("{:08x} ", i * 16);
        for b in line {
            print!(" {:02x}", b);
        }
        println!();
    }
}

pub fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.command {
        Commands::Create(a) => {
            let ns = FileNamespace::create(&a.path, a.size as u64)
                .with_context(|| format!("create {}", a.path))?;
            let btt = Btt::with_params(
                ns,
                BttConfig {
                    rawsize: a.size as u64,
                    lbasize: a.lbasize,
                    parent_uuid: [0u8; 16],
                    maxlane: 1,
                },
                LayoutParams {
                    nfree: a.nfree,
                    ..LayoutParams::default()
                },
            )?;
            btt.init_layout(0)?;
            info!("laid out {} blocks of {} bytes", btt.nlba(), a.lbasize);
            print_info(&btt);
        }
        Commands::Info(a) => {
            let btt = open_btt(&a)?;
            print_info(&btt);
        }
        Commands::Check(a) => {
            let btt = open_btt(&a)?;
            if !btt.check()? {
                bail!("namespace is inconsistent");
            }
            println!("consistent");
        }
        Commands::Read(a) => {
            let btt = open_btt(&a.open)?;
            let mut buf = vec![0u8; btt.lbasize() as usize];
            btt.read(0, a.lba, &mut buf)?;
            hexdump(&buf);
        }
        Commands::Write(a) => {
            let btt = open_btt(&a.open)?;
            let mut buf = vec![0u8; btt.lbasize() as usize];
            match (&a.input, a.fill) {
                (Some(path), _) => {
                    if path == "-" {
                        std::io::stdin().read_exact(&mut buf).context("read stdin")?;
                    } else {
                        let data = std::fs::read(path)?;
                        if data.len() != buf.len() {
                            bail!("input must be exactly {} bytes", buf.len());
                        }
                        buf.copy_from_slice(&data);
                    }
                }
                (None, Some(fill)) => buf.fill(fill as u8),
                (None, None) => bail!("one of --input or --fill is required"),
            }
            btt.write(0, a.lba, &buf)?;
        }
        Commands::SetZero(a) => {
            let btt = open_btt(&a.open)?;
            btt.set_zero(0, a.lba)?;
        }
        Commands::SetError(a) => {
            let btt = open_btt(&a.open)?;
            btt.set_error(0, a.lba)?;
        }
    }
    Ok(())
}
