use env_logger::Env;
use fwpack::{Error, PackOpt, PartitionTable, Plan};
use main_error::MainError;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt)]
struct PartitionsOpt {
    /// Partition table csv
    #[structopt(parse(from_os_str))]
    partition_table: PathBuf,
}

#[derive(StructOpt)]
enum Opt {
    /// Merge bootloader, partition table and applications into one image
    Pack(PackOpt),
    /// Print where every artifact would be placed, without writing the image
    Plan(PackOpt),
    /// Print the partitions of a partition table
    Partitions(PartitionsOpt),
}

fn pack(opt: PackOpt) -> Result<(), Error> {
    let image = fwpack::pack(&opt)?;

    log::info!(
        "Success: {} ({:.2} MB, {} bytes)",
        image.path.display(),
        image.len as f64 / 1024.0 / 1024.0,
        image.len
    );

    Ok(())
}

fn plan(opt: PackOpt) -> Result<(), Error> {
    let Plan { layout, .. } = fwpack::plan(&opt)?;

    for segment in layout.segments() {
        println!("{}", segment);
    }
    println!(
        "{:#x} bytes, fill {:#04x}",
        layout.len(),
        layout.fill_byte()
    );

    Ok(())
}

fn partitions(opt: PartitionsOpt) -> Result<(), Error> {
    let table = PartitionTable::load(&opt.partition_table)?;

    for record in table.records() {
        println!(
            "{:<16} {:<5} {:<10} {:#010x} {:#010x} {}",
            record.name,
            record.r#type,
            record.subtype,
            record.offset,
            record.size,
            record.flags.join(":")
        );
    }

    Ok(())
}

#[paw::main]
fn main(args: Opt) -> Result<(), MainError> {
    env_logger::Builder::from_env(Env::default().default_filter_or("fwpack=info"))
        .format_timestamp(None)
        .init();

    match args {
        Opt::Pack(opt) => pack(opt)?,
        Opt::Plan(opt) => plan(opt)?,
        Opt::Partitions(opt) => partitions(opt)?,
    };

    Ok(())
}
