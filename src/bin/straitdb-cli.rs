use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use clap::{Parser, Subcommand};
use straitdb::{reserved, EntryParams, Store, StoreConfig, StoreError};

#[derive(Parser)]
#[command(name = "straitdb", version, about = "Inspect and exercise straitdb datafiles")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a new datafile
    Create {
        path: PathBuf,
        #[arg(long, default_value_t = 1)]
        page_multiplier: u16,
        #[arg(long, default_value_t = 1)]
        index_pages: u16,
        #[arg(long, default_value_t = 1)]
        structure_pages: u16,
    },
    /// Print the header, the free list and every entry
    Info { path: PathBuf },
    /// Classify every page and verify checksums
    Check { path: PathBuf },
    /// Allocate and delete rows from several threads
    Stress {
        path: PathBuf,
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 10_000)]
        rows: usize,
        #[arg(long, default_value_t = 128)]
        row_size: u16,
        #[arg(long, default_value_t = 2)]
        strait_exponent: u8,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Create {
            path,
            page_multiplier,
            index_pages,
            structure_pages,
        } => {
            let config = StoreConfig::default()
                .with_page_multiplier(page_multiplier)
                .with_index_pages(index_pages)
                .with_structure_pages(structure_pages);
            let store = Store::create(&path, config)?;
            println!("Created {}", path.display());
            println!("  Page size: {}", store.file().page_size());
            println!("  Pages:     {}", store.file().page_count());
        }
        Command::Info { path } => show_info(&Store::open(&path, StoreConfig::default())?)?,
        Command::Check { path } => {
            let report = Store::open(&path, StoreConfig::default())?.check()?;
            println!("Pages:   {}", report.pages);
            println!("  index:   {}", report.index);
            println!("  object:  {}", report.object);
            println!("  lookup:  {}", report.lookup);
            println!("  deleted: {}", report.deleted);
            println!("  unused:  {}", report.unused);
            if report.bad_checksums.is_empty() {
                println!("All checksums match");
            } else {
                println!("Checksum mismatches: {:?}", report.bad_checksums);
                return Err("checksum mismatches found".into());
            }
        }
        Command::Stress {
            path,
            threads,
            rows,
            row_size,
            strait_exponent,
        } => stress(&path, threads, rows, row_size, strait_exponent)?,
    }
    Ok(())
}

fn show_info(store: &Store) -> Result<(), Box<dyn Error>> {
    let file = store.file();
    let header = file.header();
    let geometry = file.geometry();
    println!("Datafile: {}", file.path().display());
    println!("  Page size:       {} ({} x OS page)", header.page_size, header.page_multiplier);
    println!("  Pages:           {}", file.page_count());
    println!("  Index pages:     {}", geometry.index_pages);
    println!("  Structure pages: {}", geometry.structure_pages);

    let stats = store.allocator_stats()?;
    println!("Free list:");
    println!("  Free pages:   {}", stats.free_pages);
    println!("  Record pages: {}", stats.record_pages);

    println!("Entries:");
    let mut worker = store.worker();
    for id in reserved::FIRST_USER as usize..geometry.entry_count() {
        let Ok(id) = u16::try_from(id) else { break };
        match worker.entry(id) {
            Ok(record) => println!(
                "  {id:>5}: structure {} depth {} strait {} pages {} rows/page {}",
                record.structure_id,
                record.depth(),
                record.strait_pages(),
                record.ref0c,
                record.objects_per_page
            ),
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn stress(
    path: &Path,
    threads: usize,
    rows: usize,
    row_size: u16,
    strait_exponent: u8,
) -> Result<(), Box<dyn Error>> {
    let store = if path.exists() {
        Store::open(path, StoreConfig::default())?
    } else {
        Store::create(path, StoreConfig::default())?
    };
    let stats = store.cache().enable_stats();
    let entry = {
        let mut worker = store.worker();
        let structure = worker.create_structure(row_size)?;
        worker.create_entry(
            EntryParams::new(structure.id)
                .with_depth(1)
                .with_strait_exponent(strait_exponent),
        )?
    };

    let per_thread = rows / threads.max(1);
    let start = Instant::now();
    let handles: Vec<_> = (0..threads.max(1))
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || -> Result<(), StoreError> {
                let mut worker = store.worker();
                let mut mine = Vec::with_capacity(per_thread);
                for _ in 0..per_thread {
                    mine.push(worker.allocate_row(entry)?.row_id);
                }
                for id in mine.iter().step_by(2) {
                    worker.delete_row(entry, *id)?;
                }
                for _ in 0..per_thread / 2 {
                    worker.allocate_row(entry)?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().map_err(|_| "stress thread panicked")??;
    }
    let elapsed = start.elapsed();
    store.flush()?;

    let record = store.worker().entry(entry)?;
    println!("Stress on entry {entry}:");
    println!("  Threads:     {threads}");
    println!("  Rows:        {}", per_thread * threads.max(1));
    println!("  Pages:       {}", record.ref0c);
    println!("  Elapsed:     {elapsed:?}");
    println!("  Hit rate:    {:.2}%", stats.hit_rate());
    Ok(())
}
