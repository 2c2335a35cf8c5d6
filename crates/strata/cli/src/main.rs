// Strata
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Strata WAL inspection tool
//!
//! Dumps, verifies and replays write-ahead logs produced by atomic operations.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use strata_core::recovery::WalRestorer;
use strata_core::storage_engine::{LogSequenceNumber, MemoryPageCache, StorageConfig, WalRecord, WriteAheadLog, WriteCache};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "strata-wal")]
#[command(about = "Strata - write-ahead log inspection")]
#[command(version = "0.1.0")]
struct Cli {
    /// JSON storage configuration (page size, storage id)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record of a log
    Dump {
        /// Directory holding the WAL segments
        directory: PathBuf,
        /// Only print records of this atomic operation
        #[arg(long)]
        unit: Option<u64>,
    },
    /// Check segment headers and record checksums
    Verify {
        /// Directory holding the WAL segments
        directory: PathBuf,
    },
    /// Restore a log into an in-memory page cache and summarize the result
    Replay {
        /// Directory holding the WAL segments
        directory: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Dump { directory, unit } => handle_dump(&directory, unit),
        Commands::Verify { directory } => handle_verify(&directory),
        Commands::Replay { directory, json } => handle_replay(&config, &directory, json),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StorageConfig> {
    match path {
        Some(path) => StorageConfig::load(path).with_context(|| format!("reading {}", path.display())),
        None => Ok(StorageConfig::default()),
    }
}

fn describe(record: &WalRecord) -> String {
    match record {
        WalRecord::FileCreated { file_name, file_id, .. } => format!("file={file_id} name={file_name}"),
        WalRecord::FileDeleted { file_id, .. } => format!("file={file_id}"),
        WalRecord::UpdatePage { file_id, page_index, changes, initial_lsn, .. } => {
            format!("file={file_id} page={page_index} bytes={} initial_lsn={initial_lsn}", changes.changed_bytes())
        }
        WalRecord::AtomicUnitEnd { rollback, metadata, .. } => {
            let keys: Vec<_> = metadata.iter().map(|(key, _)| key).collect();
            format!("rollback={rollback} metadata=[{}]", keys.join(","))
        }
    }
}

fn handle_dump(directory: &Path, unit: Option<u64>) -> anyhow::Result<()> {
    let records = WriteAheadLog::read_directory(directory, LogSequenceNumber::default()).with_context(|| format!("reading log in {}", directory.display()))?;

    let mut printed = 0;
    for (lsn, record) in &records {
        if unit.is_some_and(|unit| unit != record.operation_unit_id()) {
            continue;
        }
        println!("{:>12}  unit={:<6} {:<16} {}", lsn.to_string(), record.operation_unit_id(), record.kind(), describe(record));
        printed += 1;
    }

    info!("Dumped {} of {} records from {}", printed, records.len(), directory.display());
    Ok(())
}

fn handle_verify(directory: &Path) -> anyhow::Result<()> {
    let report = WriteAheadLog::verify_directory(directory).with_context(|| format!("verifying log in {}", directory.display()))?;

    println!("Segments: {}", report.segments);
    println!("Records:  {}", report.records);
    match report.torn_tail {
        Some(lsn) => println!("Torn tail at {lsn}; it is cut off when the log is opened"),
        None => println!("Log is intact"),
    }
    Ok(())
}

fn handle_replay(config: &StorageConfig, directory: &Path, json: bool) -> anyhow::Result<()> {
    let cache = MemoryPageCache::from_config(config)?;
    let records = WriteAheadLog::read_directory(directory, LogSequenceNumber::default()).with_context(|| format!("reading log in {}", directory.display()))?;
    let summary = WalRestorer::new(&cache, &cache).restore_records(records)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Units applied:     {}", summary.units_applied);
        println!("Units rolled back: {}", summary.units_rolled_back);
        println!("Units incomplete:  {}", summary.units_incomplete);
        println!("Pages updated:     {}", summary.pages_updated);
        if let Some(lsn) = summary.last_lsn {
            println!("Last LSN:          {lsn}");
        }
    }

    let files = cache.files();
    if !json {
        println!("Files:");
        for (file_id, name, pages) in &files {
            let native = cache.native_file_name_by_id(*file_id).unwrap_or_else(|| name.clone());
            println!("  {:<12} {native:<24} {pages} pages", file_id.to_string());
        }
    }

    info!("Replayed {} records into {} files", summary.records, files.len());
    Ok(())
}
