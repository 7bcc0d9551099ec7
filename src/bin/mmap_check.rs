//! Check (and optionally repair) the tries of a database file.
//!
//! Usage:
//!   mmap_check <file> [--min-id N] [--max-id N] [--verbose] [--recover <bool>]
//!
//! Exits 0 when every checked trie is clean (or was repaired), 1 when
//! corruption remains, 2 on usage errors.

use std::process::ExitCode;

use mmap_trie::check::check_region;
use mmap_trie::trie_alloc::{MAX_TRIE_ID, MIN_TRIE_ID};
use mmap_trie::{MmapFile, Permissions, ResMode};

struct Options {
    file: String,
    min_id: u32,
    max_id: u32,
    verbose: bool,
    recover: bool,
}

fn usage() -> ExitCode {
    eprintln!(
        "usage: mmap_check <file> [--min-id N] [--max-id N] [--verbose] [--recover <bool>]"
    );
    ExitCode::from(2)
}

fn parse_args() -> Option<Options> {
    let mut opts = Options {
        file: String::new(),
        min_id: MIN_TRIE_ID,
        max_id: MAX_TRIE_ID,
        verbose: false,
        recover: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--min-id" => opts.min_id = args.next()?.parse().ok()?,
            "--max-id" => opts.max_id = args.next()?.parse().ok()?,
            "--verbose" => opts.verbose = true,
            "--recover" => opts.recover = args.next()?.parse().ok()?,
            _ if opts.file.is_empty() && !arg.starts_with('-') => opts.file = arg,
            _ => return None,
        }
    }
    if opts.file.is_empty() {
        return None;
    }
    Some(opts)
}

fn main() -> ExitCode {
    let Some(opts) = parse_args() else {
        return usage();
    };

    let perm = if opts.recover {
        Permissions::READ_WRITE
    } else {
        Permissions::READ
    };
    let db = match MmapFile::open(&opts.file, ResMode::Open, perm, 0) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("mmap_check: can't open {}: {e}", opts.file);
            return ExitCode::from(2);
        }
    };

    match check_region(
        db.area(),
        opts.min_id,
        opts.max_id,
        opts.recover,
        opts.verbose,
    ) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) if opts.recover => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("mmap_check: {e}");
            ExitCode::from(1)
        }
    }
}
