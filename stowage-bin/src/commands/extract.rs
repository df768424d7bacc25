use stowage::{extract_all, ArchiveReader, ExtractOptions};

use crate::cli::ExtractArgs;
use crate::error::{Error, Result};

pub fn run(args: ExtractArgs, verbose: bool) -> Result<()> {
    let mut reader =
        ArchiveReader::open_path(&args.archive).map_err(|source| Error::OpenArchive {
            path: args.archive.clone(),
            source,
        })?;

    let output = args
        .output
        .unwrap_or_else(|| std::env::current_dir().expect("no current directory"));

    let options = ExtractOptions {
        allow_dotdot: args.allow_dotdot,
        allow_absolute: args.allow_absolute,
        allow_escaping_symlinks: args.allow_escaping_symlinks,
        restore_ownership: args.ownership,
        ..ExtractOptions::default()
    };

    let stats =
        extract_all(&mut reader, &output, &options).map_err(|source| Error::Extract { source })?;

    if verbose {
        println!(
            "{} files, {} dirs, {} links extracted ({} bytes){}",
            stats.files,
            stats.dirs,
            stats.symlinks + stats.hardlinks,
            stats.bytes_written,
            if stats.skipped > 0 {
                format!(", {} skipped", stats.skipped)
            } else {
                String::new()
            },
        );
    }

    Ok(())
}
