mod logging;

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use blamcache::{CacheFile, CacheType, ChunkStream, Config, Module, ModuleTag};
use clap::Parser;
use fs_err as fs;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;

use logging::*;

#[derive(Parser, Debug)]
struct ActionInfo {
    #[arg(index = 1)]
    map: PathBuf,
}

#[derive(Parser, Debug)]
struct ActionTags {
    #[arg(index = 1)]
    map: PathBuf,
    /// Only list tags of this class code (e.g. "scnr")
    #[arg(short, long)]
    class: Option<String>,
    /// Print the tag list as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct ActionPak {
    #[arg(index = 1)]
    pak: PathBuf,
    #[arg(index = 2)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct ActionModule {
    #[arg(index = 1)]
    module: PathBuf,
    /// Extract item data into this directory
    #[arg(short, long)]
    extract: Option<PathBuf>,
    /// Additional modules whose tags are merged into the index
    #[arg(short, long)]
    link: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
enum Action {
    /// Show the detected build and header of a cache file
    Info(ActionInfo),
    /// List tags in a cache file
    Tags(ActionTags),
    /// Decompress a chunked pak file
    Pak(ActionPak),
    /// List or extract items of a module file
    Module(ActionModule),
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, default_value = "false")]
    verbose: bool,
    #[arg(short, long, default_value = "false")]
    debug: bool,
    /// Read the cache as this type instead of detecting it from the build string
    #[arg(long, value_enum)]
    cache_type: Option<CacheType>,
    #[arg(long, default_value_t = 8)]
    file_handles: usize,
    #[command(subcommand)]
    action: Action,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.debug)?;
    let log = Log::new(args.verbose, args.debug);

    let config = Config {
        cache_type_override: args.cache_type,
        prewarm: false,
        file_handles: args.file_handles,
    };

    match args.action {
        Action::Info(action) => action_info(action, &config, &log),
        Action::Tags(action) => action_tags(action, &config, &log),
        Action::Pak(action) => action_pak(action, &log),
        Action::Module(action) => action_module(action, &log),
    }
}

fn progress_bar(len: u64, template: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(ProgressStyle::default_bar().template(template)?.progress_chars("#>-"));
    Ok(pb)
}

fn action_info(args: ActionInfo, config: &Config, log: &Log) -> Result<()> {
    let cache = CacheFile::open_with(&args.map, config)?;
    let header = cache.header();
    let metadata = cache.metadata();

    log!(log, "build:      {}", cache.build_string());
    log!(log, "type:       {}", cache.cache_type().as_ref());
    log!(log, "game:       {:?} ({:?})", metadata.game, metadata.platform);
    log!(log, "byte order: {:?}", cache.byte_order());
    log!(log, "scenario:   {}", header.scenario_name);
    log!(log, "tags:       {}", cache.tag_index().len());
    log!(log, "classes:    {}", cache.tag_index().classes().len());
    log!(log, "strings:    {}", cache.string_index().len());
    verbose!(log, "profile:    {:?}", cache.profile());
    verbose!(log, "index:      {:?}", header.index_pointer);
    verbose!(log, "virtual base {:#x}, tag data {:#x}", header.virtual_base_address, header.tag_data_origin());
    for (i, section) in header.section_table.iter().enumerate() {
        debug!(
            log,
            "section {i}: {:#x} + {:#x} at {:#x}",
            section.virtual_address,
            section.size,
            header.section_offsets[i]
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct TagEntry<'a> {
    id: String,
    class: Option<String>,
    class_name: Option<&'a str>,
    path: Option<&'a str>,
    address: Option<u64>,
}

fn action_tags(args: ActionTags, config: &Config, log: &Log) -> Result<()> {
    let cache = CacheFile::open_with(&args.map, config)?;
    let entries: Vec<_> = cache
        .tags()
        .filter(|tag| args.class.is_none() || tag.class_code() == args.class)
        .map(|tag| TagEntry {
            id: format!("{:08x}", tag.id()),
            class: tag.class_code(),
            class_name: tag.class_name(),
            path: tag.path(),
            address: tag.metadata_address().ok(),
        })
        .collect();

    if args.json {
        let stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(stdout, &entries)?;
        println!();
        return Ok(());
    }
    for entry in &entries {
        log!(
            log,
            "{} [{}] {}",
            entry.id,
            entry.class.as_deref().unwrap_or("????"),
            entry.path.unwrap_or("<unnamed>")
        );
        verbose!(log, "    {}", entry.address.map_or("<no metadata>".into(), |a| format!("{a:#x}")));
    }
    Ok(())
}

fn action_pak(args: ActionPak, log: &Log) -> Result<()> {
    let input = BufReader::new(fs::File::open(&args.pak)?);
    let mut stream = ChunkStream::pak(input).with_context(|| format!("reading {}", args.pak.display()))?;
    verbose!(log, "{} chunks, {} bytes", stream.chunks().len(), stream.len());

    let pb = progress_bar(stream.len(), "[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")?;
    log.set_progress(Some(&pb));

    let mut output = BufWriter::new(fs::File::create(&args.output)?);
    let mut buffer = vec![0; 0x10000];
    loop {
        let read = stream.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        output.write_all(&buffer[..read])?;
        pb.inc(read as u64);
    }
    output.flush()?;

    pb.finish_and_clear();
    log.set_progress(None);
    log!(log, "wrote {} bytes to {}", stream.len(), args.output.display());
    Ok(())
}

fn action_module(args: ActionModule, log: &Log) -> Result<()> {
    let mut module = Module::open(&args.module)?;
    for path in &args.link {
        if !module.add_linked_module(path)? {
            verbose!(log, "{} is already linked", path.display());
        }
    }

    let tags: Vec<ModuleTag> = module.linked_items().collect();
    let Some(output) = args.extract else {
        for tag in &tags {
            log!(log, "{:08x} {tag:?}", tag.global_tag_id);
            verbose!(
                log,
                "    {} blocks, {} -> {} bytes, flags {:?}",
                tag.block_count,
                tag.total_compressed_size,
                tag.total_uncompressed_size,
                tag.flags
            );
        }
        return Ok(());
    };

    let pb = progress_bar(tags.len() as u64, "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?;
    log.set_progress(Some(&pb));
    tags.par_iter().try_for_each(|tag| -> Result<()> {
        let name = match tag.class_name() {
            Some(class) => format!("{}.{class}", tag.full_path()),
            None => tag.full_path().to_owned(),
        };
        verbose!(log, "{name}");
        let data = tag.read_data().with_context(|| format!("extracting {name}"))?;

        let path = extract_path(&output, &name)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, data)?;
        pb.inc(1);
        Ok(())
    })?;
    pb.finish_and_clear();
    log.set_progress(None);
    log!(log, "extracted {} items to {}", tags.len(), output.display());
    Ok(())
}

/// Joins an archive item name onto `output`. Only plain name components are
/// kept so a name cannot escape the output directory.
fn extract_path(output: &Path, name: &str) -> Result<PathBuf> {
    let normalized = name.replace('\\', "/");
    let relative: PathBuf = Path::new(&normalized)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    anyhow::ensure!(relative.file_name().is_some(), "item name {name:?} has no file name");
    Ok(output.join(relative))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extract_path() -> Result<()> {
        let output = Path::new("out");
        assert_eq!(
            extract_path(output, "objects\\test\\box.crate")?,
            Path::new("out/objects/test/box.crate")
        );
        assert_eq!(extract_path(output, "..\\..\\x")?, Path::new("out/x"));
        assert_eq!(extract_path(output, "/etc/passwd")?, Path::new("out/etc/passwd"));
        assert_eq!(extract_path(output, "a/./../b")?, Path::new("out/a/b"));
        assert!(extract_path(output, "..\\..").is_err());
        Ok(())
    }
}
