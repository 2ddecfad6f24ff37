//! loam CLI - plumbing commands over the content-addressed core

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use bstr::ByteSlice;
use clap::{Parser, Subcommand};

use loam::ops::{check_updates, oneway_policy, unpack_trees, UnpackOptions};
use loam::{index, revision, Index, IndexEntry, Kind, Mode, Repo};

#[derive(Parser)]
#[command(name = "loam")]
#[command(about = "content-addressed version control core - plumbing interface")]
#[command(version)]
struct Cli {
    /// repository path
    #[arg(short, long, default_value = ".", env = "LOAM_REPO")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new repository
    Init {
        /// path to create repository at
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// hash stdin (or a file) into the object store as a blob
    HashObject {
        /// file to hash; stdin when omitted
        file: Option<PathBuf>,
        /// actually write the object
        #[arg(short, long)]
        write: bool,
    },

    /// print the kind, size, or contents of an object
    CatFile {
        /// revision expression naming the object
        rev: String,
        /// print the kind instead of the payload
        #[arg(short = 't', long)]
        kind: bool,
        /// print the payload size instead of the payload
        #[arg(short, long)]
        size: bool,
    },

    /// resolve a revision expression to an object id
    RevParse {
        rev: String,
        /// explain how the expression resolves
        #[arg(long)]
        diagnose: bool,
    },

    /// list the index entries
    LsIndex {
        /// show stat-cache details
        #[arg(short, long)]
        verbose: bool,
    },

    /// add or remove index entries
    UpdateIndex {
        /// add the blob at <id> under <path>
        #[arg(long, num_args = 2, value_names = ["ID", "PATH"])]
        cacheinfo: Option<Vec<String>>,
        /// remove <path> from the index
        #[arg(long)]
        remove: Option<String>,
    },

    /// write the index out as a tree and print its id
    WriteTree {
        /// do not store the tree records
        #[arg(long)]
        dry_run: bool,
    },

    /// read a tree into the index (and optionally the working tree)
    ReadTree {
        /// tree-ish to read
        rev: String,
        /// also update the working tree rooted here
        #[arg(short, long)]
        update: Option<PathBuf>,
    },

    /// verify object and pack integrity
    Verify,
}

fn main() -> ExitCode {
    colog::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> loam::Result<()> {
    if let Commands::Init { path } = &cli.command {
        Repo::init(path)?;
        println!("initialized empty repository at {}", path.display());
        return Ok(());
    }
    let repo = Repo::open(&cli.repo)?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),

        Commands::HashObject { file, write } => {
            let mut content = Vec::new();
            match file {
                Some(path) => {
                    content = std::fs::read(&path).map_err(|e| loam::Error::Io {
                        path,
                        source: e,
                    })?;
                }
                None => {
                    std::io::stdin()
                        .read_to_end(&mut content)
                        .map_err(|e| loam::Error::Io {
                            path: PathBuf::from("<stdin>"),
                            source: e,
                        })?;
                }
            }
            let id = if write {
                repo.odb().write(Kind::Blob, &content)?
            } else {
                loam::hash_record(repo.algo(), Kind::Blob, &content)
            };
            println!("{}", id);
        }

        Commands::CatFile { rev, kind, size } => {
            let resolved = revision::resolve(&repo, &rev)?;
            if kind || size {
                let info = repo.odb().info(&resolved.id)?;
                if kind {
                    println!("{}", info.kind);
                } else {
                    println!("{}", info.size);
                }
            } else {
                let data = repo.odb().read(&resolved.id)?;
                std::io::stdout()
                    .write_all(&data.bytes)
                    .map_err(|e| loam::Error::Io {
                        path: PathBuf::from("<stdout>"),
                        source: e,
                    })?;
            }
        }

        Commands::RevParse { rev, diagnose } => {
            if diagnose {
                println!("{}", revision::diagnose(&repo, &rev));
            } else {
                println!("{}", revision::resolve(&repo, &rev)?.id);
            }
        }

        Commands::LsIndex { verbose } => {
            let index = Index::load(&repo)?;
            for entry in index.entries() {
                if verbose {
                    println!(
                        "{:o} {} {}\t{} (mtime {})",
                        entry.mode.as_u32(),
                        entry.id,
                        entry.stage,
                        entry.path,
                        entry.stat.mtime_sec
                    );
                } else {
                    println!(
                        "{:o} {} {}\t{}",
                        entry.mode.as_u32(),
                        entry.id,
                        entry.stage,
                        entry.path
                    );
                }
            }
        }

        Commands::UpdateIndex { cacheinfo, remove } => {
            let (mut index, lock) = Index::load_locked(&repo)?;
            if let Some(args) = cacheinfo {
                let id = loam::Id::from_hex(&args[0])?;
                index.add(
                    IndexEntry::new(Mode::Regular, id, args[1].as_str(), 0),
                    index::add_opts::OK_TO_ADD | index::add_opts::OK_TO_REPLACE,
                )?;
            }
            if let Some(path) = remove {
                index.remove_path(path.as_bytes().as_bstr());
            }
            index.write(&repo, lock)?;
        }

        Commands::WriteTree { dry_run } => {
            let (mut index, lock) = Index::load_locked(&repo)?;
            let flags = if dry_run {
                index::WRITE_TREE_DRY_RUN
            } else {
                0
            };
            let root = index.write_tree(repo.odb(), flags)?;
            if dry_run {
                lock.rollback()?;
            } else {
                index.write(&repo, lock)?;
            }
            println!("{}", root);
        }

        Commands::ReadTree { rev, update } => {
            let resolved = revision::resolve(&repo, &format!("{}^{{tree}}", rev))?;
            let (index, lock) = Index::load_locked(&repo)?;
            let opts = UnpackOptions {
                update: update.is_some(),
                ..Default::default()
            };
            let (mut new_index, removals) =
                unpack_trees(&repo, &index, &[resolved.id], &opts, &mut oneway_policy)?;
            if let Some(workdir) = update {
                check_updates(&repo, &workdir, &mut new_index, &removals, &opts)?;
            }
            new_index.write(&repo, lock)?;
        }

        Commands::Verify => {
            let odb = repo.odb();
            let mut checked = 0usize;
            odb.for_each(|id| {
                let data = odb.read(&id)?;
                let actual = loam::hash_record(repo.algo(), data.kind, &data.bytes);
                if actual != id {
                    return Err(loam::Error::ObjectCorrupt {
                        id,
                        reason: format!("content hashes to {}", actual),
                    });
                }
                checked += 1;
                Ok(())
            })?;
            odb.with_packs(|packs| {
                for pack in packs {
                    pack.verify()?;
                }
                Ok::<(), loam::Error>(())
            })??;
            let index = Index::load(&repo)?;
            index.verify()?;
            println!("{} objects ok, index ok", checked);
        }
    }
    Ok(())
}
