mod backend;
mod cache;
mod errors;
mod nodes;
mod stash_fs;
mod store;

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use fuser::MountOption;
use log::error;

use backend::{BackendAdapter, LocalBackend};
use cache::MetaCache;
use stash_fs::StashFs;

fn main() {
    let matches = Command::new("stashfs")
        .version("0.1.0")
        .about("Caching overlay mount for a possibly-offline source tree")
        .arg(
            Arg::new("SOURCE")
                .required(true)
                .index(1)
                .help("Directory tree to project through the cache"),
        )
        .arg(
            Arg::new("MOUNT_POINT")
                .required(true)
                .index(2)
                .help("Where to mount the overlay"),
        )
        .arg(
            Arg::new("cache-dir")
                .long("cache-dir")
                .default_value(".stashfs-cache")
                .help("Directory holding the persistent metadata cache"),
        )
        .arg(
            Arg::new("auto_unmount")
                .long("auto_unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount on process exit"),
        )
        .arg(
            Arg::new("allow-root")
                .long("allow-root")
                .action(ArgAction::SetTrue)
                .help("Allow root user to access filesystem"),
        )
        .get_matches();

    env_logger::init();

    let source = PathBuf::from(matches.get_one::<String>("SOURCE").unwrap());
    let mountpoint = matches.get_one::<String>("MOUNT_POINT").unwrap();
    let cache_dir = PathBuf::from(matches.get_one::<String>("cache-dir").unwrap());

    let mut options = vec![MountOption::RO, MountOption::FSName("stashfs".to_string())];
    if matches.get_flag("auto_unmount") {
        options.push(MountOption::AutoUnmount);
    }
    if matches.get_flag("allow-root") {
        options.push(MountOption::AllowRoot);
    }

    let cache = match MetaCache::open(&cache_dir) {
        Ok(cache) => cache,
        Err(e) => {
            error!("cannot open metadata cache at {}: {}", cache_dir.display(), e);
            std::process::exit(1);
        }
    };

    let backend = BackendAdapter::new(Box::new(LocalBackend::new(source)));
    let file_system = StashFs::new(cache, backend);
    fuser::mount2(file_system, mountpoint, &options).unwrap();
}
