use std::env;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use super::{Arguments, Command, Config};
use crate::prelude::*;

/// Type alias for an atomically-refcounted instance of [`InnerContext`].
pub type Context = Arc<InnerContext>;

/// Inner representation of global program context.
#[derive(Debug)]
pub struct InnerContext {
    pub args: Arguments,
    pub config: Config,
}

impl InnerContext {
    pub fn init() -> Result<Context> {
        let args = Arguments::parse();

        if let Command::Init = &args.command {
            let config = Config::default();

            std::fs::create_dir_all(&config.server.routes_dir)?;
            std::fs::create_dir_all(&config.server.build_dir)?;
            std::fs::create_dir_all(config.server.storage_root.join(super::STORAGE_CACHE_DIR))?;
            std::fs::create_dir_all(config.server.storage_root.join(super::STORAGE_RUNTIME_DIR))?;

            std::fs::write(super::CONFIG_FILENAME, toml::to_string(&config)?)?;

            println!(
                "\nNew project {}",
                console::style("created.").green().bold().bright()
            );

            std::process::exit(0);
        }

        let dir = validate_env()?;

        let config = dir.join(super::CONFIG_FILENAME);
        let config = Config::from_path(&config)?;

        let ctx = InnerContext { args, config };

        Ok(Arc::new(ctx))
    }

    pub fn storage_root(&self) -> &Path {
        &self.config.server.storage_root
    }

    pub fn routes_dir(&self) -> PathBuf {
        match &self.args.command {
            Command::Compile { source: Some(source), .. } => source.clone(),
            _ => self.config.server.routes_dir.clone(),
        }
    }

    pub fn build_dir(&self) -> PathBuf {
        match &self.args.command {
            Command::Compile { out: Some(out), .. } => out.clone(),
            _ => self.config.server.build_dir.clone(),
        }
    }

    pub fn pretty_output(&self) -> bool {
        self.args.pretty_output()
    }
}

// Deref abuse to enable easy access to the configuration field.
impl Deref for InnerContext {
    type Target = Config;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

/// Performs environment validation - ensuring the program is running inside
/// a mallard project before it executes any further. Returns the project
/// directory.
fn validate_env() -> Result<PathBuf> {
    let current_dir = env::current_dir()?;

    match try_locate_config(&current_dir) {
        Some(path) => {
            env::set_current_dir(&path)?;
            Ok(path)
        }
        None => bail!("Failed to locate mallard configuration."),
    }
}

fn try_locate_config(start: &Path) -> Option<PathBuf> {
    let mut path: PathBuf = start.into();
    let target = Path::new(super::CONFIG_FILENAME);

    loop {
        path.push(target);

        if path.is_file() {
            path.pop();
            break Some(path);
        }

        if !(path.pop() && path.pop()) {
            break None;
        }
    }
}
