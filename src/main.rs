#![warn(clippy::all)]

mod cache;
mod common;
mod compile;
mod error;
mod exec;
mod meta;
mod route;
mod serve;
mod table;

mod prelude {
    pub use color_eyre::eyre::{bail, ensure, eyre, Context as EyreContext, ContextCompat};
    pub use color_eyre::{Report, Result, Section};
    pub use indoc::indoc;
    pub use tracing::{debug, error, info, warn};

    pub use crate::common::*;
}

use std::sync::Arc;

use prelude::*;

use crate::cache::CacheStore;
use crate::exec::{PreprocessRegistry, RouteExecutor};
use crate::meta::{AppendStore, MetaStore, OverlayStore, SessionStore, ShareStore};
use crate::route::RouteDefinition;

fn main() -> Result<()> {
    install_logging();

    let ctx = InnerContext::init()?;

    match &ctx.args.command {
        // Init is fully handled during context initialisation.
        Command::Init => Ok(()),
        Command::Compile { .. } => {
            compile::compile_routes(&ctx.routes_dir(), &ctx.build_dir())?;
            Ok(())
        }
        Command::Serve { precompiled } => {
            let routes = match precompiled {
                true => route::load_compiled_routes(&ctx.build_dir())?,
                false => compile::compile_routes(&ctx.routes_dir(), &ctx.build_dir())?,
            };

            serve(&ctx, routes)
        }
        Command::Cache(subcommand) => match subcommand {
            CacheSubcommand::Stat => cache_stat(&ctx),
            CacheSubcommand::Clear => {
                CacheStore::new(ctx.storage_root()).clear()?;
                println!(
                    "Page cache {}",
                    console::style("cleared.").green().bold().bright()
                );
                Ok(())
            }
        },
    }
}

fn serve(ctx: &Context, routes: Vec<RouteDefinition>) -> Result<()> {
    let storage = ctx.storage_root();

    let cache = Arc::new(CacheStore::new(storage));
    let meta = Arc::new(MetaStore::open(storage)?);
    let overlays = Arc::new(OverlayStore::new(meta.clone()));
    let shares = Arc::new(ShareStore::new(meta.clone()));
    let sessions = Arc::new(SessionStore::new(meta.clone()));
    let appends = Arc::new(AppendStore::new(storage));

    // Preprocessor implementations are registered at startup; the route
    // definitions only carry typed keys into this registry.
    let registry = Arc::new(PreprocessRegistry::new());

    let executor = Arc::new(RouteExecutor::new(
        routes,
        cache,
        Some(overlays.clone()),
        registry,
        ctx.cache.rows_per_page,
    ));

    serve::InnerServer::new(ctx, executor, overlays, shares, sessions, appends).serve()
}

fn cache_stat(ctx: &Context) -> Result<()> {
    let stats = CacheStore::new(ctx.storage_root()).stat()?;

    if stats.is_empty() {
        println!("The page cache is empty.");
        return Ok(());
    }

    for stat in stats {
        println!(
            "{}  {} fingerprint(s), {} page(s), {} KiB",
            console::style(&stat.route_id).bold(),
            stat.fingerprints,
            stat.pages,
            stat.bytes / 1024
        );
    }

    Ok(())
}

fn install_logging() {
    use color_eyre::config::HookBuilder;
    use tracing_error::ErrorLayer;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();

    HookBuilder::new()
        .panic_section(indoc! {
            "Well, this is embarassing. It appears mallard has crashed!
            Consider reporting the bug at \"https://github.com/Colonial-Dev/mallard\"."
        })
        .display_env_section(false)
        .display_location_section(false)
        .install()
        .expect("Could not install Eyre hooks!");

    info!("Logging installed.")
}
