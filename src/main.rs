use std::process::exit;

use clap::Parser;
use log::error;

use pkgfetch::{
    cli::{
        args::{CliArgs, Command},
        command_handlers,
    },
    config::PkgfetchConfig,
    Pkgfetch,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("{}", e);
        exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = PkgfetchConfig::load()?;
    let cli_args: CliArgs = CliArgs::parse();

    let mut builder = Pkgfetch::builder()
        .config(config)
        .clone_cache(cli_args.clone_cache);
    if let Some(cache_directory) = &cli_args.cache_directory {
        builder = builder.cache_directory(cache_directory);
    }
    if let Some(registry) = &cli_args.registry {
        builder = builder.registry(registry);
    }
    if let Some(protocol) = cli_args.git_protocol {
        builder = builder.git_protocol(protocol);
    }
    if let Command::Tarball {
        integrity: Some(integrity),
        ..
    } = &cli_args.cmd
    {
        builder = builder.integrity(integrity.parse()?);
    }
    let pkgfetch = builder.try_build()?;

    match cli_args.cmd {
        Command::Resolve { spec } => command_handlers::do_resolve(&pkgfetch, &spec).await,
        Command::Manifest { spec } => command_handlers::do_manifest(&pkgfetch, &spec).await,
        Command::Packument { spec } => command_handlers::do_packument(&pkgfetch, &spec).await,
        Command::Tarball { spec, output, .. } => {
            command_handlers::do_tarball(&pkgfetch, &spec, output.as_deref()).await
        }
        Command::ClearCache => command_handlers::do_clear_cache(&pkgfetch),
    }
}
