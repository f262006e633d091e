use std::path::PathBuf;

use clap::Parser;

use crate::model::hosted::Protocol;

/// Resolves package specifiers and fetches their manifests and tarballs.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub cmd: Command,
    /// Location of the pkgfetch cache directory
    /// [default: $HOME/.pkgfetch/cache]
    #[clap(short, long, global = true)]
    pub cache_directory: Option<PathBuf>,
    /// Registry used for plain `name@range` specifiers
    /// [default: https://registry.npmjs.org/]
    #[clap(long, global = true, env = "PKGFETCH_REGISTRY_URL")]
    pub registry: Option<String>,
    /// Transport tried first for hosted git repositories
    #[clap(long, global = true)]
    pub git_protocol: Option<Protocol>,
    /// Reuse checkouts of pinned git commits across runs
    #[clap(long, global = true)]
    pub clone_cache: bool,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Prints the exact source a specifier points at
    Resolve { spec: String },
    /// Prints the decorated package.json of a specifier
    Manifest { spec: String },
    /// Prints every version available for a specifier
    Packument { spec: String },
    /// Writes the tarball of a specifier
    Tarball {
        spec: String,
        /// Output file [default: <name>-<version>.tgz in the current directory]
        #[clap(short, long)]
        output: Option<PathBuf>,
        /// Integrity the tarball must have
        #[clap(long)]
        integrity: Option<String>,
    },
    /// Cleans the pkgfetch cache
    ClearCache,
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn global_options_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "pkgfetch",
            "tarball",
            "github:npm/cli#v10.0.0",
            "--output",
            "cli.tgz",
            "--git-protocol",
            "https",
        ])
        .unwrap();
        assert_eq!(args.git_protocol, Some(Protocol::Https));
        match args.cmd {
            Command::Tarball { spec, output, .. } => {
                assert_eq!(spec, "github:npm/cli#v10.0.0");
                assert_eq!(output, Some(PathBuf::from("cli.tgz")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
