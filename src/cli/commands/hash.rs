//! Hash command - print the build cache digest

use crate::build::{hash_dockerfile, BuildArgs};
use crate::cli::args::HashArgs;
use crate::error::DockrunResult;

/// Execute the hash command
pub async fn execute(args: HashArgs) -> DockrunResult<()> {
    let build_args: BuildArgs = args.build_args.into_iter().collect();
    let digest = hash_dockerfile(&args.dockerfile, &build_args).await?;
    println!("{}", digest);
    Ok(())
}
