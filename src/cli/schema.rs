use std::path::PathBuf;

use clap::Args;
use sidechannel::schema::write_schema;

use super::CliContext;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Output directory, `<root>/schemas` by default
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    let out_dir = args
        .out_dir
        .unwrap_or_else(|| context.settings.root.join("schemas"));
    let written = write_schema(&out_dir)?;
    println!("Schemas written to {} ({} files)", out_dir.display(), written.len());
    Ok(())
}
