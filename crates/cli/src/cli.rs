//! Command-line arguments for the batch runner.
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "sizeflow",
    version,
    about = "Size-confirmation workflow: enroll orders and process batches",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create or update the database schema
    Migrate,
    /// Register an order for size confirmation
    Enroll(EnrollArgs),
    /// Process every active order once and print per-state counts
    Tick(TickArgs),
    /// Run ticks on a timer until Ctrl-C
    Watch(WatchArgs),
    /// Print a size recommendation for the given measurements
    Recommend(RecommendArgs),
}

#[derive(Parser, Debug)]
pub struct EnrollArgs {
    #[arg(long)]
    pub order_id: String,

    /// Customer phone in any common spelling
    #[arg(long)]
    pub phone: String,

    #[arg(long)]
    pub name: Option<String>,

    /// Storefront the order came from
    #[arg(long)]
    pub store: Option<String>,
}

#[derive(Parser, Debug)]
pub struct TickArgs {
    /// Emit the tick report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct WatchArgs {
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_secs: u64,
}

#[derive(Parser, Debug)]
pub struct RecommendArgs {
    #[arg(long)]
    pub height: u32,

    #[arg(long)]
    pub weight: u32,

    /// men, women or kids (defaults to SIZING_DEFAULT_GENDER)
    #[arg(long)]
    pub gender: Option<String>,

    /// Product type code (defaults to SIZING_DEFAULT_PRODUCT)
    #[arg(long)]
    pub product: Option<String>,

    /// Age in years; used by kids charts
    #[arg(long)]
    pub age: Option<u32>,
}
