use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SearchArgs {
    /// Search products by text
    Text {
        /// Search query
        query: String,

        /// Max number of products
        #[clap(short, long)]
        limit: Option<usize>,
    },
    /// Search products by a photo
    Image {
        /// Path to a JPEG, PNG or WebP file
        path: PathBuf,

        /// Max number of products
        #[clap(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP search server
    Serve {
        /// Address to listen on, overrides config
        #[clap(long)]
        listen: Option<String>,
    },

    /// Compute missing product embeddings
    Backfill {
        /// Products per batch, overrides config
        #[clap(short, long)]
        batch_size: Option<usize>,

        /// Keep running batches until nothing is left
        #[clap(long, default_value = "false")]
        drain: bool,
    },

    /// Run a search against the local catalog
    #[command(subcommand)]
    Search(SearchArgs),

    /// Search a running server as you type: every stdin line is the new
    /// contents of the search box, `@<path>` searches by image
    Interactive {
        /// Server address
        #[clap(long, default_value = "http://127.0.0.1:8080")]
        addr: String,
    },

    /// Replace the catalog with a products CSV
    Import {
        /// CSV with id,name,handle,price,currency,image_urls[,description]
        products: PathBuf,

        /// CSV with kind,name,handle
        #[clap(long)]
        taxonomy: Option<PathBuf>,
    },
}
