use clap::{Parser, Subcommand};

use crate::settings::SETTINGS_FILE;

#[derive(Parser)]
#[command(name = "slack-export")]
#[command(about = "Export Slack channel history to Markdown and HTML")]
#[command(version)]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, global = true, default_value = SETTINGS_FILE)]
    pub settings: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export every enabled channel, or only the given ids
    Export {
        /// Channel id to export (repeatable), defaults to all enabled channels
        #[arg(short, long = "channel")]
        channels: Vec<String>,
    },

    /// Export a single channel by id or name
    ExportChannel {
        /// Channel id (C…, G…, D…) or configured channel name
        #[arg(value_name = "CHANNEL")]
        channel: String,
    },

    /// List configured channels and whether their ids are valid
    Channels,

    /// Show the durable batch export state
    State,

    /// Clear the durable batch export state
    ResetState,

    /// Convert an exported Markdown file to HTML
    MdToHtml {
        /// Input Markdown file path
        #[arg(value_name = "INPUT")]
        input: String,

        /// Output HTML file path, defaults to the input with an .html extension
        #[arg(short, long)]
        output: Option<String>,
    },
}
