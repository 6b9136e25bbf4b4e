//! Subcommand argument types.

use clap::Subcommand;

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the merged configuration, or one dotted path, as JSON
    Show {
        /// Dotted path such as `matrix.epochs`
        path: Option<String>,
    },

    /// Check that the merged configuration matches the pipeline schema
    Check,
}
