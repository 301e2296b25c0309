//! Command-line surface.
//!
//! The bare binary runs the sync loop; subcommands are small operator
//! tools over the same state database.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::state::StateStore;

/// despacho - one-way Mail.app to Notion replication
#[derive(Parser)]
#[command(name = "despacho")]
#[command(about = "Watches a local mail store and projects new messages into Notion")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    #[arg(long, global = true, default_value = "despacho.toml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a single poll cycle and exit
    Once,
    /// Print synchronization statistics
    Stats,
    /// Inspect or requeue dead-letter records
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand)]
pub enum DeadLetterAction {
    /// List dead-letter records with their last error
    List,
    /// Reset one dead-letter record for another attempt
    Requeue {
        /// The record's internal id
        internal_id: i64,
    },
}

/// Handler for the operator subcommands.
pub struct CliHandler {
    store: StateStore,
}

impl CliHandler {
    pub async fn new(config: &Config) -> Result<Self> {
        let store = StateStore::new(&config.state_db_path).await?;
        Ok(Self { store })
    }

    pub async fn handle_stats(&self) -> Result<()> {
        let counts = self.store.counts_by_status().await?;
        let checkpoint = self.store.get_last_max_row_id().await?;

        println!("Sync state");
        println!("  last_max_row_id: {}", checkpoint);
        if counts.is_empty() {
            println!("  no records yet");
            return Ok(());
        }
        let total: i64 = counts.iter().map(|(_, n)| n).sum();
        for (status, count) in &counts {
            println!("  {:>12}: {}", status, count);
        }
        println!("  {:>12}: {}", "total", total);
        Ok(())
    }

    pub async fn handle_dead_letter(&self, action: DeadLetterAction) -> Result<()> {
        match action {
            DeadLetterAction::List => {
                let records = self.store.dead_letters(100).await?;
                if records.is_empty() {
                    println!("No dead-letter records.");
                    return Ok(());
                }
                for record in records {
                    println!(
                        "{:>8}  {:<24}  {:<40}  {}",
                        record.internal_id,
                        record.date_received.format("%Y-%m-%d %H:%M"),
                        truncate(&record.subject, 40),
                        record.last_error.as_deref().unwrap_or("")
                    );
                }
            }
            DeadLetterAction::Requeue { internal_id } => {
                if self.store.requeue_dead_letter(internal_id).await? {
                    println!("Record {} requeued.", internal_id);
                } else {
                    println!("Record {} is not in the dead-letter set.", internal_id);
                }
            }
        }
        Ok(())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
