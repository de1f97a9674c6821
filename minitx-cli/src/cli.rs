use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat};
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use miette::{IntoDiagnostic, Result, WrapErr};
use minitx_journal::{DiskJournal, JournalImage, collect_dangling};

use crate::output::{OutputStyle, render};

/// Inspects the journal files of a minitx transaction coordinator.
///
/// The files are only read, so a running coordinator is not disturbed.
#[derive(Debug, Parser)]
#[command(name = "minitx", version)]
pub struct Cli {
    /// Table style of the output.
    #[arg(long, value_enum, default_value_t, global = true)]
    style: OutputStyle,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every record of the active journal file.
    Dump(JournalArgs),
    /// Print the transactions that still wait for an outcome.
    Dangling(JournalArgs),
}

#[derive(Debug, Args)]
struct JournalArgs {
    /// First journal file.
    part1: PathBuf,
    /// Second journal file.
    part2: PathBuf,
}

impl JournalArgs {
    fn inspect(&self) -> Result<JournalImage> {
        DiskJournal::inspect(&self.part1, &self.part2)
            .into_diagnostic()
            .wrap_err_with(|| {
                format!(
                    "failed to read journal {} / {}",
                    self.part1.display(),
                    self.part2.display()
                )
            })
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let output = match &self.command {
            Command::Dump(args) => dump(&args.inspect()?, self.style),
            Command::Dangling(args) => dangling(&args.inspect()?, self.style),
        };
        println!("{output}");
        Ok(())
    }
}

fn summary(image: &JournalImage) -> String {
    let mut summary = format!(
        "active file: {} (generation {}, {})",
        image.active_path.display(),
        image.generation,
        image.state
    );
    if image.torn_tail {
        summary.push_str("\nwarning: a torn record at the end of the file was ignored");
    }
    summary
}

fn dump(image: &JournalImage, style: OutputStyle) -> String {
    let rows = image.records.iter().map(|record| {
        vec![
            record.sequence.to_string(),
            format_time(record.time),
            record.status.to_string(),
            record.gtrid.to_string(),
            record.unique_names.iter().join(", "),
        ]
    });
    let table = render(
        &["sequence", "time", "status", "gtrid", "resources"],
        rows,
        style,
    );
    format!("{}\n{table}\n{} records", summary(image), image.records.len())
}

fn dangling(image: &JournalImage, style: OutputStyle) -> String {
    let dangling = collect_dangling(image.records.iter().cloned());
    let rows = dangling.values().map(|tx| {
        vec![
            tx.gtrid.to_string(),
            if tx.commit_decided { "commit" } else { "undecided" }.to_string(),
            tx.last_status()
                .map(|status| status.to_string())
                .unwrap_or_default(),
            tx.pending.iter().join(", "),
            format_time(tx.last_time),
        ]
    });
    let table = render(
        &["gtrid", "decision", "last status", "pending", "last record"],
        rows,
        style,
    );
    format!(
        "{}\n{table}\n{} dangling transactions",
        summary(image),
        dangling.len()
    )
}

fn format_time(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use minitx_common::{RecordStatus, UidGenerator};
    use minitx_journal::{JournalConfig, TransactionJournal};

    use super::*;

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::try_parse_from(["minitx", "dangling", "a.tlog", "b.tlog", "--style", "psql"])
            .unwrap();
        assert!(matches!(cli.style, OutputStyle::Psql));
        match cli.command {
            Command::Dangling(args) => assert_eq!(args.part2, PathBuf::from("b.tlog")),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["minitx", "dump", "a.tlog"]).is_err());
    }

    #[test]
    fn test_dump_and_dangling() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalConfig::in_dir(dir.path());
        let uid = UidGenerator::new("cli").unwrap();
        let (done, open) = (uid.next_gtrid().unwrap(), uid.next_gtrid().unwrap());
        {
            let journal = DiskJournal::open(&config).unwrap();
            journal
                .log(RecordStatus::StatusPrepared, &done, &names(&["A", "B"]))
                .unwrap();
            journal
                .log(RecordStatus::StatusCommitted, &done, &names(&["A", "B"]))
                .unwrap();
            journal
                .log(RecordStatus::StatusPrepared, &open, &names(&["A", "C"]))
                .unwrap();
            journal.close().unwrap();
        }

        let image = DiskJournal::inspect(&config.part1_path, &config.part2_path).unwrap();
        let output = dump(&image, OutputStyle::Sharp);
        assert!(output.contains("STATUS_COMMITTED"));
        assert!(output.contains("3 records"));

        let output = dangling(&image, OutputStyle::Markdown);
        assert!(output.contains(&open.to_string()));
        assert!(!output.contains(&done.to_string()));
        assert!(output.contains("A, C"));
        assert!(output.contains("1 dangling transactions"));
    }
}
