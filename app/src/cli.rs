use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// DICOM dataset management from the command line.
///
/// Loads a DICOM file, directory or zip archive and runs one of the
/// core operations: tree display, validation, anonymization, media
/// export or network send.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dcmkit",
    version,
    about,
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// DICOM file, directory or zip archive to load and display.
    pub path: Option<PathBuf>,

    /// Override the configuration file path.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable logging at DEBUG level.
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,

    /// Enable logging at TRACE level.
    #[arg(long, global = true, default_value_t = false)]
    pub trace: bool,

    /// Anything else is warned about and ignored.
    #[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub extra: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load the input and print the patient/study/series/instance tree.
    Scan {
        /// DICOM file, directory or zip archive.
        path: PathBuf,
    },
    /// Validate the loaded files against the DICOM standard.
    Validate {
        /// DICOM file, directory or zip archive.
        path: PathBuf,
    },
    /// Anonymize the loaded files in place with a template.
    Anonymize {
        /// DICOM file, directory or zip archive.
        path: PathBuf,
        /// Name of the anonymization template to apply.
        #[arg(short, long, default_value = "Research Standard")]
        template: String,
    },
    /// Export the loaded files to a directory or archive.
    Export {
        /// DICOM file, directory or zip archive.
        path: PathBuf,
        /// Output directory (flat mode) or zip file path.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value = "dicomdir-zip")]
        mode: ExportMode,
    },
    /// Send the loaded files to a remote application entity.
    Send {
        /// DICOM file, directory or zip archive.
        path: PathBuf,
        /// Configured destination label.
        #[arg(short, long, conflicts_with_all = ["host", "port"])]
        dest: Option<String>,
        /// Remote host.
        #[arg(long, requires = "port")]
        host: Option<String>,
        /// Remote port.
        #[arg(long)]
        port: Option<u16>,
        /// Called AE title.
        #[arg(long, default_value = "ANY-SCP")]
        called_ae_title: String,
    },
    /// Merge nodes of one level into a primary node, rewriting the
    /// secondaries' files in place.
    Merge {
        /// DICOM file, directory or zip archive.
        path: PathBuf,
        #[arg(short, long, value_enum)]
        level: MergeLevel,
        /// Key of the node whose metadata is kept: PatientID for
        /// patients, StudyInstanceUID for studies, SeriesInstanceUID
        /// for series.
        #[arg(long)]
        primary: String,
        /// Keys of the nodes to merge into the primary.
        #[arg(long = "secondary", required = true)]
        secondaries: Vec<String>,
    },
    /// Delete every instance file under the selected nodes. Final.
    Delete {
        /// DICOM file, directory or zip archive.
        path: PathBuf,
        #[arg(short, long, value_enum)]
        level: SelectLevel,
        /// Keys of the nodes to delete.
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
    },
    /// List the available anonymization templates.
    Templates,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeLevel {
    Patient,
    Study,
    Series,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectLevel {
    Patient,
    Study,
    Series,
    Instance,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Copy files into a flat directory.
    Flat,
    /// Pack files into a plain zip archive.
    Zip,
    /// Standard DICOM/PATnnnnn tree with a DICOMDIR, zipped.
    DicomdirZip,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_path_parses_without_subcommand() {
        let cli = Cli::parse_from(["dcmkit", "/tmp/study"]);
        assert_eq!(cli.path, Some(PathBuf::from("/tmp/study")));
        assert!(cli.command.is_none());
    }

    #[test]
    fn unrecognized_trailing_arguments_are_collected() {
        let cli = Cli::parse_from(["dcmkit", "/tmp/study", "--frobnicate", "now"]);
        assert_eq!(cli.extra, vec!["--frobnicate".to_string(), "now".to_string()]);
    }

    #[test]
    fn send_accepts_destination_or_host_port() {
        let cli = Cli::parse_from(["dcmkit", "send", "/tmp/study", "--dest", "pacs1"]);
        match cli.command {
            Some(Command::Send { dest: Some(dest), .. }) => assert_eq!(dest, "pacs1"),
            other => panic!("unexpected parse: {other:?}"),
        }
        let cli = Cli::parse_from([
            "dcmkit", "send", "/tmp/study", "--host", "10.0.0.5", "--port", "104",
        ]);
        match cli.command {
            Some(Command::Send { host: Some(host), port: Some(port), .. }) => {
                assert_eq!(host, "10.0.0.5");
                assert_eq!(port, 104);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
