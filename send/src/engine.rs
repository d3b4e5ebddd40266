use std::path::{Path, PathBuf};

use dicom_dictionary_std::uids;
use tracing::{error, info, warn};

use dcmkit_common::CancelFlag;

use crate::store::{self, DicomFileInfo};
use crate::transcode::prepare_for_retry;
use crate::{Result, SendClassification, SendTarget, is_format_error_message};

/// Progress snapshot emitted before each unit of work.
#[derive(Debug, Clone)]
pub struct SendProgress {
    pub current: usize,
    pub total: usize,
    pub success: usize,
    pub warnings: usize,
    pub failed: usize,
    pub message: String,
}

/// Final counts of one send operation. A cancelled run carries the
/// partial counts accumulated so far.
#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub success: usize,
    pub warnings: usize,
    pub failed: usize,
    pub error_details: Vec<String>,
    pub converted_count: usize,
    pub cancelled: bool,
}

/// Drives the two-phase send against one target.
///
/// Phase one offers every file in its native transfer syntax and
/// classifies each C-STORE result. Files the peer rejects for format
/// reasons are transcoded into temporary sidecars and retried over a
/// fresh association; sidecars are removed when the operation ends,
/// whichever way it ends.
pub struct SendEngine {
    target: SendTarget,
}

impl SendEngine {
    pub fn new(target: SendTarget) -> Self {
        SendEngine { target }
    }

    pub fn send_files<F>(
        &self,
        paths: &[PathBuf],
        cancel: &CancelFlag,
        mut progress: F,
    ) -> Result<SendOutcome>
    where
        F: FnMut(&SendProgress),
    {
        let mut outcome = SendOutcome::default();
        if paths.is_empty() {
            return Ok(outcome);
        }

        let mut files = Vec::new();
        for path in paths {
            match store::probe_file(path) {
                Ok(info) => files.push(info),
                Err(e) => {
                    outcome.failed += 1;
                    outcome
                        .error_details
                        .push(format!("{}: {e}", display_name(path)));
                }
            }
        }
        if files.is_empty() {
            return Ok(outcome);
        }

        let incompatible = self.phase_one(&files, cancel, &mut outcome, &mut progress)?;

        if !incompatible.is_empty() && !outcome.cancelled {
            self.phase_two(&incompatible, cancel, &mut outcome, &mut progress);
        }
        info!(
            "Send finished: {} ok, {} warnings, {} failed, {} converted",
            outcome.success, outcome.warnings, outcome.failed, outcome.converted_count
        );
        Ok(outcome)
    }

    /// Compatibility-testing pass over the native files. Returns the
    /// files classified as format-incompatible.
    fn phase_one<F>(
        &self,
        files: &[DicomFileInfo],
        cancel: &CancelFlag,
        outcome: &mut SendOutcome,
        progress: &mut F,
    ) -> Result<Vec<DicomFileInfo>>
    where
        F: FnMut(&SendProgress),
    {
        let contexts = store::presentation_contexts(files);
        let mut association = store::establish(&self.target, &contexts)?;
        self.verify(&mut association);

        let mut incompatible = Vec::new();
        let total = files.len();
        let mut message_id: u16 = 1;
        for (index, file) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let name = display_name(&file.path);
            progress(&SendProgress {
                current: index + 1,
                total,
                success: outcome.success,
                warnings: outcome.warnings,
                failed: outcome.failed,
                message: format!("Testing {name}"),
            });

            match store::send_file(
                &mut association.scu,
                file,
                association.verification_id,
                message_id,
            ) {
                Ok(SendClassification::Success) => outcome.success += 1,
                Ok(SendClassification::Warning(code)) => {
                    outcome.warnings += 1;
                    outcome
                        .error_details
                        .push(format!("{name}: warning {code:04X}H"));
                }
                Ok(SendClassification::FormatIncompatible) => {
                    incompatible.push(file.clone());
                }
                Ok(SendClassification::Failed(code)) => {
                    outcome.failed += 1;
                    outcome
                        .error_details
                        .push(format!("{name}: failed {code:04X}H"));
                }
                Err(e) => {
                    let message = e.to_string();
                    if is_format_error_message(&message) {
                        info!("Format incompatibility detected for {name}: {message}");
                        incompatible.push(file.clone());
                    } else {
                        outcome.failed += 1;
                        outcome.error_details.push(format!("{name}: {message}"));
                    }
                    // the association may be gone; re-establish once
                    match store::establish(&self.target, &contexts) {
                        Ok(fresh) => association = fresh,
                        Err(e) => {
                            error!("Could not re-establish association: {e}");
                            for rest in &files[index + 1..] {
                                outcome.failed += 1;
                                outcome.error_details.push(format!(
                                    "{}: association lost",
                                    display_name(&rest.path)
                                ));
                            }
                            break;
                        }
                    }
                }
            }
            message_id = message_id.wrapping_add(1);
        }
        let _ = association.scu.release();
        Ok(incompatible)
    }

    /// Transcode-and-retry pass over the rejected files. Association
    /// failures here are per-batch failures, not fatal errors.
    fn phase_two<F>(
        &self,
        incompatible: &[DicomFileInfo],
        cancel: &CancelFlag,
        outcome: &mut SendOutcome,
        progress: &mut F,
    ) where
        F: FnMut(&SendProgress),
    {
        info!("Converting {} incompatible file(s)", incompatible.len());
        let sidecar_dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                outcome.failed += incompatible.len();
                outcome
                    .error_details
                    .push(format!("Could not create sidecar directory: {e}"));
                return;
            }
        };

        let total = incompatible.len();
        let mut retries = Vec::new();
        for (index, file) in incompatible.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                return;
            }
            let name = display_name(&file.path);
            progress(&SendProgress {
                current: index + 1,
                total,
                success: outcome.success,
                warnings: outcome.warnings,
                failed: outcome.failed,
                message: format!("Converting {name}"),
            });
            let prepared = prepare_for_retry(&file.path, sidecar_dir.path());
            if prepared.converted {
                outcome.converted_count += 1;
            }
            match store::probe_file(&prepared.path) {
                Ok(info) => retries.push(info),
                Err(e) => {
                    outcome.failed += 1;
                    outcome.error_details.push(format!("{name}: {e}"));
                }
            }
        }
        if retries.is_empty() || cancel.is_cancelled() {
            return;
        }

        let mut contexts = store::presentation_contexts(&retries);
        for transfer_syntaxes in contexts.values_mut() {
            transfer_syntaxes.insert(uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string());
        }
        let mut association = match store::establish(&self.target, &contexts) {
            Ok(association) => association,
            Err(e) => {
                outcome.failed += retries.len();
                outcome
                    .error_details
                    .push(format!("Retry association failed: {e}"));
                return;
            }
        };

        let total = retries.len();
        let mut message_id: u16 = 1;
        for (index, file) in retries.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let name = display_name(&file.path);
            progress(&SendProgress {
                current: index + 1,
                total,
                success: outcome.success,
                warnings: outcome.warnings,
                failed: outcome.failed,
                message: name.clone(),
            });
            match store::send_file(
                &mut association.scu,
                file,
                association.verification_id,
                message_id,
            ) {
                Ok(SendClassification::Success) => outcome.success += 1,
                Ok(SendClassification::Warning(code)) => {
                    outcome.warnings += 1;
                    outcome
                        .error_details
                        .push(format!("{name}: warning {code:04X}H"));
                }
                Ok(SendClassification::FormatIncompatible) => {
                    outcome.failed += 1;
                    outcome
                        .error_details
                        .push(format!("{name}: format not accepted after conversion"));
                }
                Ok(SendClassification::Failed(code)) => {
                    outcome.failed += 1;
                    outcome
                        .error_details
                        .push(format!("{name}: failed {code:04X}H"));
                }
                Err(e) => {
                    outcome.failed += 1;
                    outcome.error_details.push(format!("{name}: {e}"));
                    warn!("Retry send of {name} failed: {e}");
                }
            }
            message_id = message_id.wrapping_add(1);
        }
        let _ = association.scu.release();
    }

    fn verify(&self, association: &mut store::EstablishedAssociation) {
        let Some(verification_id) = association.verification_id else {
            warn!("No presentation context available for C-ECHO");
            return;
        };
        match store::echo(&mut association.scu, verification_id, 1) {
            Ok(0x0000) => info!("C-ECHO verification successful"),
            Ok(status) => warn!("C-ECHO returned status {status:04X}H"),
            Err(e) => warn!("C-ECHO verification failed: {e}"),
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_completes_with_zero_counts() {
        let engine = SendEngine::new(SendTarget::new("STORE-SCP@127.0.0.1:104", "DCMKIT"));
        let outcome = engine
            .send_files(&[], &CancelFlag::new(), |_| {})
            .unwrap();
        assert_eq!(outcome.success, 0);
        assert_eq!(outcome.failed, 0);
        assert!(!outcome.cancelled);
    }

    #[test]
    fn unreadable_files_fail_without_touching_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.bin");
        std::fs::write(&bogus, b"not dicom").unwrap();

        let engine = SendEngine::new(SendTarget::new("STORE-SCP@127.0.0.1:104", "DCMKIT"));
        let outcome = engine
            .send_files(&[bogus], &CancelFlag::new(), |_| {})
            .unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.error_details.len(), 1);
    }
}
