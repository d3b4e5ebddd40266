use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dicom_core::{DataElement, Tag, VR, dicom_value};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{InMemDicomObject, OpenFileOptions, StandardDataDictionary};
use dicom_transfer_syntax_registry::{TransferSyntaxRegistry, entries};
use dicom_ul::pdu::{PDataValue, PDataValueType, PresentationContextResult};
use dicom_ul::{ClientAssociation, Pdu, association::client::ClientAssociationOptions};
use tracing::{debug, info, warn};

use crate::{Error, Result, SendClassification, SendTarget, classify_status};

/// Message-level timeout applied to the association socket.
pub(crate) const DIMSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Identity and encoding of one file to send, read from its meta group.
#[derive(Debug, Clone)]
pub struct DicomFileInfo {
    pub path: PathBuf,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
}

/// Reads the file meta group of a DICOM file without touching the
/// dataset body.
pub fn probe_file<P: AsRef<Path>>(path: P) -> Result<DicomFileInfo> {
    let path = path.as_ref();
    let obj = OpenFileOptions::new()
        .read_until(Tag(0x0001, 0x0000))
        .open_file(path)
        .map_err(|e| Error::Probe {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    let meta = obj.meta();
    let ts_uid = meta.transfer_syntax.trim_end_matches('\0').to_string();
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| Error::UnsupportedTransferSyntax(ts_uid.clone()))?;
    Ok(DicomFileInfo {
        path: path.to_path_buf(),
        sop_class_uid: meta
            .media_storage_sop_class_uid
            .trim_end_matches('\0')
            .to_string(),
        sop_instance_uid: meta
            .media_storage_sop_instance_uid
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string(),
        transfer_syntax: ts.uid().to_string(),
    })
}

/// One requested presentation context per unique SOP class, offering
/// the transfer syntaxes the batch actually uses.
pub(crate) fn presentation_contexts(
    files: &[DicomFileInfo],
) -> BTreeMap<String, BTreeSet<String>> {
    let mut contexts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for file in files {
        contexts
            .entry(file.sop_class_uid.clone())
            .or_default()
            .insert(file.transfer_syntax.clone());
    }
    contexts
}

pub(crate) struct EstablishedAssociation {
    pub scu: ClientAssociation<TcpStream>,
    /// Presentation context id of the Verification context, which is
    /// requested first and therefore carries the lowest id.
    pub verification_id: Option<u8>,
}

/// Opens an association offering Verification plus one context per SOP
/// class. Failure to establish is fatal for the whole send.
pub(crate) fn establish(
    target: &SendTarget,
    contexts: &BTreeMap<String, BTreeSet<String>>,
) -> Result<EstablishedAssociation> {
    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(target.calling_ae_title.clone())
        .max_pdu_length(target.max_pdu_length)
        .read_timeout(DIMSE_TIMEOUT);
    // verification first so it owns the lowest context id
    options = options.with_presentation_context(
        uids::VERIFICATION.to_string(),
        vec![
            uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        ],
    );
    for (abstract_syntax, transfer_syntaxes) in contexts {
        options = options.with_presentation_context(
            abstract_syntax.clone(),
            transfer_syntaxes.iter().cloned().collect(),
        );
    }
    if let Some(called) = &target.called_ae_title {
        options = options.called_ae_title(called.clone());
    }
    info!("Establishing association with {}", target.addr);
    let scu = options
        .establish_with(&target.addr)
        .map_err(|e| Error::Association {
            addr: target.addr.clone(),
            source: Box::new(e),
        })?;
    let verification_id = scu.presentation_contexts().iter().map(|pc| pc.id).min();
    debug!(
        "Association established, {} presentation context(s) accepted",
        scu.presentation_contexts().len()
    );
    Ok(EstablishedAssociation {
        scu,
        verification_id,
    })
}

fn command_transfer_syntax() -> dicom_encoding::TransferSyntax {
    entries::IMPLICIT_VR_LITTLE_ENDIAN.erased()
}

fn echo_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0030])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
    ])
}

pub(crate) fn store_req_command(
    storage_sop_class_uid: &str,
    storage_sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_instance_uid),
        ),
    ])
}

/// Performs C-ECHO verification. A failed echo is reported as a warning
/// by the caller, not as a fatal error.
pub(crate) fn echo(
    scu: &mut ClientAssociation<TcpStream>,
    verification_id: u8,
    message_id: u16,
) -> Result<u16> {
    let command = echo_command(message_id);
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &command_transfer_syntax())
        .map_err(Box::from)
        .map_err(Error::CreateCommand)?;
    scu.send(&Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: verification_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    })
    .map_err(Box::from)
    .map_err(Error::Protocol)?;

    let response = scu.receive().map_err(Box::from).map_err(Error::Protocol)?;
    read_status(response)
}

/// Sends one file with C-STORE and classifies the outcome. A file whose
/// transfer syntax has no usable accepted context is classified as
/// format-incompatible without going on the wire.
pub(crate) fn send_file(
    scu: &mut ClientAssociation<TcpStream>,
    file: &DicomFileInfo,
    exclude_pc: Option<u8>,
    message_id: u16,
) -> Result<SendClassification> {
    let pcs: Vec<PresentationContextResult> = scu
        .presentation_contexts()
        .iter()
        .filter(|pc| Some(pc.id) != exclude_pc)
        .map(|pc| PresentationContextResult {
            id: pc.id,
            reason: pc.reason.clone(),
            transfer_syntax: pc.transfer_syntax.clone(),
        })
        .collect();
    let Some((pc, ts_uid)) = select_context(&pcs, &file.transfer_syntax) else {
        debug!(
            "No accepted presentation context fits {} ({})",
            file.path.display(),
            file.transfer_syntax
        );
        return Ok(SendClassification::FormatIncompatible);
    };
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| Error::UnsupportedTransferSyntax(ts_uid.clone()))?;

    let command = store_req_command(&file.sop_class_uid, &file.sop_instance_uid, message_id);
    let mut cmd_data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut cmd_data, &command_transfer_syntax())
        .map_err(Box::from)
        .map_err(Error::CreateCommand)?;

    let obj = dcmkit_common::read_full(&file.path)?;
    let mut object_data = Vec::with_capacity(2048);
    obj.write_dataset_with_ts(&mut object_data, ts)
        .map_err(Box::from)
        .map_err(Error::WriteDataset)?;

    let nbytes = cmd_data.len() + object_data.len();
    debug!(
        "Sending {} (~{} kB) on pc {} with ts {}",
        file.path.display(),
        nbytes / 1_000,
        pc.id,
        ts_uid
    );
    if nbytes < scu.acceptor_max_pdu_length().saturating_sub(100) as usize {
        scu.send(&Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: pc.id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: cmd_data,
                },
                PDataValue {
                    presentation_context_id: pc.id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: object_data,
                },
            ],
        })
        .map_err(Box::from)
        .map_err(Error::Protocol)?;
    } else {
        scu.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            }],
        })
        .map_err(Box::from)
        .map_err(Error::Protocol)?;
        let mut pdata = scu.send_pdata(pc.id);
        pdata.write_all(&object_data)?;
    }

    let response = scu.receive().map_err(Box::from).map_err(Error::Protocol)?;
    let status = read_status(response)?;
    if status != 0x0000 {
        warn!(
            "C-STORE of {} returned status {:04X}H",
            file.sop_instance_uid, status
        );
    }
    Ok(classify_status(status))
}

fn read_status(response: Pdu) -> Result<u16> {
    match response {
        Pdu::PData { data } => {
            let data_value = data.first().ok_or(Error::UnexpectedPdu)?;
            let command = InMemDicomObject::read_dataset_with_ts(
                &data_value.data[..],
                &command_transfer_syntax(),
            )
            .map_err(Box::from)
            .map_err(Error::ReadDataset)?;
            command
                .element(tags::STATUS)
                .map_err(|_| Error::MissingAttribute(tags::STATUS))?
                .to_int::<u16>()
                .map_err(|_| Error::MissingAttribute(tags::STATUS))
        }
        _ => Err(Error::UnexpectedPdu),
    }
}

fn select_context(
    pcs: &[PresentationContextResult],
    file_ts_uid: &str,
) -> Option<(PresentationContextResult, String)> {
    let file_ts = TransferSyntaxRegistry.get(file_ts_uid)?;
    if let Some(pc) = pcs.iter().find(|pc| pc.transfer_syntax == file_ts.uid()) {
        return Some((pc.clone(), pc.transfer_syntax.clone()));
    }
    // otherwise both ends must carry codec-free encodings
    let pc = pcs.iter().find(|pc| {
        TransferSyntaxRegistry
            .get(&pc.transfer_syntax)
            .filter(|ts| file_ts.is_codec_free() && ts.is_codec_free())
            .is_some()
    })?;
    Some((pc.clone(), pc.transfer_syntax.clone()))
}
